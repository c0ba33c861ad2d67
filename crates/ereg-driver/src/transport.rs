//! TCP transport for the regulator's line protocol.
//!
//! The transport owns the socket and is the only place it is touched. Every
//! command/response pair runs under one exclusive lock held for the whole
//! exchange, so two callers can never interleave bytes on the wire. Any
//! socket fault drops the handle; later calls fail with a connection error
//! until [`Transport::connect`] is called again.

use crate::error::{ERegError, ERegResult};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;

/// Default command port of the regulator.
pub const DEFAULT_PORT: u16 = 10001;

/// Default connect and per-exchange timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Largest response accepted for a single exchange.
pub const MAX_RESPONSE_LEN: usize = 1024;

const TERM_CHAR: char = '\n';

fn is_terminator(byte: u8) -> bool {
    byte == b'\n' || byte == b'\r'
}

struct Connection {
    stream: BufReader<TcpStream>,
    peer: String,
    timeout: Duration,
}

/// Exclusive owner of the socket handle.
pub struct Transport {
    connection: Mutex<Option<Connection>>,
}

impl Default for Transport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport {
    /// Create a transport with no open connection.
    pub fn new() -> Self {
        Self {
            connection: Mutex::new(None),
        }
    }

    /// Open a connection to `host:port`, replacing any existing one.
    ///
    /// The connect attempt and every later exchange are bounded by `timeout`.
    pub async fn connect(
        &self,
        host: &str,
        port: u16,
        timeout_after: Duration,
    ) -> ERegResult<()> {
        let mut guard = self.connection.lock().await;
        if guard.take().is_some() {
            tracing::debug!("Dropping previous socket before reconnect");
        }

        let stream = timeout(timeout_after, TcpStream::connect((host, port)))
            .await
            .map_err(|_| ERegError::Connection(format!("Connection timeout to {}:{}", host, port)))?
            .map_err(|e| {
                ERegError::Connection(format!("Could not connect to {}:{}: {}", host, port, e))
            })?;

        stream
            .set_nodelay(true)
            .map_err(|e| ERegError::Connection(e.to_string()))?;

        let peer = format!("{}:{}", host, port);
        tracing::info!("Socket open at {}", peer);

        *guard = Some(Connection {
            stream: BufReader::new(stream),
            peer,
            timeout: timeout_after,
        });
        Ok(())
    }

    /// Close the socket if one is open. Returns whether a socket was closed.
    pub async fn disconnect(&self) -> bool {
        match self.connection.lock().await.take() {
            Some(conn) => {
                tracing::info!("Socket closed ({})", conn.peer);
                true
            }
            None => false,
        }
    }

    /// Whether a socket is currently held.
    pub async fn is_connected(&self) -> bool {
        self.connection.lock().await.is_some()
    }

    /// Address of the connected peer, if any.
    pub async fn peer(&self) -> Option<String> {
        self.connection
            .lock()
            .await
            .as_ref()
            .map(|conn| conn.peer.clone())
    }

    /// Send one command and read its response line.
    ///
    /// The terminator is appended when missing. A response ends at the
    /// first `\r` or `\n`; the returned string has surrounding whitespace
    /// removed.
    pub async fn send_and_receive(&self, command: &str) -> ERegResult<String> {
        let mut guard = self.connection.lock().await;
        let conn = guard
            .as_mut()
            .ok_or_else(|| ERegError::Connection("Socket is not connected".to_string()))?;

        let mut query = command.to_string();
        if !query.ends_with(TERM_CHAR) {
            query.push(TERM_CHAR);
        }

        match exchange(conn, &query).await {
            Ok(response) => Ok(response),
            Err(e) => {
                tracing::error!("Socket fault on {}: {}", conn.peer, e);
                *guard = None;
                Err(e)
            }
        }
    }
}

async fn exchange(conn: &mut Connection, query: &str) -> ERegResult<String> {
    tracing::debug!("Command: {:?}", query.trim_end());

    timeout(conn.timeout, conn.stream.get_mut().write_all(query.as_bytes()))
        .await
        .map_err(|_| ERegError::Connection(format!("Timeout writing {:?}", query.trim_end())))?
        .map_err(|e| ERegError::Connection(e.to_string()))?;

    let raw = timeout(conn.timeout, read_response(&mut conn.stream))
        .await
        .map_err(|_| {
            ERegError::Connection(format!(
                "Timeout waiting for response to: {}",
                query.trim_end()
            ))
        })??;
    let response = String::from_utf8_lossy(&raw);

    let trimmed = response.trim().to_string();
    tracing::debug!("Raw response: {:?}", trimmed);
    Ok(trimmed)
}

/// Read up to the first `\r` or `\n`, skipping terminators left over
/// from a previous response. A `\n` already buffered right after a `\r`
/// is consumed with it.
async fn read_response(stream: &mut BufReader<TcpStream>) -> ERegResult<Vec<u8>> {
    let mut line = Vec::new();
    loop {
        let available = stream
            .fill_buf()
            .await
            .map_err(|e| ERegError::Connection(e.to_string()))?;
        if available.is_empty() {
            return Err(ERegError::Connection("Connection closed by device".to_string()));
        }

        let skip = if line.is_empty() {
            available.iter().take_while(|b| is_terminator(**b)).count()
        } else {
            0
        };
        let rest = &available[skip..];
        match rest.iter().position(|b| is_terminator(*b)) {
            Some(end) => {
                line.extend_from_slice(&rest[..end]);
                let crlf = rest[end] == b'\r' && rest.get(end + 1) == Some(&b'\n');
                let used = skip + end + if crlf { 2 } else { 1 };
                stream.consume(used);
                break;
            }
            None => {
                line.extend_from_slice(rest);
                let used = available.len();
                stream.consume(used);
            }
        }

        if line.len() > MAX_RESPONSE_LEN {
            return Err(ERegError::Connection(format!(
                "Response exceeded {} bytes without a terminator",
                MAX_RESPONSE_LEN
            )));
        }
    }

    if line.len() > MAX_RESPONSE_LEN {
        return Err(ERegError::Connection(format!(
            "Response exceeded {} bytes",
            MAX_RESPONSE_LEN
        )));
    }
    Ok(line)
}
