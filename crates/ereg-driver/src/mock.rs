//! In-process mock regulator for testing without hardware.
//!
//! [`MockEReg`] listens on a loopback port and answers the same line
//! protocol as the real device, so the full stack (transport, client,
//! workers) can be exercised over a real socket. It keeps enough state to
//! answer reads consistently with earlier writes and exposes hooks for
//! failure injection and command-log inspection.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Not-ready token returned while the sample buffer is filling.
pub const NOT_READY_TOKEN: &str = "sbe";

#[derive(Debug)]
struct MockState {
    calibration: f64,
    samples_taken: u32,
    sample_rate: u32,
    heartbeat: u32,
    fault_pressure: f64,
    relay_timeout: u32,
    pressure: f64,
    valves_on: bool,
    buffer_size: u32,
    pending_count: u32,
    sampling: bool,
    not_ready_polls: u32,
    polls_remaining: u32,
    fixed_buffer: Option<Vec<f64>>,
    queued: VecDeque<String>,
    log: Vec<String>,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            calibration: 45.0,
            samples_taken: 0,
            sample_rate: 10,
            heartbeat: 0,
            fault_pressure: 0.0,
            relay_timeout: 5000,
            pressure: 0.0,
            valves_on: false,
            buffer_size: 21,
            pending_count: 21,
            sampling: false,
            not_ready_polls: 0,
            polls_remaining: 0,
            fixed_buffer: None,
            queued: VecDeque::new(),
            log: Vec::new(),
        }
    }
}

impl MockState {
    fn respond(&mut self, line: &str) -> String {
        self.log.push(line.to_string());
        if let Some(canned) = self.queued.pop_front() {
            return canned;
        }

        let (word, arg) = match line.split_once(':') {
            Some((word, arg)) => (word, Some(arg.trim())),
            None => (line, None),
        };
        let ack = |payload: &dyn std::fmt::Display| format!("{}:{}", reply_word(word), payload);

        match (word, arg) {
            ("mnc", None) => ack(&"MOCK-EREG"),
            ("stc", None) => ack(&"SN-0001, 1.0.4, REV-C"),
            ("rdc", None) => ack(&format!(
                "{},{},{},{},{},{}",
                self.samples_taken,
                self.sample_rate,
                self.heartbeat,
                self.fault_pressure,
                self.relay_timeout,
                self.calibration
            )),
            ("rsrc", None) => ack(&self.sample_rate),
            ("rhbc", None) => ack(&self.heartbeat),
            ("rfpc", None) => ack(&self.fault_pressure),
            ("rrtc", None) => ack(&self.relay_timeout),
            ("rpc", None) => ack(&self.pressure),
            ("ssrc", Some(arg)) => match arg.parse() {
                Ok(value) => {
                    self.sample_rate = value;
                    ack(&value)
                }
                Err(_) => "bdr".to_string(),
            },
            ("shbc", Some(arg)) => match arg.parse() {
                Ok(value) => {
                    self.heartbeat = value;
                    ack(&value)
                }
                Err(_) => "bdr".to_string(),
            },
            ("srtc", Some(arg)) => match arg.parse() {
                Ok(value) => {
                    self.relay_timeout = value;
                    ack(&value)
                }
                Err(_) => "bdr".to_string(),
            },
            ("sfpc", Some(arg)) => match arg.parse::<f64>() {
                Ok(value) if value <= self.calibration => {
                    self.fault_pressure = value;
                    ack(&value)
                }
                _ => "bdr".to_string(),
            },
            ("spc", Some(arg)) => match arg.parse::<f64>() {
                Ok(value) if (0.0..=self.calibration).contains(&value) => {
                    self.pressure = value;
                    ack(&value)
                }
                _ => "bdr".to_string(),
            },
            ("ssc", count) => {
                let count = match count.map(str::parse::<u32>) {
                    None => self.buffer_size,
                    Some(Ok(n)) => n,
                    Some(Err(_)) => return "bdr".to_string(),
                };
                self.pending_count = count;
                self.sampling = true;
                self.polls_remaining = self.not_ready_polls;
                ack(&count)
            }
            ("sszc", Some(arg)) => match arg.parse() {
                Ok(value) => {
                    self.buffer_size = value;
                    ack(&value)
                }
                Err(_) => "bdr".to_string(),
            },
            ("sbc", None) => {
                if !self.sampling || self.polls_remaining > 0 {
                    self.polls_remaining = self.polls_remaining.saturating_sub(1);
                    return NOT_READY_TOKEN.to_string();
                }
                self.sampling = false;
                self.samples_taken = self.samples_taken.saturating_add(self.pending_count);
                let values = self
                    .fixed_buffer
                    .clone()
                    .unwrap_or_else(|| vec![self.pressure; self.pending_count as usize]);
                let body: Vec<String> = values.iter().map(|v| format!("{:.2}", v)).collect();
                format!("sbr: {}", body.join(" "))
            }
            ("voc", None) => {
                self.valves_on = true;
                "vor".to_string()
            }
            ("vfc", None) => {
                self.valves_on = false;
                "vfr".to_string()
            }
            _ => "bcr".to_string(),
        }
    }
}

/// `spc` -> `spr`: the device answers with the command word's trailing
/// `c` replaced by `r`.
fn reply_word(word: &str) -> String {
    match word.strip_suffix('c') {
        Some(stem) => format!("{}r", stem),
        None => word.to_string(),
    }
}

/// Loopback mock of the regulator.
pub struct MockEReg {
    addr: SocketAddr,
    state: Arc<Mutex<MockState>>,
    epoch: watch::Sender<u64>,
    accept_task: JoinHandle<()>,
}

impl MockEReg {
    /// Bind `127.0.0.1:0` and start serving.
    pub async fn spawn() -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let state = Arc::new(Mutex::new(MockState::default()));
        let (epoch, _) = watch::channel(0u64);

        let accept_state = Arc::clone(&state);
        let accept_epoch = epoch.subscribe();
        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((socket, peer)) => {
                        tracing::debug!("Mock e-Reg accepted {}", peer);
                        let state = Arc::clone(&accept_state);
                        let epoch = accept_epoch.clone();
                        tokio::spawn(serve_connection(socket, state, epoch));
                    }
                    Err(e) => {
                        tracing::warn!("Mock e-Reg accept failed: {}", e);
                        break;
                    }
                }
            }
        });

        tracing::info!("Mock e-Reg listening on {}", addr);
        Ok(Self {
            addr,
            state,
            epoch,
            accept_task,
        })
    }

    /// Listening address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Listening host, as a string for `connect` calls.
    pub fn host(&self) -> String {
        self.addr.ip().to_string()
    }

    /// Listening port.
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Every command line received so far, in order.
    pub fn commands(&self) -> Vec<String> {
        self.state.lock().log.clone()
    }

    /// Number of received commands whose line starts with `prefix`.
    pub fn count_commands(&self, prefix: &str) -> usize {
        self.state
            .lock()
            .log
            .iter()
            .filter(|line| line.starts_with(prefix))
            .count()
    }

    /// Forget the command log.
    pub fn clear_commands(&self) {
        self.state.lock().log.clear();
    }

    /// Answer the next command with `response` verbatim.
    pub fn queue_response(&self, response: &str) {
        self.state.lock().queued.push_back(response.to_string());
    }

    /// Answer the next command with a device error code (`bcr`, `bdr`...).
    pub fn fail_next(&self, code: &str) {
        self.queue_response(code);
    }

    /// Close every open client connection. New connections are accepted.
    pub fn drop_connections(&self) {
        self.epoch.send_modify(|epoch| *epoch += 1);
    }

    /// Full-scale calibration pressure reported in the defaults record.
    pub fn set_calibration(&self, psi: f64) {
        self.state.lock().calibration = psi;
    }

    /// Serve exactly these values for every completed buffer.
    pub fn set_buffer(&self, values: Vec<f64>) {
        self.state.lock().fixed_buffer = Some(values);
    }

    /// Answer `sbe` this many times after each start-sampling command.
    pub fn set_not_ready_polls(&self, polls: u32) {
        self.state.lock().not_ready_polls = polls;
    }

    /// Current output pressure setting in psi.
    pub fn pressure(&self) -> f64 {
        self.state.lock().pressure
    }

    /// Whether the valves are enabled.
    pub fn valves_on(&self) -> bool {
        self.state.lock().valves_on
    }

    /// Every `spc` value written so far, in order.
    pub fn setpoint_history(&self) -> Vec<f64> {
        self.state
            .lock()
            .log
            .iter()
            .filter_map(|line| line.strip_prefix("spc:"))
            .filter_map(|value| value.parse().ok())
            .collect()
    }
}

impl Drop for MockEReg {
    fn drop(&mut self) {
        self.accept_task.abort();
        self.drop_connections();
    }
}

async fn serve_connection(
    socket: TcpStream,
    state: Arc<Mutex<MockState>>,
    mut epoch: watch::Receiver<u64>,
) {
    let (read, mut write) = socket.into_split();
    let mut lines = BufReader::new(read).lines();
    // Only epochs bumped after this connection was accepted apply to it.
    epoch.borrow_and_update();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) | Err(_) => break,
                };
                let command = line.trim();
                if command.is_empty() {
                    continue;
                }
                let response = state.lock().respond(command);
                if write.write_all(format!("{}\r\n", response).as_bytes()).await.is_err() {
                    break;
                }
            }
            changed = epoch.changed() => {
                if changed.is_ok() {
                    tracing::debug!("Mock e-Reg dropping connection");
                }
                break;
            }
        }
    }
}
