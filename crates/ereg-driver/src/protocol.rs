//! Typed command layer for the regulator.
//!
//! [`EReg`] turns the line protocol into typed getters and setters. Inputs
//! are range-checked before anything is written to the socket, known error
//! codes become [`ERegError::NegativeAcknowledgement`], and response prefixes
//! (`rpr:`, `rdr:` ...) are stripped before parsing.
//!
//! # Command Table
//!
//! | Command | Purpose | Response prefix |
//! |---|---|---|
//! | `mnc` | model number | `mnr:` |
//! | `stc` | metadata (serial, sw-version, board-rev) | `str:` |
//! | `rdc` | device defaults (6 CSV fields) | `rdr:` |
//! | `rsrc` / `ssrc:<1-200>` | sample rate | `rsrr:` |
//! | `rhbc` / `shbc:<0 or 50-65000>` | heartbeat | `rhbr:` |
//! | `rfpc` / `sfpc:<0..cal>` | fault pressure | `rfpr:` |
//! | `rrtc` / `srtc:<0-65000>` | relay timeout | `rrtr:` |
//! | `rpc` / `spc:<0..cal>` | output pressure | `rpr:` |
//! | `ssc` / `ssc:<1-10000>` | start sampling | |
//! | `sszc:<1-10000>` | sample buffer size | |
//! | `sbc` | sample buffer | `sbr:` |
//! | `voc` / `vfc` | valves on / off | |

use crate::error::{ERegError, ERegResult};
use crate::transport::Transport;
use std::fmt;
use std::ops::RangeInclusive;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

const SAMPLE_RATE_RANGE: RangeInclusive<u32> = 1..=200;
const HEARTBEAT_RANGE: RangeInclusive<u32> = 50..=65000;
const RELAY_TIMEOUT_RANGE: RangeInclusive<u32> = 0..=65000;
const SAMPLE_COUNT_RANGE: RangeInclusive<u32> = 1..=10000;

/// Serial number, firmware version and board revision reported by `stc`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    /// Device serial number
    pub serial_number: String,
    /// Firmware version string
    pub software_version: String,
    /// PC board revision
    pub board_revision: String,
}

/// Stored defaults reported by `rdc`, in wire order.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceDefaults {
    /// Samples taken since power-up
    pub samples_taken: u32,
    /// Default time between samples (ms)
    pub sample_rate: u32,
    /// Heartbeat timeout (ms), 0 = disabled
    pub heartbeat: u32,
    /// Pressure applied on fault or power loss (psi)
    pub fault_pressure: f64,
    /// Relay fault time (ms)
    pub relay_timeout: u32,
    /// Full-scale calibration pressure (psi)
    pub calibration_pressure: f64,
}

impl FromStr for DeviceDefaults {
    type Err = ERegError;

    fn from_str(payload: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = payload.split(',').map(str::trim).collect();
        if fields.len() != 6 {
            return Err(ERegError::Unexpected(format!(
                "Expected 6 default fields, got {}: {:?}",
                fields.len(),
                payload
            )));
        }
        Ok(Self {
            samples_taken: parse_field(fields[0], "samples taken")?,
            sample_rate: parse_field(fields[1], "sample rate")?,
            heartbeat: parse_field(fields[2], "heartbeat")?,
            fault_pressure: parse_field(fields[3], "fault pressure")?,
            relay_timeout: parse_field(fields[4], "relay timeout")?,
            calibration_pressure: parse_field(fields[5], "calibration pressure")?,
        })
    }
}

/// Contents of one `sbc` read.
#[derive(Debug, Clone, PartialEq)]
pub enum SampleBuffer {
    /// The buffer was full and every token parsed as a number.
    Samples(Vec<f64>),
    /// The device is still filling the buffer (e.g. `sbe`).
    NotReady(String),
}

impl SampleBuffer {
    /// Decode the payload of an `sbc` response (prefix already removed).
    pub fn parse(payload: &str) -> ERegResult<Self> {
        let payload = payload.trim();
        if payload.is_empty() || payload.chars().any(char::is_alphabetic) {
            return Ok(SampleBuffer::NotReady(payload.to_string()));
        }
        payload
            .split_whitespace()
            .map(|token| {
                token.parse::<f64>().map_err(|_| {
                    ERegError::Unexpected(format!("Could not parse sample value {:?}", token))
                })
            })
            .collect::<ERegResult<Vec<f64>>>()
            .map(SampleBuffer::Samples)
    }
}

/// Calibration pressure cached once per connection.
///
/// Stored as raw `f64` bits so any worker can read it without locking.
/// NaN marks "not fetched yet".
struct CalibrationCache(AtomicU64);

impl CalibrationCache {
    fn empty() -> Self {
        Self(AtomicU64::new(f64::NAN.to_bits()))
    }

    fn get(&self) -> Option<f64> {
        let value = f64::from_bits(self.0.load(Ordering::Acquire));
        (!value.is_nan()).then_some(value)
    }

    fn set(&self, value: f64) {
        self.0.store(value.to_bits(), Ordering::Release);
    }

    fn clear(&self) {
        self.0.store(f64::NAN.to_bits(), Ordering::Release);
    }
}

/// Protocol client for one regulator.
pub struct EReg {
    transport: Transport,
    calibration: CalibrationCache,
}

impl Default for EReg {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EReg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EReg")
            .field("calibration", &self.calibration.get())
            .finish_non_exhaustive()
    }
}

impl EReg {
    /// Create a client with a disconnected transport.
    pub fn new() -> Self {
        Self {
            transport: Transport::new(),
            calibration: CalibrationCache::empty(),
        }
    }

    // --- Connection ---

    /// Connect to the regulator. Clears any cached calibration.
    pub async fn open_connection(
        &self,
        host: &str,
        port: u16,
        timeout: Duration,
    ) -> ERegResult<()> {
        self.calibration.clear();
        self.transport.connect(host, port, timeout).await
    }

    /// Close the socket if open. Returns whether one was closed.
    pub async fn close_connection(&self) -> bool {
        self.calibration.clear();
        self.transport.disconnect().await
    }

    /// Whether the transport holds a socket.
    pub async fn is_connected(&self) -> bool {
        self.transport.is_connected().await
    }

    /// Address of the connected regulator, if any.
    pub async fn peer(&self) -> Option<String> {
        self.transport.peer().await
    }

    /// Send a raw command and map device error codes.
    pub async fn send_query(&self, query: &str) -> ERegResult<String> {
        let response = self.transport.send_and_receive(query).await?;
        if let Some(nak) = ERegError::nak(&response) {
            tracing::warn!("{}", nak);
            return Err(nak);
        }
        Ok(response)
    }

    async fn query_payload(&self, command: &str, prefix: &str) -> ERegResult<String> {
        let response = self.send_query(command).await?;
        Ok(strip_prefix(&response, prefix).to_string())
    }

    async fn query_parsed<T: FromStr>(
        &self,
        command: &str,
        prefix: &str,
        what: &str,
    ) -> ERegResult<T> {
        let payload = self.query_payload(command, prefix).await?;
        parse_field(&payload, what)
    }

    // --- Metadata ---

    /// Model number (`mnc`).
    pub async fn model_number(&self) -> ERegResult<String> {
        self.query_payload("mnc", "mnr:").await
    }

    /// Serial number, software version and board revision (`stc`).
    pub async fn metadata(&self) -> ERegResult<Metadata> {
        let payload = self.query_payload("stc", "str:").await?;
        let fields: Vec<&str> = payload.split(',').map(str::trim).collect();
        match fields.as_slice() {
            [serial, version, .., board] if fields.len() >= 3 => Ok(Metadata {
                serial_number: serial.to_string(),
                software_version: version.to_string(),
                board_revision: board.to_string(),
            }),
            _ => Err(ERegError::Unexpected(format!(
                "Malformed metadata response: {:?}",
                payload
            ))),
        }
    }

    /// Serial number from the metadata record.
    pub async fn serial_number(&self) -> ERegResult<String> {
        Ok(self.metadata().await?.serial_number)
    }

    // --- Defaults ---

    /// All stored defaults (`rdc`).
    pub async fn defaults(&self) -> ERegResult<DeviceDefaults> {
        self.query_payload("rdc", "rdr:").await?.parse()
    }

    /// Calibration pressure as reported by the device (always queries).
    pub async fn calibration_pressure(&self) -> ERegResult<f64> {
        Ok(self.defaults().await?.calibration_pressure)
    }

    /// Fetch the calibration pressure and cache it for this connection.
    pub async fn refresh_calibration(&self) -> ERegResult<f64> {
        let value = self.calibration_pressure().await?;
        self.calibration.set(value);
        tracing::info!("Calibration pressure: {} psi", value);
        Ok(value)
    }

    /// The cached calibration pressure, without touching the socket.
    pub fn cached_calibration(&self) -> Option<f64> {
        self.calibration.get()
    }

    async fn calibration_bound(&self) -> ERegResult<f64> {
        match self.calibration.get() {
            Some(value) => Ok(value),
            None => self.refresh_calibration().await,
        }
    }

    /// Default time between samples in milliseconds (`rsrc`).
    pub async fn sample_rate(&self) -> ERegResult<u32> {
        self.query_parsed("rsrc", "rsrr:", "sample rate").await
    }

    /// Set the time between samples, 1-200 ms (`ssrc`).
    pub async fn set_sample_rate(&self, value: u32) -> ERegResult<()> {
        if !SAMPLE_RATE_RANGE.contains(&value) {
            return Err(ERegError::Validation(format!(
                "Invalid sample rate: {}. Must be between 1 and 200.",
                value
            )));
        }
        self.send_query(&format!("ssrc:{}", value)).await.map(drop)
    }

    /// Heartbeat timeout in milliseconds (`rhbc`).
    pub async fn heartbeat(&self) -> ERegResult<u32> {
        self.query_parsed("rhbc", "rhbr:", "heartbeat").await
    }

    /// Set the heartbeat timeout: `0` disables, otherwise 50-65000 ms (`shbc`).
    pub async fn set_heartbeat(&self, value: u32) -> ERegResult<()> {
        if value != 0 && !HEARTBEAT_RANGE.contains(&value) {
            return Err(ERegError::Validation(format!(
                "Invalid heartbeat value: {}. Must be `0` to disable or set between `50-65000`.",
                value
            )));
        }
        self.send_query(&format!("shbc:{}", value)).await.map(drop)
    }

    /// Fault pressure in psi (`rfpc`).
    pub async fn fault_pressure(&self) -> ERegResult<f64> {
        self.query_parsed("rfpc", "rfpr:", "fault pressure").await
    }

    /// Set the pressure applied on fault or power loss (`sfpc`).
    pub async fn set_fault_pressure(&self, value: u32) -> ERegResult<()> {
        let calibration = self.calibration_bound().await?;
        if f64::from(value) > calibration {
            return Err(ERegError::Validation(format!(
                "Invalid fault pressure value: {}. Must be between 0 and {}.",
                value, calibration
            )));
        }
        self.send_query(&format!("sfpc:{}", value)).await.map(drop)
    }

    /// Relay fault time in milliseconds (`rrtc`).
    pub async fn relay_timeout(&self) -> ERegResult<u32> {
        self.query_parsed("rrtc", "rrtr:", "relay timeout").await
    }

    /// Set the relay fault time, 0-65000 ms (`srtc`).
    pub async fn set_relay_timeout(&self, value: u32) -> ERegResult<()> {
        if !RELAY_TIMEOUT_RANGE.contains(&value) {
            return Err(ERegError::Validation(format!(
                "Invalid relay timeout value: {}. Must be between 0 and 65000",
                value
            )));
        }
        self.send_query(&format!("srtc:{}", value)).await.map(drop)
    }

    // --- Output pressure ---

    /// Current output pressure setting in psi (`rpc`).
    pub async fn pressure(&self) -> ERegResult<f64> {
        self.query_parsed("rpc", "rpr:", "pressure").await
    }

    /// Set the output pressure in psi, within `[0, calibration]` (`spc`).
    pub async fn set_pressure(&self, value: f64) -> ERegResult<()> {
        if !value.is_finite() || value < 0.0 {
            return Err(ERegError::Validation(format!(
                "Invalid pressure setting value: {}. Must be a number of at least 0.",
                value
            )));
        }
        let calibration = self.calibration_bound().await?;
        if value > calibration {
            return Err(ERegError::Validation(format!(
                "Invalid pressure setting value: {}. Must be between 0 and {}.",
                value, calibration
            )));
        }
        self.send_query(&format!("spc:{}", value)).await.map(drop)
    }

    // --- Sampling ---

    /// Begin sampling. `None` fills the buffer up to the size set with
    /// [`EReg::set_sample_size`]; `Some(n)` takes `n` samples (1-10000).
    pub async fn start_sampling(&self, count: Option<u32>) -> ERegResult<()> {
        let command = match count {
            None => "ssc".to_string(),
            Some(n) if SAMPLE_COUNT_RANGE.contains(&n) => format!("ssc:{}", n),
            Some(_) => {
                return Err(ERegError::Validation(
                    "Invalid sampling number. Must be between 1 and 10000.".to_string(),
                ))
            }
        };
        self.send_query(&command).await.map(drop)
    }

    /// Set the number of samples held in the buffer, 1-10000 (`sszc`).
    pub async fn set_sample_size(&self, count: u32) -> ERegResult<()> {
        if !SAMPLE_COUNT_RANGE.contains(&count) {
            return Err(ERegError::Validation(
                "Invalid sampling number. Must be between 1 and 10000.".to_string(),
            ));
        }
        self.send_query(&format!("sszc:{}", count)).await.map(drop)
    }

    /// Read the sample buffer (`sbc`).
    pub async fn send_buffer(&self) -> ERegResult<SampleBuffer> {
        let payload = self.query_payload("sbc", "sbr:").await?;
        SampleBuffer::parse(&payload)
    }

    // --- Valves ---

    /// Enable both pressure control solenoids.
    pub async fn valves_on(&self) -> ERegResult<()> {
        self.send_query("voc").await.map(drop)
    }

    /// Disable both pressure control solenoids.
    pub async fn valves_off(&self) -> ERegResult<()> {
        self.send_query("vfc").await.map(drop)
    }
}

fn strip_prefix<'a>(response: &'a str, prefix: &str) -> &'a str {
    response.strip_prefix(prefix).unwrap_or(response).trim()
}

fn parse_field<T: FromStr>(raw: &str, what: &str) -> ERegResult<T> {
    raw.trim()
        .parse()
        .map_err(|_| ERegError::Unexpected(format!("Could not parse {} from {:?}", what, raw)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_positional_parse() {
        let defaults: DeviceDefaults = "1200,10,0,0,5000,45".parse().unwrap();
        assert_eq!(defaults.samples_taken, 1200);
        assert_eq!(defaults.sample_rate, 10);
        assert_eq!(defaults.heartbeat, 0);
        assert_eq!(defaults.relay_timeout, 5000);
        assert_eq!(defaults.calibration_pressure, 45.0);
    }

    #[test]
    fn test_defaults_wrong_field_count() {
        let err = "1,2,3".parse::<DeviceDefaults>().unwrap_err();
        assert!(matches!(err, ERegError::Unexpected(_)));
    }

    #[test]
    fn test_sample_buffer_numbers() {
        assert_eq!(
            SampleBuffer::parse(" 10.00 12.00  11.00 ").unwrap(),
            SampleBuffer::Samples(vec![10.0, 12.0, 11.0])
        );
    }

    #[test]
    fn test_sample_buffer_not_ready_tokens() {
        assert_eq!(
            SampleBuffer::parse("sbe").unwrap(),
            SampleBuffer::NotReady("sbe".into())
        );
        assert!(matches!(
            SampleBuffer::parse("1.0 scr 2.0").unwrap(),
            SampleBuffer::NotReady(_)
        ));
        assert!(matches!(SampleBuffer::parse("").unwrap(), SampleBuffer::NotReady(_)));
    }

    #[test]
    fn test_sample_buffer_garbage_is_unexpected() {
        let err = SampleBuffer::parse("1.0 2..0").unwrap_err();
        assert!(matches!(err, ERegError::Unexpected(_)));
    }

    #[test]
    fn test_strip_prefix() {
        assert_eq!(strip_prefix("rpr: 14.5", "rpr:"), "14.5");
        assert_eq!(strip_prefix("14.5", "rpr:"), "14.5");
    }

    #[test]
    fn test_calibration_cache() {
        let cache = CalibrationCache::empty();
        assert_eq!(cache.get(), None);
        cache.set(45.0);
        assert_eq!(cache.get(), Some(45.0));
        cache.clear();
        assert_eq!(cache.get(), None);
    }

    #[tokio::test]
    async fn test_validation_before_network() {
        // Nothing is connected, so any wire access would be a Connection error.
        let ereg = EReg::new();
        let cases = [
            ereg.set_sample_rate(0).await,
            ereg.set_sample_rate(201).await,
            ereg.set_heartbeat(49).await,
            ereg.set_heartbeat(65001).await,
            ereg.set_relay_timeout(65001).await,
            ereg.start_sampling(Some(0)).await,
            ereg.start_sampling(Some(10001)).await,
            ereg.set_sample_size(0).await,
            ereg.set_pressure(-0.1).await,
            ereg.set_pressure(f64::NAN).await,
        ];
        for result in cases {
            assert!(matches!(result, Err(ERegError::Validation(_))), "{:?}", result);
        }
    }

    #[tokio::test]
    async fn test_heartbeat_accepts_zero_and_range() {
        // Valid values get past validation and fail only on the missing socket.
        let ereg = EReg::new();
        for value in [0, 50, 65000] {
            let err = ereg.set_heartbeat(value).await.unwrap_err();
            assert!(err.is_connection(), "{} -> {:?}", value, err);
        }
    }
}
