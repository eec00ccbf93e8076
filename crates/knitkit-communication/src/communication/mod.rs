//! Transport layer
//!
//! A [`Transport`] carries newline-terminated ASCII lines to and from the
//! knitting machine's microcontroller. Transports never retry or chunk;
//! that is the dispatcher's job.
//!
//! Adapters:
//! - [`serial::SerialTransport`] for USB/RS-232 boards
//! - [`tcp::TcpTransport`] for the WiFi bridge
//! - [`simulated::SimulatedTransport`], an in-process firmware stand-in

pub mod chunker;
pub mod dispatcher;
pub mod protocol;
pub mod response;
pub mod serial;
pub mod simulated;
pub mod tcp;

use knitkit_core::ConnectionError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Result type for transport operations
pub type TransportResult<T> = std::result::Result<T, ConnectionError>;

/// Default serial baud rate of the firmware
pub const DEFAULT_BAUD_RATE: u32 = 9600;

/// Default TCP port of the WiFi bridge
pub const DEFAULT_TCP_PORT: u16 = 8888;

/// Transport medium
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// USB or RS-232 serial port
    #[default]
    Serial,
    /// TCP socket to the WiFi bridge
    Tcp,
    /// In-process firmware simulator
    Simulated,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Serial => write!(f, "serial"),
            TransportKind::Tcp => write!(f, "tcp"),
            TransportKind::Simulated => write!(f, "simulated"),
        }
    }
}

/// Connection parameters for any transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportParams {
    /// Transport medium
    pub kind: TransportKind,
    /// Serial port name or TCP host
    pub target: String,
    /// Serial baud rate
    pub baud_rate: u32,
    /// TCP port
    pub tcp_port: u16,
    /// How long to wait for the connection to open
    pub connect_timeout: Duration,
    /// Settle time after opening, for boards that reset on connect
    pub reset_delay: Duration,
}

impl Default for TransportParams {
    fn default() -> Self {
        Self {
            kind: TransportKind::Serial,
            target: String::new(),
            baud_rate: DEFAULT_BAUD_RATE,
            tcp_port: DEFAULT_TCP_PORT,
            connect_timeout: Duration::from_secs(5),
            reset_delay: Duration::from_secs(2),
        }
    }
}

impl TransportParams {
    /// Serial connection on `port` with default settings
    pub fn serial(port: impl Into<String>) -> Self {
        Self {
            kind: TransportKind::Serial,
            target: port.into(),
            ..Default::default()
        }
    }

    /// TCP connection to `host:port`
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self {
            kind: TransportKind::Tcp,
            target: host.into(),
            tcp_port: port,
            reset_delay: Duration::ZERO,
            ..Default::default()
        }
    }

    /// In-process simulator
    pub fn simulated() -> Self {
        Self {
            kind: TransportKind::Simulated,
            target: "simulator".to_string(),
            reset_delay: Duration::ZERO,
            ..Default::default()
        }
    }

    /// Human readable connection target
    pub fn display_target(&self) -> String {
        match self.kind {
            TransportKind::Tcp => format!("{}:{}", self.target, self.tcp_port),
            _ => self.target.clone(),
        }
    }

    /// Check the parameters before opening anything
    pub fn validate(&self) -> TransportResult<()> {
        if self.target.trim().is_empty() && self.kind != TransportKind::Simulated {
            return Err(ConnectionError::InvalidParameters {
                reason: "no port or host given".to_string(),
            });
        }
        if self.kind == TransportKind::Serial && self.baud_rate == 0 {
            return Err(ConnectionError::InvalidParameters {
                reason: "baud rate must be positive".to_string(),
            });
        }
        if self.kind == TransportKind::Tcp && self.tcp_port == 0 {
            return Err(ConnectionError::InvalidParameters {
                reason: "TCP port must be positive".to_string(),
            });
        }
        Ok(())
    }
}

/// Line-oriented link to the machine
pub trait Transport: Send {
    /// Open the link
    fn connect(&mut self, params: &TransportParams) -> TransportResult<()>;

    /// Close the link. Safe to call when already closed.
    fn disconnect(&mut self);

    /// Check whether the link is open
    fn is_connected(&self) -> bool;

    /// Write `line` followed by a newline
    fn write_line(&mut self, line: &str) -> TransportResult<()>;

    /// Wait up to `timeout` for one complete line, without its terminator.
    ///
    /// `Ok(None)` means no line arrived in time. After `disconnect` this
    /// returns `Err(ConnectionError::NotConnected)` immediately.
    fn read_line(&mut self, timeout: Duration) -> TransportResult<Option<String>>;

    /// Throw away input that has arrived but not been read.
    ///
    /// Returns the complete lines that were discarded so the caller can
    /// still log or route them.
    fn clear_input(&mut self) -> TransportResult<Vec<String>> {
        let mut discarded = Vec::new();
        while let Some(line) = self.read_line(Duration::ZERO)? {
            discarded.push(line);
        }
        Ok(discarded)
    }
}

/// Create an unconnected transport for `kind`
pub fn create_transport(kind: TransportKind) -> Box<dyn Transport> {
    match kind {
        TransportKind::Serial => Box::new(serial::SerialTransport::new()),
        TransportKind::Tcp => Box::new(tcp::TcpTransport::new()),
        TransportKind::Simulated => Box::new(simulated::SimulatedTransport::new()),
    }
}

/// Unterminated input kept before the receive buffer is dropped
pub(crate) const MAX_PENDING_INPUT: usize = 4096;

/// Append received bytes, dropping the buffer if it grows past
/// [`MAX_PENDING_INPUT`] without a line terminator.
pub(crate) fn append_received(buffer: &mut Vec<u8>, bytes: &[u8], source: &str) {
    buffer.extend_from_slice(bytes);
    if buffer.len() > MAX_PENDING_INPUT && !buffer.contains(&b'\n') {
        tracing::warn!(
            "Dropping {} bytes of unterminated input from {}",
            buffer.len(),
            source
        );
        buffer.clear();
    }
}

/// Split complete lines out of a receive buffer.
///
/// Carriage returns are dropped and blank lines skipped.
pub(crate) fn take_line(buffer: &mut Vec<u8>) -> Option<String> {
    loop {
        let pos = buffer.iter().position(|&b| b == b'\n')?;
        let raw: Vec<u8> = buffer.drain(..=pos).collect();
        let line = String::from_utf8_lossy(&raw)
            .trim_end_matches(['\r', '\n'])
            .to_string();
        if !line.trim().is_empty() {
            return Some(line);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_take_line() {
        let mut buf = b"DONE\r\n\r\nNeedle count: 3\npart".to_vec();
        assert_eq!(take_line(&mut buf).as_deref(), Some("DONE"));
        assert_eq!(take_line(&mut buf).as_deref(), Some("Needle count: 3"));
        assert_eq!(take_line(&mut buf), None);
        assert_eq!(buf, b"part");
    }

    struct Scripted(std::collections::VecDeque<String>);

    impl Transport for Scripted {
        fn connect(&mut self, _params: &TransportParams) -> TransportResult<()> {
            Ok(())
        }
        fn disconnect(&mut self) {}
        fn is_connected(&self) -> bool {
            true
        }
        fn write_line(&mut self, _line: &str) -> TransportResult<()> {
            Ok(())
        }
        fn read_line(&mut self, _timeout: Duration) -> TransportResult<Option<String>> {
            Ok(self.0.pop_front())
        }
    }

    #[test]
    fn test_default_clear_input_reads_until_quiet() {
        let mut transport = Scripted(["DONE", "Needle count: 4"].map(String::from).into());
        assert_eq!(
            transport.clear_input().unwrap(),
            ["DONE", "Needle count: 4"]
        );
        assert_eq!(transport.read_line(Duration::ZERO).unwrap(), None);
    }

    #[test]
    fn test_unterminated_noise_is_dropped() {
        let mut buf = Vec::new();
        append_received(&mut buf, &[b'#'; MAX_PENDING_INPUT], "test");
        assert_eq!(buf.len(), MAX_PENDING_INPUT);
        append_received(&mut buf, b"##", "test");
        assert!(buf.is_empty());

        append_received(&mut buf, b"DONE\n", "test");
        assert_eq!(take_line(&mut buf).as_deref(), Some("DONE"));
    }

    #[test]
    fn test_params_validation() {
        assert!(TransportParams::serial("").validate().is_err());
        assert!(TransportParams::serial("/dev/ttyUSB0").validate().is_ok());
        assert!(TransportParams::tcp("knitter.local", 0).validate().is_err());
        assert!(TransportParams::simulated().validate().is_ok());
        assert_eq!(
            TransportParams::tcp("10.0.0.5", 8888).display_target(),
            "10.0.0.5:8888"
        );
    }
}
