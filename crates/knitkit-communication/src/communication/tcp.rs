//! TCP transport for the WiFi bridge
//!
//! The ESP8266 bridge exposes the same line protocol as the serial firmware
//! on a plain TCP socket.

use super::{append_received, take_line, Transport, TransportParams, TransportResult};
use knitkit_core::ConnectionError;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

const READ_SLICE: Duration = Duration::from_millis(10);

/// Line transport over a TCP socket
#[derive(Default)]
pub struct TcpTransport {
    stream: Option<TcpStream>,
    peer: String,
    buffer: Vec<u8>,
}

impl TcpTransport {
    /// Create an unconnected TCP transport
    pub fn new() -> Self {
        Self::default()
    }

    fn lost(&mut self, reason: String) -> ConnectionError {
        tracing::error!("TCP connection to {} failed: {}", self.peer, reason);
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        self.buffer.clear();
        ConnectionError::ConnectionLost { reason }
    }
}

impl Transport for TcpTransport {
    fn connect(&mut self, params: &TransportParams) -> TransportResult<()> {
        params.validate()?;
        self.disconnect();

        let peer = params.display_target();
        let tcp_error = |reason: String| ConnectionError::TcpError { reason };

        let addr = (params.target.as_str(), params.tcp_port)
            .to_socket_addrs()
            .map_err(|e| tcp_error(format!("cannot resolve {}: {}", peer, e)))?
            .next()
            .ok_or_else(|| tcp_error(format!("no address for {}", peer)))?;

        let stream = TcpStream::connect_timeout(&addr, params.connect_timeout).map_err(|e| {
            if e.kind() == io::ErrorKind::TimedOut {
                ConnectionError::ConnectionTimeout {
                    timeout_ms: params.connect_timeout.as_millis() as u64,
                }
            } else {
                ConnectionError::FailedToOpen {
                    target: peer.clone(),
                    reason: e.to_string(),
                }
            }
        })?;
        stream
            .set_read_timeout(Some(READ_SLICE))
            .and_then(|_| stream.set_nodelay(true))
            .map_err(|e| tcp_error(e.to_string()))?;

        if !params.reset_delay.is_zero() {
            std::thread::sleep(params.reset_delay);
        }

        tracing::info!("Connected to WiFi bridge at {}", peer);
        self.peer = peer;
        self.stream = Some(stream);
        self.buffer.clear();
        Ok(())
    }

    fn disconnect(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
            tracing::info!("Disconnected from {}", self.peer);
        }
        self.buffer.clear();
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    fn write_line(&mut self, line: &str) -> TransportResult<()> {
        let stream = self.stream.as_mut().ok_or(ConnectionError::NotConnected)?;
        let framed = format!("{}\n", line);
        let result = stream.write_all(framed.as_bytes());
        result.map_err(|e| self.lost(e.to_string()))
    }

    fn read_line(&mut self, timeout: Duration) -> TransportResult<Option<String>> {
        let deadline = Instant::now() + timeout;
        let mut chunk = [0u8; 512];
        loop {
            if let Some(line) = take_line(&mut self.buffer) {
                return Ok(Some(line));
            }
            let stream = self.stream.as_mut().ok_or(ConnectionError::NotConnected)?;
            match stream.read(&mut chunk) {
                Ok(0) => return Err(self.lost("peer closed the connection".to_string())),
                Ok(n) => {
                    append_received(&mut self.buffer, &chunk[..n], &self.peer);
                    continue;
                }
                Err(e) if matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(self.lost(e.to_string())),
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
        }
    }
}
