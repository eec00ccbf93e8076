//! Serial port transport
//!
//! Provides serial port operations for direct connection to the knitting
//! machine's Arduino-class controller over USB or RS-232.
//!
//! Supports:
//! - Port enumeration and discovery
//! - 8N1 framing at a configurable baud rate
//! - A settle delay after opening, for boards that reset on connect
//! - Bounded line reads in short slices

use super::{append_received, take_line, Transport, TransportParams, TransportResult};
use knitkit_core::{ConnectionError, Error, Result};
use std::io::{self, Read, Write};
use std::time::{Duration, Instant};

/// Read slice used while waiting for a line
const READ_SLICE: Duration = Duration::from_millis(10);

/// Information about an available serial port
#[derive(Debug, Clone)]
pub struct SerialPortInfo {
    /// Port name (e.g., "/dev/ttyUSB0", "COM3")
    pub port_name: String,

    /// Port description (e.g., "USB Arduino Uno")
    pub description: String,

    /// Manufacturer name if available
    pub manufacturer: Option<String>,

    /// USB vendor ID if applicable
    pub vid: Option<u16>,

    /// USB product ID if applicable
    pub pid: Option<u16>,
}

impl SerialPortInfo {
    /// Create a new port info
    pub fn new(port_name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            port_name: port_name.into(),
            description: description.into(),
            manufacturer: None,
            vid: None,
            pid: None,
        }
    }

    /// Set manufacturer
    pub fn with_manufacturer(mut self, manufacturer: impl Into<String>) -> Self {
        self.manufacturer = Some(manufacturer.into());
        self
    }

    /// Set USB IDs
    pub fn with_usb_ids(mut self, vid: u16, pid: u16) -> Self {
        self.vid = Some(vid);
        self.pid = Some(pid);
        self
    }
}

/// List serial ports that could host a knitting machine controller
///
/// Only ports matching microcontroller naming patterns are returned:
/// - Windows: COM* (e.g., COM1, COM3)
/// - Linux: /dev/ttyUSB*, /dev/ttyACM*
/// - macOS: /dev/cu.usbserial-*, /dev/cu.usbmodem*
pub fn list_ports() -> Result<Vec<SerialPortInfo>> {
    match serialport::available_ports() {
        Ok(ports) => Ok(ports
            .iter()
            .filter(|port| is_candidate_port(&port.port_name))
            .map(|port| {
                let info = SerialPortInfo::new(&port.port_name, port_description(port));
                match &port.port_type {
                    serialport::SerialPortType::UsbPort(usb) => {
                        let info = info.with_usb_ids(usb.vid, usb.pid);
                        match &usb.manufacturer {
                            Some(mfg) => info.with_manufacturer(mfg),
                            None => info,
                        }
                    }
                    _ => info,
                }
            })
            .collect()),
        Err(e) => {
            tracing::error!("Failed to enumerate serial ports: {}", e);
            Err(Error::other(format!("Failed to enumerate ports: {}", e)))
        }
    }
}

/// Check if a port name matches microcontroller board patterns
pub fn is_candidate_port(port_name: &str) -> bool {
    if let Some(number) = port_name.strip_prefix("COM") {
        return !number.is_empty() && number.chars().all(|c| c.is_ascii_digit());
    }

    port_name.starts_with("/dev/ttyUSB")
        || port_name.starts_with("/dev/ttyACM")
        || port_name.starts_with("/dev/cu.usbserial")
        || port_name.starts_with("/dev/cu.usbmodem")
}

fn port_description(port: &serialport::SerialPortInfo) -> String {
    match &port.port_type {
        serialport::SerialPortType::UsbPort(usb) => format!(
            "USB {} {}",
            usb.manufacturer.as_deref().unwrap_or("Device"),
            usb.product.as_deref().unwrap_or("Serial Port")
        ),
        serialport::SerialPortType::BluetoothPort => "Bluetooth Serial".to_string(),
        serialport::SerialPortType::PciPort => "PCI Serial".to_string(),
        _ => "Serial Port".to_string(),
    }
}

/// Serial transport backed by the `serialport` crate
#[derive(Default)]
pub struct SerialTransport {
    port: Option<Box<dyn serialport::SerialPort>>,
    name: String,
    buffer: Vec<u8>,
}

impl SerialTransport {
    /// Create an unconnected serial transport
    pub fn new() -> Self {
        Self::default()
    }

    fn lost(&mut self, e: io::Error) -> ConnectionError {
        tracing::error!("Serial port {} failed: {}", self.name, e);
        self.port = None;
        self.buffer.clear();
        ConnectionError::ConnectionLost {
            reason: e.to_string(),
        }
    }
}

impl Transport for SerialTransport {
    fn connect(&mut self, params: &TransportParams) -> TransportResult<()> {
        params.validate()?;
        self.disconnect();

        let mut port = serialport::new(&params.target, params.baud_rate)
            .timeout(READ_SLICE)
            .data_bits(serialport::DataBits::Eight)
            .stop_bits(serialport::StopBits::One)
            .parity(serialport::Parity::None)
            .flow_control(serialport::FlowControl::None)
            .open()
            .map_err(|e| {
                tracing::warn!("Failed to open serial port {}: {}", params.target, e);
                ConnectionError::FailedToOpen {
                    target: params.target.clone(),
                    reason: e.to_string(),
                }
            })?;

        if !params.reset_delay.is_zero() {
            tracing::debug!(
                "Waiting {:?} for {} to finish resetting",
                params.reset_delay,
                params.target
            );
            std::thread::sleep(params.reset_delay);
        }
        if let Err(e) = port.clear(serialport::ClearBuffer::All) {
            tracing::debug!("Could not flush {}: {}", params.target, e);
        }

        tracing::info!("Opened {} at {} baud", params.target, params.baud_rate);
        self.name = params.target.clone();
        self.port = Some(port);
        self.buffer.clear();
        Ok(())
    }

    fn disconnect(&mut self) {
        if self.port.take().is_some() {
            tracing::info!("Closed serial port {}", self.name);
        }
        self.buffer.clear();
    }

    fn is_connected(&self) -> bool {
        self.port.is_some()
    }

    fn write_line(&mut self, line: &str) -> TransportResult<()> {
        let port = self.port.as_mut().ok_or(ConnectionError::NotConnected)?;
        let framed = format!("{}\n", line);
        let result = port
            .write_all(framed.as_bytes())
            .and_then(|_| port.flush());
        result.map_err(|e| self.lost(e))
    }

    fn read_line(&mut self, timeout: Duration) -> TransportResult<Option<String>> {
        let deadline = Instant::now() + timeout;
        let mut chunk = [0u8; 256];
        loop {
            if let Some(line) = take_line(&mut self.buffer) {
                return Ok(Some(line));
            }
            let port = self.port.as_mut().ok_or(ConnectionError::NotConnected)?;
            match port.read(&mut chunk) {
                Ok(0) => {}
                Ok(n) => {
                    append_received(&mut self.buffer, &chunk[..n], &self.name);
                    continue;
                }
                Err(e) if matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(self.lost(e)),
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
        }
    }

    fn clear_input(&mut self) -> TransportResult<Vec<String>> {
        let port = self.port.as_mut().ok_or(ConnectionError::NotConnected)?;
        if let Err(e) = port.clear(serialport::ClearBuffer::Input) {
            tracing::debug!("Could not clear input of {}: {}", self.name, e);
        }
        let mut discarded = Vec::new();
        while let Some(line) = take_line(&mut self.buffer) {
            discarded.push(line);
        }
        self.buffer.clear();
        Ok(discarded)
    }
}
