//! Configuration for KnitKit
//!
//! Configuration is organized into logical sections:
//! - Connection settings (transport, port or host, timing)
//! - Machine settings (needle ring geometry, motor speed and microstepping)
//! - Dispatch settings (chunking, response timeouts, retries)
//! - Execution settings (motion mode, step timeout, failure ceiling)
//!
//! Files are JSON or TOML, chosen by extension. Every field has a default,
//! so a file only needs the values it changes.

use crate::error::{SettingsError, SettingsResult};
use knitkit_communication::communication::protocol::{MICROSTEP_DIVISORS, SPEED_RANGE_US};
use knitkit_communication::{
    ControllerConfig, DispatcherConfig, ExecutionConfig, MotionMode, MotorCommand, TransportKind,
    TransportParams, DEFAULT_BAUD_RATE, DEFAULT_NEEDLE_COUNT, DEFAULT_TCP_PORT,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Largest needle ring the controller accepts
pub const MAX_NEEDLE_COUNT: u32 = 200;

/// Largest step count one `TURN` line may carry
const MAX_CHUNK_SIZE: u64 = 32767;

/// Connection settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    /// Transport to open
    pub transport: TransportKind,
    /// Serial port name, or `auto` to pick the first likely board
    pub port: String,
    /// Host of the WiFi bridge
    pub host: String,
    /// Baud rate for serial connections
    pub baud_rate: u32,
    /// TCP port of the WiFi bridge
    pub tcp_port: u16,
    /// Connection timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Wait after opening for the board to reset, in milliseconds
    pub reset_delay_ms: u64,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            transport: TransportKind::Serial,
            port: "auto".to_string(),
            host: String::new(),
            baud_rate: DEFAULT_BAUD_RATE,
            tcp_port: DEFAULT_TCP_PORT,
            connect_timeout_ms: 5000,
            reset_delay_ms: 2000,
        }
    }
}

impl ConnectionSettings {
    /// Whether the serial port should be discovered at connect time
    pub fn auto_port(&self) -> bool {
        self.port.trim().is_empty() || self.port.eq_ignore_ascii_case("auto")
    }

    /// Transport parameters for these settings
    pub fn transport_params(&self) -> TransportParams {
        let target = match self.transport {
            TransportKind::Serial => self.port.clone(),
            TransportKind::Tcp => self.host.clone(),
            TransportKind::Simulated => "simulator".to_string(),
        };
        TransportParams {
            kind: self.transport,
            target,
            baud_rate: self.baud_rate,
            tcp_port: self.tcp_port,
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            reset_delay: Duration::from_millis(self.reset_delay_ms),
        }
    }
}

/// Machine settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MachineSettings {
    /// Needles on the ring
    pub needle_count: u32,
    /// Stepper steps that advance the ring by one needle
    pub steps_per_needle: u64,
    /// Step pulse interval in microseconds, sent on connect when set
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed_us: Option<u32>,
    /// Microstepping divisor, sent on connect when set
    #[serde(skip_serializing_if = "Option::is_none")]
    pub microstepping: Option<u32>,
}

impl Default for MachineSettings {
    fn default() -> Self {
        Self {
            needle_count: DEFAULT_NEEDLE_COUNT,
            steps_per_needle: 1000,
            speed_us: None,
            microstepping: None,
        }
    }
}

impl MachineSettings {
    /// Commands that bring the motor driver in line with these settings
    pub fn setup_commands(&self) -> Vec<MotorCommand> {
        let mut commands = Vec::new();
        if let Some(us) = self.speed_us {
            commands.push(MotorCommand::Speed(us));
        }
        if let Some(divisor) = self.microstepping {
            commands.push(MotorCommand::Micro(divisor));
        }
        commands
    }
}

/// Command dispatch settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchSettings {
    /// Largest `TURN` step count sent in one line
    pub max_chunk_size: u64,
    /// Response window per attempt, in milliseconds
    pub response_timeout_ms: u64,
    /// Extra attempts after a timeout
    pub max_retries: u32,
    /// Pause before a retry, in milliseconds
    pub retry_delay_ms: u64,
    /// Pause between chunks of one command, in milliseconds
    pub settle_delay_ms: u64,
    /// Read slice while waiting for a response, in milliseconds
    pub poll_interval_ms: u64,
    /// Commands allowed to wait in the queue
    pub queue_capacity: usize,
    /// How many times the stop sequence is written on emergency stop
    pub emergency_stop_repeats: u32,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        let d = DispatcherConfig::default();
        Self {
            max_chunk_size: d.max_chunk_size,
            response_timeout_ms: millis(d.response_timeout),
            max_retries: d.max_retries,
            retry_delay_ms: millis(d.retry_delay),
            settle_delay_ms: millis(d.settle_delay),
            poll_interval_ms: millis(d.poll_interval),
            queue_capacity: d.queue_capacity,
            emergency_stop_repeats: d.emergency_stop_repeats,
        }
    }
}

impl From<&DispatchSettings> for DispatcherConfig {
    fn from(s: &DispatchSettings) -> Self {
        DispatcherConfig {
            max_chunk_size: s.max_chunk_size,
            response_timeout: Duration::from_millis(s.response_timeout_ms),
            max_retries: s.max_retries,
            retry_delay: Duration::from_millis(s.retry_delay_ms),
            settle_delay: Duration::from_millis(s.settle_delay_ms),
            poll_interval: Duration::from_millis(s.poll_interval_ms),
            queue_capacity: s.queue_capacity,
            emergency_stop_repeats: s.emergency_stop_repeats,
        }
    }
}

/// Pattern execution settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionSettings {
    /// How steps are expressed on the wire
    pub motion_mode: MotionMode,
    /// Longest wait for one step's result, in milliseconds
    pub step_timeout_ms: u64,
    /// Step failures tolerated before the run is aborted; unlimited if unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_failures: Option<usize>,
    /// Pause between steps, in milliseconds
    pub inter_step_delay_ms: u64,
    /// How often a paused run checks for resume, in milliseconds
    pub pause_poll_interval_ms: u64,
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        let e = ExecutionConfig::default();
        Self {
            motion_mode: e.motion_mode,
            step_timeout_ms: millis(e.step_timeout),
            max_failures: e.max_failures,
            inter_step_delay_ms: millis(e.inter_step_delay),
            pause_poll_interval_ms: millis(e.pause_poll_interval),
        }
    }
}

/// Complete application configuration
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Connection settings
    pub connection: ConnectionSettings,
    /// Machine settings
    pub machine: MachineSettings,
    /// Command dispatch settings
    pub dispatch: DispatchSettings,
    /// Pattern execution settings
    pub execution: ExecutionSettings,
}

enum Format {
    Json,
    Toml,
}

fn format_of(path: &Path) -> SettingsResult<Format> {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case("json") => Ok(Format::Json),
        Some(ext) if ext.eq_ignore_ascii_case("toml") => Ok(Format::Toml),
        _ => Err(SettingsError::UnsupportedFormat(path.to_path_buf())),
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// `<config_dir>/knitkit/config.toml` for the current platform
pub fn default_config_path() -> SettingsResult<PathBuf> {
    dirs::config_dir()
        .map(|dir| dir.join("knitkit").join("config.toml"))
        .ok_or_else(|| {
            SettingsError::ConfigDirectory("no configuration directory on this platform".into())
        })
}

impl Config {
    /// Create new config with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Load config from file (JSON or TOML)
    pub fn load_from_file(path: &Path) -> SettingsResult<Self> {
        let format = format_of(path)?;
        let content = std::fs::read_to_string(path)?;
        let config: Self = match format {
            Format::Json => serde_json::from_str(&content)?,
            Format::Toml => toml::from_str(&content)?,
        };
        config.validate()?;
        tracing::debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Load `path` if given, else the default file if it exists, else defaults
    pub fn load_or_default(path: Option<&Path>) -> SettingsResult<Self> {
        if let Some(path) = path {
            return Self::load_from_file(path);
        }
        match default_config_path() {
            Ok(default) if default.exists() => Self::load_from_file(&default),
            _ => Ok(Self::default()),
        }
    }

    /// Save config to file (JSON or TOML), creating parent directories
    pub fn save_to_file(&self, path: &Path) -> SettingsResult<()> {
        self.validate()?;

        let content = match format_of(path)? {
            Format::Json => serde_json::to_string_pretty(self)?,
            Format::Toml => toml::to_string_pretty(self)?,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        tracing::info!("Saved config to {}", path.display());
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> SettingsResult<()> {
        let c = &self.connection;
        if c.baud_rate == 0 {
            return Err(SettingsError::invalid("connection.baud_rate", "must be > 0"));
        }
        if c.connect_timeout_ms == 0 {
            return Err(SettingsError::invalid(
                "connection.connect_timeout_ms",
                "must be > 0",
            ));
        }
        if c.transport == TransportKind::Tcp && c.host.trim().is_empty() {
            return Err(SettingsError::invalid(
                "connection.host",
                "required for the tcp transport",
            ));
        }

        let m = &self.machine;
        if !(1..=MAX_NEEDLE_COUNT).contains(&m.needle_count) {
            return Err(SettingsError::invalid(
                "machine.needle_count",
                format!("must be 1-{}", MAX_NEEDLE_COUNT),
            ));
        }
        if m.steps_per_needle == 0 {
            return Err(SettingsError::invalid("machine.steps_per_needle", "must be >= 1"));
        }
        if let Some(us) = m.speed_us {
            if !SPEED_RANGE_US.contains(&us) {
                return Err(SettingsError::invalid(
                    "machine.speed_us",
                    format!(
                        "must be {}-{}",
                        SPEED_RANGE_US.start(),
                        SPEED_RANGE_US.end()
                    ),
                ));
            }
        }
        if let Some(divisor) = m.microstepping {
            if !MICROSTEP_DIVISORS.contains(&divisor) {
                return Err(SettingsError::invalid(
                    "machine.microstepping",
                    format!("must be one of {:?}", MICROSTEP_DIVISORS),
                ));
            }
        }

        let d = &self.dispatch;
        if !(1..=MAX_CHUNK_SIZE).contains(&d.max_chunk_size) {
            return Err(SettingsError::invalid(
                "dispatch.max_chunk_size",
                format!("must be 1-{}", MAX_CHUNK_SIZE),
            ));
        }
        if d.response_timeout_ms == 0 {
            return Err(SettingsError::invalid(
                "dispatch.response_timeout_ms",
                "must be > 0",
            ));
        }
        if d.poll_interval_ms == 0 {
            return Err(SettingsError::invalid("dispatch.poll_interval_ms", "must be > 0"));
        }
        if d.queue_capacity == 0 {
            return Err(SettingsError::invalid("dispatch.queue_capacity", "must be > 0"));
        }

        let e = &self.execution;
        if e.step_timeout_ms == 0 {
            return Err(SettingsError::invalid("execution.step_timeout_ms", "must be > 0"));
        }
        if e.pause_poll_interval_ms == 0 {
            return Err(SettingsError::invalid(
                "execution.pause_poll_interval_ms",
                "must be > 0",
            ));
        }
        Ok(())
    }

    /// Controller tuning built from the machine, dispatch and execution sections
    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            needle_count: self.machine.needle_count,
            dispatcher: DispatcherConfig::from(&self.dispatch),
            execution: self.execution_config(),
        }
    }

    /// Execution tuning; steps per needle comes from the machine section
    pub fn execution_config(&self) -> ExecutionConfig {
        let e = &self.execution;
        ExecutionConfig {
            motion_mode: e.motion_mode,
            steps_per_needle: self.machine.steps_per_needle,
            step_timeout: Duration::from_millis(e.step_timeout_ms),
            max_failures: e.max_failures,
            pause_poll_interval: Duration::from_millis(e.pause_poll_interval_ms),
            inter_step_delay: Duration::from_millis(e.inter_step_delay_ms),
        }
    }
}
