//! # KnitKit
//!
//! Command execution and pattern orchestration for stepper-driven circular
//! knitting machines.
//!
//! ## Architecture
//!
//! KnitKit is organized as a workspace with multiple crates:
//!
//! 1. **knitkit-core** - Pattern and machine-state data model, errors, event bus
//! 2. **knitkit-communication** - Transports, wire protocol, command dispatch, execution engine
//! 3. **knitkit-settings** - Configuration files and validation
//! 4. **knitkit** - This crate: re-exports, logging setup and the command-line tool

use std::path::Path;

pub use knitkit_communication::{
    list_ports, CommandResult, CommandStatus, ControllerConfig, KnittingController, MotorCommand,
    SimulatedTransport, SimulatorHandle, TransportKind, TransportParams,
};
pub use knitkit_core::{
    AppEvent, Direction, Error, EventBus, ExecutionStatus, KnittingPattern, MachineListener,
    MachineState, MachineStatusSnapshot, PatternStep, Result,
};
pub use knitkit_settings::Config;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build date information
pub const BUILD_DATE: &str = env!("BUILD_DATE");

/// Read a pattern from its JSON file
pub fn load_pattern(path: &Path) -> Result<KnittingPattern> {
    let text = std::fs::read_to_string(path)?;
    Ok(KnittingPattern::from_json(&text)?)
}

/// Write a pattern as pretty JSON
pub fn save_pattern(pattern: &KnittingPattern, path: &Path) -> Result<()> {
    std::fs::write(path, pattern.to_json()?)?;
    Ok(())
}

/// Initialize logging
///
/// Honors `RUST_LOG`; defaults to INFO.
pub fn init_logging() -> anyhow::Result<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let fmt_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_level(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_line_number(true);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()?;

    Ok(())
}
