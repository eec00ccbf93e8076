//! KnitKit Settings Crate
//!
//! Loads, validates and saves the controller configuration, and turns it
//! into the runtime configs the communication crate consumes.

pub mod config;
pub mod error;

pub use config::{
    default_config_path, Config, ConnectionSettings, DispatchSettings, ExecutionSettings,
    MachineSettings, MAX_NEEDLE_COUNT,
};
pub use error::{SettingsError, SettingsResult};
