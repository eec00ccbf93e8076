//! Informational messages reported by the machine

use serde::{Deserialize, Serialize};
use std::fmt;

/// State of the needle detection sensor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SensorState {
    /// Nothing in front of the sensor
    Clear,
    /// A needle is blocking the sensor
    Blocked,
    /// Any other reading, kept verbatim
    Other(String),
}

impl fmt::Display for SensorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SensorState::Clear => write!(f, "CLEAR"),
            SensorState::Blocked => write!(f, "BLOCKED"),
            SensorState::Other(raw) => write!(f, "{}", raw),
        }
    }
}

/// Non-terminal status line from the device.
///
/// These never complete a command; they are forwarded to observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DeviceMessage {
    /// `Needle count: N` from the needle sensor tally
    NeedleCount(u64),
    /// `Distance: D` from the distance sensor
    Distance(f64),
    /// `Sensor: CLEAR|BLOCKED`
    Sensor(SensorState),
}

impl fmt::Display for DeviceMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceMessage::NeedleCount(n) => write!(f, "Needle count: {}", n),
            DeviceMessage::Distance(d) => write!(f, "Distance: {}", d),
            DeviceMessage::Sensor(s) => write!(f, "Sensor: {}", s),
        }
    }
}
