//! Data models for patterns, machine state and execution progress
//!
//! This module provides:
//! - Rotation direction of the needle ring
//! - The machine lifecycle state machine states
//! - Immutable knitting pattern value types
//! - Execution progress reporting
//! - Informational device messages
//! - Machine status snapshots for observers

pub mod device;
pub mod execution;
pub mod pattern;

pub use device::{DeviceMessage, SensorState};
pub use execution::ExecutionStatus;
pub use pattern::{KnittingPattern, PatternStep, MAX_PATTERN_NAME_LENGTH};

use crate::error::PatternError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Rotation direction of the needle ring
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Direction {
    /// Clockwise
    #[default]
    #[serde(rename = "CW")]
    Cw,
    /// Counter-clockwise
    #[serde(rename = "CCW")]
    Ccw,
}

impl Direction {
    /// Wire representation used by the firmware
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Cw => "CW",
            Direction::Ccw => "CCW",
        }
    }

    /// The reverse rotation
    pub fn opposite(&self) -> Direction {
        match self {
            Direction::Cw => Direction::Ccw,
            Direction::Ccw => Direction::Cw,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Direction {
    type Err = PatternError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "CW" => Ok(Direction::Cw),
            "CCW" => Ok(Direction::Ccw),
            _ => Err(PatternError::InvalidDirection(s.to_string())),
        }
    }
}

/// Machine state machine states
///
/// Tracks the lifecycle of a connection to the knitting machine from
/// initial connection through pattern execution, pause, stop and error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum MachineState {
    /// No transport connected
    #[default]
    Disconnected,
    /// Connected and idle, ready for commands
    Connected,
    /// A pattern run is in progress
    Executing,
    /// A pattern run is paused between steps
    Paused,
    /// Halted by an emergency stop; must be cleared before the next run
    Stopped,
    /// Unrecoverable transport fault; requires a fresh connect
    Error,
}

impl MachineState {
    /// Check if this state has a live transport
    pub fn is_connected(&self) -> bool {
        !matches!(self, MachineState::Disconnected | MachineState::Error)
    }

    /// Check if a pattern run owns the machine
    pub fn is_running(&self) -> bool {
        matches!(self, MachineState::Executing | MachineState::Paused)
    }

    /// Check if a transition from this state to `target` is valid.
    ///
    /// - Any state can disconnect or fault into Error
    /// - Disconnected and Error only leave through a successful connect
    /// - Executing and Paused alternate, and both end in Connected or Stopped
    /// - Stopped must be cleared back to Connected
    pub fn can_transition_to(&self, target: MachineState) -> bool {
        use MachineState::*;
        if *self == target {
            return true;
        }
        match (self, target) {
            (_, Disconnected | Error) => true,
            (Disconnected | Error, Connected) => true,
            (Disconnected | Error, _) => false,
            (Connected, Executing | Stopped) => true,
            (Executing, Paused | Connected | Stopped) => true,
            (Paused, Executing | Connected | Stopped) => true,
            (Stopped, Connected) => true,
            _ => false,
        }
    }
}

impl fmt::Display for MachineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connected => write!(f, "Connected"),
            Self::Executing => write!(f, "Executing"),
            Self::Paused => write!(f, "Paused"),
            Self::Stopped => write!(f, "Stopped"),
            Self::Error => write!(f, "Error"),
        }
    }
}

/// Point-in-time view of the whole controller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineStatusSnapshot {
    /// Current lifecycle state
    pub state: MachineState,
    /// Connected port or host, if any
    pub target: Option<String>,
    /// Tracked needle position
    pub current_needle: u32,
    /// Needles on the machine's ring
    pub needle_count: u32,
    /// Commands waiting in the dispatcher queue
    pub queue_len: usize,
    /// Progress of the active or most recent run
    pub execution: Option<ExecutionStatus>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direction_parse_and_display() {
        assert_eq!("cw".parse::<Direction>().unwrap(), Direction::Cw);
        assert_eq!(" CCW ".parse::<Direction>().unwrap(), Direction::Ccw);
        assert!("left".parse::<Direction>().is_err());
        assert_eq!(Direction::Ccw.to_string(), "CCW");
        assert_eq!(Direction::Cw.opposite(), Direction::Ccw);
    }

    #[test]
    fn test_direction_serde_form() {
        let json = serde_json::to_string(&Direction::Ccw).unwrap();
        assert_eq!(json, "\"CCW\"");
        let back: Direction = serde_json::from_str("\"CW\"").unwrap();
        assert_eq!(back, Direction::Cw);
    }

    #[test]
    fn test_state_transitions() {
        use MachineState::*;
        assert!(Disconnected.can_transition_to(Connected));
        assert!(!Disconnected.can_transition_to(Executing));
        assert!(Connected.can_transition_to(Executing));
        assert!(Executing.can_transition_to(Paused));
        assert!(Paused.can_transition_to(Executing));
        assert!(Paused.can_transition_to(Connected));
        assert!(Executing.can_transition_to(Stopped));
        assert!(!Stopped.can_transition_to(Executing));
        assert!(Stopped.can_transition_to(Connected));
        assert!(!Error.can_transition_to(Executing));
        assert!(Error.can_transition_to(Connected));
        for state in [Connected, Executing, Paused, Stopped, Error] {
            assert!(state.can_transition_to(Disconnected));
            assert!(state.can_transition_to(Error));
        }
    }

    #[test]
    fn test_state_predicates() {
        assert!(MachineState::Paused.is_running());
        assert!(!MachineState::Stopped.is_running());
        assert!(MachineState::Stopped.is_connected());
        assert!(!MachineState::Error.is_connected());
    }
}
