//! Event type definitions for the event bus.
//!
//! This module defines all controller events organized by category.
//! Events are designed to be cloneable and serializable for logging/replay.

use serde::{Deserialize, Serialize};

use crate::data::{DeviceMessage, ExecutionStatus, MachineState};

/// Root event enum for all controller events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AppEvent {
    /// Transport connection events
    Connection(ConnectionEvent),
    /// Machine state machine events
    Machine(MachineEvent),
    /// Pattern run progress
    Execution(ExecutionEvent),
    /// Informational device lines
    Device(DeviceMessage),
    /// Error and diagnostic events
    Error(ErrorEvent),
}

impl AppEvent {
    /// Get the category of this event
    pub fn category(&self) -> EventCategory {
        match self {
            AppEvent::Connection(_) => EventCategory::Connection,
            AppEvent::Machine(_) => EventCategory::Machine,
            AppEvent::Execution(_) => EventCategory::Execution,
            AppEvent::Device(_) => EventCategory::Device,
            AppEvent::Error(_) => EventCategory::Error,
        }
    }

    /// Get a short description of this event for logging
    pub fn description(&self) -> String {
        match self {
            AppEvent::Connection(e) => e.description(),
            AppEvent::Machine(e) => e.description(),
            AppEvent::Execution(e) => e.description(),
            AppEvent::Device(msg) => msg.to_string(),
            AppEvent::Error(e) => e.description(),
        }
    }
}

/// Event category for filtering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventCategory {
    /// Transport connection events.
    Connection,
    /// Machine state events.
    Machine,
    /// Pattern run events.
    Execution,
    /// Device informational events.
    Device,
    /// Error and diagnostic events.
    Error,
}

impl std::fmt::Display for EventCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventCategory::Connection => write!(f, "Connection"),
            EventCategory::Machine => write!(f, "Machine"),
            EventCategory::Execution => write!(f, "Execution"),
            EventCategory::Device => write!(f, "Device"),
            EventCategory::Error => write!(f, "Error"),
        }
    }
}

/// Connection-related events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ConnectionEvent {
    /// Successfully connected.
    Connected {
        /// Port name or host address.
        target: String,
    },
    /// Disconnected on request.
    Disconnected {
        /// Port name or host address.
        target: String,
    },
    /// Connection attempt failed.
    ConnectionFailed {
        /// Port name or host address.
        target: String,
        /// Error message describing the failure.
        error: String,
    },
    /// Transport failed while in use.
    Lost {
        /// Why the transport failed.
        reason: String,
    },
}

impl ConnectionEvent {
    /// Short description for logging
    pub fn description(&self) -> String {
        match self {
            ConnectionEvent::Connected { target } => format!("Connected to {}", target),
            ConnectionEvent::Disconnected { target } => format!("Disconnected from {}", target),
            ConnectionEvent::ConnectionFailed { target, error } => {
                format!("Connection to {} failed: {}", target, error)
            }
            ConnectionEvent::Lost { reason } => format!("Connection lost: {}", reason),
        }
    }
}

/// Machine state events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MachineEvent {
    /// The machine state changed.
    StateChanged {
        /// Previous state.
        from: MachineState,
        /// New state.
        to: MachineState,
    },
    /// The tracked needle position changed.
    NeedlePositionChanged {
        /// New needle index.
        position: u32,
    },
    /// Emergency stop commands were written to the device.
    EmergencyStop,
}

impl MachineEvent {
    /// Short description for logging
    pub fn description(&self) -> String {
        match self {
            MachineEvent::StateChanged { from, to } => format!("State: {} -> {}", from, to),
            MachineEvent::NeedlePositionChanged { position } => format!("Needle: {}", position),
            MachineEvent::EmergencyStop => "Emergency stop".to_string(),
        }
    }
}

/// Pattern run events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ExecutionEvent {
    /// A run started.
    Started(ExecutionStatus),
    /// A step completed.
    Progress(ExecutionStatus),
    /// A step failed; the run continues.
    StepFailed {
        /// Failure message as recorded in the status.
        message: String,
        /// Status after recording the failure.
        status: ExecutionStatus,
    },
    /// Every repetition finished.
    Completed(ExecutionStatus),
    /// The run was cancelled.
    Cancelled(ExecutionStatus),
    /// The run was aborted by a fault or failure ceiling.
    Aborted {
        /// Why the run stopped.
        reason: String,
        /// Status at the time of the abort.
        status: ExecutionStatus,
    },
}

impl ExecutionEvent {
    /// The status carried by this event
    pub fn status(&self) -> &ExecutionStatus {
        match self {
            ExecutionEvent::Started(s)
            | ExecutionEvent::Progress(s)
            | ExecutionEvent::Completed(s)
            | ExecutionEvent::Cancelled(s) => s,
            ExecutionEvent::StepFailed { status, .. } | ExecutionEvent::Aborted { status, .. } => {
                status
            }
        }
    }

    /// Short description for logging
    pub fn description(&self) -> String {
        let s = self.status();
        match self {
            ExecutionEvent::Started(_) => format!("Started '{}'", s.pattern_name),
            ExecutionEvent::Progress(_) => {
                format!("Step {}/{}", s.current_step, s.total_steps)
            }
            ExecutionEvent::StepFailed { message, .. } => format!("Step failed: {}", message),
            ExecutionEvent::Completed(_) => format!("Completed '{}'", s.pattern_name),
            ExecutionEvent::Cancelled(_) => format!("Cancelled '{}'", s.pattern_name),
            ExecutionEvent::Aborted { reason, .. } => format!("Aborted: {}", reason),
        }
    }
}

/// Error events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ErrorEvent {
    /// A command failed.
    CommandFailed {
        /// The command text.
        command: String,
        /// Error description.
        error: String,
    },
    /// A response line was discarded as corrupted.
    CorruptedResponse {
        /// The raw line.
        line: String,
    },
    /// Any other error surfaced to the user.
    General {
        /// Error description.
        message: String,
    },
}

impl ErrorEvent {
    /// Short description for logging
    pub fn description(&self) -> String {
        match self {
            ErrorEvent::CommandFailed { command, error } => format!("{}: {}", command, error),
            ErrorEvent::CorruptedResponse { line } => format!("Corrupted response: {:?}", line),
            ErrorEvent::General { message } => message.clone(),
        }
    }

    /// User-facing message
    pub fn message(&self) -> String {
        self.description()
    }
}
