//! # KnitKit Core
//!
//! Core types for KnitKit: the pattern and machine-state data model,
//! error types, the event bus and observer interfaces.

pub mod core;
pub mod data;
pub mod error;
pub mod event_bus;
pub mod types;

pub use core::{attach_listener, detach_listener, MachineListener, MachineListenerHandle};

pub use data::{
    DeviceMessage, Direction, ExecutionStatus, KnittingPattern, MachineState,
    MachineStatusSnapshot, PatternStep, SensorState, MAX_PATTERN_NAME_LENGTH,
};

pub use error::{
    CommandError, ConnectionError, ControllerError, Error, PatternError, ProtocolError, Result,
};

pub use event_bus::{
    AppEvent, ConnectionEvent, ErrorEvent, EventBus, EventCategory, EventFilter, ExecutionEvent,
    MachineEvent, SubscriptionId,
};

pub use types::{thread_safe, OnceCallback, ThreadSafe};
