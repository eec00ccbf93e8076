//! Machine control
//!
//! - Lifecycle state machine
//! - Needle position tracking
//! - Pattern execution engine
//! - The controller facade tying them to a transport

pub mod controller;
pub mod engine;
pub mod needle;
pub mod state;

pub use controller::{ConnectionInfo, ControllerConfig, KnittingController, DEFAULT_NEEDLE_COUNT};
pub use engine::{step_command, ExecutionConfig, ExecutionEngine, MotionMode};
pub use needle::NeedleTracker;
pub use state::StateMachine;
