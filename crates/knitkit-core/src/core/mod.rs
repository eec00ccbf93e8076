//! Observer interfaces for controller consumers

pub mod listener;

pub use listener::{attach_listener, detach_listener, MachineListener, MachineListenerHandle};
