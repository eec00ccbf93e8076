//! Machine listener interface
//!
//! Observers implement [`MachineListener`] and are attached to an
//! [`EventBus`]; every callback has an empty default body.

use std::sync::Arc;

use crate::data::{DeviceMessage, ExecutionStatus, MachineState};
use crate::event_bus::{AppEvent, EventBus, EventFilter, ExecutionEvent, MachineEvent, SubscriptionId};

/// Handle for a registered machine listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MachineListenerHandle(pub SubscriptionId);

/// Listener trait for machine events
///
/// Callbacks run on the thread that produced the event (the dispatcher or
/// execution worker), so they should return quickly.
pub trait MachineListener: Send + Sync {
    /// Called when the machine state changes
    fn on_state_changed(&self, _from: MachineState, _to: MachineState) {}

    /// Called after every completed or failed step, and at run start and end
    fn on_progress(&self, _status: &ExecutionStatus) {}

    /// Called when a command, step or connection fails
    fn on_error(&self, _message: &str) {}

    /// Called for informational device lines
    fn on_device_message(&self, _message: &DeviceMessage) {}
}

/// Route bus events to `listener`'s callbacks
pub fn attach_listener(bus: &EventBus, listener: Arc<dyn MachineListener>) -> MachineListenerHandle {
    let id = bus.subscribe(EventFilter::All, move |event| match event {
        AppEvent::Machine(MachineEvent::StateChanged { from, to }) => {
            listener.on_state_changed(from, to)
        }
        AppEvent::Machine(_) => {}
        AppEvent::Execution(e) => {
            if let ExecutionEvent::StepFailed { message, .. } = &e {
                listener.on_error(message);
            }
            if let ExecutionEvent::Aborted { reason, .. } = &e {
                listener.on_error(reason);
            }
            listener.on_progress(e.status());
        }
        AppEvent::Device(message) => listener.on_device_message(&message),
        AppEvent::Error(e) => listener.on_error(&e.message()),
        AppEvent::Connection(c) => {
            if matches!(
                c,
                crate::event_bus::ConnectionEvent::Lost { .. }
                    | crate::event_bus::ConnectionEvent::ConnectionFailed { .. }
            ) {
                listener.on_error(&c.description());
            }
        }
    });
    MachineListenerHandle(id)
}

/// Stop routing events to a listener
pub fn detach_listener(bus: &EventBus, handle: MachineListenerHandle) -> bool {
    bus.unsubscribe(handle.0)
}
