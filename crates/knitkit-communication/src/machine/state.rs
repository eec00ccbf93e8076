//! Machine lifecycle state machine

use knitkit_core::{AppEvent, ControllerError, EventBus, MachineEvent, MachineState};
use parking_lot::Mutex;
use std::sync::Arc;

/// Guards the machine state and announces every change
pub struct StateMachine {
    state: Mutex<MachineState>,
    bus: Arc<EventBus>,
}

impl StateMachine {
    /// Start in `Disconnected`
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            state: Mutex::new(MachineState::Disconnected),
            bus,
        }
    }

    /// Current state
    pub fn current(&self) -> MachineState {
        *self.state.lock()
    }

    /// Move to `to` if the graph allows it
    pub fn transition(&self, to: MachineState) -> Result<(), ControllerError> {
        let from = {
            let mut state = self.state.lock();
            let from = *state;
            if !from.can_transition_to(to) {
                return Err(ControllerError::InvalidStateTransition {
                    current: from.to_string(),
                    requested: to.to_string(),
                });
            }
            *state = to;
            from
        };
        self.announce(from, to);
        Ok(())
    }

    /// Move to `to` only if the current state is one of `expected`
    pub fn transition_from(&self, expected: &[MachineState], to: MachineState) -> bool {
        let from = {
            let mut state = self.state.lock();
            let from = *state;
            if !expected.contains(&from) || !from.can_transition_to(to) {
                return false;
            }
            *state = to;
            from
        };
        self.announce(from, to);
        true
    }

    fn announce(&self, from: MachineState, to: MachineState) {
        if from == to {
            return;
        }
        tracing::info!("Machine state: {} -> {}", from, to);
        let _ = self
            .bus
            .publish(AppEvent::Machine(MachineEvent::StateChanged { from, to }));
    }
}

impl std::fmt::Debug for StateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateMachine")
            .field("state", &self.current())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use knitkit_core::{thread_safe, EventFilter};

    #[test]
    fn test_transitions_publish_changes_only() {
        let bus = Arc::new(EventBus::new());
        let changes = thread_safe(Vec::new());
        let c = changes.clone();
        bus.subscribe(EventFilter::All, move |event| {
            if let AppEvent::Machine(MachineEvent::StateChanged { from, to }) = event {
                c.lock().push((from, to));
            }
        });

        let machine = StateMachine::new(bus);
        machine.transition(MachineState::Connected).unwrap();
        machine.transition(MachineState::Connected).unwrap();
        assert!(machine.transition(MachineState::Paused).is_err());
        machine.transition(MachineState::Executing).unwrap();

        assert_eq!(
            changes.lock().as_slice(),
            &[
                (MachineState::Disconnected, MachineState::Connected),
                (MachineState::Connected, MachineState::Executing),
            ]
        );
    }

    #[test]
    fn test_transition_from_guard() {
        let machine = StateMachine::new(Arc::new(EventBus::new()));
        assert!(!machine.transition_from(&[MachineState::Executing], MachineState::Paused));
        machine.transition(MachineState::Connected).unwrap();
        assert!(machine.transition_from(
            &[MachineState::Connected],
            MachineState::Executing
        ));
        assert_eq!(machine.current(), MachineState::Executing);
    }
}
