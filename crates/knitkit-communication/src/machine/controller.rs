//! Knitting machine controller
//!
//! [`KnittingController`] is the facade the rest of the application talks
//! to. It owns the event bus, the state machine and the needle tracker for
//! its whole life, and builds a fresh dispatcher and execution engine for
//! every connection.
//!
//! Operations never wait for the device. Runs report through the bus, and
//! single moves hand back a channel that yields the command result.

use super::engine::{ExecutionConfig, ExecutionEngine};
use super::needle::NeedleTracker;
use super::state::StateMachine;
use crate::communication::dispatcher::{
    CommandCallback, CommandDispatcher, CommandResult, DispatcherConfig, SharedTransport,
};
use crate::communication::protocol::MotorCommand;
use crate::communication::{create_transport, Transport, TransportParams};
use knitkit_core::{
    attach_listener, detach_listener, thread_safe, AppEvent, ConnectionEvent, ControllerError,
    DeviceMessage, EventBus, EventCategory, EventFilter, ExecutionStatus, KnittingPattern,
    MachineEvent, MachineListener, MachineListenerHandle, MachineState, MachineStatusSnapshot,
    Result, SubscriptionId, ThreadSafe,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;
use uuid::Uuid;

/// Needles on the standard circular machine
pub const DEFAULT_NEEDLE_COUNT: u32 = 48;

const STOP_GRACE: Duration = Duration::from_secs(2);

/// Controller tuning
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerConfig {
    /// Needles on the ring
    pub needle_count: u32,
    /// Command dispatch tuning
    pub dispatcher: DispatcherConfig,
    /// Pattern run tuning
    pub execution: ExecutionConfig,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            needle_count: DEFAULT_NEEDLE_COUNT,
            dispatcher: DispatcherConfig::default(),
            execution: ExecutionConfig::default(),
        }
    }
}

/// Summary of a connection, for display
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    /// Port name or host address
    pub target: String,
    /// When the link came up
    pub connected_at: chrono::DateTime<chrono::Utc>,
}

struct Session {
    transport: SharedTransport,
    dispatcher: Arc<CommandDispatcher>,
    engine: Arc<ExecutionEngine>,
    info: ConnectionInfo,
}

/// Facade over one knitting machine
pub struct KnittingController {
    bus: Arc<EventBus>,
    state: Arc<StateMachine>,
    tracker: ThreadSafe<NeedleTracker>,
    stop_requested: Arc<AtomicBool>,
    session: Mutex<Option<Session>>,
    last_status: Mutex<Option<ExecutionStatus>>,
    subscriptions: Vec<SubscriptionId>,
    config: ControllerConfig,
}

impl KnittingController {
    /// Create a disconnected controller with its own event bus
    pub fn new(config: ControllerConfig) -> Self {
        Self::with_bus(config, Arc::new(EventBus::new()))
    }

    /// Create a disconnected controller publishing on `bus`
    pub fn with_bus(config: ControllerConfig, bus: Arc<EventBus>) -> Self {
        let state = Arc::new(StateMachine::new(Arc::clone(&bus)));
        let tracker = thread_safe(NeedleTracker::new(
            config.needle_count,
            config.execution.steps_per_needle,
        ));

        // Handlers hold the state machine weakly; it holds the bus.
        let weak_state = Arc::downgrade(&state);
        let on_lost = bus.subscribe(
            EventFilter::Categories(vec![EventCategory::Connection]),
            move |event| {
                let AppEvent::Connection(ConnectionEvent::Lost { reason }) = event else {
                    return;
                };
                let Some(state) = weak_state.upgrade() else {
                    return;
                };
                if state.current().is_connected() {
                    tracing::error!("Connection lost: {}", reason);
                    let _ = state.transition(MachineState::Error);
                }
            },
        );

        let weak_state = Arc::downgrade(&state);
        let sync_tracker = tracker.clone();
        let on_count = bus.subscribe(
            EventFilter::Categories(vec![EventCategory::Device]),
            move |event| {
                let AppEvent::Device(DeviceMessage::NeedleCount(count)) = event else {
                    return;
                };
                // Runs apply their own deltas; only idle tallies are adopted.
                let idle = weak_state
                    .upgrade()
                    .is_some_and(|s| s.current() == MachineState::Connected);
                if idle {
                    sync_tracker.lock().sync_from_count(count);
                }
            },
        );

        Self {
            bus,
            state,
            tracker,
            stop_requested: Arc::new(AtomicBool::new(false)),
            session: Mutex::new(None),
            last_status: Mutex::new(None),
            subscriptions: vec![on_lost, on_count],
            config,
        }
    }

    /// Event bus this controller publishes on
    pub fn bus(&self) -> Arc<EventBus> {
        Arc::clone(&self.bus)
    }

    /// Current lifecycle state
    pub fn state(&self) -> MachineState {
        self.state.current()
    }

    /// Tracked needle position
    pub fn current_needle(&self) -> u32 {
        self.tracker.lock().position()
    }

    /// Tuning in effect
    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Connection details, if connected
    pub fn connection_info(&self) -> Option<ConnectionInfo> {
        self.session.lock().as_ref().map(|s| s.info.clone())
    }

    /// Open the transport `params` describes and move to `Connected`
    pub fn connect(&self, params: &TransportParams) -> Result<()> {
        self.connect_with(create_transport(params.kind), params)
    }

    /// Connect over a caller-supplied transport.
    ///
    /// An existing connection is closed first. On failure the state is left
    /// where it was and `ConnectionFailed` is published.
    pub fn connect_with(&self, mut transport: Box<dyn Transport>, params: &TransportParams) -> Result<()> {
        if self.session.lock().is_some() {
            self.disconnect();
        }

        let target = params.display_target();
        tracing::info!("Connecting to {} over {}", target, params.kind);

        if let Err(e) = transport.connect(params) {
            tracing::error!("Failed to connect to {}: {}", target, e);
            let _ = self
                .bus
                .publish(AppEvent::Connection(ConnectionEvent::ConnectionFailed {
                    target,
                    error: e.to_string(),
                }));
            return Err(e.into());
        }

        let transport: SharedTransport = thread_safe(transport);
        self.stop_requested.store(false, Ordering::SeqCst);
        self.tracker.lock().reset();

        let dispatcher = match CommandDispatcher::start(
            transport.clone(),
            Arc::clone(&self.bus),
            Arc::clone(&self.stop_requested),
            self.config.dispatcher.clone(),
        ) {
            Ok(d) => Arc::new(d),
            Err(e) => {
                transport.lock().disconnect();
                return Err(e.into());
            }
        };
        let engine = match ExecutionEngine::start(
            Arc::clone(&dispatcher),
            Arc::clone(&self.state),
            self.tracker.clone(),
            Arc::clone(&self.bus),
            Arc::clone(&self.stop_requested),
            self.config.execution.clone(),
        ) {
            Ok(e) => Arc::new(e),
            Err(e) => {
                dispatcher.shutdown();
                transport.lock().disconnect();
                return Err(e.into());
            }
        };

        *self.session.lock() = Some(Session {
            transport,
            dispatcher,
            engine,
            info: ConnectionInfo {
                target: target.clone(),
                connected_at: chrono::Utc::now(),
            },
        });

        self.state.transition(MachineState::Connected)?;
        let _ = self
            .bus
            .publish(AppEvent::Connection(ConnectionEvent::Connected { target }));
        Ok(())
    }

    /// Close the connection, ending any run. Safe to call when disconnected.
    pub fn disconnect(&self) {
        let session = self.session.lock().take();
        let Some(session) = session else {
            if self.state.current() != MachineState::Disconnected {
                let _ = self.state.transition(MachineState::Disconnected);
            }
            return;
        };

        session.engine.request_stop(false);
        session.dispatcher.cancel_pending();
        let _ = self.state.transition(MachineState::Disconnected);

        if !session.engine.wait_idle(STOP_GRACE) {
            tracing::warn!("Run did not wind down within {:?}", STOP_GRACE);
        }
        self.remember_status(session.engine.status());
        session.engine.shutdown();
        session.dispatcher.shutdown();
        session.transport.lock().disconnect();
        self.stop_requested.store(false, Ordering::SeqCst);

        tracing::info!("Disconnected from {}", session.info.target);
        let _ = self
            .bus
            .publish(AppEvent::Connection(ConnectionEvent::Disconnected {
                target: session.info.target,
            }));
    }

    /// Start running `pattern` in the background.
    ///
    /// Requires `Connected`; progress arrives as execution events.
    pub fn execute(&self, pattern: impl Into<Arc<KnittingPattern>>) -> Result<()> {
        let (_, engine) = self.handles()?;
        engine.execute(pattern.into())
    }

    /// Hold the run before its next step
    pub fn pause(&self) -> Result<()> {
        self.guarded("pause", &[MachineState::Executing], MachineState::Paused)?;
        tracing::info!("Run paused");
        Ok(())
    }

    /// Continue a paused run
    pub fn resume(&self) -> Result<()> {
        self.guarded("resume", &[MachineState::Paused], MachineState::Executing)?;
        tracing::info!("Run resumed");
        Ok(())
    }

    /// End the current run and return to `Connected`.
    ///
    /// Does nothing unless a run is executing or paused.
    pub fn stop(&self) {
        if !self.state.current().is_running() {
            return;
        }
        let Ok((dispatcher, engine)) = self.handles() else {
            return;
        };
        tracing::info!("Stopping run");
        engine.request_stop(false);
        dispatcher.cancel_pending();
        if !engine.wait_idle(STOP_GRACE) {
            tracing::warn!("Run did not wind down within {:?}", STOP_GRACE);
        }
        self.state.transition_from(
            &[MachineState::Executing, MachineState::Paused],
            MachineState::Connected,
        );
        self.stop_requested.store(false, Ordering::SeqCst);
    }

    /// Halt the motor immediately and move to `Stopped`.
    ///
    /// The stop sequence is written straight to the transport, ahead of
    /// anything queued. Use [`Self::clear_stop`] before sending more work.
    pub fn emergency_stop(&self) -> Result<()> {
        let (dispatcher, engine) = self.handles()?;
        engine.request_stop(true);
        let cancelled = dispatcher.emergency_stop();
        tracing::warn!("Emergency stop sent, {} queued command(s) dropped", cancelled);
        if self.state.current().is_connected() {
            self.state.transition(MachineState::Stopped)?;
        }
        Ok(())
    }

    /// Leave `Stopped` and accept commands again
    pub fn clear_stop(&self) -> Result<()> {
        if let Ok((_, engine)) = self.handles() {
            engine.wait_idle(STOP_GRACE);
        }
        self.guarded("clear stop", &[MachineState::Stopped], MachineState::Connected)?;
        self.stop_requested.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Turn the shortest way to `needle`.
    ///
    /// The returned channel yields the command result; the tracked position
    /// moves only once the device confirms.
    pub fn move_to_needle(&self, needle: u32) -> Result<mpsc::Receiver<CommandResult>> {
        let (dispatcher, _) = self.handles()?;
        let state = self.state.current();
        if state != MachineState::Connected {
            return Err(ControllerError::InvalidState {
                operation: "move".to_string(),
                state: state.to_string(),
            }
            .into());
        }

        let (needles, direction) = self.tracker.lock().needles_to(needle);
        let (tx, rx) = mpsc::channel();
        if needles == 0 {
            let _ = tx.send(CommandResult::completed(
                Uuid::new_v4(),
                "",
                format!("already at needle {}", needle),
                Duration::ZERO,
            ));
            return Ok(rx);
        }

        let steps = u64::from(needles) * self.config.execution.steps_per_needle;
        let command = MotorCommand::Turn { steps, direction }.to_string();
        tracing::info!("Moving {} needles {} to needle {}", needles, direction, needle);

        let tracker = self.tracker.clone();
        let bus = Arc::clone(&self.bus);
        let callback: CommandCallback = Box::new(move |result: CommandResult| {
            if result.is_success() {
                let position = {
                    let mut tracker = tracker.lock();
                    tracker.apply_delta(u64::from(needles), direction);
                    tracker.position()
                };
                let _ = bus.publish(AppEvent::Machine(MachineEvent::NeedlePositionChanged {
                    position,
                }));
            }
            let _ = tx.send(result);
        });
        dispatcher.enqueue(command, Some(callback));
        Ok(rx)
    }

    /// Return to needle 0
    pub fn home(&self) -> Result<mpsc::Receiver<CommandResult>> {
        self.move_to_needle(0)
    }

    /// Declare the current position needle 0 and zero the device tally
    pub fn reset_needle_position(&self) {
        self.tracker.lock().reset();
        let _ = self
            .bus
            .publish(AppEvent::Machine(MachineEvent::NeedlePositionChanged { position: 0 }));
        if let Ok((dispatcher, _)) = self.handles() {
            dispatcher.enqueue(MotorCommand::ResetCount.to_string(), None);
        }
    }

    /// Queue a raw command line; returns whether it was accepted
    pub fn send_raw(&self, command: impl Into<String>, callback: Option<CommandCallback>) -> Result<bool> {
        let (dispatcher, _) = self.handles()?;
        Ok(dispatcher.enqueue(command, callback))
    }

    /// Route this controller's events to `listener`
    pub fn add_listener(&self, listener: Arc<dyn MachineListener>) -> MachineListenerHandle {
        attach_listener(&self.bus, listener)
    }

    /// Detach a listener added with [`Self::add_listener`]
    pub fn remove_listener(&self, handle: MachineListenerHandle) -> bool {
        detach_listener(&self.bus, handle)
    }

    /// Progress of the active or most recent run
    pub fn execution_status(&self) -> Option<ExecutionStatus> {
        match self.handles() {
            Ok((_, engine)) => engine.status().or_else(|| self.last_status.lock().clone()),
            Err(_) => self.last_status.lock().clone(),
        }
    }

    /// Everything an observer needs to draw the machine
    pub fn status_snapshot(&self) -> MachineStatusSnapshot {
        let (target, queue_len) = {
            let session = self.session.lock();
            match session.as_ref() {
                Some(s) => (Some(s.info.target.clone()), s.dispatcher.queue_len()),
                None => (None, 0),
            }
        };
        let (current_needle, needle_count) = {
            let tracker = self.tracker.lock();
            (tracker.position(), tracker.needle_count())
        };
        MachineStatusSnapshot {
            state: self.state.current(),
            target,
            current_needle,
            needle_count,
            queue_len,
            execution: self.execution_status(),
        }
    }

    /// Wait until no run is in progress; false on timeout
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        match self.handles() {
            Ok((_, engine)) => engine.wait_idle(timeout),
            Err(_) => true,
        }
    }

    fn handles(&self) -> Result<(Arc<CommandDispatcher>, Arc<ExecutionEngine>)> {
        self.session
            .lock()
            .as_ref()
            .map(|s| (Arc::clone(&s.dispatcher), Arc::clone(&s.engine)))
            .ok_or_else(|| ControllerError::NotConnected.into())
    }

    fn guarded(&self, operation: &str, expected: &[MachineState], to: MachineState) -> Result<()> {
        if self.state.transition_from(expected, to) {
            return Ok(());
        }
        Err(ControllerError::InvalidState {
            operation: operation.to_string(),
            state: self.state.current().to_string(),
        }
        .into())
    }

    fn remember_status(&self, status: Option<ExecutionStatus>) {
        if status.is_some() {
            *self.last_status.lock() = status;
        }
    }
}

impl Drop for KnittingController {
    fn drop(&mut self) {
        self.disconnect();
        for id in self.subscriptions.drain(..) {
            self.bus.unsubscribe(id);
        }
    }
}

impl std::fmt::Debug for KnittingController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KnittingController")
            .field("state", &self.state.current())
            .field("connection", &self.connection_info())
            .finish()
    }
}
