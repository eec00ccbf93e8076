//! Pattern execution engine
//!
//! A long-lived worker thread receives runs over a channel and walks each
//! pattern's steps for every repetition, sending one motion command per step
//! through the dispatcher and blocking (on its own thread) until the result
//! arrives. It never touches the transport.
//!
//! Step failures are recorded and the run continues. A link fault, a
//! configured failure ceiling, or a stop ends the run early.

use super::needle::NeedleTracker;
use super::state::StateMachine;
use crate::communication::dispatcher::{
    CancelToken, CommandDispatcher, CommandResult, CommandStatus,
};
use crate::communication::protocol::MotorCommand;
use knitkit_core::{
    AppEvent, CommandError, ControllerError, Error, EventBus, ExecutionEvent, ExecutionStatus,
    KnittingPattern, MachineEvent, MachineState, PatternError, PatternStep, Result, ThreadSafe,
};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// How a step is expressed on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MotionMode {
    /// `NEEDLE_TARGET:<needles>:<dir>`, counted by the needle sensor
    #[default]
    NeedleTarget,
    /// `TURN:<steps>:<dir>`, open-loop step count
    Turn,
}

/// Execution tuning
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionConfig {
    /// Wire form of each step
    pub motion_mode: MotionMode,
    /// Stepper steps per needle, for [`MotionMode::Turn`]
    pub steps_per_needle: u64,
    /// Longest wait for one step's result; past it the command is cancelled
    pub step_timeout: Duration,
    /// Failed steps tolerated before the run is aborted; `None` = unlimited
    pub max_failures: Option<usize>,
    /// Poll interval while paused
    pub pause_poll_interval: Duration,
    /// Pause between consecutive steps
    pub inter_step_delay: Duration,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            motion_mode: MotionMode::NeedleTarget,
            steps_per_needle: 1000,
            step_timeout: Duration::from_secs(30),
            max_failures: None,
            pause_poll_interval: Duration::from_millis(50),
            inter_step_delay: Duration::from_millis(100),
        }
    }
}

/// Wire command for one pattern step
pub fn step_command(step: &PatternStep, mode: MotionMode, steps_per_needle: u64) -> MotorCommand {
    let needles = step.total_needles();
    match mode {
        MotionMode::NeedleTarget => MotorCommand::NeedleTarget {
            needles,
            direction: step.direction(),
        },
        MotionMode::Turn => MotorCommand::Turn {
            steps: needles * steps_per_needle,
            direction: step.direction(),
        },
    }
}

enum EngineMessage {
    Run(Arc<KnittingPattern>),
    Shutdown,
}

enum RunOutcome {
    Completed,
    Cancelled,
    Aborted(String),
}

struct EngineShared {
    dispatcher: Arc<CommandDispatcher>,
    state: Arc<StateMachine>,
    tracker: ThreadSafe<NeedleTracker>,
    bus: Arc<EventBus>,
    stop_requested: Arc<AtomicBool>,
    hard_stop: AtomicBool,
    running: Mutex<bool>,
    idle: Condvar,
    status: Mutex<Option<ExecutionStatus>>,
    config: ExecutionConfig,
}

/// Runs patterns on a dedicated worker thread
pub struct ExecutionEngine {
    shared: Arc<EngineShared>,
    tx: mpsc::Sender<EngineMessage>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ExecutionEngine {
    /// Start the engine worker
    pub fn start(
        dispatcher: Arc<CommandDispatcher>,
        state: Arc<StateMachine>,
        tracker: ThreadSafe<NeedleTracker>,
        bus: Arc<EventBus>,
        stop_requested: Arc<AtomicBool>,
        config: ExecutionConfig,
    ) -> std::result::Result<Self, ControllerError> {
        let budget = dispatcher.config().chunk_budget();
        if config.step_timeout < budget {
            tracing::warn!(
                "Step timeout {:?} is shorter than the dispatcher's retry budget {:?}; \
                 slow steps will be cancelled before their last retry",
                config.step_timeout,
                budget
            );
        }

        let shared = Arc::new(EngineShared {
            dispatcher,
            state,
            tracker,
            bus,
            stop_requested,
            hard_stop: AtomicBool::new(false),
            running: Mutex::new(false),
            idle: Condvar::new(),
            status: Mutex::new(None),
            config,
        });

        let (tx, rx) = mpsc::channel();
        let worker_shared = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name("knitkit-engine".to_string())
            .spawn(move || {
                while let Ok(EngineMessage::Run(pattern)) = rx.recv() {
                    worker_shared.run(&pattern);
                }
                tracing::debug!("Execution worker stopped");
            })
            .map_err(|e| ControllerError::WorkerUnavailable(e.to_string()))?;

        Ok(Self {
            shared,
            tx,
            worker: Mutex::new(Some(handle)),
        })
    }

    /// Start running `pattern`; returns as soon as the run is handed over.
    ///
    /// Requires `Connected`. An empty pattern is refused without any state
    /// change.
    pub fn execute(&self, pattern: Arc<KnittingPattern>) -> Result<()> {
        if pattern.steps().is_empty() {
            return Err(PatternError::EmptyPattern(pattern.name().to_string()).into());
        }

        let refuse = || -> Error {
            ControllerError::InvalidState {
                operation: "execute".to_string(),
                state: self.shared.state.current().to_string(),
            }
            .into()
        };
        if self.is_running() {
            return Err(refuse());
        }
        if !self
            .shared
            .state
            .transition_from(&[MachineState::Connected], MachineState::Executing)
        {
            return Err(refuse());
        }
        *self.shared.running.lock() = true;

        self.shared.stop_requested.store(false, Ordering::SeqCst);
        self.shared.hard_stop.store(false, Ordering::SeqCst);
        *self.shared.status.lock() = Some(ExecutionStatus::for_pattern(&pattern));

        tracing::info!(
            "Executing '{}': {} steps x {} repetitions, {} needles",
            pattern.name(),
            pattern.step_count(),
            pattern.repetitions(),
            pattern.total_needles()
        );

        if self.tx.send(EngineMessage::Run(pattern)).is_err() {
            self.shared.finish_run();
            self.shared
                .state
                .transition_from(&[MachineState::Executing], MachineState::Connected);
            return Err(Error::Controller(ControllerError::WorkerUnavailable(
                "execution worker has exited".to_string(),
            )));
        }
        Ok(())
    }

    /// Ask the running pattern to end at the next step or chunk boundary.
    ///
    /// With `hard` the run ends in `Stopped` instead of `Connected`.
    pub fn request_stop(&self, hard: bool) {
        if hard {
            self.shared.hard_stop.store(true, Ordering::SeqCst);
        }
        self.shared.stop_requested.store(true, Ordering::SeqCst);
    }

    /// Whether a run is in progress
    pub fn is_running(&self) -> bool {
        *self.shared.running.lock()
    }

    /// Wait until no run is in progress; false on timeout
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut running = self.shared.running.lock();
        while *running {
            if self
                .shared
                .idle
                .wait_until(&mut running, deadline)
                .timed_out()
            {
                return !*running;
            }
        }
        true
    }

    /// Progress of the active or most recent run
    pub fn status(&self) -> Option<ExecutionStatus> {
        self.shared.status.lock().clone()
    }

    /// Stop the worker thread after the current run
    pub fn shutdown(&self) {
        let handle = self.worker.lock().take();
        let Some(handle) = handle else {
            return;
        };
        self.request_stop(false);
        let _ = self.tx.send(EngineMessage::Shutdown);
        if handle.thread().id() == std::thread::current().id() {
            return;
        }
        if handle.join().is_err() {
            tracing::error!("Execution worker panicked");
        }
    }
}

impl Drop for ExecutionEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl EngineShared {
    fn stopping(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    fn publish(&self, event: ExecutionEvent) {
        let _ = self.bus.publish(AppEvent::Execution(event));
    }

    fn store(&self, status: &ExecutionStatus) {
        *self.status.lock() = Some(status.clone());
    }

    fn finish_run(&self) {
        *self.running.lock() = false;
        self.idle.notify_all();
    }

    /// Hold while paused; false if the run should end instead
    fn wait_while_paused(&self) -> bool {
        loop {
            if self.stopping() {
                return false;
            }
            match self.state.current() {
                MachineState::Executing => return true,
                MachineState::Paused => std::thread::sleep(self.config.pause_poll_interval),
                _ => return false,
            }
        }
    }

    fn sleep_unless_stopped(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.stopping() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            std::thread::sleep(self.config.pause_poll_interval.min(deadline - now));
        }
    }

    /// Submit one step and wait for its result on this thread.
    ///
    /// A step that outlives `step_timeout` is cancelled in the dispatcher and
    /// its final result awaited, so nothing from this step is still on the
    /// wire when the next one starts.
    fn dispatch_step(&self, command: &str) -> CommandResult {
        let (tx, rx) = mpsc::channel();
        let cancel = CancelToken::new();
        self.dispatcher.enqueue_cancellable(
            command,
            cancel.clone(),
            Some(Box::new(move |result| {
                let _ = tx.send(result);
            })),
        );

        let result = match rx.recv_timeout(self.config.step_timeout) {
            Ok(result) => return result,
            Err(mpsc::RecvTimeoutError::Disconnected) => None,
            Err(mpsc::RecvTimeoutError::Timeout) => {
                tracing::warn!(
                    "'{}' still running after {:?}, cancelling it",
                    command,
                    self.config.step_timeout
                );
                cancel.cancel();
                rx.recv().ok()
            }
        };

        match result {
            // The device may have finished before the cancel was seen.
            Some(result) if result.is_success() || result.status == CommandStatus::Failed => {
                result
            }
            Some(result) if !self.stopping() => CommandResult::unsuccessful(
                result.id,
                command,
                CommandError::StepTimeout {
                    command: command.to_string(),
                    timeout_ms: self.config.step_timeout.as_millis() as u64,
                },
                result.execution_time,
            ),
            _ => CommandResult::unsuccessful(
                Uuid::new_v4(),
                command,
                CommandError::Cancelled {
                    command: command.to_string(),
                },
                Duration::ZERO,
            ),
        }
    }

    fn run(&self, pattern: &KnittingPattern) {
        let mut status = ExecutionStatus::for_pattern(pattern);
        self.store(&status);
        self.publish(ExecutionEvent::Started(status.clone()));

        let started = Instant::now();
        let mut attempted = 0usize;
        let outcome = self.run_steps(pattern, &mut status, started, &mut attempted);

        match &outcome {
            RunOutcome::Completed => {
                tracing::info!(
                    "Pattern '{}' finished: {}/{} steps, {} error(s)",
                    status.pattern_name,
                    status.current_step,
                    status.total_steps,
                    status.errors.len()
                );
                status.estimated_time_remaining = Duration::ZERO;
                self.store(&status);
                self.publish(ExecutionEvent::Completed(status.clone()));
                self.state.transition_from(
                    &[MachineState::Executing, MachineState::Paused],
                    MachineState::Connected,
                );
            }
            RunOutcome::Cancelled => {
                let target = if self.hard_stop.load(Ordering::SeqCst) {
                    MachineState::Stopped
                } else {
                    MachineState::Connected
                };
                tracing::info!(
                    "Pattern '{}' cancelled after {} of {} steps",
                    status.pattern_name,
                    status.current_step,
                    status.total_steps
                );
                self.publish(ExecutionEvent::Cancelled(status.clone()));
                status.current_step = 0;
                status.current_repetition = 0;
                status.estimated_time_remaining = Duration::ZERO;
                self.store(&status);
                self.state.transition_from(
                    &[MachineState::Executing, MachineState::Paused],
                    target,
                );
            }
            RunOutcome::Aborted(reason) => {
                tracing::error!("Pattern '{}' aborted: {}", status.pattern_name, reason);
                status.estimated_time_remaining = Duration::ZERO;
                self.store(&status);
                self.publish(ExecutionEvent::Aborted {
                    reason: reason.clone(),
                    status: status.clone(),
                });
                if self.state.current() != MachineState::Disconnected {
                    let _ = self.state.transition(MachineState::Error);
                }
            }
        }

        self.finish_run();
    }

    fn run_steps(
        &self,
        pattern: &KnittingPattern,
        status: &mut ExecutionStatus,
        started: Instant,
        attempted: &mut usize,
    ) -> RunOutcome {
        for repetition in 0..pattern.repetitions() {
            status.current_repetition = repetition + 1;
            for (index, step) in pattern.steps().iter().enumerate() {
                if !self.wait_while_paused() {
                    return RunOutcome::Cancelled;
                }
                if *attempted > 0 && !self.sleep_unless_stopped(self.config.inter_step_delay) {
                    return RunOutcome::Cancelled;
                }
                if !self.wait_while_paused() {
                    return RunOutcome::Cancelled;
                }

                let command =
                    step_command(step, self.config.motion_mode, self.config.steps_per_needle)
                        .to_string();
                tracing::debug!(
                    "Repetition {}/{} step {}/{}: {}",
                    repetition + 1,
                    pattern.repetitions(),
                    index + 1,
                    pattern.step_count(),
                    command
                );

                let result = self.dispatch_step(&command);
                *attempted += 1;

                let average = started.elapsed() / *attempted as u32;
                let remaining = status.total_steps.saturating_sub(*attempted) as u32;
                status.estimated_time_remaining = average * remaining;

                if result.is_success() {
                    status.current_step += 1;
                    status.needles_completed += step.total_needles();
                    let position = {
                        let mut tracker = self.tracker.lock();
                        tracker.apply_delta(step.total_needles(), step.direction());
                        tracker.position()
                    };
                    self.store(status);
                    self.publish(ExecutionEvent::Progress(status.clone()));
                    let _ = self.bus.publish(AppEvent::Machine(
                        MachineEvent::NeedlePositionChanged { position },
                    ));
                    continue;
                }

                if result.status == CommandStatus::Cancelled || self.stopping() {
                    return RunOutcome::Cancelled;
                }
                if result.is_connection_fault() {
                    status.errors.push(format!("Connection lost: {}", result.error));
                    return RunOutcome::Aborted(result.error);
                }

                let message = format!(
                    "Step {} of repetition {} ({}): {}",
                    index + 1,
                    repetition + 1,
                    command,
                    result.error
                );
                tracing::warn!("{}", message);
                status.errors.push(message.clone());
                self.store(status);
                self.publish(ExecutionEvent::StepFailed {
                    message,
                    status: status.clone(),
                });

                if let Some(limit) = self.config.max_failures {
                    if status.errors.len() > limit {
                        return RunOutcome::Aborted(
                            ControllerError::FailureThresholdExceeded {
                                failures: status.errors.len(),
                                limit,
                            }
                            .to_string(),
                        );
                    }
                }
            }
        }
        RunOutcome::Completed
    }
}
