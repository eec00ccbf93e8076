//! Single-flight command dispatcher
//!
//! One worker thread drains a FIFO queue and owns the conversation with the
//! device: at most one command (and within it, one chunk) is in flight at a
//! time. Each chunk is written, then the worker polls for a terminal
//! response, retrying on timeout. A command that never gets an answer is
//! reported as `Failed`, never as `Completed`.
//!
//! Input left over from an earlier command is cleared before every write,
//! so a late reply can never be taken as the answer to the next command.
//!
//! The transport is shared behind a mutex that the worker only holds for
//! one short read slice at a time, so [`CommandDispatcher::emergency_stop`]
//! can interleave its writes with an in-flight wait.

use super::chunker::chunk_command;
use super::protocol::EMERGENCY_STOP_SEQUENCE;
use super::response::{interpret, ResponseKind};
use super::Transport;
use knitkit_core::{
    AppEvent, CommandError, ConnectionError, ConnectionEvent, ControllerError, ErrorEvent,
    EventBus, MachineEvent, OnceCallback, ThreadSafe,
};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Transport shared between the dispatcher worker and emergency stop
pub type SharedTransport = ThreadSafe<Box<dyn Transport>>;

/// Completion callback for a queued command
pub type CommandCallback = OnceCallback<CommandResult>;

/// Lifecycle of a dispatched command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandStatus {
    /// Waiting in the queue
    Pending,
    /// Being written or awaiting a response
    Executing,
    /// The device reported completion for every chunk
    Completed,
    /// Rejected, timed out, or the link failed
    Failed,
    /// Dropped by a stop before it finished
    Cancelled,
}

/// Outcome of one dispatched command
#[derive(Debug, Clone)]
pub struct CommandResult {
    /// Correlation id assigned at enqueue time
    pub id: Uuid,
    /// The command as submitted (before chunking)
    pub command: String,
    /// Final status
    pub status: CommandStatus,
    /// Last terminal response line received
    pub response: String,
    /// Failure description, empty on success
    pub error: String,
    /// Typed failure, `None` on success
    pub failure: Option<CommandError>,
    /// Wall time from dequeue to result
    pub execution_time: Duration,
}

impl CommandResult {
    pub(crate) fn completed(id: Uuid, command: &str, response: String, elapsed: Duration) -> Self {
        Self {
            id,
            command: command.to_string(),
            status: CommandStatus::Completed,
            response,
            error: String::new(),
            failure: None,
            execution_time: elapsed,
        }
    }

    pub(crate) fn unsuccessful(
        id: Uuid,
        command: &str,
        failure: CommandError,
        elapsed: Duration,
    ) -> Self {
        let status = match failure {
            CommandError::Cancelled { .. } => CommandStatus::Cancelled,
            _ => CommandStatus::Failed,
        };
        let response = match &failure {
            CommandError::Rejected { response, .. } => response.clone(),
            _ => String::new(),
        };
        Self {
            id,
            command: command.to_string(),
            status,
            response,
            error: failure.to_string(),
            failure: Some(failure),
            execution_time: elapsed,
        }
    }

    /// Whether the command completed
    pub fn is_success(&self) -> bool {
        self.status == CommandStatus::Completed
    }

    /// Whether the failure was the link itself going away
    pub fn is_connection_fault(&self) -> bool {
        self.failure
            .as_ref()
            .is_some_and(CommandError::is_connection_fault)
    }
}

/// Cancellation flag for a single queued command
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Create a token that is not cancelled
    pub fn new() -> Self {
        Self::default()
    }

    /// Abandon the command at its next poll, or before it starts if queued
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether [`cancel`](Self::cancel) has been called
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Dispatcher tuning
#[derive(Debug, Clone, PartialEq)]
pub struct DispatcherConfig {
    /// Largest `TURN` step count sent in one line
    pub max_chunk_size: u64,
    /// How long to wait for a terminal response per attempt
    pub response_timeout: Duration,
    /// Extra attempts after a timeout
    pub max_retries: u32,
    /// Pause before each retry
    pub retry_delay: Duration,
    /// Pause between chunks of one command
    pub settle_delay: Duration,
    /// Read slice while waiting for a response
    pub poll_interval: Duration,
    /// Queue length beyond which `enqueue` refuses
    pub queue_capacity: usize,
    /// Rounds of stop commands written by an emergency stop
    pub emergency_stop_repeats: u32,
}

impl DispatcherConfig {
    /// Longest a single chunk can take to fail: every attempt's response
    /// window plus the pauses between them
    pub fn chunk_budget(&self) -> Duration {
        self.response_timeout * (self.max_retries + 1) + self.retry_delay * self.max_retries
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_chunk_size: 16000,
            response_timeout: Duration::from_secs(10),
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
            settle_delay: Duration::from_millis(200),
            poll_interval: Duration::from_millis(50),
            queue_capacity: 100,
            emergency_stop_repeats: 3,
        }
    }
}

struct QueuedCommand {
    id: Uuid,
    command: String,
    cancel: CancelToken,
    callback: Option<CommandCallback>,
}

struct Inner {
    transport: SharedTransport,
    queue: Mutex<VecDeque<QueuedCommand>>,
    wake: Condvar,
    busy: AtomicBool,
    shutdown: AtomicBool,
    stop_requested: Arc<AtomicBool>,
    bus: Arc<EventBus>,
    config: DispatcherConfig,
}

/// Queue-draining command sender
pub struct CommandDispatcher {
    inner: Arc<Inner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl CommandDispatcher {
    /// Start the worker thread.
    ///
    /// `stop_requested` is the cancellation flag shared with the execution
    /// engine; the dispatcher only reads it.
    pub fn start(
        transport: SharedTransport,
        bus: Arc<EventBus>,
        stop_requested: Arc<AtomicBool>,
        config: DispatcherConfig,
    ) -> Result<Self, ControllerError> {
        let inner = Arc::new(Inner {
            transport,
            queue: Mutex::new(VecDeque::new()),
            wake: Condvar::new(),
            busy: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            stop_requested,
            bus,
            config,
        });

        let worker_inner = Arc::clone(&inner);
        let handle = std::thread::Builder::new()
            .name("knitkit-dispatcher".to_string())
            .spawn(move || worker_inner.run())
            .map_err(|e| ControllerError::WorkerUnavailable(e.to_string()))?;

        Ok(Self {
            inner,
            worker: Mutex::new(Some(handle)),
        })
    }

    /// Queue `command`; `callback` receives its result on the worker thread.
    ///
    /// Returns false, after handing the callback a `Failed` result, if the
    /// transport is down or the queue is full.
    pub fn enqueue(&self, command: impl Into<String>, callback: Option<CommandCallback>) -> bool {
        self.enqueue_cancellable(command, CancelToken::new(), callback)
    }

    /// Like [`enqueue`](Self::enqueue), with a token that cancels only this
    /// command.
    pub fn enqueue_cancellable(
        &self,
        command: impl Into<String>,
        cancel: CancelToken,
        callback: Option<CommandCallback>,
    ) -> bool {
        let command = command.into();
        let id = Uuid::new_v4();

        let refusal = if !self.inner.transport.lock().is_connected() {
            Some(CommandError::NotConnected)
        } else {
            // Checked under the queue lock so the worker's final drain sees
            // anything pushed before shutdown.
            let mut queue = self.inner.queue.lock();
            if self.inner.shutdown.load(Ordering::SeqCst) {
                Some(CommandError::NotConnected)
            } else if queue.len() >= self.inner.config.queue_capacity {
                Some(CommandError::QueueFull {
                    capacity: self.inner.config.queue_capacity,
                })
            } else {
                tracing::debug!("Queued '{}' ({})", command, id);
                queue.push_back(QueuedCommand {
                    id,
                    command: command.clone(),
                    cancel,
                    callback,
                });
                self.inner.wake.notify_one();
                return true;
            }
        };

        if let Some(failure) = refusal {
            tracing::warn!("Refused '{}': {}", command, failure);
            if let Some(cb) = callback {
                cb(CommandResult::unsuccessful(id, &command, failure, Duration::ZERO));
            }
        }
        false
    }

    /// Queue `command` and get its result through a channel
    pub fn submit(&self, command: impl Into<String>) -> mpsc::Receiver<CommandResult> {
        let (tx, rx) = mpsc::channel();
        self.enqueue(
            command,
            Some(Box::new(move |result| {
                let _ = tx.send(result);
            })),
        );
        rx
    }

    /// Write the stop sequence directly, then cancel everything queued.
    ///
    /// Also raises the shared stop flag so the command in flight is
    /// abandoned at its next poll.
    pub fn emergency_stop(&self) -> usize {
        self.inner.stop_requested.store(true, Ordering::SeqCst);
        tracing::warn!("Emergency stop");

        for _ in 0..self.inner.config.emergency_stop_repeats.max(1) {
            for command in EMERGENCY_STOP_SEQUENCE.iter() {
                let line = command.to_string();
                let mut transport = self.inner.transport.lock();
                if let Err(e) = transport.write_line(&line) {
                    tracing::error!("Emergency stop write '{}' failed: {}", line, e);
                }
            }
        }
        let _ = self
            .inner
            .bus
            .publish(AppEvent::Machine(MachineEvent::EmergencyStop));

        self.cancel_pending()
    }

    /// Cancel every queued command; returns how many were dropped
    pub fn cancel_pending(&self) -> usize {
        let drained: Vec<QueuedCommand> = self.inner.queue.lock().drain(..).collect();
        let count = drained.len();
        for job in drained {
            self.inner.finish(CommandResult::unsuccessful(
                job.id,
                &job.command,
                CommandError::Cancelled {
                    command: job.command.clone(),
                },
                Duration::ZERO,
            ), job.callback);
        }
        if count > 0 {
            tracing::info!("Cancelled {} queued command(s)", count);
        }
        count
    }

    /// Commands waiting behind the one in flight
    pub fn queue_len(&self) -> usize {
        self.inner.queue.lock().len()
    }

    /// Whether nothing is queued or in flight
    pub fn is_idle(&self) -> bool {
        !self.inner.busy.load(Ordering::SeqCst) && self.inner.queue.lock().is_empty()
    }

    /// Dispatcher tuning in effect
    pub fn config(&self) -> &DispatcherConfig {
        &self.inner.config
    }

    /// Stop the worker, cancelling anything still queued, and join it
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        {
            let _queue = self.inner.queue.lock();
            self.inner.wake.notify_all();
        }
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() == std::thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                tracing::error!("Dispatcher worker panicked");
            }
        }
    }
}

impl Drop for CommandDispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Inner {
    fn run(&self) {
        tracing::debug!("Dispatcher worker started");
        loop {
            let job = {
                let mut queue = self.queue.lock();
                loop {
                    if self.shutdown.load(Ordering::SeqCst) {
                        break None;
                    }
                    if let Some(job) = queue.pop_front() {
                        self.busy.store(true, Ordering::SeqCst);
                        break Some(job);
                    }
                    self.wake.wait(&mut queue);
                }
            };

            let Some(job) = job else { break };
            let result = self.execute(job.id, &job.command, &job.cancel);
            self.finish(result, job.callback);
            self.busy.store(false, Ordering::SeqCst);
        }

        let leftovers: Vec<QueuedCommand> = self.queue.lock().drain(..).collect();
        for job in leftovers {
            let cancelled = CommandError::Cancelled {
                command: job.command.clone(),
            };
            self.finish(
                CommandResult::unsuccessful(job.id, &job.command, cancelled, Duration::ZERO),
                job.callback,
            );
        }
        tracing::debug!("Dispatcher worker stopped");
    }

    fn finish(&self, result: CommandResult, callback: Option<CommandCallback>) {
        match result.status {
            CommandStatus::Completed => {
                tracing::debug!("'{}' completed in {:?}", result.command, result.execution_time)
            }
            CommandStatus::Cancelled => tracing::info!("'{}' cancelled", result.command),
            _ => {
                tracing::error!("'{}' failed: {}", result.command, result.error);
                let _ = self.bus.publish(AppEvent::Error(ErrorEvent::CommandFailed {
                    command: result.command.clone(),
                    error: result.error.clone(),
                }));
            }
        }
        if let Some(cb) = callback {
            cb(result);
        }
    }

    fn should_abort(&self, cancel: &CancelToken) -> bool {
        cancel.is_cancelled()
            || self.stop_requested.load(Ordering::SeqCst)
            || self.shutdown.load(Ordering::SeqCst)
    }

    /// Sleep up to `duration`, waking early on a stop; false if stopped
    fn pause(&self, duration: Duration, cancel: &CancelToken) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.should_abort(cancel) {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            std::thread::sleep(self.config.poll_interval.min(deadline - now));
        }
    }

    fn execute(&self, id: Uuid, command: &str, cancel: &CancelToken) -> CommandResult {
        let started = Instant::now();
        let chunks = chunk_command(command, self.config.max_chunk_size);
        let total = chunks.len();
        if total > 1 {
            tracing::info!("Splitting '{}' into {} chunks", command, total);
        }

        let mut response = String::new();
        for (index, chunk) in chunks.iter().enumerate() {
            let outcome = if index > 0 && !self.pause(self.config.settle_delay, cancel) {
                Err(CommandError::Cancelled {
                    command: chunk.clone(),
                })
            } else {
                self.send_chunk(chunk, cancel)
            };

            match outcome {
                Ok(line) => response = line,
                Err(e) => {
                    let failure = match e {
                        CommandError::Cancelled { .. } => CommandError::Cancelled {
                            command: command.to_string(),
                        },
                        CommandError::Connection(_) => e,
                        other if total > 1 => CommandError::ChunkFailure {
                            command: command.to_string(),
                            failed_chunk: index + 1,
                            total_chunks: total,
                            completed_chunks: index,
                            reason: other.to_string(),
                        },
                        other => other,
                    };
                    return CommandResult::unsuccessful(id, command, failure, started.elapsed());
                }
            }
        }
        CommandResult::completed(id, command, response, started.elapsed())
    }

    fn send_chunk(&self, chunk: &str, cancel: &CancelToken) -> Result<String, CommandError> {
        let attempts = self.config.max_retries + 1;
        for attempt in 1..=attempts {
            if self.should_abort(cancel) {
                return Err(CommandError::Cancelled {
                    command: chunk.to_string(),
                });
            }
            if attempt > 1 {
                tracing::warn!(
                    "No response to '{}', retrying ({}/{})",
                    chunk,
                    attempt - 1,
                    self.config.max_retries
                );
                if !self.pause(self.config.retry_delay, cancel) {
                    return Err(CommandError::Cancelled {
                        command: chunk.to_string(),
                    });
                }
            }

            let written = {
                let mut transport = self.transport.lock();
                transport
                    .clear_input()
                    .and_then(|stale| transport.write_line(chunk).map(|_| stale))
            };
            let stale = written.map_err(|e| self.link_fault(e))?;
            for line in stale {
                self.discard_stale(line, chunk);
            }
            tracing::debug!("-> {}", chunk);

            match self.await_terminal(chunk, cancel)? {
                Some((ResponseKind::Completion, line)) => return Ok(line),
                Some((_, line)) => {
                    return Err(CommandError::Rejected {
                        command: chunk.to_string(),
                        response: line,
                    })
                }
                None => continue,
            }
        }
        Err(CommandError::Timeout {
            command: chunk.to_string(),
            attempts,
            timeout_ms: self.config.response_timeout.as_millis() as u64,
        })
    }

    /// Route a line that arrived before `chunk` was written
    fn discard_stale(&self, line: String, chunk: &str) {
        match interpret(&line) {
            ResponseKind::Device(message) => {
                tracing::debug!("<- {} (before '{}')", line, chunk);
                let _ = self.bus.publish(AppEvent::Device(message));
            }
            ResponseKind::Informational | ResponseKind::Corrupted => {
                tracing::debug!("Discarding '{}' before '{}'", line, chunk)
            }
            _ => tracing::warn!("Discarding stale '{}' before '{}'", line, chunk),
        }
    }

    /// Poll for a completion or failure line; `None` on timeout
    fn await_terminal(
        &self,
        chunk: &str,
        cancel: &CancelToken,
    ) -> Result<Option<(ResponseKind, String)>, CommandError> {
        let deadline = Instant::now() + self.config.response_timeout;
        loop {
            if self.should_abort(cancel) {
                return Err(CommandError::Cancelled {
                    command: chunk.to_string(),
                });
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let slice = self.config.poll_interval.min(deadline - now);
            let received = self.transport.lock().read_line(slice);
            let Some(line) = received.map_err(|e| self.link_fault(e))? else {
                continue;
            };

            match interpret(&line) {
                ResponseKind::Corrupted => {
                    tracing::warn!(
                        "Discarding {} while waiting on '{}'",
                        CommandError::CorruptedResponse { line: line.clone() },
                        chunk
                    );
                    let _ = self
                        .bus
                        .publish(AppEvent::Error(ErrorEvent::CorruptedResponse { line }));
                }
                ResponseKind::Device(message) => {
                    tracing::debug!("<- {}", line);
                    let _ = self.bus.publish(AppEvent::Device(message));
                }
                ResponseKind::Informational => tracing::debug!("<- {} (info)", line),
                kind => {
                    tracing::debug!("<- {}", line);
                    return Ok(Some((kind, line)));
                }
            }
        }
    }

    fn link_fault(&self, e: ConnectionError) -> CommandError {
        if e != ConnectionError::NotConnected {
            let _ = self
                .bus
                .publish(AppEvent::Connection(ConnectionEvent::Lost {
                    reason: e.to_string(),
                }));
        }
        CommandError::Connection(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::communication::simulated::{SimulatedTransport, SimulatorHandle};
    use crate::communication::TransportParams;
    use knitkit_core::{thread_safe, DeviceMessage, EventCategory, EventFilter};

    fn fast_config() -> DispatcherConfig {
        DispatcherConfig {
            response_timeout: Duration::from_millis(60),
            retry_delay: Duration::from_millis(5),
            settle_delay: Duration::from_millis(1),
            poll_interval: Duration::from_millis(5),
            max_chunk_size: 5000,
            ..Default::default()
        }
    }

    fn setup(config: DispatcherConfig) -> (CommandDispatcher, SimulatorHandle, Arc<EventBus>) {
        let (dispatcher, handle, bus, _stop) = setup_with_stop(config);
        (dispatcher, handle, bus)
    }

    fn setup_with_stop(
        config: DispatcherConfig,
    ) -> (CommandDispatcher, SimulatorHandle, Arc<EventBus>, Arc<AtomicBool>) {
        let mut sim = SimulatedTransport::new();
        sim.connect(&TransportParams::simulated()).unwrap();
        let handle = sim.handle();
        let bus = Arc::new(EventBus::new());
        let stop = Arc::new(AtomicBool::new(false));
        let transport: SharedTransport = thread_safe(Box::new(sim));
        let dispatcher =
            CommandDispatcher::start(transport, bus.clone(), stop.clone(), config).unwrap();
        (dispatcher, handle, bus, stop)
    }

    fn submit_cancellable(
        dispatcher: &CommandDispatcher,
        command: &str,
        cancel: &CancelToken,
    ) -> mpsc::Receiver<CommandResult> {
        let (tx, rx) = mpsc::channel();
        dispatcher.enqueue_cancellable(
            command,
            cancel.clone(),
            Some(Box::new(move |result| {
                let _ = tx.send(result);
            })),
        );
        rx
    }

    fn recv(rx: mpsc::Receiver<CommandResult>) -> CommandResult {
        rx.recv_timeout(Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn test_completes_and_chunks_in_order() {
        let (dispatcher, sim, _bus) = setup(fast_config());
        let result = recv(dispatcher.submit("TURN:12000:CW"));
        assert_eq!(result.status, CommandStatus::Completed);
        assert_eq!(result.response, "DONE");
        assert_eq!(sim.written(), ["TURN:5000:CW", "TURN:5000:CW", "TURN:2000:CW"]);
    }

    #[test]
    fn test_rejection_is_not_retried() {
        let (dispatcher, sim, _bus) = setup(fast_config());
        let result = recv(dispatcher.submit("LEVITATE"));
        assert_eq!(result.status, CommandStatus::Failed);
        assert!(matches!(result.failure, Some(CommandError::Rejected { .. })));
        assert_eq!(sim.written().len(), 1);
    }

    #[test]
    fn test_timeout_retries_then_fails() {
        let (dispatcher, sim, _bus) = setup(fast_config());
        sim.silence_next(10);
        let result = recv(dispatcher.submit("TURN:10:CW"));
        assert_eq!(result.status, CommandStatus::Failed);
        assert!(matches!(
            result.failure,
            Some(CommandError::Timeout { attempts: 4, .. })
        ));
        assert_eq!(sim.written().len(), 4);
    }

    #[test]
    fn test_retry_recovers() {
        let (dispatcher, sim, _bus) = setup(fast_config());
        sim.silence_next(1);
        let result = recv(dispatcher.submit("TURN:10:CW"));
        assert!(result.is_success());
        assert_eq!(sim.written(), ["TURN:10:CW", "TURN:10:CW"]);
    }

    #[test]
    fn test_late_reply_does_not_complete_next_command() {
        let config = DispatcherConfig {
            response_timeout: Duration::from_millis(100),
            max_retries: 0,
            ..fast_config()
        };
        let (dispatcher, sim, _bus) = setup(config);
        sim.set_response_delay(Duration::from_millis(150));
        let first = recv(dispatcher.submit("TURN:10:CW"));
        assert_eq!(first.status, CommandStatus::Failed);

        sim.set_response_delay(Duration::ZERO);
        let second = recv(dispatcher.submit("LEVITATE"));
        assert_eq!(second.status, CommandStatus::Failed);
        assert!(matches!(second.failure, Some(CommandError::Rejected { .. })));
        assert_eq!(second.response, "ERROR: Unknown command");
    }

    #[test]
    fn test_retry_ignores_reply_to_earlier_attempt() {
        let config = DispatcherConfig {
            response_timeout: Duration::from_millis(100),
            max_retries: 1,
            ..fast_config()
        };
        let (dispatcher, sim, _bus) = setup(config);
        sim.set_response_delay(Duration::from_millis(150));
        let result = recv(dispatcher.submit("TURN:10:CW"));
        assert_eq!(result.status, CommandStatus::Failed);
        assert!(matches!(
            result.failure,
            Some(CommandError::Timeout { attempts: 2, .. })
        ));
    }

    #[test]
    fn test_stale_needle_count_is_still_published() {
        let (dispatcher, sim, bus) = setup(fast_config());
        let seen = thread_safe(Vec::new());
        let s = seen.clone();
        bus.subscribe(
            EventFilter::Categories(vec![EventCategory::Device]),
            move |event| {
                if let AppEvent::Device(m) = event {
                    s.lock().push(m);
                }
            },
        );
        sim.inject_line("Needle count: 9");
        sim.inject_line("DONE");
        sim.script_reply(["ERROR: jammed"]);
        let result = recv(dispatcher.submit("TURN:10:CW"));
        assert!(matches!(result.failure, Some(CommandError::Rejected { .. })));
        assert_eq!(seen.lock().as_slice(), &[DeviceMessage::NeedleCount(9)]);
    }

    #[test]
    fn test_stop_between_chunks_leaves_rest_unsent() {
        let config = DispatcherConfig {
            max_chunk_size: 10,
            response_timeout: Duration::from_secs(1),
            ..fast_config()
        };
        let (dispatcher, sim, _bus, stop) = setup_with_stop(config);
        sim.set_response_delay(Duration::from_millis(60));
        let rx = dispatcher.submit("TURN:50:CW");
        std::thread::sleep(Duration::from_millis(150));
        stop.store(true, Ordering::SeqCst);

        let result = recv(rx);
        assert_eq!(result.status, CommandStatus::Cancelled);
        let written = sim.written();
        assert!(!written.is_empty() && written.len() < 5, "{:?}", written);
        assert!(written.iter().all(|l| l == "TURN:10:CW"));

        std::thread::sleep(Duration::from_millis(150));
        assert_eq!(sim.written(), written);
    }

    #[test]
    fn test_settle_delay_between_chunks() {
        let config = DispatcherConfig {
            max_chunk_size: 10,
            settle_delay: Duration::from_millis(80),
            ..fast_config()
        };
        let (dispatcher, sim, _bus) = setup(config);
        let result = recv(dispatcher.submit("TURN:30:CCW"));
        assert!(result.is_success());
        assert_eq!(sim.written().len(), 3);
        assert!(result.execution_time >= Duration::from_millis(160));
    }

    #[test]
    fn test_cancel_token_abandons_only_its_command() {
        let config = DispatcherConfig {
            response_timeout: Duration::from_secs(2),
            ..fast_config()
        };
        let (dispatcher, sim, _bus, stop) = setup_with_stop(config);
        sim.silence_next(1);
        let cancel = CancelToken::new();
        let first = submit_cancellable(&dispatcher, "TURN:10:CW", &cancel);
        let queued = CancelToken::new();
        let second = submit_cancellable(&dispatcher, "TURN:20:CW", &queued);
        let third = dispatcher.submit("TURN:30:CW");
        queued.cancel();
        std::thread::sleep(Duration::from_millis(50));
        cancel.cancel();

        assert_eq!(recv(first).status, CommandStatus::Cancelled);
        assert_eq!(recv(second).status, CommandStatus::Cancelled);
        assert!(recv(third).is_success());
        assert!(!stop.load(Ordering::SeqCst));
        assert_eq!(sim.written(), ["TURN:10:CW", "TURN:30:CW"]);
    }

    #[test]
    fn test_chunk_budget() {
        let config = DispatcherConfig {
            response_timeout: Duration::from_secs(10),
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
            ..DispatcherConfig::default()
        };
        assert_eq!(config.chunk_budget(), Duration::from_secs(43));
    }

    #[test]
    fn test_chunk_failure_reports_progress() {
        let (dispatcher, sim, _bus) = setup(fast_config());
        sim.script_reply(["DONE"]);
        sim.script_reply(["ERROR: stalled"]);
        let result = recv(dispatcher.submit("TURN:12000:CCW"));
        assert_eq!(result.status, CommandStatus::Failed);
        match result.failure {
            Some(CommandError::ChunkFailure {
                failed_chunk,
                total_chunks,
                completed_chunks,
                ..
            }) => {
                assert_eq!((failed_chunk, total_chunks, completed_chunks), (2, 3, 1));
            }
            other => panic!("unexpected failure {:?}", other),
        }
        assert_eq!(sim.written().len(), 2);
    }

    #[test]
    fn test_corrupted_and_device_lines_do_not_complete() {
        let (dispatcher, sim, bus) = setup(fast_config());
        let seen = thread_safe(Vec::new());
        let s = seen.clone();
        bus.subscribe(
            EventFilter::Categories(vec![EventCategory::Device]),
            move |event| {
                if let AppEvent::Device(m) = event {
                    s.lock().push(m);
                }
            },
        );
        sim.script_reply(["omn:DONE", "Needle count: 5", "DONE"]);
        let result = recv(dispatcher.submit("NEEDLE_TARGET:5:CW"));
        assert!(result.is_success());
        assert_eq!(seen.lock().as_slice(), &[DeviceMessage::NeedleCount(5)]);
    }

    #[test]
    fn test_enqueue_fails_fast_when_disconnected() {
        let bus = Arc::new(EventBus::new());
        let transport: SharedTransport = thread_safe(Box::new(SimulatedTransport::new()));
        let dispatcher = CommandDispatcher::start(
            transport,
            bus,
            Arc::new(AtomicBool::new(false)),
            fast_config(),
        )
        .unwrap();
        let (tx, rx) = mpsc::channel();
        let accepted = dispatcher.enqueue(
            "STATUS",
            Some(Box::new(move |r| {
                let _ = tx.send(r);
            })),
        );
        assert!(!accepted);
        let result = recv(rx);
        assert_eq!(result.status, CommandStatus::Failed);
        assert_eq!(result.error, "not connected");
    }

    #[test]
    fn test_emergency_stop_cancels_queue() {
        let config = DispatcherConfig {
            response_timeout: Duration::from_secs(2),
            ..fast_config()
        };
        let (dispatcher, sim, _bus) = setup(config);
        sim.silence_next(1);
        let first = dispatcher.submit("TURN:10:CW");
        let second = dispatcher.submit("TURN:20:CW");
        std::thread::sleep(Duration::from_millis(50));

        dispatcher.emergency_stop();

        assert_eq!(recv(first).status, CommandStatus::Cancelled);
        assert_eq!(recv(second).status, CommandStatus::Cancelled);
        let written = sim.written();
        assert_eq!(written[0], "TURN:10:CW");
        assert_eq!(
            written.iter().filter(|l| l.as_str() == "EMERGENCY_STOP").count(),
            3
        );
        assert!(!written.iter().any(|l| l == "TURN:20:CW"));
        assert_eq!(dispatcher.queue_len(), 0);
    }

    #[test]
    fn test_link_fault_is_connection_error() {
        let (dispatcher, sim, bus) = setup(fast_config());
        let lost = Arc::new(AtomicBool::new(false));
        let l = lost.clone();
        bus.subscribe(
            EventFilter::Categories(vec![EventCategory::Connection]),
            move |_| l.store(true, Ordering::SeqCst),
        );
        sim.fail_link("cable pulled");
        let result = recv(dispatcher.submit("TURN:10:CW"));
        assert!(result.is_connection_fault());
        assert!(lost.load(Ordering::SeqCst));
    }
}
