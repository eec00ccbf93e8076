//! In-process firmware simulator
//!
//! Answers commands the way the machine firmware does, so the whole stack
//! can run without hardware. A [`SimulatorHandle`] lets the owner script
//! silence, replies and link faults after the transport has been handed
//! to a dispatcher.

use super::protocol::MotorCommand;
use super::{Transport, TransportParams, TransportResult};
use knitkit_core::{thread_safe, ConnectionError, ThreadSafe};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

const POLL_SLICE: Duration = Duration::from_millis(2);

#[derive(Debug, Default)]
struct SimulatorState {
    connected: bool,
    written: Vec<String>,
    outbox: VecDeque<(Instant, String)>,
    silent_writes: usize,
    scripted: VecDeque<Vec<String>>,
    response_delay: Duration,
    needle_count: u64,
    fault: Option<String>,
}

impl SimulatorState {
    fn queue_replies(&mut self, lines: Vec<String>) {
        let ready_at = Instant::now() + self.response_delay;
        self.outbox
            .extend(lines.into_iter().map(|line| (ready_at, line)));
    }

    fn firmware_reply(&mut self, line: &str) -> Vec<String> {
        let command = match line.parse::<MotorCommand>() {
            Ok(command) => command,
            Err(_) => return vec!["ERROR: Unknown command".to_string()],
        };
        match command {
            MotorCommand::NeedleTarget { needles, .. } => {
                self.needle_count += needles;
                vec![format!("Needle count: {}", self.needle_count), "DONE".to_string()]
            }
            MotorCommand::NeedleCount => {
                vec![format!("Needle count: {}", self.needle_count), "OK".to_string()]
            }
            MotorCommand::ResetCount => {
                self.needle_count = 0;
                vec!["OK".to_string()]
            }
            MotorCommand::Status => vec!["STATUS: READY".to_string(), "OK".to_string()],
            c if c.is_stop() => vec!["STOPPED".to_string()],
            _ => vec!["DONE".to_string()],
        }
    }
}

/// Scripting and inspection handle for a [`SimulatedTransport`]
#[derive(Debug, Clone)]
pub struct SimulatorHandle {
    state: ThreadSafe<SimulatorState>,
}

impl SimulatorHandle {
    /// Every line written so far, in order
    pub fn written(&self) -> Vec<String> {
        self.state.lock().written.clone()
    }

    /// Written lines that parse as motion commands
    pub fn motion_commands(&self) -> Vec<String> {
        self.written()
            .into_iter()
            .filter(|l| l.parse::<MotorCommand>().is_ok_and(|c| c.is_motion()))
            .collect()
    }

    /// Ignore the next `count` writes entirely
    pub fn silence_next(&self, count: usize) {
        self.state.lock().silent_writes += count;
    }

    /// Answer the next write with `lines` instead of the firmware reply
    pub fn script_reply<I, S>(&self, lines: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.state
            .lock()
            .scripted
            .push_back(lines.into_iter().map(Into::into).collect());
    }

    /// Push an unsolicited line to the reader
    pub fn inject_line(&self, line: impl Into<String>) {
        self.state.lock().queue_replies(vec![line.into()]);
    }

    /// Delay every reply by `delay`
    pub fn set_response_delay(&self, delay: Duration) {
        self.state.lock().response_delay = delay;
    }

    /// Make the next read or write fail as if the cable was pulled
    pub fn fail_link(&self, reason: impl Into<String>) {
        self.state.lock().fault = Some(reason.into());
    }

    /// Needle tally kept by the simulated sensor
    pub fn needle_count(&self) -> u64 {
        self.state.lock().needle_count
    }
}

/// Transport backed by the firmware simulator
pub struct SimulatedTransport {
    state: ThreadSafe<SimulatorState>,
}

impl Default for SimulatedTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedTransport {
    /// Create an unconnected simulator
    pub fn new() -> Self {
        Self {
            state: thread_safe(SimulatorState::default()),
        }
    }

    /// Handle for scripting this simulator from another owner
    pub fn handle(&self) -> SimulatorHandle {
        SimulatorHandle {
            state: self.state.clone(),
        }
    }

    fn check_link(state: &mut SimulatorState) -> TransportResult<()> {
        if let Some(reason) = state.fault.take() {
            state.connected = false;
            state.outbox.clear();
            return Err(ConnectionError::ConnectionLost { reason });
        }
        if !state.connected {
            return Err(ConnectionError::NotConnected);
        }
        Ok(())
    }
}

impl Transport for SimulatedTransport {
    fn connect(&mut self, params: &TransportParams) -> TransportResult<()> {
        params.validate()?;
        let mut state = self.state.lock();
        state.connected = true;
        state.fault = None;
        state.outbox.clear();
        tracing::info!("Simulator connected ({})", params.display_target());
        Ok(())
    }

    fn disconnect(&mut self) {
        let mut state = self.state.lock();
        if state.connected {
            tracing::info!("Simulator disconnected");
        }
        state.connected = false;
        state.outbox.clear();
    }

    fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    fn write_line(&mut self, line: &str) -> TransportResult<()> {
        let mut state = self.state.lock();
        Self::check_link(&mut state)?;
        state.written.push(line.to_string());

        if state.silent_writes > 0 {
            state.silent_writes -= 1;
            tracing::debug!("Simulator ignoring '{}'", line);
            return Ok(());
        }
        let replies = match state.scripted.pop_front() {
            Some(lines) => lines,
            None => state.firmware_reply(line),
        };
        state.queue_replies(replies);
        Ok(())
    }

    fn read_line(&mut self, timeout: Duration) -> TransportResult<Option<String>> {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let mut state = self.state.lock();
                Self::check_link(&mut state)?;
                let ready = state
                    .outbox
                    .front()
                    .is_some_and(|(at, _)| *at <= Instant::now());
                if ready {
                    return Ok(state.outbox.pop_front().map(|(_, line)| line));
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            std::thread::sleep(POLL_SLICE.min(deadline - now));
        }
    }

    /// Replies still waiting out the response delay are dropped too, as if
    /// the firmware had abandoned the command they answer.
    fn clear_input(&mut self) -> TransportResult<Vec<String>> {
        let mut state = self.state.lock();
        Self::check_link(&mut state)?;
        Ok(state.outbox.drain(..).map(|(_, line)| line).collect())
    }
}
