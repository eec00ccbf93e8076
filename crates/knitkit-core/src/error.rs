//! Error handling for KnitKit
//!
//! Provides error types for all layers of the controller:
//! - Connection errors (transport availability and loss)
//! - Command errors (timeouts, corrupted or rejected responses, chunk failures)
//! - Pattern errors (model validation and persistence format)
//! - Protocol errors (wire command syntax)
//! - Controller errors (state machine and execution policy)
//!
//! All error types use `thiserror` for ergonomic error handling.

use thiserror::Error;

/// Connection error type
///
/// Represents errors related to the transport between the host and the
/// knitting machine's microcontroller (serial port or WiFi bridge).
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConnectionError {
    /// No transport is connected
    #[error("Not connected")]
    NotConnected,

    /// Failed to open the transport
    #[error("Failed to open {target}: {reason}")]
    FailedToOpen {
        /// Port name or host address.
        target: String,
        /// The reason the transport failed to open.
        reason: String,
    },

    /// Connection timeout
    #[error("Connection timeout after {timeout_ms}ms")]
    ConnectionTimeout {
        /// The timeout duration in milliseconds.
        timeout_ms: u64,
    },

    /// Connection lost while in use
    #[error("Connection lost: {reason}")]
    ConnectionLost {
        /// The reason the connection was lost.
        reason: String,
    },

    /// Invalid connection parameters
    #[error("Invalid connection parameters: {reason}")]
    InvalidParameters {
        /// The reason the parameters are invalid.
        reason: String,
    },

    /// Serial port error
    #[error("Serial port error: {reason}")]
    SerialError {
        /// The reason for the serial port error.
        reason: String,
    },

    /// TCP connection error
    #[error("TCP connection error: {reason}")]
    TcpError {
        /// The reason for the TCP error.
        reason: String,
    },
}

/// Command error type
///
/// Represents per-command failures raised while dispatching a command to the
/// device. These are non-fatal for a pattern run unless they wrap a
/// [`ConnectionError`].
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CommandError {
    /// Transport was down when the command was submitted
    #[error("not connected")]
    NotConnected,

    /// Dispatcher queue is at capacity
    #[error("command queue is full ({capacity} commands)")]
    QueueFull {
        /// Configured queue capacity.
        capacity: usize,
    },

    /// No terminal response within the window, after all retries
    #[error("no response to '{command}' after {attempts} attempts ({timeout_ms}ms each)")]
    Timeout {
        /// The command (or chunk) that timed out.
        command: String,
        /// Number of write attempts made.
        attempts: u32,
        /// Per-attempt response window in milliseconds.
        timeout_ms: u64,
    },

    /// A response line was rejected by the validator
    #[error("corrupted response: {line:?}")]
    CorruptedResponse {
        /// The raw line that was discarded.
        line: String,
    },

    /// Device answered with ERROR / FAIL / INVALID
    #[error("command '{command}' rejected by device: {response}")]
    Rejected {
        /// The rejected command.
        command: String,
        /// The device response line.
        response: String,
    },

    /// One chunk of a split command failed; the remainder was aborted
    #[error("chunk {failed_chunk}/{total_chunks} of '{command}' failed after {completed_chunks} completed: {reason}")]
    ChunkFailure {
        /// The original (unsplit) command.
        command: String,
        /// One-based index of the chunk that failed.
        failed_chunk: usize,
        /// Number of chunks the command was split into.
        total_chunks: usize,
        /// Chunks that completed before the failure.
        completed_chunks: usize,
        /// Description of the underlying chunk failure.
        reason: String,
    },

    /// The step ran past its time limit and was cancelled in flight
    #[error("'{command}' did not finish within {timeout_ms}ms and was cancelled")]
    StepTimeout {
        /// The abandoned command.
        command: String,
        /// Step time limit in milliseconds.
        timeout_ms: u64,
    },

    /// Command was cancelled before completion
    #[error("command '{command}' cancelled")]
    Cancelled {
        /// The cancelled command.
        command: String,
    },

    /// The transport failed while the command was in flight
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

impl CommandError {
    /// Check whether this failure came from the transport itself
    pub fn is_connection_fault(&self) -> bool {
        matches!(self, CommandError::Connection(_))
    }
}

/// Pattern error type
///
/// Raised by the pattern model's validating constructors and by the
/// persisted-pattern decoder.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PatternError {
    /// Needle count must be at least one
    #[error("Needles must be positive, got {0}")]
    InvalidNeedles(u32),

    /// Row count must be at least one
    #[error("Rows must be positive, got {0}")]
    InvalidRows(u32),

    /// Repetitions must be at least one
    #[error("Repetitions must be positive, got {0}")]
    InvalidRepetitions(u32),

    /// Direction string was not CW or CCW
    #[error("Direction must be 'CW' or 'CCW', got '{0}'")]
    InvalidDirection(String),

    /// Pattern name is empty or too long
    #[error("Pattern name must be 1-{max} characters, got {len}")]
    InvalidName {
        /// Length of the rejected name in characters.
        len: usize,
        /// Maximum permitted length.
        max: usize,
    },

    /// Step index outside the pattern
    #[error("Step index {index} out of range for pattern with {len} steps")]
    StepIndexOutOfRange {
        /// Requested index.
        index: usize,
        /// Number of steps in the pattern.
        len: usize,
    },

    /// Pattern has no steps to execute
    #[error("Pattern '{0}' has no steps")]
    EmptyPattern(String),

    /// Persisted form could not be decoded
    #[error("Invalid pattern data: {0}")]
    Format(String),
}

/// Protocol error type
///
/// Represents malformed or out-of-range wire commands.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    /// Command keyword not recognised
    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    /// Command argument missing or invalid
    #[error("Invalid argument for {command}: {reason}")]
    InvalidArgument {
        /// The command keyword.
        command: String,
        /// The reason the argument is invalid.
        reason: String,
    },
}

/// Controller error type
///
/// Represents state machine violations and execution policy errors raised by
/// the knitting controller.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ControllerError {
    /// Operation requires a connected machine
    #[error("Machine not connected")]
    NotConnected,

    /// Invalid state transition
    #[error("Invalid state transition from {current} to {requested}")]
    InvalidStateTransition {
        /// The current state name.
        current: String,
        /// The requested state name.
        requested: String,
    },

    /// Operation not allowed in the current state
    #[error("Cannot {operation} while machine is {state}")]
    InvalidState {
        /// The attempted operation.
        operation: String,
        /// The current state name.
        state: String,
    },

    /// Too many step failures in one run
    #[error("Run aborted after {failures} step failures (limit {limit})")]
    FailureThresholdExceeded {
        /// Failures recorded so far.
        failures: usize,
        /// Configured ceiling.
        limit: usize,
    },

    /// Tuning values that cannot work together
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A worker thread could not be started or has gone away
    #[error("Worker unavailable: {0}")]
    WorkerUnavailable(String),
}

/// Main error type for KnitKit
///
/// A unified error type that can represent any error from all layers.
/// This is the primary error type used in public APIs.
#[derive(Error, Debug)]
pub enum Error {
    /// Connection error
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// Command error
    #[error(transparent)]
    Command(#[from] CommandError),

    /// Pattern error
    #[error(transparent)]
    Pattern(#[from] PatternError),

    /// Protocol error
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Controller error
    #[error(transparent)]
    Controller(#[from] ControllerError),

    /// Standard I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create an error from a string message
    pub fn other(msg: impl Into<String>) -> Self {
        Error::Other(msg.into())
    }
}

/// Result type using Error
pub type Result<T> = std::result::Result<T, Error>;
