//! Response line validation and classification
//!
//! The half-duplex link regularly delivers garbled fragments of earlier
//! lines. Every received line is screened here before the dispatcher looks
//! at it; corrupted lines are discarded without ending the wait.

use knitkit_core::{DeviceMessage, SensorState};

/// Substrings that only ever show up in garbled lines
pub const CORRUPTION_MARKERS: [&str; 11] = [
    "DU:Poesn", "omn:", "EBG", "rcsigcmad", "\0", "\u{ff}", "\u{fe}", "TUN400C", "'CW'", "\"",
    "'",
];

/// Keywords that mark a command as finished
pub const COMPLETION_KEYWORDS: [&str; 4] = ["DONE", "COMPLETE", "OK", "FINISHED"];

/// Keywords that mark a command as rejected
pub const FAILURE_KEYWORDS: [&str; 3] = ["ERROR", "FAIL", "INVALID"];

/// Non-terminal keywords the firmware uses in status lines
pub const STATUS_KEYWORDS: [&str; 6] = ["READY", "STARTED", "STOPPED", "MOVING", "POSITION", "STATUS"];

/// Minimum share of printable characters in a sane line
pub const MIN_PRINTABLE_RATIO: f64 = 0.8;

/// Longest bare alphanumeric token accepted without a keyword
pub const MAX_TOKEN_LEN: usize = 10;

/// Whether a line can be trusted at all
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Validity {
    /// Plausible firmware output
    Valid,
    /// Garbage; discard
    Corrupted,
}

/// What a line means for the command in flight
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// The command finished
    Completion,
    /// The device rejected the command
    Failure,
    /// Neither; keep waiting
    Informational,
}

/// Full interpretation of a received line
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseKind {
    /// Discard and keep waiting
    Corrupted,
    /// Sensor report for observers; keep waiting
    Device(DeviceMessage),
    /// The command finished
    Completion,
    /// The device rejected the command
    Failure,
    /// Status chatter; keep waiting
    Informational,
}

impl ResponseKind {
    /// Whether this line ends the wait for the command in flight
    pub fn is_terminal(&self) -> bool {
        matches!(self, ResponseKind::Completion | ResponseKind::Failure)
    }
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| haystack.contains(n))
}

/// Denylist, printable ratio and minimum length checks
fn is_garbled(raw: &str) -> bool {
    let total = raw.chars().count();
    if total < 2 {
        return true;
    }
    if contains_any(raw, &CORRUPTION_MARKERS) {
        return true;
    }
    let printable = raw.chars().filter(|c| !c.is_control()).count();
    (printable as f64 / total as f64) < MIN_PRINTABLE_RATIO
}

/// Decide whether a raw line is plausible firmware output
pub fn validate(raw: &str) -> Validity {
    if is_garbled(raw) {
        return Validity::Corrupted;
    }

    let upper = raw.to_uppercase();
    if contains_any(&upper, &COMPLETION_KEYWORDS)
        || contains_any(&upper, &FAILURE_KEYWORDS)
        || contains_any(&upper, &STATUS_KEYWORDS)
    {
        return Validity::Valid;
    }

    if raw.chars().count() <= MAX_TOKEN_LEN && raw.chars().all(|c| c.is_alphanumeric()) {
        return Validity::Valid;
    }

    Validity::Corrupted
}

/// Classify a line by its keywords.
///
/// A line carrying both a failure and a completion keyword (for example
/// `ERROR: TURN not OK`) is a failure.
pub fn classify(raw: &str) -> Classification {
    let upper = raw.to_uppercase();
    if contains_any(&upper, &FAILURE_KEYWORDS) {
        Classification::Failure
    } else if contains_any(&upper, &COMPLETION_KEYWORDS) {
        Classification::Completion
    } else {
        Classification::Informational
    }
}

/// Parse `Needle count: N`, `Distance: D` and `Sensor: STATE` lines
pub fn parse_device_message(raw: &str) -> Option<DeviceMessage> {
    let line = raw.trim();
    if let Some(rest) = line.strip_prefix("Needle count:") {
        return rest.trim().parse().ok().map(DeviceMessage::NeedleCount);
    }
    if let Some(rest) = line.strip_prefix("Distance:") {
        let value = rest.trim().trim_end_matches("cm").trim();
        return value.parse().ok().map(DeviceMessage::Distance);
    }
    if let Some(rest) = line.strip_prefix("Sensor:") {
        let state = match rest.trim() {
            "CLEAR" => SensorState::Clear,
            "BLOCKED" => SensorState::Blocked,
            other => SensorState::Other(other.to_string()),
        };
        return Some(DeviceMessage::Sensor(state));
    }
    None
}

/// Interpret a received line
///
/// Garbled lines are rejected first, then sensor reports are recognised by
/// prefix (they never complete a command), then the remaining lines are
/// validated and classified.
pub fn interpret(raw: &str) -> ResponseKind {
    if is_garbled(raw) {
        return ResponseKind::Corrupted;
    }
    if let Some(message) = parse_device_message(raw) {
        return ResponseKind::Device(message);
    }
    if validate(raw) == Validity::Corrupted {
        return ResponseKind::Corrupted;
    }
    match classify(raw) {
        Classification::Completion => ResponseKind::Completion,
        Classification::Failure => ResponseKind::Failure,
        Classification::Informational => ResponseKind::Informational,
    }
}
