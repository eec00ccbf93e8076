//! Progress of a pattern run

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::KnittingPattern;

/// Progress of a single pattern run.
///
/// Created when a run starts and mutated only by the execution engine;
/// observers receive cloned snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionStatus {
    /// Name of the pattern being run
    pub pattern_name: String,
    /// Steps completed successfully so far
    pub current_step: usize,
    /// Steps across all repetitions
    pub total_steps: usize,
    /// One-based repetition currently running (0 before the first starts)
    pub current_repetition: u32,
    /// Repetitions in the pattern
    pub total_repetitions: u32,
    /// Needles moved by successful steps
    pub needles_completed: u64,
    /// Needles a full run moves
    pub total_needles: u64,
    /// Running-average estimate of the time left
    pub estimated_time_remaining: Duration,
    /// Failure messages in the order they happened
    pub errors: Vec<String>,
    /// When the run started
    pub started_at: DateTime<Utc>,
}

impl ExecutionStatus {
    /// Fresh status for a run of `pattern`
    pub fn for_pattern(pattern: &KnittingPattern) -> Self {
        Self {
            pattern_name: pattern.name().to_string(),
            current_step: 0,
            total_steps: pattern.total_steps(),
            current_repetition: 0,
            total_repetitions: pattern.repetitions(),
            needles_completed: 0,
            total_needles: pattern.total_needles(),
            estimated_time_remaining: Duration::ZERO,
            errors: Vec::new(),
            started_at: Utc::now(),
        }
    }

    /// Needle progress as a percentage (0-100)
    pub fn progress_percent(&self) -> f64 {
        if self.total_needles == 0 {
            return 0.0;
        }
        (self.needles_completed as f64 / self.total_needles as f64) * 100.0
    }

    /// Whether every step of the run completed
    pub fn is_complete(&self) -> bool {
        self.current_step == self.total_steps
    }
}
