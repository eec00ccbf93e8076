//! Knitting pattern model
//!
//! Patterns are immutable value types. Every edit returns a new pattern so a
//! run in progress can keep reading the version it was started with.
//!
//! The persisted form is the JSON object
//! `{ name, description, repetitions, steps: [{ needles, direction, rows, description }] }`.
//! Older files that used `repeat_count` instead of `rows` are still accepted.

use super::Direction;
use crate::error::PatternError;
use serde::{Deserialize, Serialize};

/// Longest accepted pattern name, in characters
pub const MAX_PATTERN_NAME_LENGTH: usize = 50;

/// One step of a pattern: turn `needles` needles in `direction`, `rows` times
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "StepRecord", into = "StepRecord")]
pub struct PatternStep {
    needles: u32,
    direction: Direction,
    rows: u32,
    description: String,
}

impl PatternStep {
    /// Create a validated step.
    ///
    /// An empty description is replaced with a generated summary such as
    /// `"48 needles × 2 rows CW"`.
    pub fn new(
        needles: u32,
        direction: Direction,
        rows: u32,
        description: impl Into<String>,
    ) -> Result<Self, PatternError> {
        if needles < 1 {
            return Err(PatternError::InvalidNeedles(needles));
        }
        if rows < 1 {
            return Err(PatternError::InvalidRows(rows));
        }
        let mut description = description.into();
        if description.is_empty() {
            description = format!("{} needles × {} rows {}", needles, rows, direction);
        }
        Ok(Self {
            needles,
            direction,
            rows,
            description,
        })
    }

    /// Needles per row
    pub fn needles(&self) -> u32 {
        self.needles
    }

    /// Rotation direction
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Number of rows
    pub fn rows(&self) -> u32 {
        self.rows
    }

    /// Human readable description
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Needles moved by this step: `needles × rows`
    pub fn total_needles(&self) -> u64 {
        u64::from(self.needles) * u64::from(self.rows)
    }
}

fn default_count() -> u32 {
    1
}

fn default_pattern_name() -> String {
    "Unnamed Pattern".to_string()
}

#[derive(Clone, Serialize, Deserialize)]
struct StepRecord {
    needles: u32,
    direction: String,
    #[serde(default = "default_count", alias = "repeat_count")]
    rows: u32,
    #[serde(default)]
    description: String,
}

impl TryFrom<StepRecord> for PatternStep {
    type Error = PatternError;

    fn try_from(record: StepRecord) -> Result<Self, Self::Error> {
        let direction = record.direction.parse()?;
        PatternStep::new(record.needles, direction, record.rows, record.description)
    }
}

impl From<PatternStep> for StepRecord {
    fn from(step: PatternStep) -> Self {
        Self {
            needles: step.needles,
            direction: step.direction.to_string(),
            rows: step.rows,
            description: step.description,
        }
    }
}

/// A named, ordered sequence of steps repeated `repetitions` times
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "PatternRecord", into = "PatternRecord")]
pub struct KnittingPattern {
    name: String,
    steps: Vec<PatternStep>,
    repetitions: u32,
    description: String,
}

impl KnittingPattern {
    /// Create a validated pattern
    pub fn new(
        name: impl Into<String>,
        steps: Vec<PatternStep>,
        repetitions: u32,
        description: impl Into<String>,
    ) -> Result<Self, PatternError> {
        let name = name.into();
        let len = name.chars().count();
        if len == 0 || len > MAX_PATTERN_NAME_LENGTH {
            return Err(PatternError::InvalidName {
                len,
                max: MAX_PATTERN_NAME_LENGTH,
            });
        }
        if repetitions < 1 {
            return Err(PatternError::InvalidRepetitions(repetitions));
        }
        Ok(Self {
            name,
            steps,
            repetitions,
            description: description.into(),
        })
    }

    /// Create a pattern with no steps and a single repetition
    pub fn empty(name: impl Into<String>) -> Result<Self, PatternError> {
        Self::new(name, Vec::new(), 1, "")
    }

    /// Pattern name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Steps in execution order
    pub fn steps(&self) -> &[PatternStep] {
        &self.steps
    }

    /// How many times the step sequence is run
    pub fn repetitions(&self) -> u32 {
        self.repetitions
    }

    /// Free-form description
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Number of steps in one repetition
    pub fn step_count(&self) -> usize {
        self.steps.len()
    }

    /// Number of steps across all repetitions
    pub fn total_steps(&self) -> usize {
        self.steps.len() * self.repetitions as usize
    }

    /// Needles moved by a full run: `Σ step.total_needles × repetitions`
    pub fn total_needles(&self) -> u64 {
        let per_repetition: u64 = self.steps.iter().map(PatternStep::total_needles).sum();
        per_repetition * u64::from(self.repetitions)
    }

    /// Return a new pattern with `step` appended
    pub fn with_step(&self, step: PatternStep) -> Self {
        let mut next = self.clone();
        next.steps.push(step);
        next
    }

    /// Return a new pattern without the step at `index`
    pub fn without_step(&self, index: usize) -> Result<Self, PatternError> {
        self.check_index(index)?;
        let mut next = self.clone();
        next.steps.remove(index);
        Ok(next)
    }

    /// Return a new pattern with the step at `index` replaced
    pub fn with_replaced_step(&self, index: usize, step: PatternStep) -> Result<Self, PatternError> {
        self.check_index(index)?;
        let mut next = self.clone();
        next.steps[index] = step;
        Ok(next)
    }

    /// Return a new pattern with a different repetition count
    pub fn with_repetitions(&self, repetitions: u32) -> Result<Self, PatternError> {
        Self::new(
            self.name.clone(),
            self.steps.clone(),
            repetitions,
            self.description.clone(),
        )
    }

    /// Convert to the persisted JSON object
    pub fn to_value(&self) -> Result<serde_json::Value, PatternError> {
        serde_json::to_value(PatternRecord::from(self.clone()))
            .map_err(|e| PatternError::Format(e.to_string()))
    }

    /// Build from the persisted JSON object
    pub fn from_value(value: serde_json::Value) -> Result<Self, PatternError> {
        serde_json::from_value(value).map_err(|e| PatternError::Format(e.to_string()))
    }

    /// Serialize to pretty-printed JSON text
    pub fn to_json(&self) -> Result<String, PatternError> {
        serde_json::to_string_pretty(self).map_err(|e| PatternError::Format(e.to_string()))
    }

    /// Parse from JSON text
    pub fn from_json(text: &str) -> Result<Self, PatternError> {
        serde_json::from_str(text).map_err(|e| PatternError::Format(e.to_string()))
    }

    fn check_index(&self, index: usize) -> Result<(), PatternError> {
        if index >= self.steps.len() {
            return Err(PatternError::StepIndexOutOfRange {
                index,
                len: self.steps.len(),
            });
        }
        Ok(())
    }
}

#[derive(Clone, Serialize, Deserialize)]
struct PatternRecord {
    #[serde(default = "default_pattern_name")]
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default = "default_count")]
    repetitions: u32,
    #[serde(default)]
    steps: Vec<PatternStep>,
}

impl TryFrom<PatternRecord> for KnittingPattern {
    type Error = PatternError;

    fn try_from(record: PatternRecord) -> Result<Self, Self::Error> {
        KnittingPattern::new(
            record.name,
            record.steps,
            record.repetitions,
            record.description,
        )
    }
}

impl From<KnittingPattern> for PatternRecord {
    fn from(pattern: KnittingPattern) -> Self {
        Self {
            name: pattern.name,
            description: pattern.description,
            repetitions: pattern.repetitions,
            steps: pattern.steps,
        }
    }
}
