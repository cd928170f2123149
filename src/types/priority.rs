//! Priority score and its derived display bucket.
//!
//! The source this crate's design is distilled from carries two
//! representations of priority: a three-value level and a 0-100 score.
//! Per the resolved open question, the score is canonical; [`Priority`] is
//! a pure, never-stored view over it.

use std::fmt;

use crate::error::EngineError;

/// Validates that `raw` falls within the canonical `[0.0, 100.0]` range,
/// mirroring [`crate::types::validate_title`]/
/// [`crate::types::validate_description`]: a caller-supplied score
/// outside the range is rejected, not silently rewritten (spec boundary
/// behavior: "priority_score 0 and 100 accepted; <0 and >100 rejected").
///
/// # Examples
///
/// ```
/// use taskgraph_engine::types::validate_priority_score;
///
/// assert!(validate_priority_score(0.0).is_ok());
/// assert!(validate_priority_score(100.0).is_ok());
/// assert!(validate_priority_score(-0.001).is_err());
/// assert!(validate_priority_score(100.001).is_err());
/// ```
pub fn validate_priority_score(raw: f64) -> Result<(), EngineError> {
    if !(0.0..=100.0).contains(&raw) {
        return Err(EngineError::Corrupt {
            what: format!("priority_score {raw} outside [0, 100]"),
        });
    }
    Ok(())
}

/// Clamps a score into `[0.0, 100.0]` for display-bucketing purposes only
/// (see [`Priority::from_score`]) -- never used to accept an out-of-range
/// caller-supplied score into storage; that path goes through
/// [`validate_priority_score`] and rejects instead.
fn clamp_for_display(raw: f64) -> f64 {
    raw.clamp(0.0, 100.0)
}

/// A display bucket derived from a task's `priority_score`.
///
/// Never stored: always computed from the canonical score.
///
/// # Examples
///
/// ```
/// use taskgraph_engine::types::Priority;
///
/// assert_eq!(Priority::from_score(10.0), Priority::Low);
/// assert_eq!(Priority::from_score(50.0), Priority::Medium);
/// assert_eq!(Priority::from_score(85.0), Priority::High);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    /// `< 20`
    Low,
    /// `20..=70`
    Medium,
    /// `> 70`
    High,
}

impl Priority {
    /// Buckets a clamped score into a display-only level.
    pub fn from_score(score: f64) -> Self {
        let score = clamp_for_display(score);
        if score < 20.0 {
            Self::Low
        } else if score <= 70.0 {
            Self::Medium
        } else {
            Self::High
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        };
        write!(f, "{s}")
    }
}

/// Default priority score assigned to a task when none is supplied.
pub const DEFAULT_PRIORITY_SCORE: f64 = 50.0;
