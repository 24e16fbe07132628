//! Step status values and the legal transitions between them.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Status of a single setup step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    /// Not yet attempted
    #[default]
    Pending,
    /// Attempt started; completion unknown until marked otherwise
    InProgress,
    /// Handler returned successfully
    Completed,
    /// Handler returned a classified error
    Failed,
    /// Explicitly skipped by the operator or the deployment mode
    Skipped,
}

impl StepStatus {
    /// Check if a dependency in this status lets dependents start.
    pub fn satisfies_dependency(&self) -> bool {
        matches!(self, Self::Completed | Self::Skipped)
    }

    /// Check if the step needs (re-)execution on resume.
    pub fn needs_attempt(&self) -> bool {
        matches!(self, Self::Pending | Self::InProgress | Self::Failed)
    }

    /// Legal transitions:
    /// `PENDING -> IN_PROGRESS -> {COMPLETED | FAILED}`, `PENDING -> SKIPPED`,
    /// and `{FAILED | IN_PROGRESS} -> PENDING` when a resume reopens a step.
    pub fn can_transition_to(&self, next: StepStatus) -> bool {
        use StepStatus::*;
        matches!(
            (self, next),
            (Pending, InProgress)
                | (Pending, Skipped)
                | (InProgress, Completed)
                | (InProgress, Failed)
                | (Failed, Pending)
                | (InProgress, Pending)
        )
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "PENDING",
            Self::InProgress => "IN_PROGRESS",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Skipped => "SKIPPED",
        };
        write!(f, "{}", s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_transitions() {
        assert!(StepStatus::Pending.can_transition_to(StepStatus::InProgress));
        assert!(StepStatus::InProgress.can_transition_to(StepStatus::Completed));
        assert!(StepStatus::InProgress.can_transition_to(StepStatus::Failed));
    }

    #[test]
    fn test_skip_only_from_pending() {
        assert!(StepStatus::Pending.can_transition_to(StepStatus::Skipped));
        assert!(!StepStatus::InProgress.can_transition_to(StepStatus::Skipped));
        assert!(!StepStatus::Failed.can_transition_to(StepStatus::Skipped));
        assert!(!StepStatus::Completed.can_transition_to(StepStatus::Skipped));
    }

    #[test]
    fn test_completed_is_final() {
        for next in [
            StepStatus::Pending,
            StepStatus::InProgress,
            StepStatus::Failed,
            StepStatus::Skipped,
        ] {
            assert!(!StepStatus::Completed.can_transition_to(next));
        }
    }

    #[test]
    fn test_pending_cannot_jump_to_completed() {
        assert!(!StepStatus::Pending.can_transition_to(StepStatus::Completed));
        assert!(!StepStatus::Pending.can_transition_to(StepStatus::Failed));
    }

    #[test]
    fn test_serde_uses_upper_case() {
        let json = serde_json::to_string(&StepStatus::InProgress).unwrap();
        assert_eq!(json, "\"IN_PROGRESS\"");
        let back: StepStatus = serde_json::from_str("\"SKIPPED\"").unwrap();
        assert_eq!(back, StepStatus::Skipped);
    }
}
