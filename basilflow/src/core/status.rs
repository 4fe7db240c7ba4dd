//! Pipeline status enum.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The execution status of a pipeline or of one of its steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    /// Built but not yet started.
    #[default]
    Pending,
    /// A step is in flight.
    Running,
    /// All steps completed.
    Succeeded,
    /// A step failed.
    Failed,
    /// The caller cancelled the in-flight step.
    Cancelled,
}

impl fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl PipelineStatus {
    /// Returns true if the status represents a terminal state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    /// Returns true if the status indicates success.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }

    /// Returns true if the status indicates failure (cancellation included).
    #[must_use]
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed | Self::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_display() {
        assert_eq!(PipelineStatus::Pending.to_string(), "pending");
        assert_eq!(PipelineStatus::Succeeded.to_string(), "succeeded");
        assert_eq!(PipelineStatus::Cancelled.to_string(), "cancelled");
    }

    #[test]
    fn test_status_is_terminal() {
        assert!(PipelineStatus::Succeeded.is_terminal());
        assert!(PipelineStatus::Failed.is_terminal());
        assert!(PipelineStatus::Cancelled.is_terminal());
        assert!(!PipelineStatus::Pending.is_terminal());
        assert!(!PipelineStatus::Running.is_terminal());
    }

    #[test]
    fn test_cancelled_is_failure_variant() {
        assert!(PipelineStatus::Cancelled.is_failure());
        assert!(!PipelineStatus::Cancelled.is_success());
    }

    #[test]
    fn test_status_serialize() {
        let json = serde_json::to_string(&PipelineStatus::Running).unwrap();
        assert_eq!(json, r#""running""#);

        let back: PipelineStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(back, PipelineStatus::Running);
    }
}
