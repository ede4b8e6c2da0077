//! Task status state machine.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::ids::RequestId;

/// Task status.
///
/// State transitions:
/// - Queued -> Processing -> Completed
/// - Queued -> Processing -> Failed
/// - Processing -> Processing (redelivery after a crash before ack)
/// - Queued -> Failed (the queue publish failed after the record was written)
///
/// Progress is monotonic: nothing leaves a terminal state and nothing moves
/// back to `Queued`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Record written, message published (or about to be).
    Queued,

    /// A worker has picked up the message.
    Processing,

    /// Transformation succeeded; output is recorded.
    Completed,

    /// Transformation (or enqueue) failed; error detail is recorded.
    Failed,
}

impl TaskStatus {
    /// Is this a terminal state (no further transitions)?
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Queued, Processing)
                | (Processing, Processing)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Queued, Failed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a record ended up `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The transformation returned an error.
    Transformation,

    /// The transformation did not finish before the per-task deadline.
    Timeout,

    /// The task message could not be published after the record was written.
    Enqueue,
}

/// A status change the state machine refuses.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid transition for {request_id}: {from} -> {to}")]
pub struct TransitionError {
    pub request_id: RequestId,
    pub from: TaskStatus,
    pub to: TaskStatus,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use TaskStatus::*;

    #[rstest]
    #[case(Queued, Processing)]
    #[case(Processing, Processing)]
    #[case(Processing, Completed)]
    #[case(Processing, Failed)]
    #[case(Queued, Failed)]
    fn allowed_transitions(#[case] from: TaskStatus, #[case] to: TaskStatus) {
        assert!(from.can_transition_to(to));
    }

    #[rstest]
    #[case(Queued, Queued)]
    #[case(Queued, Completed)]
    #[case(Processing, Queued)]
    #[case(Completed, Queued)]
    #[case(Completed, Processing)]
    #[case(Completed, Failed)]
    #[case(Completed, Completed)]
    #[case(Failed, Queued)]
    #[case(Failed, Processing)]
    #[case(Failed, Completed)]
    #[case(Failed, Failed)]
    fn rejected_transitions(#[case] from: TaskStatus, #[case] to: TaskStatus) {
        assert!(!from.can_transition_to(to));
    }

    #[test]
    fn terminal_states() {
        assert!(!Queued.is_terminal());
        assert!(!Processing.is_terminal());
        assert!(Completed.is_terminal());
        assert!(Failed.is_terminal());
    }

    #[test]
    fn status_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Processing).unwrap(), "\"processing\"");
        assert_eq!(
            serde_json::to_string(&FailureKind::Timeout).unwrap(),
            "\"timeout\""
        );
    }
}
