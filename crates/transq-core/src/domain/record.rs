//! Task record: the persisted state of one translation request.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::RequestId;
use super::state::{FailureKind, TaskStatus, TransitionError};

/// A requested status change, applied through [`TaskRecord::apply`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// A worker picked the message up (or picked up a redelivery).
    Start,

    /// Transformation succeeded.
    Complete { output: String },

    /// Transformation or enqueue failed.
    Fail { kind: FailureKind, detail: String },
}

impl Transition {
    pub fn target(&self) -> TaskStatus {
        match self {
            Transition::Start => TaskStatus::Processing,
            Transition::Complete { .. } => TaskStatus::Completed,
            Transition::Fail { .. } => TaskStatus::Failed,
        }
    }
}

/// Persisted state of a translation request.
///
/// Design:
/// - This is the single source of truth a client polls.
/// - `request_id`, `text` and `to` never change after creation.
/// - All status changes go through `apply`, which enforces monotonic progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    pub request_id: RequestId,
    pub text: String,
    pub to: String,
    pub status: TaskStatus,

    /// Present only when `status == Completed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub translated_text: Option<String>,

    /// Present only when `status == Failed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<FailureKind>,

    /// Number of times the record entered `Processing` (redeliveries included).
    #[serde(default)]
    pub attempts: u32,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskRecord {
    pub fn queued(
        request_id: RequestId,
        text: impl Into<String>,
        to: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            request_id,
            text: text.into(),
            to: to.into(),
            status: TaskStatus::Queued,
            translated_text: None,
            error: None,
            error_kind: None,
            attempts: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply a transition, or refuse it without touching the record.
    pub fn apply(&mut self, transition: Transition, now: DateTime<Utc>) -> Result<(), TransitionError> {
        let next = transition.target();
        if !self.status.can_transition_to(next) {
            return Err(TransitionError {
                request_id: self.request_id,
                from: self.status,
                to: next,
            });
        }

        match transition {
            Transition::Start => {
                self.attempts += 1;
            }
            Transition::Complete { output } => {
                self.translated_text = Some(output);
            }
            Transition::Fail { kind, detail } => {
                self.error = Some(detail);
                self.error_kind = Some(kind);
            }
        }
        self.status = next;
        self.updated_at = self.updated_at.max(now);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use ulid::Ulid;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
    }

    fn queued() -> TaskRecord {
        TaskRecord::queued(RequestId::from_ulid(Ulid::new()), "hello", "xx", t0())
    }

    #[test]
    fn happy_path_sets_output_and_advances_updated_at() {
        let mut record = queued();
        record.apply(Transition::Start, t0() + Duration::seconds(1)).unwrap();
        assert_eq!(record.status, TaskStatus::Processing);
        assert_eq!(record.attempts, 1);

        record
            .apply(
                Transition::Complete { output: "olleh".into() },
                t0() + Duration::seconds(2),
            )
            .unwrap();
        assert_eq!(record.status, TaskStatus::Completed);
        assert_eq!(record.translated_text.as_deref(), Some("olleh"));
        assert_eq!(record.error, None);
        assert_eq!(record.created_at, t0());
        assert_eq!(record.updated_at, t0() + Duration::seconds(2));
    }

    #[test]
    fn failure_records_detail_and_kind() {
        let mut record = queued();
        record.apply(Transition::Start, t0()).unwrap();
        record
            .apply(
                Transition::Fail {
                    kind: FailureKind::Transformation,
                    detail: "boom".into(),
                },
                t0(),
            )
            .unwrap();
        assert_eq!(record.status, TaskStatus::Failed);
        assert_eq!(record.error.as_deref(), Some("boom"));
        assert_eq!(record.error_kind, Some(FailureKind::Transformation));
        assert_eq!(record.translated_text, None);
    }

    #[test]
    fn redelivery_reenters_processing() {
        let mut record = queued();
        record.apply(Transition::Start, t0()).unwrap();
        record.apply(Transition::Start, t0()).unwrap();
        assert_eq!(record.status, TaskStatus::Processing);
        assert_eq!(record.attempts, 2);
    }

    #[test]
    fn terminal_record_is_left_untouched() {
        let mut record = queued();
        record.apply(Transition::Start, t0()).unwrap();
        record
            .apply(Transition::Complete { output: "x".into() }, t0())
            .unwrap();
        let before = record.clone();

        let err = record
            .apply(Transition::Start, t0() + Duration::seconds(5))
            .unwrap_err();
        assert_eq!(err.from, TaskStatus::Completed);
        assert_eq!(err.to, TaskStatus::Processing);
        assert_eq!(record, before);
    }

    #[test]
    fn updated_at_never_moves_backwards() {
        let mut record = queued();
        record.apply(Transition::Start, t0() - Duration::seconds(10)).unwrap();
        assert_eq!(record.updated_at, t0());
    }

    #[test]
    fn json_uses_camel_case_and_omits_absent_fields() {
        let record = queued();
        let v = serde_json::to_value(&record).unwrap();
        assert_eq!(v["status"], "queued");
        assert!(v.get("requestId").is_some());
        assert!(v.get("createdAt").is_some());
        assert!(v.get("translatedText").is_none());
        assert!(v.get("error").is_none());

        let back: TaskRecord = serde_json::from_value(v).unwrap();
        assert_eq!(back, record);
    }
}
