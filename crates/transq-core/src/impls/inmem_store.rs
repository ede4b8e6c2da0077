//! InMemoryTaskStore - 開発・テスト用の Task Record ストア
//!
//! プロセス内の HashMap を正本として扱います。
//! プロセスが終了すると内容は失われます。

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::domain::{RequestId, StoreError, TaskRecord, Transition};
use crate::ports::TaskStore;

/// InMemoryTaskStore は開発用の TaskStore
///
/// # 実装詳細
/// - RwLock<HashMap<RequestId, TaskRecord>> で管理
/// - `transition` は write lock を保持したまま read-modify-write する
///   （キー単位のアトミック性はロック全体で満たす）
#[derive(Default)]
pub struct InMemoryTaskStore {
    records: RwLock<HashMap<RequestId, TaskRecord>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn insert(&self, record: TaskRecord) -> Result<(), StoreError> {
        let mut records = self.records.write().await;
        if records.contains_key(&record.request_id) {
            return Err(StoreError::Duplicate(record.request_id));
        }
        records.insert(record.request_id, record);
        Ok(())
    }

    async fn get(&self, request_id: RequestId) -> Result<Option<TaskRecord>, StoreError> {
        Ok(self.records.read().await.get(&request_id).cloned())
    }

    async fn transition(
        &self,
        request_id: RequestId,
        transition: Transition,
        now: DateTime<Utc>,
    ) -> Result<Option<TaskRecord>, StoreError> {
        let mut records = self.records.write().await;
        let Some(record) = records.get_mut(&request_id) else {
            return Ok(None);
        };

        // apply は失敗時にレコードを変更しない
        record.apply(transition, now)?;
        Ok(Some(record.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{FailureKind, TaskStatus};
    use chrono::TimeZone;
    use ulid::Ulid;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()
    }

    fn record() -> TaskRecord {
        TaskRecord::queued(RequestId::from_ulid(Ulid::new()), "hello", "xx", now())
    }

    #[tokio::test]
    async fn test_insert_then_get() {
        let store = InMemoryTaskStore::new();
        let record = record();
        store.insert(record.clone()).await.unwrap();

        let got = store.get(record.request_id).await.unwrap();
        assert_eq!(got, Some(record));
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_duplicate_insert_is_rejected() {
        let store = InMemoryTaskStore::new();
        let record = record();
        store.insert(record.clone()).await.unwrap();

        let err = store.insert(record.clone()).await.unwrap_err();
        assert!(matches!(err, StoreError::Duplicate(id) if id == record.request_id));
    }

    #[tokio::test]
    async fn test_get_unknown_returns_none() {
        let store = InMemoryTaskStore::new();
        let got = store.get(RequestId::from_ulid(Ulid::new())).await.unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn test_transition_updates_record() {
        let store = InMemoryTaskStore::new();
        let record = record();
        let id = record.request_id;
        store.insert(record).await.unwrap();

        store.transition(id, Transition::Start, now()).await.unwrap();
        let done = store
            .transition(id, Transition::Complete { output: "olleh".into() }, now())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(store.get(id).await.unwrap(), Some(done));
    }

    #[tokio::test]
    async fn test_rejected_transition_keeps_record() {
        let store = InMemoryTaskStore::new();
        let record = record();
        let id = record.request_id;
        store.insert(record).await.unwrap();
        store
            .transition(
                id,
                Transition::Fail {
                    kind: FailureKind::Enqueue,
                    detail: "queue down".into(),
                },
                now(),
            )
            .await
            .unwrap();
        let before = store.get(id).await.unwrap();

        let err = store.transition(id, Transition::Start, now()).await.unwrap_err();
        assert!(matches!(err, StoreError::Transition(_)));
        assert_eq!(store.get(id).await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_transition_on_missing_record_is_none() {
        let store = InMemoryTaskStore::new();
        let got = store
            .transition(RequestId::from_ulid(Ulid::new()), Transition::Start, now())
            .await
            .unwrap();
        assert!(got.is_none());
    }
}
