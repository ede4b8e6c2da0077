//! SubmissionService - 翻訳リクエストの受付
//!
//! # フロー（二相）
//! 1. 入力を検証（欠けているフィールドをすべて報告）
//! 2. Task Record を `queued` で保存
//! 3. TaskMessage を永続キューに publish
//!
//! 2 が完了してから 3 を始めるので、receipt を受け取ったクライアントは
//! 必ず `queued` 以降の Task Record を見つけられる。

use std::sync::Arc;

use tracing::{error, info, warn};

use crate::domain::{
    FailureKind, InvalidRequest, Receipt, RequestId, StoreError, SubmitRequest, TaskMessage,
    TaskRecord, TaskStatus, Transition, TransportError,
};
use crate::ports::{Clock, IdGenerator, TaskStore};
use crate::transport::ConnectionManager;

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error(transparent)]
    InvalidRequest(#[from] InvalidRequest),

    #[error("task record not found: {0}")]
    NotFound(RequestId),

    #[error("task {request_id} is {status}; only failed tasks can be retried")]
    NotRetryable {
        request_id: RequestId,
        status: TaskStatus,
    },

    /// Task Record は保存済みだが publish できなかった（レコードは failed にしてある）
    #[error("task {request_id} could not be queued: {source}")]
    QueueUnavailable {
        request_id: RequestId,
        #[source]
        source: TransportError,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// SubmissionService は HTTP ハンドラから共有される
///
/// # 依存
/// - TaskStore: 正本
/// - ConnectionManager: 現在のチャネルへの publish
/// - IdGenerator / Clock: テストで差し替え可能
pub struct SubmissionService {
    store: Arc<dyn TaskStore>,
    transport: Arc<ConnectionManager>,
    ids: Arc<dyn IdGenerator>,
    clock: Arc<dyn Clock>,
}

impl SubmissionService {
    pub fn new(
        store: Arc<dyn TaskStore>,
        transport: Arc<ConnectionManager>,
        ids: Arc<dyn IdGenerator>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            transport,
            ids,
            clock,
        }
    }

    /// リクエストを受け付けて receipt を返す
    ///
    /// 検証に失敗した場合は Task Record も TaskMessage も作られない。
    pub async fn submit(&self, request: SubmitRequest) -> Result<Receipt, SubmitError> {
        let valid = request.validate()?;
        self.enqueue(valid.text, valid.to).await
    }

    /// Task Record を読むだけ
    pub async fn get_status(&self, request_id: RequestId) -> Result<TaskRecord, SubmitError> {
        self.store
            .get(request_id)
            .await?
            .ok_or(SubmitError::NotFound(request_id))
    }

    /// failed の Task Record と同じ入力で新しいリクエストを作る
    ///
    /// 元のレコードは変更しない（状態は単調に進むだけ）。
    pub async fn retry(&self, request_id: RequestId) -> Result<Receipt, SubmitError> {
        let record = self.get_status(request_id).await?;
        if record.status != TaskStatus::Failed {
            return Err(SubmitError::NotRetryable {
                request_id,
                status: record.status,
            });
        }

        let receipt = self.enqueue(record.text, record.to).await?;
        info!(
            request_id = %receipt.request_id,
            retry_of = %request_id,
            "failed translation resubmitted"
        );
        Ok(receipt)
    }

    async fn enqueue(&self, text: String, to: String) -> Result<Receipt, SubmitError> {
        let request_id = self.ids.generate_request_id();
        let record = TaskRecord::queued(request_id, text, to, self.clock.now());
        let message = TaskMessage::from_record(&record);

        // 1st phase: 正本に書く
        self.store.insert(record).await?;

        // 2nd phase: キューに流す
        if let Err(e) = self.transport.publish(&message).await {
            warn!(%request_id, error = %e, "publish failed after record write");
            self.mark_enqueue_failed(request_id, &e).await;
            return Err(SubmitError::QueueUnavailable {
                request_id,
                source: e,
            });
        }

        info!(%request_id, to = %message.to, "translation queued");
        Ok(Receipt {
            request_id,
            status: TaskStatus::Queued,
        })
    }

    async fn mark_enqueue_failed(&self, request_id: RequestId, cause: &TransportError) {
        let transition = Transition::Fail {
            kind: FailureKind::Enqueue,
            detail: cause.to_string(),
        };
        if let Err(e) = self.store.transition(request_id, transition, self.clock.now()).await {
            // ここで失敗するとレコードは queued のまま残る
            error!(%request_id, error = %e, "could not mark unqueued task as failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    use chrono::{TimeZone, Utc};
    use rstest::rstest;
    use ulid::Ulid;

    use crate::impls::{InMemoryBroker, InMemoryTaskStore};
    use crate::ports::{FixedClock, UlidGenerator};
    use crate::transport::{ConnectionState, ReconnectPolicy};

    const QUEUE: &str = "translations";

    /// 事前に決めた ID を順に返す
    struct ScriptedIds(Mutex<Vec<RequestId>>);

    impl ScriptedIds {
        fn new(ids: &[RequestId]) -> Self {
            let mut ids = ids.to_vec();
            ids.reverse();
            Self(Mutex::new(ids))
        }
    }

    impl IdGenerator for ScriptedIds {
        fn generate_request_id(&self) -> RequestId {
            self.0
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| RequestId::from_ulid(Ulid::new()))
        }
    }

    struct Fixture {
        broker: InMemoryBroker,
        store: Arc<InMemoryTaskStore>,
        transport: Arc<ConnectionManager>,
        service: SubmissionService,
    }

    async fn fixture_with(ids: Arc<dyn IdGenerator>, policy: ReconnectPolicy) -> Fixture {
        let broker = InMemoryBroker::new();
        let store = Arc::new(InMemoryTaskStore::new());
        let transport = ConnectionManager::connect(Arc::new(broker.clone()), QUEUE, policy)
            .await
            .unwrap();
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        ));
        let service = SubmissionService::new(store.clone(), Arc::clone(&transport), ids, clock);
        Fixture {
            broker,
            store,
            transport,
            service,
        }
    }

    async fn fixture() -> Fixture {
        let clock = FixedClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        fixture_with(
            Arc::new(UlidGenerator::new(clock)),
            ReconnectPolicy::new(3, Duration::from_millis(5)),
        )
        .await
    }

    /// 再接続できない状態にしてから接続を落とす
    async fn break_transport(f: &Fixture) {
        f.broker.set_unreachable(true).await;
        f.broker.disconnect("socket reset").await;
        let mut rx = f.transport.subscribe();
        rx.wait_for(|s| *s == ConnectionState::Failed).await.unwrap();
    }

    fn failing_policy() -> ReconnectPolicy {
        ReconnectPolicy::new(3, Duration::from_millis(5))
            .with_max_reconnect_attempts(1)
            .with_publish_wait(Duration::from_millis(20))
    }

    #[tokio::test]
    async fn test_submit_writes_record_then_publishes() {
        let f = fixture().await;

        let receipt = f
            .service
            .submit(SubmitRequest::new("hello", "xx"))
            .await
            .unwrap();
        assert_eq!(receipt.status, TaskStatus::Queued);

        let record = f.service.get_status(receipt.request_id).await.unwrap();
        assert_eq!(record.status, TaskStatus::Queued);
        assert_eq!(record.text, "hello");
        assert_eq!(record.to, "xx");

        assert_eq!(f.broker.ready_len(QUEUE).await, 1);
        let channel = f.transport.current_channel().unwrap();
        let delivery = channel
            .next_delivery(Duration::from_millis(50))
            .await
            .unwrap()
            .unwrap();
        let message = TaskMessage::decode(&delivery.payload).unwrap();
        assert_eq!(message.request_id, receipt.request_id);
        assert_eq!(message.text, "hello");
    }

    #[rstest]
    #[case(SubmitRequest { text: None, to: Some("xx".into()) }, vec!["text"])]
    #[case(SubmitRequest { text: Some("hi".into()), to: None }, vec!["to"])]
    #[case(SubmitRequest { text: Some(String::new()), to: Some(String::new()) }, vec!["text", "to"])]
    #[case(SubmitRequest::default(), vec!["text", "to"])]
    #[tokio::test]
    async fn test_invalid_submission_creates_nothing(
        #[case] request: SubmitRequest,
        #[case] expected: Vec<&'static str>,
    ) {
        let f = fixture().await;

        let err = f.service.submit(request).await.unwrap_err();
        match err {
            SubmitError::InvalidRequest(e) => assert_eq!(e.missing_fields, expected),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(f.store.is_empty().await);
        assert_eq!(f.broker.ready_len(QUEUE).await, 0);
    }

    #[tokio::test]
    async fn test_get_status_unknown_is_not_found() {
        let f = fixture().await;
        let id = RequestId::from_ulid(Ulid::new());
        let err = f.service.get_status(id).await.unwrap_err();
        assert!(matches!(err, SubmitError::NotFound(missing) if missing == id));
    }

    #[tokio::test]
    async fn test_publish_failure_marks_record_failed() {
        let id = RequestId::from_ulid(Ulid::new());
        let f = fixture_with(Arc::new(ScriptedIds::new(&[id])), failing_policy()).await;
        break_transport(&f).await;

        let err = f
            .service
            .submit(SubmitRequest::new("hello", "xx"))
            .await
            .unwrap_err();
        assert!(matches!(err, SubmitError::QueueUnavailable { request_id, .. } if request_id == id));

        let record = f.service.get_status(id).await.unwrap();
        assert_eq!(record.status, TaskStatus::Failed);
        assert_eq!(record.error_kind, Some(FailureKind::Enqueue));
        assert!(record.error.is_some());
    }

    #[tokio::test]
    async fn test_retry_resubmits_failed_record() {
        let first = RequestId::from_ulid(Ulid::new());
        let second = RequestId::from_ulid(Ulid::new());
        let f = fixture_with(
            Arc::new(ScriptedIds::new(&[first, second])),
            ReconnectPolicy::new(3, Duration::from_millis(5)),
        )
        .await;

        f.service.submit(SubmitRequest::new("hello", "xx")).await.unwrap();
        f.store
            .transition(
                first,
                Transition::Fail {
                    kind: FailureKind::Transformation,
                    detail: "boom".into(),
                },
                Utc::now(),
            )
            .await
            .unwrap();

        let receipt = f.service.retry(first).await.unwrap();
        assert_eq!(receipt.request_id, second);

        let original = f.service.get_status(first).await.unwrap();
        assert_eq!(original.status, TaskStatus::Failed);
        let resubmitted = f.service.get_status(second).await.unwrap();
        assert_eq!(resubmitted.status, TaskStatus::Queued);
        assert_eq!(resubmitted.text, "hello");
        assert_eq!(f.broker.ready_len(QUEUE).await, 2);
    }

    #[tokio::test]
    async fn test_retry_rejects_non_failed_and_unknown() {
        let f = fixture().await;
        let receipt = f.service.submit(SubmitRequest::new("hello", "xx")).await.unwrap();

        let err = f.service.retry(receipt.request_id).await.unwrap_err();
        assert!(matches!(
            err,
            SubmitError::NotRetryable { status: TaskStatus::Queued, .. }
        ));

        let err = f.service.retry(RequestId::from_ulid(Ulid::new())).await.unwrap_err();
        assert!(matches!(err, SubmitError::NotFound(_)));
    }
}
