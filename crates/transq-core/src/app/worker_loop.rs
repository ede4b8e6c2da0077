//! WorkerLoop - タスク実行ループ
//!
//! # フロー（1 メッセージずつ）
//! 1. TaskMessage をデコード（失敗したら dead-letter）
//! 2. Task Record を `processing` に遷移
//! 3. Transformer を期限つきで実行
//! 4. 終端状態を書き込んでから ack
//!
//! 4 の前にクラッシュした場合、メッセージは再接続後に再配送され、
//! Task Record はもう一度 `processing` を経て終端状態になる。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::domain::{
    FailureKind, RequestId, StoreError, TaskMessage, TaskRecord, Transition, TransportError,
};
use crate::ports::{Channel, Clock, Delivery, TaskStore, Transformer};
use crate::transport::{ConnectionManager, ConnectionState};

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Transformer 1 回あたりの期限
    pub task_timeout: Duration,

    /// チャネル待ち・メッセージ待ちの 1 回あたりの最大時間
    pub poll_interval: Duration,

    /// ストア障害で requeue した直後の待ち時間。連続するたびに倍になる。
    pub requeue_backoff: Duration,

    pub max_requeue_backoff: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            task_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_secs(1),
            requeue_backoff: Duration::from_millis(500),
            max_requeue_backoff: Duration::from_secs(30),
        }
    }
}

impl WorkerOptions {
    /// `streak` 回連続で requeue した後の待ち時間（1 始まり）
    pub fn requeue_delay(&self, streak: u32) -> Duration {
        let exponent = streak.saturating_sub(1).min(16);
        self.requeue_backoff
            .saturating_mul(1 << exponent)
            .min(self.max_requeue_backoff)
    }
}

/// 1 件の配送をどう処理したか
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Completed,
    Failed(FailureKind),
    /// デコードできず dead-letter に送った
    DeadLettered,
    /// 何もせず ack した（レコードがない / すでに終端状態）
    Skipped,
    /// ストア障害のためキューに戻した
    Requeued,
}

/// WorkerLoop はキューから 1 件ずつ取り出して処理する
pub struct WorkerLoop {
    transport: Arc<ConnectionManager>,
    store: Arc<dyn TaskStore>,
    transformer: Arc<dyn Transformer>,
    clock: Arc<dyn Clock>,
    options: WorkerOptions,
}

impl WorkerLoop {
    pub fn new(
        transport: Arc<ConnectionManager>,
        store: Arc<dyn TaskStore>,
        transformer: Arc<dyn Transformer>,
        clock: Arc<dyn Clock>,
        options: WorkerOptions,
    ) -> Self {
        Self {
            transport,
            store,
            transformer,
            clock,
            options,
        }
    }

    /// shutdown が true になるまでメッセージを処理し続ける
    ///
    /// 処理中のメッセージは最後まで処理してから抜ける。
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let queue = self.transport.queue().to_string();
        info!(%queue, "worker started");

        let mut requeue_streak: u32 = 0;
        loop {
            if *shutdown.borrow() {
                break;
            }

            // 再接続中はここで新しいチャネルを待つ
            let channel = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                channel = self.transport.wait_for_channel(self.options.poll_interval) => channel,
            };
            let channel = match channel {
                Ok(channel) => channel,
                Err(_) if self.transport.state() == ConnectionState::Closed => break,
                Err(e) => {
                    debug!(%queue, error = %e, "no queue channel yet");
                    continue;
                }
            };

            let delivery = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                delivery = channel.next_delivery(self.options.poll_interval) => delivery,
            };

            match delivery {
                Ok(Some(delivery)) => match self.handle_delivery(channel.as_ref(), delivery).await {
                    Ok(DeliveryOutcome::Requeued) => {
                        // ストアが戻るまで同じメッセージを取り直し続けない
                        requeue_streak = requeue_streak.saturating_add(1);
                        let delay = self.options.requeue_delay(requeue_streak);
                        debug!(%queue, streak = requeue_streak, delay_ms = delay.as_millis() as u64, "backing off after requeue");
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = shutdown.changed() => {}
                        }
                    }
                    Ok(_) => requeue_streak = 0,
                    Err(e) => {
                        warn!(%queue, error = %e, "could not settle delivery; it will be redelivered");
                    }
                },
                Ok(None) => {}
                Err(e) => {
                    warn!(%queue, error = %e, "consume failed; waiting for reconnection");
                    // 古いチャネルが差し替わるまで空回りしない
                    tokio::select! {
                        _ = tokio::time::sleep(self.options.poll_interval) => {}
                        _ = shutdown.changed() => {}
                    }
                }
            }
        }

        info!(%queue, "worker stopped");
    }

    /// 配送 1 件を処理して ack / reject する
    ///
    /// `Err` は ack / reject そのものが失敗した場合だけ（再配送に任せる）。
    pub async fn handle_delivery(
        &self,
        channel: &dyn Channel,
        delivery: Delivery,
    ) -> Result<DeliveryOutcome, TransportError> {
        let message = match TaskMessage::decode(&delivery.payload) {
            Ok(message) => message,
            Err(e) => {
                warn!(tag = %delivery.tag, error = %e, "poison message; dead-lettering");
                channel.reject(delivery.tag, false).await?;
                return Ok(DeliveryOutcome::DeadLettered);
            }
        };
        let request_id = message.request_id;

        let record = match self.store.transition(request_id, Transition::Start, self.clock.now()).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                warn!(%request_id, "no task record for message; acking");
                channel.ack(delivery.tag).await?;
                return Ok(DeliveryOutcome::Skipped);
            }
            Err(StoreError::Transition(e)) => {
                // 終端状態まで書き終えたメッセージの再配送
                info!(%request_id, status = %e.from, "task already settled; acking redelivery");
                channel.ack(delivery.tag).await?;
                return Ok(DeliveryOutcome::Skipped);
            }
            Err(e) => {
                error!(%request_id, error = %e, "could not start task; requeueing");
                channel.reject(delivery.tag, true).await?;
                return Ok(DeliveryOutcome::Requeued);
            }
        };

        if delivery.redelivered {
            info!(%request_id, attempt = record.attempts, "processing redelivered task");
        } else {
            debug!(%request_id, attempt = record.attempts, "processing task");
        }

        let (transition, outcome) = self.transform(&message, &record).await;

        match self.store.transition(request_id, transition, self.clock.now()).await {
            Ok(_) => {
                channel.ack(delivery.tag).await?;
                Ok(outcome)
            }
            Err(StoreError::Transition(e)) => {
                warn!(%request_id, error = %e, "task settled concurrently; acking");
                channel.ack(delivery.tag).await?;
                Ok(DeliveryOutcome::Skipped)
            }
            Err(e) => {
                error!(%request_id, error = %e, "could not record task result; requeueing");
                channel.reject(delivery.tag, true).await?;
                Ok(DeliveryOutcome::Requeued)
            }
        }
    }

    async fn transform(&self, message: &TaskMessage, record: &TaskRecord) -> (Transition, DeliveryOutcome) {
        let request_id: RequestId = record.request_id;
        let deadline = self.options.task_timeout;

        match tokio::time::timeout(deadline, self.transformer.transform(&message.text, &message.to)).await {
            Ok(Ok(output)) => {
                info!(%request_id, "translation completed");
                (Transition::Complete { output }, DeliveryOutcome::Completed)
            }
            Ok(Err(e)) => {
                warn!(%request_id, error = %e, "translation failed");
                (
                    Transition::Fail {
                        kind: FailureKind::Transformation,
                        detail: e.to_string(),
                    },
                    DeliveryOutcome::Failed(FailureKind::Transformation),
                )
            }
            Err(_) => {
                warn!(%request_id, timeout_ms = deadline.as_millis() as u64, "translation timed out");
                (
                    Transition::Fail {
                        kind: FailureKind::Timeout,
                        detail: format!("transformation timed out after {}ms", deadline.as_millis()),
                    },
                    DeliveryOutcome::Failed(FailureKind::Timeout),
                )
            }
        }
    }
}

/// Worker group handle.
/// - `request_shutdown()` で新しいメッセージの取得を止める
/// - `shutdown_and_join()` で処理中のメッセージが終わるまで待つ
pub struct WorkerGroup {
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
}

impl WorkerGroup {
    /// Spawn `n` sequential loops sharing one `WorkerLoop`.
    pub fn spawn(n: usize, worker: Arc<WorkerLoop>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut joins = Vec::with_capacity(n);
        for worker_id in 0..n {
            let worker = Arc::clone(&worker);
            let rx = shutdown_rx.clone();
            joins.push(tokio::spawn(async move {
                debug!(worker_id, "worker loop spawned");
                worker.run(rx).await;
            }));
        }

        Self { shutdown_tx, joins }
    }

    pub fn len(&self) -> usize {
        self.joins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.joins.is_empty()
    }

    /// In-flight transformations are not cancelled; loops stop taking new
    /// messages.
    pub fn request_shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }

    /// Shutdown and wait for all workers.
    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        for join in self.joins {
            if let Err(e) = join.await {
                error!(error = %e, "worker task panicked");
            }
        }
    }
}
