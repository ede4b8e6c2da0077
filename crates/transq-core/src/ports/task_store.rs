//! TaskStore port - Task Record の正本（source of truth）
//!
//! TaskStore は `request_id` をキーにした Task Record を管理します。
//!
//! # 実装
//! - `InMemoryTaskStore`（開発・テスト用、`impls`）
//! - `RedisTaskStore`（本番用、`transq-redis` クレート）

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{RequestId, StoreError, TaskRecord, Transition};

/// TaskStore は Task Record の正本
///
/// # 設計原則
/// - `request_id` の一意性は `insert` で保証する
/// - 状態遷移は `transition` による read-modify-write（キー単位でアトミック）
/// - 状態遷移の可否は `TaskRecord::apply` が判断する（ストアは判断しない）
/// - 削除はしない（保持期間の管理は外部の責務）
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// 新しい Task Record を保存する。既に存在すれば `StoreError::Duplicate`。
    async fn insert(&self, record: TaskRecord) -> Result<(), StoreError>;

    /// 純粋な読み取り。
    async fn get(&self, request_id: RequestId) -> Result<Option<TaskRecord>, StoreError>;

    /// 状態遷移を適用して更新後の Task Record を返す。
    ///
    /// - レコードが存在しなければ何もせず `Ok(None)`
    /// - 遷移が拒否されたら `StoreError::Transition`（レコードは変更されない）
    async fn transition(
        &self,
        request_id: RequestId,
        transition: Transition,
        now: DateTime<Utc>,
    ) -> Result<Option<TaskRecord>, StoreError>;
}
