//! Errors - ports が返すエラー型
//!
//! # 分類
//! - StoreError: Task Record Store の障害・一意制約違反・状態遷移違反
//! - TransportError: キュー接続の障害（起動時の枯渇 / 実行中の切断）
//! - TransformError: 変換処理そのものの失敗（Task Record に記録される）

use thiserror::Error;

use super::ids::RequestId;
use super::state::TransitionError;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("task record already exists: {0}")]
    Duplicate(RequestId),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("record store error: {0}")]
    Backend(String),
}

#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// 起動時の接続試行をすべて使い切った（プロセスにとって致命的）
    #[error("queue transport unreachable after {attempts} attempts: {last_error}")]
    ConnectionExhausted { attempts: u32, last_error: String },

    /// 実行中に接続が失われた（再接続ループが回復させる）
    #[error("queue connection lost: {0}")]
    Disconnected(String),

    /// 現在使えるチャネルがない（再接続中など）
    #[error("queue transport unavailable: {0}")]
    Unavailable(String),

    #[error("queue operation failed: {0}")]
    Operation(String),
}

impl TransportError {
    /// 再接続すれば回復しうるエラーか
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TransportError::Disconnected(_) | TransportError::Unavailable(_)
        )
    }
}

/// 変換処理の失敗。`Display` がそのまま Task Record の `error` になる。
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct TransformError(pub String);

impl TransformError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}
