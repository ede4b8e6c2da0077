//! Broker / Channel port - 永続キューのトランスポート
//!
//! Broker は接続を確立してキューに束縛された Channel を開きます。
//! Channel はメッセージの publish / 受信 / ack を担当します。
//!
//! # 実装
//! - `InMemoryBroker`（開発・テスト用、`impls`）
//! - `RedisBroker`（本番用、`transq-redis` クレート）
//!
//! 接続断からの回復は `transport::ConnectionManager` の責務で、
//! Channel 自身は再接続しません。

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::domain::TransportError;

/// 受信したメッセージの識別子（Channel ごとに一意）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeliveryTag(pub u64);

impl fmt::Display for DeliveryTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishOptions {
    /// トランスポートの再起動後もメッセージを保持する
    pub persistent: bool,
}

impl PublishOptions {
    pub fn persistent() -> Self {
        Self { persistent: true }
    }
}

/// 受信したメッセージ。`ack` されるまでトランスポートが保持する。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub tag: DeliveryTag,
    pub payload: Vec<u8>,
    /// 以前にも配送されて ack されなかったメッセージ
    pub redelivered: bool,
}

/// Broker は接続とチャネルを確立する
///
/// # 設計原則
/// - `open` はキューを（必要なら）永続キューとして宣言する
/// - 失敗したら即座にエラーを返す（リトライは呼び出し側）
#[async_trait]
pub trait Broker: Send + Sync {
    async fn open(&self, queue: &str) -> Result<Arc<dyn Channel>, TransportError>;
}

/// Channel は 1 つの接続上のキュー操作
///
/// # 配送モデル
/// - at-least-once: ack されなかったメッセージは再接続後に再配送される
/// - `DeliveryTag` は配送した Channel でのみ有効
#[async_trait]
pub trait Channel: Send + Sync {
    /// キューに追加する。consumer の ack は待たない。
    async fn publish(&self, payload: Vec<u8>, options: PublishOptions) -> Result<(), TransportError>;

    /// 最大 `wait` だけ待ってメッセージを 1 件受け取る。
    async fn next_delivery(&self, wait: Duration) -> Result<Option<Delivery>, TransportError>;

    async fn ack(&self, tag: DeliveryTag) -> Result<(), TransportError>;

    /// `requeue = true` ならキューの先頭に戻す。
    /// `requeue = false` なら dead-letter に移す。
    async fn reject(&self, tag: DeliveryTag, requeue: bool) -> Result<(), TransportError>;

    /// 接続が失われたら（error / close イベント）理由とともに完了する。
    async fn closed(&self) -> String;
}
