//! Ports - 抽象化レイヤー
//!
//! このモジュールは Hexagonal Architecture の「ポート」を定義します。
//! 各 trait は外部システム（レコードストア、キュー、変換処理など）への
//! インターフェースを提供し、実装の詳細を隠蔽します。
//!
//! # 設計原則
//! - TaskStore が source of truth（正本）
//! - Broker/Channel は配送（TaskMessage のみ、状態は持たない）
//! - Transformer は差し替え可能な純粋関数

pub mod broker;
pub mod clock;
pub mod id_generator;
pub mod task_store;
pub mod transformer;

// 主要な trait を再エクスポート
pub use self::broker::{Broker, Channel, Delivery, DeliveryTag, PublishOptions};
pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::task_store::TaskStore;
pub use self::transformer::Transformer;
