//! Impls - 実装（開発用・テスト用）
//!
//! このモジュールには ports の実装を含めます。
//!
//! # 含まれる実装
//! - **InMemoryBroker**: 開発用のキュートランスポート（障害注入つき）
//! - **InMemoryTaskStore**: テスト用の正本
//! - **ReverseTransformer**: 文字列を反転するダミーの翻訳処理
//!
//! # 本番用実装
//! 本番用の実装は別クレートに配置します：
//! - `transq-redis`: RedisBroker / RedisTaskStore

pub mod inmem_broker;
pub mod inmem_store;
pub mod reverse;

// 主要な型を再エクスポート
pub use self::inmem_broker::InMemoryBroker;
pub use self::inmem_store::InMemoryTaskStore;
pub use self::reverse::ReverseTransformer;
