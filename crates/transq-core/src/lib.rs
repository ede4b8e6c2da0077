//! transq-core
//!
//! Core building blocks for the transq translation pipeline.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, state, record, message, request, errors）
//! - **ports**: 抽象化レイヤー（TaskStore, Broker/Channel, Transformer, Clock, IdGenerator）
//! - **transport**: キュー接続の管理（ConnectionManager, ReconnectPolicy）
//! - **app**: アプリケーションロジック（SubmissionService, WorkerLoop）
//! - **impls**: 実装（InMemoryBroker など開発用）

pub mod app;
pub mod domain;
pub mod impls;
pub mod ports;
pub mod transport;
