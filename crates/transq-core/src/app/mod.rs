//! App - アプリケーション層
//!
//! このモジュールは、ports を組み合わせてアプリケーションロジックを実装します。
//!
//! # 主要コンポーネント
//! - **SubmissionService**: 検証 → Task Record 保存 → publish → receipt
//! - **WorkerLoop**: 受信 → processing → 変換 → 終端状態 → ack
//! - **WorkerGroup**: WorkerLoop を複数タスクで動かす

pub mod submission;
pub mod worker_loop;

// 主要な型を再エクスポート
pub use self::submission::{SubmissionService, SubmitError};
pub use self::worker_loop::{DeliveryOutcome, WorkerGroup, WorkerLoop, WorkerOptions};
