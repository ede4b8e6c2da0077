//! Transformer port - ペイロードに適用する変換処理
//!
//! 実際の翻訳アルゴリズムは外部の関心事です。
//! `(text, to) -> output | error` を満たす関数なら何でも差し込めます。
//!
//! # 注意
//! at-least-once 配送のため、同じ入力で複数回呼ばれることがあります。
//! 実装は冪等（または副作用なし）である必要があります。

use async_trait::async_trait;

use crate::domain::TransformError;

#[async_trait]
pub trait Transformer: Send + Sync {
    async fn transform(&self, text: &str, to: &str) -> Result<String, TransformError>;
}
