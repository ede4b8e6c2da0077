//! ReverseTransformer - 文字列を反転するだけの変換処理
//!
//! 本物の翻訳エンジンの代わりに使う。`to` は無視する。

use async_trait::async_trait;

use crate::domain::TransformError;
use crate::ports::Transformer;

#[derive(Debug, Clone, Copy, Default)]
pub struct ReverseTransformer;

#[async_trait]
impl Transformer for ReverseTransformer {
    async fn transform(&self, text: &str, _to: &str) -> Result<String, TransformError> {
        Ok(text.chars().rev().collect())
    }
}
