//! Domain identifiers (strongly-typed IDs).
//!
//! # ULID ベースの RequestId
//! RequestId は ULID (Universally Unique Lexicographically Sortable Identifier) を
//! 内部に持つ newtype です。
//!
//! ## ULID の特性
//! - **時刻でソート可能**: timestamp が先頭にあるため、生成順序でソートできる
//! - **分散生成可能**: API プロセスが複数あっても調整なしで生成できる
//! - **UUID互換**: 128-bit で UUID と同じサイズ
//!
//! ## ワイヤ表現
//! `req_<ULID 26 文字>` の文字列。HTTP パス・キューメッセージ・ストアのキーで
//! 同じ表現を使います。

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

const PREFIX: &str = "req_";

/// 翻訳リクエスト（Task Record）の主キー
///
/// 生成は `IdGenerator` 経由で行い、作成後は不変です。
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(Ulid);

impl RequestId {
    /// ULID から RequestId を作成
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self(ulid)
    }

    /// 内部の ULID を取得
    pub fn as_ulid(&self) -> Ulid {
        self.0
    }
}

impl From<Ulid> for RequestId {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{PREFIX}{}", self.0)
    }
}

/// RequestId の文字列表現が不正
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid request id: {0:?}")]
pub struct ParseRequestIdError(pub String);

impl FromStr for RequestId {
    type Err = ParseRequestIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s
            .strip_prefix(PREFIX)
            .ok_or_else(|| ParseRequestIdError(s.to_string()))?;
        Ulid::from_string(raw)
            .map(Self)
            .map_err(|_| ParseRequestIdError(s.to_string()))
    }
}

impl Serialize for RequestId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for RequestId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
