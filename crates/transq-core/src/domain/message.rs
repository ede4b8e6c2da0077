//! TaskMessage - キューに流す“運搬用”データ
//!
//! Task Record を作成した時点の射影です。独自の識別子は持たず、
//! `request_id` で Task Record を参照します。

use serde::{Deserialize, Serialize};

use super::errors::TransportError;
use super::ids::RequestId;
use super::record::TaskRecord;

/// キュー上のワイヤ形式: `{"requestId": "...", "text": "...", "to": "..."}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskMessage {
    pub request_id: RequestId,
    pub text: String,
    pub to: String,
}

/// デコードできないメッセージ（poison message）
#[derive(Debug, thiserror::Error)]
#[error("malformed task message: {reason}")]
pub struct MalformedMessage {
    pub reason: String,
}

impl TaskMessage {
    pub fn from_record(record: &TaskRecord) -> Self {
        Self {
            request_id: record.request_id,
            text: record.text.clone(),
            to: record.to.clone(),
        }
    }

    /// 失敗した場合は空のペイロードを流さず、publish のエラーとして返す
    pub fn encode(&self) -> Result<Vec<u8>, TransportError> {
        serde_json::to_vec(self).map_err(encode_failed)
    }

    pub fn decode(payload: &[u8]) -> Result<Self, MalformedMessage> {
        serde_json::from_slice(payload).map_err(|e| MalformedMessage {
            reason: e.to_string(),
        })
    }
}

fn encode_failed(e: serde_json::Error) -> TransportError {
    TransportError::Operation(format!("failed to encode task message: {e}"))
}
