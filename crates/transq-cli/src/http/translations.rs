//! Translation endpoints.
//!
//! - `POST /translations`                        submit, `202` + receipt
//! - `GET  /translations/{request_id}`           poll status
//! - `POST /translations/{request_id}/retry`     resubmit a failed translation

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use transq_core::domain::{FailureKind, Receipt, RequestId, SubmitRequest, TaskRecord, TaskStatus};

use super::error::ApiError;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/translations", post(submit_translation))
        .route("/translations/{request_id}", get(get_translation))
        .route("/translations/{request_id}/retry", post(retry_translation))
}

#[derive(Debug, Serialize)]
struct Link {
    href: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    method: Option<&'static str>,
}

impl Link {
    fn to(href: String) -> Self {
        Self { href, method: None }
    }
}

#[derive(Debug, Serialize)]
struct ReceiptLinks {
    #[serde(rename = "self")]
    this: Link,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ReceiptResponse {
    request_id: RequestId,
    status: TaskStatus,
    message: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_of: Option<RequestId>,
    #[serde(rename = "_links")]
    links: ReceiptLinks,
}

impl ReceiptResponse {
    fn new(receipt: Receipt, retry_of: Option<RequestId>) -> Self {
        Self {
            request_id: receipt.request_id,
            status: receipt.status,
            message: "translation queued",
            retry_of,
            links: ReceiptLinks {
                this: Link::to(self_href(receipt.request_id)),
            },
        }
    }
}

#[derive(Debug, Serialize)]
struct StatusLinks {
    #[serde(rename = "self")]
    this: Link,
    retry: Link,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusResponse {
    request_id: RequestId,
    status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    translated_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_kind: Option<FailureKind>,
    attempts: u32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    #[serde(rename = "_links")]
    links: StatusLinks,
}

impl From<TaskRecord> for StatusResponse {
    fn from(record: TaskRecord) -> Self {
        let href = self_href(record.request_id);
        Self {
            request_id: record.request_id,
            status: record.status,
            translated_text: record.translated_text,
            error: record.error,
            error_kind: record.error_kind,
            attempts: record.attempts,
            created_at: record.created_at,
            updated_at: record.updated_at,
            links: StatusLinks {
                retry: Link {
                    href: format!("{href}/retry"),
                    method: Some("POST"),
                },
                this: Link::to(href),
            },
        }
    }
}

fn self_href(request_id: RequestId) -> String {
    format!("/translations/{request_id}")
}

/// Anything that is not a JSON object with string fields counts as missing
/// those fields.
fn submit_request_from(body: &[u8]) -> SubmitRequest {
    let value: Value = serde_json::from_slice(body).unwrap_or(Value::Null);
    let field = |name: &str| value.get(name).and_then(Value::as_str).map(str::to_owned);
    SubmitRequest {
        text: field("text"),
        to: field("to"),
    }
}

fn parse_request_id(raw: &str) -> Result<RequestId, ApiError> {
    raw.parse().map_err(|_| ApiError::not_found(raw))
}

async fn submit_translation(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<(StatusCode, Json<ReceiptResponse>), ApiError> {
    let receipt = state.submission.submit(submit_request_from(&body)).await?;
    Ok((StatusCode::ACCEPTED, Json(ReceiptResponse::new(receipt, None))))
}

async fn get_translation(
    State(state): State<Arc<AppState>>,
    Path(request_id): Path<String>,
) -> Result<Json<StatusResponse>, ApiError> {
    let request_id = parse_request_id(&request_id)?;
    let record = state.submission.get_status(request_id).await?;
    Ok(Json(record.into()))
}

async fn retry_translation(
    State(state): State<Arc<AppState>>,
    Path(request_id): Path<String>,
) -> Result<(StatusCode, Json<ReceiptResponse>), ApiError> {
    let request_id = parse_request_id(&request_id)?;
    let receipt = state.submission.retry(request_id).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(ReceiptResponse::new(receipt, Some(request_id))),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(br#"{"text":"hello","to":"xx"}"#.as_slice(), Some("hello"), Some("xx"))]
    #[case(br#"{"text":"hello"}"#.as_slice(), Some("hello"), None)]
    #[case(br#"{"text":1,"to":["xx"]}"#.as_slice(), None, None)]
    #[case(br#"["hello","xx"]"#.as_slice(), None, None)]
    #[case(b"not json".as_slice(), None, None)]
    #[case(b"".as_slice(), None, None)]
    fn test_body_fields(#[case] body: &[u8], #[case] text: Option<&str>, #[case] to: Option<&str>) {
        let request = submit_request_from(body);
        assert_eq!(request.text.as_deref(), text);
        assert_eq!(request.to.as_deref(), to);
    }
}
