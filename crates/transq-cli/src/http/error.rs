//! API error type rendered as `application/problem+json`.
//!
//! Internal errors are logged with full detail; the client only sees a
//! generic message.

use axum::Json;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;
use tracing::error;
use transq_core::app::SubmitError;

const PROBLEM_JSON: &str = "application/problem+json";

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("missing required fields: {}", missing_fields.join(", "))]
    InvalidRequest { missing_fields: Vec<&'static str> },

    #[error("translation {id} not found")]
    NotFound { id: String },

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Unavailable(String),

    #[error("internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Problem {
    #[serde(rename = "type")]
    kind: &'static str,
    title: &'static str,
    status: u16,
    detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    missing_fields: Option<Vec<&'static str>>,
    #[serde(rename = "_links", skip_serializing_if = "Option::is_none")]
    links: Option<serde_json::Value>,
}

impl From<SubmitError> for ApiError {
    fn from(e: SubmitError) -> Self {
        match e {
            SubmitError::InvalidRequest(invalid) => ApiError::InvalidRequest {
                missing_fields: invalid.missing_fields,
            },
            SubmitError::NotFound(id) => ApiError::not_found(id),
            e @ SubmitError::NotRetryable { .. } => ApiError::Conflict(e.to_string()),
            SubmitError::QueueUnavailable { request_id, source } => {
                error!(%request_id, error = %source, "submission could not be queued");
                ApiError::Unavailable("translation queue is unavailable; try again later".into())
            }
            SubmitError::Store(e) => ApiError::Internal(e.to_string()),
        }
    }
}

impl ApiError {
    pub fn not_found(id: impl std::fmt::Display) -> Self {
        ApiError::NotFound { id: id.to_string() }
    }
}

fn self_link(href: &str) -> serde_json::Value {
    serde_json::json!({ "self": { "href": href } })
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let detail = self.to_string();
        let (status, title, missing_fields, links) = match self {
            ApiError::InvalidRequest { missing_fields } => (
                StatusCode::BAD_REQUEST,
                "Invalid request",
                Some(missing_fields),
                Some(self_link("/translations")),
            ),
            ApiError::NotFound { id } => (
                StatusCode::NOT_FOUND,
                "Not found",
                None,
                Some(self_link(&format!("/translations/{id}"))),
            ),
            ApiError::Conflict(_) => (StatusCode::CONFLICT, "Conflict", None, None),
            ApiError::Unavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, "Service unavailable", None, None),
            ApiError::Internal(m) => {
                error!(message = %m, "internal server error");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error", None, None)
            }
        };

        let detail = if status == StatusCode::INTERNAL_SERVER_ERROR {
            "internal server error".to_owned()
        } else {
            detail
        };

        let body = Problem {
            kind: "about:blank",
            title,
            status: status.as_u16(),
            detail,
            missing_fields,
            links,
        };
        (status, [(header::CONTENT_TYPE, PROBLEM_JSON)], Json(body)).into_response()
    }
}
