//! Shared application state injected into every Axum handler.

use std::sync::Arc;

use transq_core::app::SubmissionService;
use transq_core::transport::ConnectionManager;

pub struct AppState {
    pub submission: Arc<SubmissionService>,

    /// Same manager the submission service publishes through; read by `/health`.
    pub transport: Arc<ConnectionManager>,
}
