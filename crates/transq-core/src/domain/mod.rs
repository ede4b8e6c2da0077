//! Domain model (ids, status, records, messages, errors).

pub mod errors;
pub mod ids;
pub mod message;
pub mod record;
pub mod request;
pub mod state;

pub use errors::{StoreError, TransformError, TransportError};
pub use ids::{ParseRequestIdError, RequestId};
pub use message::{MalformedMessage, TaskMessage};
pub use record::{TaskRecord, Transition};
pub use request::{InvalidRequest, Receipt, SubmitRequest, ValidRequest};
pub use state::{FailureKind, TaskStatus, TransitionError};
