//! Key layout shared by the broker and the store.
//!
//! ```text
//! {prefix}:queue:{queue}                          ready list (LPUSH in, consumed from the right)
//! {prefix}:queue:{queue}:processing:{consumer}    delivered, not yet acked
//! {prefix}:queue:{queue}:dead                     rejected without requeue
//! {prefix}:queue:{queue}:consumers                set of consumer ids that have opened the queue
//! {prefix}:queue:{queue}:alive:{consumer}         liveness key, expires unless refreshed
//! {prefix}:task:{request_id}                      task record hash {version, data}
//! ```

use transq_core::domain::RequestId;

pub const DEFAULT_PREFIX: &str = "transq";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueKeys {
    pub ready: String,
    pub processing: String,
    pub dead: String,
    pub consumers: String,
    pub alive: String,
}

impl QueueKeys {
    pub fn new(prefix: &str, queue: &str, consumer_id: &str) -> Self {
        Self::from_ready(format!("{prefix}:queue:{queue}"), consumer_id)
    }

    /// Keys of another consumer of the same queue.
    pub fn for_consumer(&self, consumer_id: &str) -> Self {
        Self::from_ready(self.ready.clone(), consumer_id)
    }

    fn from_ready(ready: String, consumer_id: &str) -> Self {
        Self {
            processing: format!("{ready}:processing:{consumer_id}"),
            dead: format!("{ready}:dead"),
            consumers: format!("{ready}:consumers"),
            alive: format!("{ready}:alive:{consumer_id}"),
            ready,
        }
    }
}

pub fn task_key(prefix: &str, request_id: RequestId) -> String {
    format!("{prefix}:task:{request_id}")
}
