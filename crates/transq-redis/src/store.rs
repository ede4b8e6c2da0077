//! Redis TaskStore.
//!
//! Each Task Record is a hash `{version, data}` where `data` is the record
//! as JSON. Inserts use a Lua insert-if-absent; transitions are optimistic
//! read-modify-write loops closed by a Lua compare-and-set on `version`.

use std::collections::HashMap;

use ::redis::aio::MultiplexedConnection;
use ::redis::{AsyncCommands, Script};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;

use transq_core::domain::{RequestId, StoreError, TaskRecord, Transition};
use transq_core::ports::TaskStore;

use crate::keys::{DEFAULT_PREFIX, task_key};

/// KEYS[1] = task hash key. ARGV[1] = data JSON.
/// Returns: 1 if created, 0 if the key already existed.
const LUA_INSERT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then
    return 0
end
redis.call('HSET', KEYS[1], 'version', '1', 'data', ARGV[1])
return 1
"#;

/// KEYS[1] = task hash key. ARGV[1] = data JSON, ARGV[2] = expected version.
/// Returns: 1 on success, 0 on version mismatch, -1 if the key is gone.
const LUA_PUT_IF_VERSION: &str = r#"
local current = redis.call('HGET', KEYS[1], 'version')
if not current then
    return -1
end
if tonumber(current) ~= tonumber(ARGV[2]) then
    return 0
end
redis.call('HSET', KEYS[1], 'version', tostring(tonumber(current) + 1), 'data', ARGV[1])
return 1
"#;

/// Optimistic retries before a transition gives up.
const MAX_CAS_ATTEMPTS: u32 = 8;

pub struct RedisTaskStore {
    conn: MultiplexedConnection,
    key_prefix: String,
}

impl RedisTaskStore {
    pub async fn new(url: &str) -> Result<Self, StoreError> {
        let client = ::redis::Client::open(url)
            .map_err(|e| StoreError::Backend(format!("failed to create Redis client: {e}")))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| StoreError::Backend(format!("failed to connect to Redis: {e}")))?;
        Ok(Self::from_connection(conn))
    }

    pub fn from_connection(conn: MultiplexedConnection) -> Self {
        Self {
            conn,
            key_prefix: DEFAULT_PREFIX.to_string(),
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    fn key(&self, request_id: RequestId) -> String {
        task_key(&self.key_prefix, request_id)
    }

    async fn load(&self, key: &str) -> Result<Option<(u64, TaskRecord)>, StoreError> {
        let fields: HashMap<String, String> = self
            .conn
            .clone()
            .hgetall(key)
            .await
            .map_err(|e| map_redis_error(e, key))?;
        parse_fields(&fields, key)
    }
}

fn map_redis_error(err: ::redis::RedisError, key: &str) -> StoreError {
    StoreError::Backend(format!("Redis error for key {key}: {err}"))
}

fn encode(record: &TaskRecord) -> Result<String, StoreError> {
    serde_json::to_string(record)
        .map_err(|e| StoreError::Backend(format!("failed to encode task record: {e}")))
}

/// Decode an `HGETALL` reply. An empty reply means the key does not exist.
fn parse_fields(
    fields: &HashMap<String, String>,
    key: &str,
) -> Result<Option<(u64, TaskRecord)>, StoreError> {
    if fields.is_empty() {
        return Ok(None);
    }
    let version = fields
        .get("version")
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| StoreError::Backend(format!("missing or invalid version field for key {key}")))?;
    let data = fields
        .get("data")
        .ok_or_else(|| StoreError::Backend(format!("missing data field for key {key}")))?;
    let record = serde_json::from_str(data)
        .map_err(|e| StoreError::Backend(format!("corrupt task record at {key}: {e}")))?;
    Ok(Some((version, record)))
}

#[async_trait]
impl TaskStore for RedisTaskStore {
    async fn insert(&self, record: TaskRecord) -> Result<(), StoreError> {
        let key = self.key(record.request_id);
        let created: i64 = Script::new(LUA_INSERT)
            .key(&key)
            .arg(encode(&record)?)
            .invoke_async(&mut self.conn.clone())
            .await
            .map_err(|e| map_redis_error(e, &key))?;
        if created == 0 {
            return Err(StoreError::Duplicate(record.request_id));
        }
        Ok(())
    }

    async fn get(&self, request_id: RequestId) -> Result<Option<TaskRecord>, StoreError> {
        let key = self.key(request_id);
        Ok(self.load(&key).await?.map(|(_, record)| record))
    }

    async fn transition(
        &self,
        request_id: RequestId,
        transition: Transition,
        now: DateTime<Utc>,
    ) -> Result<Option<TaskRecord>, StoreError> {
        let key = self.key(request_id);
        for attempt in 1..=MAX_CAS_ATTEMPTS {
            let Some((version, mut record)) = self.load(&key).await? else {
                return Ok(None);
            };
            record.apply(transition.clone(), now)?;

            let result: i64 = Script::new(LUA_PUT_IF_VERSION)
                .key(&key)
                .arg(encode(&record)?)
                .arg(version)
                .invoke_async(&mut self.conn.clone())
                .await
                .map_err(|e| map_redis_error(e, &key))?;
            match result {
                1 => return Ok(Some(record)),
                -1 => return Ok(None),
                _ => debug!(%request_id, attempt, "task record changed underneath; retrying"),
            }
        }
        Err(StoreError::Backend(format!(
            "gave up on {key} after {MAX_CAS_ATTEMPTS} conflicting writes"
        )))
    }
}
