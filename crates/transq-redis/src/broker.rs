//! Redis reliable-queue transport.
//!
//! Publishing is `LPUSH` onto the ready list. Consuming moves the oldest
//! message into a per-consumer processing list with `BLMOVE`, where it stays
//! until it is acked (`LREM`) or rejected. A message left in the processing
//! list by a crash or a dropped connection goes back to the head of the
//! ready list in one of two ways:
//! - the same consumer id opens a channel again, or
//! - the consumer's liveness key expires and a live consumer reclaims the
//!   list on its next heartbeat.
//!
//! Blocking reads use their own connection so a long `BLMOVE` never queues
//! up in front of acks and publishes. Publish-only brokers
//! (`RedisBroker::publisher`) skip that connection and the consumer
//! bookkeeping.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use ::redis::aio::MultiplexedConnection;
use ::redis::{AsyncCommands, RedisError, Script};
use async_trait::async_trait;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use transq_core::domain::TransportError;
use transq_core::ports::{Broker, Channel, Delivery, DeliveryTag, PublishOptions};

use crate::keys::{DEFAULT_PREFIX, QueueKeys};

/// Move every message in the processing list back to the consuming end of
/// the ready list, oldest delivery ending up first in line.
///
/// `BLMOVE .. RIGHT LEFT` pushes each delivery on the left of the processing
/// list, so its left end holds the newest. Popping LEFT and pushing RIGHT
/// lands the newest on the consuming end first; every older message is
/// pushed after it and is consumed before it.
///
/// KEYS[1] = processing list, KEYS[2] = ready list.
/// Returns: number of messages moved.
const LUA_RECOVER: &str = r#"
local moved = 0
while redis.call('LMOVE', KEYS[1], KEYS[2], 'LEFT', 'RIGHT') do
    moved = moved + 1
end
return moved
"#;

/// Reclaim a consumer's processing list if its liveness key has expired.
///
/// KEYS[1] = liveness key, KEYS[2] = processing list, KEYS[3] = ready list,
/// KEYS[4] = consumer set. ARGV[1] = consumer id.
/// Returns: -1 if the consumer is alive, otherwise the number of messages moved.
const LUA_RECLAIM: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then
    return -1
end
local moved = 0
while redis.call('LMOVE', KEYS[2], KEYS[3], 'LEFT', 'RIGHT') do
    moved = moved + 1
end
redis.call('SREM', KEYS[4], ARGV[1])
return moved
"#;

/// Remove one copy of a delivered message and push it somewhere else.
///
/// KEYS[1] = processing list, KEYS[2] = destination list.
/// ARGV[1] = payload, ARGV[2] = 'RPUSH' (requeue at head) or 'LPUSH' (dead letter).
/// Returns: 1 if the message was found, 0 otherwise.
const LUA_REJECT: &str = r#"
local removed = redis.call('LREM', KEYS[1], 1, ARGV[1])
if removed == 0 then
    return 0
end
redis.call(ARGV[2], KEYS[2], ARGV[1])
return 1
"#;

/// Longest single `BLMOVE` block.
const BLOCK_WINDOW: Duration = Duration::from_millis(200);

/// Heartbeats a consumer may miss before its processing list is reclaimed.
const LIVENESS_HEARTBEATS: u32 = 3;

/// How long a liveness key outlives its last refresh.
fn liveness_ttl(heartbeat: Duration) -> Duration {
    (heartbeat * LIVENESS_HEARTBEATS).max(Duration::from_secs(1))
}

/// Consumers whose processing lists may be reclaimed by `me`.
fn reclaim_candidates(members: Vec<String>, me: &str) -> Vec<String> {
    members.into_iter().filter(|id| id != me).collect()
}

/// `Broker` backed by Redis lists.
pub struct RedisBroker {
    client: ::redis::Client,
    key_prefix: String,
    /// `None` for publish-only brokers.
    consumer_id: Option<String>,
    heartbeat: Duration,
}

impl RedisBroker {
    /// Broker for a consuming process. `consumer_id` names its processing
    /// list; a stable id lets a restarted process recover its own messages
    /// immediately instead of after the liveness key expires.
    pub fn new(url: &str, consumer_id: impl Into<String>) -> Result<Self, TransportError> {
        let mut broker = Self::publisher(url)?;
        broker.consumer_id = Some(consumer_id.into());
        Ok(broker)
    }

    /// Broker whose channels only publish. `next_delivery` fails on them.
    pub fn publisher(url: &str) -> Result<Self, TransportError> {
        let client = ::redis::Client::open(url)
            .map_err(|e| TransportError::Unavailable(format!("invalid Redis URL: {e}")))?;
        Ok(Self {
            client,
            key_prefix: DEFAULT_PREFIX.to_string(),
            consumer_id: None,
            heartbeat: Duration::from_secs(5),
        })
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn with_heartbeat(mut self, interval: Duration) -> Self {
        self.heartbeat = interval;
        self
    }

    async fn connection(&self) -> Result<MultiplexedConnection, TransportError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| TransportError::Unavailable(format!("failed to connect to Redis: {e}")))
    }

    /// Registers the consumer, recovers its own list and reclaims orphans.
    async fn register_consumer(
        &self,
        conn: &mut MultiplexedConnection,
        keys: &QueueKeys,
        consumer_id: &str,
        ttl: Duration,
    ) -> Result<(), TransportError> {
        let unavailable = |what: &str, e: RedisError| TransportError::Unavailable(format!("{what}: {e}"));

        refresh_liveness(conn, keys, consumer_id, ttl)
            .await
            .map_err(|e| unavailable("liveness refresh failed", e))?;
        let _: i64 = conn
            .sadd(&keys.consumers, consumer_id)
            .await
            .map_err(|e| unavailable("consumer registration failed", e))?;

        let recovered: i64 = Script::new(LUA_RECOVER)
            .key(&keys.processing)
            .key(&keys.ready)
            .invoke_async(conn)
            .await
            .map_err(|e| unavailable("queue recovery failed", e))?;
        if recovered > 0 {
            info!(queue = %keys.ready, recovered, consumer = consumer_id, "requeued unacknowledged messages");
        }

        reclaim_orphans(conn, keys, consumer_id)
            .await
            .map_err(|e| unavailable("orphan reclaim failed", e))?;
        Ok(())
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn open(&self, queue: &str) -> Result<Arc<dyn Channel>, TransportError> {
        let keys = QueueKeys::new(&self.key_prefix, queue, self.consumer_id.as_deref().unwrap_or_default());
        let mut conn = self.connection().await?;

        let (blocking, liveness) = match &self.consumer_id {
            Some(consumer_id) => {
                let ttl = liveness_ttl(self.heartbeat);
                self.register_consumer(&mut conn, &keys, consumer_id, ttl).await?;
                let liveness = Liveness {
                    keys: keys.clone(),
                    consumer_id: consumer_id.clone(),
                    ttl,
                };
                (Some(self.connection().await?), Some(liveness))
            }
            None => (None, None),
        };

        let (closed_tx, _) = watch::channel(None);
        let closed = Arc::new(closed_tx);
        let heartbeat = tokio::spawn(heartbeat(conn.clone(), Arc::clone(&closed), self.heartbeat, liveness));

        Ok(Arc::new(RedisChannel {
            keys,
            conn,
            blocking,
            inflight: Mutex::new(HashMap::new()),
            next_tag: AtomicU64::new(1),
            closed,
            heartbeat,
        }))
    }
}

type CloseSignal = Arc<watch::Sender<Option<String>>>;

fn mark_closed(closed: &CloseSignal, reason: String) {
    closed.send_if_modified(|current| {
        if current.is_some() {
            return false;
        }
        *current = Some(reason);
        true
    });
}

fn is_connection_error(err: &RedisError) -> bool {
    err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal()
}

async fn refresh_liveness(
    conn: &mut MultiplexedConnection,
    keys: &QueueKeys,
    consumer_id: &str,
    ttl: Duration,
) -> Result<(), RedisError> {
    let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
    ::redis::cmd("SET")
        .arg(&keys.alive)
        .arg(consumer_id)
        .arg("PX")
        .arg(ttl_ms)
        .query_async::<()>(conn)
        .await
}

/// Moves the processing lists of expired consumers back to the ready list.
async fn reclaim_orphans(
    conn: &mut MultiplexedConnection,
    keys: &QueueKeys,
    consumer_id: &str,
) -> Result<(), RedisError> {
    let members: Vec<String> = conn.smembers(&keys.consumers).await?;
    for other in reclaim_candidates(members, consumer_id) {
        let theirs = keys.for_consumer(&other);
        let moved: i64 = Script::new(LUA_RECLAIM)
            .key(&theirs.alive)
            .key(&theirs.processing)
            .key(&theirs.ready)
            .key(&theirs.consumers)
            .arg(&other)
            .invoke_async(conn)
            .await?;
        if moved > 0 {
            info!(queue = %keys.ready, consumer = %other, moved, "reclaimed processing list of expired consumer");
        } else if moved == 0 {
            debug!(queue = %keys.ready, consumer = %other, "forgot expired consumer");
        }
    }
    Ok(())
}

/// Consumer bookkeeping refreshed by the heartbeat.
struct Liveness {
    keys: QueueKeys,
    consumer_id: String,
    ttl: Duration,
}

async fn heartbeat(
    mut conn: MultiplexedConnection,
    closed: CloseSignal,
    interval: Duration,
    liveness: Option<Liveness>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if closed.borrow().is_some() {
            return;
        }
        let beat = match &liveness {
            Some(l) => refresh_liveness(&mut conn, &l.keys, &l.consumer_id, l.ttl).await,
            None => ::redis::cmd("PING").query_async::<String>(&mut conn).await.map(drop),
        };
        if let Err(e) = beat {
            warn!(error = %e, "Redis heartbeat failed");
            mark_closed(&closed, format!("heartbeat failed: {e}"));
            return;
        }

        let Some(l) = &liveness else { continue };
        if let Err(e) = reclaim_orphans(&mut conn, &l.keys, &l.consumer_id).await {
            if is_connection_error(&e) {
                mark_closed(&closed, format!("orphan reclaim failed: {e}"));
                return;
            }
            warn!(error = %e, queue = %l.keys.ready, "orphan reclaim failed");
        }
    }
}

/// Redis connections bound to a queue. Only consumers hold a blocking one.
struct RedisChannel {
    keys: QueueKeys,
    conn: MultiplexedConnection,
    blocking: Option<MultiplexedConnection>,

    /// Payloads of unacked deliveries by tag. `LREM` needs the exact bytes.
    inflight: Mutex<HashMap<u64, Vec<u8>>>,
    next_tag: AtomicU64,
    closed: CloseSignal,
    heartbeat: JoinHandle<()>,
}

impl RedisChannel {
    fn ensure_open(&self) -> Result<(), TransportError> {
        match self.closed.borrow().as_ref() {
            Some(reason) => Err(TransportError::Disconnected(reason.clone())),
            None => Ok(()),
        }
    }

    fn map_error(&self, err: RedisError, op: &str) -> TransportError {
        if is_connection_error(&err) {
            let reason = format!("{op}: {err}");
            mark_closed(&self.closed, reason.clone());
            TransportError::Disconnected(reason)
        } else {
            TransportError::Operation(format!("{op} on {}: {err}", self.keys.ready))
        }
    }

    async fn take_inflight(&self, tag: DeliveryTag) -> Result<Vec<u8>, TransportError> {
        self.inflight
            .lock()
            .await
            .remove(&tag.0)
            .ok_or_else(|| TransportError::Operation(format!("unknown delivery tag {tag}")))
    }
}

impl Drop for RedisChannel {
    fn drop(&mut self) {
        self.heartbeat.abort();
    }
}

#[async_trait]
impl Channel for RedisChannel {
    async fn publish(&self, payload: Vec<u8>, options: PublishOptions) -> Result<(), TransportError> {
        self.ensure_open()?;
        // Durability is whatever the server's AOF/RDB setup gives every key.
        if !options.persistent {
            debug!(queue = %self.keys.ready, "non-persistent publish is stored like any other");
        }
        let _: i64 = self
            .conn
            .clone()
            .lpush(&self.keys.ready, payload)
            .await
            .map_err(|e| self.map_error(e, "LPUSH"))?;
        Ok(())
    }

    async fn next_delivery(&self, wait: Duration) -> Result<Option<Delivery>, TransportError> {
        let Some(mut blocking) = self.blocking.clone() else {
            return Err(TransportError::Operation(format!(
                "{} is open for publishing only",
                self.keys.ready
            )));
        };
        let deadline = Instant::now() + wait;
        loop {
            self.ensure_open()?;
            let window = deadline
                .saturating_duration_since(Instant::now())
                .min(BLOCK_WINDOW)
                .max(Duration::from_millis(10));

            let moved: Option<Vec<u8>> = ::redis::cmd("BLMOVE")
                .arg(&self.keys.ready)
                .arg(&self.keys.processing)
                .arg("RIGHT")
                .arg("LEFT")
                .arg(window.as_secs_f64())
                .query_async(&mut blocking)
                .await
                .map_err(|e| self.map_error(e, "BLMOVE"))?;

            if let Some(payload) = moved {
                let tag = self.next_tag.fetch_add(1, Ordering::Relaxed);
                self.inflight.lock().await.insert(tag, payload.clone());
                return Ok(Some(Delivery {
                    tag: DeliveryTag(tag),
                    payload,
                    redelivered: false,
                }));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
        }
    }

    async fn ack(&self, tag: DeliveryTag) -> Result<(), TransportError> {
        self.ensure_open()?;
        let payload = self.take_inflight(tag).await?;
        let _: i64 = self
            .conn
            .clone()
            .lrem(&self.keys.processing, 1, payload)
            .await
            .map_err(|e| self.map_error(e, "LREM"))?;
        Ok(())
    }

    async fn reject(&self, tag: DeliveryTag, requeue: bool) -> Result<(), TransportError> {
        self.ensure_open()?;
        let payload = self.take_inflight(tag).await?;
        let (destination, push) = if requeue {
            (&self.keys.ready, "RPUSH")
        } else {
            (&self.keys.dead, "LPUSH")
        };

        let found: i64 = Script::new(LUA_REJECT)
            .key(&self.keys.processing)
            .key(destination)
            .arg(payload)
            .arg(push)
            .invoke_async(&mut self.conn.clone())
            .await
            .map_err(|e| self.map_error(e, "reject"))?;
        if found == 0 {
            warn!(queue = %self.keys.ready, %tag, "rejected message was no longer in the processing list");
        }
        Ok(())
    }

    async fn closed(&self) -> String {
        let mut rx = self.closed.subscribe();
        match rx.wait_for(Option::is_some).await {
            Ok(reason) => reason.clone().unwrap_or_default(),
            Err(_) => "channel dropped".to_string(),
        }
    }
}
