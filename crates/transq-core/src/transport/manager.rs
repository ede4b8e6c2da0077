//! Connection manager: owns the queue channel and keeps it alive.
//!
//! The current channel sits in a `watch` slot. Readers clone the `Arc` out
//! of the slot, so an operation that started on the old channel keeps it
//! until it finishes, and nobody ever sees a half-opened channel. The slot
//! is only written by `connect` and by the supervisor task.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info, warn};

use super::policy::ReconnectPolicy;
use crate::domain::{TaskMessage, TransportError};
use crate::ports::{Broker, Channel, PublishOptions};

/// Observable state of the logical connection.
///
/// State transitions:
/// - Connected -> Reconnecting -> Connected (connection lost and recovered)
/// - Reconnecting -> Failed (reconnect budget exhausted)
/// - any -> Closed (shutdown)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Reconnecting { attempt: u32 },
    Failed,
    Closed,
}

impl ConnectionState {
    pub fn is_connected(self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting { .. } => "reconnecting",
            ConnectionState::Failed => "failed",
            ConnectionState::Closed => "closed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Reconnecting { attempt } => write!(f, "reconnecting (attempt {attempt})"),
            other => f.write_str(other.as_str()),
        }
    }
}

type ChannelSlot = Option<Arc<dyn Channel>>;

struct Shared {
    broker: Arc<dyn Broker>,
    queue: String,
    policy: ReconnectPolicy,
    channel: watch::Sender<ChannelSlot>,
    state: watch::Sender<ConnectionState>,
}

/// Owns the queue connection for a process and is shared by the
/// submission path and the worker loop.
pub struct ConnectionManager {
    shared: Arc<Shared>,
    shutdown: watch::Sender<bool>,
}

impl ConnectionManager {
    /// Connect with bounded retries, then keep the connection alive in the
    /// background.
    ///
    /// Fails with `TransportError::ConnectionExhausted` after
    /// `policy.max_attempts` consecutive failures; callers treat that as
    /// fatal to startup.
    pub async fn connect(
        broker: Arc<dyn Broker>,
        queue: impl Into<String>,
        policy: ReconnectPolicy,
    ) -> Result<Arc<Self>, TransportError> {
        let queue = queue.into();
        let channel = open_with_retry(broker.as_ref(), &queue, &policy).await?;

        let (channel_tx, _) = watch::channel(Some(Arc::clone(&channel)));
        let (state_tx, _) = watch::channel(ConnectionState::Connected);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let shared = Arc::new(Shared {
            broker,
            queue,
            policy,
            channel: channel_tx,
            state: state_tx,
        });

        tokio::spawn(supervise(Arc::clone(&shared), channel, shutdown_rx));

        Ok(Arc::new(Self {
            shared,
            shutdown: shutdown_tx,
        }))
    }

    pub fn queue(&self) -> &str {
        &self.shared.queue
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// The channel in use right now, if any.
    pub fn current_channel(&self) -> Result<Arc<dyn Channel>, TransportError> {
        let slot = self.shared.channel.borrow().clone();
        slot.ok_or_else(|| TransportError::Unavailable(self.state().to_string()))
    }

    /// Wait up to `timeout` for a channel to be available.
    pub async fn wait_for_channel(&self, timeout: Duration) -> Result<Arc<dyn Channel>, TransportError> {
        self.wait_channel_where(timeout, |_| true).await
    }

    /// Publish a task message with persistence enabled.
    ///
    /// If the channel is gone or the publish hits a disconnect, waits up to
    /// `policy.publish_wait` for the supervisor to install a new channel and
    /// retries once.
    pub async fn publish(&self, message: &TaskMessage) -> Result<(), TransportError> {
        let payload = message.encode()?;
        let wait = self.shared.policy.publish_wait;

        let channel = match self.current_channel() {
            Ok(channel) => channel,
            Err(_) => self.wait_for_channel(wait).await?,
        };

        match channel.publish(payload.clone(), PublishOptions::persistent()).await {
            Err(e) if e.is_transient() => {
                warn!(
                    queue = %self.shared.queue,
                    request_id = %message.request_id,
                    error = %e,
                    "publish hit a dead channel; waiting for reconnection"
                );
                let fresh = self
                    .wait_channel_where(wait, |c| !same_channel(c, &channel))
                    .await?;
                fresh.publish(payload, PublishOptions::persistent()).await
            }
            other => other,
        }
    }

    /// Stop the supervisor and drop the channel.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
        self.shared.channel.send_replace(None);
        self.shared.state.send_replace(ConnectionState::Closed);
    }

    async fn wait_channel_where<F>(
        &self,
        timeout: Duration,
        accept: F,
    ) -> Result<Arc<dyn Channel>, TransportError>
    where
        F: Fn(&Arc<dyn Channel>) -> bool,
    {
        let mut rx = self.shared.channel.subscribe();
        let waited = tokio::time::timeout(
            timeout,
            rx.wait_for(|slot| slot.as_ref().is_some_and(&accept)),
        )
        .await;

        match waited {
            Ok(Ok(slot)) => (*slot)
                .clone()
                .ok_or_else(|| TransportError::Unavailable(self.state().to_string())),
            Ok(Err(_)) | Err(_) => Err(TransportError::Unavailable(self.state().to_string())),
        }
    }
}

fn same_channel(a: &Arc<dyn Channel>, b: &Arc<dyn Channel>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

async fn open_with_retry(
    broker: &dyn Broker,
    queue: &str,
    policy: &ReconnectPolicy,
) -> Result<Arc<dyn Channel>, TransportError> {
    let attempts = policy.max_attempts.max(1);
    let mut last_error = String::new();

    for attempt in 1..=attempts {
        match broker.open(queue).await {
            Ok(channel) => {
                info!(queue, attempt, "connected to queue transport");
                return Ok(channel);
            }
            Err(e) => {
                warn!(
                    queue,
                    attempt,
                    max_attempts = attempts,
                    error = %e,
                    "queue connection attempt failed"
                );
                last_error = e.to_string();
                if attempt < attempts {
                    tokio::time::sleep(policy.next_delay(attempt)).await;
                }
            }
        }
    }

    Err(TransportError::ConnectionExhausted {
        attempts,
        last_error,
    })
}

/// Resolves once shutdown is requested or the manager is dropped.
async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

fn stopping(rx: &watch::Receiver<bool>) -> bool {
    *rx.borrow() || rx.has_changed().is_err()
}

/// Supervisor task: waits for the channel to close, then reconnects.
async fn supervise(shared: Arc<Shared>, mut channel: Arc<dyn Channel>, mut shutdown: watch::Receiver<bool>) {
    let final_state = loop {
        let reason = tokio::select! {
            reason = channel.closed() => reason,
            _ = shutdown_requested(&mut shutdown) => break ConnectionState::Closed,
        };

        warn!(queue = %shared.queue, reason = %reason, "queue connection lost; reconnecting");
        shared.channel.send_replace(None);

        match reconnect(&shared, &mut shutdown).await {
            Some(fresh) => {
                channel = fresh;
                shared.channel.send_replace(Some(Arc::clone(&channel)));
                shared.state.send_replace(ConnectionState::Connected);
            }
            None if stopping(&shutdown) => break ConnectionState::Closed,
            None => break ConnectionState::Failed,
        }
    };

    shared.channel.send_replace(None);
    shared.state.send_replace(final_state);
}

/// Retry until a channel opens. `None` on shutdown or when the reconnect
/// budget runs out.
async fn reconnect(shared: &Shared, shutdown: &mut watch::Receiver<bool>) -> Option<Arc<dyn Channel>> {
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        if let Some(max) = shared.policy.max_reconnect_attempts
            && attempt > max
        {
            error!(queue = %shared.queue, attempts = max, "giving up on queue reconnection");
            return None;
        }
        shared.state.send_replace(ConnectionState::Reconnecting { attempt });

        tokio::select! {
            _ = tokio::time::sleep(shared.policy.next_delay(attempt)) => {}
            _ = shutdown_requested(shutdown) => return None,
        }

        match shared.broker.open(&shared.queue).await {
            Ok(_) if stopping(shutdown) => return None,
            Ok(channel) => {
                info!(queue = %shared.queue, attempt, "queue connection re-established");
                return Some(channel);
            }
            Err(e) => {
                warn!(queue = %shared.queue, attempt, error = %e, "queue reconnection attempt failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::RequestId;
    use crate::impls::InMemoryBroker;
    use ulid::Ulid;

    const QUEUE: &str = "translation_tasks";

    fn fast_policy() -> ReconnectPolicy {
        ReconnectPolicy::new(3, Duration::from_millis(5)).with_publish_wait(Duration::from_secs(2))
    }

    fn message() -> TaskMessage {
        TaskMessage {
            request_id: RequestId::from_ulid(Ulid::new()),
            text: "hello".into(),
            to: "xx".into(),
        }
    }

    async fn wait_for_state(manager: &ConnectionManager, want: ConnectionState) {
        let mut rx = manager.subscribe();
        tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|s| *s == want))
            .await
            .expect("state not reached")
            .unwrap();
    }

    #[tokio::test]
    async fn connect_gives_up_after_max_attempts() {
        let broker = InMemoryBroker::new();
        broker.set_unreachable(true).await;

        let err = ConnectionManager::connect(Arc::new(broker), QUEUE, fast_policy())
            .await
            .err()
            .unwrap();
        match err {
            TransportError::ConnectionExhausted { attempts, last_error } => {
                assert_eq!(attempts, 3);
                assert!(last_error.contains("unreachable"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn connect_retries_refused_connections() {
        let broker = InMemoryBroker::new();
        broker.refuse_connections(2).await;

        let manager = ConnectionManager::connect(Arc::new(broker), QUEUE, fast_policy())
            .await
            .unwrap();
        assert_eq!(manager.state(), ConnectionState::Connected);
        assert_eq!(manager.queue(), QUEUE);
    }

    #[tokio::test]
    async fn reconnects_after_connection_loss() {
        let broker = InMemoryBroker::new();
        let manager = ConnectionManager::connect(Arc::new(broker.clone()), QUEUE, fast_policy())
            .await
            .unwrap();
        let before = manager.current_channel().unwrap();

        broker.disconnect("socket reset").await;

        let after = manager
            .wait_channel_where(Duration::from_secs(2), |c| !same_channel(c, &before))
            .await
            .unwrap();
        assert!(!same_channel(&before, &after));
        assert_eq!(manager.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn publish_waits_for_reconnection() {
        let broker = InMemoryBroker::new();
        let manager = ConnectionManager::connect(Arc::new(broker.clone()), QUEUE, fast_policy())
            .await
            .unwrap();

        broker.set_unreachable(true).await;
        broker.disconnect("socket reset").await;

        let publishing = tokio::spawn({
            let manager = Arc::clone(&manager);
            async move { manager.publish(&message()).await }
        });
        tokio::time::sleep(Duration::from_millis(30)).await;
        broker.set_unreachable(false).await;

        publishing.await.unwrap().unwrap();
        assert_eq!(broker.ready_len(QUEUE).await, 1);
    }

    #[tokio::test]
    async fn exhausted_reconnect_budget_fails_publishes() {
        let broker = InMemoryBroker::new();
        let policy = fast_policy()
            .with_max_reconnect_attempts(2)
            .with_publish_wait(Duration::from_millis(20));
        let manager = ConnectionManager::connect(Arc::new(broker.clone()), QUEUE, policy)
            .await
            .unwrap();

        broker.set_unreachable(true).await;
        broker.disconnect("socket reset").await;
        wait_for_state(&manager, ConnectionState::Failed).await;

        let err = manager.publish(&message()).await.unwrap_err();
        assert!(matches!(err, TransportError::Unavailable(_)));
        assert_eq!(broker.ready_len(QUEUE).await, 0);
    }

    #[tokio::test]
    async fn shutdown_closes_connection() {
        let broker = InMemoryBroker::new();
        let manager = ConnectionManager::connect(Arc::new(broker), QUEUE, fast_policy())
            .await
            .unwrap();

        manager.shutdown();
        wait_for_state(&manager, ConnectionState::Closed).await;
        assert!(manager.current_channel().is_err());
    }
}
