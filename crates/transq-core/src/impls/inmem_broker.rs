//! In-memory broker used in development and tests.
//!
//! Models a single broker connection: every channel opened by `open`
//! belongs to the current connection generation. `disconnect` and
//! `restart` end the generation, which closes all channels and returns
//! their unacknowledged messages to the front of the queue.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify, watch};
use tokio::time::Instant;

use crate::domain::TransportError;
use crate::ports::{Broker, Channel, Delivery, DeliveryTag, PublishOptions};

#[derive(Debug, Clone)]
struct StoredMessage {
    payload: Vec<u8>,
    persistent: bool,
    redelivered: bool,
}

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<StoredMessage>,

    /// Delivered but not yet acked, keyed by tag.
    unacked: BTreeMap<u64, StoredMessage>,

    dead: Vec<Vec<u8>>,
}

impl QueueState {
    /// Put every unacked message back at the head, keeping delivery order.
    fn requeue_unacked(&mut self) {
        let unacked = std::mem::take(&mut self.unacked);
        for (_, mut message) in unacked.into_iter().rev() {
            message.redelivered = true;
            self.ready.push_front(message);
        }
    }
}

#[derive(Debug, Default)]
struct BrokerState {
    queues: HashMap<String, QueueState>,
    next_tag: u64,
    refuse_next: u32,
    unreachable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Generation {
    id: u64,
    close_reason: String,
}

struct Inner {
    state: Mutex<BrokerState>,
    notify: Notify,
    generation: watch::Sender<Generation>,
}

/// In-memory `Broker` with failure injection.
#[derive(Clone)]
pub struct InMemoryBroker {
    inner: Arc<Inner>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        let (generation, _) = watch::channel(Generation {
            id: 0,
            close_reason: String::new(),
        });
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(BrokerState::default()),
                notify: Notify::new(),
                generation,
            }),
        }
    }

    /// Drop the current connection. Open channels report `reason` from
    /// `closed()` and their unacked messages become ready again.
    pub async fn disconnect(&self, reason: impl Into<String>) {
        let mut state = self.inner.state.lock().await;
        for queue in state.queues.values_mut() {
            queue.requeue_unacked();
        }
        self.end_generation(reason.into());
        drop(state);
        self.inner.notify.notify_waiters();
    }

    /// Simulate a broker restart. Like `disconnect`, but messages published
    /// without `persistent` are lost.
    pub async fn restart(&self) {
        let mut state = self.inner.state.lock().await;
        for queue in state.queues.values_mut() {
            queue.requeue_unacked();
            queue.ready.retain(|m| m.persistent);
        }
        self.end_generation("broker restarted".to_string());
        drop(state);
        self.inner.notify.notify_waiters();
    }

    /// Make the next `count` calls to `open` fail.
    pub async fn refuse_connections(&self, count: u32) {
        self.inner.state.lock().await.refuse_next = count;
    }

    /// While unreachable, every `open` fails.
    pub async fn set_unreachable(&self, unreachable: bool) {
        self.inner.state.lock().await.unreachable = unreachable;
    }

    pub async fn ready_len(&self, queue: &str) -> usize {
        let state = self.inner.state.lock().await;
        state.queues.get(queue).map_or(0, |q| q.ready.len())
    }

    pub async fn unacked_len(&self, queue: &str) -> usize {
        let state = self.inner.state.lock().await;
        state.queues.get(queue).map_or(0, |q| q.unacked.len())
    }

    /// Payloads rejected without requeue, oldest first.
    pub async fn dead_letters(&self, queue: &str) -> Vec<Vec<u8>> {
        let state = self.inner.state.lock().await;
        state.queues.get(queue).map(|q| q.dead.clone()).unwrap_or_default()
    }

    fn end_generation(&self, reason: String) {
        self.inner.generation.send_modify(|g| {
            g.id += 1;
            g.close_reason = reason;
        });
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn open(&self, queue: &str) -> Result<Arc<dyn Channel>, TransportError> {
        let mut state = self.inner.state.lock().await;
        if state.unreachable {
            return Err(TransportError::Unavailable("broker unreachable".into()));
        }
        if state.refuse_next > 0 {
            state.refuse_next -= 1;
            return Err(TransportError::Unavailable("connection refused".into()));
        }
        state.queues.entry(queue.to_string()).or_default();

        let generation = self.inner.generation.borrow().id;
        Ok(Arc::new(InMemoryChannel {
            inner: Arc::clone(&self.inner),
            queue: queue.to_string(),
            generation,
        }))
    }
}

struct InMemoryChannel {
    inner: Arc<Inner>,
    queue: String,
    generation: u64,
}

impl InMemoryChannel {
    fn ensure_open(&self) -> Result<(), TransportError> {
        let current = self.inner.generation.borrow();
        if current.id == self.generation {
            Ok(())
        } else {
            Err(TransportError::Disconnected(current.close_reason.clone()))
        }
    }

    fn queue_mut<'a>(&self, state: &'a mut BrokerState) -> &'a mut QueueState {
        state.queues.entry(self.queue.clone()).or_default()
    }
}

#[async_trait]
impl Channel for InMemoryChannel {
    async fn publish(&self, payload: Vec<u8>, options: PublishOptions) -> Result<(), TransportError> {
        let mut state = self.inner.state.lock().await;
        self.ensure_open()?;
        self.queue_mut(&mut state).ready.push_back(StoredMessage {
            payload,
            persistent: options.persistent,
            redelivered: false,
        });
        drop(state);
        self.inner.notify.notify_waiters();
        Ok(())
    }

    async fn next_delivery(&self, wait: Duration) -> Result<Option<Delivery>, TransportError> {
        let deadline = Instant::now() + wait;
        loop {
            // Register interest before looking at the queue so a publish that
            // lands in between still wakes us.
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.inner.state.lock().await;
                self.ensure_open()?;
                if let Some(message) = self.queue_mut(&mut state).ready.pop_front() {
                    state.next_tag += 1;
                    let tag = state.next_tag;
                    let delivery = Delivery {
                        tag: DeliveryTag(tag),
                        payload: message.payload.clone(),
                        redelivered: message.redelivered,
                    };
                    self.queue_mut(&mut state).unacked.insert(tag, message);
                    return Ok(Some(delivery));
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn ack(&self, tag: DeliveryTag) -> Result<(), TransportError> {
        let mut state = self.inner.state.lock().await;
        self.ensure_open()?;
        match self.queue_mut(&mut state).unacked.remove(&tag.0) {
            Some(_) => Ok(()),
            None => Err(TransportError::Operation(format!("unknown delivery tag {tag}"))),
        }
    }

    async fn reject(&self, tag: DeliveryTag, requeue: bool) -> Result<(), TransportError> {
        let mut state = self.inner.state.lock().await;
        self.ensure_open()?;
        let queue = self.queue_mut(&mut state);
        let Some(mut message) = queue.unacked.remove(&tag.0) else {
            return Err(TransportError::Operation(format!("unknown delivery tag {tag}")));
        };
        if requeue {
            message.redelivered = true;
            queue.ready.push_front(message);
        } else {
            queue.dead.push(message.payload);
        }
        drop(state);
        if requeue {
            self.inner.notify.notify_waiters();
        }
        Ok(())
    }

    async fn closed(&self) -> String {
        let mut rx = self.inner.generation.subscribe();
        match rx.wait_for(|g| g.id != self.generation).await {
            Ok(g) => g.close_reason.clone(),
            Err(_) => "broker dropped".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const QUEUE: &str = "translation_tasks";

    async fn open(broker: &InMemoryBroker) -> Arc<dyn Channel> {
        broker.open(QUEUE).await.unwrap()
    }

    #[tokio::test]
    async fn publish_then_consume_in_order() {
        let broker = InMemoryBroker::new();
        let channel = open(&broker).await;

        channel.publish(b"a".to_vec(), PublishOptions::persistent()).await.unwrap();
        channel.publish(b"b".to_vec(), PublishOptions::persistent()).await.unwrap();

        let first = channel.next_delivery(Duration::from_millis(50)).await.unwrap().unwrap();
        let second = channel.next_delivery(Duration::from_millis(50)).await.unwrap().unwrap();
        assert_eq!(first.payload, b"a");
        assert_eq!(second.payload, b"b");
        assert!(!first.redelivered);

        channel.ack(first.tag).await.unwrap();
        channel.ack(second.tag).await.unwrap();
        assert_eq!(broker.unacked_len(QUEUE).await, 0);
        assert_eq!(broker.ready_len(QUEUE).await, 0);
    }

    #[tokio::test]
    async fn next_delivery_times_out_when_empty() {
        let broker = InMemoryBroker::new();
        let channel = open(&broker).await;
        let got = channel.next_delivery(Duration::from_millis(20)).await.unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn publish_wakes_waiting_consumer() {
        let broker = InMemoryBroker::new();
        let consumer = open(&broker).await;
        let producer = open(&broker).await;

        let waiting = tokio::spawn(async move { consumer.next_delivery(Duration::from_secs(5)).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        producer.publish(b"x".to_vec(), PublishOptions::persistent()).await.unwrap();

        let delivery = tokio::time::timeout(Duration::from_secs(1), waiting)
            .await
            .unwrap()
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(delivery.payload, b"x");
    }

    #[tokio::test]
    async fn disconnect_closes_channel_and_requeues_unacked() {
        let broker = InMemoryBroker::new();
        let channel = open(&broker).await;
        channel.publish(b"m1".to_vec(), PublishOptions::persistent()).await.unwrap();
        channel.publish(b"m2".to_vec(), PublishOptions::persistent()).await.unwrap();
        let delivery = channel.next_delivery(Duration::from_millis(50)).await.unwrap().unwrap();

        let closed = tokio::spawn({
            let channel = Arc::clone(&channel);
            async move { channel.closed().await }
        });
        broker.disconnect("socket reset").await;

        assert_eq!(closed.await.unwrap(), "socket reset");
        assert!(matches!(
            channel.ack(delivery.tag).await,
            Err(TransportError::Disconnected(_))
        ));

        let fresh = open(&broker).await;
        let again = fresh.next_delivery(Duration::from_millis(50)).await.unwrap().unwrap();
        assert_eq!(again.payload, b"m1");
        assert!(again.redelivered);
        let next = fresh.next_delivery(Duration::from_millis(50)).await.unwrap().unwrap();
        assert_eq!(next.payload, b"m2");
        assert!(!next.redelivered);
    }

    #[tokio::test]
    async fn restart_drops_transient_messages() {
        let broker = InMemoryBroker::new();
        let channel = open(&broker).await;
        channel.publish(b"keep".to_vec(), PublishOptions::persistent()).await.unwrap();
        channel
            .publish(b"lose".to_vec(), PublishOptions { persistent: false })
            .await
            .unwrap();

        broker.restart().await;
        assert_eq!(broker.ready_len(QUEUE).await, 1);
        assert!(channel.publish(b"late".to_vec(), PublishOptions::persistent()).await.is_err());
    }

    #[tokio::test]
    async fn reject_without_requeue_dead_letters() {
        let broker = InMemoryBroker::new();
        let channel = open(&broker).await;
        channel.publish(b"poison".to_vec(), PublishOptions::persistent()).await.unwrap();
        let delivery = channel.next_delivery(Duration::from_millis(50)).await.unwrap().unwrap();

        channel.reject(delivery.tag, false).await.unwrap();
        assert_eq!(broker.dead_letters(QUEUE).await, vec![b"poison".to_vec()]);
        assert_eq!(broker.ready_len(QUEUE).await, 0);
    }

    #[tokio::test]
    async fn reject_with_requeue_redelivers() {
        let broker = InMemoryBroker::new();
        let channel = open(&broker).await;
        channel.publish(b"retry".to_vec(), PublishOptions::persistent()).await.unwrap();
        let delivery = channel.next_delivery(Duration::from_millis(50)).await.unwrap().unwrap();

        channel.reject(delivery.tag, true).await.unwrap();
        let again = channel.next_delivery(Duration::from_millis(50)).await.unwrap().unwrap();
        assert_eq!(again.payload, b"retry");
        assert!(again.redelivered);
    }

    #[tokio::test]
    async fn refused_and_unreachable_connections_fail() {
        let broker = InMemoryBroker::new();
        broker.refuse_connections(1).await;
        assert!(broker.open(QUEUE).await.is_err());
        assert!(broker.open(QUEUE).await.is_ok());

        broker.set_unreachable(true).await;
        assert!(matches!(broker.open(QUEUE).await, Err(TransportError::Unavailable(_))));
    }

    #[tokio::test]
    async fn ack_unknown_tag_is_an_error() {
        let broker = InMemoryBroker::new();
        let channel = open(&broker).await;
        assert!(matches!(
            channel.ack(DeliveryTag(42)).await,
            Err(TransportError::Operation(_))
        ));
    }
}
