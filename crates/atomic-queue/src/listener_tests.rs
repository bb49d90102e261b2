//! Tests for the listener loop.

use super::*;
use crate::config::QueueConfig;
use crate::error::StoreError;
use crate::message::{ConcurrencyKey, MessageId};
use crate::store::{AtomicStore, Reply, ScriptId, StoreCapabilities, StoreTime};
use crate::stores::MemoryStore;
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;

type Delivery = Result<MessageId, String>;

fn engine() -> QueueEngine {
    let mut config = QueueConfig::default();
    config.listener.error_backoff_millis = 10;
    QueueEngine::new(Arc::new(MemoryStore::new()), config).unwrap()
}

fn key(value: &str) -> ConcurrencyKey {
    ConcurrencyKey::new(value.to_string()).unwrap()
}

/// Subscribe with a callback forwarding every delivery into a channel
fn subscribe(
    engine: &QueueEngine,
    submit: &QueueName,
    receive: &QueueName,
) -> (Subscription, mpsc::UnboundedReceiver<Delivery>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let subscription = engine.listen(submit, receive, move |result| {
        let _ = tx.send(result.map(|record| record.id).map_err(|e| e.to_string()));
    });
    (subscription, rx)
}

async fn next(rx: &mut mpsc::UnboundedReceiver<Delivery>) -> Delivery {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("delivery timed out")
        .expect("channel closed")
}

/// Memory store that counts blocking moves
#[derive(Default)]
struct CountingStore {
    inner: MemoryStore,
    blocking_moves: AtomicU64,
}

impl CountingStore {
    fn blocking_moves(&self) -> u64 {
        self.blocking_moves.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AtomicStore for CountingStore {
    fn capabilities(&self) -> StoreCapabilities {
        self.inner.capabilities()
    }

    async fn load_script(&self, source: &str) -> Result<ScriptId, StoreError> {
        self.inner.load_script(source).await
    }

    async fn eval_script(
        &self,
        id: &ScriptId,
        key_count: usize,
        args: &[String],
    ) -> Result<Reply, StoreError> {
        self.inner.eval_script(id, key_count, args).await
    }

    async fn list_length(&self, key: &str) -> Result<u64, StoreError> {
        self.inner.list_length(key).await
    }

    async fn list_push(&self, key: &str, value: &str) -> Result<u64, StoreError> {
        self.inner.list_push(key, value).await
    }

    async fn list_pop(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.inner.list_pop(key).await
    }

    async fn blocking_move(
        &self,
        source: &str,
        destination: &str,
        timeout: Duration,
    ) -> Result<Option<String>, StoreError> {
        self.blocking_moves.fetch_add(1, Ordering::SeqCst);
        self.inner.blocking_move(source, destination, timeout).await
    }

    async fn time(&self) -> Result<StoreTime, StoreError> {
        self.inner.time().await
    }
}

mod delivery {
    use super::*;

    /// Backlog present at subscribe time is delivered in order.
    #[tokio::test]
    async fn test_drains_backlog_in_order() {
        let engine = engine();
        let topology = engine.config().topology.clone();
        for name in ["a", "b", "c"] {
            engine.submit(&topology.submitted, &key(name), "{}").await.unwrap();
        }

        let (_subscription, mut rx) = subscribe(&engine, &topology.submitted, &topology.received);

        for expected in 1..=3 {
            assert_eq!(next(&mut rx).await, Ok(MessageId::new(expected)));
        }
        assert_eq!(engine.queue_length(&topology.submitted).await.unwrap(), 0);
        assert_eq!(engine.queue_length(&topology.received).await.unwrap(), 3);
    }

    /// A backlog is drained without any blocking wait; blocking starts after.
    #[tokio::test]
    async fn test_backlog_drained_before_blocking() {
        let store = Arc::new(CountingStore::default());
        let engine = QueueEngine::new(store.clone(), QueueConfig::default()).unwrap();
        let topology = engine.config().topology.clone();
        for name in ["a", "b", "c"] {
            engine.submit(&topology.submitted, &key(name), "{}").await.unwrap();
        }

        // Sample the counter inside the callback, at the moment of delivery
        let (tx, mut rx) = mpsc::unbounded_channel();
        let counter = store.clone();
        let _subscription = engine.listen(&topology.submitted, &topology.received, move |result| {
            let _ = tx.send((result.is_ok(), counter.blocking_moves()));
        });

        for _ in 0..3 {
            let (ok, moves) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("delivery timed out")
                .expect("channel closed");
            assert!(ok);
            assert_eq!(moves, 0);
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(store.blocking_moves() >= 1);
        assert!(rx.try_recv().is_err());
    }

    /// Messages arriving later are picked up by the blocking move.
    #[tokio::test]
    async fn test_delivers_new_messages() {
        let engine = engine();
        let topology = engine.config().topology.clone();
        let (_subscription, mut rx) = subscribe(&engine, &topology.submitted, &topology.received);

        tokio::time::sleep(Duration::from_millis(50)).await;
        engine.submit(&topology.submitted, &key("late"), "{}").await.unwrap();

        assert_eq!(next(&mut rx).await, Ok(MessageId::new(1)));
    }

    /// Every subscriber sees every message; one loop serves them all.
    #[tokio::test]
    async fn test_fans_out_to_all_subscribers() {
        let engine = engine();
        let topology = engine.config().topology.clone();
        let (_first, mut rx1) = subscribe(&engine, &topology.submitted, &topology.received);
        let (_second, mut rx2) = subscribe(&engine, &topology.submitted, &topology.received);
        assert_eq!(
            engine.listener_count(&topology.submitted, &topology.received),
            2
        );

        engine.submit(&topology.submitted, &key("a"), "{}").await.unwrap();

        assert_eq!(next(&mut rx1).await, Ok(MessageId::new(1)));
        assert_eq!(next(&mut rx2).await, Ok(MessageId::new(1)));
        // Delivered once, so the message sits in the receive queue once
        assert_eq!(engine.queue_length(&topology.received).await.unwrap(), 1);
    }

    /// Loop errors reach subscribers as errors.
    #[tokio::test]
    async fn test_errors_are_fanned_out() {
        let engine = engine();
        let topology = engine.config().topology.clone();
        engine.submit(&topology.submitted, &key("a"), "{}").await.unwrap();

        // `message:1` holds a record hash, so reading it as a list fails
        let bad: QueueName = "message:1".parse().unwrap();
        let (_subscription, mut rx) = subscribe(&engine, &bad, &topology.received);

        let delivery = next(&mut rx).await;
        assert!(delivery.unwrap_err().contains("message:1"));
    }
}

mod subscriptions {
    use super::*;

    /// Dropping and unsubscribing both remove the subscriber.
    #[tokio::test]
    async fn test_unsubscribe_and_drop() {
        let engine = engine();
        let topology = engine.config().topology.clone();

        let (first, _rx1) = subscribe(&engine, &topology.submitted, &topology.received);
        let (second, _rx2) = subscribe(&engine, &topology.submitted, &topology.received);
        assert_eq!(
            engine.listener_count(&topology.submitted, &topology.received),
            2
        );

        first.unsubscribe();
        assert_eq!(
            engine.listener_count(&topology.submitted, &topology.received),
            1
        );

        drop(second);
        assert_eq!(
            engine.listener_count(&topology.submitted, &topology.received),
            0
        );
    }

    /// Once the last subscriber leaves the loop stops taking messages.
    #[tokio::test]
    async fn test_loop_stops_without_subscribers() {
        let engine = engine();
        let topology = engine.config().topology.clone();

        let (subscription, _rx) = subscribe(&engine, &topology.submitted, &topology.received);
        subscription.unsubscribe();

        // Let any in-flight blocking move run out
        tokio::time::sleep(Duration::from_millis(1500)).await;
        engine.submit(&topology.submitted, &key("a"), "{}").await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(engine.queue_length(&topology.submitted).await.unwrap(), 1);
    }

    /// Subscribing again after the loop stopped starts a new one.
    #[tokio::test]
    async fn test_resubscribe_restarts_loop() {
        let engine = engine();
        let topology = engine.config().topology.clone();

        let (subscription, _rx) = subscribe(&engine, &topology.submitted, &topology.received);
        drop(subscription);
        tokio::time::sleep(Duration::from_millis(1500)).await;

        engine.submit(&topology.submitted, &key("a"), "{}").await.unwrap();
        let (_subscription, mut rx) = subscribe(&engine, &topology.submitted, &topology.received);

        assert_eq!(next(&mut rx).await, Ok(MessageId::new(1)));
    }

    /// Pairs are independent of each other.
    #[tokio::test]
    async fn test_pairs_are_independent() {
        let engine = engine();
        let topology = engine.config().topology.clone();
        let other_submit: QueueName = "queue:other".parse().unwrap();

        let (_main, mut main_rx) = subscribe(&engine, &topology.submitted, &topology.received);
        let (_other, mut other_rx) = subscribe(&engine, &other_submit, &topology.received);
        assert_eq!(engine.listener_count(&other_submit, &topology.received), 1);

        engine.submit(&other_submit, &key("x"), "{}").await.unwrap();
        assert_eq!(next(&mut other_rx).await, Ok(MessageId::new(1)));

        engine.submit(&topology.submitted, &key("y"), "{}").await.unwrap();
        assert_eq!(next(&mut main_rx).await, Ok(MessageId::new(2)));
    }
}
