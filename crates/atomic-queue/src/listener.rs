//! Listener loop delivering messages to subscribers.
//!
//! Each `(submit, receive)` pair has at most one drain task. Per iteration
//! the task drains the backlog without blocking, then issues a single
//! blocking move bounded by the listener timeout, and repeats while anyone
//! is still subscribed. An in-flight blocking move is never cancelled; the
//! task notices the last unsubscribe when the move returns.

use crate::engine::QueueEngine;
use crate::error::QueueError;
use crate::message::{MessageRecord, QueueName};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tracing::{debug, info, warn};

#[cfg(test)]
#[path = "listener_tests.rs"]
mod tests;

/// Callback invoked for every delivered message or loop error
pub type MessageCallback = Arc<dyn Fn(Result<&MessageRecord, &QueueError>) + Send + Sync>;

type PairKey = (QueueName, QueueName);

/// Subscribers of one queue pair plus whether its task is running.
///
/// Both live under the same lock so that a subscribe racing with the task
/// shutting down either sees the task running or starts a new one.
#[derive(Default)]
struct PairState {
    subscribers: Vec<(u64, MessageCallback)>,
    running: bool,
}

struct PairListeners {
    state: Mutex<PairState>,
}

impl PairListeners {
    fn lock(&self) -> MutexGuard<'_, PairState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn has_subscribers(&self) -> bool {
        !self.lock().subscribers.is_empty()
    }

    fn snapshot(&self) -> Vec<MessageCallback> {
        self.lock()
            .subscribers
            .iter()
            .map(|(_, callback)| callback.clone())
            .collect()
    }

    /// Call every subscriber. Callbacks run outside the lock so they may
    /// unsubscribe themselves.
    fn notify(&self, result: Result<&MessageRecord, &QueueError>) {
        for callback in self.snapshot() {
            callback(result);
        }
    }
}

/// All listener loops of one engine
#[derive(Default)]
pub(crate) struct Listeners {
    pairs: Mutex<HashMap<PairKey, Arc<PairListeners>>>,
    next_id: AtomicU64,
}

impl Listeners {
    fn pairs(&self) -> MutexGuard<'_, HashMap<PairKey, Arc<PairListeners>>> {
        self.pairs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn subscribe(
        &self,
        engine: &QueueEngine,
        submit: &QueueName,
        receive: &QueueName,
        callback: MessageCallback,
    ) -> Subscription {
        let key = (submit.clone(), receive.clone());
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        // Hold the pair map while registering so a stopping task cannot
        // remove the pair in between
        let mut pairs = self.pairs();
        let pair = pairs
            .entry(key.clone())
            .or_insert_with(|| {
                Arc::new(PairListeners {
                    state: Mutex::new(PairState::default()),
                })
            })
            .clone();

        let start = {
            let mut state = pair.lock();
            state.subscribers.push((id, callback));
            !std::mem::replace(&mut state.running, true)
        };
        drop(pairs);

        if start {
            info!(submit = %submit, receive = %receive, "Starting listener loop");
            tokio::spawn(run_loop(engine.clone(), key, pair.clone()));
        }

        Subscription {
            id,
            pair: Some(Arc::downgrade(&pair)),
        }
    }

    pub(crate) fn count(&self, submit: &QueueName, receive: &QueueName) -> usize {
        self.pairs()
            .get(&(submit.clone(), receive.clone()))
            .map_or(0, |pair| pair.lock().subscribers.len())
    }
}

/// Handle of one listener subscription. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    id: u64,
    pair: Option<Weak<PairListeners>>,
}

impl Subscription {
    /// Stop receiving messages
    pub fn unsubscribe(mut self) {
        self.detach();
    }

    fn detach(&mut self) {
        if let Some(pair) = self.pair.take().and_then(|weak| weak.upgrade()) {
            pair.lock().subscribers.retain(|(id, _)| *id != self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.detach();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("active", &self.pair.is_some())
            .finish()
    }
}

// ============================================================================
// Drain task
// ============================================================================

async fn run_loop(engine: QueueEngine, key: PairKey, pair: Arc<PairListeners>) {
    let (submit, receive) = &key;
    let backoff = engine.config().listener.error_backoff();

    loop {
        if should_stop(&engine, &key, &pair) {
            info!(submit = %submit, receive = %receive, "Listener loop stopped");
            return;
        }

        if let Err(error) = drain_once(&engine, submit, receive, &pair).await {
            warn!(submit = %submit, receive = %receive, error = %error, "Listener iteration failed");
            pair.notify(Err(&error));
            tokio::time::sleep(backoff).await;
        } else {
            tokio::task::yield_now().await;
        }
    }
}

/// Clear the running flag and forget the pair once nobody is subscribed.
///
/// The pair map is locked before the pair itself, as in `Listeners::subscribe`.
fn should_stop(engine: &QueueEngine, key: &PairKey, pair: &Arc<PairListeners>) -> bool {
    let mut pairs = engine.listeners().pairs();
    let mut state = pair.lock();
    if !state.subscribers.is_empty() {
        return false;
    }

    state.running = false;
    if pairs.get(key).is_some_and(|current| Arc::ptr_eq(current, pair)) {
        pairs.remove(key);
    }
    true
}

async fn drain_once(
    engine: &QueueEngine,
    submit: &QueueName,
    receive: &QueueName,
    pair: &PairListeners,
) -> Result<(), QueueError> {
    let mut pending = engine.queue_length(submit).await?;

    while pending > 0 && pair.has_subscribers() {
        match engine.receive_now(submit, receive).await? {
            Some(record) => pair.notify(Ok(&record)),
            // Another consumer emptied the queue first
            None => break,
        }
        pending -= 1;
    }

    if !pair.has_subscribers() {
        return Ok(());
    }

    let timeout = engine.config().listener.timeout();
    let moved = engine
        .store()
        .blocking_move(submit.as_str(), receive.as_str(), timeout)
        .await?;

    if let Some(value) = moved {
        match engine.receive_moved(submit, receive, value.clone()).await? {
            Some(record) => pair.notify(Ok(&record)),
            None => debug!(
                queue = %submit,
                value = %value,
                "Moved value was not a submitted message"
            ),
        }
    }
    Ok(())
}
