//! A plain named list outside the message lifecycle.

use crate::error::QueueError;
use crate::message::QueueName;
use crate::store::AtomicStore;
use std::sync::Arc;
use tracing::debug;

#[cfg(test)]
#[path = "raw_tests.rs"]
mod tests;

/// Named FIFO list of opaque values.
///
/// Values are pushed on the left and popped from the right, the same
/// orientation the lifecycle queues use, so a `RawQueue` over the submit
/// queue can feed ids to consumers directly.
///
/// # Example
///
/// ```rust
/// use atomic_queue::{MemoryStore, RawQueue};
/// use std::sync::Arc;
///
/// # tokio_test::block_on(async {
/// let raw = RawQueue::new(Arc::new(MemoryStore::new()), "jobs".parse().unwrap());
/// raw.push("first").await.unwrap();
/// assert_eq!(raw.pop().await.unwrap().as_deref(), Some("first"));
/// # });
/// ```
#[derive(Clone)]
pub struct RawQueue {
    store: Arc<dyn AtomicStore>,
    name: QueueName,
}

impl RawQueue {
    pub fn new(store: Arc<dyn AtomicStore>, name: QueueName) -> Self {
        Self { store, name }
    }

    pub fn name(&self) -> &QueueName {
        &self.name
    }

    /// Append `value`, returning the new length
    pub async fn push(&self, value: &str) -> Result<u64, QueueError> {
        let length = self.store.list_push(self.name.as_str(), value).await?;
        debug!(queue = %self.name, length, "Raw value pushed");
        Ok(length)
    }

    /// Remove the oldest value
    pub async fn pop(&self) -> Result<Option<String>, QueueError> {
        Ok(self.store.list_pop(self.name.as_str()).await?)
    }

    pub async fn len(&self) -> Result<u64, QueueError> {
        Ok(self.store.list_length(self.name.as_str()).await?)
    }

    pub async fn is_empty(&self) -> Result<bool, QueueError> {
        Ok(self.len().await? == 0)
    }
}

impl std::fmt::Debug for RawQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawQueue").field("name", &self.name).finish()
    }
}
