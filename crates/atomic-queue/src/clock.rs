//! Store-shared clock.
//!
//! Every engine instance stamps records with the store's clock rather than
//! its own, so timestamps from different hosts stay comparable.

use crate::error::{QueueError, StoreError};
use crate::message::Timestamp;
use crate::store::AtomicStore;
use std::sync::Arc;

#[cfg(test)]
#[path = "clock_tests.rs"]
mod tests;

/// Reads the current time from an [`AtomicStore`]
#[derive(Clone)]
pub struct StoreClock {
    store: Arc<dyn AtomicStore>,
}

impl StoreClock {
    pub fn new(store: Arc<dyn AtomicStore>) -> Self {
        Self { store }
    }

    /// Current store time, rounded to the millisecond
    pub async fn now(&self) -> Result<Timestamp, QueueError> {
        let time = self.store.time().await?;
        Timestamp::from_store_time(time.seconds, time.micros).ok_or_else(|| {
            QueueError::Store(StoreError::Backend {
                store: self.store.capabilities().name,
                message: format!(
                    "clock reading {}s {}us is out of range",
                    time.seconds, time.micros
                ),
            })
        })
    }
}
