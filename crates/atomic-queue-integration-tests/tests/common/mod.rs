//! Common test utilities for atomic-queue integration tests
//!
//! This module provides:
//! - Engine construction over a shared in-memory store
//! - A delivery collector for listener callbacks
//! - Tracing setup driven by `RUST_LOG`

use atomic_queue::{
    ConcurrencyKey, MemoryStore, MessageId, MessageRecord, QueueConfig, QueueEngine, QueueError,
};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

static TRACING: Once = Once::new();

/// Install a fmt subscriber once per test binary
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "atomic_queue=warn".into()),
            )
            .with_test_writer()
            .try_init();
    });
}

/// Engine with default configuration plus direct access to its store
#[allow(dead_code)]
pub fn engine() -> (MemoryStore, QueueEngine) {
    engine_with(QueueConfig::default())
}

#[allow(dead_code)]
pub fn engine_with(config: QueueConfig) -> (MemoryStore, QueueEngine) {
    init_tracing();
    let store = MemoryStore::new();
    let engine = QueueEngine::new(Arc::new(store.clone()), config).expect("valid engine");
    (store, engine)
}

/// Second engine over an existing store, with its own script cache
#[allow(dead_code)]
pub fn engine_on(store: &MemoryStore, config: QueueConfig) -> QueueEngine {
    QueueEngine::new(Arc::new(store.clone()), config).expect("valid engine")
}

pub fn key(value: &str) -> ConcurrencyKey {
    ConcurrencyKey::new(value.to_string()).expect("valid concurrency key")
}

/// Records every listener delivery
#[derive(Clone, Default)]
#[allow(dead_code)]
pub struct Collector {
    records: Arc<Mutex<Vec<MessageRecord>>>,
    errors: Arc<Mutex<Vec<String>>>,
}

#[allow(dead_code)]
impl Collector {
    pub fn callback(&self) -> impl Fn(Result<&MessageRecord, &QueueError>) + Send + Sync + 'static {
        let collector = self.clone();
        move |result| match result {
            Ok(record) => collector.records.lock().unwrap().push(record.clone()),
            Err(error) => collector.errors.lock().unwrap().push(error.to_string()),
        }
    }

    pub fn ids(&self) -> Vec<MessageId> {
        self.records.lock().unwrap().iter().map(|r| r.id).collect()
    }

    pub fn records(&self) -> Vec<MessageRecord> {
        self.records.lock().unwrap().clone()
    }

    pub fn errors(&self) -> Vec<String> {
        self.errors.lock().unwrap().clone()
    }

    /// Wait until at least `count` records arrived or `timeout` passed
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if self.records.lock().unwrap().len() >= count {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.records.lock().unwrap().len() >= count
    }
}
