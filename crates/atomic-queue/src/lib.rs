//! # Atomic Queue
//!
//! Message queue engine layered over an atomic key/value and list store.
//!
//! This library provides:
//! - Submit with deduplication by concurrency key
//! - Atomic moves through a fixed lifecycle: submitted, received, finished
//! - Lazily registered, engine-scoped store scripts with single-flight loading
//! - A listener loop fanning new messages out to subscribers
//!
//! ## Module Organization
//!
//! - [`error`] - Error types for all queue operations
//! - [`message`] - Identifiers, statuses and message records
//! - [`store`] - The atomic store contract
//! - [`stores`] - Store implementations (in-memory, Redis)
//! - [`scripts`] - Procedure sources, registry and executor
//! - [`engine`] - Submit, receive, finish and queue lengths
//! - [`listener`] - Subscriptions and the drain loop
//! - [`config`] - Engine configuration

pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod listener;
pub mod message;
pub mod raw;
pub mod scripts;
pub mod store;
pub mod stores;

pub use clock::StoreClock;
pub use config::{
    KeysConfig, ListenerConfig, QueueConfig, QueueTopology, ReceiveConfig, ScriptConfig,
    ScriptsConfig, SubmitReturn,
};
pub use engine::{FinishOutcome, QueueEngine, SubmitOutcome};
pub use error::{ConfigurationError, QueueError, StoreError, ValidationError};
pub use listener::{MessageCallback, Subscription};
pub use message::{ConcurrencyKey, MessageId, MessageRecord, MessageStatus, QueueName, Timestamp};
pub use raw::RawQueue;
pub use scripts::{Procedure, ScriptExecutor, ScriptRegistry, ScriptSource};
pub use store::{AtomicStore, Reply, ScriptId, StoreCapabilities, StoreTime};
pub use stores::MemoryStore;

#[cfg(feature = "redis")]
pub use stores::RedisStore;

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;
