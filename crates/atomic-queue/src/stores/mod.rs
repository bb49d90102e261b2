//! Atomic store implementations.
//!
//! - [`MemoryStore`] runs the procedures natively and is always available.
//! - [`RedisStore`] registers the Lua sources with a Redis server; enabled by
//!   the `redis` feature.

pub mod memory;

#[cfg(feature = "redis")]
pub mod redis;

pub use memory::MemoryStore;

#[cfg(feature = "redis")]
pub use self::redis::RedisStore;
