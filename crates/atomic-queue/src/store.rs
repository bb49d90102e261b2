//! The atomic key/value and list store contract the queue engine runs on.

use crate::error::StoreError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;

/// Identifier returned by the store when a script is registered
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScriptId(String);

impl ScriptId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ScriptId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Clock reading shared by every client of the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreTime {
    pub seconds: i64,
    pub micros: u32,
}

/// What a store reports about itself
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreCapabilities {
    pub name: String,
    pub version: String,
    pub supports_scripting: bool,
    pub supports_blocking_pop: bool,
}

/// Reply of a script invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Nil,
    Int(i64),
    Bulk(String),
    Status(String),
    Array(Vec<Reply>),
}

impl Reply {
    pub fn is_nil(&self) -> bool {
        matches!(self, Self::Nil)
    }

    /// Interpret the reply as an integer (integers and numeric strings)
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(value) => Some(*value),
            Self::Bulk(value) | Self::Status(value) => value.parse().ok(),
            _ => None,
        }
    }

    /// Interpret the reply as text
    pub fn as_text(&self) -> Option<String> {
        match self {
            Self::Int(value) => Some(value.to_string()),
            Self::Bulk(value) | Self::Status(value) => Some(value.clone()),
            _ => None,
        }
    }

    /// Split a flat `name, value, name, value, ...` array into pairs.
    ///
    /// Fails if the reply is not an array, has an odd number of elements or
    /// holds anything other than scalars.
    pub fn into_field_pairs(self) -> Result<Vec<(String, String)>, String> {
        let items = match self {
            Self::Array(items) => items,
            other => return Err(format!("expected field array, got {:?}", other)),
        };

        if items.len() % 2 != 0 {
            return Err(format!(
                "field array has odd length {}; names and values must pair up",
                items.len()
            ));
        }

        let mut pairs = Vec::with_capacity(items.len() / 2);
        let mut iter = items.into_iter();
        while let (Some(name), Some(value)) = (iter.next(), iter.next()) {
            let name = name
                .as_text()
                .ok_or_else(|| format!("field name {:?} is not a scalar", name))?;
            let value = value
                .as_text()
                .ok_or_else(|| format!("value of field '{}' is not a scalar", name))?;
            pairs.push((name, value));
        }
        Ok(pairs)
    }
}

/// Interface implemented by stores the queue engine can run against.
///
/// Every mutation of queue state is expressed as one `eval_script` call;
/// the remaining list operations are single commands and atomic on their own.
#[async_trait]
pub trait AtomicStore: Send + Sync {
    /// Describe the store so the engine can check the contract at construction
    fn capabilities(&self) -> StoreCapabilities;

    /// Register a script. Idempotent by content: the same source always
    /// yields the same identifier.
    async fn load_script(&self, source: &str) -> Result<ScriptId, StoreError>;

    /// Run a registered script indivisibly. The first `key_count` entries of
    /// `args` are keys, the rest are plain values.
    ///
    /// Returns [`StoreError::NoScript`] if the identifier is unknown.
    async fn eval_script(
        &self,
        id: &ScriptId,
        key_count: usize,
        args: &[String],
    ) -> Result<Reply, StoreError>;

    /// Length of a list (0 if it does not exist)
    async fn list_length(&self, key: &str) -> Result<u64, StoreError>;

    /// Push a value on the left of a list, returning the new length
    async fn list_push(&self, key: &str, value: &str) -> Result<u64, StoreError>;

    /// Pop a value from the right of a list
    async fn list_pop(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Pop from the right of `source` and push on the left of `destination`
    /// as one step, waiting up to `timeout` for `source` to become non-empty.
    async fn blocking_move(
        &self,
        source: &str,
        destination: &str,
        timeout: Duration,
    ) -> Result<Option<String>, StoreError>;

    /// Read the store's clock
    async fn time(&self) -> Result<StoreTime, StoreError>;
}
