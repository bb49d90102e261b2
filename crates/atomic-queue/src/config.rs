//! Configuration for the queue engine.
//!
//! Every field carries a serde default, so an empty file (or no file at all)
//! yields the stock layout: `queue:submitted`, `queue:received`,
//! `queue:finished_ok`, `queue:finished_with_error`, with the message id
//! counter at `message:id` and the dedup set at `message:received`.

use crate::error::ConfigurationError;
use crate::message::QueueName;
use crate::scripts::{Procedure, ScriptSource};
use crate::store::ScriptId;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;

/// Prefix of environment variables that override file configuration
pub const ENV_PREFIX: &str = "ATOMIC_QUEUE";

/// Queue engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Names of the shared bookkeeping keys
    pub keys: KeysConfig,

    /// The four lifecycle queues
    pub topology: QueueTopology,

    /// Script sources and pre-seeded identifiers
    pub scripts: ScriptsConfig,

    /// Standalone receive settings
    pub receive: ReceiveConfig,

    /// Listener loop settings
    pub listener: ListenerConfig,

    /// What a successful submit returns
    pub submit_return: SubmitReturn,
}

impl QueueConfig {
    /// Load configuration from an optional file plus `ATOMIC_QUEUE__*`
    /// environment variables (later sources override earlier ones).
    ///
    /// The file format is inferred from its extension (yaml, toml, json).
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigurationError> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let config = builder
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()
            .map_err(|e| ConfigurationError::Parsing {
                message: e.to_string(),
            })?;

        let queue_config: QueueConfig =
            config
                .try_deserialize()
                .map_err(|e| ConfigurationError::Parsing {
                    message: e.to_string(),
                })?;

        queue_config.validate()?;
        Ok(queue_config)
    }

    /// Validate this configuration for internal consistency.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigurationError::Invalid`] describing the first
    /// validation failure encountered.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        self.keys.validate()?;
        self.topology.validate()?;
        self.scripts.validate()?;

        // Bookkeeping keys must not alias a lifecycle queue
        for key in [&self.keys.counter, &self.keys.dedup_set] {
            if self.topology.names().any(|queue| queue.as_str() == key.as_str()) {
                return Err(ConfigurationError::Invalid {
                    message: format!("key '{}' is also used as a queue name", key),
                });
            }
        }

        // A zero timeout means "wait forever" to a blocking pop
        if self.receive.timeout_seconds == 0 {
            return Err(ConfigurationError::Invalid {
                message: "receive.timeout_seconds must be at least 1".to_string(),
            });
        }
        if self.listener.timeout_seconds == 0 {
            return Err(ConfigurationError::Invalid {
                message: "listener.timeout_seconds must be at least 1".to_string(),
            });
        }

        Ok(())
    }
}

/// Names of the counter and dedup set keys
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeysConfig {
    /// String key incremented to allocate message ids
    pub counter: String,

    /// Set of concurrency keys currently in flight
    pub dedup_set: String,
}

impl KeysConfig {
    fn validate(&self) -> Result<(), ConfigurationError> {
        if self.counter.is_empty() {
            return Err(ConfigurationError::Missing {
                key: "keys.counter".to_string(),
            });
        }
        if self.dedup_set.is_empty() {
            return Err(ConfigurationError::Missing {
                key: "keys.dedup_set".to_string(),
            });
        }
        if self.counter == self.dedup_set {
            return Err(ConfigurationError::Invalid {
                message: "keys.counter and keys.dedup_set must differ".to_string(),
            });
        }
        Ok(())
    }
}

impl Default for KeysConfig {
    fn default() -> Self {
        Self {
            counter: "message:id".to_string(),
            dedup_set: "message:received".to_string(),
        }
    }
}

/// The four named queues a message moves through
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueTopology {
    pub submitted: QueueName,
    pub received: QueueName,
    pub finished_ok: QueueName,
    pub finished_with_error: QueueName,
}

impl QueueTopology {
    /// Iterate the queue names in lifecycle order
    pub fn names(&self) -> impl Iterator<Item = &QueueName> {
        [
            &self.submitted,
            &self.received,
            &self.finished_ok,
            &self.finished_with_error,
        ]
        .into_iter()
    }

    fn validate(&self) -> Result<(), ConfigurationError> {
        let mut seen = HashSet::new();
        for name in self.names() {
            if !seen.insert(name.as_str()) {
                return Err(ConfigurationError::Invalid {
                    message: format!("queue '{}' appears twice in the topology", name),
                });
            }
        }
        Ok(())
    }
}

impl Default for QueueTopology {
    fn default() -> Self {
        Self {
            submitted: QueueName::from_static("queue:submitted"),
            received: QueueName::from_static("queue:received"),
            finished_ok: QueueName::from_static("queue:finished_ok"),
            finished_with_error: QueueName::from_static("queue:finished_with_error"),
        }
    }
}

/// Per-procedure script settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScriptConfig {
    /// Read the source from this file instead of the embedded copy
    pub path: Option<PathBuf>,

    /// Identifier of a script already registered with the store. When set,
    /// the engine never loads the source unless the store reports the
    /// identifier as unknown.
    pub id: Option<String>,
}

impl ScriptConfig {
    /// Where the source of this script comes from
    pub fn source(&self) -> ScriptSource {
        match &self.path {
            Some(path) => ScriptSource::File(path.clone()),
            None => ScriptSource::Embedded,
        }
    }

    /// Pre-seeded identifier, if any
    pub fn preloaded_id(&self) -> Option<ScriptId> {
        self.id.as_ref().map(|id| ScriptId::new(id.clone()))
    }
}

/// Script settings for each procedure
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScriptsConfig {
    pub submit: ScriptConfig,
    pub receive: ScriptConfig,
    pub finish: ScriptConfig,
}

impl ScriptsConfig {
    /// Settings for one procedure
    pub fn get(&self, procedure: Procedure) -> &ScriptConfig {
        match procedure {
            Procedure::Submit => &self.submit,
            Procedure::Receive => &self.receive,
            Procedure::Finish => &self.finish,
        }
    }

    fn validate(&self) -> Result<(), ConfigurationError> {
        for procedure in Procedure::ALL {
            let script = self.get(procedure);
            if matches!(script.id.as_deref(), Some("")) {
                return Err(ConfigurationError::Invalid {
                    message: format!("scripts.{}.id must not be empty", procedure),
                });
            }
            if matches!(script.path.as_deref(), Some(p) if p.as_os_str().is_empty()) {
                return Err(ConfigurationError::Invalid {
                    message: format!("scripts.{}.path must not be empty", procedure),
                });
            }
        }
        Ok(())
    }
}

/// Standalone receive settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiveConfig {
    /// How long a receive on an empty queue waits for a message
    pub timeout_seconds: u64,
}

impl ReceiveConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

impl Default for ReceiveConfig {
    fn default() -> Self {
        Self { timeout_seconds: 1 }
    }
}

/// Listener loop settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bound of the blocking pop issued once the backlog is drained
    pub timeout_seconds: u64,

    /// Pause after an iteration that reported an error to subscribers
    pub error_backoff_millis: u64,
}

impl ListenerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_millis(self.error_backoff_millis)
    }
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: 1,
            error_backoff_millis: 100,
        }
    }
}

/// Shape of a successful submit result
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmitReturn {
    /// Only the new message id
    #[default]
    Id,
    /// The full stored record
    Record,
}

impl SubmitReturn {
    /// Mode argument passed to the submit script
    pub fn as_arg(&self) -> &'static str {
        match self {
            Self::Id => "id",
            Self::Record => "record",
        }
    }
}
