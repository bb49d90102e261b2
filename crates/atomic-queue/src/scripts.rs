//! Atomic procedures: their sources, the per-engine identifier cache and the
//! executor that invokes them.

use crate::config::ScriptsConfig;
use crate::error::{QueueError, StoreError};
use crate::store::{AtomicStore, Reply, ScriptId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::OnceCell;
use tracing::{debug, info};

#[cfg(test)]
#[path = "scripts_tests.rs"]
mod tests;

/// Marker on the first line of every shipped script naming its procedure
pub const PROCEDURE_MARKER: &str = "--! atomic-queue procedure:";

/// The three atomic procedures of the queue lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Procedure {
    Submit,
    Receive,
    Finish,
}

impl Procedure {
    pub const ALL: [Procedure; 3] = [Self::Submit, Self::Receive, Self::Finish];

    /// Logical name used for caching and logging
    pub fn name(&self) -> &'static str {
        match self {
            Self::Submit => "submit",
            Self::Receive => "receive",
            Self::Finish => "finish",
        }
    }

    /// Source compiled into the crate
    pub fn embedded_source(&self) -> &'static str {
        match self {
            Self::Submit => include_str!("../scripts/submit_message.lua"),
            Self::Receive => include_str!("../scripts/receive_message.lua"),
            Self::Finish => include_str!("../scripts/finish_message.lua"),
        }
    }

    /// Find the procedure a script declares on its marker line
    pub fn from_source(source: &str) -> Option<Self> {
        let declared = source
            .lines()
            .find_map(|line| line.trim().strip_prefix(PROCEDURE_MARKER))?
            .trim();
        Self::ALL.into_iter().find(|p| p.name() == declared)
    }
}

impl std::fmt::Display for Procedure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Where a script's source is read from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptSource {
    /// The copy compiled into the crate
    Embedded,
    /// A file read at first use
    File(PathBuf),
}

impl ScriptSource {
    /// Read the source text for `procedure`
    pub async fn read(&self, procedure: Procedure) -> std::io::Result<String> {
        match self {
            Self::Embedded => Ok(procedure.embedded_source().to_string()),
            Self::File(path) => tokio::fs::read_to_string(path).await,
        }
    }
}

// ============================================================================
// Script Registry
// ============================================================================

/// Per-engine cache of script identifiers.
///
/// Each procedure is loaded lazily on first use. Concurrent first calls for
/// the same procedure share one in-flight load, so callers never observe two
/// different identifiers. A failed load leaves the entry empty and the next
/// call tries again.
pub struct ScriptRegistry {
    store: Arc<dyn AtomicStore>,
    sources: HashMap<Procedure, ScriptSource>,
    entries: Mutex<HashMap<Procedure, Arc<OnceCell<ScriptId>>>>,
}

impl ScriptRegistry {
    /// Create registry, pre-seeding identifiers present in configuration
    pub fn new(store: Arc<dyn AtomicStore>, scripts: &ScriptsConfig) -> Self {
        let mut sources = HashMap::new();
        let mut entries = HashMap::new();

        for procedure in Procedure::ALL {
            let script = scripts.get(procedure);
            sources.insert(procedure, script.source());
            entries.insert(
                procedure,
                Arc::new(OnceCell::new_with(script.preloaded_id())),
            );
        }

        Self {
            store,
            sources,
            entries: Mutex::new(entries),
        }
    }

    /// Return the identifier for `procedure`, registering its source with the
    /// store on first use.
    pub async fn ensure_loaded(&self, procedure: Procedure) -> Result<ScriptId, QueueError> {
        let entry = self.entry(procedure);
        entry
            .get_or_try_init(|| self.load(procedure))
            .await
            .cloned()
    }

    /// Identifier currently cached for `procedure`
    pub fn cached(&self, procedure: Procedure) -> Option<ScriptId> {
        self.entry(procedure).get().cloned()
    }

    /// Forget the cached identifier if it is still `stale`.
    ///
    /// Comparing against the stale value keeps a racing caller from throwing
    /// away an identifier another caller has just reloaded.
    pub fn invalidate(&self, procedure: Procedure, stale: &ScriptId) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let holds_stale = entries
            .get(&procedure)
            .and_then(|cell| cell.get())
            .is_some_and(|id| id == stale);

        if holds_stale {
            entries.insert(procedure, Arc::new(OnceCell::new()));
        }
    }

    /// Forget every cached identifier, including pre-seeded ones
    pub fn reset(&self) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        for procedure in Procedure::ALL {
            entries.insert(procedure, Arc::new(OnceCell::new()));
        }
    }

    fn entry(&self, procedure: Procedure) -> Arc<OnceCell<ScriptId>> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries
            .entry(procedure)
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone()
    }

    async fn load(&self, procedure: Procedure) -> Result<ScriptId, QueueError> {
        let source = self
            .sources
            .get(&procedure)
            .cloned()
            .unwrap_or(ScriptSource::Embedded);

        let text = source
            .read(procedure)
            .await
            .map_err(|e| QueueError::ScriptLoad {
                procedure,
                message: format!("cannot read source {:?}: {}", source, e),
            })?;

        let id = self
            .store
            .load_script(&text)
            .await
            .map_err(|e| QueueError::ScriptLoad {
                procedure,
                message: e.to_string(),
            })?;

        info!(procedure = %procedure, script_id = %id, "Registered script with store");
        Ok(id)
    }
}

// ============================================================================
// Executor
// ============================================================================

/// Invokes registered scripts. Store errors are returned untouched and
/// nothing is retried here.
#[derive(Clone)]
pub struct ScriptExecutor {
    store: Arc<dyn AtomicStore>,
}

impl ScriptExecutor {
    pub fn new(store: Arc<dyn AtomicStore>) -> Self {
        Self { store }
    }

    /// Run script `id`; the first `key_count` of `args` are keys
    pub async fn invoke(
        &self,
        id: &ScriptId,
        key_count: usize,
        args: &[String],
    ) -> Result<Reply, StoreError> {
        debug!(script_id = %id, key_count, arg_count = args.len(), "Invoking script");
        self.store.eval_script(id, key_count, args).await
    }
}
