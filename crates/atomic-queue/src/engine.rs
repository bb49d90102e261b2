//! The queue engine: submit, receive, finish, queue lengths and listening.
//!
//! Every state change is one atomic procedure call against the store. The
//! engine itself only owns the script identifier cache and the listener
//! subscriber lists.

use crate::clock::StoreClock;
use crate::config::QueueConfig;
use crate::error::{ConfigurationError, QueueError, StoreError, ValidationError};
use crate::listener::{Listeners, Subscription};
use crate::message::{ConcurrencyKey, MessageId, MessageRecord, MessageStatus, QueueName};
use crate::scripts::{Procedure, ScriptExecutor, ScriptRegistry};
use crate::store::{AtomicStore, Reply};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};

#[cfg(test)]
#[path = "engine_tests.rs"]
mod tests;

/// Result of a submit
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Message stored and queued under this id
    Created(MessageId),
    /// Message stored and queued; the full record as written
    Record(MessageRecord),
    /// A message with the same concurrency key is already in flight
    Duplicate,
}

impl SubmitOutcome {
    /// Id of the new message, if one was created
    pub fn id(&self) -> Option<MessageId> {
        match self {
            Self::Created(id) => Some(*id),
            Self::Record(record) => Some(record.id),
            Self::Duplicate => None,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate)
    }
}

/// Result of a finish
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishOutcome {
    /// Message moved to the finish queue and its concurrency key released
    Finished,
    /// Message was not in the receive queue; nothing changed
    NotInQueue,
}

/// Queue engine bound to one atomic store.
///
/// Cloning is cheap and clones share the script cache and listeners.
///
/// # Example
///
/// ```rust
/// use atomic_queue::{ConcurrencyKey, FinishOutcome, MemoryStore, QueueConfig, QueueEngine};
/// use std::sync::Arc;
///
/// # tokio_test::block_on(async {
/// let engine = QueueEngine::new(Arc::new(MemoryStore::new()), QueueConfig::default()).unwrap();
/// let topology = engine.config().topology.clone();
/// let key = ConcurrencyKey::from_parts("code1", "test").unwrap();
///
/// let id = engine.submit(&topology.submitted, &key, "{}").await.unwrap().id().unwrap();
/// let record = engine.receive_now(&topology.submitted, &topology.received).await.unwrap();
/// assert_eq!(record.unwrap().id, id);
///
/// assert_eq!(engine.finish_ok(id).await.unwrap(), FinishOutcome::Finished);
/// # });
/// ```
#[derive(Clone)]
pub struct QueueEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    store: Arc<dyn AtomicStore>,
    config: QueueConfig,
    registry: ScriptRegistry,
    executor: ScriptExecutor,
    clock: StoreClock,
    listeners: Listeners,
}

impl QueueEngine {
    /// Create an engine over `store`.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Configuration`] if the store cannot run scripts
    /// or block on a list, or if `config` does not validate.
    pub fn new(store: Arc<dyn AtomicStore>, config: QueueConfig) -> Result<Self, QueueError> {
        let capabilities = store.capabilities();
        if !capabilities.supports_scripting {
            return Err(ConfigurationError::UnsupportedStore {
                store: capabilities.name,
                message: "atomic script execution is required".to_string(),
            }
            .into());
        }
        if !capabilities.supports_blocking_pop {
            return Err(ConfigurationError::UnsupportedStore {
                store: capabilities.name,
                message: "blocking list moves are required".to_string(),
            }
            .into());
        }

        config.validate()?;

        let registry = ScriptRegistry::new(store.clone(), &config.scripts);
        let executor = ScriptExecutor::new(store.clone());
        let clock = StoreClock::new(store.clone());

        debug!(
            store = %capabilities.name,
            version = %capabilities.version,
            "Queue engine created"
        );

        Ok(Self {
            inner: Arc::new(EngineInner {
                store,
                config,
                registry,
                executor,
                clock,
                listeners: Listeners::default(),
            }),
        })
    }

    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &Arc<dyn AtomicStore> {
        &self.inner.store
    }

    pub fn registry(&self) -> &ScriptRegistry {
        &self.inner.registry
    }

    /// Register all three procedures now instead of on first use
    pub async fn preload_scripts(&self) -> Result<(), QueueError> {
        for procedure in Procedure::ALL {
            self.inner.registry.ensure_loaded(procedure).await?;
        }
        Ok(())
    }

    // ========================================================================
    // Submit
    // ========================================================================

    /// Store `body` as a new message and push its id onto `destination`.
    ///
    /// If a message with `key` is already submitted or received, nothing is
    /// written and [`SubmitOutcome::Duplicate`] is returned.
    ///
    /// `body` is opaque UTF-8 text and is never interpreted.
    pub async fn submit(
        &self,
        destination: &QueueName,
        key: &ConcurrencyKey,
        body: impl Into<String>,
    ) -> Result<SubmitOutcome, QueueError> {
        let now = self.inner.clock.now().await?;
        let mode = self.inner.config.submit_return;
        let keys = &self.inner.config.keys;

        let reply = self
            .run_procedure(
                Procedure::Submit,
                vec![
                    keys.counter.clone(),
                    keys.dedup_set.clone(),
                    key.as_str().to_string(),
                    destination.as_str().to_string(),
                ],
                vec![body.into(), now.to_wire(), mode.as_arg().to_string()],
            )
            .await?;

        let outcome = match reply {
            Reply::Nil => SubmitOutcome::Duplicate,
            reply @ Reply::Array(_) => {
                SubmitOutcome::Record(decode_record(Procedure::Submit, reply)?)
            }
            reply => {
                let id = reply
                    .as_int()
                    .and_then(|id| u64::try_from(id).ok())
                    .ok_or_else(|| QueueError::MalformedReply {
                        procedure: Procedure::Submit,
                        message: format!("expected message id, got {:?}", reply),
                    })?;
                SubmitOutcome::Created(MessageId::new(id))
            }
        };

        match outcome.id() {
            Some(id) => debug!(queue = %destination, id = %id, key = %key, "Message submitted"),
            None => debug!(queue = %destination, key = %key, "Duplicate submit ignored"),
        }
        Ok(outcome)
    }

    /// Serialize `body` as JSON and submit it
    pub async fn submit_json<T: Serialize + ?Sized>(
        &self,
        destination: &QueueName,
        key: &ConcurrencyKey,
        body: &T,
    ) -> Result<SubmitOutcome, QueueError> {
        let body = serde_json::to_string(body)?;
        self.submit(destination, key, body).await
    }

    // ========================================================================
    // Receive
    // ========================================================================

    /// Mark message `id` received, moving it from `submit` to `receive` if
    /// it is still waiting there.
    ///
    /// Used after a blocking pop has already moved the id. Returns `None` if
    /// no such message exists or it is no longer in status `submitted`.
    pub async fn receive_id(
        &self,
        submit: &QueueName,
        receive: &QueueName,
        id: MessageId,
    ) -> Result<Option<MessageRecord>, QueueError> {
        self.receive_with(submit, receive, Some(id.to_string())).await
    }

    /// Atomically take the oldest message from `submit`; `None` if empty
    pub async fn receive_now(
        &self,
        submit: &QueueName,
        receive: &QueueName,
    ) -> Result<Option<MessageRecord>, QueueError> {
        self.receive_with(submit, receive, None).await
    }

    /// Take the oldest message, waiting up to the configured receive timeout
    /// if `submit` is empty.
    pub async fn receive(
        &self,
        submit: &QueueName,
        receive: &QueueName,
    ) -> Result<Option<MessageRecord>, QueueError> {
        if let Some(record) = self.receive_now(submit, receive).await? {
            return Ok(Some(record));
        }

        let timeout = self.inner.config.receive.timeout();
        let moved = self
            .inner
            .store
            .blocking_move(submit.as_str(), receive.as_str(), timeout)
            .await?;

        match moved {
            Some(value) => self.receive_moved(submit, receive, value).await,
            None => Ok(None),
        }
    }

    /// Receive a value a blocking pop moved into `receive`.
    ///
    /// The value is passed through unparsed so the procedure can drop it
    /// from both queues when it does not name a message.
    pub(crate) async fn receive_moved(
        &self,
        submit: &QueueName,
        receive: &QueueName,
        value: String,
    ) -> Result<Option<MessageRecord>, QueueError> {
        self.receive_with(submit, receive, Some(value)).await
    }

    async fn receive_with(
        &self,
        submit: &QueueName,
        receive: &QueueName,
        id: Option<String>,
    ) -> Result<Option<MessageRecord>, QueueError> {
        let now = self.inner.clock.now().await?;

        let mut argv = vec![now.to_wire()];
        argv.extend(id);

        let reply = self
            .run_procedure(
                Procedure::Receive,
                vec![submit.as_str().to_string(), receive.as_str().to_string()],
                argv,
            )
            .await?;

        if reply.is_nil() {
            return Ok(None);
        }

        let record = decode_record(Procedure::Receive, reply)?;
        debug!(queue = %receive, id = %record.id, "Message received");
        Ok(Some(record))
    }

    // ========================================================================
    // Finish
    // ========================================================================

    /// Move message `id` from `receive` to `finish_queue` with a terminal
    /// `status`, releasing its concurrency key.
    ///
    /// Finishing a message that is not in `receive` is a no-op reported as
    /// [`FinishOutcome::NotInQueue`].
    pub async fn finish(
        &self,
        receive: &QueueName,
        finish_queue: &QueueName,
        id: MessageId,
        status: MessageStatus,
    ) -> Result<FinishOutcome, QueueError> {
        if !status.is_terminal() {
            return Err(ValidationError::InvalidFormat {
                field: "status".to_string(),
                message: format!("'{}' is not a final status", status),
            }
            .into());
        }

        let now = self.inner.clock.now().await?;
        let reply = self
            .run_procedure(
                Procedure::Finish,
                vec![
                    receive.as_str().to_string(),
                    finish_queue.as_str().to_string(),
                    id.to_string(),
                    self.inner.config.keys.dedup_set.clone(),
                ],
                vec![status.as_str().to_string(), now.to_wire()],
            )
            .await?;

        match reply.as_int() {
            Some(1) => {
                debug!(queue = %finish_queue, id = %id, status = %status, "Message finished");
                Ok(FinishOutcome::Finished)
            }
            Some(0) => {
                debug!(queue = %receive, id = %id, "Finish skipped, message not in queue");
                Ok(FinishOutcome::NotInQueue)
            }
            _ => Err(QueueError::MalformedReply {
                procedure: Procedure::Finish,
                message: format!("expected 0 or 1, got {:?}", reply),
            }),
        }
    }

    /// Finish `id` successfully using the configured topology
    pub async fn finish_ok(&self, id: MessageId) -> Result<FinishOutcome, QueueError> {
        let topology = &self.inner.config.topology;
        self.finish(
            &topology.received,
            &topology.finished_ok,
            id,
            MessageStatus::FinishedOk,
        )
        .await
    }

    /// Finish `id` with an error using the configured topology
    pub async fn finish_with_error(&self, id: MessageId) -> Result<FinishOutcome, QueueError> {
        let topology = &self.inner.config.topology;
        self.finish(
            &topology.received,
            &topology.finished_with_error,
            id,
            MessageStatus::FinishedWithError,
        )
        .await
    }

    // ========================================================================
    // Queue lengths
    // ========================================================================

    pub async fn queue_length(&self, queue: &QueueName) -> Result<u64, QueueError> {
        Ok(self.inner.store.list_length(queue.as_str()).await?)
    }

    /// Lengths of `queues`, in the same order
    pub async fn queue_lengths(&self, queues: &[QueueName]) -> Result<Vec<u64>, QueueError> {
        let mut lengths = Vec::with_capacity(queues.len());
        for queue in queues {
            lengths.push(self.queue_length(queue).await?);
        }
        Ok(lengths)
    }

    // ========================================================================
    // Listening
    // ========================================================================

    /// Deliver every message arriving on `submit` to `callback`, moving it to
    /// `receive` first.
    ///
    /// One drain task runs per `(submit, receive)` pair no matter how many
    /// subscribers it has; it stops once the last [`Subscription`] is gone.
    /// Must be called from within a tokio runtime.
    pub fn listen<F>(&self, submit: &QueueName, receive: &QueueName, callback: F) -> Subscription
    where
        F: Fn(Result<&MessageRecord, &QueueError>) + Send + Sync + 'static,
    {
        self.inner
            .listeners
            .subscribe(self, submit, receive, Arc::new(callback))
    }

    pub(crate) fn listeners(&self) -> &Listeners {
        &self.inner.listeners
    }

    /// Live subscribers for a `(submit, receive)` pair
    pub fn listener_count(&self, submit: &QueueName, receive: &QueueName) -> usize {
        self.inner.listeners.count(submit, receive)
    }

    // ========================================================================
    // Procedure calls
    // ========================================================================

    /// Run `procedure`, re-registering it once if the store has lost it
    async fn run_procedure(
        &self,
        procedure: Procedure,
        keys: Vec<String>,
        argv: Vec<String>,
    ) -> Result<Reply, QueueError> {
        let key_count = keys.len();
        let args: Vec<String> = keys.into_iter().chain(argv).collect();

        let id = self.inner.registry.ensure_loaded(procedure).await?;
        match self.inner.executor.invoke(&id, key_count, &args).await {
            Ok(reply) => Ok(reply),
            Err(StoreError::NoScript { .. }) => {
                warn!(procedure = %procedure, script_id = %id, "Script unknown to store, reloading");
                self.inner.registry.invalidate(procedure, &id);

                let id = self.inner.registry.ensure_loaded(procedure).await?;
                self.inner
                    .executor
                    .invoke(&id, key_count, &args)
                    .await
                    .map_err(|source| QueueError::Execution { procedure, source })
            }
            Err(source) => Err(QueueError::Execution { procedure, source }),
        }
    }
}

fn decode_record(procedure: Procedure, reply: Reply) -> Result<MessageRecord, QueueError> {
    let pairs = reply
        .into_field_pairs()
        .map_err(|message| QueueError::MalformedReply { procedure, message })?;

    MessageRecord::from_pairs(pairs).map_err(|e| QueueError::MalformedReply {
        procedure,
        message: e.to_string(),
    })
}
