//! In-memory atomic store for testing and embedding.
//!
//! This store provides:
//! - Content-addressed script registration (hex SHA-1 of the source)
//! - Native execution of the submit, receive and finish procedures, each
//!   under a single lock so they are indivisible like a server-side script
//! - Blocking moves between lists that wake as soon as a list is pushed to
//!
//! Only sources carrying the atomic-queue procedure marker are accepted;
//! anything else is rejected the way a server rejects a script it cannot
//! compile.

use crate::error::StoreError;
use crate::message::MESSAGE_KEY_PREFIX;
use crate::scripts::Procedure;
use crate::store::{AtomicStore, Reply, ScriptId, StoreCapabilities, StoreTime};
use async_trait::async_trait;
use sha1::{Digest, Sha1};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::Notify;
use tracing::debug;

#[cfg(test)]
#[path = "memory_tests.rs"]
mod tests;

const STORE_NAME: &str = "memory";

// ============================================================================
// Internal Storage Structures
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    String,
    List,
    Set,
    Hash,
}

/// All keys, partitioned by value type
#[derive(Default)]
struct StoreState {
    strings: HashMap<String, String>,
    lists: HashMap<String, VecDeque<String>>,
    sets: HashMap<String, HashSet<String>>,
    /// Field order is insertion order, as `HGETALL` reports it
    hashes: HashMap<String, Vec<(String, String)>>,
    scripts: HashMap<ScriptId, Procedure>,
}

impl StoreState {
    fn kind_of(&self, key: &str) -> Option<Kind> {
        if self.strings.contains_key(key) {
            Some(Kind::String)
        } else if self.lists.contains_key(key) {
            Some(Kind::List)
        } else if self.sets.contains_key(key) {
            Some(Kind::Set)
        } else if self.hashes.contains_key(key) {
            Some(Kind::Hash)
        } else {
            None
        }
    }

    fn expect_kind(&self, key: &str, expected: Kind) -> Result<(), StoreError> {
        match self.kind_of(key) {
            Some(kind) if kind != expected => Err(StoreError::WrongType {
                key: key.to_string(),
            }),
            _ => Ok(()),
        }
    }

    // ---- strings ----------------------------------------------------------

    fn incr(&mut self, key: &str) -> Result<i64, StoreError> {
        self.expect_kind(key, Kind::String)?;
        let current = match self.strings.get(key) {
            Some(value) => value.parse::<i64>().map_err(|_| StoreError::Backend {
                store: STORE_NAME.to_string(),
                message: format!("value at '{}' is not an integer", key),
            })?,
            None => 0,
        };
        let next = current + 1;
        self.strings.insert(key.to_string(), next.to_string());
        Ok(next)
    }

    // ---- lists ------------------------------------------------------------

    fn lpush(&mut self, key: &str, value: &str) -> Result<u64, StoreError> {
        self.expect_kind(key, Kind::List)?;
        let list = self.lists.entry(key.to_string()).or_default();
        list.push_front(value.to_string());
        Ok(list.len() as u64)
    }

    fn rpop(&mut self, key: &str) -> Result<Option<String>, StoreError> {
        self.expect_kind(key, Kind::List)?;
        let Some(list) = self.lists.get_mut(key) else {
            return Ok(None);
        };
        let value = list.pop_back();
        if list.is_empty() {
            self.lists.remove(key);
        }
        Ok(value)
    }

    fn rpoplpush(&mut self, source: &str, destination: &str) -> Result<Option<String>, StoreError> {
        self.expect_kind(source, Kind::List)?;
        self.expect_kind(destination, Kind::List)?;
        match self.rpop(source)? {
            Some(value) => {
                self.lpush(destination, &value)?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Remove every occurrence of `value`, returning how many were removed
    fn lrem(&mut self, key: &str, value: &str) -> Result<u64, StoreError> {
        self.expect_kind(key, Kind::List)?;
        let Some(list) = self.lists.get_mut(key) else {
            return Ok(0);
        };
        let before = list.len();
        list.retain(|item| item != value);
        let removed = (before - list.len()) as u64;
        if list.is_empty() {
            self.lists.remove(key);
        }
        Ok(removed)
    }

    fn llen(&self, key: &str) -> Result<u64, StoreError> {
        self.expect_kind(key, Kind::List)?;
        Ok(self.lists.get(key).map_or(0, |list| list.len() as u64))
    }

    // ---- sets -------------------------------------------------------------

    fn sismember(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        self.expect_kind(key, Kind::Set)?;
        Ok(self.sets.get(key).is_some_and(|set| set.contains(member)))
    }

    fn sadd(&mut self, key: &str, member: &str) -> Result<bool, StoreError> {
        self.expect_kind(key, Kind::Set)?;
        Ok(self
            .sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string()))
    }

    fn srem(&mut self, key: &str, member: &str) -> Result<bool, StoreError> {
        self.expect_kind(key, Kind::Set)?;
        let Some(set) = self.sets.get_mut(key) else {
            return Ok(false);
        };
        let removed = set.remove(member);
        if set.is_empty() {
            self.sets.remove(key);
        }
        Ok(removed)
    }

    // ---- hashes -----------------------------------------------------------

    fn hset(&mut self, key: &str, fields: &[(&str, &str)]) -> Result<(), StoreError> {
        self.expect_kind(key, Kind::Hash)?;
        let hash = self.hashes.entry(key.to_string()).or_default();
        for (field, value) in fields {
            match hash.iter_mut().find(|(name, _)| name == field) {
                Some(entry) => entry.1 = value.to_string(),
                None => hash.push((field.to_string(), value.to_string())),
            }
        }
        Ok(())
    }

    fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        self.expect_kind(key, Kind::Hash)?;
        Ok(self.hashes.get(key).and_then(|hash| {
            hash.iter()
                .find(|(name, _)| name == field)
                .map(|(_, value)| value.clone())
        }))
    }

    fn hgetall(&self, key: &str) -> Result<Reply, StoreError> {
        self.expect_kind(key, Kind::Hash)?;
        let items = self
            .hashes
            .get(key)
            .map(|hash| {
                hash.iter()
                    .flat_map(|(field, value)| {
                        [Reply::Bulk(field.clone()), Reply::Bulk(value.clone())]
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(Reply::Array(items))
    }
}

// ============================================================================
// Native Procedures
// ============================================================================

/// Keys and plain values of one script call
struct ScriptArgs<'a, const KEYS: usize> {
    keys: &'a [String; KEYS],
    argv: &'a [String],
}

impl<'a, const KEYS: usize> ScriptArgs<'a, KEYS> {
    fn split(
        procedure: Procedure,
        key_count: usize,
        args: &'a [String],
        min_argv: usize,
    ) -> Result<Self, StoreError> {
        if key_count > args.len() {
            return Err(StoreError::Backend {
                store: STORE_NAME.to_string(),
                message: format!(
                    "key count {} exceeds argument count {}",
                    key_count,
                    args.len()
                ),
            });
        }

        let (keys, argv) = args.split_at(key_count);
        let keys = <&[String; KEYS]>::try_from(keys)
            .ok()
            .filter(|_| argv.len() >= min_argv)
            .ok_or_else(|| StoreError::Backend {
                store: STORE_NAME.to_string(),
                message: format!(
                    "{} expects {} keys and at least {} values, got {} and {}",
                    procedure,
                    KEYS,
                    min_argv,
                    key_count,
                    argv.len()
                ),
            })?;

        Ok(Self { keys, argv })
    }
}

/// Returns the reply and whether any list was pushed to
fn run_procedure(
    state: &mut StoreState,
    procedure: Procedure,
    key_count: usize,
    args: &[String],
) -> Result<(Reply, bool), StoreError> {
    match procedure {
        Procedure::Submit => submit(state, ScriptArgs::split(procedure, key_count, args, 2)?),
        Procedure::Receive => receive(state, ScriptArgs::split(procedure, key_count, args, 1)?),
        Procedure::Finish => finish(state, ScriptArgs::split(procedure, key_count, args, 2)?),
    }
}

fn submit(state: &mut StoreState, args: ScriptArgs<'_, 4>) -> Result<(Reply, bool), StoreError> {
    let [counter, dedup_set, concurrency_key, destination] = args.keys;
    let body = &args.argv[0];
    let requested_at = &args.argv[1];
    let mode = args.argv.get(2).map(String::as_str);

    if state.sismember(dedup_set, concurrency_key)? {
        return Ok((Reply::Nil, false));
    }

    let id = state.incr(counter)?;
    let id_text = id.to_string();
    let key = message_key(&id_text);

    state.hset(
        &key,
        &[
            ("id", id_text.as_str()),
            ("status", "submitted"),
            ("requested_at", requested_at.as_str()),
            ("concurrent_id", concurrency_key.as_str()),
            ("body", body.as_str()),
        ],
    )?;
    state.sadd(dedup_set, concurrency_key)?;
    state.lpush(destination, &id_text)?;

    let reply = if mode == Some("record") {
        state.hgetall(&key)?
    } else {
        Reply::Int(id)
    };
    Ok((reply, true))
}

fn message_key(id: &str) -> String {
    format!("{}{}", MESSAGE_KEY_PREFIX, id)
}

fn is_message(state: &StoreState, id: &str) -> bool {
    state.kind_of(&message_key(id)) == Some(Kind::Hash)
}

fn has_status(state: &StoreState, id: &str, status: &str) -> Result<bool, StoreError> {
    if !is_message(state, id) {
        return Ok(false);
    }
    Ok(state.hget(&message_key(id), "status")?.as_deref() == Some(status))
}

fn receive(state: &mut StoreState, args: ScriptArgs<'_, 2>) -> Result<(Reply, bool), StoreError> {
    let [submit_queue, receive_queue] = args.keys;
    let started_at = &args.argv[0];
    state.expect_kind(receive_queue, Kind::List)?;

    let mut pushed = false;
    let id = match args.argv.get(1) {
        Some(id) => {
            if !is_message(state, id) {
                // Not a message at all: drop the stray value from both queues
                state.lrem(submit_queue, id)?;
                state.lrem(receive_queue, id)?;
                return Ok((Reply::Nil, false));
            }
            if !has_status(state, id, "submitted")? {
                return Ok((Reply::Nil, false));
            }
            if state.lrem(submit_queue, id)? > 0 {
                state.lpush(receive_queue, id)?;
                pushed = true;
            }
            id.clone()
        }
        None => loop {
            let Some(id) = state.rpop(submit_queue)? else {
                return Ok((Reply::Nil, false));
            };
            if has_status(state, &id, "submitted")? {
                state.lpush(receive_queue, &id)?;
                pushed = true;
                break id;
            }
            debug!(
                queue = %submit_queue,
                value = %id,
                "Discarded value that is not a submitted message"
            );
        },
    };

    let key = message_key(&id);
    state.hset(&key, &[("status", "received"), ("started_at", started_at.as_str())])?;
    Ok((state.hgetall(&key)?, pushed))
}

fn finish(state: &mut StoreState, args: ScriptArgs<'_, 4>) -> Result<(Reply, bool), StoreError> {
    let [receive_queue, finish_queue, id, dedup_set] = args.keys;
    let status = &args.argv[0];
    let finished_at = &args.argv[1];

    // Only a received message may finish
    if !has_status(state, id, "received")? {
        return Ok((Reply::Int(0), false));
    }
    if state.lrem(receive_queue, id)? == 0 {
        return Ok((Reply::Int(0), false));
    }

    state.lpush(finish_queue, id)?;

    let key = message_key(id);
    state.hset(&key, &[("status", status.as_str()), ("finished_at", finished_at.as_str())])?;

    if let Some(concurrent_id) = state.hget(&key, "concurrent_id")? {
        state.srem(dedup_set, &concurrent_id)?;
    }
    Ok((Reply::Int(1), true))
}

// ============================================================================
// MemoryStore
// ============================================================================

/// In-memory atomic store
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<StoreState>>,
    pushed: Arc<Notify>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, StoreState>, StoreError> {
        self.state.lock().map_err(|e| StoreError::Backend {
            store: STORE_NAME.to_string(),
            message: format!("Failed to acquire store lock: {}", e),
        })
    }

    /// Drop every registered script, as a server does on `SCRIPT FLUSH`
    pub fn flush_scripts(&self) -> Result<(), StoreError> {
        self.lock()?.scripts.clear();
        Ok(())
    }

    /// Number of registered scripts
    pub fn script_count(&self) -> Result<usize, StoreError> {
        Ok(self.lock()?.scripts.len())
    }

    /// Drop all keys but keep registered scripts
    pub fn flush_data(&self) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        let scripts = std::mem::take(&mut state.scripts);
        *state = StoreState {
            scripts,
            ..StoreState::default()
        };
        Ok(())
    }

    /// Full contents of a list, left to right
    pub fn list_range(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let state = self.lock()?;
        state.expect_kind(key, Kind::List)?;
        Ok(state
            .lists
            .get(key)
            .map(|list| list.iter().cloned().collect())
            .unwrap_or_default())
    }

    /// Members of a set, sorted
    pub fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let state = self.lock()?;
        state.expect_kind(key, Kind::Set)?;
        let mut members: Vec<String> = state
            .sets
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        members.sort();
        Ok(members)
    }

    /// All fields of a hash in insertion order
    pub fn hash_get_all(&self, key: &str) -> Result<Vec<(String, String)>, StoreError> {
        let state = self.lock()?;
        state.expect_kind(key, Kind::Hash)?;
        Ok(state.hashes.get(key).cloned().unwrap_or_default())
    }

    fn try_move(&self, source: &str, destination: &str) -> Result<Option<String>, StoreError> {
        let moved = self.lock()?.rpoplpush(source, destination)?;
        if moved.is_some() {
            self.pushed.notify_waiters();
        }
        Ok(moved)
    }
}

#[async_trait]
impl AtomicStore for MemoryStore {
    fn capabilities(&self) -> StoreCapabilities {
        StoreCapabilities {
            name: STORE_NAME.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            supports_scripting: true,
            supports_blocking_pop: true,
        }
    }

    async fn load_script(&self, source: &str) -> Result<ScriptId, StoreError> {
        let procedure =
            Procedure::from_source(source).ok_or_else(|| StoreError::ScriptRejected {
                message: "memory store only runs atomic-queue procedures".to_string(),
            })?;

        let id = ScriptId::new(hex::encode(Sha1::digest(source.as_bytes())));
        self.lock()?.scripts.insert(id.clone(), procedure);
        debug!(procedure = %procedure, script_id = %id, "Script loaded into memory store");
        Ok(id)
    }

    async fn eval_script(
        &self,
        id: &ScriptId,
        key_count: usize,
        args: &[String],
    ) -> Result<Reply, StoreError> {
        let (reply, pushed) = {
            let mut state = self.lock()?;
            let procedure = *state
                .scripts
                .get(id)
                .ok_or_else(|| StoreError::NoScript {
                    id: id.to_string(),
                })?;
            run_procedure(&mut state, procedure, key_count, args)?
        };

        if pushed {
            self.pushed.notify_waiters();
        }
        Ok(reply)
    }

    async fn list_length(&self, key: &str) -> Result<u64, StoreError> {
        self.lock()?.llen(key)
    }

    async fn list_push(&self, key: &str, value: &str) -> Result<u64, StoreError> {
        let length = self.lock()?.lpush(key, value)?;
        self.pushed.notify_waiters();
        Ok(length)
    }

    async fn list_pop(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.lock()?.rpop(key)
    }

    async fn blocking_move(
        &self,
        source: &str,
        destination: &str,
        timeout: Duration,
    ) -> Result<Option<String>, StoreError> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            // Register for wake-ups before checking so a push between the
            // check and the wait is not missed
            let notified = self.pushed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(value) = self.try_move(source, destination)? {
                return Ok(Some(value));
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn time(&self) -> Result<StoreTime, StoreError> {
        let elapsed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| StoreError::Backend {
                store: STORE_NAME.to_string(),
                message: format!("system clock before epoch: {}", e),
            })?;

        Ok(StoreTime {
            seconds: elapsed.as_secs() as i64,
            micros: elapsed.subsec_micros(),
        })
    }
}
