//! Redis-backed atomic store.
//!
//! Scripts are registered with `SCRIPT LOAD` and run with `EVALSHA`, so each
//! procedure executes indivisibly on the server. Each blocking move takes
//! `BRPOPLPUSH` onto a connection of its own, drawn from a pool of idle
//! connections, so concurrent moves never wait on each other or stall the
//! multiplexed connection shared by every other command.

use crate::error::StoreError;
use crate::store::{AtomicStore, Reply, ScriptId, StoreCapabilities, StoreTime};
use ::redis::aio::MultiplexedConnection;
use ::redis::{Client, ErrorKind, RedisError, Value};
use async_trait::async_trait;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, info};

#[cfg(test)]
#[path = "redis_tests.rs"]
mod tests;

const STORE_NAME: &str = "redis";

/// Smallest timeout passed to `BRPOPLPUSH`; zero would block forever
const MIN_BLOCK_SECONDS: f64 = 0.01;

/// Idle blocking connections kept for reuse; extra ones are closed
const MAX_IDLE_BLOCKING: usize = 16;

/// Atomic store backed by a Redis server
pub struct RedisStore {
    client: Client,
    connection: MultiplexedConnection,
    idle_blocking: Mutex<Vec<MultiplexedConnection>>,
    version: String,
}

impl RedisStore {
    /// Connect to the server at `url`, e.g. `redis://127.0.0.1:6379/0`
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = Client::open(url).map_err(|e| map_error(e, None))?;
        let mut connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| map_error(e, None))?;
        let info: String = ::redis::cmd("INFO")
            .arg("server")
            .query_async(&mut connection)
            .await
            .map_err(|e| map_error(e, None))?;
        let version = server_version(&info).unwrap_or("unknown").to_string();

        info!(version = %version, "Connected to Redis");
        Ok(Self {
            client,
            connection,
            idle_blocking: Mutex::new(Vec::new()),
            version,
        })
    }

    /// Number of blocking connections currently idle in the pool
    pub fn idle_blocking_connections(&self) -> usize {
        self.idle_pool().len()
    }

    fn idle_pool(&self) -> std::sync::MutexGuard<'_, Vec<MultiplexedConnection>> {
        self.idle_blocking
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Take an idle blocking connection or open a new one
    async fn checkout_blocking(&self) -> Result<MultiplexedConnection, StoreError> {
        let idle = self.idle_pool().pop();
        match idle {
            Some(connection) => Ok(connection),
            None => {
                debug!("Opening connection for blocking move");
                self.client
                    .get_multiplexed_async_connection()
                    .await
                    .map_err(|e| map_error(e, None))
            }
        }
    }

    fn checkin_blocking(&self, connection: MultiplexedConnection) {
        let mut idle = self.idle_pool();
        if idle.len() < MAX_IDLE_BLOCKING {
            idle.push(connection);
        }
    }

    /// Drop every script cached by the server
    pub async fn flush_scripts(&self) -> Result<(), StoreError> {
        let mut connection = self.connection.clone();
        let _: Value = ::redis::cmd("SCRIPT")
            .arg("FLUSH")
            .query_async(&mut connection)
            .await
            .map_err(|e| map_error(e, None))?;
        Ok(())
    }
}

#[async_trait]
impl AtomicStore for RedisStore {
    fn capabilities(&self) -> StoreCapabilities {
        StoreCapabilities {
            name: STORE_NAME.to_string(),
            version: self.version.clone(),
            supports_scripting: true,
            supports_blocking_pop: true,
        }
    }

    async fn load_script(&self, source: &str) -> Result<ScriptId, StoreError> {
        let mut connection = self.connection.clone();
        let id: String = ::redis::cmd("SCRIPT")
            .arg("LOAD")
            .arg(source)
            .query_async(&mut connection)
            .await
            .map_err(|e| match e.kind() {
                ErrorKind::ResponseError => StoreError::ScriptRejected {
                    message: e.to_string(),
                },
                _ => map_error(e, None),
            })?;

        debug!(script_id = %id, "Script loaded into Redis");
        Ok(ScriptId::new(id))
    }

    async fn eval_script(
        &self,
        id: &ScriptId,
        key_count: usize,
        args: &[String],
    ) -> Result<Reply, StoreError> {
        let mut connection = self.connection.clone();
        let mut command = ::redis::cmd("EVALSHA");
        command.arg(id.as_str()).arg(key_count);
        for arg in args {
            command.arg(arg.as_str());
        }

        let value: Value = command
            .query_async(&mut connection)
            .await
            .map_err(|e| {
                if e.kind() == ErrorKind::NoScriptError {
                    StoreError::NoScript { id: id.to_string() }
                } else {
                    map_error(e, None)
                }
            })?;

        to_reply(value)
    }

    async fn list_length(&self, key: &str) -> Result<u64, StoreError> {
        let mut connection = self.connection.clone();
        ::redis::cmd("LLEN")
            .arg(key)
            .query_async(&mut connection)
            .await
            .map_err(|e| map_error(e, Some(key)))
    }

    async fn list_push(&self, key: &str, value: &str) -> Result<u64, StoreError> {
        let mut connection = self.connection.clone();
        ::redis::cmd("LPUSH")
            .arg(key)
            .arg(value)
            .query_async(&mut connection)
            .await
            .map_err(|e| map_error(e, Some(key)))
    }

    async fn list_pop(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut connection = self.connection.clone();
        ::redis::cmd("RPOP")
            .arg(key)
            .query_async(&mut connection)
            .await
            .map_err(|e| map_error(e, Some(key)))
    }

    async fn blocking_move(
        &self,
        source: &str,
        destination: &str,
        timeout: Duration,
    ) -> Result<Option<String>, StoreError> {
        let seconds = timeout.as_secs_f64().max(MIN_BLOCK_SECONDS);
        let mut connection = self.checkout_blocking().await?;
        let moved = ::redis::cmd("BRPOPLPUSH")
            .arg(source)
            .arg(destination)
            .arg(seconds)
            .query_async(&mut connection)
            .await
            .map_err(|e| map_error(e, Some(source)))?;

        // A failed connection is dropped rather than returned to the pool
        self.checkin_blocking(connection);
        Ok(moved)
    }

    async fn time(&self) -> Result<StoreTime, StoreError> {
        let mut connection = self.connection.clone();
        let (seconds, micros): (i64, u32) = ::redis::cmd("TIME")
            .query_async(&mut connection)
            .await
            .map_err(|e| map_error(e, None))?;
        Ok(StoreTime { seconds, micros })
    }
}

fn server_version(info: &str) -> Option<&str> {
    info.lines()
        .find_map(|line| line.strip_prefix("redis_version:"))
        .map(str::trim)
}

fn map_error(error: RedisError, key: Option<&str>) -> StoreError {
    if error.code() == Some("WRONGTYPE") {
        return StoreError::WrongType {
            key: key.unwrap_or_default().to_string(),
        };
    }

    if error.is_io_error() || error.is_connection_dropped() || error.is_connection_refusal() {
        return StoreError::ConnectionFailed {
            message: error.to_string(),
        };
    }

    StoreError::Backend {
        store: STORE_NAME.to_string(),
        message: error.to_string(),
    }
}

fn to_reply(value: Value) -> Result<Reply, StoreError> {
    let reply = match value {
        Value::Nil => Reply::Nil,
        Value::Int(value) => Reply::Int(value),
        Value::BulkString(bytes) => Reply::Bulk(String::from_utf8(bytes).map_err(|e| {
            StoreError::Backend {
                store: STORE_NAME.to_string(),
                message: format!("reply is not UTF-8: {}", e),
            }
        })?),
        Value::SimpleString(text) => Reply::Status(text),
        Value::Okay => Reply::Status("OK".to_string()),
        Value::Array(items) => Reply::Array(
            items
                .into_iter()
                .map(to_reply)
                .collect::<Result<Vec<_>, _>>()?,
        ),
        other => {
            return Err(StoreError::Backend {
                store: STORE_NAME.to_string(),
                message: format!("unsupported reply {:?}", other),
            })
        }
    };
    Ok(reply)
}
