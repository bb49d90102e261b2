//! Message types for queue operations including core domain identifiers.

use crate::error::ValidationError;
use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Prefix of the per-message record key (`message:<id>`).
pub const MESSAGE_KEY_PREFIX: &str = "message:";

// ============================================================================
// Core Domain Identifiers
// ============================================================================

/// Validated queue name with length and character restrictions
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct QueueName(String);

impl QueueName {
    /// Create new queue name with validation
    pub fn new(name: String) -> Result<Self, ValidationError> {
        // Validate length
        if name.is_empty() || name.len() > 260 {
            return Err(ValidationError::OutOfRange {
                field: "queue_name".to_string(),
                message: "must be 1-260 characters".to_string(),
            });
        }

        // Store keys are namespaced with ':' and '.', so both are allowed here
        if !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | ':' | '.'))
        {
            return Err(ValidationError::InvalidFormat {
                field: "queue_name".to_string(),
                message: "only ASCII alphanumeric, '-', '_', ':' and '.' allowed".to_string(),
            });
        }

        Ok(Self(name))
    }

    /// Create queue name for built-in defaults
    pub(crate) fn from_static(name: &'static str) -> Self {
        // Use unchecked creation since we control the format
        Self(name.to_string())
    }

    /// Create queue name with prefix, e.g. `queue:submitted`
    pub fn with_prefix(prefix: &str, base_name: &str) -> Result<Self, ValidationError> {
        Self::new(format!("{}:{}", prefix, base_name))
    }

    /// Get queue name as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for QueueName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for QueueName {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s.to_string())
    }
}

impl TryFrom<String> for QueueName {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<QueueName> for String {
    fn from(name: QueueName) -> Self {
        name.0
    }
}

/// Store-assigned message identifier, allocated from a shared counter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(u64);

impl MessageId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn value(&self) -> u64 {
        self.0
    }

    /// Key of the hash holding this message's record
    pub fn record_key(&self) -> String {
        format!("{}{}", MESSAGE_KEY_PREFIX, self.0)
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MessageId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(ValidationError::Required {
                field: "message_id".to_string(),
            });
        }

        s.parse::<u64>()
            .map(Self)
            .map_err(|e| ValidationError::InvalidFormat {
                field: "message_id".to_string(),
                message: e.to_string(),
            })
    }
}

/// Key used to deduplicate logically equivalent in-flight submissions
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ConcurrencyKey(String);

impl ConcurrencyKey {
    /// Create new concurrency key with validation
    pub fn new(key: String) -> Result<Self, ValidationError> {
        if key.is_empty() {
            return Err(ValidationError::Required {
                field: "concurrency_key".to_string(),
            });
        }

        if key.len() > 512 {
            return Err(ValidationError::OutOfRange {
                field: "concurrency_key".to_string(),
                message: "maximum 512 bytes".to_string(),
            });
        }

        if key.chars().any(|c| c.is_ascii_control()) {
            return Err(ValidationError::InvalidFormat {
                field: "concurrency_key".to_string(),
                message: "control characters are not allowed".to_string(),
            });
        }

        Ok(Self(key))
    }

    /// Create concurrency key from a job code and job type (`code.type`)
    pub fn from_parts(job_code: &str, job_type: &str) -> Result<Self, ValidationError> {
        Self::new(format!("{}.{}", job_code, job_type))
    }

    /// Get concurrency key as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ConcurrencyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ConcurrencyKey {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s.to_string())
    }
}

impl TryFrom<String> for ConcurrencyKey {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ConcurrencyKey> for String {
    fn from(key: ConcurrencyKey) -> Self {
        key.0
    }
}

/// Timestamp wrapper for consistent time handling
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Create timestamp for current local time
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Create timestamp from DateTime
    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Self(dt)
    }

    /// Convert a store clock reading into a timestamp rounded to the millisecond
    pub fn from_store_time(seconds: i64, micros: u32) -> Option<Self> {
        let millis = seconds
            .checked_mul(1000)?
            .checked_add((i64::from(micros) + 500) / 1000)?;
        Utc.timestamp_millis_opt(millis).single().map(Self)
    }

    /// Get underlying DateTime
    pub fn as_datetime(&self) -> DateTime<Utc> {
        self.0
    }

    /// Encoding used in message records
    pub fn to_wire(&self) -> String {
        self.0.to_rfc3339_opts(SecondsFormat::Millis, true)
    }

    /// Parse a value written by [`Timestamp::to_wire`]
    pub fn from_wire(value: &str) -> Result<Self, ValidationError> {
        DateTime::parse_from_rfc3339(value)
            .map(|dt| Self(dt.with_timezone(&Utc)))
            .map_err(|e| ValidationError::InvalidFormat {
                field: "timestamp".to_string(),
                message: e.to_string(),
            })
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%d %H:%M:%S%.3f UTC"))
    }
}

// ============================================================================
// Message Lifecycle
// ============================================================================

/// Lifecycle status of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageStatus {
    Submitted,
    Received,
    FinishedOk,
    FinishedWithError,
}

impl MessageStatus {
    /// Value stored in the record's `status` field
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Submitted => "submitted",
            Self::Received => "received",
            Self::FinishedOk => "finished ok",
            Self::FinishedWithError => "finished with error",
        }
    }

    /// Check if no further transition is possible
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::FinishedOk | Self::FinishedWithError)
    }

    /// Check if moving to `next` follows submitted -> received -> finished
    pub fn can_transition_to(&self, next: MessageStatus) -> bool {
        matches!(
            (self, next),
            (Self::Submitted, Self::Received)
                | (Self::Received, Self::FinishedOk)
                | (Self::Received, Self::FinishedWithError)
        )
    }
}

impl std::fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageStatus {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "submitted" => Ok(Self::Submitted),
            "received" => Ok(Self::Received),
            "finished ok" => Ok(Self::FinishedOk),
            "finished with error" => Ok(Self::FinishedWithError),
            other => Err(ValidationError::InvalidFormat {
                field: "status".to_string(),
                message: format!("unknown status '{}'", other),
            }),
        }
    }
}

// ============================================================================
// Message Record
// ============================================================================

/// A message as persisted in the store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: MessageId,
    pub concurrent_id: ConcurrencyKey,
    /// Caller-serialized payload, stored verbatim.
    ///
    /// Bodies are UTF-8 text; binary payloads must be encoded (for example
    /// as base64 or JSON) before submitting.
    pub body: String,
    pub status: MessageStatus,
    pub requested_at: Timestamp,
    pub started_at: Option<Timestamp>,
    pub finished_at: Option<Timestamp>,
}

impl MessageRecord {
    /// Rebuild a record from the `(field, value)` pairs of its hash.
    ///
    /// Every field may appear at most once; unknown fields and missing
    /// required fields are rejected rather than skipped.
    pub fn from_pairs<I>(pairs: I) -> Result<Self, ValidationError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut id = None;
        let mut concurrent_id = None;
        let mut body = None;
        let mut status = None;
        let mut requested_at = None;
        let mut started_at = None;
        let mut finished_at = None;

        for (field, value) in pairs {
            let duplicate = match field.as_str() {
                "id" => id.replace(value.parse::<MessageId>()?).is_some(),
                "concurrent_id" => concurrent_id
                    .replace(ConcurrencyKey::new(value)?)
                    .is_some(),
                "body" => body.replace(value).is_some(),
                "status" => status.replace(value.parse::<MessageStatus>()?).is_some(),
                "requested_at" => requested_at
                    .replace(Timestamp::from_wire(&value)?)
                    .is_some(),
                "started_at" => started_at.replace(Timestamp::from_wire(&value)?).is_some(),
                "finished_at" => finished_at
                    .replace(Timestamp::from_wire(&value)?)
                    .is_some(),
                other => {
                    return Err(ValidationError::InvalidFormat {
                        field: other.to_string(),
                        message: "unknown record field".to_string(),
                    })
                }
            };

            if duplicate {
                return Err(ValidationError::InvalidFormat {
                    field,
                    message: "field appears more than once".to_string(),
                });
            }
        }

        let required = |field: &str| ValidationError::Required {
            field: field.to_string(),
        };

        Ok(Self {
            id: id.ok_or_else(|| required("id"))?,
            concurrent_id: concurrent_id.ok_or_else(|| required("concurrent_id"))?,
            body: body.ok_or_else(|| required("body"))?,
            status: status.ok_or_else(|| required("status"))?,
            requested_at: requested_at.ok_or_else(|| required("requested_at"))?,
            started_at,
            finished_at,
        })
    }

    /// Flatten the record into the `(field, value)` pairs of its hash
    pub fn to_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = vec![
            ("id".to_string(), self.id.to_string()),
            ("status".to_string(), self.status.as_str().to_string()),
            ("requested_at".to_string(), self.requested_at.to_wire()),
            (
                "concurrent_id".to_string(),
                self.concurrent_id.as_str().to_string(),
            ),
            ("body".to_string(), self.body.clone()),
        ];
        if let Some(started_at) = self.started_at {
            pairs.push(("started_at".to_string(), started_at.to_wire()));
        }
        if let Some(finished_at) = self.finished_at {
            pairs.push(("finished_at".to_string(), finished_at.to_wire()));
        }
        pairs
    }

    /// Deserialize the body as JSON
    pub fn body_json<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_str(&self.body)
    }
}

#[cfg(test)]
#[path = "message_tests.rs"]
mod tests;
