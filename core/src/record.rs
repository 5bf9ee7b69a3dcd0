//! Strong types for topic identity, record identity, and the message record
//! itself.
//!
//! This module defines the newtype wrappers used throughout the engine so
//! that a topic name, a record id, and a sharding key can never be
//! accidentally swapped for a plain `String` or `u64`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error type for [`TopicName`] parsing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid topic name: {0}")]
pub struct ParseTopicNameError(String);

/// The name of a topic.
///
/// Used as the record-store collection name, the counter name, and (via
/// [`TopicName::channel`]) the signal-bus channel suffix.
///
/// # Examples
///
/// ```
/// use ordlog_core::record::TopicName;
///
/// let topic = TopicName::new("orders");
/// assert_eq!(topic.as_str(), "orders");
/// assert_eq!(topic.channel(), "TOPIC-orders");
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TopicName(String);

impl TopicName {
    /// Create a new `TopicName` from a string.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Get the topic name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The signal-bus channel name for this topic: `"TOPIC-" + name`.
    #[must_use]
    pub fn channel(&self) -> String {
        format!("TOPIC-{}", self.0)
    }
}

impl fmt::Display for TopicName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TopicName {
    type Err = ParseTopicNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(ParseTopicNameError("topic name cannot be empty".to_string()));
        }
        Ok(Self(s.to_string()))
    }
}

impl From<String> for TopicName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for TopicName {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for TopicName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A record's position within a topic.
///
/// Strictly increasing and unique within a topic; gaps are permitted but
/// never invert order (spec invariant: for any two successful producer
/// calls A then B, `id(A) < id(B)`).
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordId(u64);

impl RecordId {
    /// Create a new `RecordId` with the given value.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Get the underlying value.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for RecordId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<RecordId> for u64 {
    fn from(id: RecordId) -> Self {
        id.0
    }
}

/// A non-empty sharding key.
///
/// Metadata for downstream routing only; does not affect storage or
/// ordering within the engine. Messages sharing a key are streamed in
/// append order as a consequence of global ordering, not because the
/// engine partitions by key.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShardingKey(String);

/// Error constructing a [`ShardingKey`] from an empty string.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("sharding key cannot be empty")]
pub struct EmptyShardingKeyError;

impl ShardingKey {
    /// Create a sharding key, rejecting the empty string.
    ///
    /// # Errors
    ///
    /// Returns [`EmptyShardingKeyError`] if `key` is empty.
    pub fn new(key: impl Into<String>) -> Result<Self, EmptyShardingKeyError> {
        let key = key.into();
        if key.is_empty() {
            return Err(EmptyShardingKeyError);
        }
        Ok(Self(key))
    }

    /// Get the sharding key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ShardingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A compaction identifier tagging successive versions of the same logical
/// entity.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LogCompactId(String);

impl LogCompactId {
    /// Create a new compaction id.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the compaction id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LogCompactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A durable, ordered message record.
///
/// This is the unit stored and streamed by the engine. `payload` is opaque
/// to the engine: callers serialize their own types to [`serde_json::Value`]
/// before construction and deserialize after retrieval.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Record {
    /// Strictly increasing, unique within the topic.
    pub id: RecordId,
    /// Wall-clock timestamp assigned by the producer at insert.
    pub created_at: DateTime<Utc>,
    /// Downstream routing metadata; does not affect ordering.
    pub sharding_key: ShardingKey,
    /// Optional compaction class tag.
    pub log_compact_id: Option<LogCompactId>,
    /// Opaque, caller-typed payload.
    pub payload: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn record_id_ordering_matches_underlying_u64(a in any::<u64>(), b in any::<u64>()) {
            prop_assert_eq!(RecordId::new(a) < RecordId::new(b), a < b);
        }
    }

    #[test]
    fn topic_name_channel() {
        let topic = TopicName::new("orders");
        assert_eq!(topic.channel(), "TOPIC-orders");
    }

    #[test]
    fn topic_name_parse_empty_fails() {
        assert!("".parse::<TopicName>().is_err());
    }

    #[test]
    fn record_id_ordering() {
        assert!(RecordId::new(1) < RecordId::new(2));
    }

    #[test]
    fn sharding_key_rejects_empty() {
        assert!(ShardingKey::new("").is_err());
        assert!(ShardingKey::new("k").is_ok());
    }
}
