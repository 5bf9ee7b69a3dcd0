//! Record-store capability trait and related error types.
//!
//! This module defines the abstraction the engine requires from the
//! durable store of record: atomic increment-and-read of a named counter,
//! durable insert, and ordered range fetch.
//!
//! # Design
//!
//! The [`RecordStore`] trait is deliberately minimal. It does not know
//! about producers, consumers, or compaction — those are built on top of
//! it in `ordlog-engine`.
//!
//! # Dyn Compatibility
//!
//! This trait returns `Pin<Box<dyn Future<...>> + Send + '_>` instead of
//! using `async fn`, so that `Arc<dyn RecordStore>` can be shared between
//! a `Producer`, a `Consumer`, and a `TopicSetter` at once.

use crate::record::{Record, RecordId, TopicName};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors that can occur during record-store operations.
///
/// All variants are retryable from the caller's perspective; the adapter
/// does not retry internally for `insert`/`fetch_after`.
#[derive(Error, Debug, Clone)]
pub enum RecordStoreError {
    /// The counter increment could not be completed. The counter did not
    /// advance, so the caller may retry without burning an id.
    #[error("failed to allocate next id for topic '{topic}': {reason}")]
    AllocFailed {
        /// The topic whose counter allocation failed.
        topic: String,
        /// The underlying reason.
        reason: String,
    },

    /// The insert was not acknowledged as durable. The id is considered
    /// burned: the caller must not retry with the same id.
    #[error("insert not acknowledged for topic '{topic}', id {id}: {reason}")]
    InsertNotAcknowledged {
        /// The topic the insert targeted.
        topic: String,
        /// The id that was burned.
        id: RecordId,
        /// The underlying reason.
        reason: String,
    },

    /// A range fetch failed.
    #[error("failed to fetch records for topic '{topic}': {reason}")]
    FetchFailed {
        /// The topic the fetch targeted.
        topic: String,
        /// The underlying reason.
        reason: String,
    },
}

/// Capability-level interface to a durable, ordered record store.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync` for concurrent use from multiple
/// producers and consumers against the same topic.
pub trait RecordStore: Send + Sync {
    /// Atomically increment the named per-topic counter and return the
    /// post-increment value.
    ///
    /// Creates the counter at 1 if missing. Must be linearizable across
    /// concurrent callers: the counter is the sole source of truth for
    /// topic order.
    ///
    /// # Errors
    ///
    /// Returns [`RecordStoreError::AllocFailed`] if the increment cannot be
    /// completed. The counter is guaranteed not to have advanced.
    fn allocate_next_id(
        &self,
        topic: &TopicName,
    ) -> Pin<Box<dyn Future<Output = Result<RecordId, RecordStoreError>> + Send + '_>>;

    /// Durably append a record. Must not return successfully until the
    /// write is durable.
    ///
    /// # Errors
    ///
    /// Returns [`RecordStoreError::InsertNotAcknowledged`] if the store
    /// does not acknowledge durability. The record's id is burned; no
    /// retry should reuse it.
    fn insert(
        &self,
        topic: &TopicName,
        record: Record,
    ) -> Pin<Box<dyn Future<Output = Result<(), RecordStoreError>> + Send + '_>>;

    /// Fetch up to `limit` records with `id > after_id`, sorted ascending
    /// by id. The implementation must impose the sort; unsorted storage
    /// order is not acceptable.
    ///
    /// # Errors
    ///
    /// Returns [`RecordStoreError::FetchFailed`] if the query fails.
    fn fetch_after(
        &self,
        topic: &TopicName,
        after_id: Option<RecordId>,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Record>, RecordStoreError>> + Send + '_>>;
}
