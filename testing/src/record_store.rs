//! In-memory [`RecordStore`] double.

use ordlog_core::record::{Record, RecordId, TopicName};
use ordlog_core::store::{RecordStore, RecordStoreError};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

#[derive(Default)]
struct TopicData {
    counter: u64,
    records: Vec<Record>,
}

/// An in-memory [`RecordStore`] for unit and integration tests.
///
/// An `Arc<RwLock<HashMap<...>>>` behind a cloneable handle, plus a couple
/// of inspection helpers tests can use without going through the trait.
#[derive(Clone, Debug, Default)]
pub struct InMemoryRecordStore {
    topics: Arc<RwLock<HashMap<TopicName, TopicDataHandle>>>,
}

// `TopicData` itself doesn't need `Debug`/`Clone`; keep the map's value
// type distinct so the derive on the outer struct stays honest.
type TopicDataHandle = Arc<RwLock<TopicData>>;

impl std::fmt::Debug for TopicData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopicData")
            .field("counter", &self.counter)
            .field("record_count", &self.records.len())
            .finish()
    }
}

impl InMemoryRecordStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn topic_handle(&self, topic: &TopicName) -> TopicDataHandle {
        let mut topics = self.topics.write().unwrap_or_else(std::sync::PoisonError::into_inner);
        topics.entry(topic.clone()).or_default().clone()
    }

    /// The number of records stored for `topic`. Test-only inspection
    /// helper, bypassing the trait.
    #[must_use]
    pub fn len(&self, topic: &TopicName) -> usize {
        let topics = self.topics.read().unwrap_or_else(std::sync::PoisonError::into_inner);
        topics
            .get(topic)
            .map_or(0, |handle| handle.read().unwrap_or_else(std::sync::PoisonError::into_inner).records.len())
    }

    /// Whether `topic` has no stored records.
    #[must_use]
    pub fn is_empty(&self, topic: &TopicName) -> bool {
        self.len(topic) == 0
    }
}

impl RecordStore for InMemoryRecordStore {
    fn allocate_next_id(
        &self,
        topic: &TopicName,
    ) -> Pin<Box<dyn Future<Output = Result<RecordId, RecordStoreError>> + Send + '_>> {
        let handle = self.topic_handle(topic);
        Box::pin(async move {
            let mut data = handle.write().unwrap_or_else(std::sync::PoisonError::into_inner);
            data.counter += 1;
            Ok(RecordId::new(data.counter))
        })
    }

    fn insert(
        &self,
        topic: &TopicName,
        record: Record,
    ) -> Pin<Box<dyn Future<Output = Result<(), RecordStoreError>> + Send + '_>> {
        let handle = self.topic_handle(topic);
        Box::pin(async move {
            let mut data = handle.write().unwrap_or_else(std::sync::PoisonError::into_inner);
            data.records.push(record);
            Ok(())
        })
    }

    fn fetch_after(
        &self,
        topic: &TopicName,
        after_id: Option<RecordId>,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Record>, RecordStoreError>> + Send + '_>> {
        let handle = self.topic_handle(topic);
        Box::pin(async move {
            let data = handle.read().unwrap_or_else(std::sync::PoisonError::into_inner);
            let mut matching: Vec<Record> = data
                .records
                .iter()
                .filter(|r| after_id.is_none_or(|after| r.id > after))
                .cloned()
                .collect();
            matching.sort_by_key(|r| r.id);
            matching.truncate(limit);
            Ok(matching)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ordlog_core::record::ShardingKey;

    fn record(id: u64) -> Record {
        Record {
            id: RecordId::new(id),
            created_at: chrono::Utc::now(),
            sharding_key: ShardingKey::new("k").expect("non-empty"),
            log_compact_id: None,
            payload: serde_json::json!({ "n": id }),
        }
    }

    #[tokio::test]
    async fn allocate_ids_increase_monotonically() {
        let store = InMemoryRecordStore::new();
        let topic = TopicName::new("orders");

        let first = store.allocate_next_id(&topic).await.expect("alloc");
        let second = store.allocate_next_id(&topic).await.expect("alloc");

        assert_eq!(first, RecordId::new(1));
        assert_eq!(second, RecordId::new(2));
    }

    #[tokio::test]
    async fn fetch_after_returns_ascending_and_respects_limit() {
        let store = InMemoryRecordStore::new();
        let topic = TopicName::new("orders");

        for id in [3, 1, 2] {
            store.insert(&topic, record(id)).await.expect("insert");
        }

        let fetched = store
            .fetch_after(&topic, None, 2)
            .await
            .expect("fetch");

        assert_eq!(fetched.len(), 2);
        assert_eq!(fetched[0].id, RecordId::new(1));
        assert_eq!(fetched[1].id, RecordId::new(2));
    }

    #[tokio::test]
    async fn fetch_after_excludes_seen_ids() {
        let store = InMemoryRecordStore::new();
        let topic = TopicName::new("orders");

        for id in 1..=5 {
            store.insert(&topic, record(id)).await.expect("insert");
        }

        let fetched = store
            .fetch_after(&topic, Some(RecordId::new(3)), 100)
            .await
            .expect("fetch");

        assert_eq!(fetched.len(), 2);
        assert_eq!(fetched[0].id, RecordId::new(4));
        assert_eq!(fetched[1].id, RecordId::new(5));
    }
}
