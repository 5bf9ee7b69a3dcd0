//! The producer: appends messages to a topic with strict ordering.

use ordlog_core::bus::SignalBus;
use ordlog_core::clock::Clock;
use ordlog_core::record::{LogCompactId, Record, RecordId, ShardingKey, TopicName};
use ordlog_core::store::RecordStore;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// How long to wait before retrying a failed wake publish.
const WAKE_RETRY_INTERVAL: Duration = Duration::from_secs(10);

const STATE_NEW: u8 = 0;
const STATE_STARTING: u8 = 1;
const STATE_STARTED: u8 = 2;
const STATE_STOPPED: u8 = 3;

/// Errors a [`Producer`] can raise.
#[derive(Error, Debug, Clone)]
pub enum ProducerError {
    /// `start` was called while another `start` was already in flight.
    #[error("producer for topic '{0}' is already starting")]
    AlreadyStarting(String),

    /// An operation was attempted after `stop`, or before `start`.
    #[error("producer for topic '{0}' is stopped")]
    Stopped(String),

    /// The id allocation call failed. The counter did not advance, so the
    /// id is not burned; the caller may simply retry the push.
    #[error("failed to allocate id for topic '{topic}': {reason}")]
    AllocFailed {
        /// The topic the push targeted.
        topic: String,
        /// The underlying reason.
        reason: String,
    },

    /// The insert was not acknowledged by the store. The allocated id is
    /// burned — no retry reuses it, leaving an acceptable gap.
    #[error("insert not acknowledged for topic '{topic}' id {id}: {reason}")]
    InsertNotAcknowledged {
        /// The topic the push targeted.
        topic: String,
        /// The id that was burned.
        id: RecordId,
        /// The underlying reason.
        reason: String,
    },
}

/// Appends messages to a topic with strict, linearized ordering.
///
/// Two-step write (allocate, then insert): inserts may land at the store
/// out of wall-clock order under concurrency, but the counter read order
/// is the only thing that defines topic order — sorting fetches by `id`
/// ascending is what makes this correct on the read side.
pub struct Producer {
    topic: TopicName,
    store: Arc<dyn RecordStore>,
    bus: Arc<dyn SignalBus>,
    clock: Arc<dyn Clock>,
    state: AtomicU8,
}

impl Producer {
    /// Create a new producer for `topic`. Does not connect; call
    /// [`Producer::start`] before pushing.
    #[must_use]
    pub fn new(
        topic: TopicName,
        store: Arc<dyn RecordStore>,
        bus: Arc<dyn SignalBus>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            topic,
            store,
            bus,
            clock,
            state: AtomicU8::new(STATE_NEW),
        }
    }

    /// Acquire the record-store and signal-bus sessions this producer will
    /// use.
    ///
    /// # Errors
    ///
    /// Returns [`ProducerError::AlreadyStarting`] if another `start` call
    /// is already in flight, or [`ProducerError::Stopped`] if this
    /// producer has already been stopped.
    pub fn start(&self) -> Result<(), ProducerError> {
        match self
            .state
            .compare_exchange(STATE_NEW, STATE_STARTING, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(_) => {
                self.state.store(STATE_STARTED, Ordering::SeqCst);
                tracing::info!(topic = %self.topic, "producer started");
                Ok(())
            }
            Err(STATE_STARTING) => Err(ProducerError::AlreadyStarting(self.topic.to_string())),
            Err(STATE_STOPPED) => Err(ProducerError::Stopped(self.topic.to_string())),
            Err(_) => Err(ProducerError::AlreadyStarting(self.topic.to_string())),
        }
    }

    /// Append a message to the topic.
    ///
    /// 1. Allocate the next id.
    /// 2. Build the record with `created_at` from the clock.
    /// 3. Insert it durably. If not acknowledged, the id is burned and this
    ///    returns [`ProducerError::InsertNotAcknowledged`].
    /// 4. Fire-and-forget a wake publish. Publish failures are never
    ///    surfaced to the caller; they are retried on a 10-second interval
    ///    forever in the background.
    ///
    /// # Errors
    ///
    /// Returns [`ProducerError::Stopped`] if the producer is not started,
    /// [`ProducerError::AllocFailed`] if id allocation fails, or
    /// [`ProducerError::InsertNotAcknowledged`] if the insert fails.
    pub async fn push(
        &self,
        payload: serde_json::Value,
        sharding_key: ShardingKey,
        log_compact_id: Option<LogCompactId>,
    ) -> Result<RecordId, ProducerError> {
        if self.state.load(Ordering::SeqCst) != STATE_STARTED {
            return Err(ProducerError::Stopped(self.topic.to_string()));
        }

        let id = self
            .store
            .allocate_next_id(&self.topic)
            .await
            .map_err(|e| ProducerError::AllocFailed {
                topic: self.topic.to_string(),
                reason: e.to_string(),
            })?;

        let record = Record {
            id,
            created_at: self.clock.now(),
            sharding_key,
            log_compact_id,
            payload,
        };

        if let Err(e) = self.store.insert(&self.topic, record).await {
            return Err(ProducerError::InsertNotAcknowledged {
                topic: self.topic.to_string(),
                id,
                reason: e.to_string(),
            });
        }

        tracing::debug!(topic = %self.topic, id = %id, "pushed record");
        self.spawn_wake_publish();
        Ok(id)
    }

    /// Close the producer's sessions. Subsequent calls to `push` fail with
    /// [`ProducerError::Stopped`].
    pub fn stop(&self) {
        self.state.store(STATE_STOPPED, Ordering::SeqCst);
        tracing::info!(topic = %self.topic, "producer stopped");
    }

    fn spawn_wake_publish(&self) {
        let bus = self.bus.clone();
        let channel = self.topic.channel();
        tokio::spawn(async move {
            loop {
                match bus.publish(&channel).await {
                    Ok(()) => return,
                    Err(e) => {
                        tracing::warn!(
                            channel = %channel,
                            error = %e,
                            "wake publish failed, retrying in 10s"
                        );
                        tokio::time::sleep(WAKE_RETRY_INTERVAL).await;
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ordlog_core::clock::SystemClock;
    use ordlog_testing::{InMemoryRecordStore, InMemorySignalBus};

    fn producer(topic: &str) -> Producer {
        Producer::new(
            TopicName::new(topic),
            Arc::new(InMemoryRecordStore::new()),
            Arc::new(InMemorySignalBus::new()),
            Arc::new(SystemClock),
        )
    }

    #[tokio::test]
    async fn push_before_start_fails_stopped() {
        let producer = producer("orders");
        let sharding_key = ShardingKey::new("k").expect("non-empty");
        let result = producer.push(serde_json::json!({}), sharding_key, None).await;
        assert!(matches!(result, Err(ProducerError::Stopped(_))));
    }

    #[tokio::test]
    async fn pushed_ids_increase_monotonically() {
        let producer = producer("orders");
        producer.start().expect("start");
        let sharding_key = ShardingKey::new("k").expect("non-empty");

        let first = producer
            .push(serde_json::json!({"n": 1}), sharding_key.clone(), None)
            .await
            .expect("push");
        let second = producer
            .push(serde_json::json!({"n": 2}), sharding_key, None)
            .await
            .expect("push");

        assert!(first < second);
    }

    #[tokio::test]
    async fn push_after_stop_fails_stopped() {
        let producer = producer("orders");
        producer.start().expect("start");
        producer.stop();

        let sharding_key = ShardingKey::new("k").expect("non-empty");
        let result = producer.push(serde_json::json!({}), sharding_key, None).await;
        assert!(matches!(result, Err(ProducerError::Stopped(_))));
    }

    #[tokio::test]
    async fn concurrent_producers_yield_a_strict_ascending_permutation() {
        let store: Arc<dyn RecordStore> = Arc::new(InMemoryRecordStore::new());
        let bus: Arc<dyn SignalBus> = Arc::new(InMemorySignalBus::new());
        let topic = TopicName::new("orders");

        let make_producer = || {
            Producer::new(topic.clone(), store.clone(), bus.clone(), Arc::new(SystemClock))
        };

        let first = Arc::new(make_producer());
        let second = Arc::new(make_producer());
        first.start().expect("start");
        second.start().expect("start");

        let sharding_key = ShardingKey::new("k").expect("non-empty");

        let run = |producer: Arc<Producer>, sharding_key: ShardingKey| {
            tokio::spawn(async move {
                let mut ids = Vec::with_capacity(100);
                for n in 0..100 {
                    let id = producer
                        .push(serde_json::json!({"n": n}), sharding_key.clone(), None)
                        .await
                        .expect("push");
                    ids.push(id);
                }
                ids
            })
        };

        let (a, b) = tokio::join!(run(first, sharding_key.clone()), run(second, sharding_key));
        let mut all_ids: Vec<u64> = a.expect("join").into_iter().chain(b.expect("join")).map(RecordId::value).collect();
        all_ids.sort_unstable();

        let expected: Vec<u64> = (1..=200).collect();
        assert_eq!(all_ids, expected);
    }

    #[tokio::test]
    async fn second_concurrent_start_is_already_starting_or_ok() {
        let producer = producer("orders");
        let first = producer.start();
        let second = producer.start();
        assert!(first.is_ok());
        assert!(matches!(second, Err(ProducerError::AlreadyStarting(_))));
    }
}
