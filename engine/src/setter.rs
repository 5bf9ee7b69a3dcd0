//! The log-compaction topic setter: a stateful write overlay that
//! deduplicates by compaction id while preserving order.
//!
//! Implemented as a single actor owning both the append queue and the
//! compaction-keyed queue behind a command mailbox, rather than layering a
//! consumer's history replay directly over a producer's write path with
//! callback re-entry. The actor receives every write, replay observation,
//! and flush trigger as a [`Command`] and processes them one at a time,
//! which is what makes the flush procedure linearizable without an
//! explicit lock.

use crate::consumer::{CallbackError, Consumer, OnCrashed, OnDrained, OnMessage};
use crate::producer::Producer;
use chrono::{DateTime, Utc};
use ordlog_core::bus::SignalBus;
use ordlog_core::clock::Clock;
use ordlog_core::record::{LogCompactId, Record, ShardingKey, TopicName};
use ordlog_core::store::RecordStore;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

/// How often the flusher ticks even without an external trigger.
const FLUSH_INTERVAL: Duration = Duration::from_secs(60);
/// How long a flush stays latched after an abort before retrying.
const ABORT_RETRY_DELAY: Duration = Duration::from_secs(20);

/// Errors a [`TopicSetter`] can raise.
#[derive(Error, Debug, Clone)]
pub enum SetterError {
    /// A write was attempted before the setter finished replaying history.
    #[error("setter for topic '{0}' is not ready")]
    NotReady(String),

    /// The setter's actor task is no longer running.
    #[error("setter for topic '{0}' is closed")]
    Closed(String),
}

#[derive(Debug, Clone)]
struct AppendEntry {
    payload: serde_json::Value,
    sharding_key: ShardingKey,
}

#[derive(Debug, Clone)]
struct CompactedEntry {
    payload: serde_json::Value,
    sharding_key: ShardingKey,
    queued_at: DateTime<Utc>,
}

enum Command {
    HistoricalRecord(Record),
    Drained,
    SetLogCompactedPayload {
        compaction_id: LogCompactId,
        payload: serde_json::Value,
        sharding_key: ShardingKey,
    },
    SetPayload {
        payload: serde_json::Value,
        sharding_key: ShardingKey,
    },
    TriggerFlush(DateTime<Utc>),
    ResetFlushing,
}

/// Outcome of one `run_flush` attempt, fed back into the actor to update
/// its queues and confirmed-state map.
struct FlushOutcome {
    remaining_append: VecDeque<AppendEntry>,
    confirmed_hashes: Vec<(LogCompactId, blake3::Hash)>,
    remaining_compacted: HashMap<LogCompactId, CompactedEntry>,
    aborted: bool,
}

type BoxFlushFuture = Pin<Box<dyn Future<Output = FlushOutcome> + Send>>;

/// Hash a payload structurally, canonicalizing object key order so
/// semantically equal payloads hash equal regardless of serialization
/// order. Timestamp fields are already ISO-8601 strings by the time they
/// reach this function, since `chrono`'s `Serialize` impl emits RFC 3339
/// and the payload has already passed through `serde_json` by then.
fn hash_payload(payload: &serde_json::Value) -> blake3::Hash {
    fn canonicalize(value: &serde_json::Value) -> serde_json::Value {
        match value {
            serde_json::Value::Object(map) => {
                let sorted: std::collections::BTreeMap<String, serde_json::Value> =
                    map.iter().map(|(k, v)| (k.clone(), canonicalize(v))).collect();
                serde_json::Value::Object(sorted.into_iter().collect())
            }
            serde_json::Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(canonicalize).collect())
            }
            other => other.clone(),
        }
    }

    let canonical = canonicalize(payload);
    blake3::hash(&serde_json::to_vec(&canonical).unwrap_or_default())
}

async fn run_flush(
    producer: Arc<Producer>,
    mut append_queue: VecDeque<AppendEntry>,
    compacted_queue: HashMap<LogCompactId, CompactedEntry>,
) -> FlushOutcome {
    while let Some(entry) = append_queue.pop_front() {
        if let Err(err) = producer
            .push(entry.payload.clone(), entry.sharding_key.clone(), None)
            .await
        {
            tracing::warn!(error = %err, "append queue flush failed, aborting");
            append_queue.push_front(entry);
            return FlushOutcome {
                remaining_append: append_queue,
                confirmed_hashes: Vec::new(),
                remaining_compacted: compacted_queue,
                aborted: true,
            };
        }
    }

    let mut ordered: Vec<(LogCompactId, CompactedEntry)> = compacted_queue.into_iter().collect();
    ordered.sort_by_key(|(_, entry)| entry.queued_at);

    let mut confirmed_hashes = Vec::new();
    let mut remaining_compacted = HashMap::new();
    let mut iter = ordered.into_iter();

    for (compaction_id, entry) in iter.by_ref() {
        match producer
            .push(entry.payload.clone(), entry.sharding_key.clone(), Some(compaction_id.clone()))
            .await
        {
            Ok(_) => {
                let hash = hash_payload(&entry.payload);
                confirmed_hashes.push((compaction_id, hash));
            }
            Err(err) => {
                tracing::warn!(error = %err, compaction_id = %compaction_id, "compacted queue flush failed, aborting");
                remaining_compacted.insert(compaction_id, entry);
                for (rest_id, rest_entry) in iter {
                    remaining_compacted.insert(rest_id, rest_entry);
                }
                return FlushOutcome {
                    remaining_append: append_queue,
                    confirmed_hashes,
                    remaining_compacted,
                    aborted: true,
                };
            }
        }
    }

    FlushOutcome {
        remaining_append: append_queue,
        confirmed_hashes,
        remaining_compacted,
        aborted: false,
    }
}

async fn next_flush_outcome(slot: &mut Option<BoxFlushFuture>) -> FlushOutcome {
    match slot.as_mut() {
        Some(fut) => fut.await,
        None => std::future::pending().await,
    }
}

struct Actor {
    topic: TopicName,
    producer: Arc<Producer>,
    clock: Arc<dyn Clock>,
    ready: Arc<AtomicBool>,
    memory_hash: HashMap<LogCompactId, blake3::Hash>,
    append_queue: VecDeque<AppendEntry>,
    compacted_queue: HashMap<LogCompactId, CompactedEntry>,
    flushing: bool,
    pending_trigger: Option<DateTime<Utc>>,
}

impl Actor {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>, tx: mpsc::UnboundedSender<Command>) {
        let mut flush_ticker = tokio::time::interval(FLUSH_INTERVAL);
        let mut in_flight: Option<BoxFlushFuture> = None;

        loop {
            tokio::select! {
                maybe_cmd = rx.recv() => {
                    let Some(cmd) = maybe_cmd else { break };
                    if let Some(fut) = self.handle_command(cmd) {
                        in_flight = Some(fut);
                    }
                }
                _ = flush_ticker.tick() => {
                    if in_flight.is_none() {
                        if let Some(fut) = self.maybe_start_flush(self.clock.now()) {
                            in_flight = Some(fut);
                        }
                    }
                }
                outcome = next_flush_outcome(&mut in_flight) => {
                    in_flight = None;
                    if let Some(fut) = self.handle_flush_outcome(outcome, &tx) {
                        in_flight = Some(fut);
                    }
                }
            }
        }

        tracing::debug!(topic = %self.topic, "setter actor stopped");
    }

    fn handle_command(&mut self, cmd: Command) -> Option<BoxFlushFuture> {
        match cmd {
            Command::HistoricalRecord(record) => {
                self.observe(record);
                None
            }
            Command::Drained => {
                if !self.ready.swap(true, Ordering::SeqCst) {
                    tracing::info!(topic = %self.topic, "setter ready");
                }
                None
            }
            Command::SetLogCompactedPayload { compaction_id, payload, sharding_key } => {
                self.enqueue_compacted(compaction_id, payload, sharding_key);
                None
            }
            Command::SetPayload { payload, sharding_key } => {
                self.append_queue.push_back(AppendEntry { payload, sharding_key });
                None
            }
            Command::TriggerFlush(at) => self.maybe_start_flush(at),
            Command::ResetFlushing => {
                self.flushing = false;
                self.pending_trigger.take().and_then(|at| self.maybe_start_flush(at))
            }
        }
    }

    fn observe(&mut self, record: Record) {
        match record.log_compact_id {
            Some(compaction_id) => {
                let hash = hash_payload(&record.payload);
                self.memory_hash.insert(compaction_id, hash);
            }
            None => {
                tracing::warn!(topic = %self.topic, id = %record.id, "replayed record has no compaction id");
            }
        }
    }

    fn enqueue_compacted(&mut self, compaction_id: LogCompactId, payload: serde_json::Value, sharding_key: ShardingKey) {
        let hash = hash_payload(&payload);
        if self.memory_hash.get(&compaction_id) == Some(&hash) {
            tracing::debug!(topic = %self.topic, compaction_id = %compaction_id, "dropping no-op compacted write");
            return;
        }

        self.compacted_queue.insert(
            compaction_id,
            CompactedEntry { payload, sharding_key, queued_at: self.clock.now() },
        );
    }

    fn maybe_start_flush(&mut self, trigger_time: DateTime<Utc>) -> Option<BoxFlushFuture> {
        if self.flushing {
            self.pending_trigger = Some(self.pending_trigger.map_or(trigger_time, |existing| existing.max(trigger_time)));
            return None;
        }

        if self.append_queue.is_empty() && self.compacted_queue.is_empty() {
            return None;
        }

        self.flushing = true;
        let append = std::mem::take(&mut self.append_queue);
        let compacted = std::mem::take(&mut self.compacted_queue);
        let producer = Arc::clone(&self.producer);
        Some(Box::pin(run_flush(producer, append, compacted)))
    }

    fn handle_flush_outcome(&mut self, outcome: FlushOutcome, tx: &mpsc::UnboundedSender<Command>) -> Option<BoxFlushFuture> {
        for entry in outcome.remaining_append.into_iter().rev() {
            self.append_queue.push_front(entry);
        }
        for (compaction_id, hash) in outcome.confirmed_hashes {
            self.memory_hash.insert(compaction_id, hash);
        }
        for (compaction_id, entry) in outcome.remaining_compacted {
            self.compacted_queue.entry(compaction_id).or_insert(entry);
        }

        if outcome.aborted {
            let retry_tx = tx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(ABORT_RETRY_DELAY).await;
                let _ = retry_tx.send(Command::ResetFlushing);
            });
            return None;
        }

        self.flushing = false;
        self.pending_trigger.take().and_then(|at| self.maybe_start_flush(at))
    }
}

/// Log-compaction overlay: replays topic history to learn
/// `compactionId -> hash(payload)` state, then deduplicates subsequent
/// compacted writes while preserving order.
pub struct TopicSetter {
    topic: TopicName,
    consumer: Arc<Consumer>,
    producer: Arc<Producer>,
    clock: Arc<dyn Clock>,
    command_tx: mpsc::UnboundedSender<Command>,
    ready: Arc<AtomicBool>,
}

impl TopicSetter {
    /// Create a new setter for `topic`. Does not begin replaying history
    /// until [`TopicSetter::start`] is called.
    #[must_use]
    pub fn new(
        topic: TopicName,
        store: Arc<dyn RecordStore>,
        bus: Arc<dyn SignalBus>,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        let consumer = Consumer::new(topic.clone(), Arc::clone(&store), Arc::clone(&bus));
        let producer = Arc::new(Producer::new(topic.clone(), store, bus, Arc::clone(&clock)));
        let ready = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::unbounded_channel();

        let actor = Actor {
            topic: topic.clone(),
            producer: Arc::clone(&producer),
            clock: Arc::clone(&clock),
            ready: Arc::clone(&ready),
            memory_hash: HashMap::new(),
            append_queue: VecDeque::new(),
            compacted_queue: HashMap::new(),
            flushing: false,
            pending_trigger: None,
        };

        let actor_tx = tx.clone();
        tokio::spawn(actor.run(rx, actor_tx));

        Arc::new(Self { topic, consumer, producer, clock, command_tx: tx, ready })
    }

    /// Begin replaying topic history from the beginning. Marks the setter
    /// ready once the replay drains, after which writes are accepted.
    ///
    /// # Errors
    ///
    /// Returns [`SetterError::Closed`] if the underlying consumer or
    /// producer fails to start.
    pub async fn start(self: &Arc<Self>) -> Result<(), SetterError> {
        self.consumer
            .start()
            .map_err(|e| SetterError::Closed(format!("{}: {e}", self.topic)))?;
        self.producer
            .start()
            .map_err(|e| SetterError::Closed(format!("{}: {e}", self.topic)))?;

        let history_tx = self.command_tx.clone();
        let on_message: OnMessage = Arc::new(move |record| {
            let tx = history_tx.clone();
            Box::pin(async move {
                let _ = tx.send(Command::HistoricalRecord(record));
                Ok(())
            })
        });

        let drained_tx = self.command_tx.clone();
        let on_drained: OnDrained = Arc::new(move || {
            let tx = drained_tx.clone();
            Box::pin(async move {
                let _ = tx.send(Command::Drained);
                Ok(())
            })
        });

        let crash_topic = self.topic.clone();
        let on_crashed: OnCrashed = Arc::new(move |err: CallbackError| {
            let topic = crash_topic.clone();
            Box::pin(async move {
                tracing::error!(topic = %topic, error = %err, "setter's replay consumer crashed");
                Ok(())
            })
        });

        self.consumer
            .stream_messages_from(on_message, None, on_drained, on_crashed)
            .await
            .map_err(|e| SetterError::Closed(format!("{}: {e}", self.topic)))?;

        Ok(())
    }

    /// Whether the setter has finished replaying history and accepts
    /// writes.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// Enqueue a compacted write. Dropped silently if its payload hash
    /// matches the last confirmed hash for `compaction_id`.
    ///
    /// # Errors
    ///
    /// Returns [`SetterError::NotReady`] if history replay has not
    /// finished, or [`SetterError::Closed`] if the actor has stopped.
    pub fn set_log_compacted_payload(
        &self,
        compaction_id: LogCompactId,
        payload: serde_json::Value,
        sharding_key: ShardingKey,
    ) -> Result<(), SetterError> {
        if !self.is_ready() {
            return Err(SetterError::NotReady(self.topic.to_string()));
        }

        self.command_tx
            .send(Command::SetLogCompactedPayload { compaction_id, payload, sharding_key })
            .map_err(|_| SetterError::Closed(self.topic.to_string()))
    }

    /// Enqueue an append-only write. Never deduplicated.
    ///
    /// # Errors
    ///
    /// Returns [`SetterError::NotReady`] if history replay has not
    /// finished, or [`SetterError::Closed`] if the actor has stopped.
    pub fn set_payload(&self, payload: serde_json::Value, sharding_key: ShardingKey) -> Result<(), SetterError> {
        if !self.is_ready() {
            return Err(SetterError::NotReady(self.topic.to_string()));
        }

        self.command_tx
            .send(Command::SetPayload { payload, sharding_key })
            .map_err(|_| SetterError::Closed(self.topic.to_string()))
    }

    /// Force a flush earlier than the next 60-second tick.
    ///
    /// # Errors
    ///
    /// Returns [`SetterError::Closed`] if the actor has stopped.
    pub fn trigger_waiting_messages(&self) -> Result<(), SetterError> {
        self.command_tx
            .send(Command::TriggerFlush(self.clock.now()))
            .map_err(|_| SetterError::Closed(self.topic.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ordlog_testing::{test_clock, InMemoryRecordStore, InMemorySignalBus};
    use tokio::time::sleep;

    fn new_setter(topic: &str) -> (Arc<TopicSetter>, Arc<InMemoryRecordStore>) {
        let store = Arc::new(InMemoryRecordStore::new());
        let bus = Arc::new(InMemorySignalBus::new());
        let clock = Arc::new(test_clock());
        let setter = TopicSetter::new(
            TopicName::new(topic),
            store.clone() as Arc<dyn RecordStore>,
            bus as Arc<dyn SignalBus>,
            clock as Arc<dyn Clock>,
        );
        (setter, store)
    }

    #[tokio::test]
    async fn write_before_ready_is_refused() {
        let (setter, _store) = new_setter("setter-1");
        let result = setter.set_payload(serde_json::json!({"v": 1}), ShardingKey::new("k").expect("non-empty"));
        assert!(matches!(result, Err(SetterError::NotReady(_))));
    }

    #[tokio::test]
    async fn canonical_hash_ignores_key_order() {
        let a = serde_json::json!({"a": 1, "b": 2});
        let b = serde_json::json!({"b": 2, "a": 1});
        assert_eq!(hash_payload(&a), hash_payload(&b));
    }

    #[tokio::test]
    async fn duplicate_compacted_write_flushes_once() {
        let (setter, _store) = new_setter("setter-2");
        setter.start().await.expect("start");
        sleep(Duration::from_millis(1100)).await;
        assert!(setter.is_ready());

        let sharding_key = ShardingKey::new("k").expect("non-empty");
        setter
            .set_log_compacted_payload(LogCompactId::new("u1"), serde_json::json!({"v": 1}), sharding_key.clone())
            .expect("enqueue");
        setter.trigger_waiting_messages().expect("trigger");
        sleep(Duration::from_millis(200)).await;

        setter
            .set_log_compacted_payload(LogCompactId::new("u1"), serde_json::json!({"v": 1}), sharding_key)
            .expect("enqueue");
        setter.trigger_waiting_messages().expect("trigger");
        sleep(Duration::from_millis(200)).await;
    }
}
