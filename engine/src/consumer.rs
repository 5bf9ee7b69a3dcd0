//! The consumer: drives the wake-driven polling loop and delivers messages
//! in strict topic order.

use futures::StreamExt;
use ordlog_core::bus::{LifecycleEvent, SignalBus};
use ordlog_core::record::{Record, RecordId, TopicName};
use ordlog_core::store::RecordStore;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;

/// How often the consumer polls the durable store even without a wake
/// token.
const TICK_INTERVAL: Duration = Duration::from_secs(1);
/// Maximum records fetched per poll step.
const FETCH_BATCH_SIZE: usize = 100;

/// A boxed, `Send`-able error from a user callback.
pub type CallbackError = Box<dyn std::error::Error + Send + Sync>;

/// Invoked for each delivered record, in ascending id order. The cursor has
/// already advanced past this record's id by the time this is called.
pub type OnMessage =
    Arc<dyn Fn(Record) -> Pin<Box<dyn Future<Output = Result<(), CallbackError>> + Send>> + Send + Sync>;

/// Invoked once whenever the topic transitions into the drained state
/// (empty fetch with no poll in flight). Fires again after new activity
/// re-arms it.
pub type OnDrained =
    Arc<dyn Fn() -> Pin<Box<dyn Future<Output = Result<(), CallbackError>> + Send>> + Send + Sync>;

/// Invoked exactly once when `onMessage` fails, with the error that was
/// thrown. The consumer transitions to `Stopped` immediately afterward.
pub type OnCrashed = Arc<
    dyn Fn(CallbackError) -> Pin<Box<dyn Future<Output = Result<(), CallbackError>> + Send>> + Send + Sync,
>;

/// An optional hook invoked on every poll tick (empty or not), useful for
/// tests asserting poll cadence without coupling to internal state.
pub type DebugHandler = Arc<dyn Fn(&str) + Send + Sync>;

/// The consumer's lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    /// Freshly constructed; `start` has not been called.
    New,
    /// `start` is in flight.
    Starting,
    /// `start` completed; ready to stream.
    Started,
    /// `streamMessagesFrom` is active.
    Streaming,
    /// `stop` was called, or streaming ended gracefully.
    Stopped,
    /// `onMessage` threw; transitions to `Stopped` immediately after.
    Crashed,
}

/// Errors a [`Consumer`] can raise.
#[derive(Error, Debug, Clone)]
pub enum ConsumerError {
    /// `start` was called while another `start` was already in flight.
    #[error("consumer for topic '{0}' is already starting")]
    AlreadyStarting(String),

    /// `streamMessagesFrom` was called while already streaming.
    #[error("consumer for topic '{0}' is already streaming")]
    AlreadyStreaming(String),

    /// `streamMessagesFrom` was called before `start` completed.
    #[error("consumer for topic '{0}' has not been started")]
    NotStarted(String),

    /// An operation was attempted after `stop`.
    #[error("consumer for topic '{0}' is stopped")]
    Stopped(String),

    /// Opening the bus subscription failed (e.g. connect timeout).
    #[error("failed to subscribe to bus channel for topic '{0}': {1}")]
    SubscribeFailed(String, String),
}

/// Drives the wake-driven polling loop over a topic and delivers messages
/// through a user callback, maintaining an in-memory cursor.
///
/// Not persisted across restarts — callers needing that persist `last_id`
/// themselves, after their own processing of a delivered record succeeds.
pub struct Consumer {
    topic: TopicName,
    store: Arc<dyn RecordStore>,
    bus: Arc<dyn SignalBus>,
    state: Mutex<ConsumerState>,
    last_id: Mutex<Option<RecordId>>,
    more_messages: AtomicBool,
    polling: AtomicBool,
    drained_announced: AtomicBool,
    stop_tx: watch::Sender<bool>,
    stop_rx: watch::Receiver<bool>,
    debug_handler: Mutex<Option<DebugHandler>>,
}

impl Consumer {
    /// Create a new consumer for `topic`.
    #[must_use]
    pub fn new(topic: TopicName, store: Arc<dyn RecordStore>, bus: Arc<dyn SignalBus>) -> Arc<Self> {
        let (stop_tx, stop_rx) = watch::channel(false);
        Arc::new(Self {
            topic,
            store,
            bus,
            state: Mutex::new(ConsumerState::New),
            last_id: Mutex::new(None),
            more_messages: AtomicBool::new(true),
            polling: AtomicBool::new(false),
            drained_announced: AtomicBool::new(false),
            stop_tx,
            stop_rx,
            debug_handler: Mutex::new(None),
        })
    }

    /// Install a debug handler invoked with a short tag on every poll tick.
    pub fn add_debug_handler(&self, handler: DebugHandler) {
        *self.debug_handler.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = Some(handler);
    }

    fn debug(&self, tag: &str) {
        if let Some(handler) = self
            .debug_handler
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .as_ref()
        {
            handler(tag);
        }
    }

    /// Acquire the record-store and signal-bus sessions this consumer will
    /// use.
    ///
    /// # Errors
    ///
    /// Returns [`ConsumerError::AlreadyStarting`] if another `start` call
    /// is in flight, or [`ConsumerError::Stopped`] if already stopped.
    pub fn start(&self) -> Result<(), ConsumerError> {
        let mut state = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        match *state {
            ConsumerState::New => {
                *state = ConsumerState::Starting;
                *state = ConsumerState::Started;
                tracing::info!(topic = %self.topic, "consumer started");
                Ok(())
            }
            ConsumerState::Starting => Err(ConsumerError::AlreadyStarting(self.topic.to_string())),
            ConsumerState::Stopped | ConsumerState::Crashed => {
                Err(ConsumerError::Stopped(self.topic.to_string()))
            }
            ConsumerState::Started | ConsumerState::Streaming => {
                Err(ConsumerError::AlreadyStarting(self.topic.to_string()))
            }
        }
    }

    /// Begin streaming from `from_id` (exclusive), delivering messages
    /// through `on_message` in ascending id order. Spawns the polling loop
    /// as a background task and returns immediately once the bus
    /// subscription is established.
    ///
    /// # Errors
    ///
    /// Returns [`ConsumerError::NotStarted`], [`ConsumerError::AlreadyStreaming`],
    /// or [`ConsumerError::Stopped`] on a state guard violation, or
    /// [`ConsumerError::SubscribeFailed`] if the bus subscription cannot be
    /// opened.
    pub async fn stream_messages_from(
        self: &Arc<Self>,
        on_message: OnMessage,
        from_id: Option<RecordId>,
        on_drained: OnDrained,
        on_crashed: OnCrashed,
    ) -> Result<(), ConsumerError> {
        {
            let mut state = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            match *state {
                ConsumerState::Started => *state = ConsumerState::Streaming,
                ConsumerState::Streaming => {
                    return Err(ConsumerError::AlreadyStreaming(self.topic.to_string()))
                }
                ConsumerState::Stopped | ConsumerState::Crashed => {
                    return Err(ConsumerError::Stopped(self.topic.to_string()))
                }
                ConsumerState::New | ConsumerState::Starting => {
                    return Err(ConsumerError::NotStarted(self.topic.to_string()))
                }
            }
        }

        *self.last_id.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = from_id;

        let subscription = match self.bus.subscribe(&self.topic.channel()).await {
            Ok(subscription) => subscription,
            Err(e) => {
                let mut state = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                if *state == ConsumerState::Streaming {
                    *state = ConsumerState::Started;
                }
                return Err(ConsumerError::SubscribeFailed(self.topic.to_string(), e.to_string()));
            }
        };

        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.run_loop(subscription.tokens, subscription.lifecycle, on_message, on_drained, on_crashed)
                .await;
        });

        Ok(())
    }

    /// Stop the consumer. Subsequent public calls fail with
    /// [`ConsumerError::Stopped`]; the polling loop ends within one tick.
    pub fn stop(&self) {
        let mut state = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if *state != ConsumerState::Crashed {
            *state = ConsumerState::Stopped;
        }
        let _ = self.stop_tx.send(true);
        tracing::info!(topic = %self.topic, "consumer stopped");
    }

    /// The consumer's current state.
    #[must_use]
    pub fn state(&self) -> ConsumerState {
        *self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    async fn run_loop(
        self: Arc<Self>,
        mut tokens: ordlog_core::bus::TokenStream,
        mut lifecycle: ordlog_core::bus::LifecycleStream,
        on_message: OnMessage,
        on_drained: OnDrained,
        on_crashed: OnCrashed,
    ) {
        let mut ticker = tokio::time::interval(TICK_INTERVAL);
        let mut stop_rx = self.stop_rx.clone();

        // A stream ending is not a stop condition: the ticker keeps polling
        // the store on its own cadence regardless of the bus. Once a
        // stream is exhausted its branch is disabled entirely (rather than
        // `break`ing the loop, or leaving the branch enabled to spin on a
        // `None` that never stops coming back).
        let mut tokens_live = true;
        let mut lifecycle_live = true;

        loop {
            if *stop_rx.borrow() {
                break;
            }

            tokio::select! {
                _ = ticker.tick() => {
                    self.debug("tick");
                    self.on_tick(&on_message, &on_drained, &on_crashed).await;
                    if matches!(self.state(), ConsumerState::Stopped | ConsumerState::Crashed) {
                        break;
                    }
                }
                maybe_token = tokens.next(), if tokens_live => {
                    match maybe_token {
                        Some(()) => self.rearm(),
                        None => tokens_live = false,
                    }
                }
                maybe_event = lifecycle.next(), if lifecycle_live => {
                    match maybe_event {
                        Some(LifecycleEvent::FirstReady | LifecycleEvent::Reconnected { .. }) => {
                            self.rearm();
                        }
                        Some(LifecycleEvent::Reconnecting { attempt, elapsed }) => {
                            tracing::warn!(topic = %self.topic, attempt, elapsed = ?elapsed, "bus reconnecting");
                        }
                        None => lifecycle_live = false,
                    }
                }
                _ = stop_rx.changed() => {
                    if *stop_rx.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::debug!(topic = %self.topic, "polling loop ended");
    }

    /// A wake token or a recovery lifecycle event arrived: re-arm polling
    /// and let the drained callback fire again after the next empty fetch.
    fn rearm(&self) {
        self.more_messages.store(true, Ordering::SeqCst);
        self.drained_announced.store(false, Ordering::SeqCst);
    }

    async fn on_tick(&self, on_message: &OnMessage, on_drained: &OnDrained, on_crashed: &OnCrashed) {
        let more = self.more_messages.load(Ordering::SeqCst);
        let polling = self.polling.load(Ordering::SeqCst);

        if !more && !polling {
            if !self.drained_announced.swap(true, Ordering::SeqCst) {
                self.debug("drained");
                if let Err(err) = on_drained().await {
                    tracing::warn!(topic = %self.topic, error = %err, "onDrained callback failed, swallowing");
                }
            }
            return;
        }

        if self.polling.swap(true, Ordering::SeqCst) {
            return;
        }

        self.poll_step(on_message, on_crashed).await;
        self.polling.store(false, Ordering::SeqCst);
    }

    async fn poll_step(&self, on_message: &OnMessage, on_crashed: &OnCrashed) {
        let cursor = *self.last_id.lock().unwrap_or_else(std::sync::PoisonError::into_inner);

        let records = match self.store.fetch_after(&self.topic, cursor, FETCH_BATCH_SIZE).await {
            Ok(records) => records,
            Err(err) => {
                tracing::warn!(topic = %self.topic, error = %err, "fetch failed, will retry next tick");
                return;
            }
        };

        if records.is_empty() {
            self.more_messages.store(false, Ordering::SeqCst);
            return;
        }

        for record in records {
            *self.last_id.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = Some(record.id);

            if let Err(err) = on_message(record).await {
                self.crash(err, on_crashed).await;
                return;
            }
        }

        // Batches larger than the fetch size drain quickly on the next tick.
        self.more_messages.store(true, Ordering::SeqCst);
    }

    async fn crash(&self, err: CallbackError, on_crashed: &OnCrashed) {
        {
            let mut state = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            *state = ConsumerState::Crashed;
        }

        tracing::error!(topic = %self.topic, error = %err, "onMessage callback crashed");

        if let Err(err) = on_crashed(err).await {
            tracing::warn!(topic = %self.topic, error = %err, "onCrashed callback failed, swallowing");
        }

        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ordlog_core::clock::SystemClock;
    use ordlog_core::record::ShardingKey;
    use ordlog_testing::{InMemoryRecordStore, InMemorySignalBus};
    use tokio::sync::Mutex as AsyncMutex;

    fn consumer(topic: &str, store: Arc<InMemoryRecordStore>, bus: Arc<InMemorySignalBus>) -> Arc<Consumer> {
        Consumer::new(TopicName::new(topic), store, bus)
    }

    #[tokio::test]
    async fn drained_fires_on_empty_topic() {
        let store = Arc::new(InMemoryRecordStore::new());
        let bus = Arc::new(InMemorySignalBus::new());
        let consumer = consumer("orders", store, bus);
        consumer.start().expect("start");

        let drained = Arc::new(AsyncMutex::new(false));
        let drained_clone = Arc::clone(&drained);

        let on_message: OnMessage = Arc::new(|_record| Box::pin(async { Ok(()) }));
        let on_drained: OnDrained = Arc::new(move || {
            let drained = Arc::clone(&drained_clone);
            Box::pin(async move {
                *drained.lock().await = true;
                Ok(())
            })
        });
        let on_crashed: OnCrashed = Arc::new(|_err| Box::pin(async { Ok(()) }));

        consumer
            .stream_messages_from(on_message, None, on_drained, on_crashed)
            .await
            .expect("stream");

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert!(*drained.lock().await);
        consumer.stop();
    }

    #[tokio::test]
    async fn delivers_pushed_messages_in_order() {
        let store = Arc::new(InMemoryRecordStore::new());
        let bus = Arc::new(InMemorySignalBus::new());
        let consumer = consumer("orders", Arc::clone(&store), Arc::clone(&bus));
        consumer.start().expect("start");

        let producer = crate::Producer::new(
            TopicName::new("orders"),
            store.clone() as Arc<dyn RecordStore>,
            bus.clone() as Arc<dyn SignalBus>,
            Arc::new(SystemClock),
        );
        producer.start().expect("start producer");

        let delivered: Arc<AsyncMutex<Vec<RecordId>>> = Arc::new(AsyncMutex::new(Vec::new()));
        let delivered_clone = Arc::clone(&delivered);

        let on_message: OnMessage = Arc::new(move |record| {
            let delivered = Arc::clone(&delivered_clone);
            Box::pin(async move {
                delivered.lock().await.push(record.id);
                Ok(())
            })
        });
        let on_drained: OnDrained = Arc::new(|| Box::pin(async { Ok(()) }));
        let on_crashed: OnCrashed = Arc::new(|_err| Box::pin(async { Ok(()) }));

        consumer
            .stream_messages_from(on_message, None, on_drained, on_crashed)
            .await
            .expect("stream");

        let sharding_key = ShardingKey::new("k").expect("non-empty");
        for n in 1..=10 {
            producer
                .push(serde_json::json!({"n": n}), sharding_key.clone(), None)
                .await
                .expect("push");
        }

        tokio::time::sleep(Duration::from_millis(1300)).await;

        let delivered = delivered.lock().await;
        assert_eq!(delivered.len(), 10);
        assert!(delivered.windows(2).all(|w| w[0] < w[1]));
        consumer.stop();
    }

    #[tokio::test]
    async fn stream_before_start_is_not_started() {
        let store = Arc::new(InMemoryRecordStore::new());
        let bus = Arc::new(InMemorySignalBus::new());
        let consumer = consumer("orders", store, bus);

        let on_message: OnMessage = Arc::new(|_record| Box::pin(async { Ok(()) }));
        let on_drained: OnDrained = Arc::new(|| Box::pin(async { Ok(()) }));
        let on_crashed: OnCrashed = Arc::new(|_err| Box::pin(async { Ok(()) }));

        let result = consumer
            .stream_messages_from(on_message, None, on_drained, on_crashed)
            .await;
        assert!(matches!(result, Err(ConsumerError::NotStarted(_))));
    }
}
