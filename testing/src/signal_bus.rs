//! In-memory [`SignalBus`] double.

use ordlog_core::bus::{LifecycleEvent, SignalBus, SignalBusError, Subscription};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;

/// An in-memory [`SignalBus`] for tests: publishes fan out to every current
/// subscriber on the same channel via a `tokio::sync::broadcast` channel per
/// channel name, behind a cloneable `Arc<RwLock<HashMap<...>>>` handle.
///
/// `subscribe` always succeeds immediately and emits `FirstReady` as its
/// first lifecycle event, then the lifecycle stream stays open
/// indefinitely (mirroring the real bus, whose lifecycle stream only ends
/// when the subscription task itself dies) — there is no simulated outage
/// here.
#[derive(Clone, Debug)]
pub struct InMemorySignalBus {
    channels: Arc<RwLock<HashMap<String, broadcast::Sender<()>>>>,
}

impl Default for InMemorySignalBus {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemorySignalBus {
    /// Create an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self {
            channels: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    fn sender_for(&self, channel: &str) -> broadcast::Sender<()> {
        let mut channels = self.channels.write().unwrap_or_else(std::sync::PoisonError::into_inner);
        channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(1024).0)
            .clone()
    }

    /// Number of tokens published on `channel` so far, according to the
    /// current receiver count of the underlying broadcast sender. Test-only.
    #[must_use]
    pub fn subscriber_count(&self, channel: &str) -> usize {
        let channels = self.channels.read().unwrap_or_else(std::sync::PoisonError::into_inner);
        channels.get(channel).map_or(0, broadcast::Sender::receiver_count)
    }
}

impl SignalBus for InMemorySignalBus {
    fn publish(
        &self,
        channel: &str,
    ) -> Pin<Box<dyn Future<Output = Result<(), SignalBusError>> + Send + '_>> {
        let sender = self.sender_for(channel);
        Box::pin(async move {
            // No subscribers is not an error: publish is fire-and-forget,
            // matching the real bus where a dropped token is silent.
            let _ = sender.send(());
            Ok(())
        })
    }

    fn subscribe(
        &self,
        channel: &str,
    ) -> Pin<Box<dyn Future<Output = Result<Subscription, SignalBusError>> + Send + '_>> {
        let sender = self.sender_for(channel);
        Box::pin(async move {
            let mut rx = sender.subscribe();
            let tokens = Box::pin(async_stream::stream! {
                loop {
                    match rx.recv().await {
                        Ok(()) => yield (),
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }) as _;

            let lifecycle = Box::pin(async_stream::stream! {
                yield LifecycleEvent::FirstReady;
                // The real bus's lifecycle stream only ends when the
                // subscription task dies; mirror that by never completing
                // after the initial event instead of yielding once and
                // dropping the sender.
                std::future::pending::<()>().await;
            }) as _;

            Ok(Subscription { tokens, lifecycle })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn published_tokens_reach_subscriber() {
        let bus = InMemorySignalBus::new();
        let mut subscription = bus.subscribe("TOPIC-orders").await.expect("subscribe");

        bus.publish("TOPIC-orders").await.expect("publish");

        let token = subscription.tokens.next().await;
        assert!(token.is_some());
    }

    #[tokio::test]
    async fn subscribe_emits_first_ready() {
        let bus = InMemorySignalBus::new();
        let mut subscription = bus.subscribe("TOPIC-orders").await.expect("subscribe");

        let event = subscription.lifecycle.next().await;
        assert!(matches!(event, Some(LifecycleEvent::FirstReady)));
    }
}
