//! Signal-bus capability trait: an advisory, best-effort wake channel.
//!
//! The bus is never the source of truth. A token tells a consumer "maybe
//! something changed"; the consumer must always cross-check against a real
//! fetch against the [`crate::store::RecordStore`]. Losing a token must
//! never lose a message — only add latency.
//!
//! # Dyn Compatibility
//!
//! As with [`crate::store::RecordStore`], this trait returns
//! `Pin<Box<dyn Future<...>> + Send + '_>` rather than `async fn` so it can
//! be used as `Arc<dyn SignalBus>`.

use futures::Stream;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during signal-bus operations.
#[derive(Error, Debug, Clone)]
pub enum SignalBusError {
    /// The initial connection attempt exceeded its deadline.
    #[error("bus connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// A publish attempt failed. Returning this error guarantees
    /// non-delivery for that specific call; it does not imply the bus is
    /// down for future calls.
    #[error("publish failed on channel '{channel}': {reason}")]
    PublishFailed {
        /// The channel the publish targeted.
        channel: String,
        /// The underlying reason.
        reason: String,
    },

    /// A subscribe attempt failed to even start.
    #[error("subscribe failed on channel '{channel}': {reason}")]
    SubscribeFailed {
        /// The channel the subscription targeted.
        channel: String,
        /// The underlying reason.
        reason: String,
    },
}

/// Connection lifecycle events surfaced by a [`SignalBus`] subscription.
///
/// The consumer treats `FirstReady` and `Reconnected` as implicit wake
/// tokens, since a token published while the bus was disconnected is
/// necessarily lost.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LifecycleEvent {
    /// The subscription session is ready for the first time.
    FirstReady,
    /// A reconnect attempt is in progress.
    Reconnecting {
        /// The 1-based attempt number for the current outage.
        attempt: u32,
        /// How long the connection has been down.
        elapsed: Duration,
    },
    /// The subscription session has been restored after an outage.
    Reconnected {
        /// How long the connection was down.
        downtime: Duration,
    },
}

/// A stream of wake tokens received on a subscribed channel.
///
/// The engine does not parse token payloads; any token's mere presence
/// triggers a poll.
pub type TokenStream = Pin<Box<dyn Stream<Item = ()> + Send>>;

/// A stream of connection lifecycle events for a subscription.
pub type LifecycleStream = Pin<Box<dyn Stream<Item = LifecycleEvent> + Send>>;

/// A live subscription session: a token stream paired with a lifecycle
/// stream, both driven by the same underlying reconnect loop.
pub struct Subscription {
    /// Wake tokens received on the channel.
    pub tokens: TokenStream,
    /// Connection lifecycle events for this subscription.
    pub lifecycle: LifecycleStream,
}

/// Capability-level interface to an ephemeral, best-effort pub/sub bus.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync` for concurrent use by multiple
/// producers and consumers.
pub trait SignalBus: Send + Sync {
    /// Publish a wake token on `channel`. Fire-and-forget: returning
    /// success does not guarantee delivery; returning failure guarantees
    /// non-delivery for this call.
    ///
    /// # Errors
    ///
    /// Returns [`SignalBusError::PublishFailed`] if the publish attempt
    /// itself could not be made (e.g. no connection available).
    fn publish(
        &self,
        channel: &str,
    ) -> Pin<Box<dyn Future<Output = Result<(), SignalBusError>> + Send + '_>>;

    /// Open a long-lived, auto-resubscribing subscription session on
    /// `channel`.
    ///
    /// Connection policy: exponential-style backoff capped at 5 seconds,
    /// retried forever once the initial connection succeeds. The initial
    /// connection has a bounded deadline; exceeding it fails this call.
    ///
    /// # Errors
    ///
    /// Returns [`SignalBusError::ConnectTimeout`] if the initial
    /// connection deadline elapses, or
    /// [`SignalBusError::SubscribeFailed`] if the subscribe call itself is
    /// rejected.
    fn subscribe(
        &self,
        channel: &str,
    ) -> Pin<Box<dyn Future<Output = Result<Subscription, SignalBusError>> + Send + '_>>;
}
