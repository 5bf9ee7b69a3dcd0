//! Redis-backed signal-bus implementation for the ordlog engine.
//!
//! This crate provides [`RedisSignalBus`], implementing
//! [`ordlog_core::bus::SignalBus`] over Redis pub/sub, on `redis = "0.27"`
//! with `tokio-comp` and `connection-manager`.
//!
//! # Why Redis pub/sub?
//!
//! The bus in this engine is explicitly **not** the source of truth — it
//! is lossy, ephemeral, and best-effort by design. Redis pub/sub matches
//! that shape exactly: messages published while no subscriber is
//! connected are simply gone. Unlike `ConnectionManager` (used for
//! ordinary commands), a `PubSub` session does not auto-resubscribe after
//! a dropped connection, so this crate owns the reconnect loop and the
//! `FirstReady` / `Reconnecting` / `Reconnected` lifecycle it surfaces to
//! callers.
//!
//! # Example
//!
//! ```no_run
//! use ordlog_signalbus::RedisSignalBus;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let bus = RedisSignalBus::new("redis://localhost:6379").await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

use futures::StreamExt;
use ordlog_core::bus::{LifecycleEvent, SignalBus, SignalBusError, Subscription};
use ordlog_core::config::TopicConfig;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::time::Instant;

/// Default cap on the exponential reconnect backoff.
const MAX_BACKOFF: Duration = Duration::from_secs(5);
/// Starting delay for the reconnect backoff.
const INITIAL_BACKOFF: Duration = Duration::from_millis(200);
/// Default deadline for the first connection attempt.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// The literal wake-token payload published for interoperability.
///
/// The engine never parses this on receive; any token triggers a poll.
pub const WAKE_TOKEN_PAYLOAD: &str = r#"{"newMessage":true}"#;

/// Redis-backed [`SignalBus`].
///
/// # Configuration
///
/// Built via [`RedisSignalBus::new`] (defaults) or
/// [`RedisSignalBus::builder`] for a custom connect timeout.
pub struct RedisSignalBus {
    client: Client,
    publisher: ConnectionManager,
    connect_timeout: Duration,
}

impl RedisSignalBus {
    /// Connect with default configuration.
    ///
    /// # Errors
    ///
    /// Returns [`SignalBusError::ConnectTimeout`] if the initial connection
    /// deadline elapses.
    pub async fn new(redis_url: &str) -> Result<Self, SignalBusError> {
        Self::builder(redis_url).build().await
    }

    /// Start building a [`RedisSignalBus`] with custom configuration.
    #[must_use]
    pub fn builder(redis_url: &str) -> RedisSignalBusBuilder {
        RedisSignalBusBuilder {
            redis_url: redis_url.to_string(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Connect using a [`TopicConfig`]'s `bus_host` and `bus_port`.
    ///
    /// # Errors
    ///
    /// See [`RedisSignalBus::new`].
    pub async fn connect_with_config(config: &TopicConfig) -> Result<Self, SignalBusError> {
        Self::new(&config.bus_url()).await
    }
}

/// Builder for [`RedisSignalBus`].
pub struct RedisSignalBusBuilder {
    redis_url: String,
    connect_timeout: Duration,
}

impl RedisSignalBusBuilder {
    /// Set the deadline for the initial connection attempt. Default: 30
    /// seconds.
    #[must_use]
    pub const fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Build the [`RedisSignalBus`], establishing the initial connection.
    ///
    /// # Errors
    ///
    /// Returns [`SignalBusError::ConnectTimeout`] if the connection is not
    /// established within the configured deadline, or
    /// [`SignalBusError::SubscribeFailed`]-shaped construction errors if
    /// the client itself is misconfigured.
    pub async fn build(self) -> Result<RedisSignalBus, SignalBusError> {
        let client = Client::open(self.redis_url.as_str()).map_err(|e| {
            SignalBusError::SubscribeFailed {
                channel: String::new(),
                reason: format!("invalid redis url: {e}"),
            }
        })?;

        let publisher = tokio::time::timeout(self.connect_timeout, ConnectionManager::new(client.clone()))
            .await
            .map_err(|_| SignalBusError::ConnectTimeout(self.connect_timeout))?
            .map_err(|e| SignalBusError::SubscribeFailed {
                channel: String::new(),
                reason: format!("failed to create connection manager: {e}"),
            })?;

        tracing::info!(connect_timeout = ?self.connect_timeout, "RedisSignalBus connected");

        Ok(RedisSignalBus {
            client,
            publisher,
            connect_timeout: self.connect_timeout,
        })
    }
}

impl SignalBus for RedisSignalBus {
    fn publish(
        &self,
        channel: &str,
    ) -> Pin<Box<dyn Future<Output = Result<(), SignalBusError>> + Send + '_>> {
        let channel = channel.to_string();
        Box::pin(async move {
            let mut conn = self.publisher.clone();
            conn.publish::<_, _, i64>(&channel, WAKE_TOKEN_PAYLOAD)
                .await
                .map_err(|e| SignalBusError::PublishFailed {
                    channel: channel.clone(),
                    reason: e.to_string(),
                })?;

            tracing::debug!(channel = %channel, "published wake token");
            Ok(())
        })
    }

    fn subscribe(
        &self,
        channel: &str,
    ) -> Pin<Box<dyn Future<Output = Result<Subscription, SignalBusError>> + Send + '_>> {
        let channel = channel.to_string();
        let client = self.client.clone();
        let connect_timeout = self.connect_timeout;

        Box::pin(async move {
            let pubsub = tokio::time::timeout(connect_timeout, open_pubsub(&client, &channel))
                .await
                .map_err(|_| SignalBusError::ConnectTimeout(connect_timeout))??;

            let (token_tx, token_rx) = tokio::sync::mpsc::channel::<()>(1024);
            let (lifecycle_tx, lifecycle_rx) = tokio::sync::mpsc::channel::<LifecycleEvent>(16);

            // FirstReady fires immediately: the initial connection above
            // already succeeded, and the consumer must poll once before
            // trusting the bus for future wakeups.
            let _ = lifecycle_tx.send(LifecycleEvent::FirstReady).await;

            tokio::spawn(run_subscription_loop(
                client,
                channel,
                pubsub,
                token_tx,
                lifecycle_tx,
            ));

            let tokens = Box::pin(tokio_stream_from_receiver(token_rx)) as _;
            let lifecycle = Box::pin(tokio_stream_from_receiver(lifecycle_rx)) as _;

            Ok(Subscription { tokens, lifecycle })
        })
    }
}

async fn open_pubsub(client: &Client, channel: &str) -> Result<redis::aio::PubSub, SignalBusError> {
    let mut pubsub = client
        .get_async_pubsub()
        .await
        .map_err(|e| SignalBusError::SubscribeFailed {
            channel: channel.to_string(),
            reason: e.to_string(),
        })?;

    pubsub
        .subscribe(channel)
        .await
        .map_err(|e| SignalBusError::SubscribeFailed {
            channel: channel.to_string(),
            reason: e.to_string(),
        })?;

    Ok(pubsub)
}

/// Owns a `PubSub` session for its lifetime, forwarding messages as tokens
/// and reconnecting with capped exponential backoff on every failure.
///
/// A spawned task owns the subscription and forwards onto an `mpsc`
/// channel, with a doubling-with-cap backoff inlined here since this loop
/// runs forever rather than for a bounded attempt count.
async fn run_subscription_loop(
    client: Client,
    channel: String,
    mut pubsub: redis::aio::PubSub,
    token_tx: tokio::sync::mpsc::Sender<()>,
    lifecycle_tx: tokio::sync::mpsc::Sender<LifecycleEvent>,
) {
    loop {
        {
            let mut stream = pubsub.on_message();
            loop {
                match stream.next().await {
                    Some(_msg) => {
                        if token_tx.send(()).await.is_err() {
                            tracing::debug!(channel = %channel, "token receiver dropped, ending subscription");
                            return;
                        }
                    }
                    None => break, // connection dropped; fall through to reconnect
                }
            }
        }

        tracing::warn!(channel = %channel, "signal bus connection lost, reconnecting");

        let outage_start = Instant::now();
        let mut attempt: u32 = 0;
        let mut delay = INITIAL_BACKOFF;

        let reconnected = loop {
            attempt += 1;
            let _ = lifecycle_tx
                .send(LifecycleEvent::Reconnecting {
                    attempt,
                    elapsed: outage_start.elapsed(),
                })
                .await;

            match open_pubsub(&client, &channel).await {
                Ok(new_pubsub) => break new_pubsub,
                Err(e) => {
                    tracing::warn!(channel = %channel, attempt, error = %e, "reconnect attempt failed");
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(MAX_BACKOFF);
                }
            }
        };

        pubsub = reconnected;
        let downtime = outage_start.elapsed();

        if lifecycle_tx
            .send(LifecycleEvent::Reconnected { downtime })
            .await
            .is_err()
        {
            return;
        }
        tracing::info!(channel = %channel, downtime = ?downtime, "signal bus reconnected");
    }
}

fn tokio_stream_from_receiver<T: Send + 'static>(
    mut rx: tokio::sync::mpsc::Receiver<T>,
) -> impl futures::Stream<Item = T> + Send {
    async_stream::stream! {
        while let Some(item) = rx.recv().await {
            yield item;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wake_token_payload_is_stable() {
        assert_eq!(WAKE_TOKEN_PAYLOAD, r#"{"newMessage":true}"#);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let mut delay = INITIAL_BACKOFF;
        for _ in 0..10 {
            delay = (delay * 2).min(MAX_BACKOFF);
        }
        assert_eq!(delay, MAX_BACKOFF);
    }
}
