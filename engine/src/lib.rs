//! The orchestration layer: `Producer`, `Consumer`, and `TopicSetter`.
//!
//! These three actors are built entirely on top of the capability traits in
//! `ordlog-core` (`RecordStore`, `SignalBus`, `Clock`) — none of them knows
//! whether the durable store is `PostgreSQL` or an in-memory fake, or
//! whether the bus is Redis or a broadcast channel in a test.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

pub mod consumer;
pub mod producer;
pub mod setter;

pub use consumer::{Consumer, ConsumerError, ConsumerState};
pub use producer::{Producer, ProducerError};
pub use setter::{SetterError, TopicSetter};
