//! # ordlog-core
//!
//! Core traits and types for the ordlog durable topic engine: an ordered,
//! append-only topic abstraction built on a durable record store and a
//! lightweight advisory pub/sub bus.
//!
//! ## Core Concepts
//!
//! - [`record::Record`]: the unit stored and streamed by a topic.
//! - [`store::RecordStore`]: capability to allocate ids, insert, and fetch
//!   ranges from the durable store of record.
//! - [`bus::SignalBus`]: capability to publish and subscribe to advisory
//!   wake tokens.
//! - [`clock::Clock`]: abstracts wall-clock time for deterministic tests.
//!
//! This crate contains no I/O. Concrete implementations live in
//! `ordlog-postgres` and `ordlog-signalbus`; the orchestration (Producer,
//! Consumer, TopicSetter) lives in `ordlog-engine`.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

pub mod bus;
pub mod clock;
pub mod config;
pub mod record;
pub mod store;
