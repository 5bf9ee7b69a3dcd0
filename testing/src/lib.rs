//! In-memory test doubles for the ordlog engine.
//!
//! Cloneable `Arc`-backed fakes for every capability trait, plus a
//! deterministic clock, so `ordlog-engine`'s own tests run without a live
//! `PostgreSQL` or Redis instance.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

pub mod clock;
pub mod record_store;
pub mod signal_bus;

pub use clock::{test_clock, FixedClock};
pub use record_store::InMemoryRecordStore;
pub use signal_bus::InMemorySignalBus;
