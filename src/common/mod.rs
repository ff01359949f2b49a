//! Shared infrastructure for inserter workers
//!
//! This module holds the counters every worker reports into and the
//! end-of-run report surfaced when a worker stops.

pub mod counters;
pub use counters::{CounterTotals, SharedCounters, WorkerReport};
