//! Click counters per campaign, read from the analytics store each cycle.

#![warn(clippy::unwrap_used)]

pub mod counters;
pub mod memory;

pub use counters::{fetch_snapshot, ClickHouseCounters, CounterSource};
pub use memory::MemoryCounters;
