//! Even-delivery pacing: a pure per-unit decision, no I/O.

#![warn(clippy::unwrap_used)]

pub mod controller;

pub use controller::{decide, run_rates, HoldReason, PacingDecision, PacingPolicy, RunRates};
