//! Keeps the index in step with the campaign API and the counter store,
//! and drives goal and pacing state.

#![warn(clippy::unwrap_used)]

pub mod reconciler;
pub mod upstream;

pub use reconciler::{CycleReport, PhaseReport, Reconciler, ReconcilerSettings};
pub use upstream::{HttpUpstream, UpstreamSource};
