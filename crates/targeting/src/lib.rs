//! Targeting: turns caller criteria into an over-fetched index query,
//! runs it and keeps at most one ad unit per campaign.

#![warn(clippy::unwrap_used)]

pub mod builder;
pub mod dedup;
pub mod engine;

pub use builder::{build_query, OVER_FETCH};
pub use dedup::dedupe_by_campaign;
pub use engine::TargetingEngine;
