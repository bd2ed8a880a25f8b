use adserve_core::AdUnit;
use std::collections::HashSet;

/// Keep the first unit of each campaign, in input order, up to `count`.
///
/// Fewer than `count` distinct campaigns simply yields a shorter list.
pub fn dedupe_by_campaign(hits: Vec<AdUnit>, count: usize) -> Vec<AdUnit> {
    let mut seen = HashSet::new();
    hits.into_iter()
        .filter(|unit| seen.insert(unit.campaign.clone()))
        .take(count)
        .collect()
}
