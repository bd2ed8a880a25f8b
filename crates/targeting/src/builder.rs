//! Query builder: maps a `SearchQuery` onto index filter clauses.

use adserve_core::types::{fields, SENTINEL_ALL};
use adserve_core::{Delivery, SearchQuery, Status};
use adserve_index::{Clause, IndexQuery};
use chrono::{DateTime, Duration, Utc};

/// Hits requested per wanted result, leaving room for campaign dedup.
pub const OVER_FETCH: usize = 4;

/// Targeting query for `count` results.
///
/// Every dimension is OR-ed with the `"all"` sentinel, so a dimension the
/// caller leaves empty only matches units that are unconstrained on it.
pub fn build_query(criteria: &SearchQuery, count: usize, now: DateTime<Utc>) -> IndexQuery {
    let query = filtered(criteria, true, now, count.saturating_mul(OVER_FETCH));
    query.with_random_score()
}

/// Administrative "fetch all": no status, goal, pause, schedule or projection
/// filters. `page_size` is the page a scan reads at a time.
pub fn all_units_query(page_size: usize) -> IndexQuery {
    filtered(&SearchQuery::administrative(), false, Utc::now(), page_size)
}

/// Every unit of one campaign, whatever its state.
pub fn campaign_query(campaign: &str, page_size: usize) -> IndexQuery {
    all_units_query(page_size).must(Clause::term(fields::CAMPAIGN, campaign))
}

/// Active, even-delivery units whose goal is open and whose end date falls
/// within `horizon_years`. Anything scheduled further out is not paced.
pub fn pacing_candidates_query(
    now: DateTime<Utc>,
    horizon_years: u32,
    page_size: usize,
) -> IndexQuery {
    let horizon = now + Duration::days(365 * i64::from(horizon_years));
    all_units_query(page_size)
        .must(Clause::term(fields::DELIVERY, Delivery::Even.as_str()))
        .must(Clause::term(fields::STATUS, Status::Active.as_str()))
        .must(Clause::range(fields::END_DATE, None, Some(horizon)))
        .must_not(Clause::term(fields::GOAL_REACHED, true))
}

/// Single most recently updated document, for the ingest watermark.
pub fn watermark_query() -> IndexQuery {
    IndexQuery::new(1)
        .with_source(&[fields::UPDATED])
        .sorted_desc_by(fields::UPDATED)
}

fn filtered(criteria: &SearchQuery, sentinel: bool, now: DateTime<Utc>, size: usize) -> IndexQuery {
    let mut query = IndexQuery::new(size);

    let single = |value: &Option<String>| value.iter().cloned().collect::<Vec<_>>();
    let dimensions = [
        (fields::LOCATIONS, criteria.locations.clone()),
        (fields::LANGUAGES, criteria.languages.clone()),
        (fields::CATEGORIES, criteria.categories.clone()),
        (fields::FORMATS, single(&criteria.format)),
        (fields::DEVICES, single(&criteria.device)),
    ];
    for (field, values) in dimensions {
        let mut values = lowercase(&values);
        if sentinel && !values.iter().any(|v| v == SENTINEL_ALL) {
            values.push(SENTINEL_ALL.to_string());
        }
        if !values.is_empty() {
            query = query.must(Clause::terms(field, values));
        }
    }

    if !criteria.disable_active_check {
        query = query.must(Clause::term(fields::STATUS, Status::Active.as_str()));
    }
    if !criteria.disable_schedule_check {
        query = query
            .must(Clause::range(fields::START_DATE, None, Some(now)))
            .must(Clause::range(fields::END_DATE, Some(now), None));
    }

    // Exclusions compare against what the caller asked for, never the sentinel.
    let locations = lowercase(&criteria.locations);
    if !locations.is_empty() {
        query = query.must_not(Clause::terms(fields::EXCLUDED_LOCATIONS, locations));
    }
    let categories = lowercase(&criteria.categories);
    if !categories.is_empty() {
        query = query.must_not(Clause::terms(fields::EXCLUDED_CATEGORIES, categories));
    }
    if !criteria.disable_goal_reached_check {
        query = query.must_not(Clause::term(fields::GOAL_REACHED, true));
    }
    if !criteria.disable_paused_check {
        query = query.must_not(Clause::term(fields::PAUSED, true));
    }

    if !criteria.disable_includes {
        query = query.with_source(&fields::RESPONSE);
    }
    query
}

fn lowercase(values: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(values.len());
    for value in values {
        let value = value.trim().to_lowercase();
        if !value.is_empty() && !out.contains(&value) {
            out.push(value);
        }
    }
    out
}
