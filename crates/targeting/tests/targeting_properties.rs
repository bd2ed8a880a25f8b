//! End-to-end targeting behaviour against the in-memory index.

use adserve_core::{AdUnit, SearchQuery, Status};
use adserve_index::{AdIndex, MemoryIndex};
use adserve_targeting::TargetingEngine;
use chrono::{Duration, Utc};
use std::collections::HashSet;
use std::sync::Arc;

async fn write(index: &MemoryIndex, unit: AdUnit) {
    let unit = unit.normalize(Utc::now() - Duration::minutes(5)).unwrap();
    index
        .update(&unit.id, unit.ingest_document().unwrap(), true)
        .await
        .unwrap();
}

fn active(id: &str, campaign: &str) -> AdUnit {
    let mut unit = AdUnit::new(id, campaign);
    unit.status = Status::Active;
    unit
}

fn engine(index: &MemoryIndex) -> TargetingEngine {
    TargetingEngine::new(Arc::new(index.clone()), 10_000)
}

fn locations(values: &[&str]) -> SearchQuery {
    SearchQuery {
        locations: values.iter().map(|v| v.to_string()).collect(),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_sentinel_unit_matches_with_and_without_location() {
    let index = MemoryIndex::new();
    write(&index, active("ad-1", "c1")).await;
    let engine = engine(&index);

    let unconstrained = engine.find_ad_units(&SearchQuery::default(), 1).await.unwrap();
    assert_eq!(unconstrained[0].id, "ad-1");

    let in_france = engine.find_ad_units(&locations(&["FR"]), 1).await.unwrap();
    assert_eq!(in_france[0].id, "ad-1");
}

#[tokio::test]
async fn test_location_targeted_unit_needs_matching_query() {
    let index = MemoryIndex::new();
    let mut unit = active("ad-1", "c1");
    unit.locations = vec!["FR".into()];
    write(&index, unit).await;
    let engine = engine(&index);

    assert!(engine.find_ad_units(&locations(&["fr"]), 1).await.is_ok());
    let err = engine.find_ad_units(&locations(&["us"]), 1).await.unwrap_err();
    assert!(err.is_no_match());
}

#[tokio::test]
async fn test_excluded_location_and_category_are_not_served() {
    let index = MemoryIndex::new();
    let mut unit = active("ad-1", "c1");
    unit.excluded_locations = vec!["DE".into()];
    unit.excluded_categories = vec!["gambling".into()];
    write(&index, unit).await;
    let engine = engine(&index);

    assert!(engine.find_ad_units(&locations(&["de"]), 1).await.unwrap_err().is_no_match());
    let gambling = SearchQuery {
        categories: vec!["Gambling".into()],
        ..Default::default()
    };
    assert!(engine.find_ad_units(&gambling, 1).await.unwrap_err().is_no_match());
    assert!(engine.find_ad_units(&locations(&["fr"]), 1).await.is_ok());
}

#[tokio::test]
async fn test_inactive_sibling_is_filtered_out() {
    let index = MemoryIndex::new();
    write(&index, active("live", "c1")).await;
    write(&index, AdUnit::new("off", "c1")).await;

    for _ in 0..10 {
        let units = engine(&index)
            .find_ad_units(&SearchQuery::default(), 2)
            .await
            .unwrap();
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].id, "live");
    }
}

#[tokio::test]
async fn test_deleted_unit_never_served() {
    let index = MemoryIndex::new();
    let mut deleted = active("gone", "c1");
    deleted.status = Status::Deleted;
    write(&index, deleted).await;

    let err = engine(&index)
        .find_ad_units(&SearchQuery::default(), 5)
        .await
        .unwrap_err();
    assert!(err.is_no_match());
}

#[tokio::test]
async fn test_results_hold_one_unit_per_campaign() {
    let index = MemoryIndex::new();
    for campaign in 0..4 {
        for unit in 0..5 {
            write(&index, active(&format!("ad-{campaign}-{unit}"), &format!("c{campaign}"))).await;
        }
    }
    let engine = engine(&index);

    for _ in 0..20 {
        let units = engine.find_ad_units(&SearchQuery::default(), 3).await.unwrap();
        assert!(units.len() <= 3);
        let campaigns: HashSet<_> = units.iter().map(|u| u.campaign.clone()).collect();
        assert_eq!(campaigns.len(), units.len());
    }
}

#[tokio::test]
async fn test_unscheduled_units_are_not_served() {
    let index = MemoryIndex::new();
    let mut future = active("later", "c1");
    future.start_date = Some(Utc::now() + Duration::days(2));
    let mut expired = active("over", "c2");
    expired.start_date = Some(Utc::now() - Duration::days(10));
    expired.end_date = Some(Utc::now() - Duration::days(1));
    write(&index, future).await;
    write(&index, expired).await;

    let err = engine(&index)
        .find_ad_units(&SearchQuery::default(), 2)
        .await
        .unwrap_err();
    assert!(err.is_no_match());
}

#[tokio::test]
async fn test_stored_dimensions_read_back_lowercased() {
    let index = MemoryIndex::new();
    let mut unit = active("ad-1", "c1");
    unit.languages = vec!["EN".into(), "Fr".into()];
    unit.devices = vec!["Mobile".into()];
    write(&index, unit).await;

    let stored = index.get("ad-1").await.unwrap().unwrap();
    assert_eq!(stored.languages, vec!["en", "fr"]);
    assert_eq!(stored.devices, vec!["mobile"]);
    assert_eq!(stored.locations, vec!["all"]);
}
