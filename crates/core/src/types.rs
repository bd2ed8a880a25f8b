use crate::error::{DeliveryError, DeliveryResult};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use utoipa::ToSchema;

/// Dimension value meaning "matches every query value for this dimension".
pub const SENTINEL_ALL: &str = "all";

/// Units written without an end date run for this long.
const DEFAULT_RUN_DAYS: i64 = 100 * 365;

/// Index field names shared by the query builder, the backends and the loop.
pub mod fields {
    pub const ID: &str = "_id";
    pub const UPDATED: &str = "_updated";
    pub const CREATED: &str = "_created";
    pub const CAMPAIGN: &str = "campaign";
    pub const LANGUAGES: &str = "languages";
    pub const LOCATIONS: &str = "locations";
    pub const EXCLUDED_LOCATIONS: &str = "excluded_locations";
    pub const CATEGORIES: &str = "categories";
    pub const EXCLUDED_CATEGORIES: &str = "excluded_categories";
    pub const DEVICES: &str = "devices";
    pub const FORMATS: &str = "formats";
    pub const STATUS: &str = "status";
    pub const DELIVERY: &str = "delivery";
    pub const PAUSED: &str = "paused";
    pub const GOAL_REACHED: &str = "goal_reached";
    pub const GOAL_VIEWS: &str = "goal_views";
    pub const CLICKS: &str = "clicks";
    pub const VIEWS: &str = "views";
    pub const START_DATE: &str = "start_date";
    pub const END_DATE: &str = "end_date";

    /// Fields only the reconciliation loop may write. Ingest never touches them.
    pub const LOOP_OWNED: [&str; 4] = [CLICKS, VIEWS, GOAL_REACHED, PAUSED];

    /// Optional upstream-owned fields. Ingest writes them as `null` when
    /// upstream no longer sends them, so a cleared value is cleared in the index.
    pub const CLEARABLE: [&str; 12] = [
        "goal_period",
        "ad",
        "tactic",
        "channel",
        "channel_url",
        "account",
        "title",
        "description",
        "video_url",
        "thumbnail_url",
        "duration",
        "cpc",
    ];

    /// Projection returned to targeting callers.
    pub const RESPONSE: [&str; 13] = [
        ID,
        CAMPAIGN,
        "ad",
        "tactic",
        "channel",
        "channel_url",
        "account",
        "title",
        "description",
        "video_url",
        "thumbnail_url",
        "duration",
        "cpc",
    ];
}

// ---------------------------------------------------------------------------
// Status / delivery
// ---------------------------------------------------------------------------

/// Lifecycle status, as set by the campaign API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Active,
    #[default]
    Inactive,
    Deleted,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
            Self::Deleted => "deleted",
        }
    }
}

/// Unknown values are treated as not targetable.
impl From<&str> for Status {
    fn from(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "active" => Self::Active,
            "deleted" => Self::Deleted,
            _ => Self::Inactive,
        }
    }
}

impl<'de> Deserialize<'de> for Status {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Option::<String>::deserialize(deserializer)?;
        Ok(raw.as_deref().map(Status::from).unwrap_or_default())
    }
}

/// Delivery mode. Only `even` units are paced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Delivery {
    Even,
    #[default]
    Unconstrained,
}

impl Delivery {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Even => "even",
            Self::Unconstrained => "unconstrained",
        }
    }
}

impl From<&str> for Delivery {
    fn from(value: &str) -> Self {
        if value.trim().eq_ignore_ascii_case("even") {
            Self::Even
        } else {
            Self::Unconstrained
        }
    }
}

impl<'de> Deserialize<'de> for Delivery {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Option::<String>::deserialize(deserializer)?;
        Ok(raw.as_deref().map(Delivery::from).unwrap_or_default())
    }
}

// ---------------------------------------------------------------------------
// AdUnit
// ---------------------------------------------------------------------------

/// The indexed, targetable advertising record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct AdUnit {
    #[serde(rename = "_id", default)]
    pub id: String,
    #[serde(rename = "_updated", default, skip_serializing_if = "Option::is_none")]
    pub updated: Option<DateTime<Utc>>,
    #[serde(rename = "_created", default, skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
    #[serde(default)]
    pub campaign: String,

    // Targeting dimensions
    #[serde(default, deserialize_with = "string_list", skip_serializing_if = "Vec::is_empty")]
    pub languages: Vec<String>,
    #[serde(default, deserialize_with = "string_list", skip_serializing_if = "Vec::is_empty")]
    pub locations: Vec<String>,
    #[serde(default, deserialize_with = "string_list", skip_serializing_if = "Vec::is_empty")]
    pub excluded_locations: Vec<String>,
    #[serde(default, deserialize_with = "string_list", skip_serializing_if = "Vec::is_empty")]
    pub categories: Vec<String>,
    #[serde(default, deserialize_with = "string_list", skip_serializing_if = "Vec::is_empty")]
    pub excluded_categories: Vec<String>,
    #[serde(default, deserialize_with = "string_list", skip_serializing_if = "Vec::is_empty")]
    pub devices: Vec<String>,
    #[serde(default, deserialize_with = "string_list", skip_serializing_if = "Vec::is_empty")]
    pub formats: Vec<String>,

    #[serde(default)]
    pub status: Status,
    #[serde(default)]
    pub delivery: Delivery,

    // Goal and counters
    #[serde(default)]
    pub goal_views: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goal_period: Option<String>,
    #[serde(default)]
    pub clicks: u64,
    #[serde(default)]
    pub views: u64,
    #[serde(default)]
    pub paused: bool,
    #[serde(default)]
    pub goal_reached: bool,

    // Schedule
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_date: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_date: Option<DateTime<Utc>>,

    // Content returned to callers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ad: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tactic: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpc: Option<f64>,
}

impl AdUnit {
    pub fn new(id: impl Into<String>, campaign: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            campaign: campaign.into(),
            ..Default::default()
        }
    }

    /// Enforce the write-time invariants: a non-blank id, lowercase dimensions,
    /// the `"all"` sentinel on empty inclusion dimensions and a schedule window.
    pub fn normalize(mut self, now: DateTime<Utc>) -> DeliveryResult<Self> {
        self.id = self.id.trim().to_string();
        if self.id.is_empty() {
            return Err(DeliveryError::Validation(
                "ad unit '_id' must not be empty".to_string(),
            ));
        }

        for dimension in [
            &mut self.languages,
            &mut self.locations,
            &mut self.categories,
            &mut self.devices,
            &mut self.formats,
        ] {
            *dimension = with_sentinel(lowercase_set(std::mem::take(dimension)));
        }
        // A sentinel in an exclusion list would exclude every query.
        self.excluded_locations = lowercase_set(std::mem::take(&mut self.excluded_locations));
        self.excluded_categories = lowercase_set(std::mem::take(&mut self.excluded_categories));

        self.start_date.get_or_insert(now);
        self.end_date
            .get_or_insert_with(|| now + Duration::days(DEFAULT_RUN_DAYS));

        Ok(self)
    }

    /// Whether the goal is reached, derived from `(goal_views, clicks)` alone.
    pub fn derive_goal_reached(&self) -> bool {
        goal_reached(self.goal_views, self.clicks)
    }

    /// Document written on ingest: everything except the loop-owned fields,
    /// so a content update never resets counters or pacing state. Empty
    /// exclusion lists and absent optional fields are written explicitly so a
    /// partial update clears what upstream cleared.
    pub fn ingest_document(&self) -> DeliveryResult<Value> {
        let mut doc = serde_json::to_value(self)?;
        if let Some(map) = doc.as_object_mut() {
            for field in fields::LOOP_OWNED {
                map.remove(field);
            }
            for field in [fields::EXCLUDED_LOCATIONS, fields::EXCLUDED_CATEGORIES] {
                map.entry(field).or_insert_with(|| Value::Array(Vec::new()));
            }
            for field in fields::CLEARABLE {
                map.entry(field).or_insert(Value::Null);
            }
        }
        Ok(doc)
    }

    /// Normalize an upstream record into the two documents an ingest write needs.
    pub fn into_ingest(self, now: DateTime<Utc>) -> DeliveryResult<IngestWrite> {
        let sent_start = self.start_date.is_some();
        let sent_end = self.end_date.is_some();
        let unit = self.normalize(now)?;

        let insert = unit.ingest_document()?;
        let mut update = insert.clone();
        if let Some(map) = update.as_object_mut() {
            if !sent_start {
                map.remove(fields::START_DATE);
            }
            if !sent_end {
                map.remove(fields::END_DATE);
            }
        }

        Ok(IngestWrite { unit, update, insert })
    }

    pub fn is_deleted(&self) -> bool {
        self.status == Status::Deleted
    }
}

/// One normalized upstream record, ready to write.
#[derive(Debug, Clone, PartialEq)]
pub struct IngestWrite {
    pub unit: AdUnit,
    /// Partial update for a unit already indexed. Schedule dates upstream did
    /// not send are left out, so the defaults written on insert stay put.
    pub update: Value,
    /// Full document for a unit indexed for the first time.
    pub insert: Value,
}

/// `goal_reached` is true iff a goal is set and clicks have met it.
pub fn goal_reached(goal_views: u64, clicks: u64) -> bool {
    goal_views > 0 && goal_views <= clicks
}

fn lowercase_set(values: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    values
        .into_iter()
        .map(|v| v.trim().to_lowercase())
        .filter(|v| !v.is_empty() && seen.insert(v.clone()))
        .collect()
}

fn with_sentinel(values: Vec<String>) -> Vec<String> {
    if values.is_empty() {
        vec![SENTINEL_ALL.to_string()]
    } else {
        values
    }
}

/// A dimension value sent either as text or as an integer code.
#[derive(Deserialize)]
#[serde(untagged)]
enum Item {
    Text(String),
    Code(i64),
}

impl From<Item> for String {
    fn from(item: Item) -> Self {
        match item {
            Item::Text(s) => s,
            Item::Code(n) => n.to_string(),
        }
    }
}

/// Dimension arrays arrive as strings or integer codes; null means empty.
fn string_list<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
    let raw = Option::<Vec<Item>>::deserialize(deserializer)?;
    Ok(raw.unwrap_or_default().into_iter().map(String::from).collect())
}

/// Single-valued `format` / `device` codes, as text or integer.
fn optional_code<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    Ok(Option::<Item>::deserialize(deserializer)?.map(String::from))
}

/// `{ "_items": [...] }` envelope used by the campaign API and the query endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct AdUnits {
    #[serde(rename = "_items", default)]
    pub items: Vec<AdUnit>,
}

// ---------------------------------------------------------------------------
// SearchQuery
// ---------------------------------------------------------------------------

/// Targeting criteria sent by a caller. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct SearchQuery {
    #[serde(default, deserialize_with = "string_list", skip_serializing_if = "Vec::is_empty")]
    pub languages: Vec<String>,
    #[serde(default, deserialize_with = "string_list", skip_serializing_if = "Vec::is_empty")]
    pub locations: Vec<String>,
    #[serde(default, deserialize_with = "string_list", skip_serializing_if = "Vec::is_empty")]
    pub categories: Vec<String>,
    #[serde(default, deserialize_with = "optional_code", skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(default, deserialize_with = "optional_code", skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,

    // Administrative toggles, never accepted from callers.
    #[serde(skip)]
    pub disable_active_check: bool,
    #[serde(skip)]
    pub disable_goal_reached_check: bool,
    #[serde(skip)]
    pub disable_paused_check: bool,
    #[serde(skip)]
    pub disable_schedule_check: bool,
    #[serde(skip)]
    pub disable_includes: bool,
}

impl SearchQuery {
    /// "Fetch all" mode: no status, goal, pacing, schedule or projection filters.
    pub fn administrative() -> Self {
        Self {
            disable_active_check: true,
            disable_goal_reached_check: true,
            disable_paused_check: true,
            disable_schedule_check: true,
            disable_includes: true,
            ..Default::default()
        }
    }
}

// ---------------------------------------------------------------------------
// CounterSnapshot
// ---------------------------------------------------------------------------

/// Per-campaign click counts pulled from the analytics store for one cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CounterSnapshot {
    pub window_hours: u32,
    /// campaign -> cumulative clicks
    pub totals: HashMap<String, u64>,
    /// campaign -> clicks within the trailing window
    pub trailing: HashMap<String, u64>,
}

impl CounterSnapshot {
    pub fn new(window_hours: u32) -> Self {
        Self {
            window_hours,
            ..Default::default()
        }
    }

    pub fn total(&self, campaign: &str) -> Option<u64> {
        self.totals.get(campaign).copied()
    }

    /// Clicks in the trailing window; campaigns without events count zero.
    pub fn trailing(&self, campaign: &str) -> u64 {
        self.trailing.get(campaign).copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.totals.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn test_normalize_fills_sentinel_and_lowercases() {
        let mut unit = AdUnit::new(" ad-1 ", "camp-1");
        unit.locations = vec!["FR".into(), "fr".into(), "US".into()];
        unit.excluded_categories = vec!["Gambling".into()];

        let unit = unit.normalize(now()).unwrap();

        assert_eq!(unit.id, "ad-1");
        assert_eq!(unit.locations, vec!["fr", "us"]);
        assert_eq!(unit.languages, vec![SENTINEL_ALL]);
        assert_eq!(unit.categories, vec![SENTINEL_ALL]);
        assert_eq!(unit.devices, vec![SENTINEL_ALL]);
        assert_eq!(unit.formats, vec![SENTINEL_ALL]);
        assert_eq!(unit.excluded_categories, vec!["gambling"]);
        assert!(unit.excluded_locations.is_empty());
    }

    #[test]
    fn test_normalize_defaults_schedule() {
        let unit = AdUnit::new("ad-1", "camp-1").normalize(now()).unwrap();
        assert_eq!(unit.start_date, Some(now()));
        assert_eq!(unit.end_date, Some(now() + Duration::days(DEFAULT_RUN_DAYS)));
    }

    #[test]
    fn test_normalize_rejects_blank_id() {
        let err = AdUnit::new("   ", "camp-1").normalize(now()).unwrap_err();
        assert!(matches!(err, DeliveryError::Validation(_)));
    }

    #[test]
    fn test_goal_reached_derivation() {
        assert!(!goal_reached(0, 100));
        assert!(!goal_reached(10, 9));
        assert!(goal_reached(10, 10));
        assert!(goal_reached(10, 11));
    }

    #[test]
    fn test_deserialize_wire_document() {
        let unit: AdUnit = serde_json::from_value(json!({
            "_id": "ad-9",
            "_updated": "2026-02-01T10:00:00Z",
            "campaign": "c-9",
            "formats": [1, 2],
            "devices": null,
            "status": "Active",
            "delivery": "EVEN",
            "goal_views": 500,
            "title": "Trailer"
        }))
        .unwrap();

        assert_eq!(unit.id, "ad-9");
        assert_eq!(unit.formats, vec!["1", "2"]);
        assert!(unit.devices.is_empty());
        assert_eq!(unit.status, Status::Active);
        assert_eq!(unit.delivery, Delivery::Even);
        assert_eq!(unit.goal_views, 500);
        assert_eq!(unit.title.as_deref(), Some("Trailer"));
    }

    #[test]
    fn test_unknown_status_is_not_targetable() {
        let unit: AdUnit = serde_json::from_value(json!({"_id": "a", "status": "archived"})).unwrap();
        assert_eq!(unit.status, Status::Inactive);
    }

    #[test]
    fn test_ingest_document_omits_loop_owned_fields() {
        let mut unit = AdUnit::new("ad-1", "camp-1");
        unit.clicks = 40;
        unit.paused = true;
        unit.goal_reached = true;

        let doc = unit.ingest_document().unwrap();
        let map = doc.as_object().unwrap();
        for field in fields::LOOP_OWNED {
            assert!(!map.contains_key(field), "{field} must not be written on ingest");
        }
        assert_eq!(map["_id"], "ad-1");
        assert_eq!(map["status"], "inactive");
    }

    #[test]
    fn test_ingest_document_clears_what_upstream_dropped() {
        let unit = AdUnit::new("ad-1", "camp-1").normalize(now()).unwrap();
        let doc = unit.ingest_document().unwrap();
        assert_eq!(doc["excluded_locations"], json!([]));
        assert_eq!(doc["excluded_categories"], json!([]));
        assert_eq!(doc["title"], Value::Null);
        assert_eq!(doc["video_url"], Value::Null);
        assert_eq!(doc["cpc"], Value::Null);
    }

    #[test]
    fn test_into_ingest_keeps_defaulted_dates_out_of_updates() {
        let write = AdUnit::new("ad-1", "camp-1").into_ingest(now()).unwrap();
        assert!(write.update.get("start_date").is_none());
        assert!(write.update.get("end_date").is_none());
        assert_eq!(write.insert["start_date"], json!(now()));
        assert_eq!(write.unit.start_date, Some(now()));

        let mut dated = AdUnit::new("ad-2", "camp-1");
        dated.end_date = Some(now() + Duration::days(3));
        let write = dated.into_ingest(now()).unwrap();
        assert!(write.update.get("start_date").is_none());
        assert_eq!(write.update["end_date"], json!(now() + Duration::days(3)));
    }

    #[test]
    fn test_search_query_accepts_integer_codes() {
        let sq: SearchQuery = serde_json::from_str(r#"{"format": 2, "device": "1"}"#).unwrap();
        assert_eq!(sq.format.as_deref(), Some("2"));
        assert_eq!(sq.device.as_deref(), Some("1"));

        let sq: SearchQuery = serde_json::from_str(r#"{"format": null}"#).unwrap();
        assert_eq!(sq.format, None);
    }

    #[test]
    fn test_search_query_ignores_admin_toggles_from_callers() {
        let sq: SearchQuery = serde_json::from_value(json!({
            "locations": ["FR"],
            "disable_active_check": true
        }))
        .unwrap();
        assert_eq!(sq.locations, vec!["FR"]);
        assert!(!sq.disable_active_check);
    }

    #[test]
    fn test_counter_snapshot_defaults_trailing_to_zero() {
        let mut snapshot = CounterSnapshot::new(24);
        snapshot.totals.insert("c1".into(), 12);
        assert_eq!(snapshot.total("c1"), Some(12));
        assert_eq!(snapshot.total("c2"), None);
        assert_eq!(snapshot.trailing("c1"), 0);
    }
}
