//! Typed filter query. Rendered to the Elasticsearch query DSL by
//! [`IndexQuery::to_dsl`] and evaluated against JSON documents by
//! [`IndexQuery::matches`], so both backends agree on semantics.

use adserve_core::types::fields;
use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use std::cmp::Ordering;

#[derive(Debug, Clone, PartialEq)]
pub enum Clause {
    /// Field equals (or, for arrays, contains) the value.
    Term { field: String, value: Value },
    /// Field shares at least one value with the set.
    Terms { field: String, values: Vec<String> },
    /// Date field within the inclusive bounds.
    Range {
        field: String,
        gte: Option<DateTime<Utc>>,
        lte: Option<DateTime<Utc>>,
    },
}

impl Clause {
    pub fn term(field: &str, value: impl Into<Value>) -> Self {
        Self::Term {
            field: field.to_string(),
            value: value.into(),
        }
    }

    pub fn terms(field: &str, values: Vec<String>) -> Self {
        Self::Terms {
            field: field.to_string(),
            values,
        }
    }

    pub fn range(field: &str, gte: Option<DateTime<Utc>>, lte: Option<DateTime<Utc>>) -> Self {
        Self::Range {
            field: field.to_string(),
            gte,
            lte,
        }
    }

    pub fn to_dsl(&self) -> Value {
        match self {
            Self::Term { field, value } => json!({ "term": { field.as_str(): value } }),
            Self::Terms { field, values } => json!({ "terms": { field.as_str(): values } }),
            Self::Range { field, gte, lte } => {
                let mut bounds = Map::new();
                if let Some(gte) = gte {
                    bounds.insert("gte".into(), Value::String(gte.to_rfc3339()));
                }
                if let Some(lte) = lte {
                    bounds.insert("lte".into(), Value::String(lte.to_rfc3339()));
                }
                json!({ "range": { field.as_str(): bounds } })
            }
        }
    }

    pub fn matches(&self, doc: &Value) -> bool {
        match self {
            Self::Term { field, value } => field_values(doc, field).any(|v| v == value),
            Self::Terms { field, values } => field_values(doc, field)
                .filter_map(Value::as_str)
                .any(|v| values.iter().any(|wanted| wanted == v)),
            Self::Range { field, gte, lte } => match doc.get(field).and_then(as_datetime) {
                Some(at) => gte.map_or(true, |g| at >= g) && lte.map_or(true, |l| at <= l),
                None => false,
            },
        }
    }
}

/// Scalar fields yield one value, array fields each element, missing fields none.
fn field_values<'a>(doc: &'a Value, field: &str) -> Box<dyn Iterator<Item = &'a Value> + 'a> {
    match doc.get(field) {
        Some(Value::Array(items)) => Box::new(items.iter()),
        Some(Value::Null) | None => Box::new(std::iter::empty()),
        Some(scalar) => Box::new(std::iter::once(scalar)),
    }
}

fn as_datetime(value: &Value) -> Option<DateTime<Utc>> {
    value
        .as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndexQuery {
    pub must: Vec<Clause>,
    pub must_not: Vec<Clause>,
    pub size: usize,
    /// Projection; `None` returns whole documents.
    pub source: Option<Vec<String>>,
    /// Break ties non-deterministically across calls.
    pub random_score: bool,
    /// Sort descending by this field instead of scoring.
    pub sort_desc: Option<String>,
}

impl IndexQuery {
    pub fn new(size: usize) -> Self {
        Self {
            must: Vec::new(),
            must_not: Vec::new(),
            size,
            source: None,
            random_score: false,
            sort_desc: None,
        }
    }

    pub fn must(mut self, clause: Clause) -> Self {
        self.must.push(clause);
        self
    }

    pub fn must_not(mut self, clause: Clause) -> Self {
        self.must_not.push(clause);
        self
    }

    pub fn with_source(mut self, source: &[&str]) -> Self {
        self.source = Some(source.iter().map(|f| f.to_string()).collect());
        self
    }

    pub fn with_random_score(mut self) -> Self {
        self.random_score = true;
        self
    }

    pub fn sorted_desc_by(mut self, field: &str) -> Self {
        self.sort_desc = Some(field.to_string());
        self
    }

    /// Whether a stored document satisfies every `must` and no `must_not`.
    pub fn matches(&self, doc: &Value) -> bool {
        self.must.iter().all(|c| c.matches(doc)) && !self.must_not.iter().any(|c| c.matches(doc))
    }

    /// Keep only the projected fields of a document. `_id` always survives.
    pub fn project(&self, doc: &Value) -> Value {
        match (&self.source, doc.as_object()) {
            (Some(source), Some(map)) => Value::Object(
                map.iter()
                    .filter(|(k, _)| k.as_str() == fields::ID || source.iter().any(|f| f == *k))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            ),
            _ => doc.clone(),
        }
    }

    /// Descending order on `sort_desc`; documents missing the field sort last.
    pub fn compare(&self, a: &Value, b: &Value) -> Ordering {
        let Some(field) = &self.sort_desc else {
            return Ordering::Equal;
        };
        match (a.get(field).and_then(as_datetime), b.get(field).and_then(as_datetime)) {
            (Some(x), Some(y)) => y.cmp(&x),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        }
    }

    /// Render as an Elasticsearch search body.
    pub fn to_dsl(&self) -> Value {
        let filter = if self.must.is_empty() && self.must_not.is_empty() {
            json!({ "match_all": {} })
        } else {
            json!({
                "bool": {
                    "filter": self.must.iter().map(Clause::to_dsl).collect::<Vec<_>>(),
                    "must_not": self.must_not.iter().map(Clause::to_dsl).collect::<Vec<_>>(),
                }
            })
        };

        let query = if self.random_score {
            json!({
                "function_score": {
                    "query": filter,
                    "random_score": {},
                    "boost_mode": "replace"
                }
            })
        } else {
            filter
        };

        let mut body = json!({ "size": self.size, "query": query });
        if let Some(source) = &self.source {
            // `_id` is hit metadata, not part of `_source`.
            let includes: Vec<&String> = source.iter().filter(|f| *f != fields::ID).collect();
            body["_source"] = json!(includes);
        }
        if let Some(field) = &self.sort_desc {
            body["sort"] = json!([{ field.as_str(): { "order": "desc" } }]);
        }
        body
    }
}
