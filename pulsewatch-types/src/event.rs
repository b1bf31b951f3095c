//! Snapshot batch events submitted by workers.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::time::lenient;

/// Raw snapshot for one entity, as scraped. Keys beyond the recognized metrics
/// are carried through to storage untouched.
pub type RawSnapshot = Map<String, Value>;

/// The type tag of a submitted batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    AccountsStatsBatch,
    PostsStatsBatch,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::AccountsStatsBatch => "accounts_stats_batch",
            EventType::PostsStatsBatch => "posts_stats_batch",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "accounts_stats_batch" => Ok(EventType::AccountsStatsBatch),
            "posts_stats_batch" => Ok(EventType::PostsStatsBatch),
            other => Err(format!("unsupported event type: {other}")),
        }
    }
}

/// One producer's report for many entities.
///
/// # Example
///
/// ```rust
/// use pulsewatch_types::{EventType, ParserEvent};
/// use serde_json::json;
///
/// let event = ParserEvent::new(EventType::PostsStatsBatch)
///     .with_snapshot("https://example.com/p/1", json!({"views": 10}));
/// let encoded = serde_json::to_value(&event).unwrap();
/// assert_eq!(encoded["type"], "posts_stats_batch");
/// assert_eq!(encoded["stats_by_url"]["https://example.com/p/1"]["views"], 10);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParserEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,

    #[serde(default)]
    pub stats_by_url: BTreeMap<String, RawSnapshot>,

    #[serde(default, with = "lenient", skip_serializing_if = "Option::is_none")]
    pub sent_at_utc: Option<DateTime<Utc>>,

    #[serde(default, with = "lenient", skip_serializing_if = "Option::is_none")]
    pub received_at_utc: Option<DateTime<Utc>>,
}

impl ParserEvent {
    pub fn new(event_type: EventType) -> Self {
        Self {
            event_type,
            stats_by_url: BTreeMap::new(),
            sent_at_utc: None,
            received_at_utc: None,
        }
    }

    /// Add one entity's snapshot. Non-object values are ignored.
    pub fn with_snapshot(mut self, id: impl Into<String>, snapshot: Value) -> Self {
        if let Value::Object(map) = snapshot {
            self.stats_by_url.insert(id.into(), map);
        }
        self
    }

    /// Best known observation time for points that carry none of their own.
    pub fn observed_at(&self) -> Option<DateTime<Utc>> {
        self.sent_at_utc.or(self.received_at_utc)
    }
}

/// Normalize a raw `stats_by_url` value.
///
/// Keys are trimmed; blank keys and non-object snapshots are dropped. Anything
/// other than an object yields an empty map.
pub fn normalize_stats_map(raw: Option<&Value>) -> BTreeMap<String, RawSnapshot> {
    let Some(Value::Object(raw)) = raw else {
        return BTreeMap::new();
    };
    raw.iter()
        .filter_map(|(key, value)| {
            let key = key.trim();
            match value {
                Value::Object(snapshot) if !key.is_empty() => {
                    Some((key.to_string(), snapshot.clone()))
                }
                _ => None,
            }
        })
        .collect()
}
