//! Per-user document schema.
//!
//! Only the fields the coordinator reads or writes are typed. Everything else
//! a document carries (credentials, UI state, fields added later) rides along
//! in `extra` and is written back untouched.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::data::normalize_account;
use pulsewatch_types::WorkerKind;

/// A user's tracked targets and their stored stats.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Document {
    #[serde(default, deserialize_with = "list_or_empty")]
    pub accounts: Vec<Value>,

    #[serde(default, deserialize_with = "list_or_empty")]
    pub posts: Vec<Value>,

    #[serde(
        default,
        deserialize_with = "list_or_empty",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub seen_posts: Vec<Value>,

    #[serde(
        default,
        deserialize_with = "object_or_empty",
        skip_serializing_if = "Map::is_empty"
    )]
    pub auto_add_latest: Map<String, Value>,

    #[serde(default, deserialize_with = "stats_or_empty")]
    pub stats: Stats,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Stored snapshots keyed by entity id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Stats {
    #[serde(default, deserialize_with = "object_or_empty")]
    pub accounts: Map<String, Value>,

    #[serde(default, deserialize_with = "object_or_empty")]
    pub posts: Map<String, Value>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Document {
    /// Parse a document, tolerating a UTF-8 BOM. The root must be an object.
    pub fn parse(content: &str) -> Result<Self, serde_json::Error> {
        let content = content.trim_start_matches('\u{feff}');
        let value: Value = serde_json::from_str(content)?;
        if !value.is_object() {
            return Err(serde::de::Error::custom("json root is not an object"));
        }
        serde_json::from_value(value)
    }

    /// Post URLs this document tracks, trimmed, blanks dropped, first
    /// occurrence kept.
    pub fn post_targets(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for item in self.posts.iter().map(item_text) {
            if !item.is_empty() && !out.contains(&item) {
                out.push(item);
            }
        }
        out
    }

    /// Canonical account URLs this document tracks.
    pub fn account_targets(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for item in self.accounts.iter().map(|v| normalize_account(&item_text(v))) {
            if !item.is_empty() && !out.contains(&item) {
                out.push(item);
            }
        }
        out
    }

    /// Targets of the given worker kind.
    pub fn targets(&self, kind: WorkerKind) -> Vec<String> {
        match kind {
            WorkerKind::Posts => self.post_targets(),
            WorkerKind::Accounts => self.account_targets(),
        }
    }

    /// Whether any target of `kind` is listed.
    pub fn has_targets(&self, kind: WorkerKind) -> bool {
        let list = match kind {
            WorkerKind::Posts => &self.posts,
            WorkerKind::Accounts => &self.accounts,
        };
        list.iter().any(|v| !item_text(v).is_empty())
    }

    /// Whether a non-empty stored snapshot exists for the target.
    pub fn has_stats(&self, kind: WorkerKind, id: &str) -> bool {
        let stats = match kind {
            WorkerKind::Posts => &self.stats.posts,
            WorkerKind::Accounts => &self.stats.accounts,
        };
        matches!(stats.get(id), Some(Value::Object(map)) if !map.is_empty())
    }

    /// Append a post to `posts` and `seen_posts` unless already present.
    /// Returns whether anything changed.
    pub fn track_post(&mut self, url: &str) -> bool {
        let mut changed = false;
        for list in [&mut self.seen_posts, &mut self.posts] {
            if !list.iter().any(|v| item_text(v) == url) {
                list.push(Value::String(url.to_string()));
                changed = true;
            }
        }
        changed
    }
}

/// Text of a list entry: strings as is, other scalars in their JSON form.
pub fn item_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.trim().to_string(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn list_or_empty<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<Value>, D::Error> {
    Ok(match Value::deserialize(d)? {
        Value::Array(items) => items,
        _ => Vec::new(),
    })
}

fn object_or_empty<'de, D: Deserializer<'de>>(d: D) -> Result<Map<String, Value>, D::Error> {
    Ok(match Value::deserialize(d)? {
        Value::Object(map) => map,
        _ => Map::new(),
    })
}

fn stats_or_empty<'de, D: Deserializer<'de>>(d: D) -> Result<Stats, D::Error> {
    let value = Value::deserialize(d)?;
    if !value.is_object() {
        return Ok(Stats::default());
    }
    serde_json::from_value(value).map_err(serde::de::Error::custom)
}
