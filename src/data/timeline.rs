//! Metric points and timelines.
//!
//! A [`Timeline`] is always normalized: strictly increasing, unique
//! timestamps. Merging is a join over points keyed by timestamp, so it is
//! commutative, associative, and idempotent; replaying or reordering the same
//! snapshots can never change the result.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use pulsewatch_types::{format_timestamp, metric_value, parse_timestamp_value, Metric};
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use serde_json::Value;

/// One observation of an entity.
///
/// A metric is `None` when the snapshot did not carry it as an integer; it is
/// never coerced to zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricPoint {
    pub ts: DateTime<Utc>,
    pub values: BTreeMap<Metric, Option<i64>>,
}

impl MetricPoint {
    /// Build a point from explicit values.
    pub fn new(ts: DateTime<Utc>, values: impl IntoIterator<Item = (Metric, Option<i64>)>) -> Self {
        Self {
            ts,
            values: values.into_iter().collect(),
        }
    }

    /// Normalize a raw point.
    ///
    /// The timestamp is read from `ts_utc`. Returns `None` when it is missing
    /// or unparsable. Only `metrics` are retained.
    pub fn from_raw(raw: &Value, metrics: &[Metric]) -> Option<Self> {
        let map = raw.as_object()?;
        let ts = parse_timestamp_value(map.get("ts_utc"))?;
        Some(Self::from_snapshot(ts, map, metrics))
    }

    /// A point stamped `ts` carrying `metrics` read out of a raw snapshot.
    pub fn from_snapshot(
        ts: DateTime<Utc>,
        snapshot: &serde_json::Map<String, Value>,
        metrics: &[Metric],
    ) -> Self {
        Self {
            ts,
            values: metrics
                .iter()
                .map(|m| (*m, metric_value(snapshot, *m)))
                .collect(),
        }
    }

    pub fn value(&self, metric: Metric) -> Option<i64> {
        self.values.get(&metric).copied().flatten()
    }

    /// Join two observations made at the same instant.
    ///
    /// A known value beats an unknown one; two known values resolve to the
    /// larger, which keeps the join independent of argument order.
    fn join(&mut self, other: &MetricPoint) {
        for (metric, value) in &other.values {
            let slot = self.values.entry(*metric).or_insert(None);
            *slot = match (*slot, *value) {
                (Some(a), Some(b)) => Some(a.max(b)),
                (a, b) => a.or(b),
            };
        }
    }
}

impl Serialize for MetricPoint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.values.len() + 1))?;
        map.serialize_entry("ts_utc", &format_timestamp(self.ts))?;
        for (metric, value) in &self.values {
            map.serialize_entry(metric.as_str(), value)?;
        }
        map.end()
    }
}

/// Deduplicated, time-ordered observations for one entity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Timeline(Vec<MetricPoint>);

impl Timeline {
    /// Normalize a sequence of points: dedup by timestamp (the last point for
    /// a timestamp wins) and sort ascending.
    pub fn normalize(points: impl IntoIterator<Item = MetricPoint>) -> Self {
        let mut bucket: BTreeMap<DateTime<Utc>, MetricPoint> = BTreeMap::new();
        for point in points {
            bucket.insert(point.ts, point);
        }
        Self(bucket.into_values().collect())
    }

    /// Normalize a raw JSON list. Non-lists yield an empty timeline and
    /// unparsable entries are dropped individually.
    pub fn from_raw(raw: Option<&Value>, metrics: &[Metric]) -> Self {
        match raw {
            Some(Value::Array(items)) => {
                Self::normalize(items.iter().filter_map(|p| MetricPoint::from_raw(p, metrics)))
            }
            _ => Self::default(),
        }
    }

    /// Union of two timelines.
    pub fn merge(&self, other: &Timeline) -> Timeline {
        let mut bucket: BTreeMap<DateTime<Utc>, MetricPoint> =
            self.0.iter().map(|p| (p.ts, p.clone())).collect();
        for point in &other.0 {
            bucket
                .entry(point.ts)
                .and_modify(|existing| existing.join(point))
                .or_insert_with(|| point.clone());
        }
        Self(bucket.into_values().collect())
    }

    /// Add one observation.
    pub fn push(&mut self, point: MetricPoint) {
        *self = self.merge(&Timeline(vec![point]));
    }

    /// Drop every point later than `horizon`.
    pub fn truncate_after(&mut self, horizon: DateTime<Utc>) {
        self.0.retain(|p| p.ts <= horizon);
    }

    /// Drop every point earlier than `cutoff`.
    pub fn truncate_before(&mut self, cutoff: DateTime<Utc>) {
        self.0.retain(|p| p.ts >= cutoff);
    }

    /// Last known value of `metric` at or before `target`.
    pub fn value_at(&self, target: DateTime<Utc>, metric: Metric) -> Option<i64> {
        self.0
            .iter()
            .take_while(|p| p.ts <= target)
            .filter_map(|p| p.value(metric))
            .last()
    }

    /// First known value of `metric` anywhere in the timeline.
    pub fn first_value(&self, metric: Metric) -> Option<i64> {
        self.0.iter().find_map(|p| p.value(metric))
    }

    pub fn points(&self) -> &[MetricPoint] {
        &self.0
    }

    pub fn last(&self) -> Option<&MetricPoint> {
        self.0.last()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
