//! Tracked metric names.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A named engagement metric carried by a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    Views,
    Likes,
    Comments,
    Repost,
    Shared,
    Followers,
}

/// Metrics tracked for posts, in display order.
pub const POST_METRICS: &[Metric] = &[
    Metric::Views,
    Metric::Likes,
    Metric::Comments,
    Metric::Repost,
    Metric::Shared,
];

/// Metrics tracked for accounts.
pub const ACCOUNT_METRICS: &[Metric] = &[Metric::Followers];

impl Metric {
    /// The JSON key this metric is stored under.
    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::Views => "views",
            Metric::Likes => "likes",
            Metric::Comments => "comments",
            Metric::Repost => "repost",
            Metric::Shared => "shared",
            Metric::Followers => "followers",
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Metric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "views" => Ok(Metric::Views),
            "likes" => Ok(Metric::Likes),
            "comments" => Ok(Metric::Comments),
            "repost" => Ok(Metric::Repost),
            "shared" => Ok(Metric::Shared),
            "followers" => Ok(Metric::Followers),
            other => Err(format!("unknown metric: {other}")),
        }
    }
}

/// Read a metric value from a raw JSON object.
///
/// Only integers count; floats, strings, and nulls are unknown.
pub fn metric_value(raw: &serde_json::Map<String, serde_json::Value>, metric: Metric) -> Option<i64> {
    raw.get(metric.as_str()).and_then(|v| v.as_i64())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn keys_match_serde_names() {
        for metric in POST_METRICS.iter().chain(ACCOUNT_METRICS) {
            let encoded = serde_json::to_value(metric).unwrap();
            assert_eq!(encoded, json!(metric.as_str()));
            assert_eq!(metric.as_str().parse::<Metric>().unwrap(), *metric);
        }
    }

    #[test]
    fn only_integers_are_values() {
        let raw = json!({"views": 12, "likes": "3", "comments": 1.5, "repost": null});
        let raw = raw.as_object().unwrap();
        assert_eq!(metric_value(raw, Metric::Views), Some(12));
        assert_eq!(metric_value(raw, Metric::Likes), None);
        assert_eq!(metric_value(raw, Metric::Comments), None);
        assert_eq!(metric_value(raw, Metric::Repost), None);
        assert_eq!(metric_value(raw, Metric::Shared), None);
    }
}
