//! 24-hour tracking windows and hourly bucketing.

use std::cmp::Reverse;
use std::collections::BTreeMap;

use chrono::{DateTime, Duration, FixedOffset, Utc};
use pulsewatch_types::{format_hour_range, lenient, parse_timestamp_value, Metric};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::timeline::Timeline;

/// Number of hourly buckets in a window.
pub const WINDOW_HOURS: u32 = 24;

/// Length of a tracking window.
pub fn horizon() -> Duration {
    Duration::hours(WINDOW_HOURS as i64)
}

/// One hourly bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HourlyRow {
    pub hour: u32,
    pub range: String,
    pub delta: i64,
}

/// Hourly deltas over a window, per metric.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct History24h {
    #[serde(default, with = "lenient")]
    pub start_ts_utc: Option<DateTime<Utc>>,

    #[serde(default)]
    pub ready_hours: u32,

    #[serde(default)]
    pub finalized: bool,

    #[serde(default, with = "lenient")]
    pub updated_at_utc: Option<DateTime<Utc>>,

    #[serde(default)]
    pub metrics: BTreeMap<Metric, Vec<HourlyRow>>,

    #[serde(default, with = "lenient", skip_serializing_if = "Option::is_none")]
    pub completed_at_utc: Option<DateTime<Utc>>,
}

/// Hourly deltas of `metric` for the 24 hours following `start`.
///
/// The sample for hour `h` is the last known value at or before
/// `start + h hours`, carrying the previous hour forward when nothing new was
/// observed. The baseline is the last value at or before `start`, or zero.
pub fn compute_hourly(
    timeline: &Timeline,
    start: DateTime<Utc>,
    metric: Metric,
    zone: &FixedOffset,
) -> Vec<HourlyRow> {
    compute_hourly_from(timeline, start, metric, None, WINDOW_HOURS, zone)
}

/// [`compute_hourly`] with a fallback baseline used when nothing was observed
/// at or before `start`.
pub fn compute_hourly_from(
    timeline: &Timeline,
    start: DateTime<Utc>,
    metric: Metric,
    fallback_base: Option<i64>,
    hours: u32,
    zone: &FixedOffset,
) -> Vec<HourlyRow> {
    let mut prev = timeline
        .value_at(start, metric)
        .or(fallback_base)
        .unwrap_or(0);

    (1..=hours)
        .map(|hour| {
            let end = start + Duration::hours(hour as i64);
            let value = timeline.value_at(end, metric).unwrap_or(prev);
            let row = HourlyRow {
                hour,
                range: format_hour_range(end - Duration::hours(1), end, zone),
                delta: value - prev,
            };
            prev = value;
            row
        })
        .collect()
}

/// Whole hours elapsed since `start`, clamped to `0..=24`.
pub fn ready_hours(start: DateTime<Utc>, now: DateTime<Utc>) -> u32 {
    (now - start)
        .num_seconds()
        .div_euclid(3600)
        .clamp(0, WINDOW_HOURS as i64) as u32
}

/// A 24-hour observation window for one entity.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TrackingWindow {
    #[serde(
        rename = "started_at_utc",
        with = "lenient",
        skip_serializing_if = "Option::is_none"
    )]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Timeline::is_empty")]
    pub timeline: Timeline,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub history_24h: Option<History24h>,
}

/// Ordering key for reconciling windows; lower is better.
///
/// Earliest start first (unknown start last), then finalized, then the longer
/// timeline, then the further-along history.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct WindowRank {
    start_unknown: bool,
    start: Option<DateTime<Utc>>,
    finalized: Reverse<bool>,
    timeline_len: Reverse<usize>,
    ready_hours: Reverse<u32>,
    updated_at: Reverse<Option<DateTime<Utc>>>,
}

impl TrackingWindow {
    /// Read a persisted window. Every part is optional; garbage reads as
    /// absent rather than failing the whole window.
    pub fn from_raw(raw: Option<&Value>, metrics: &[Metric]) -> Self {
        let Some(Value::Object(map)) = raw else {
            return Self::default();
        };
        Self {
            started_at: parse_timestamp_value(map.get("started_at_utc")),
            timeline: Timeline::from_raw(map.get("timeline"), metrics),
            history_24h: map
                .get("history_24h")
                .filter(|h| h.is_object())
                .and_then(|h| serde_json::from_value(h.clone()).ok()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.started_at.is_none() && self.timeline.is_empty() && self.history_24h.is_none()
    }

    pub fn is_finalized(&self) -> bool {
        self.history_24h.as_ref().is_some_and(|h| h.finalized)
    }

    pub fn rank(&self) -> WindowRank {
        let history = self.history_24h.as_ref();
        WindowRank {
            start_unknown: self.started_at.is_none(),
            start: self.started_at,
            finalized: Reverse(self.is_finalized()),
            timeline_len: Reverse(self.timeline.len()),
            ready_hours: Reverse(history.map_or(0, |h| h.ready_hours)),
            updated_at: Reverse(history.and_then(|h| h.updated_at_utc)),
        }
    }

    /// Reconcile two views of the same entity's window.
    ///
    /// The result starts at the earlier start, holds the union of both
    /// timelines, and keeps the history of the better-ranked window (`self`
    /// on ties).
    pub fn merge(&self, other: &TrackingWindow) -> TrackingWindow {
        let started_at = match (self.started_at, other.started_at) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        let history_24h = if other.rank() < self.rank() {
            other.history_24h.clone()
        } else {
            self.history_24h.clone()
        };
        TrackingWindow {
            started_at,
            timeline: self.timeline.merge(&other.timeline),
            history_24h,
        }
    }

    /// Drop points beyond `start + 24h`. Without a start only the (already
    /// normalized) timeline is kept as is.
    pub fn apply_horizon(&mut self) {
        if let Some(start) = self.started_at {
            self.timeline.truncate_after(start + horizon());
        }
    }

    /// Recompute hourly rows for the hours that have fully elapsed.
    ///
    /// A window without a start is skipped, and a finalized window for the
    /// same start is left as is. Returns whether the history changed.
    pub fn update_history(
        &mut self,
        now: DateTime<Utc>,
        metrics: &[Metric],
        zone: &FixedOffset,
    ) -> bool {
        let Some(start) = self.started_at else {
            return false;
        };
        let previous = self
            .history_24h
            .as_ref()
            .filter(|h| h.start_ts_utc == Some(start));
        if previous.is_some_and(|h| h.finalized) {
            return false;
        }

        let ready = ready_hours(start, now).max(previous.map_or(0, |h| h.ready_hours.min(WINDOW_HOURS)));
        let metrics = metrics
            .iter()
            .map(|metric| {
                let mut rows = compute_hourly(&self.timeline, start, *metric, zone);
                rows.truncate(ready as usize);
                (*metric, rows)
            })
            .collect();
        let finalized = ready >= WINDOW_HOURS;

        self.history_24h = Some(History24h {
            start_ts_utc: Some(start),
            ready_hours: ready,
            finalized,
            updated_at_utc: Some(now),
            metrics,
            completed_at_utc: finalized.then(|| start + horizon()),
        });
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::MetricPoint;
    use chrono::TimeZone;
    use proptest::prelude::*;
    use pulsewatch_types::{msk, POST_METRICS};
    use serde_json::json;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap()
    }

    fn views_timeline(points: &[(i64, i64)]) -> Timeline {
        Timeline::normalize(points.iter().map(|(minutes, v)| {
            MetricPoint::new(t0() + Duration::minutes(*minutes), [(Metric::Views, Some(*v))])
        }))
    }

    fn window(points: &[(i64, i64)]) -> TrackingWindow {
        TrackingWindow {
            started_at: Some(t0()),
            timeline: views_timeline(points),
            history_24h: None,
        }
    }

    #[test]
    fn hourly_samples_carry_forward() {
        let timeline = views_timeline(&[(0, 10), (70, 20), (130, 35)]);
        let rows = compute_hourly(&timeline, t0(), Metric::Views, &msk());

        assert_eq!(rows.len(), 24);
        // Nothing new by t0+1h; t0+70m lands in hour 2; t0+130m in hour 3.
        assert_eq!(rows[0].delta, 0);
        assert_eq!(rows[1].hour, 2);
        assert_eq!(rows[1].delta, 20 - 10);
        assert_eq!(rows[2].hour, 3);
        assert_eq!(rows[2].delta, 35 - 20);
        assert!(rows[3..].iter().all(|r| r.delta == 0));
        assert_eq!(rows.iter().map(|r| r.delta).sum::<i64>(), 25);
    }

    #[test]
    fn hourly_labels_are_display_zone_ranges() {
        let rows = compute_hourly(&Timeline::default(), t0(), Metric::Views, &msk());
        assert_eq!(rows[0].range, "13:00–14:00");
        assert_eq!(rows[23].range, "12:00–13:00");
    }

    #[test]
    fn hourly_baseline_defaults_to_zero() {
        let timeline = views_timeline(&[(30, 7)]);
        let rows = compute_hourly(&timeline, t0(), Metric::Views, &msk());
        assert_eq!(rows[0].delta, 7);

        let rows = compute_hourly_from(&timeline, t0(), Metric::Views, Some(5), 24, &msk());
        assert_eq!(rows[0].delta, 2);
    }

    #[test]
    fn ready_hours_clamped() {
        assert_eq!(ready_hours(t0(), t0() - Duration::hours(2)), 0);
        assert_eq!(ready_hours(t0(), t0() + Duration::minutes(59)), 0);
        assert_eq!(ready_hours(t0(), t0() + Duration::minutes(61)), 1);
        assert_eq!(ready_hours(t0(), t0() + Duration::days(9)), 24);
    }

    #[test]
    fn history_partial_then_finalized_then_frozen() {
        let mut w = window(&[(0, 10), (70, 20), (130, 35)]);

        assert!(w.update_history(t0() + Duration::minutes(150), POST_METRICS, &msk()));
        let partial = w.history_24h.clone().unwrap();
        assert_eq!(partial.ready_hours, 2);
        assert!(!partial.finalized);
        assert!(partial.completed_at_utc.is_none());
        assert_eq!(partial.metrics[&Metric::Views].len(), 2);
        assert_eq!(partial.metrics[&Metric::Likes].len(), 2);

        let now = t0() + Duration::hours(24) + Duration::seconds(1);
        assert!(w.update_history(now, POST_METRICS, &msk()));
        let done = w.history_24h.clone().unwrap();
        assert_eq!(done.ready_hours, 24);
        assert!(done.finalized);
        assert_eq!(done.completed_at_utc, Some(t0() + Duration::hours(24)));
        assert_eq!(done.metrics[&Metric::Views].len(), 24);

        assert!(!w.update_history(now + Duration::days(3), POST_METRICS, &msk()));
        assert_eq!(w.history_24h.as_ref(), Some(&done));
    }

    #[test]
    fn history_skipped_without_start() {
        let mut w = window(&[(0, 1)]);
        w.started_at = None;
        assert!(!w.update_history(t0() + Duration::hours(3), POST_METRICS, &msk()));
        assert!(w.history_24h.is_none());
    }

    #[test]
    fn ready_hours_never_decrease() {
        let mut w = window(&[(0, 1)]);
        w.update_history(t0() + Duration::hours(5), POST_METRICS, &msk());
        w.update_history(t0() + Duration::hours(3), POST_METRICS, &msk());
        assert_eq!(w.history_24h.unwrap().ready_hours, 5);
    }

    #[test]
    fn horizon_drops_late_points() {
        let mut w = window(&[(0, 1), (24 * 60, 2), (24 * 60 + 1, 3)]);
        w.apply_horizon();
        assert_eq!(w.timeline.len(), 2);

        let mut unstarted = window(&[(0, 1), (5000, 2)]);
        unstarted.started_at = None;
        unstarted.apply_horizon();
        assert_eq!(unstarted.timeline.len(), 2);
    }

    #[test]
    fn merge_takes_earliest_start_and_union() {
        let mut a = window(&[(0, 1), (60, 2)]);
        let mut b = window(&[(60, 2), (120, 3)]);
        b.started_at = Some(t0() - Duration::minutes(5));
        a.update_history(t0() + Duration::hours(2), POST_METRICS, &msk());

        let merged = a.merge(&b);
        assert_eq!(merged.started_at, b.started_at);
        assert_eq!(merged.timeline.len(), 3);
        // b starts earlier, so its (absent) history wins.
        assert!(merged.history_24h.is_none());
    }

    #[test]
    fn merge_prefers_finalized_history_on_equal_start() {
        let mut finalized = window(&[(0, 1)]);
        finalized.update_history(t0() + Duration::hours(25), POST_METRICS, &msk());
        let mut partial = window(&[(0, 1), (30, 2), (90, 3)]);
        partial.update_history(t0() + Duration::hours(2), POST_METRICS, &msk());

        assert!(partial.merge(&finalized).is_finalized());
        assert!(finalized.merge(&partial).is_finalized());
    }

    struct Candidate {
        start: Option<i64>,
        finalized: bool,
        len: i64,
        ready: u32,
        updated: i64,
    }

    const BASE: Candidate = Candidate {
        start: Some(0),
        finalized: false,
        len: 2,
        ready: 3,
        updated: 180,
    };

    /// `tag` only marks whose history survives; it is not a rank key.
    fn candidate(c: &Candidate, tag: i64) -> TrackingWindow {
        let points: Vec<(i64, i64)> = (0..c.len).map(|i| (i * 10, i)).collect();
        TrackingWindow {
            started_at: c.start.map(|m| t0() + Duration::minutes(m)),
            timeline: views_timeline(&points),
            history_24h: Some(History24h {
                start_ts_utc: Some(t0()),
                ready_hours: c.ready,
                finalized: c.finalized,
                updated_at_utc: Some(t0() + Duration::minutes(c.updated)),
                metrics: BTreeMap::new(),
                completed_at_utc: Some(t0() + Duration::days(tag)),
            }),
        }
    }

    #[test]
    fn rank_keys_decide_surviving_history() {
        // (case, self, other, other wins)
        let cases = [
            ("tie keeps self", BASE, BASE, false),
            ("earlier start", BASE, Candidate { start: Some(-10), ..BASE }, true),
            ("later start", BASE, Candidate { start: Some(10), ..BASE }, false),
            ("unknown start ranks last", Candidate { start: None, ..BASE }, BASE, true),
            ("unknown other start", BASE, Candidate { start: None, len: 9, ..BASE }, false),
            ("finalized", BASE, Candidate { finalized: true, ..BASE }, true),
            ("longer timeline", BASE, Candidate { len: 5, ..BASE }, true),
            ("shorter timeline", BASE, Candidate { len: 1, ..BASE }, false),
            ("more ready hours", BASE, Candidate { ready: 7, ..BASE }, true),
            ("fewer ready hours", BASE, Candidate { ready: 1, ..BASE }, false),
            ("updated later", BASE, Candidate { updated: 240, ..BASE }, true),
            ("updated earlier", BASE, Candidate { updated: 60, ..BASE }, false),
            (
                "finalized outranks longer timeline",
                Candidate { len: 9, ..BASE },
                Candidate { finalized: true, ..BASE },
                true,
            ),
        ];

        for (name, this, other, other_wins) in &cases {
            let a = candidate(this, 1);
            let b = candidate(other, 2);
            let merged = a.merge(&b);
            let expected = if *other_wins { &b } else { &a };
            assert_eq!(merged.history_24h, expected.history_24h, "{name}");
        }
    }

    #[test]
    fn round_trips_through_json() {
        let mut w = window(&[(0, 10), (70, 20)]);
        w.update_history(t0() + Duration::hours(3), POST_METRICS, &msk());
        let encoded = serde_json::to_value(&w).unwrap();
        assert_eq!(encoded["started_at_utc"], json!("2024-05-01T10:00:00+00:00"));
        assert_eq!(encoded["history_24h"]["ready_hours"], json!(3));
        assert_eq!(encoded["history_24h"]["metrics"]["views"][1]["delta"], json!(10));
        assert!(encoded["history_24h"].get("completed_at_utc").is_none());

        let decoded = TrackingWindow::from_raw(Some(&encoded), POST_METRICS);
        assert_eq!(decoded.started_at, w.started_at);
        assert_eq!(decoded.history_24h, w.history_24h);
        assert_eq!(decoded.timeline.len(), w.timeline.len());
    }

    #[test]
    fn from_raw_tolerates_garbage() {
        let w = TrackingWindow::from_raw(
            Some(&json!({"started_at_utc": 5, "timeline": "x", "history_24h": [1]})),
            POST_METRICS,
        );
        assert!(w.is_empty());
        assert!(TrackingWindow::from_raw(Some(&json!(null)), POST_METRICS).is_empty());
    }

    proptest! {
        #[test]
        fn ready_hours_bounded_and_monotone(a in 0i64..200_000, b in 0i64..200_000) {
            let (early, late) = (a.min(b), a.max(b));
            let r1 = ready_hours(t0(), t0() + Duration::seconds(early));
            let r2 = ready_hours(t0(), t0() + Duration::seconds(late));
            prop_assert!(r1 <= r2);
            prop_assert!(r2 <= WINDOW_HOURS);
        }

        #[test]
        fn horizon_never_keeps_late_points(minutes in prop::collection::vec(0i64..4000, 0..20)) {
            let points: Vec<(i64, i64)> = minutes.iter().map(|m| (*m, *m)).collect();
            let mut w = window(&points);
            w.apply_horizon();
            prop_assert!(w.timeline.points().iter().all(|p| p.ts <= t0() + horizon()));
        }
    }
}
