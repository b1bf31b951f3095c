//! Folding account batches into documents.
//!
//! An account snapshot is replaced wholesale on every batch, except for the
//! derived state the coordinator maintains alongside it:
//!
//! - `followers_history`: follower timeline, trimmed to the retention period
//! - `last_post_tracking`: the latest post and the follower count when it was
//!   first seen
//! - `pending_post_history`: earlier posts whose 24h window is still open
//! - `post_history`: finalized hourly follower deltas per post

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use pulsewatch_types::{
    format_timestamp, metric_value, parse_post_time, parse_timestamp_value, Metric, RawSnapshot,
    ACCOUNT_METRICS,
};
use serde_json::{json, Map, Value};

use super::{compute_hourly_from, horizon, EngineSettings, MetricPoint, Timeline, WINDOW_HOURS};
use crate::store::Document;

const FOLLOWERS_HISTORY: &str = "followers_history";
const LAST_POST_TRACKING: &str = "last_post_tracking";
const POST_HISTORY: &str = "post_history";
const PENDING_POST_HISTORY: &str = "pending_post_history";

/// Keys carried over from the previous snapshot on replacement.
pub const PRESERVED_KEYS: &[&str] = &[
    FOLLOWERS_HISTORY,
    LAST_POST_TRACKING,
    POST_HISTORY,
    PENDING_POST_HISTORY,
];

/// Canonical id for an account reference.
///
/// Full http(s) URLs are kept; bare handles (with or without `@`) become
/// profile URLs.
///
/// ```rust
/// use pulsewatch::data::normalize_account;
///
/// assert_eq!(normalize_account("@bob"), "https://www.threads.com/@bob");
/// assert_eq!(normalize_account(" bob "), "https://www.threads.com/@bob");
/// assert_eq!(normalize_account("https://x.test/@bob"), "https://x.test/@bob");
/// assert_eq!(normalize_account("  "), "");
/// ```
pub fn normalize_account(value: &str) -> String {
    let value = value.trim();
    if value.is_empty() {
        return String::new();
    }
    if value.starts_with("http://") || value.starts_with("https://") {
        return value.to_string();
    }
    let handle = value.strip_prefix('@').unwrap_or(value);
    format!("https://www.threads.com/@{handle}")
}

/// Apply an accounts batch to one document.
///
/// Batch keys are canonicalized before matching. `observed_at` is the batch's
/// own timestamp, used for follower points when a snapshot carries no
/// `fetched_at_utc`.
///
/// Returns the number of accounts updated.
pub fn apply_accounts_batch(
    doc: &mut Document,
    stats_by_url: &BTreeMap<String, RawSnapshot>,
    observed_at: Option<DateTime<Utc>>,
    engine: &EngineSettings,
    now: DateTime<Utc>,
) -> Result<usize, serde_json::Error> {
    let canonical: BTreeMap<String, &RawSnapshot> = stats_by_url
        .iter()
        .map(|(key, snapshot)| (normalize_account(key), snapshot))
        .filter(|(key, _)| !key.is_empty())
        .collect();

    let mut updated = 0;
    for account in doc.account_targets() {
        let Some(payload) = canonical.get(&account) else {
            continue;
        };

        let mut snapshot = (*payload).clone();
        if let Some(Value::Object(prev)) = doc.stats.accounts.get(&account) {
            for key in PRESERVED_KEYS {
                if let Some(value) = prev.get(*key) {
                    snapshot.insert(key.to_string(), value.clone());
                }
            }
        }

        let ts = parse_timestamp_value(snapshot.get("fetched_at_utc"))
            .or(observed_at)
            .unwrap_or(now);
        record_followers(&mut snapshot, ts, engine, now)?;
        roll_latest_post(&mut snapshot, now);
        settle_post_windows(&mut snapshot, &account, engine, now)?;

        if auto_add_enabled(doc, &account) {
            if let Some(url) = first_post_url(&snapshot) {
                doc.track_post(&url);
            }
        }

        doc.stats.accounts.insert(account, Value::Object(snapshot));
        updated += 1;
    }
    Ok(updated)
}

fn record_followers(
    snapshot: &mut RawSnapshot,
    ts: DateTime<Utc>,
    engine: &EngineSettings,
    now: DateTime<Utc>,
) -> Result<(), serde_json::Error> {
    let Some(followers) = metric_value(snapshot, Metric::Followers) else {
        return Ok(());
    };
    let mut history = Timeline::from_raw(snapshot.get(FOLLOWERS_HISTORY), ACCOUNT_METRICS);
    let append = match history.last() {
        None => true,
        Some(last) => {
            ts - last.ts >= engine.follower_min_spacing
                || last.value(Metric::Followers) != Some(followers)
        }
    };
    if append {
        history.push(MetricPoint::new(ts, [(Metric::Followers, Some(followers))]));
        history.truncate_before(now - engine.follower_retention);
        snapshot.insert(FOLLOWERS_HISTORY.to_string(), serde_json::to_value(&history)?);
    }
    Ok(())
}

fn url_of(entry: &Value) -> String {
    match entry {
        Value::Object(map) => ["url", "link"]
            .iter()
            .filter_map(|k| map.get(*k).and_then(Value::as_str))
            .map(str::trim)
            .find(|s| !s.is_empty())
            .unwrap_or_default()
            .to_string(),
        Value::String(s) => s.trim().to_string(),
        _ => String::new(),
    }
}

fn first_post_url(snapshot: &RawSnapshot) -> Option<String> {
    snapshot
        .get("posts")?
        .as_array()?
        .iter()
        .map(url_of)
        .find(|url| !url.is_empty())
}

/// Publish time of `url` as listed in the snapshot's recent posts.
fn listed_post_time(snapshot: &RawSnapshot, url: &str) -> Option<DateTime<Utc>> {
    snapshot
        .get("posts")?
        .as_array()?
        .iter()
        .find(|entry| url_of(entry) == url)
        .and_then(|entry| parse_post_time(entry.get("dateTime")))
}

fn str_field<'a>(map: &'a Map<String, Value>, key: &str) -> &'a str {
    map.get(key).and_then(Value::as_str).map(str::trim).unwrap_or("")
}

fn auto_add_enabled(doc: &Document, account: &str) -> bool {
    !matches!(doc.auto_add_latest.get(account), Some(Value::Bool(false)))
}

/// Start tracking a new latest post, parking the previous one as pending.
fn roll_latest_post(snapshot: &mut RawSnapshot, now: DateTime<Utc>) {
    let latest = snapshot.get("latest_post").cloned().unwrap_or(Value::Null);
    let latest_url = url_of(&latest);
    let Some(followers) = metric_value(snapshot, Metric::Followers) else {
        return;
    };
    let previous = match snapshot.get(LAST_POST_TRACKING) {
        Some(Value::Object(map)) => map.clone(),
        _ => Map::new(),
    };
    let prev_url = str_field(&previous, "post_url").to_string();
    if latest_url.is_empty() || latest_url == prev_url {
        return;
    }

    let prev_time = parse_timestamp_value(previous.get("post_time_utc"))
        .or_else(|| listed_post_time(snapshot, &prev_url));
    if let (false, Some(prev_time)) = (prev_url.is_empty(), prev_time) {
        let finished = matches!(
            snapshot.get(POST_HISTORY),
            Some(Value::Object(h)) if h.contains_key(&prev_url)
        );
        let mut pending = match snapshot.get(PENDING_POST_HISTORY) {
            Some(Value::Array(items)) => items.clone(),
            _ => Vec::new(),
        };
        let already_pending = pending
            .iter()
            .any(|p| p.get("post_url").and_then(Value::as_str) == Some(prev_url.as_str()));
        if !finished && !already_pending {
            pending.push(json!({
                "post_url": prev_url,
                "post_time_utc": format_timestamp(prev_time),
                "followers_at_post": previous.get("followers_at_post").cloned().unwrap_or(Value::Null),
            }));
            snapshot.insert(PENDING_POST_HISTORY.to_string(), Value::Array(pending));
        }
    }

    let tracked_time = match &latest {
        Value::Object(map) => parse_post_time(map.get("dateTime")),
        _ => None,
    };
    snapshot.insert(
        LAST_POST_TRACKING.to_string(),
        json!({
            "post_url": latest_url,
            "followers_at_post": followers,
            "ts_utc": format_timestamp(now),
            "post_time_utc": tracked_time.map(format_timestamp).unwrap_or_default(),
        }),
    );
}

/// Write hourly follower deltas for every post whose window has closed.
///
/// An entry already written for the same publish time is left alone, so
/// history trimming can never rewrite a finished window.
fn settle_post_windows(
    snapshot: &mut RawSnapshot,
    account: &str,
    engine: &EngineSettings,
    now: DateTime<Utc>,
) -> Result<(), serde_json::Error> {
    let history = Timeline::from_raw(snapshot.get(FOLLOWERS_HISTORY), ACCOUNT_METRICS);
    let mut post_history = match snapshot.get(POST_HISTORY) {
        Some(Value::Object(map)) => map.clone(),
        _ => Map::new(),
    };
    let mut changed = false;

    let mut settle = |url: &str, post_time: DateTime<Utc>, base: Option<i64>| -> Result<(), serde_json::Error> {
        let post_time_iso = format_timestamp(post_time);
        if let Some(Value::Object(existing)) = post_history.get(url) {
            let same_post = str_field(existing, "post_time_utc") == post_time_iso;
            if same_post && existing.get("hourly").and_then(|h| h.get("24")).is_some() {
                return Ok(());
            }
        }
        let fallback = base.or_else(|| history.first_value(Metric::Followers));
        let rows = compute_hourly_from(
            &history,
            post_time,
            Metric::Followers,
            fallback,
            WINDOW_HOURS,
            &engine.display_zone,
        );
        post_history.insert(
            url.to_string(),
            json!({
                "post_url": url,
                "post_time_utc": post_time_iso,
                "followers_at_post": base,
                "account": account,
                "hourly": { "24": serde_json::to_value(&rows)? },
                "last_updated_utc": format_timestamp(now),
            }),
        );
        changed = true;
        Ok(())
    };

    if let Some(Value::Object(tracking)) = snapshot.get(LAST_POST_TRACKING) {
        let url = str_field(tracking, "post_url");
        let post_time = parse_timestamp_value(tracking.get("post_time_utc"))
            .or_else(|| listed_post_time(snapshot, url));
        if let (false, Some(post_time)) = (url.is_empty(), post_time) {
            if now - post_time >= horizon() {
                let base = tracking.get("followers_at_post").and_then(Value::as_i64);
                settle(url, post_time, base)?;
            }
        }
    }

    let pending = match snapshot.get(PENDING_POST_HISTORY) {
        Some(Value::Array(items)) => items.clone(),
        _ => Vec::new(),
    };
    let mut still_pending = Vec::new();
    for entry in pending {
        let Value::Object(map) = &entry else {
            continue;
        };
        let url = str_field(map, "post_url");
        let Some(post_time) = parse_timestamp_value(map.get("post_time_utc")) else {
            continue;
        };
        if url.is_empty() {
            continue;
        }
        if now - post_time < horizon() {
            still_pending.push(entry.clone());
            continue;
        }
        let base = map.get("followers_at_post").and_then(Value::as_i64);
        settle(url, post_time, base)?;
    }
    drop(settle);

    if changed || snapshot.contains_key(POST_HISTORY) {
        snapshot.insert(POST_HISTORY.to_string(), Value::Object(post_history));
    }
    if snapshot.contains_key(PENDING_POST_HISTORY) {
        snapshot.insert(PENDING_POST_HISTORY.to_string(), Value::Array(still_pending));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap()
    }

    fn iso(ts: DateTime<Utc>) -> String {
        format_timestamp(ts)
    }

    fn batch(key: &str, snapshot: Value) -> BTreeMap<String, RawSnapshot> {
        let mut map = BTreeMap::new();
        if let Value::Object(s) = snapshot {
            map.insert(key.to_string(), s);
        }
        map
    }

    fn apply(doc: &mut Document, stats: &BTreeMap<String, RawSnapshot>, now: DateTime<Utc>) -> usize {
        apply_accounts_batch(doc, stats, None, &EngineSettings::default(), now).unwrap()
    }

    const BOB: &str = "https://www.threads.com/@bob";

    #[test]
    fn replaces_snapshot_but_keeps_derived_state() {
        let mut doc = Document::parse(
            &json!({
                "accounts": ["@bob"],
                "stats": {"accounts": {BOB: {
                    "followers": 1,
                    "nickname": "old",
                    "post_history": {"https://p/0": {"post_url": "https://p/0"}},
                    "pending_post_history": []
                }}}
            })
            .to_string(),
        )
        .unwrap();

        let n = apply(&mut doc, &batch("bob", json!({"nickname": "new"})), t0());
        assert_eq!(n, 1);
        let stored = doc.stats.accounts[BOB].as_object().unwrap();
        assert_eq!(stored["nickname"], json!("new"));
        assert!(stored.get("followers").is_none());
        assert!(stored["post_history"].get("https://p/0").is_some());
        assert!(stored.contains_key(PENDING_POST_HISTORY));
    }

    #[test]
    fn followers_history_spacing_and_retention() {
        let mut doc = Document::parse(r#"{"accounts": ["@bob"]}"#).unwrap();
        let at = |ts: DateTime<Utc>, f: i64| batch(BOB, json!({"followers": f, "fetched_at_utc": iso(ts)}));

        apply(&mut doc, &at(t0(), 100), t0());
        apply(&mut doc, &at(t0() + Duration::minutes(1), 100), t0() + Duration::minutes(1));
        apply(&mut doc, &at(t0() + Duration::minutes(2), 101), t0() + Duration::minutes(2));
        apply(&mut doc, &at(t0() + Duration::minutes(10), 101), t0() + Duration::minutes(10));

        let history = Timeline::from_raw(doc.stats.accounts[BOB].get(FOLLOWERS_HISTORY), ACCOUNT_METRICS);
        let values: Vec<_> = history.points().iter().map(|p| p.value(Metric::Followers)).collect();
        assert_eq!(values, vec![Some(100), Some(101), Some(101)]);

        let later = t0() + Duration::days(9);
        apply(&mut doc, &at(later, 150), later);
        let history = Timeline::from_raw(doc.stats.accounts[BOB].get(FOLLOWERS_HISTORY), ACCOUNT_METRICS);
        assert_eq!(history.len(), 1);
    }

    #[test]
    fn new_latest_post_parks_previous_and_settles_after_24h() {
        let mut doc = Document::parse(r#"{"accounts": ["@bob"], "auto_add_latest": {}}"#).unwrap();
        let post = |url: &str, published: DateTime<Utc>, followers: i64, ts: DateTime<Utc>| {
            batch(
                BOB,
                json!({
                    "followers": followers,
                    "fetched_at_utc": iso(ts),
                    "latest_post": {"url": url, "dateTime": {"raw": iso(published)}},
                    "posts": [{"url": url, "dateTime": {"raw": iso(published)}}]
                }),
            )
        };

        apply(&mut doc, &post("https://p/1", t0(), 100, t0()), t0());
        let tracking = &doc.stats.accounts[BOB][LAST_POST_TRACKING];
        assert_eq!(tracking["post_url"], json!("https://p/1"));
        assert_eq!(tracking["followers_at_post"], json!(100));
        assert_eq!(tracking["post_time_utc"], json!(iso(t0())));
        assert!(doc.post_targets().contains(&"https://p/1".to_string()));

        let t1 = t0() + Duration::minutes(90);
        apply(&mut doc, &post("https://p/2", t1, 130, t1), t1);
        let stored = &doc.stats.accounts[BOB];
        assert_eq!(stored[LAST_POST_TRACKING]["post_url"], json!("https://p/2"));
        assert_eq!(stored[PENDING_POST_HISTORY][0]["post_url"], json!("https://p/1"));
        assert_eq!(doc.post_targets().len(), 2);

        let t2 = t0() + Duration::hours(25);
        apply(&mut doc, &post("https://p/2", t1, 140, t2), t2);
        let stored = &doc.stats.accounts[BOB];
        assert_eq!(stored[PENDING_POST_HISTORY], json!([]));
        let entry = &stored[POST_HISTORY]["https://p/1"];
        assert_eq!(entry["account"], json!(BOB));
        let rows: Vec<crate::data::HourlyRow> =
            serde_json::from_value(entry["hourly"]["24"].clone()).unwrap();
        assert_eq!(rows.len(), 24);
        assert_eq!(rows[1].delta, 30);
        assert_eq!(rows.iter().map(|r| r.delta).sum::<i64>(), 30);

        // The second post's window closes at t1+24h.
        let t3 = t1 + Duration::hours(24);
        apply(&mut doc, &post("https://p/2", t1, 140, t3), t3);
        assert!(doc.stats.accounts[BOB][POST_HISTORY].get("https://p/2").is_some());
    }

    #[test]
    fn auto_add_can_be_disabled() {
        let mut doc =
            Document::parse(&json!({"accounts": ["@bob"], "auto_add_latest": {BOB: false}}).to_string())
                .unwrap();
        apply(&mut doc, &batch(BOB, json!({"posts": ["https://p/7"]})), t0());
        assert!(doc.post_targets().is_empty());
    }

    #[test]
    fn batch_time_used_when_snapshot_has_none() {
        let mut doc = Document::parse(r#"{"accounts": ["bob"]}"#).unwrap();
        let sent = t0() - Duration::minutes(3);
        apply_accounts_batch(
            &mut doc,
            &batch("@bob", json!({"followers": 5})),
            Some(sent),
            &EngineSettings::default(),
            t0(),
        )
        .unwrap();
        let history = Timeline::from_raw(doc.stats.accounts[BOB].get(FOLLOWERS_HISTORY), ACCOUNT_METRICS);
        assert_eq!(history.points()[0].ts, sent);
    }
}
