//! Folding post batches into documents.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use pulsewatch_types::{parse_timestamp_value, RawSnapshot, POST_METRICS};
use serde_json::Value;

use super::{EngineSettings, MetricPoint, TrackingWindow};
use crate::store::Document;

/// Key under which a post's window is stored inside its snapshot.
pub const TRACKING_KEY: &str = "tracking";

fn stored_window(doc: &Document, url: &str) -> TrackingWindow {
    let raw = doc
        .stats
        .posts
        .get(url)
        .and_then(|snapshot| snapshot.get(TRACKING_KEY));
    TrackingWindow::from_raw(raw, POST_METRICS)
}

/// Reconcile every document's view of each post into one window per URL.
///
/// The same post may be tracked by several users; their windows converge on
/// the earliest start and the union of observations.
pub fn collect_global_tracking<'a>(
    docs: impl IntoIterator<Item = &'a Document>,
) -> BTreeMap<String, TrackingWindow> {
    let mut global: BTreeMap<String, TrackingWindow> = BTreeMap::new();
    for doc in docs {
        for url in doc.stats.posts.keys() {
            let window = stored_window(doc, url);
            if window.is_empty() {
                continue;
            }
            let merged = match global.get(url) {
                Some(prev) => prev.merge(&window),
                None => window,
            };
            global.insert(url.clone(), merged);
        }
    }
    global
}

/// Apply a posts batch to one document.
///
/// For every post the document tracks that appears in the batch, the stored
/// snapshot is replaced and its window is advanced: merged with the global
/// view, extended by the new observation, cut at the horizon, and rebucketed.
/// `global` is updated as we go so later documents see this one's result.
///
/// Returns the number of posts updated.
pub fn apply_posts_batch(
    doc: &mut Document,
    stats_by_url: &BTreeMap<String, RawSnapshot>,
    global: &mut BTreeMap<String, TrackingWindow>,
    engine: &EngineSettings,
    now: DateTime<Utc>,
) -> Result<usize, serde_json::Error> {
    let mut updated = 0;
    for url in doc.post_targets() {
        let Some(snapshot) = stats_by_url.get(&url) else {
            continue;
        };

        let mut window = stored_window(doc, &url);
        if let Some(shared) = global.get(&url) {
            window = window.merge(shared);
        }

        let observed = parse_timestamp_value(snapshot.get("fetched_at_utc")).unwrap_or(now);
        if window.started_at.is_none() {
            window.started_at = Some(observed);
        }
        window
            .timeline
            .push(MetricPoint::from_snapshot(observed, snapshot, POST_METRICS));
        window.apply_horizon();
        window.update_history(now, POST_METRICS, &engine.display_zone);

        let mut stored = snapshot.clone();
        stored.insert(TRACKING_KEY.to_string(), serde_json::to_value(&window)?);
        doc.stats.posts.insert(url.clone(), Value::Object(stored));

        let converged = match global.get(&url) {
            Some(shared) => shared.merge(&window),
            None => window,
        };
        global.insert(url, converged);
        updated += 1;
    }
    Ok(updated)
}
