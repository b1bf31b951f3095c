//! Folding consumed events into the store.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use pulsewatch_types::{EventType, ParserEvent, RawSnapshot};
use tracing::{debug, warn};

use super::EventSink;
use crate::data::{
    apply_accounts_batch, apply_posts_batch, collect_global_tracking, normalize_account,
    EngineSettings,
};
use crate::store::{load_all, update_document, DocumentStore, StoreError};

/// Per-document outcome of one batch.
#[derive(Debug, Default)]
struct Folded {
    updated: usize,
    failed: usize,
    first_error: Option<StoreError>,
}

impl Folded {
    /// Count entities only once the document save has succeeded.
    fn record(&mut self, id: &str, event_type: EventType, result: Result<usize, StoreError>) {
        match result {
            Ok(n) => self.updated += n,
            Err(e) => {
                warn!(doc = %id, kind = %event_type, error = %e, "batch not applied to document");
                self.failed += 1;
                self.first_error.get_or_insert(e);
            }
        }
    }
}

/// Applies batches to every document that tracks their entities.
#[derive(Debug, Clone)]
pub struct Applier {
    store: Arc<dyn DocumentStore>,
    engine: EngineSettings,
}

impl Applier {
    pub fn new(store: Arc<dyn DocumentStore>, engine: EngineSettings) -> Self {
        Self { store, engine }
    }

    fn apply_posts(
        &self,
        stats: &BTreeMap<String, RawSnapshot>,
        now: DateTime<Utc>,
    ) -> Result<Folded, StoreError> {
        let docs = load_all(self.store.as_ref())?;
        let mut global = collect_global_tracking(docs.iter().map(|(_, doc)| doc));

        let mut folded = Folded::default();
        for (id, doc) in &docs {
            if !doc.post_targets().iter().any(|url| stats.contains_key(url)) {
                continue;
            }
            let mut applied = 0;
            let result = update_document(self.store.as_ref(), id, |doc| {
                applied = apply_posts_batch(doc, stats, &mut global, &self.engine, now)?;
                Ok(applied > 0)
            })
            .map(|_| applied);
            folded.record(id, EventType::PostsStatsBatch, result);
        }
        Ok(folded)
    }

    fn apply_accounts(
        &self,
        stats: &BTreeMap<String, RawSnapshot>,
        observed_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<Folded, StoreError> {
        let wanted: Vec<String> = stats.keys().map(|k| normalize_account(k)).collect();
        let docs = load_all(self.store.as_ref())?;

        let mut folded = Folded::default();
        for (id, doc) in &docs {
            if !doc.account_targets().iter().any(|a| wanted.contains(a)) {
                continue;
            }
            let mut applied = 0;
            let result = update_document(self.store.as_ref(), id, |doc| {
                applied = apply_accounts_batch(doc, stats, observed_at, &self.engine, now)?;
                Ok(applied > 0)
            })
            .map(|_| applied);
            folded.record(id, EventType::AccountsStatsBatch, result);
        }
        Ok(folded)
    }
}

impl EventSink for Applier {
    fn apply(&self, event: &ParserEvent, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let folded = match event.event_type {
            EventType::PostsStatsBatch => self.apply_posts(&event.stats_by_url, now)?,
            EventType::AccountsStatsBatch => {
                self.apply_accounts(&event.stats_by_url, event.observed_at(), now)?
            }
        };
        debug!(
            kind = %event.event_type,
            updated = folded.updated,
            failed = folded.failed,
            "batch folded into store"
        );
        folded.first_error.map_or(Ok(folded.updated), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::TrackingWindow;
    use crate::store::{Document, FileStore};
    use chrono::TimeZone;
    use pulsewatch_types::POST_METRICS;
    use serde_json::json;
    use tempfile::TempDir;

    fn setup(docs: &[(&str, serde_json::Value)]) -> (TempDir, Arc<FileStore>, Applier) {
        let dir = TempDir::new().unwrap();
        for (id, doc) in docs {
            std::fs::write(dir.path().join(format!("{id}.json")), doc.to_string()).unwrap();
        }
        let store = Arc::new(FileStore::new(dir.path()));
        let applier = Applier::new(store.clone(), EngineSettings::default());
        (dir, store, applier)
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap()
    }

    #[test]
    fn posts_reach_every_owner() {
        let (_dir, store, applier) = setup(&[
            ("alice", json!({"posts": ["https://p/1"]})),
            ("bob", json!({"posts": ["https://p/1", "https://p/2"]})),
            ("carol", json!({"posts": ["https://p/3"], "theme": "dark"})),
        ]);
        let carol_before = std::fs::read_to_string(store.path_for("carol")).unwrap();

        let event = ParserEvent::new(EventType::PostsStatsBatch).with_snapshot(
            "https://p/1",
            json!({"views": 4, "fetched_at_utc": "2024-05-01T10:00:00Z"}),
        );
        assert_eq!(applier.apply(&event, t0()).unwrap(), 2);

        for id in ["alice", "bob"] {
            let doc = store.load(id).unwrap();
            let window = TrackingWindow::from_raw(
                doc.stats.posts["https://p/1"].get("tracking"),
                POST_METRICS,
            );
            assert_eq!(window.started_at, Some(t0()));
        }
        assert_eq!(
            std::fs::read_to_string(store.path_for("carol")).unwrap(),
            carol_before
        );
    }

    #[test]
    fn accounts_match_canonical_handles() {
        let (_dir, store, applier) = setup(&[("alice", json!({"accounts": ["@bob"]}))]);
        let event = ParserEvent::new(EventType::AccountsStatsBatch)
            .with_snapshot("https://www.threads.com/@bob", json!({"followers": 12}));
        assert_eq!(applier.apply(&event, t0()).unwrap(), 1);

        let doc = store.load("alice").unwrap();
        let stored = &doc.stats.accounts["https://www.threads.com/@bob"];
        assert_eq!(stored["followers"], json!(12));
        assert_eq!(stored["followers_history"][0]["followers"], json!(12));
    }

    #[test]
    fn unreadable_documents_do_not_block_others() {
        let (dir, store, applier) = setup(&[("alice", json!({"posts": ["https://p/1"]}))]);
        std::fs::write(dir.path().join("broken.json"), "{").unwrap();
        let event = ParserEvent::new(EventType::PostsStatsBatch)
            .with_snapshot("https://p/1", json!({"views": 1}));
        assert_eq!(applier.apply(&event, t0()).unwrap(), 1);
        assert!(store.load("alice").unwrap().stats.posts.contains_key("https://p/1"));
    }

    /// File store whose saves fail for one document.
    #[derive(Debug)]
    struct ReadOnlyDoc {
        inner: FileStore,
        read_only: &'static str,
    }

    impl DocumentStore for ReadOnlyDoc {
        fn list(&self) -> Result<Vec<String>, StoreError> {
            self.inner.list()
        }

        fn load(&self, id: &str) -> Result<Document, StoreError> {
            self.inner.load(id)
        }

        fn save(&self, id: &str, doc: &Document) -> Result<(), StoreError> {
            if id == self.read_only {
                let denied = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only");
                return Err(StoreError::io(self.inner.path_for(id), denied));
            }
            self.inner.save(id, doc)
        }

        fn with_lock(
            &self,
            id: &str,
            f: &mut dyn FnMut() -> Result<(), StoreError>,
        ) -> Result<(), StoreError> {
            self.inner.with_lock(id, f)
        }
    }

    #[test]
    fn failed_save_is_not_counted() {
        let (dir, _store, _) = setup(&[
            ("alice", json!({"posts": ["https://p/1"]})),
            ("bob", json!({"posts": ["https://p/1"]})),
        ]);
        let store = Arc::new(ReadOnlyDoc {
            inner: FileStore::new(dir.path()),
            read_only: "bob",
        });
        let applier = Applier::new(store.clone(), EngineSettings::default());
        let mut stats = BTreeMap::new();
        stats.insert(
            "https://p/1".to_string(),
            json!({"views": 3}).as_object().unwrap().clone(),
        );

        let folded = applier.apply_posts(&stats, t0()).unwrap();
        assert_eq!(folded.updated, 1);
        assert_eq!(folded.failed, 1);
        assert_eq!(folded.first_error.as_ref().map(StoreError::kind), Some("IoError"));
        assert!(store.load("alice").unwrap().stats.posts.contains_key("https://p/1"));
        assert!(store.load("bob").unwrap().stats.posts.is_empty());

        let event = ParserEvent::new(EventType::PostsStatsBatch)
            .with_snapshot("https://p/1", json!({"views": 4}));
        assert!(applier.apply(&event, t0()).is_err());
    }
}
