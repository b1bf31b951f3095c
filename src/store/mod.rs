//! Per-user document storage.
//!
//! The coordinator is the single writer of stats into user documents. Stores
//! implement [`DocumentStore`]; the filesystem implementation keeps one JSON
//! file per user under a data directory.

mod document;
mod file;
mod lock;
mod recovery;

pub use document::{item_text, Document, Stats};
pub use file::FileStore;
pub use lock::{DocumentLocks, FileLock, InstanceLock};
pub use recovery::{backup_once, spawn_backup_loop, validate_on_startup, BackupHandle, ValidationReport};

use std::fmt::Debug;
use std::path::PathBuf;

use pulsewatch_types::WorkerKind;
use thiserror::Error;
use tracing::warn;

/// Errors from document storage.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid document {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("document not found: {0}")]
    NotFound(String),

    #[error("failed to encode stats: {0}")]
    Encode(#[from] serde_json::Error),
}

impl StoreError {
    /// Short name of the failure class.
    pub fn kind(&self) -> &'static str {
        match self {
            StoreError::Io { .. } => "IoError",
            StoreError::Json { .. } => "JsonError",
            StoreError::NotFound(_) => "NotFound",
            StoreError::Encode(_) => "EncodeError",
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn json(path: impl Into<PathBuf>, source: serde_json::Error) -> Self {
        StoreError::Json {
            path: path.into(),
            source,
        }
    }
}

/// Storage for user documents.
///
/// `with_lock` runs `f` inside an exclusive section for `id`. Any
/// read-modify-write of a document must happen inside it.
pub trait DocumentStore: Send + Sync + Debug {
    /// Ids of every stored document, sorted.
    fn list(&self) -> Result<Vec<String>, StoreError>;

    fn load(&self, id: &str) -> Result<Document, StoreError>;

    /// Replace the document atomically.
    fn save(&self, id: &str, doc: &Document) -> Result<(), StoreError>;

    fn with_lock(
        &self,
        id: &str,
        f: &mut dyn FnMut() -> Result<(), StoreError>,
    ) -> Result<(), StoreError>;
}

/// Locked load-modify-save of one document.
///
/// The document is saved only when `f` reports a change.
pub fn update_document<F>(store: &dyn DocumentStore, id: &str, mut f: F) -> Result<bool, StoreError>
where
    F: FnMut(&mut Document) -> Result<bool, StoreError>,
{
    let mut changed = false;
    store.with_lock(id, &mut || {
        let mut doc = store.load(id)?;
        changed = f(&mut doc)?;
        if changed {
            store.save(id, &doc)?;
        }
        Ok(())
    })?;
    Ok(changed)
}

/// Load every readable document. Unreadable ones are logged and skipped.
pub fn load_all(store: &dyn DocumentStore) -> Result<Vec<(String, Document)>, StoreError> {
    let mut docs = Vec::new();
    for id in store.list()? {
        match store.load(&id) {
            Ok(doc) => docs.push((id, doc)),
            Err(e) => warn!(doc = %id, error = %e, "skipping unreadable document"),
        }
    }
    Ok(docs)
}

/// Whether any document lists a target of `kind`.
pub fn has_targets(store: &dyn DocumentStore, kind: WorkerKind) -> Result<bool, StoreError> {
    Ok(load_all(store)?
        .iter()
        .any(|(_, doc)| doc.has_targets(kind)))
}

/// Target coverage for one worker kind across all documents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TargetSummary {
    pub targets: usize,
    pub with_stats: usize,
}

impl TargetSummary {
    pub fn complete(&self) -> bool {
        self.targets == self.with_stats
    }
}

pub fn target_summary(docs: &[(String, Document)], kind: WorkerKind) -> TargetSummary {
    let mut summary = TargetSummary::default();
    for (_, doc) in docs {
        for target in doc.targets(kind) {
            summary.targets += 1;
            if doc.has_stats(kind, &target) {
                summary.with_stats += 1;
            }
        }
    }
    summary
}
