//! Filesystem document store.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

use super::{Document, DocumentLocks, DocumentStore, FileLock, StoreError};

/// One `<id>.json` file per document under a data directory.
#[derive(Debug)]
pub struct FileStore {
    dir: PathBuf,
    locks: DocumentLocks,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            locks: DocumentLocks::new(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }
}

/// Paths of the `*.json` documents in `dir`, sorted. A missing directory is
/// empty.
pub(crate) fn json_files(dir: &Path) -> Result<Vec<PathBuf>, StoreError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(StoreError::io(dir, e)),
    };
    let mut files: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "json"))
        .collect();
    files.sort();
    Ok(files)
}

pub(crate) fn read_document(path: &Path) -> Result<Document, StoreError> {
    let content = fs::read_to_string(path).map_err(|e| StoreError::io(path, e))?;
    Document::parse(&content).map_err(|e| StoreError::json(path, e))
}

/// Write `doc` to a temp file beside `path` and rename it into place.
pub(crate) fn write_atomic(path: &Path, doc: &Document) -> Result<(), StoreError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir).map_err(|e| StoreError::io(dir, e))?;
    let mut tmp = NamedTempFile::new_in(dir).map_err(|e| StoreError::io(dir, e))?;
    serde_json::to_writer_pretty(&mut tmp, doc).map_err(|e| StoreError::json(path, e))?;
    tmp.write_all(b"\n").map_err(|e| StoreError::io(path, e))?;
    tmp.as_file().sync_all().map_err(|e| StoreError::io(path, e))?;
    tmp.persist(path).map_err(|e| StoreError::io(path, e.error))?;
    Ok(())
}

impl DocumentStore for FileStore {
    fn list(&self) -> Result<Vec<String>, StoreError> {
        Ok(json_files(&self.dir)?
            .iter()
            .filter_map(|p| p.file_stem().and_then(|s| s.to_str()).map(str::to_string))
            .collect())
    }

    fn load(&self, id: &str) -> Result<Document, StoreError> {
        let path = self.path_for(id);
        if !path.exists() {
            return Err(StoreError::NotFound(id.to_string()));
        }
        read_document(&path)
    }

    fn save(&self, id: &str, doc: &Document) -> Result<(), StoreError> {
        write_atomic(&self.path_for(id), doc)
    }

    fn with_lock(
        &self,
        id: &str,
        f: &mut dyn FnMut() -> Result<(), StoreError>,
    ) -> Result<(), StoreError> {
        let path = self.path_for(id);
        self.locks.with(&path, || {
            let _file_lock = FileLock::acquire(&path)?;
            f()
        })
    }
}
