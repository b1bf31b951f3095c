//! Heartbeat writer.

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use parking_lot::Mutex;
use pulsewatch_types::{HealthRecord, WorkerKind};
use tempfile::NamedTempFile;

use crate::SdkError;

/// Keeps a worker's heartbeat file current.
///
/// Every update rewrites the whole record through a temp file in the same
/// directory followed by an atomic rename, so a reader never observes a
/// partially written document.
///
/// # Example
///
/// ```rust,no_run
/// use pulsewatch_sdk::Heartbeat;
/// use pulsewatch_types::WorkerKind;
///
/// let heartbeat = Heartbeat::open("runtime/parser_health_posts.json", WorkerKind::Posts)?;
/// heartbeat.record_request("https://www.threads.com/@someone/post/abc")?;
/// heartbeat.record_response(200)?;
/// # Ok::<(), pulsewatch_sdk::SdkError>(())
/// ```
#[derive(Debug)]
pub struct Heartbeat {
    path: PathBuf,
    record: Mutex<HealthRecord>,
}

impl Heartbeat {
    /// Start a fresh heartbeat for this process and write it immediately.
    pub fn open(path: impl Into<PathBuf>, kind: WorkerKind) -> Result<Self, SdkError> {
        let heartbeat = Self {
            path: path.into(),
            record: Mutex::new(HealthRecord::started(kind, std::process::id(), Utc::now())),
        };
        heartbeat.flush(&heartbeat.record.lock())?;
        Ok(heartbeat)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A copy of the current record.
    pub fn snapshot(&self) -> HealthRecord {
        self.record.lock().clone()
    }

    /// Note an outgoing request.
    pub fn record_request(&self, url: &str) -> Result<(), SdkError> {
        self.update(|record, now| {
            record.last_request_ts_utc = Some(now);
            record.last_request_url = Some(url.to_string());
        })
    }

    /// Note a response and its HTTP status.
    pub fn record_response(&self, status: u16) -> Result<(), SdkError> {
        self.update(|record, now| {
            record.last_response_ts_utc = Some(now);
            record.last_response_status = Some(status);
        })
    }

    /// Note a failure. The worker is expected to carry on with the next target.
    pub fn record_error(&self, message: &str) -> Result<(), SdkError> {
        self.update(|record, now| {
            record.last_error_ts_utc = Some(now);
            record.last_error = Some(message.to_string());
        })
    }

    fn update(
        &self,
        apply: impl FnOnce(&mut HealthRecord, chrono::DateTime<Utc>),
    ) -> Result<(), SdkError> {
        let mut record = self.record.lock();
        let now = Utc::now();
        apply(&mut record, now);
        record.updated_at_utc = Some(now);
        self.flush(&record)
    }

    fn flush(&self, record: &HealthRecord) -> Result<(), SdkError> {
        let dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir)?;
        let mut tmp = NamedTempFile::new_in(&dir)?;
        serde_json::to_writer_pretty(&mut tmp, record)?;
        tmp.flush()?;
        tmp.persist(&self.path).map_err(|e| e.error)?;
        Ok(())
    }
}
