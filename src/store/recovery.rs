//! Startup validation, quarantine and periodic backups.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tempfile::NamedTempFile;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::file::{json_files, read_document};
use super::StoreError;

/// Outcome of [`validate_on_startup`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ValidationReport {
    pub total: usize,
    pub ok: usize,
    pub restored: usize,
    pub invalid: usize,
}

fn copy_atomic(from: &Path, to: &Path) -> Result<(), StoreError> {
    let dir = to.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir).map_err(|e| StoreError::io(dir, e))?;
    let bytes = fs::read(from).map_err(|e| StoreError::io(from, e))?;
    let tmp = NamedTempFile::new_in(dir).map_err(|e| StoreError::io(dir, e))?;
    fs::write(tmp.path(), bytes).map_err(|e| StoreError::io(tmp.path(), e))?;
    tmp.persist(to).map_err(|e| StoreError::io(to, e.error))?;
    Ok(())
}

fn quarantine_path(quarantine_dir: &Path, path: &Path, now: DateTime<Utc>) -> PathBuf {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("document");
    quarantine_dir.join(format!("{stem}.{}.bad.json", now.format("%Y%m%d_%H%M%S")))
}

/// Check every document in `data_dir` before the coordinator starts writing.
///
/// A corrupt document is restored from its backup copy when that copy parses,
/// otherwise moved into `quarantine_dir`.
pub fn validate_on_startup(
    data_dir: &Path,
    backup_dir: &Path,
    quarantine_dir: &Path,
    now: DateTime<Utc>,
) -> Result<ValidationReport, StoreError> {
    let mut report = ValidationReport::default();
    for path in json_files(data_dir)? {
        report.total += 1;
        let err = match read_document(&path) {
            Ok(_) => {
                report.ok += 1;
                continue;
            }
            Err(e) => e,
        };

        let Some(name) = path.file_name() else {
            continue;
        };
        let backup = backup_dir.join(name);
        if backup.is_file() && read_document(&backup).is_ok() {
            copy_atomic(&backup, &path)?;
            warn!(path = %path.display(), error = %err, "restored document from backup");
            report.restored += 1;
            continue;
        }

        fs::create_dir_all(quarantine_dir).map_err(|e| StoreError::io(quarantine_dir, e))?;
        let target = quarantine_path(quarantine_dir, &path, now);
        fs::rename(&path, &target).map_err(|e| StoreError::io(&path, e))?;
        error!(
            path = %path.display(),
            quarantined = %target.display(),
            error = %err,
            "document is corrupt and has no valid backup"
        );
        report.invalid += 1;
    }
    Ok(report)
}

/// Copy every readable document in `data_dir` into `backup_dir`.
///
/// Corrupt documents are skipped so they never overwrite a good backup.
/// Returns the number of documents copied.
pub fn backup_once(data_dir: &Path, backup_dir: &Path) -> Result<usize, StoreError> {
    let mut copied = 0;
    for path in json_files(data_dir)? {
        if let Err(e) = read_document(&path) {
            warn!(path = %path.display(), error = %e, "not backing up corrupt document");
            continue;
        }
        let Some(name) = path.file_name() else {
            continue;
        };
        copy_atomic(&path, &backup_dir.join(name))?;
        copied += 1;
    }
    Ok(copied)
}

/// Handle to the periodic backup task.
#[derive(Debug)]
pub struct BackupHandle {
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl BackupHandle {
    /// Stop the loop and wait for an in-flight backup to finish.
    pub async fn shutdown(self) {
        let _ = self.stop_tx.send(true);
        let _ = self.task.await;
    }
}

/// Back up `data_dir` every `interval` until stopped.
///
/// The first backup runs one interval after start.
pub fn spawn_backup_loop(data_dir: PathBuf, backup_dir: PathBuf, interval: Duration) -> BackupHandle {
    let (stop_tx, mut stop_rx) = watch::channel(false);

    let task = tokio::spawn(async move {
        let mut timer = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        loop {
            tokio::select! {
                _ = timer.tick() => {
                    let (data, backup) = (data_dir.clone(), backup_dir.clone());
                    match tokio::task::spawn_blocking(move || backup_once(&data, &backup)).await {
                        Ok(Ok(n)) => debug!(copied = n, "backup complete"),
                        Ok(Err(e)) => error!(error = %e, "backup failed"),
                        Err(e) => error!(error = %e, "backup task panicked"),
                    }
                }
                _ = stop_rx.changed() => {
                    if *stop_rx.borrow() {
                        break;
                    }
                }
            }
        }
        info!("backup loop stopped");
    });

    BackupHandle { stop_tx, task }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    struct Dirs {
        _root: TempDir,
        data: PathBuf,
        backup: PathBuf,
        quarantine: PathBuf,
    }

    fn dirs() -> Dirs {
        let root = TempDir::new().unwrap();
        let data = root.path().join("data");
        let backup = root.path().join("backup");
        let quarantine = root.path().join("quarantine");
        fs::create_dir_all(&data).unwrap();
        Dirs {
            data,
            backup,
            quarantine,
            _root: root,
        }
    }

    #[test]
    fn corrupt_documents_restore_or_quarantine() {
        let d = dirs();
        fs::write(d.data.join("ok.json"), r#"{"posts": []}"#).unwrap();
        fs::write(d.data.join("fixable.json"), "{broken").unwrap();
        fs::write(d.data.join("lost.json"), "[]").unwrap();
        fs::create_dir_all(&d.backup).unwrap();
        fs::write(d.backup.join("fixable.json"), r#"{"posts": ["https://p/1"]}"#).unwrap();

        let now = Utc.with_ymd_and_hms(2024, 5, 1, 10, 30, 5).unwrap();
        let report = validate_on_startup(&d.data, &d.backup, &d.quarantine, now).unwrap();
        assert_eq!(
            report,
            ValidationReport {
                total: 3,
                ok: 1,
                restored: 1,
                invalid: 1
            }
        );

        let restored = read_document(&d.data.join("fixable.json")).unwrap();
        assert_eq!(restored.post_targets(), vec!["https://p/1"]);
        assert!(!d.data.join("lost.json").exists());
        assert!(d.quarantine.join("lost.20240501_103005.bad.json").is_file());
    }

    #[test]
    fn backup_skips_corrupt_documents() {
        let d = dirs();
        fs::write(d.data.join("a.json"), "{}").unwrap();
        fs::write(d.data.join("b.json"), "nope").unwrap();
        assert_eq!(backup_once(&d.data, &d.backup).unwrap(), 1);
        assert!(d.backup.join("a.json").is_file());
        assert!(!d.backup.join("b.json").exists());
    }

    #[tokio::test]
    async fn backup_loop_runs_until_stopped() {
        let d = dirs();
        fs::write(d.data.join("a.json"), "{}").unwrap();
        let handle = spawn_backup_loop(d.data.clone(), d.backup.clone(), Duration::from_millis(20));

        for _ in 0..100 {
            if d.backup.join("a.json").exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.shutdown().await;
        assert!(d.backup.join("a.json").is_file());
    }
}
