//! Size-rotated log files.
//!
//! `server.log` rotates to `server.log.1`, shifting older backups up to
//! `server.log.N`; the oldest is dropped.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// A size-limited log file with numbered backups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotatingLog {
    path: PathBuf,
    max_bytes: u64,
    backups: usize,
}

impl RotatingLog {
    /// `max_bytes == 0` or `backups == 0` disables rotation.
    pub fn new(path: impl Into<PathBuf>, max_bytes: u64, backups: usize) -> Self {
        Self {
            path: path.into(),
            max_bytes,
            backups,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn backup_path(&self, n: usize) -> PathBuf {
        let mut name = self.path.as_os_str().to_os_string();
        name.push(format!(".{n}"));
        PathBuf::from(name)
    }

    fn enabled(&self) -> bool {
        self.max_bytes > 0 && self.backups > 0
    }

    /// Shift backups up by one and move the live file to `.1`.
    pub fn rotate(&self) -> io::Result<()> {
        if !self.enabled() {
            return Ok(());
        }
        let oldest = self.backup_path(self.backups);
        if oldest.exists() {
            fs::remove_file(&oldest)?;
        }
        for n in (1..self.backups).rev() {
            let from = self.backup_path(n);
            if from.exists() {
                fs::rename(&from, self.backup_path(n + 1))?;
            }
        }
        if self.path.exists() {
            fs::rename(&self.path, self.backup_path(1))?;
        }
        Ok(())
    }

    /// Rotate if the live file has reached the size limit.
    pub fn rotate_if_needed(&self) -> io::Result<bool> {
        if !self.enabled() {
            return Ok(false);
        }
        match fs::metadata(&self.path) {
            Ok(meta) if meta.len() >= self.max_bytes => {
                self.rotate()?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Open the live file for appending, rotating first if it is full.
    pub fn open_append(&self) -> io::Result<File> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }
        self.rotate_if_needed()?;
        OpenOptions::new().create(true).append(true).open(&self.path)
    }

    /// A writer that rotates as it goes.
    pub fn writer(self) -> io::Result<RotatingWriter> {
        let file = self.open_append()?;
        let written = file.metadata().map(|m| m.len()).unwrap_or(0);
        Ok(RotatingWriter {
            log: self,
            file,
            written,
        })
    }
}

/// [`Write`] adapter over a [`RotatingLog`].
#[derive(Debug)]
pub struct RotatingWriter {
    log: RotatingLog,
    file: File,
    written: u64,
}

impl Write for RotatingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let incoming = buf.len() as u64;
        if self.log.enabled() && self.written > 0 && self.written + incoming > self.log.max_bytes {
            self.file.flush()?;
            self.log.rotate()?;
            self.file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.log.path)?;
            self.written = 0;
        }
        let n = self.file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}
