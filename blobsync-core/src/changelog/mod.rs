//! Durable append-only JSON-lines change log.
//!
//! One [`ChangeEvent`] per line, UTF-8, trailing newline. Rows carry
//! per-policy processing bits so several policies can consume the same feed
//! independently. When the primary file reaches its size threshold it is
//! rotated into a `<path>.<unix-seconds>` sibling and a fresh empty primary
//! is opened.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::Utc;
use parking_lot::Mutex;
use tracing::{debug, info};

use blobsync_model::ChangeEvent;

use crate::error::{ReplicationError, Result};

mod recorder;
pub use recorder::spawn_change_recorder;

/// Read-buffer capacity; lines are expected to stay under this.
const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Capability over the durable change feed.
pub trait ChangeLog: Send + Sync {
    /// Appends one event, stamping its timestamp if unset, and flushes it to
    /// durable storage.
    fn record_change(&self, event: ChangeEvent) -> Result<()>;

    /// Returns, in file order, every event not yet processed for
    /// `policy_id`. Malformed lines are skipped.
    fn get_unprocessed(&self, policy_id: &str) -> Result<Vec<ChangeEvent>>;

    /// Sets the processing bit for `policy_id` on every stored row with
    /// `key`.
    fn mark_processed(&self, key: &str, policy_id: &str) -> Result<()>;

    /// Archives the current file and opens a fresh empty primary.
    fn rotate(&self) -> Result<()>;

    /// Closes the underlying file. Safe to call repeatedly.
    fn close(&self) -> Result<()>;
}

/// JSON-lines change log backed by a single file.
///
/// One mutex serializes every operation; scanner state never crosses calls.
#[derive(Debug)]
pub struct FileChangeLog {
    path: PathBuf,
    max_size: u64,
    file: Mutex<Option<File>>,
}

impl FileChangeLog {
    /// Opens (creating if needed) the log at `path` with a rotation
    /// threshold of `max_size` bytes.
    pub fn new(path: impl Into<PathBuf>, max_size: u64) -> Result<Self> {
        let path = path.into();
        let file = Self::open_log(&path)?;
        Ok(FileChangeLog {
            path,
            max_size,
            file: Mutex::new(Some(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open_log(path: &Path) -> std::io::Result<File> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
    }

    fn closed() -> ReplicationError {
        ReplicationError::Internal("change log is closed".to_string())
    }

    /// Called with the log mutex held. On a failed rename the original path
    /// is reopened so the log stays usable; the error still surfaces.
    fn rotate_locked(&self, guard: &mut Option<File>) -> Result<()> {
        guard.take();

        let backup = backup_path(&self.path);
        if let Err(rename_err) = fs::rename(&self.path, &backup) {
            return match Self::open_log(&self.path) {
                Ok(file) => {
                    *guard = Some(file);
                    Err(ReplicationError::ChangeLogRotation(format!(
                        "rename to {} failed: {rename_err}",
                        backup.display()
                    )))
                }
                Err(reopen_err) => Err(ReplicationError::ChangeLogRotation(
                    format!(
                        "rename to {} failed ({rename_err}) and reopening {} \
                         failed ({reopen_err})",
                        backup.display(),
                        self.path.display()
                    ),
                )),
            };
        }

        let file = Self::open_log(&self.path).map_err(|err| {
            ReplicationError::ChangeLogRotation(format!(
                "failed to open fresh log after archiving to {}: {err}",
                backup.display()
            ))
        })?;
        *guard = Some(file);

        info!("rotated change log to {}", backup.display());
        Ok(())
    }

    fn read_all_locked(file: &mut File) -> Result<Vec<ChangeEvent>> {
        file.seek(SeekFrom::Start(0))?;
        let mut reader = BufReader::with_capacity(MAX_LINE_BYTES, &*file);
        let mut events = Vec::new();
        let mut line = String::new();
        loop {
            line.clear();
            if reader.read_line(&mut line)? == 0 {
                break;
            }
            let trimmed = line.trim_end();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<ChangeEvent>(trimmed) {
                Ok(event) => events.push(event),
                Err(err) => {
                    debug!("skipping malformed change log line: {err}");
                }
            }
        }
        Ok(events)
    }
}

impl ChangeLog for FileChangeLog {
    fn record_change(&self, mut event: ChangeEvent) -> Result<()> {
        let mut guard = self.file.lock();
        let file = guard.as_mut().ok_or_else(Self::closed)?;

        if event.timestamp.is_none() {
            event.timestamp = Some(Utc::now());
        }

        let mut line = serde_json::to_vec(&event)?;
        line.push(b'\n');

        file.seek(SeekFrom::End(0))?;
        file.write_all(&line)?;
        file.sync_all()?;

        let size = file.metadata()?.len();
        if size >= self.max_size {
            debug!(
                "change log at {} reached {size} bytes, rotating",
                self.path.display()
            );
            self.rotate_locked(&mut guard)?;
        }
        Ok(())
    }

    fn get_unprocessed(&self, policy_id: &str) -> Result<Vec<ChangeEvent>> {
        let mut guard = self.file.lock();
        let file = guard.as_mut().ok_or_else(Self::closed)?;

        let mut events = Self::read_all_locked(file)?;
        events.retain(|event| !event.is_processed(policy_id));
        Ok(events)
    }

    fn mark_processed(&self, key: &str, policy_id: &str) -> Result<()> {
        let mut guard = self.file.lock();
        let file = guard.as_mut().ok_or_else(Self::closed)?;

        // Malformed lines are dropped by this rewrite; the log does not try
        // to preserve corrupt bytes.
        let mut events = Self::read_all_locked(file)?;
        for event in &mut events {
            if event.key == key {
                event.mark_processed(policy_id);
            }
        }

        let mut out = Vec::new();
        for event in &events {
            out.extend(serde_json::to_vec(event)?);
            out.push(b'\n');
        }

        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&out)?;
        file.sync_all()?;
        Ok(())
    }

    fn rotate(&self) -> Result<()> {
        let mut guard = self.file.lock();
        if guard.is_none() {
            return Err(Self::closed());
        }
        self.rotate_locked(&mut guard)
    }

    fn close(&self) -> Result<()> {
        self.file.lock().take();
        Ok(())
    }
}

fn backup_path(path: &Path) -> PathBuf {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0);
    PathBuf::from(format!("{}.{secs}", path.display()))
}
