//! Cross-process mutex for a discussion log.
//!
//! The lock is a sibling file (`<id>.jsonl.lock`) held via create-exclusive
//! semantics: presence = held, absence = released. The payload is
//! `<pid>:<epoch-ms>` and exists only for diagnostic inspection. A lock
//! whose mtime is older than the stale threshold is assumed to belong to a
//! crashed writer and is reclaimed.

use std::io::ErrorKind;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;
use std::time::Instant;

use crate::error::Result;
use crate::error::RoundtableErr;

#[derive(Debug, Clone)]
pub struct LockSettings {
    /// How often to re-check an already-held lock.
    pub poll: Duration,
    /// Locks with an mtime older than this are reclaimed.
    pub stale_after: Duration,
    /// Total budget for the acquisition before giving up.
    pub deadline: Duration,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            poll: Duration::from_millis(20),
            stale_after: Duration::from_secs(30),
            deadline: Duration::from_secs(10),
        }
    }
}

/// Held lock. Releasing is best-effort: an unlink failure means another
/// party already reclaimed the file, which is fine.
#[derive(Debug)]
pub(crate) struct LockGuard {
    path: PathBuf,
    released: bool,
}

pub(crate) async fn acquire(path: &Path, settings: &LockSettings) -> Result<LockGuard> {
    let start = Instant::now();
    loop {
        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
        {
            Ok(mut file) => {
                let payload = format!(
                    "{}:{}",
                    std::process::id(),
                    chrono::Utc::now().timestamp_millis()
                );
                // Payload is diagnostic only; a write failure does not
                // invalidate the lock.
                if let Err(err) = file.write_all(payload.as_bytes()) {
                    tracing::debug!(%err, "failed to write lock payload");
                }
                return Ok(LockGuard {
                    path: path.to_path_buf(),
                    released: false,
                });
            }
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                if is_stale(path, settings.stale_after) {
                    tracing::warn!(path = %path.display(), "reclaiming stale lock file");
                    if let Err(err) = std::fs::remove_file(path) {
                        tracing::debug!(%err, "stale lock already gone");
                    }
                    continue;
                }
                if start.elapsed() >= settings.deadline {
                    return Err(RoundtableErr::LockTimeout {
                        path: path.to_path_buf(),
                        deadline: settings.deadline,
                    });
                }
                tokio::time::sleep(settings.poll).await;
            }
            Err(err) => return Err(err.into()),
        }
    }
}

fn is_stale(path: &Path, stale_after: Duration) -> bool {
    let Ok(metadata) = std::fs::metadata(path) else {
        // Vanished between the failed create and the stat: not stale, the
        // next create attempt will settle it.
        return false;
    };
    let Ok(mtime) = metadata.modified() else {
        return false;
    };
    match mtime.elapsed() {
        Ok(age) => age > stale_after,
        // mtime in the future (clock skew): respect the lock.
        Err(_) => false,
    }
}

impl LockGuard {
    pub(crate) fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Err(err) = std::fs::remove_file(&self.path) {
            tracing::debug!(%err, "lock file already cleared");
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.release_inner();
    }
}
