//! Advisory lock that keeps reconciliation passes from overlapping.
//!
//! The lock is a JSON record at `<home>/.usine/reconcile.lock`. The record is
//! written to a private temp file first and hard-linked into place, so the
//! lock path either does not exist or holds a complete record, and two
//! processes racing for it cannot both win. A record whose `expires_at` has
//! passed belongs to a crashed or hung pass and is taken over. Dropping the
//! guard removes the file.

use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::LockError;
use crate::paths;

/// Contents of the lock file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub holder: String,
    pub pid: u32,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl LockRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// What currently sits at the lock path.
enum Existing {
    Missing,
    Record(LockRecord),
    Unreadable { modified: DateTime<Utc> },
}

/// Held lock; released on drop.
#[derive(Debug)]
pub struct ReconcileLock {
    path: PathBuf,
    record: LockRecord,
}

impl ReconcileLock {
    /// Acquire the lock under `home` for `ttl`.
    pub fn acquire_at(home: &Path, holder: &str, ttl: Duration) -> Result<Self, LockError> {
        Self::acquire_path(&paths::lock_path(home), holder, ttl, Utc::now())
    }

    fn acquire_path(
        path: &Path,
        holder: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<Self, LockError> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(|source| lock_io(dir, source))?;
        }

        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(1));
        let record = LockRecord {
            holder: holder.to_string(),
            pid: std::process::id(),
            acquired_at: now,
            expires_at: now + ttl,
        };

        let staged = staging_path(path);
        write_staged(&staged, &record)?;
        let linked = link_into_place(&staged, path, ttl, now);
        let _ = std::fs::remove_file(&staged);
        linked?;

        tracing::debug!("acquired reconcile lock at {}", path.display());
        Ok(Self {
            path: path.to_path_buf(),
            record,
        })
    }

    pub fn record(&self) -> &LockRecord {
        &self.record
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ReconcileLock {
    fn drop(&mut self) {
        // Only remove the file if it is still ours.
        if let Ok(Existing::Record(current)) = inspect(&self.path) {
            if current == self.record {
                let _ = std::fs::remove_file(&self.path);
            }
        }
    }
}

fn lock_io(path: &Path, source: std::io::Error) -> LockError {
    LockError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// `<lock>.<pid>.tmp` beside the lock, on the same filesystem.
fn staging_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "reconcile.lock".to_string());
    path.with_file_name(format!("{name}.{}.tmp", std::process::id()))
}

fn write_staged(staged: &Path, record: &LockRecord) -> Result<(), LockError> {
    let json = serde_json::to_vec_pretty(record)?;
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(staged)
        .map_err(|source| lock_io(staged, source))?;
    file.write_all(&json)
        .and_then(|()| file.sync_all())
        .map_err(|source| lock_io(staged, source))
}

/// Hard-link the staged record onto `path`. One takeover attempt: a stale
/// lock is removed and the link retried.
fn link_into_place(
    staged: &Path,
    path: &Path,
    ttl: chrono::Duration,
    now: DateTime<Utc>,
) -> Result<(), LockError> {
    for _ in 0..2 {
        match std::fs::hard_link(staged, path) {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
            Err(source) => return Err(lock_io(path, source)),
        }

        match inspect(path)? {
            Existing::Missing => continue,
            Existing::Record(existing) if !existing.is_expired(now) => {
                return Err(LockError::Held {
                    holder: existing.holder,
                    pid: existing.pid,
                    expires_at: existing.expires_at,
                });
            }
            Existing::Record(existing) => {
                tracing::warn!(
                    "taking over expired reconcile lock held by {} (pid {})",
                    existing.holder,
                    existing.pid
                );
            }
            Existing::Unreadable { modified } if now - modified < ttl => {
                return Err(LockError::Unreadable {
                    path: path.to_path_buf(),
                    modified,
                });
            }
            Existing::Unreadable { modified } => {
                tracing::warn!(
                    "removing unreadable reconcile lock {} (last modified {modified})",
                    path.display()
                );
            }
        }
        match std::fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(source) => return Err(lock_io(path, source)),
        }
    }

    // Lost the race for the freed slot.
    match inspect(path)? {
        Existing::Record(existing) => Err(LockError::Held {
            holder: existing.holder,
            pid: existing.pid,
            expires_at: existing.expires_at,
        }),
        _ => Err(lock_io(path, std::io::Error::other("lock file contended"))),
    }
}

fn inspect(path: &Path) -> Result<Existing, LockError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Existing::Missing),
        Err(source) => return Err(lock_io(path, source)),
    };
    if let Ok(record) = serde_json::from_str(&contents) {
        return Ok(Existing::Record(record));
    }
    match std::fs::metadata(path).and_then(|meta| meta.modified()) {
        Ok(modified) => Ok(Existing::Unreadable {
            modified: DateTime::<Utc>::from(modified),
        }),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(Existing::Missing),
        Err(source) => Err(lock_io(path, source)),
    }
}
