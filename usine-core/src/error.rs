//! Error types for usine-core.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::StoreKind;

/// Errors raised by an identity or profile store call.
///
/// A call that returns one of these applied nothing. Per-item failures inside
/// an applied batch are reported through [`crate::store::BatchOutcome`]
/// instead.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Network, quota or rate-limit trouble; worth retrying.
    #[error("transient {store} store error: {reason}")]
    Transient { store: StoreKind, reason: String },

    /// The store rejected the request; retrying will not help.
    #[error("{store} store rejected the request: {reason}")]
    Permanent { store: StoreKind, reason: String },

    /// A batch exceeded the store's atomic-batch limit.
    #[error("{store} batch of {size} exceeds the limit of {limit}")]
    BatchTooLarge {
        store: StoreKind,
        size: usize,
        limit: usize,
    },

    /// Snapshot file I/O failure.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Snapshot file contents could not be (de)serialized.
    #[error("snapshot JSON error at {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl StoreError {
    pub fn transient(store: StoreKind, reason: impl Into<String>) -> Self {
        Self::Transient {
            store,
            reason: reason.into(),
        }
    }

    pub fn permanent(store: StoreKind, reason: impl Into<String>) -> Self {
        Self::Permanent {
            store,
            reason: reason.into(),
        }
    }

    /// Whether the retry controller may re-attempt the call.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Transient { .. } => true,
            // Local disk hiccups on the snapshot store behave like a flaky link.
            StoreError::Io { source, .. } => matches!(
                source.kind(),
                std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::TimedOut
            ),
            StoreError::Permanent { .. }
            | StoreError::BatchTooLarge { .. }
            | StoreError::Json { .. } => false,
        }
    }

    pub fn kind(&self) -> FailureKind {
        if self.is_transient() {
            FailureKind::Transient
        } else {
            FailureKind::Permanent
        }
    }
}

/// Retry classification of a failed item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureKind {
    Transient,
    Permanent,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Transient => write!(f, "transient"),
            FailureKind::Permanent => write!(f, "permanent"),
        }
    }
}

/// Errors from loading or validating [`crate::config::Settings`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// YAML parse error on load, with the offending file.
    #[error("failed to parse config at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("YAML serialization error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// A value is outside its allowed range.
    #[error("invalid config: {0}")]
    Invalid(String),

    /// `dirs::home_dir()` returned `None`.
    #[error("cannot determine home directory; set $HOME or equivalent")]
    HomeNotFound,
}

/// Errors from the advisory reconciliation lock.
#[derive(Debug, Error)]
pub enum LockError {
    /// Another pass holds an unexpired lock.
    #[error("reconciliation already running (held by {holder}, pid {pid}) until {expires_at}")]
    Held {
        holder: String,
        pid: u32,
        expires_at: chrono::DateTime<chrono::Utc>,
    },

    /// A lock file that does not parse and was touched within the TTL.
    #[error("lock file {path} is unreadable (last modified {modified}); remove it if no pass is running")]
    Unreadable {
        path: PathBuf,
        modified: chrono::DateTime<chrono::Utc>,
    },

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("lock file JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Convenience constructor for [`StoreError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.into(),
        source,
    }
}
