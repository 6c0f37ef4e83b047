//! Error types for usine-sync.

use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

use usine_core::{StoreError, StoreKind, UserId};

/// All errors that can stop a reconciliation phase.
///
/// None of these escape [`crate::Reconciler::run`]; the driver folds them
/// into a `Partial` report.
#[derive(Debug, Error)]
pub enum SyncError {
    /// A store call failed after the retry budget was spent.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// A list call handed back the cursor it was given.
    #[error("{store} store returned cursor '{token}' twice; aborting scan")]
    CursorLoop { store: StoreKind, token: String },

    /// The pass was cancelled between batches.
    #[error("reconciliation cancelled")]
    Cancelled,

    /// The pass ran past its wall-clock bound.
    #[error("reconciliation exceeded its time budget")]
    DeadlineExceeded,

    /// Seed file I/O failure.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Seed file YAML error.
    #[error("failed to parse seed file {path}: {source}")]
    Seed {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

/// Two or more distinct ids in one store share a (normalized) email.
///
/// Never auto-resolved: every record carrying the email is left alone until
/// an operator fixes it.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[error("duplicate email {email} in {store} store shared by {}", join_ids(.ids))]
pub struct DuplicateEmailError {
    pub email: String,
    pub store: StoreKind,
    pub ids: Vec<UserId>,
}

/// A record without a counterpart that survived a reconciliation pass.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[error("{store} record {id} has no counterpart after reconciliation")]
pub struct InvariantViolation {
    pub store: StoreKind,
    pub id: UserId,
}

fn join_ids(ids: &[UserId]) -> String {
    ids.iter()
        .map(|id| id.0.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}
