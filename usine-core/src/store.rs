//! Store ports.
//!
//! The reconciler only ever talks to the two backing systems through these
//! traits. Store handles are built once by the entry point and passed down by
//! reference; nothing here holds a process-wide client.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{FailureKind, StoreError};
use crate::types::{Email, IdentityRecord, ProfileRecord, UserId};

/// Largest page the identity store will hand out.
pub const IDENTITY_PAGE_LIMIT: usize = 1000;
/// Largest number of ids one `delete_identities` call accepts.
pub const IDENTITY_BATCH_LIMIT: usize = 1000;
/// Largest page the profile store will hand out.
pub const PROFILE_PAGE_LIMIT: usize = 500;
/// Largest number of writes in one atomic profile batch.
pub const PROFILE_BATCH_LIMIT: usize = 500;

// ---------------------------------------------------------------------------
// Paging
// ---------------------------------------------------------------------------

/// Opaque continuation cursor returned by a list call.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PageToken(pub String);

impl fmt::Display for PageToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// One bounded page of records.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub records: Vec<T>,
    /// `None` once the store is exhausted.
    pub next_page_token: Option<PageToken>,
}

// ---------------------------------------------------------------------------
// Batch results
// ---------------------------------------------------------------------------

/// A single intent the store could not apply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemFailure {
    pub id: UserId,
    pub kind: FailureKind,
    pub reason: String,
}

impl ItemFailure {
    pub fn new(id: UserId, kind: FailureKind, reason: impl Into<String>) -> Self {
        Self {
            id,
            kind,
            reason: reason.into(),
        }
    }
}

/// Per-item result of a batch call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchOutcome {
    pub succeeded: Vec<UserId>,
    pub failed: Vec<ItemFailure>,
}

impl BatchOutcome {
    /// Every id failed for the same reason.
    pub fn all_failed<'a>(
        ids: impl IntoIterator<Item = &'a UserId>,
        kind: FailureKind,
        reason: &str,
    ) -> Self {
        Self {
            succeeded: Vec::new(),
            failed: ids
                .into_iter()
                .map(|id| ItemFailure::new(id.clone(), kind, reason))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ---------------------------------------------------------------------------
// Profile writes
// ---------------------------------------------------------------------------

/// Write options for [`ProfileStore::set_profile`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SetOptions {
    /// Keep stored fields the incoming document does not override.
    pub merge: bool,
}

/// One write inside an atomic profile batch.
#[derive(Debug, Clone, PartialEq)]
pub enum ProfileOp {
    Set { profile: ProfileRecord, merge: bool },
    Delete { id: UserId },
}

impl ProfileOp {
    pub fn id(&self) -> &UserId {
        match self {
            ProfileOp::Set { profile, .. } => &profile.id,
            ProfileOp::Delete { id } => id,
        }
    }
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Authentication records, keyed by [`UserId`].
#[async_trait]
pub trait IdentityStore: Send + Sync {
    fn max_page_size(&self) -> usize {
        IDENTITY_PAGE_LIMIT
    }

    fn max_batch_size(&self) -> usize {
        IDENTITY_BATCH_LIMIT
    }

    /// Create an identity and return the id the store assigned.
    async fn create_identity(&self, email: &Email, credential: &str)
        -> Result<UserId, StoreError>;

    /// Delete identities. Ids that no longer exist count as succeeded.
    async fn delete_identities(&self, ids: &[UserId]) -> Result<BatchOutcome, StoreError>;

    async fn list_identities(
        &self,
        page_token: Option<&PageToken>,
        page_size: usize,
    ) -> Result<Page<IdentityRecord>, StoreError>;

    async fn get_identity_by_email(
        &self,
        email: &Email,
    ) -> Result<Option<IdentityRecord>, StoreError>;
}

/// Profile documents, keyed by the identity's [`UserId`].
#[async_trait]
pub trait ProfileStore: Send + Sync {
    fn max_page_size(&self) -> usize {
        PROFILE_PAGE_LIMIT
    }

    fn max_batch_size(&self) -> usize {
        PROFILE_BATCH_LIMIT
    }

    async fn set_profile(
        &self,
        profile: &ProfileRecord,
        options: SetOptions,
    ) -> Result<(), StoreError>;

    /// Commit `ops` as one atomic batch of at most [`Self::max_batch_size`]
    /// writes. Deleting a missing document is a success.
    async fn write_batch(&self, ops: &[ProfileOp]) -> Result<BatchOutcome, StoreError>;

    async fn get_profile(&self, id: &UserId) -> Result<Option<ProfileRecord>, StoreError>;

    async fn delete_profiles(&self, ids: &[UserId]) -> Result<BatchOutcome, StoreError> {
        let ops: Vec<ProfileOp> = ids
            .iter()
            .map(|id| ProfileOp::Delete { id: id.clone() })
            .collect();
        self.write_batch(&ops).await
    }

    async fn list_profiles(
        &self,
        page_token: Option<&PageToken>,
        page_size: usize,
    ) -> Result<Page<ProfileRecord>, StoreError>;
}
