//! Batched mutation with per-item retry.
//!
//! A [`BatchTarget`] is one store seen as "something that commits a slice of
//! ops and reports per-item results". [`BatchMutator`] chunks a list of ops
//! to the target's batch limit and commits each chunk through
//! [`commit_with_retry`], which re-submits only the items that failed
//! transiently.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::task::yield_now;
use tokio::time::sleep;

use usine_core::{
    BatchOutcome, FailureKind, IdentityStore, ItemFailure, ProfileOp, ProfileStore, StoreError,
    StoreKind, UserId,
};

use crate::control::PassControl;
use crate::error::SyncError;
use crate::retry::RetryPolicy;

/// A store that accepts batches of `Op`.
#[async_trait]
pub trait BatchTarget: Send + Sync {
    type Op: Clone + Send + Sync;

    fn store(&self) -> StoreKind;

    fn max_batch_size(&self) -> usize;

    fn op_id(op: &Self::Op) -> &UserId;

    /// Commit `ops` as one call.
    async fn commit(&self, ops: &[Self::Op]) -> Result<BatchOutcome, StoreError>;
}

/// Identity deletions.
pub struct IdentityDeletes<'a>(pub &'a dyn IdentityStore);

#[async_trait]
impl BatchTarget for IdentityDeletes<'_> {
    type Op = UserId;

    fn store(&self) -> StoreKind {
        StoreKind::Identity
    }

    fn max_batch_size(&self) -> usize {
        self.0.max_batch_size()
    }

    fn op_id(op: &UserId) -> &UserId {
        op
    }

    async fn commit(&self, ops: &[UserId]) -> Result<BatchOutcome, StoreError> {
        self.0.delete_identities(ops).await
    }
}

/// Profile upserts and deletions, committed as atomic write batches.
pub struct ProfileWrites<'a>(pub &'a dyn ProfileStore);

#[async_trait]
impl BatchTarget for ProfileWrites<'_> {
    type Op = ProfileOp;

    fn store(&self) -> StoreKind {
        StoreKind::Profile
    }

    fn max_batch_size(&self) -> usize {
        self.0.max_batch_size()
    }

    fn op_id(op: &ProfileOp) -> &UserId {
        op.id()
    }

    async fn commit(&self, ops: &[ProfileOp]) -> Result<BatchOutcome, StoreError> {
        self.0.write_batch(ops).await
    }
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// What happened to one batch after retries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub store: StoreKind,
    /// Position of the batch within its store, from 0.
    pub index: usize,
    pub attempted: usize,
    /// Calls made for this batch, including retries.
    pub attempts: u32,
    pub succeeded: usize,
    pub failed: Vec<ItemFailure>,
}

/// Items the store left out of its result are treated as transient failures
/// so that they are either retried or reported.
fn fill_omitted<Op>(
    outcome: &mut BatchOutcome,
    pending: &[Op],
    op_id: impl Fn(&Op) -> &UserId,
) {
    let answered: HashSet<&UserId> = outcome
        .succeeded
        .iter()
        .chain(outcome.failed.iter().map(|f| &f.id))
        .collect();
    let omitted: Vec<ItemFailure> = pending
        .iter()
        .map(&op_id)
        .filter(|id| !answered.contains(id))
        .map(|id| ItemFailure::new(id.clone(), FailureKind::Transient, "missing from batch result"))
        .collect();
    outcome.failed.extend(omitted);
}

/// Commit one batch, re-submitting only the transiently failed subset until
/// it succeeds or the policy's attempts are spent. Never returns an error:
/// a failed call is spread over every pending item.
pub async fn commit_with_retry<T: BatchTarget>(
    target: &T,
    ops: &[T::Op],
    policy: &RetryPolicy,
    index: usize,
) -> BatchReport {
    let store = target.store();
    let mut pending: Vec<T::Op> = ops.to_vec();
    let mut succeeded = 0usize;
    let mut failed = Vec::new();
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        let mut outcome = match target.commit(&pending).await {
            Ok(outcome) => outcome,
            Err(err) => {
                let kind = if err.is_transient() {
                    FailureKind::Transient
                } else {
                    FailureKind::Permanent
                };
                tracing::warn!("{store} batch {index} call failed ({kind}): {err}");
                BatchOutcome::all_failed(pending.iter().map(T::op_id), kind, &err.to_string())
            }
        };
        fill_omitted(&mut outcome, &pending, T::op_id);
        succeeded += outcome.succeeded.len();

        let mut transient = Vec::new();
        for failure in outcome.failed {
            match failure.kind {
                FailureKind::Permanent => failed.push(failure),
                FailureKind::Transient => transient.push(failure),
            }
        }
        if transient.is_empty() {
            break;
        }
        if attempts >= policy.max_attempts {
            failed.extend(transient.into_iter().map(|f| ItemFailure {
                reason: format!("{} (gave up after {attempts} attempts)", f.reason),
                ..f
            }));
            break;
        }

        let retry: HashSet<UserId> = transient.into_iter().map(|f| f.id).collect();
        pending.retain(|op| retry.contains(T::op_id(op)));
        let delay = policy.wait_for(attempts);
        tracing::debug!(
            "{store} batch {index}: retrying {} item(s) in {delay:?}",
            pending.len()
        );
        sleep(delay).await;
    }

    if failed.is_empty() {
        tracing::info!("{store} batch {index}: {succeeded} applied");
    } else {
        tracing::warn!(
            "{store} batch {index}: {succeeded} applied, {} failed",
            failed.len()
        );
    }
    BatchReport {
        store,
        index,
        attempted: ops.len(),
        attempts,
        succeeded,
        failed,
    }
}

// ---------------------------------------------------------------------------
// Mutator
// ---------------------------------------------------------------------------

/// Commits ops in bounded batches, one after the other.
pub struct BatchMutator<'a> {
    retry: &'a RetryPolicy,
    control: &'a PassControl,
    batch_pause: Duration,
}

impl<'a> BatchMutator<'a> {
    pub fn new(retry: &'a RetryPolicy, control: &'a PassControl, batch_pause: Duration) -> Self {
        Self {
            retry,
            control,
            batch_pause,
        }
    }

    /// Apply `ops` to `target` in chunks of at most `batch_size` (clamped to
    /// the store's own limit). Reports are appended as batches complete, so
    /// whatever ran before a cancellation or deadline stays visible.
    pub async fn apply<T: BatchTarget>(
        &self,
        target: &T,
        ops: &[T::Op],
        batch_size: usize,
        reports: &mut Vec<BatchReport>,
    ) -> Result<(), SyncError> {
        let size = batch_size.clamp(1, target.max_batch_size().max(1));
        for (index, chunk) in ops.chunks(size).enumerate() {
            if index > 0 {
                if self.batch_pause.is_zero() {
                    yield_now().await;
                } else {
                    sleep(self.batch_pause).await;
                }
            }
            self.control.check()?;
            reports.push(commit_with_retry(target, chunk, self.retry, index).await);
        }
        Ok(())
    }
}
