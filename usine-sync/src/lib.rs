//! # usine-sync
//!
//! Reconciliation of the identity store against the profile store.
//!
//! A pass is driven by [`Reconciler::run`]: both stores are enumerated, the
//! [`diff`] between them is turned into a [`MutationPlan`] by a [`Policy`],
//! the plan is committed in bounded batches with per-item retry, and the
//! stores are re-read to verify the result. [`provision`] seeds accounts
//! from a YAML file the same way, identity first.

pub mod batch;
pub mod confirm;
pub mod control;
pub mod diff;
pub mod driver;
pub mod enumerate;
pub mod error;
pub mod policy;
pub mod provision;
pub mod retry;

pub use batch::{BatchMutator, BatchReport};
pub use confirm::{AlwaysConfirm, Confirmation, InteractiveConfirm, NeverConfirm};
pub use control::PassControl;
pub use diff::{diff, DiffReport, DiffSummary};
pub use driver::{
    DriverOptions, HaltReason, Outcome, Phase, ReconcileReport, Reconciler, Residual, Stores,
};
pub use enumerate::{snapshot, Snapshot};
pub use error::{DuplicateEmailError, InvariantViolation, SyncError};
pub use policy::{Intent, MutationPlan, Policy};
pub use provision::{load_seed, provision, ProvisionAction, ProvisionResult, SeedFile};
pub use retry::{with_retry, RetryPolicy};
