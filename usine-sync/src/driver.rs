//! The reconciliation driver.
//!
//! One pass walks `Enumerating → Diffing → Confirming → Mutating → Verifying`
//! and ends in `Done` or `Partial`. [`Reconciler::run`] never fails: faults,
//! cancellation, an exhausted time budget and a declined confirmation all
//! end the pass in `Partial` with whatever progress was made.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::io;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use usine_core::config::StoreLimits;
use usine_core::{
    FailureKind, IdentityStore, ItemFailure, ProfileStore, Role, Settings, StoreKind, UserId,
};

use crate::batch::{BatchMutator, BatchReport, IdentityDeletes, ProfileWrites};
use crate::confirm::Confirmation;
use crate::control::PassControl;
use crate::diff::{diff, DiffReport, DiffSummary};
use crate::enumerate::{snapshot, Snapshot};
use crate::error::{DuplicateEmailError, InvariantViolation, SyncError};
use crate::policy::{MutationPlan, Policy};
use crate::retry::RetryPolicy;

// ---------------------------------------------------------------------------
// Phases and outcome
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Enumerating,
    Diffing,
    Confirming,
    Mutating,
    Verifying,
    Done,
    Partial,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Enumerating => "enumerating",
            Phase::Diffing => "diffing",
            Phase::Confirming => "confirming",
            Phase::Mutating => "mutating",
            Phase::Verifying => "verifying",
            Phase::Done => "done",
            Phase::Partial => "partial",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Done,
    Partial,
}

/// Why a pass stopped before verifying.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum HaltReason {
    Fault(String),
    Cancelled,
    DeadlineExceeded,
    Declined,
}

impl fmt::Display for HaltReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HaltReason::Fault(reason) => write!(f, "fault: {reason}"),
            HaltReason::Cancelled => write!(f, "cancelled"),
            HaltReason::DeadlineExceeded => write!(f, "time budget exceeded"),
            HaltReason::Declined => write!(f, "confirmation declined"),
        }
    }
}

impl From<SyncError> for HaltReason {
    fn from(err: SyncError) -> Self {
        match err {
            SyncError::Cancelled => HaltReason::Cancelled,
            SyncError::DeadlineExceeded => HaltReason::DeadlineExceeded,
            other => HaltReason::Fault(other.to_string()),
        }
    }
}

/// What is left to reconcile, taken from the last diff of the pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Residual {
    pub identities: usize,
    pub profiles: usize,
    pub orphan_identities: usize,
    pub orphan_profiles: usize,
    pub duplicate_emails: usize,
    pub email_drift: usize,
}

impl From<&DiffReport> for Residual {
    fn from(report: &DiffReport) -> Self {
        Self {
            identities: report.identity_total,
            profiles: report.profile_total,
            orphan_identities: report.orphan_identities.len(),
            orphan_profiles: report.orphan_profiles.len(),
            duplicate_emails: report.duplicate_emails.len(),
            email_drift: report.email_drift.len(),
        }
    }
}

impl Residual {
    /// Nothing left that `policy` is responsible for.
    pub fn settles(&self, policy: Policy) -> bool {
        if self.duplicate_emails > 0 {
            return false;
        }
        match policy {
            Policy::DeleteAll => self.identities == 0 && self.profiles == 0,
            _ => {
                (!policy.repairs_identities() || self.orphan_identities == 0)
                    && (!policy.repairs_profiles() || self.orphan_profiles == 0)
            }
        }
    }
}

/// Structured result of one pass.
#[derive(Debug, Clone, Serialize)]
pub struct ReconcileReport {
    pub policy: Policy,
    pub outcome: Outcome,
    pub dry_run: bool,
    pub phases: Vec<Phase>,
    pub initial: Option<DiffSummary>,
    pub plan: MutationPlan,
    pub batches: Vec<BatchReport>,
    pub failures: Vec<ItemFailure>,
    pub duplicates: Vec<DuplicateEmailError>,
    /// `None` when the pass stopped before it could measure what is left.
    pub residual: Option<Residual>,
    pub violations: Vec<InvariantViolation>,
    pub halt: Option<HaltReason>,
    pub elapsed_ms: u64,
}

impl ReconcileReport {
    fn new(policy: Policy, dry_run: bool) -> Self {
        Self {
            policy,
            outcome: Outcome::Partial,
            dry_run,
            phases: Vec::new(),
            initial: None,
            plan: MutationPlan::default(),
            batches: Vec::new(),
            failures: Vec::new(),
            duplicates: Vec::new(),
            residual: None,
            violations: Vec::new(),
            halt: None,
            elapsed_ms: 0,
        }
    }

    pub fn is_done(&self) -> bool {
        self.outcome == Outcome::Done
    }

    /// `0` on `Done`, `1` otherwise.
    pub fn exit_code(&self) -> u8 {
        if self.is_done() {
            0
        } else {
            1
        }
    }
}

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct DriverOptions {
    /// Stop after diffing and report the plan.
    pub dry_run: bool,
    pub cancel: CancellationToken,
    /// Wall-clock bound for the whole pass.
    pub timeout: Option<Duration>,
    pub identity_limits: StoreLimits,
    pub profile_limits: StoreLimits,
    pub retry: RetryPolicy,
    pub batch_pause: Duration,
    pub default_role: Role,
}

impl Default for DriverOptions {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

impl DriverOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            dry_run: false,
            cancel: CancellationToken::new(),
            timeout: Some(settings.pass_timeout()),
            identity_limits: settings.identity,
            profile_limits: settings.profile,
            retry: RetryPolicy::from_settings(&settings.retry),
            batch_pause: settings.batch_pause(),
            default_role: settings.default_role,
        }
    }
}

/// Handles to both stores, built once by the caller.
#[derive(Clone, Copy)]
pub struct Stores<'a> {
    pub identities: &'a dyn IdentityStore,
    pub profiles: &'a dyn ProfileStore,
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

pub struct Reconciler<'a> {
    stores: Stores<'a>,
    options: DriverOptions,
    confirmation: &'a dyn Confirmation,
}

impl<'a> Reconciler<'a> {
    pub fn new(
        stores: Stores<'a>,
        options: DriverOptions,
        confirmation: &'a dyn Confirmation,
    ) -> Self {
        Self {
            stores,
            options,
            confirmation,
        }
    }

    /// Run one pass of `policy`.
    pub async fn run(&self, policy: Policy) -> ReconcileReport {
        let started = Instant::now();
        let control = PassControl::new(
            self.options.cancel.clone(),
            self.options.timeout.map(|budget| started + budget),
        );
        let mut report = ReconcileReport::new(policy, self.options.dry_run);
        self.pass(policy, &control, &mut report).await;

        let terminal = if report.is_done() {
            Phase::Done
        } else {
            Phase::Partial
        };
        enter(&mut report, terminal);
        report.elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        if let Some(halt) = &report.halt {
            tracing::warn!("{policy}: halted ({halt})");
        }
        report
    }

    /// Run `policy`, cancelling the pass if `interrupt` resolves first.
    ///
    /// `interrupt` is polled once before the pass starts, so a signal
    /// listener is in place before the first store call.
    pub async fn run_until_interrupted<F>(&self, policy: Policy, interrupt: F) -> ReconcileReport
    where
        F: Future<Output = io::Result<()>>,
    {
        let pass = self.run(policy);
        tokio::pin!(pass, interrupt);
        let mut listening = true;
        loop {
            tokio::select! {
                biased;
                heard = &mut interrupt, if listening => {
                    listening = false;
                    match heard {
                        Ok(()) => {
                            tracing::warn!("{policy}: interrupted; stopping before the next batch");
                            self.options.cancel.cancel();
                        }
                        Err(err) => tracing::warn!("{policy}: cannot listen for interrupts: {err}"),
                    }
                }
                report = &mut pass => return report,
            }
        }
    }

    async fn pass(&self, policy: Policy, control: &PassControl, report: &mut ReconcileReport) {
        enter(report, Phase::Enumerating);
        let before = match self.enumerate(control).await {
            Ok(snapshot) => snapshot,
            Err(err) => return halt(report, err.into()),
        };

        enter(report, Phase::Diffing);
        let initial = diff(&before.identities, &before.profiles);
        let summary = initial.summary();
        tracing::info!(
            "{policy}: {} identities, {} profiles, {} orphan identities, {} orphan profiles",
            summary.identities,
            summary.profiles,
            summary.orphan_identities,
            summary.orphan_profiles
        );
        for duplicate in &initial.duplicate_emails {
            tracing::warn!("{duplicate}");
        }
        report.initial = Some(summary);
        report.duplicates = initial.duplicate_emails.clone();
        report.plan = policy.plan(&initial, &before, self.options.default_role, Utc::now());
        let residual = Residual::from(&initial);

        if self.options.dry_run {
            for intent in &report.plan.intents {
                tracing::info!("[dry-run] would {intent}");
            }
            report.residual = Some(residual);
            report.outcome = settled(report.plan.is_empty() && residual.settles(policy));
            return;
        }

        if report.plan.is_destructive() {
            enter(report, Phase::Confirming);
            if !self.confirmation.confirm(policy, &report.plan) {
                report.residual = Some(residual);
                return halt(report, HaltReason::Declined);
            }
        }

        if report.plan.is_empty() {
            report.residual = Some(residual);
            report.outcome = settled(residual.settles(policy));
            return;
        }

        enter(report, Phase::Mutating);
        if let Err(err) = self.mutate(control, report).await {
            return halt(report, err.into());
        }

        enter(report, Phase::Verifying);
        let after = match self.enumerate(control).await {
            Ok(snapshot) => snapshot,
            Err(err) => return halt(report, err.into()),
        };
        let check = diff(&after.identities, &after.profiles);
        report.violations = check
            .orphan_profiles
            .iter()
            .map(|profile| InvariantViolation {
                store: StoreKind::Profile,
                id: profile.id.clone(),
            })
            .collect();
        for violation in &report.violations {
            tracing::warn!("{violation}");
        }
        let residual = Residual::from(&check);
        report.residual = Some(residual);
        report.outcome = settled(residual.settles(policy) && report.failures.is_empty());
    }

    async fn enumerate(&self, control: &PassControl) -> Result<Snapshot, SyncError> {
        snapshot(
            self.stores.identities,
            self.stores.profiles,
            (
                self.options.identity_limits.page_size,
                self.options.profile_limits.page_size,
            ),
            &self.options.retry,
            control,
        )
        .await
    }

    /// Profile writes, then profile deletes, then identity deletes.
    ///
    /// A donor profile is only deleted once the write carrying its content
    /// onto the real id has applied; otherwise it stays and is reported.
    async fn mutate(
        &self,
        control: &PassControl,
        report: &mut ReconcileReport,
    ) -> Result<(), SyncError> {
        let mutator = BatchMutator::new(&self.options.retry, control, self.options.batch_pause);
        let profiles = ProfileWrites(self.stores.profiles);
        let profile_batch = self.options.profile_limits.batch_size;

        let upserts = report.plan.profile_upserts();
        let mark = report.batches.len();
        let applied = mutator
            .apply(&profiles, &upserts, profile_batch, &mut report.batches)
            .await;
        absorb_failures(report, mark);
        applied?;

        let unwritten: HashMap<UserId, FailureKind> = report
            .failures
            .iter()
            .map(|failure| (failure.id.clone(), failure.kind))
            .collect();
        let rekeys = report.plan.rekeys();
        let mut kept = Vec::new();
        let mut deletes = report.plan.profile_deletes();
        deletes.retain(|op| {
            let Some(target) = rekeys.get(op.id()) else {
                return true;
            };
            match unwritten.get(*target) {
                Some(&kind) => {
                    tracing::warn!("keeping profile {}: move onto {target} did not apply", op.id());
                    kept.push(ItemFailure::new(
                        op.id().clone(),
                        kind,
                        format!("kept: move onto {target} did not apply"),
                    ));
                    false
                }
                None => true,
            }
        });
        report.failures.extend(kept);

        let mark = report.batches.len();
        let applied = mutator
            .apply(&profiles, &deletes, profile_batch, &mut report.batches)
            .await;
        absorb_failures(report, mark);
        applied?;

        let identity_deletes = report.plan.identity_deletes();
        let mark = report.batches.len();
        let applied = mutator
            .apply(
                &IdentityDeletes(self.stores.identities),
                &identity_deletes,
                self.options.identity_limits.batch_size,
                &mut report.batches,
            )
            .await;
        absorb_failures(report, mark);
        applied
    }
}

fn enter(report: &mut ReconcileReport, phase: Phase) {
    tracing::info!("{}: {phase}", report.policy);
    report.phases.push(phase);
}

fn halt(report: &mut ReconcileReport, reason: HaltReason) {
    report.outcome = Outcome::Partial;
    report.halt = Some(reason);
}

fn settled(done: bool) -> Outcome {
    if done {
        Outcome::Done
    } else {
        Outcome::Partial
    }
}

/// Fold the failures of every batch from `mark` on into the report.
fn absorb_failures(report: &mut ReconcileReport, mark: usize) {
    report.failures.extend(
        report.batches[mark..]
            .iter()
            .flat_map(|batch| batch.failed.iter().cloned()),
    );
}
