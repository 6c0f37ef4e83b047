use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use usine_core::config::StoreLimits;
use usine_core::memory::{MemoryIdentityStore, MemoryProfileStore};
use usine_core::{Email, FailureKind, IdentityRecord, ProfileRecord, Role, StoreKind, UserId};
use usine_sync::{
    AlwaysConfirm, Confirmation, DriverOptions, HaltReason, Intent, MutationPlan, NeverConfirm,
    Outcome, Phase, Policy, ReconcileReport, Reconciler, RetryPolicy, Stores,
};
use usine_sync::retry::Backoff;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn identity(id: &str, email: &str) -> IdentityRecord {
    IdentityRecord {
        id: UserId::from(id),
        email: Email::from(email),
        credential_hash: None,
        disabled: false,
        created_at: Utc::now(),
    }
}

fn profile(id: &str, email: &str) -> ProfileRecord {
    ProfileRecord::for_identity(&identity(id, email), Role::Customer, Utc::now())
}

fn options() -> DriverOptions {
    DriverOptions {
        retry: RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            backoff: Backoff::Linear,
            jitter: false,
        },
        ..DriverOptions::default()
    }
}

async fn run(
    identities: &MemoryIdentityStore,
    profiles: &MemoryProfileStore,
    options: DriverOptions,
    confirmation: &dyn Confirmation,
    policy: Policy,
) -> ReconcileReport {
    init_logging();
    let stores = Stores {
        identities,
        profiles,
    };
    Reconciler::new(stores, options, confirmation)
        .run(policy)
        .await
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn four_identities_get_default_profiles() {
    let identities = MemoryIdentityStore::with_records([
        identity("u1", "admin@usine.fr"),
        identity("u2", "fournisseur@usine.fr"),
        identity("u3", "influenceuse@usine.fr"),
        identity("u4", "marie.curie@usine.fr"),
    ]);
    let profiles = MemoryProfileStore::new();

    let report = run(
        &identities,
        &profiles,
        options(),
        &NeverConfirm,
        Policy::CreateDefaults,
    )
    .await;

    let initial = report.initial.expect("initial diff");
    assert_eq!(initial.orphan_identities, 4);
    assert_eq!(initial.orphan_profiles, 0);
    assert_eq!(report.plan.summary().profile_upserts, 4);
    assert_eq!(profiles.calls().items, 4);
    assert_eq!(profiles.len(), 4);

    let residual = report.residual.expect("residual");
    assert_eq!(residual.orphan_identities, 0);
    assert_eq!(residual.orphan_profiles, 0);
    assert_eq!(report.outcome, Outcome::Done);
    assert_eq!(report.exit_code(), 0);
    assert_eq!(
        report.phases,
        vec![
            Phase::Enumerating,
            Phase::Diffing,
            Phase::Mutating,
            Phase::Verifying,
            Phase::Done
        ]
    );

    let roles: Vec<Role> = ["u1", "u2", "u3", "u4"]
        .iter()
        .map(|id| profiles.get(&UserId::from(*id)).expect("profile").role)
        .collect();
    assert_eq!(
        roles,
        vec![Role::Admin, Role::Supplier, Role::Influencer, Role::Customer]
    );
    let marie = profiles.get(&UserId::from("u4")).expect("profile");
    assert_eq!(marie.name, "Marie Curie");
}

#[tokio::test(start_paused = true)]
async fn dry_run_reports_deletion_without_deleting() {
    let identities = MemoryIdentityStore::new();
    let profiles = MemoryProfileStore::with_records([profile("temp-uid", "shop@usine.fr")]);

    let report = run(
        &identities,
        &profiles,
        DriverOptions {
            dry_run: true,
            ..options()
        },
        &AlwaysConfirm,
        Policy::Cleanup,
    )
    .await;

    assert_eq!(report.initial.expect("initial").orphan_profiles, 1);
    assert_eq!(
        report.plan.intents[0].to_string(),
        "delete profile temp-uid <shop@usine.fr>"
    );
    assert_eq!(profiles.calls().write_batch, 0);
    assert_eq!(profiles.len(), 1);
    assert!(report.dry_run);
    assert_eq!(report.outcome, Outcome::Partial);
    assert_eq!(
        report.phases,
        vec![Phase::Enumerating, Phase::Diffing, Phase::Partial]
    );
}

#[tokio::test(start_paused = true)]
async fn dry_run_on_converged_stores_is_done() {
    let identities = MemoryIdentityStore::with_records([identity("u1", "a@usine.fr")]);
    let profiles = MemoryProfileStore::with_records([profile("u1", "a@usine.fr")]);

    let report = run(
        &identities,
        &profiles,
        DriverOptions {
            dry_run: true,
            ..options()
        },
        &NeverConfirm,
        Policy::Sync,
    )
    .await;

    assert!(report.plan.is_empty());
    assert_eq!(report.outcome, Outcome::Done);
}

#[tokio::test(start_paused = true)]
async fn permanent_failure_in_a_batch_of_500_is_isolated() {
    let identities = MemoryIdentityStore::new();
    let profiles = MemoryProfileStore::with_records(
        (0..500).map(|i| profile(&format!("temp-{i:04}"), &format!("ghost{i}@usine.fr"))),
    );
    profiles.fail_permanently("temp-0137", "document is locked");

    let report = run(
        &identities,
        &profiles,
        options(),
        &AlwaysConfirm,
        Policy::Cleanup,
    )
    .await;

    assert_eq!(report.batches.len(), 1);
    let batch = &report.batches[0];
    assert_eq!(batch.attempted, 500);
    assert_eq!(batch.succeeded, 499);
    assert_eq!(batch.attempts, 1, "permanent failures are not retried");
    assert_eq!(profiles.calls().write_batch, 1);

    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].id, UserId::from("temp-0137"));
    assert_eq!(report.failures[0].kind, FailureKind::Permanent);
    assert_eq!(report.failures[0].reason, "document is locked");

    assert_eq!(report.outcome, Outcome::Partial);
    assert_eq!(report.residual.expect("residual").orphan_profiles, 1);
    assert_eq!(report.violations.len(), 1);
    assert_eq!(report.violations[0].store, StoreKind::Profile);
}

#[tokio::test(start_paused = true)]
async fn duplicate_email_halts_in_partial_even_when_forced() {
    let identities = MemoryIdentityStore::with_records([
        identity("u1", "a@b.com"),
        identity("u2", "a@b.com"),
        identity("u3", "c@b.com"),
    ]);
    let profiles = MemoryProfileStore::new();

    let report = run(&identities, &profiles, options(), &AlwaysConfirm, Policy::Sync).await;

    assert_eq!(report.duplicates.len(), 1);
    assert_eq!(report.duplicates[0].email, "a@b.com");
    assert_eq!(report.duplicates[0].store, StoreKind::Identity);
    assert_eq!(report.outcome, Outcome::Partial);
    assert_eq!(report.exit_code(), 1);
    assert_eq!(report.residual.expect("residual").duplicate_emails, 1);

    // The quarantined pair is untouched; the unrelated orphan is repaired.
    assert!(profiles.get(&UserId::from("u1")).is_none());
    assert!(profiles.get(&UserId::from("u2")).is_none());
    assert!(profiles.get(&UserId::from("u3")).is_some());
    assert_eq!(identities.len(), 3);
}

// ---------------------------------------------------------------------------
// Properties
// ---------------------------------------------------------------------------

fn drifted_stores() -> (MemoryIdentityStore, MemoryProfileStore) {
    let identities = MemoryIdentityStore::with_records([
        identity("u1", "a@usine.fr"),
        identity("u2", "b@usine.fr"),
        identity("real-uid", "shop@usine.fr"),
    ]);
    let mut misplaced = profile("temp-uid", "shop@usine.fr");
    misplaced.role = Role::Supplier;
    misplaced.company = Some("Atelier Lumière".to_string());
    let profiles = MemoryProfileStore::with_records([
        profile("u1", "a@usine.fr"),
        profile("orphan", "gone@usine.fr"),
        misplaced,
    ]);
    (identities, profiles)
}

#[tokio::test(start_paused = true)]
async fn sync_is_idempotent() {
    let (identities, profiles) = drifted_stores();

    let first = run(&identities, &profiles, options(), &AlwaysConfirm, Policy::Sync).await;
    assert_eq!(first.outcome, Outcome::Done);

    let writes = profiles.calls().write_batch;
    let second = run(&identities, &profiles, options(), &AlwaysConfirm, Policy::Sync).await;
    assert_eq!(second.outcome, Outcome::Done);
    assert!(second.plan.is_empty());
    assert!(second.batches.is_empty());
    assert_eq!(profiles.calls().write_batch, writes);
    assert!(!second.phases.contains(&Phase::Mutating));
}

#[tokio::test(start_paused = true)]
async fn sync_rekeys_misplaced_profile_onto_real_id() {
    let (identities, profiles) = drifted_stores();

    let report = run(&identities, &profiles, options(), &AlwaysConfirm, Policy::Sync).await;

    assert_eq!(report.outcome, Outcome::Done);
    let moved = profiles.get(&UserId::from("real-uid")).expect("re-keyed");
    assert_eq!(moved.role, Role::Supplier);
    assert_eq!(moved.company.as_deref(), Some("Atelier Lumière"));
    assert!(profiles.get(&UserId::from("temp-uid")).is_none());
    assert!(profiles.get(&UserId::from("orphan")).is_none());
    assert!(profiles.get(&UserId::from("u2")).is_some());
    assert_eq!(profiles.len(), 3);
    assert!(report.phases.contains(&Phase::Confirming));
}

#[tokio::test(start_paused = true)]
async fn failed_move_keeps_the_donor_profile() {
    let (identities, profiles) = drifted_stores();
    profiles.fail_transiently("real-uid", 3);

    let first = run(&identities, &profiles, options(), &AlwaysConfirm, Policy::Sync).await;

    assert_eq!(first.outcome, Outcome::Partial);
    assert!(profiles.get(&UserId::from("real-uid")).is_none());
    let donor = profiles.get(&UserId::from("temp-uid")).expect("donor kept");
    assert_eq!(donor.company.as_deref(), Some("Atelier Lumière"));
    assert!(profiles.get(&UserId::from("orphan")).is_none());

    let failed: Vec<&str> = first.failures.iter().map(|f| f.id.0.as_str()).collect();
    assert_eq!(failed, vec!["real-uid", "temp-uid"]);
    assert!(first.failures.iter().all(|f| f.kind == FailureKind::Transient));
    assert!(first.failures[1].reason.contains("real-uid"));
    assert_eq!(first.residual.expect("residual").orphan_profiles, 1);
    assert_eq!(first.violations.len(), 1);

    let second = run(&identities, &profiles, options(), &AlwaysConfirm, Policy::Sync).await;

    assert_eq!(second.outcome, Outcome::Done);
    let moved = profiles.get(&UserId::from("real-uid")).expect("re-keyed");
    assert_eq!(moved.role, Role::Supplier);
    assert_eq!(moved.company.as_deref(), Some("Atelier Lumière"));
    assert!(profiles.get(&UserId::from("temp-uid")).is_none());
}

#[tokio::test(start_paused = true)]
async fn rejected_move_keeps_the_donor_profile() {
    let (identities, profiles) = drifted_stores();
    profiles.fail_permanently("real-uid", "document rejected");

    let report = run(&identities, &profiles, options(), &AlwaysConfirm, Policy::Sync).await;

    assert_eq!(report.outcome, Outcome::Partial);
    assert!(profiles.get(&UserId::from("temp-uid")).is_some());
    let kept = report
        .failures
        .iter()
        .find(|f| f.id == UserId::from("temp-uid"))
        .expect("donor reported");
    assert_eq!(kept.kind, FailureKind::Permanent);
}

#[tokio::test(start_paused = true)]
async fn sync_updates_drifted_email() {
    let identities = MemoryIdentityStore::with_records([identity("u1", "new@usine.fr")]);
    let mut stale = profile("u1", "old@usine.fr");
    stale.favorites = vec!["p-42".to_string()];
    let profiles = MemoryProfileStore::with_records([stale]);

    let report = run(&identities, &profiles, options(), &NeverConfirm, Policy::Sync).await;

    assert_eq!(report.outcome, Outcome::Done);
    let updated = profiles.get(&UserId::from("u1")).expect("profile");
    assert_eq!(updated.email, Email::from("new@usine.fr"));
    assert_eq!(updated.favorites, vec!["p-42".to_string()]);
    assert_eq!(report.residual.expect("residual").email_drift, 0);
}

#[tokio::test(start_paused = true)]
async fn repeated_passes_converge_after_transient_failures() {
    let identities = MemoryIdentityStore::with_records([
        identity("u1", "a@usine.fr"),
        identity("u2", "b@usine.fr"),
    ]);
    let profiles = MemoryProfileStore::new();
    profiles.fail_transiently("u2", 3);

    let first = run(
        &identities,
        &profiles,
        options(),
        &NeverConfirm,
        Policy::CreateDefaults,
    )
    .await;
    assert_eq!(first.outcome, Outcome::Partial);
    assert_eq!(first.failures.len(), 1);
    assert_eq!(first.failures[0].kind, FailureKind::Transient);
    assert!(first.failures[0].reason.contains("gave up after 3 attempts"));
    assert_eq!(first.batches[0].attempts, 3);
    assert_eq!(first.residual.expect("residual").orphan_identities, 1);

    let second = run(
        &identities,
        &profiles,
        options(),
        &NeverConfirm,
        Policy::CreateDefaults,
    )
    .await;
    assert_eq!(second.outcome, Outcome::Done);
    assert_eq!(second.plan.len(), 1);
    assert_eq!(profiles.len(), 2);
}

// ---------------------------------------------------------------------------
// Gates and bounds
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn declined_confirmation_mutates_nothing() {
    let identities = MemoryIdentityStore::new();
    let profiles = MemoryProfileStore::with_records([profile("temp-uid", "shop@usine.fr")]);

    let report = run(
        &identities,
        &profiles,
        options(),
        &NeverConfirm,
        Policy::Cleanup,
    )
    .await;

    assert_eq!(report.halt, Some(HaltReason::Declined));
    assert_eq!(report.outcome, Outcome::Partial);
    assert_eq!(
        report.phases,
        vec![
            Phase::Enumerating,
            Phase::Diffing,
            Phase::Confirming,
            Phase::Partial
        ]
    );
    assert_eq!(profiles.calls().write_batch, 0);
    assert_eq!(profiles.len(), 1);
}

/// Approves the plan and cancels the pass in the same breath.
struct ApproveThenCancel(CancellationToken);

impl Confirmation for ApproveThenCancel {
    fn confirm(&self, _: Policy, _: &MutationPlan) -> bool {
        self.0.cancel();
        true
    }
}

#[tokio::test(start_paused = true)]
async fn cancellation_is_checked_before_each_batch() {
    let identities = MemoryIdentityStore::new();
    let profiles = MemoryProfileStore::with_records([profile("temp-uid", "shop@usine.fr")]);
    let token = CancellationToken::new();

    let report = run(
        &identities,
        &profiles,
        DriverOptions {
            cancel: token.clone(),
            ..options()
        },
        &ApproveThenCancel(token),
        Policy::Cleanup,
    )
    .await;

    assert_eq!(report.halt, Some(HaltReason::Cancelled));
    assert_eq!(report.outcome, Outcome::Partial);
    assert!(report.batches.is_empty());
    assert!(report.residual.is_none());
    assert!(!report.phases.contains(&Phase::Verifying));
    assert_eq!(profiles.len(), 1);
}

fn many_identities(count: usize) -> MemoryIdentityStore {
    MemoryIdentityStore::with_records(
        (0..count).map(|i| identity(&format!("uid-{i:05}"), &format!("user{i}@usine.fr"))),
    )
}

#[tokio::test]
async fn interrupt_during_pass_stops_before_next_batch() {
    init_logging();
    let identities = many_identities(1_200);
    let profiles = MemoryProfileStore::new();
    let stores = Stores {
        identities: &identities,
        profiles: &profiles,
    };
    let reconciler = Reconciler::new(stores, options(), &NeverConfirm);

    // Fires on its second poll, i.e. the first time the pass yields.
    let interrupt = async {
        tokio::task::yield_now().await;
        Ok::<(), std::io::Error>(())
    };
    let report = reconciler
        .run_until_interrupted(Policy::CreateDefaults, interrupt)
        .await;

    assert_eq!(report.halt, Some(HaltReason::Cancelled));
    assert_eq!(report.outcome, Outcome::Partial);
    assert_eq!(report.batches.len(), 1);
    assert_eq!(profiles.len(), 500);
}

#[tokio::test]
async fn broken_interrupt_listener_lets_the_pass_finish() {
    init_logging();
    let identities = many_identities(3);
    let profiles = MemoryProfileStore::new();
    let stores = Stores {
        identities: &identities,
        profiles: &profiles,
    };
    let reconciler = Reconciler::new(stores, options(), &NeverConfirm);

    let interrupt = async { Err::<(), _>(std::io::Error::other("no signal handler")) };
    let report = reconciler
        .run_until_interrupted(Policy::CreateDefaults, interrupt)
        .await;

    assert_eq!(report.outcome, Outcome::Done);
    assert_eq!(profiles.len(), 3);
}

#[tokio::test(start_paused = true)]
async fn deadline_stops_between_batches() {
    let identities =
        MemoryIdentityStore::with_records((0..6).map(|i| identity(&format!("u{i}"), &format!("user{i}@usine.fr"))));
    let profiles = MemoryProfileStore::new();

    let report = run(
        &identities,
        &profiles,
        DriverOptions {
            timeout: Some(Duration::from_millis(1_500)),
            batch_pause: Duration::from_secs(1),
            profile_limits: StoreLimits {
                page_size: 500,
                batch_size: 2,
            },
            ..options()
        },
        &NeverConfirm,
        Policy::CreateDefaults,
    )
    .await;

    assert_eq!(report.halt, Some(HaltReason::DeadlineExceeded));
    assert_eq!(report.batches.len(), 2);
    assert_eq!(profiles.len(), 4);
    assert_eq!(report.exit_code(), 1);
}

#[tokio::test(start_paused = true)]
async fn enumeration_fault_ends_in_partial() {
    let identities = MemoryIdentityStore::new();
    let profiles = MemoryProfileStore::new();
    identities.fail_next_lists(10);

    let report = run(&identities, &profiles, options(), &AlwaysConfirm, Policy::Sync).await;

    assert!(matches!(report.halt, Some(HaltReason::Fault(_))));
    assert_eq!(report.phases, vec![Phase::Enumerating, Phase::Partial]);
    assert_eq!(identities.calls().list, 3);
}

#[tokio::test(start_paused = true)]
async fn delete_all_empties_both_stores_profiles_first() {
    let identities = MemoryIdentityStore::with_records([
        identity("u1", "a@usine.fr"),
        identity("u2", "b@usine.fr"),
        identity("u3", "c@usine.fr"),
    ]);
    let profiles = MemoryProfileStore::with_records([
        profile("u1", "a@usine.fr"),
        profile("temp-uid", "t@usine.fr"),
    ]);

    let report = run(
        &identities,
        &profiles,
        options(),
        &AlwaysConfirm,
        Policy::DeleteAll,
    )
    .await;

    assert_eq!(report.outcome, Outcome::Done);
    assert!(identities.is_empty());
    assert!(profiles.is_empty());
    let stores: Vec<StoreKind> = report.batches.iter().map(|b| b.store).collect();
    assert_eq!(stores, vec![StoreKind::Profile, StoreKind::Identity]);
    assert!(matches!(
        report.plan.intents.last(),
        Some(Intent::DeleteIdentity { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn large_stores_are_paged_and_batched() {
    let identities = MemoryIdentityStore::with_records(
        (0..2_345).map(|i| identity(&format!("uid-{i:05}"), &format!("user{i}@usine.fr"))),
    );
    let profiles = MemoryProfileStore::new();

    let report = run(
        &identities,
        &profiles,
        options(),
        &NeverConfirm,
        Policy::CreateDefaults,
    )
    .await;

    assert_eq!(report.outcome, Outcome::Done);
    assert_eq!(report.batches.len(), 5);
    assert!(report.batches.iter().all(|b| b.attempted <= 500));
    assert_eq!(profiles.len(), 2_345);
}
