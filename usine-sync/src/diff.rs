//! Set difference between the identity and profile stores.
//!
//! [`diff`] is pure: it takes the full contents of both stores and returns
//! disjoint `orphan_identities`, `orphan_profiles` and `consistent` sets.
//!
//! Records whose email is shared by another id in the same store are
//! quarantined before anything else happens. They land in none of the three
//! sets, so no policy can mutate them, and the shared email is reported as a
//! [`DuplicateEmailError`].

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::Serialize;

use usine_core::{Email, IdentityRecord, ProfileRecord, StoreKind, UserId};

use crate::error::DuplicateEmailError;

/// A profile written under a guessed id whose email matches an identity that
/// has no profile.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Misplaced {
    pub profile: ProfileRecord,
    pub identity: IdentityRecord,
}

/// A consistent id whose profile email differs from the identity email.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmailDrift {
    pub identity_email: Email,
    pub profile: ProfileRecord,
}

/// Output of [`diff`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DiffReport {
    pub identity_total: usize,
    pub profile_total: usize,
    pub orphan_identities: Vec<IdentityRecord>,
    pub orphan_profiles: Vec<ProfileRecord>,
    pub consistent: Vec<UserId>,
    pub duplicate_emails: Vec<DuplicateEmailError>,
    /// Pairs drawn from the two orphan sets.
    pub misplaced: Vec<Misplaced>,
    /// Subset of `consistent`.
    pub email_drift: Vec<EmailDrift>,
    /// Ids held back because of a duplicate email.
    pub quarantined: Vec<UserId>,
}

/// Counts only; cheap to log and serialize.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DiffSummary {
    pub identities: usize,
    pub profiles: usize,
    pub orphan_identities: usize,
    pub orphan_profiles: usize,
    pub consistent: usize,
    pub duplicate_emails: usize,
    pub misplaced: usize,
    pub email_drift: usize,
    pub quarantined: usize,
}

impl DiffReport {
    pub fn summary(&self) -> DiffSummary {
        DiffSummary {
            identities: self.identity_total,
            profiles: self.profile_total,
            orphan_identities: self.orphan_identities.len(),
            orphan_profiles: self.orphan_profiles.len(),
            consistent: self.consistent.len(),
            duplicate_emails: self.duplicate_emails.len(),
            misplaced: self.misplaced.len(),
            email_drift: self.email_drift.len(),
            quarantined: self.quarantined.len(),
        }
    }

    /// Both stores in bijection over id, with no duplicate email anywhere.
    pub fn is_consistent(&self) -> bool {
        self.orphan_identities.is_empty()
            && self.orphan_profiles.is_empty()
            && self.duplicate_emails.is_empty()
    }
}

/// Group ids by normalized email and report every email held by more than
/// one distinct id.
fn duplicates<'a>(
    store: StoreKind,
    records: impl Iterator<Item = (&'a UserId, &'a Email)>,
) -> Vec<DuplicateEmailError> {
    let mut by_email: BTreeMap<String, Vec<UserId>> = BTreeMap::new();
    for (id, email) in records {
        let ids = by_email.entry(email.normalized()).or_default();
        if !ids.contains(id) {
            ids.push(id.clone());
        }
    }
    by_email
        .into_iter()
        .filter(|(_, ids)| ids.len() > 1)
        .map(|(email, mut ids)| {
            ids.sort();
            DuplicateEmailError { email, store, ids }
        })
        .collect()
}

/// Compute the difference between the two stores.
pub fn diff(identities: &[IdentityRecord], profiles: &[ProfileRecord]) -> DiffReport {
    let mut duplicate_emails = duplicates(
        StoreKind::Identity,
        identities.iter().map(|r| (&r.id, &r.email)),
    );
    duplicate_emails.extend(duplicates(
        StoreKind::Profile,
        profiles.iter().map(|r| (&r.id, &r.email)),
    ));

    // Quarantine by email first, then by id so that the counterpart of a
    // quarantined record is held back too.
    let bad_emails: HashSet<&str> = duplicate_emails.iter().map(|d| d.email.as_str()).collect();
    let mut quarantined: HashSet<UserId> = HashSet::new();
    for record in identities {
        if bad_emails.contains(record.email.normalized().as_str()) {
            quarantined.insert(record.id.clone());
        }
    }
    for record in profiles {
        if bad_emails.contains(record.email.normalized().as_str()) {
            quarantined.insert(record.id.clone());
        }
    }

    let identity_by_id: HashMap<&UserId, &IdentityRecord> = identities
        .iter()
        .filter(|r| !quarantined.contains(&r.id))
        .map(|r| (&r.id, r))
        .collect();
    let profile_by_id: HashMap<&UserId, &ProfileRecord> = profiles
        .iter()
        .filter(|r| !quarantined.contains(&r.id))
        .map(|r| (&r.id, r))
        .collect();

    let mut orphan_identities = Vec::new();
    let mut consistent = Vec::new();
    let mut email_drift = Vec::new();
    for (&id, &identity) in &identity_by_id {
        match profile_by_id.get(id) {
            Some(&profile) => {
                consistent.push(id.clone());
                if profile.email.normalized() != identity.email.normalized() {
                    email_drift.push(EmailDrift {
                        identity_email: identity.email.clone(),
                        profile: profile.clone(),
                    });
                }
            }
            None => orphan_identities.push(identity.clone()),
        }
    }
    let mut orphan_profiles: Vec<ProfileRecord> = profile_by_id
        .iter()
        .filter(|(id, _)| !identity_by_id.contains_key(**id))
        .map(|(_, &profile)| profile.clone())
        .collect();

    // Hash lookups keep this linear; reports still come out in id order.
    consistent.sort();
    orphan_identities.sort_by(|a, b| a.id.cmp(&b.id));
    orphan_profiles.sort_by(|a, b| a.id.cmp(&b.id));
    email_drift.sort_by(|a, b| a.profile.id.cmp(&b.profile.id));

    let orphan_identity_by_email: HashMap<String, &IdentityRecord> = orphan_identities
        .iter()
        .map(|r| (r.email.normalized(), r))
        .collect();
    let misplaced = orphan_profiles
        .iter()
        .filter_map(|profile| {
            orphan_identity_by_email
                .get(&profile.email.normalized())
                .map(|identity| Misplaced {
                    profile: profile.clone(),
                    identity: (*identity).clone(),
                })
        })
        .collect();

    let mut quarantined: Vec<UserId> = quarantined.into_iter().collect();
    quarantined.sort();

    DiffReport {
        identity_total: identities.len(),
        profile_total: profiles.len(),
        orphan_identities,
        orphan_profiles,
        consistent,
        duplicate_emails,
        misplaced,
        email_drift,
        quarantined,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
