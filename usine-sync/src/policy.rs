//! Reconciliation policies and the mutation plans they produce.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::Serialize;

use usine_core::{Email, ProfileOp, ProfileRecord, Role, UserId};

use crate::diff::{DiffReport, Misplaced};
use crate::enumerate::Snapshot;

/// What a reconciliation pass is allowed to change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Policy {
    /// Re-key misplaced profiles, create missing ones, fix email drift and
    /// delete orphan profiles.
    Sync,
    /// Only create profiles for identities that have none.
    CreateDefaults,
    /// Only delete orphan profiles.
    Cleanup,
    /// Delete every record in both stores.
    DeleteAll,
}

impl Policy {
    pub const ALL: [Policy; 4] = [
        Policy::Sync,
        Policy::CreateDefaults,
        Policy::Cleanup,
        Policy::DeleteAll,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Policy::Sync => "sync",
            Policy::CreateDefaults => "create-defaults",
            Policy::Cleanup => "cleanup",
            Policy::DeleteAll => "delete-all",
        }
    }

    /// Orphan identities are this policy's business.
    pub fn repairs_identities(self) -> bool {
        matches!(self, Policy::Sync | Policy::CreateDefaults)
    }

    /// Orphan profiles are this policy's business.
    pub fn repairs_profiles(self) -> bool {
        matches!(self, Policy::Sync | Policy::Cleanup)
    }

    /// Build the ordered list of intents for `diff`.
    ///
    /// Quarantined records never show up in a plan: `diff` keeps them out of
    /// every set, and `DeleteAll` filters the raw snapshot the same way.
    pub fn plan(
        self,
        diff: &DiffReport,
        snapshot: &Snapshot,
        default_role: Role,
        now: DateTime<Utc>,
    ) -> MutationPlan {
        let mut intents = Vec::new();
        match self {
            Policy::Sync => {
                plan_defaults(diff, default_role, now, &mut intents);
                for drift in &diff.email_drift {
                    let mut profile = drift.profile.clone();
                    profile.email = drift.identity_email.clone();
                    intents.push(Intent::UpsertProfile {
                        profile,
                        merge: true,
                        reason: UpsertReason::EmailDrift,
                    });
                }
                for profile in &diff.orphan_profiles {
                    intents.push(Intent::delete_profile(profile));
                }
            }
            Policy::CreateDefaults => plan_defaults(diff, default_role, now, &mut intents),
            Policy::Cleanup => {
                for profile in &diff.orphan_profiles {
                    intents.push(Intent::delete_profile(profile));
                }
            }
            Policy::DeleteAll => {
                let held = |id: &UserId| diff.quarantined.binary_search(id).is_ok();
                for profile in snapshot.profiles.iter().filter(|p| !held(&p.id)) {
                    intents.push(Intent::delete_profile(profile));
                }
                for identity in snapshot.identities.iter().filter(|i| !held(&i.id)) {
                    intents.push(Intent::DeleteIdentity {
                        id: identity.id.clone(),
                        email: identity.email.clone(),
                    });
                }
            }
        }
        MutationPlan::new(intents)
    }
}

/// One profile per orphan identity. A misplaced profile donates its content
/// to the identity it belongs to.
fn plan_defaults(
    diff: &DiffReport,
    default_role: Role,
    now: DateTime<Utc>,
    intents: &mut Vec<Intent>,
) {
    let donors: HashMap<&UserId, &Misplaced> = diff
        .misplaced
        .iter()
        .map(|m| (&m.identity.id, m))
        .collect();
    for identity in &diff.orphan_identities {
        let intent = match donors.get(&identity.id) {
            Some(misplaced) => Intent::UpsertProfile {
                profile: misplaced.profile.rekeyed_to(identity),
                merge: false,
                reason: UpsertReason::Rekey {
                    from: misplaced.profile.id.clone(),
                },
            },
            None => Intent::UpsertProfile {
                profile: ProfileRecord::for_identity(
                    identity,
                    Role::infer(&identity.email, default_role),
                    now,
                ),
                merge: false,
                reason: UpsertReason::Default,
            },
        };
        intents.push(intent);
    }
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Policy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Policy::ALL
            .into_iter()
            .find(|p| p.as_str() == s.trim())
            .ok_or_else(|| {
                format!("unknown policy '{s}'; expected: sync, create-defaults, cleanup, delete-all")
            })
    }
}

// ---------------------------------------------------------------------------
// Intents
// ---------------------------------------------------------------------------

/// Why a profile is being written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum UpsertReason {
    /// Fresh profile with an inferred role.
    Default,
    /// Content moved from a profile stored under another id.
    Rekey { from: UserId },
    /// Profile email brought in line with the identity.
    EmailDrift,
}

/// A single mutation against one store.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "kebab-case")]
pub enum Intent {
    UpsertProfile {
        profile: ProfileRecord,
        merge: bool,
        reason: UpsertReason,
    },
    DeleteProfile {
        id: UserId,
        email: Email,
    },
    DeleteIdentity {
        id: UserId,
        email: Email,
    },
}

impl Intent {
    fn delete_profile(profile: &ProfileRecord) -> Self {
        Intent::DeleteProfile {
            id: profile.id.clone(),
            email: profile.email.clone(),
        }
    }

    pub fn id(&self) -> &UserId {
        match self {
            Intent::UpsertProfile { profile, .. } => &profile.id,
            Intent::DeleteProfile { id, .. } | Intent::DeleteIdentity { id, .. } => id,
        }
    }

    pub fn is_delete(&self) -> bool {
        !matches!(self, Intent::UpsertProfile { .. })
    }

    /// Upserts, then profile deletes, then identity deletes.
    fn rank(&self) -> u8 {
        match self {
            Intent::UpsertProfile { .. } => 0,
            Intent::DeleteProfile { .. } => 1,
            Intent::DeleteIdentity { .. } => 2,
        }
    }
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Intent::UpsertProfile {
                profile, reason, ..
            } => match reason {
                UpsertReason::Default => write!(
                    f,
                    "create profile {} <{}> as {}",
                    profile.id, profile.email, profile.role
                ),
                UpsertReason::Rekey { from } => write!(
                    f,
                    "move profile {from} onto {} <{}>",
                    profile.id, profile.email
                ),
                UpsertReason::EmailDrift => write!(
                    f,
                    "update profile {} email to <{}>",
                    profile.id, profile.email
                ),
            },
            Intent::DeleteProfile { id, email } => write!(f, "delete profile {id} <{email}>"),
            Intent::DeleteIdentity { id, email } => write!(f, "delete identity {id} <{email}>"),
        }
    }
}

// ---------------------------------------------------------------------------
// Plan
// ---------------------------------------------------------------------------

/// Intents in the order they will be committed.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MutationPlan {
    pub intents: Vec<Intent>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PlanSummary {
    pub profile_upserts: usize,
    pub profile_deletes: usize,
    pub identity_deletes: usize,
}

impl MutationPlan {
    pub fn new(mut intents: Vec<Intent>) -> Self {
        intents.sort_by_key(Intent::rank);
        Self { intents }
    }

    pub fn is_empty(&self) -> bool {
        self.intents.is_empty()
    }

    pub fn len(&self) -> usize {
        self.intents.len()
    }

    /// The plan deletes something.
    pub fn is_destructive(&self) -> bool {
        self.intents.iter().any(Intent::is_delete)
    }

    /// Profile writes, committed before any delete.
    pub fn profile_upserts(&self) -> Vec<ProfileOp> {
        self.intents
            .iter()
            .filter_map(|intent| match intent {
                Intent::UpsertProfile { profile, merge, .. } => Some(ProfileOp::Set {
                    profile: profile.clone(),
                    merge: *merge,
                }),
                _ => None,
            })
            .collect()
    }

    pub fn profile_deletes(&self) -> Vec<ProfileOp> {
        self.intents
            .iter()
            .filter_map(|intent| match intent {
                Intent::DeleteProfile { id, .. } => Some(ProfileOp::Delete { id: id.clone() }),
                _ => None,
            })
            .collect()
    }

    /// Donor profile id → the id its content is moved onto.
    pub fn rekeys(&self) -> HashMap<&UserId, &UserId> {
        self.intents
            .iter()
            .filter_map(|intent| match intent {
                Intent::UpsertProfile {
                    profile,
                    reason: UpsertReason::Rekey { from },
                    ..
                } => Some((from, &profile.id)),
                _ => None,
            })
            .collect()
    }

    pub fn identity_deletes(&self) -> Vec<UserId> {
        self.intents
            .iter()
            .filter_map(|intent| match intent {
                Intent::DeleteIdentity { id, .. } => Some(id.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn summary(&self) -> PlanSummary {
        let mut summary = PlanSummary::default();
        for intent in &self.intents {
            match intent {
                Intent::UpsertProfile { .. } => summary.profile_upserts += 1,
                Intent::DeleteProfile { .. } => summary.profile_deletes += 1,
                Intent::DeleteIdentity { .. } => summary.identity_deletes += 1,
            }
        }
        summary
    }
}
