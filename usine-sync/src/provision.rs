//! Seeding accounts from a YAML file.
//!
//! Each seed entry is looked up by email, created in the identity store when
//! absent, and then given a profile keyed by the id the identity store
//! returned. Running the same seed twice changes nothing, and a profile that
//! already exists keeps every field the seed does not name.

use std::path::Path;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use usine_core::{
    Email, IdentityRecord, IdentityStore, ProfileRecord, ProfileStore, Role, SetOptions,
    StoreError, UserId,
};

use crate::error::SyncError;
use crate::retry::{with_retry, RetryPolicy};

/// One account to provision.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SeedUser {
    pub email: Email,
    pub password: String,
    /// Inferred from the email when absent.
    #[serde(default)]
    pub role: Option<Role>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub company: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SeedFile {
    #[serde(default)]
    pub users: Vec<SeedUser>,
}

pub fn load_seed(path: &Path) -> Result<SeedFile, SyncError> {
    let raw = std::fs::read_to_string(path).map_err(|source| SyncError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_yaml::from_str(&raw).map_err(|source| SyncError::Seed {
        path: path.to_path_buf(),
        source,
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", content = "reason", rename_all = "kebab-case")]
pub enum ProvisionAction {
    Created,
    Existing,
    WouldCreate,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProvisionResult {
    pub email: Email,
    pub id: Option<UserId>,
    #[serde(flatten)]
    pub action: ProvisionAction,
}

/// Provision every entry of `seed`, one after the other.
pub async fn provision(
    identities: &dyn IdentityStore,
    profiles: &dyn ProfileStore,
    seed: &SeedFile,
    retry: &RetryPolicy,
    default_role: Role,
    dry_run: bool,
) -> Vec<ProvisionResult> {
    let mut results = Vec::with_capacity(seed.users.len());
    for user in &seed.users {
        let result = match provision_one(identities, profiles, user, retry, default_role, dry_run)
            .await
        {
            Ok(result) => result,
            Err(err) => {
                tracing::warn!("provisioning {} failed: {err}", user.email);
                ProvisionResult {
                    email: user.email.clone(),
                    id: None,
                    action: ProvisionAction::Failed(err.to_string()),
                }
            }
        };
        results.push(result);
    }
    results
}

async fn provision_one(
    identities: &dyn IdentityStore,
    profiles: &dyn ProfileStore,
    user: &SeedUser,
    retry: &RetryPolicy,
    default_role: Role,
    dry_run: bool,
) -> Result<ProvisionResult, StoreError> {
    let existing = with_retry(retry, "look up identity", StoreError::is_transient, || {
        identities.get_identity_by_email(&user.email)
    })
    .await?;

    let (identity, action) = match existing {
        Some(identity) => (identity, ProvisionAction::Existing),
        None if dry_run => {
            tracing::info!("[dry-run] would create {}", user.email);
            return Ok(ProvisionResult {
                email: user.email.clone(),
                id: None,
                action: ProvisionAction::WouldCreate,
            });
        }
        None => {
            let id = with_retry(retry, "create identity", StoreError::is_transient, || {
                identities.create_identity(&user.email, &user.password)
            })
            .await?;
            let identity = IdentityRecord {
                id,
                email: user.email.clone(),
                credential_hash: None,
                disabled: false,
                created_at: Utc::now(),
            };
            (identity, ProvisionAction::Created)
        }
    };

    if !dry_run {
        write_profile(profiles, user, &identity, retry, default_role).await?;
    }

    Ok(ProvisionResult {
        email: user.email.clone(),
        id: Some(identity.id),
        action,
    })
}

/// Give `identity` its profile. A profile that already exists only takes
/// the fields the seed spells out; everything else is left as the
/// operator last set it.
async fn write_profile(
    profiles: &dyn ProfileStore,
    user: &SeedUser,
    identity: &IdentityRecord,
    retry: &RetryPolicy,
    default_role: Role,
) -> Result<(), StoreError> {
    let current = with_retry(retry, "read profile", StoreError::is_transient, || {
        profiles.get_profile(&identity.id)
    })
    .await?;

    let profile = match current {
        None => seed_profile(user, identity, default_role),
        Some(current) => match seeded_fields(user, &current) {
            Some(updated) => updated,
            None => {
                tracing::debug!("profile {} already matches the seed", identity.id);
                return Ok(());
            }
        },
    };
    let options = SetOptions { merge: false };
    with_retry(retry, "write profile", StoreError::is_transient, || {
        profiles.set_profile(&profile, options)
    })
    .await
}

fn seed_profile(user: &SeedUser, identity: &IdentityRecord, default_role: Role) -> ProfileRecord {
    let role = user
        .role
        .unwrap_or_else(|| Role::infer(&user.email, default_role));
    let mut profile = ProfileRecord::for_identity(identity, role, Utc::now());
    if let Some(name) = &user.name {
        profile.name = name.clone();
    }
    profile.company = user.company.clone();
    profile
}

/// `current` with the seed's explicit fields applied, or `None` when that
/// changes nothing.
fn seeded_fields(user: &SeedUser, current: &ProfileRecord) -> Option<ProfileRecord> {
    let mut next = current.clone();
    if let Some(role) = user.role {
        next.role = role;
    }
    if let Some(name) = &user.name {
        next.name = name.clone();
    }
    if let Some(company) = &user.company {
        next.company = Some(company.clone());
    }
    (next != *current).then_some(next)
}
