//! Ordered in-process tables shared by the memory and file-backed stores.
//!
//! Records are kept in a `BTreeMap` keyed by id so that paging is stable: a
//! page token is the last id of the previous page and the next page starts
//! strictly after it.

use std::collections::BTreeMap;
use std::ops::Bound;

use chrono::{DateTime, Utc};
use rand::distr::Alphanumeric;
use rand::Rng;
use sha2::{Digest, Sha256};

use crate::error::{FailureKind, StoreError};
use crate::store::{BatchOutcome, ItemFailure, Page, PageToken, ProfileOp};
use crate::types::{Email, IdentityRecord, ProfileRecord, StoreKind, UserId};

/// Length of ids handed out by [`IdentityTable::create`].
pub const GENERATED_ID_LEN: usize = 28;

fn page_of<T: Clone>(
    records: &BTreeMap<UserId, T>,
    after: Option<&PageToken>,
    page_size: usize,
) -> Page<T> {
    let page_size = page_size.max(1);
    let lower = match after {
        Some(token) => Bound::Excluded(UserId::from(token.0.as_str())),
        None => Bound::Unbounded,
    };
    let mut iter = records.range((lower, Bound::Unbounded));
    let mut page = Vec::with_capacity(page_size.min(records.len()));
    let mut last = None;
    for (id, record) in iter.by_ref().take(page_size) {
        page.push(record.clone());
        last = Some(id.clone());
    }
    let next_page_token = match (last, iter.next()) {
        (Some(last), Some(_)) => Some(PageToken(last.0)),
        _ => None,
    };
    Page {
        records: page,
        next_page_token,
    }
}

// ---------------------------------------------------------------------------
// Identities
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct IdentityTable {
    records: BTreeMap<UserId, IdentityRecord>,
}

impl IdentityTable {
    pub fn from_records(records: impl IntoIterator<Item = IdentityRecord>) -> Self {
        Self {
            records: records.into_iter().map(|r| (r.id.clone(), r)).collect(),
        }
    }

    pub fn records(&self) -> impl Iterator<Item = &IdentityRecord> {
        self.records.values()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn insert(&mut self, record: IdentityRecord) {
        self.records.insert(record.id.clone(), record);
    }

    pub fn contains(&self, id: &UserId) -> bool {
        self.records.contains_key(id)
    }

    pub fn find_by_email(&self, email: &Email) -> Option<&IdentityRecord> {
        let wanted = email.normalized();
        self.records
            .values()
            .find(|r| r.email.normalized() == wanted)
    }

    pub fn page(&self, after: Option<&PageToken>, page_size: usize) -> Page<IdentityRecord> {
        page_of(&self.records, after, page_size)
    }

    /// Register a new identity. Emails are unique (case-insensitively).
    pub fn create(
        &mut self,
        email: &Email,
        credential: &str,
        now: DateTime<Utc>,
    ) -> Result<UserId, StoreError> {
        if !email.is_plausible() {
            return Err(StoreError::permanent(
                StoreKind::Identity,
                format!("invalid email '{email}'"),
            ));
        }
        if credential.len() < 6 {
            return Err(StoreError::permanent(
                StoreKind::Identity,
                "credential must be at least 6 characters",
            ));
        }
        if self.find_by_email(email).is_some() {
            return Err(StoreError::permanent(
                StoreKind::Identity,
                format!("email '{email}' already exists"),
            ));
        }

        let id = loop {
            let candidate = generate_id();
            if !self.records.contains_key(&candidate) {
                break candidate;
            }
        };
        self.insert(IdentityRecord {
            id: id.clone(),
            email: Email::from(email.0.trim()),
            credential_hash: Some(hash_credential(credential)),
            disabled: false,
            created_at: now,
        });
        Ok(id)
    }

    /// Remove one id; a missing id is not an error.
    pub fn remove(&mut self, id: &UserId) {
        self.records.remove(id);
    }

    pub fn check_batch_size(ids: &[UserId], limit: usize) -> Result<(), StoreError> {
        if ids.len() > limit {
            return Err(StoreError::BatchTooLarge {
                store: StoreKind::Identity,
                size: ids.len(),
                limit,
            });
        }
        Ok(())
    }
}

/// Random alphanumeric id, the same shape the hosted identity service uses.
pub fn generate_id() -> UserId {
    let id: String = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(GENERATED_ID_LEN)
        .map(char::from)
        .collect();
    UserId(id)
}

/// `sha256$<salt>$<hex digest of salt || credential>`.
pub fn hash_credential(credential: &str) -> String {
    let salt: String = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(16)
        .map(char::from)
        .collect();
    let mut h = Sha256::new();
    h.update(salt.as_bytes());
    h.update(credential.as_bytes());
    format!("sha256${salt}${}", hex::encode(h.finalize()))
}

// ---------------------------------------------------------------------------
// Profiles
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct ProfileTable {
    records: BTreeMap<UserId, ProfileRecord>,
}

impl ProfileTable {
    pub fn from_records(records: impl IntoIterator<Item = ProfileRecord>) -> Self {
        Self {
            records: records.into_iter().map(|r| (r.id.clone(), r)).collect(),
        }
    }

    pub fn records(&self) -> impl Iterator<Item = &ProfileRecord> {
        self.records.values()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, id: &UserId) -> Option<&ProfileRecord> {
        self.records.get(id)
    }

    pub fn insert(&mut self, record: ProfileRecord) {
        self.records.insert(record.id.clone(), record);
    }

    pub fn page(&self, after: Option<&PageToken>, page_size: usize) -> Page<ProfileRecord> {
        page_of(&self.records, after, page_size)
    }

    /// Write one profile, validating it first.
    pub fn set(&mut self, profile: &ProfileRecord, merge: bool) -> Result<(), StoreError> {
        validate_profile(profile).map_err(|reason| StoreError::permanent(StoreKind::Profile, reason))?;
        let next = match (merge, self.records.get(&profile.id)) {
            (true, Some(existing)) => merge_profile(existing, profile),
            _ => profile.clone(),
        };
        self.records.insert(next.id.clone(), next);
        Ok(())
    }

    /// Apply a batch. Rejected writes are reported per item; the rest land.
    pub fn apply_batch(&mut self, ops: &[ProfileOp], limit: usize) -> Result<BatchOutcome, StoreError> {
        if ops.len() > limit {
            return Err(StoreError::BatchTooLarge {
                store: StoreKind::Profile,
                size: ops.len(),
                limit,
            });
        }
        let mut outcome = BatchOutcome::default();
        for op in ops {
            match op {
                ProfileOp::Set { profile, merge } => match self.set(profile, *merge) {
                    Ok(()) => outcome.succeeded.push(profile.id.clone()),
                    Err(err) => outcome.failed.push(ItemFailure::new(
                        profile.id.clone(),
                        FailureKind::Permanent,
                        err.to_string(),
                    )),
                },
                ProfileOp::Delete { id } => {
                    self.records.remove(id);
                    outcome.succeeded.push(id.clone());
                }
            }
        }
        Ok(outcome)
    }
}

/// Reasons the profile store refuses a document.
pub fn validate_profile(profile: &ProfileRecord) -> Result<(), String> {
    if profile.id.0.trim().is_empty() {
        return Err("profile id must not be empty".to_string());
    }
    if profile.id.0.contains('/') {
        return Err(format!("profile id '{}' must not contain '/'", profile.id));
    }
    if !profile.email.is_plausible() {
        return Err(format!("invalid email '{}'", profile.email));
    }
    Ok(())
}

/// Field-level merge: the incoming document wins, except that empty or
/// absent fields keep the stored value and `created_at` never moves.
fn merge_profile(existing: &ProfileRecord, incoming: &ProfileRecord) -> ProfileRecord {
    let keep_if_empty = |new: &Vec<String>, old: &Vec<String>| {
        if new.is_empty() {
            old.clone()
        } else {
            new.clone()
        }
    };
    ProfileRecord {
        id: existing.id.clone(),
        email: incoming.email.clone(),
        role: incoming.role,
        name: if incoming.name.is_empty() {
            existing.name.clone()
        } else {
            incoming.name.clone()
        },
        company: incoming.company.clone().or_else(|| existing.company.clone()),
        is_active: incoming.is_active,
        created_at: existing.created_at,
        settings: incoming.settings.clone(),
        favorites: keep_if_empty(&incoming.favorites, &existing.favorites),
        messages: keep_if_empty(&incoming.messages, &existing.messages),
        history: keep_if_empty(&incoming.history, &existing.history),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Role;

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

    #[test]
    fn paging_walks_every_record_once() {
        let table = IdentityTable::from_records(
            (0..7).map(|i| identity(&format!("u{i:02}"), &format!("u{i}@x.fr"))),
        );
        let mut seen = Vec::new();
        let mut token = None;
        loop {
            let page = table.page(token.as_ref(), 3);
            assert!(page.records.len() <= 3);
            seen.extend(page.records.into_iter().map(|r| r.id.0));
            match page.next_page_token {
                Some(next) => token = Some(next),
                None => break,
            }
        }
        assert_eq!(seen.len(), 7);
        assert_eq!(seen.first().map(String::as_str), Some("u00"));
        assert_eq!(seen.last().map(String::as_str), Some("u06"));
    }

    #[test]
    fn exact_multiple_has_no_trailing_token() {
        let table = ProfileTable::from_records(
            (0..4).map(|i| profile(&format!("p{i}"), &format!("p{i}@x.fr"))),
        );
        let first = table.page(None, 2);
        let second = table.page(first.next_page_token.as_ref(), 2);
        assert_eq!(second.records.len(), 2);
        assert!(second.next_page_token.is_none());
    }

    #[test]
    fn create_assigns_id_and_hashes_credential() {
        let mut table = IdentityTable::default();
        let id = table
            .create(&Email::from("admin@usine.fr"), "secret123", Utc::now())
            .unwrap();
        assert_eq!(id.0.len(), GENERATED_ID_LEN);
        let stored = table.find_by_email(&Email::from("ADMIN@usine.fr")).unwrap();
        assert_eq!(stored.id, id);
        let hash = stored.credential_hash.as_deref().unwrap();
        assert!(hash.starts_with("sha256$"));
        assert!(!hash.contains("secret123"));
    }

    #[test]
    fn create_rejects_duplicate_and_malformed_emails() {
        let mut table = IdentityTable::default();
        table
            .create(&Email::from("a@b.com"), "secret123", Utc::now())
            .unwrap();
        let dup = table
            .create(&Email::from("A@B.com"), "secret123", Utc::now())
            .unwrap_err();
        assert!(!dup.is_transient());
        assert!(table
            .create(&Email::from("not-an-email"), "secret123", Utc::now())
            .is_err());
        assert!(table
            .create(&Email::from("c@b.com"), "123", Utc::now())
            .is_err());
    }

    #[test]
    fn batch_reports_invalid_writes_per_item() {
        let mut table = ProfileTable::default();
        let mut bad = profile("bad", "bad@x.fr");
        bad.email = Email::from("nope");
        let ops = vec![
            ProfileOp::Set {
                profile: profile("ok", "ok@x.fr"),
                merge: false,
            },
            ProfileOp::Set {
                profile: bad,
                merge: false,
            },
            ProfileOp::Delete {
                id: UserId::from("never-existed"),
            },
        ];
        let outcome = table.apply_batch(&ops, 500).unwrap();
        assert_eq!(outcome.succeeded.len(), 2);
        assert_eq!(outcome.failed.len(), 1);
        assert_eq!(outcome.failed[0].id, UserId::from("bad"));
        assert_eq!(outcome.failed[0].kind, FailureKind::Permanent);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn oversized_batch_is_rejected_whole() {
        let mut table = ProfileTable::default();
        let ops: Vec<_> = (0..3)
            .map(|i| ProfileOp::Delete {
                id: UserId::from(format!("p{i}")),
            })
            .collect();
        let err = table.apply_batch(&ops, 2).unwrap_err();
        assert!(matches!(err, StoreError::BatchTooLarge { size: 3, limit: 2, .. }));
    }

    #[test]
    fn merge_keeps_created_at_and_populated_sequences() {
        let mut table = ProfileTable::default();
        let mut original = profile("u1", "old@x.fr");
        original.favorites = vec!["f1".to_string()];
        original.company = Some("ACME".to_string());
        table.set(&original, false).unwrap();

        let mut update = profile("u1", "new@x.fr");
        update.created_at = original.created_at + chrono::Duration::days(1);
        table.set(&update, true).unwrap();

        let stored = table.get(&UserId::from("u1")).unwrap();
        assert_eq!(stored.email, Email::from("new@x.fr"));
        assert_eq!(stored.created_at, original.created_at);
        assert_eq!(stored.favorites, vec!["f1".to_string()]);
        assert_eq!(stored.company.as_deref(), Some("ACME"));
    }
}
