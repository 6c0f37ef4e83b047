//! JSON snapshot stores.
//!
//! # Storage layout
//!
//! ```text
//! <data_dir>/
//!   identities.json   (array of IdentityRecord)
//!   profiles.json     (array of ProfileRecord)
//! ```
//!
//! Every mutating call rewrites the snapshot with the same protocol:
//! serialize → `<file>.tmp` sibling → `rename`. The in-memory table is only
//! replaced once the rename succeeded, so a failed write leaves both the file
//! and the handle at the previous state.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{io_err, StoreError};
use crate::store::{
    BatchOutcome, IdentityStore, Page, PageToken, ProfileOp, ProfileStore, SetOptions,
    IDENTITY_BATCH_LIMIT, PROFILE_BATCH_LIMIT,
};
use crate::table::{IdentityTable, ProfileTable};
use crate::types::{Email, IdentityRecord, ProfileRecord, UserId};

pub const IDENTITIES_FILE: &str = "identities.json";
pub const PROFILES_FILE: &str = "profiles.json";

/// `<data_dir>/identities.json` — pure, no I/O.
pub fn identities_path(data_dir: &Path) -> PathBuf {
    data_dir.join(IDENTITIES_FILE)
}

/// `<data_dir>/profiles.json` — pure, no I/O.
pub fn profiles_path(data_dir: &Path) -> PathBuf {
    data_dir.join(PROFILES_FILE)
}

// ---------------------------------------------------------------------------
// Snapshot I/O
// ---------------------------------------------------------------------------

/// Read a snapshot. A missing file is an empty store.
pub fn read_snapshot<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, StoreError> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let contents = std::fs::read_to_string(path).map_err(|e| io_err(path, e))?;
    if contents.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(&contents).map_err(|source| StoreError::Json {
        path: path.to_path_buf(),
        source,
    })
}

/// Atomically write a snapshot.
pub fn write_snapshot<T: Serialize>(path: &Path, records: &[T]) -> Result<(), StoreError> {
    let Some(dir) = path.parent() else {
        return Err(io_err(
            path,
            std::io::Error::other("invalid snapshot path"),
        ));
    };
    std::fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;

    let json = serde_json::to_string_pretty(records).map_err(|source| StoreError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json).map_err(|e| io_err(&tmp, e))?;
    if let Err(e) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(io_err(path, e));
    }
    Ok(())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// Identity store
// ---------------------------------------------------------------------------

/// Identity store persisted to `identities.json`.
#[derive(Debug)]
pub struct FileIdentityStore {
    path: PathBuf,
    table: Mutex<IdentityTable>,
}

impl FileIdentityStore {
    /// Open the store under `data_dir`, loading the current snapshot.
    pub fn open(data_dir: &Path) -> Result<Self, StoreError> {
        let path = identities_path(data_dir);
        let records: Vec<IdentityRecord> = read_snapshot(&path)?;
        Ok(Self {
            path,
            table: Mutex::new(IdentityTable::from_records(records)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Apply `f` to a copy of the table, persist it, then publish it.
    fn commit<R>(
        &self,
        f: impl FnOnce(&mut IdentityTable) -> Result<R, StoreError>,
    ) -> Result<R, StoreError> {
        let mut guard = lock(&self.table);
        let mut next = guard.clone();
        let result = f(&mut next)?;
        let records: Vec<&IdentityRecord> = next.records().collect();
        write_snapshot(&self.path, &records)?;
        *guard = next;
        Ok(result)
    }
}

#[async_trait]
impl IdentityStore for FileIdentityStore {
    async fn create_identity(
        &self,
        email: &Email,
        credential: &str,
    ) -> Result<UserId, StoreError> {
        let id = self.commit(|table| table.create(email, credential, Utc::now()))?;
        tracing::info!("created identity {id} for {email}");
        Ok(id)
    }

    async fn delete_identities(&self, ids: &[UserId]) -> Result<BatchOutcome, StoreError> {
        IdentityTable::check_batch_size(ids, IDENTITY_BATCH_LIMIT)?;
        self.commit(|table| {
            for id in ids {
                table.remove(id);
            }
            Ok(BatchOutcome {
                succeeded: ids.to_vec(),
                failed: Vec::new(),
            })
        })
    }

    async fn list_identities(
        &self,
        page_token: Option<&PageToken>,
        page_size: usize,
    ) -> Result<Page<IdentityRecord>, StoreError> {
        let size = page_size.min(self.max_page_size());
        Ok(lock(&self.table).page(page_token, size))
    }

    async fn get_identity_by_email(
        &self,
        email: &Email,
    ) -> Result<Option<IdentityRecord>, StoreError> {
        Ok(lock(&self.table).find_by_email(email).cloned())
    }
}

// ---------------------------------------------------------------------------
// Profile store
// ---------------------------------------------------------------------------

/// Profile store persisted to `profiles.json`.
#[derive(Debug)]
pub struct FileProfileStore {
    path: PathBuf,
    table: Mutex<ProfileTable>,
}

impl FileProfileStore {
    /// Open the store under `data_dir`, loading the current snapshot.
    pub fn open(data_dir: &Path) -> Result<Self, StoreError> {
        let path = profiles_path(data_dir);
        let records: Vec<ProfileRecord> = read_snapshot(&path)?;
        Ok(Self {
            path,
            table: Mutex::new(ProfileTable::from_records(records)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn commit<R>(
        &self,
        f: impl FnOnce(&mut ProfileTable) -> Result<R, StoreError>,
    ) -> Result<R, StoreError> {
        let mut guard = lock(&self.table);
        let mut next = guard.clone();
        let result = f(&mut next)?;
        let records: Vec<&ProfileRecord> = next.records().collect();
        write_snapshot(&self.path, &records)?;
        *guard = next;
        Ok(result)
    }
}

#[async_trait]
impl ProfileStore for FileProfileStore {
    async fn set_profile(
        &self,
        profile: &ProfileRecord,
        options: SetOptions,
    ) -> Result<(), StoreError> {
        self.commit(|table| table.set(profile, options.merge))
    }

    async fn write_batch(&self, ops: &[ProfileOp]) -> Result<BatchOutcome, StoreError> {
        self.commit(|table| table.apply_batch(ops, PROFILE_BATCH_LIMIT))
    }

    async fn get_profile(&self, id: &UserId) -> Result<Option<ProfileRecord>, StoreError> {
        Ok(lock(&self.table).get(id).cloned())
    }

    async fn list_profiles(
        &self,
        page_token: Option<&PageToken>,
        page_size: usize,
    ) -> Result<Page<ProfileRecord>, StoreError> {
        let size = page_size.min(self.max_page_size());
        Ok(lock(&self.table).page(page_token, size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Role;
    use tempfile::TempDir;

    fn profile(id: &str) -> ProfileRecord {
        let identity = IdentityRecord {
            id: UserId::from(id),
            email: Email::from(format!("{id}@usine.fr")),
            credential_hash: None,
            disabled: false,
            created_at: Utc::now(),
        };
        ProfileRecord::for_identity(&identity, Role::Customer, Utc::now())
    }

    #[test]
    fn missing_snapshot_reads_empty() {
        let tmp = TempDir::new().unwrap();
        let records: Vec<ProfileRecord> = read_snapshot(&profiles_path(tmp.path())).unwrap();
        assert!(records.is_empty());
    }

    #[test]
    fn malformed_snapshot_names_the_file() {
        let tmp = TempDir::new().unwrap();
        let path = profiles_path(tmp.path());
        std::fs::write(&path, "{ not json").unwrap();
        let err = read_snapshot::<ProfileRecord>(&path).unwrap_err();
        assert!(err.to_string().contains("profiles.json"));
    }

    #[tokio::test]
    async fn identities_survive_reopen() {
        let tmp = TempDir::new().unwrap();
        let store = FileIdentityStore::open(tmp.path()).unwrap();
        let id = store
            .create_identity(&Email::from("admin@usine.fr"), "secret123")
            .await
            .unwrap();

        let reopened = FileIdentityStore::open(tmp.path()).unwrap();
        let found = reopened
            .get_identity_by_email(&Email::from("admin@usine.fr"))
            .await
            .unwrap();
        assert_eq!(found.map(|r| r.id), Some(id));
    }

    #[tokio::test]
    async fn profile_batch_persists_and_cleans_tmp() {
        let tmp = TempDir::new().unwrap();
        let store = FileProfileStore::open(tmp.path()).unwrap();
        store
            .write_batch(&[
                ProfileOp::Set {
                    profile: profile("u1"),
                    merge: false,
                },
                ProfileOp::Set {
                    profile: profile("u2"),
                    merge: false,
                },
            ])
            .await
            .unwrap();
        store.delete_profiles(&[UserId::from("u1")]).await.unwrap();

        let on_disk: Vec<ProfileRecord> = read_snapshot(store.path()).unwrap();
        assert_eq!(on_disk.len(), 1);
        assert_eq!(on_disk[0].id, UserId::from("u2"));
        assert!(!store.path().with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn rejected_write_leaves_snapshot_untouched() {
        let tmp = TempDir::new().unwrap();
        let store = FileProfileStore::open(tmp.path()).unwrap();
        store
            .set_profile(&profile("u1"), SetOptions::default())
            .await
            .unwrap();
        let mut bad = profile("u2");
        bad.email = Email::from("broken");
        assert!(store.set_profile(&bad, SetOptions::default()).await.is_err());

        let on_disk: Vec<ProfileRecord> = read_snapshot(store.path()).unwrap();
        assert_eq!(on_disk.len(), 1);
    }
}
