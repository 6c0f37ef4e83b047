//! In-process stores with fault injection.
//!
//! These back the reconciler's tests: they honour the same page and batch
//! limits as the hosted services and can be told to fail specific ids, fail
//! whole calls, and count how often each operation was invoked.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::Utc;

use crate::error::{FailureKind, StoreError};
use crate::store::{
    BatchOutcome, IdentityStore, ItemFailure, Page, PageToken, ProfileOp, ProfileStore,
    SetOptions, IDENTITY_BATCH_LIMIT, IDENTITY_PAGE_LIMIT, PROFILE_BATCH_LIMIT,
    PROFILE_PAGE_LIMIT,
};
use crate::table::{IdentityTable, ProfileTable};
use crate::types::{Email, IdentityRecord, ProfileRecord, StoreKind, UserId};

// ---------------------------------------------------------------------------
// Fault plan
// ---------------------------------------------------------------------------

/// Failures to inject into a memory store.
#[derive(Debug, Default)]
struct FaultPlan {
    /// Ids that always fail with the given reason.
    permanent: HashMap<UserId, String>,
    /// Ids that fail transiently for the given number of further attempts.
    transient: HashMap<UserId, u32>,
    /// Number of upcoming mutating calls that fail as a whole.
    failing_calls: u32,
    /// Number of upcoming list calls that fail as a whole.
    failing_lists: u32,
}

impl FaultPlan {
    fn check_call(&mut self, store: StoreKind) -> Result<(), StoreError> {
        if self.failing_calls > 0 {
            self.failing_calls -= 1;
            return Err(StoreError::transient(store, "service unavailable"));
        }
        Ok(())
    }

    fn check_list(&mut self, store: StoreKind) -> Result<(), StoreError> {
        if self.failing_lists > 0 {
            self.failing_lists -= 1;
            return Err(StoreError::transient(store, "deadline exceeded while listing"));
        }
        Ok(())
    }

    fn item_failure(&mut self, id: &UserId) -> Option<ItemFailure> {
        if let Some(reason) = self.permanent.get(id) {
            return Some(ItemFailure::new(id.clone(), FailureKind::Permanent, reason.clone()));
        }
        if let Some(remaining) = self.transient.get_mut(id) {
            if *remaining > 0 {
                *remaining -= 1;
                return Some(ItemFailure::new(
                    id.clone(),
                    FailureKind::Transient,
                    "rate limit exceeded",
                ));
            }
        }
        None
    }
}

/// How many times each operation reached a memory store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub list: usize,
    pub create: usize,
    pub delete: usize,
    pub set_profile: usize,
    pub write_batch: usize,
    /// Items submitted across all mutating calls.
    pub items: usize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// Identity store
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct IdentityState {
    table: IdentityTable,
    faults: FaultPlan,
    calls: CallCounts,
}

/// Identity store held entirely in memory.
#[derive(Debug)]
pub struct MemoryIdentityStore {
    state: Mutex<IdentityState>,
    page_limit: usize,
    batch_limit: usize,
}

impl Default for MemoryIdentityStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryIdentityStore {
    pub fn new() -> Self {
        Self::with_limits(IDENTITY_PAGE_LIMIT, IDENTITY_BATCH_LIMIT)
    }

    pub fn with_limits(page_limit: usize, batch_limit: usize) -> Self {
        Self {
            state: Mutex::new(IdentityState::default()),
            page_limit,
            batch_limit,
        }
    }

    pub fn with_records(records: impl IntoIterator<Item = IdentityRecord>) -> Self {
        let store = Self::new();
        lock(&store.state).table = IdentityTable::from_records(records);
        store
    }

    pub fn insert(&self, record: IdentityRecord) {
        lock(&self.state).table.insert(record);
    }

    pub fn records(&self) -> Vec<IdentityRecord> {
        lock(&self.state).table.records().cloned().collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.state).table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: &UserId) -> bool {
        lock(&self.state).table.contains(id)
    }

    pub fn calls(&self) -> CallCounts {
        lock(&self.state).calls
    }

    pub fn fail_permanently(&self, id: impl Into<UserId>, reason: impl Into<String>) {
        lock(&self.state)
            .faults
            .permanent
            .insert(id.into(), reason.into());
    }

    pub fn fail_transiently(&self, id: impl Into<UserId>, attempts: u32) {
        lock(&self.state).faults.transient.insert(id.into(), attempts);
    }

    pub fn fail_next_calls(&self, calls: u32) {
        lock(&self.state).faults.failing_calls = calls;
    }

    pub fn fail_next_lists(&self, calls: u32) {
        lock(&self.state).faults.failing_lists = calls;
    }
}

#[async_trait]
impl IdentityStore for MemoryIdentityStore {
    fn max_page_size(&self) -> usize {
        self.page_limit
    }

    fn max_batch_size(&self) -> usize {
        self.batch_limit
    }

    async fn create_identity(
        &self,
        email: &Email,
        credential: &str,
    ) -> Result<UserId, StoreError> {
        let mut state = lock(&self.state);
        state.calls.create += 1;
        state.calls.items += 1;
        state.faults.check_call(StoreKind::Identity)?;
        state.table.create(email, credential, Utc::now())
    }

    async fn delete_identities(&self, ids: &[UserId]) -> Result<BatchOutcome, StoreError> {
        let mut state = lock(&self.state);
        state.calls.delete += 1;
        state.calls.items += ids.len();
        IdentityTable::check_batch_size(ids, self.batch_limit)?;
        state.faults.check_call(StoreKind::Identity)?;

        let mut outcome = BatchOutcome::default();
        for id in ids {
            if let Some(failure) = state.faults.item_failure(id) {
                outcome.failed.push(failure);
                continue;
            }
            state.table.remove(id);
            outcome.succeeded.push(id.clone());
        }
        Ok(outcome)
    }

    async fn list_identities(
        &self,
        page_token: Option<&PageToken>,
        page_size: usize,
    ) -> Result<Page<IdentityRecord>, StoreError> {
        let mut state = lock(&self.state);
        state.calls.list += 1;
        state.faults.check_list(StoreKind::Identity)?;
        Ok(state.table.page(page_token, page_size.min(self.page_limit)))
    }

    async fn get_identity_by_email(
        &self,
        email: &Email,
    ) -> Result<Option<IdentityRecord>, StoreError> {
        let state = lock(&self.state);
        Ok(state.table.find_by_email(email).cloned())
    }
}

// ---------------------------------------------------------------------------
// Profile store
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct ProfileState {
    table: ProfileTable,
    faults: FaultPlan,
    calls: CallCounts,
}

/// Profile store held entirely in memory.
#[derive(Debug)]
pub struct MemoryProfileStore {
    state: Mutex<ProfileState>,
    page_limit: usize,
    batch_limit: usize,
}

impl Default for MemoryProfileStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProfileStore {
    pub fn new() -> Self {
        Self::with_limits(PROFILE_PAGE_LIMIT, PROFILE_BATCH_LIMIT)
    }

    pub fn with_limits(page_limit: usize, batch_limit: usize) -> Self {
        Self {
            state: Mutex::new(ProfileState::default()),
            page_limit,
            batch_limit,
        }
    }

    pub fn with_records(records: impl IntoIterator<Item = ProfileRecord>) -> Self {
        let store = Self::new();
        lock(&store.state).table = ProfileTable::from_records(records);
        store
    }

    pub fn insert(&self, record: ProfileRecord) {
        lock(&self.state).table.insert(record);
    }

    pub fn get(&self, id: &UserId) -> Option<ProfileRecord> {
        lock(&self.state).table.get(id).cloned()
    }

    pub fn records(&self) -> Vec<ProfileRecord> {
        lock(&self.state).table.records().cloned().collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.state).table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn calls(&self) -> CallCounts {
        lock(&self.state).calls
    }

    pub fn fail_permanently(&self, id: impl Into<UserId>, reason: impl Into<String>) {
        lock(&self.state)
            .faults
            .permanent
            .insert(id.into(), reason.into());
    }

    pub fn fail_transiently(&self, id: impl Into<UserId>, attempts: u32) {
        lock(&self.state).faults.transient.insert(id.into(), attempts);
    }

    pub fn fail_next_calls(&self, calls: u32) {
        lock(&self.state).faults.failing_calls = calls;
    }

    pub fn fail_next_lists(&self, calls: u32) {
        lock(&self.state).faults.failing_lists = calls;
    }
}

#[async_trait]
impl ProfileStore for MemoryProfileStore {
    fn max_page_size(&self) -> usize {
        self.page_limit
    }

    fn max_batch_size(&self) -> usize {
        self.batch_limit
    }

    async fn set_profile(
        &self,
        profile: &ProfileRecord,
        options: SetOptions,
    ) -> Result<(), StoreError> {
        let mut state = lock(&self.state);
        state.calls.set_profile += 1;
        state.calls.items += 1;
        state.faults.check_call(StoreKind::Profile)?;
        if let Some(failure) = state.faults.item_failure(&profile.id) {
            return Err(match failure.kind {
                FailureKind::Transient => StoreError::transient(StoreKind::Profile, failure.reason),
                FailureKind::Permanent => StoreError::permanent(StoreKind::Profile, failure.reason),
            });
        }
        state.table.set(profile, options.merge)
    }

    async fn write_batch(&self, ops: &[ProfileOp]) -> Result<BatchOutcome, StoreError> {
        let mut state = lock(&self.state);
        state.calls.write_batch += 1;
        state.calls.items += ops.len();
        if ops.len() > self.batch_limit {
            return Err(StoreError::BatchTooLarge {
                store: StoreKind::Profile,
                size: ops.len(),
                limit: self.batch_limit,
            });
        }
        state.faults.check_call(StoreKind::Profile)?;

        let mut accepted = Vec::with_capacity(ops.len());
        let mut outcome = BatchOutcome::default();
        for op in ops {
            match state.faults.item_failure(op.id()) {
                Some(failure) => outcome.failed.push(failure),
                None => accepted.push(op.clone()),
            }
        }
        let applied = state.table.apply_batch(&accepted, self.batch_limit)?;
        outcome.succeeded.extend(applied.succeeded);
        outcome.failed.extend(applied.failed);
        Ok(outcome)
    }

    async fn get_profile(&self, id: &UserId) -> Result<Option<ProfileRecord>, StoreError> {
        Ok(lock(&self.state).table.get(id).cloned())
    }

    async fn list_profiles(
        &self,
        page_token: Option<&PageToken>,
        page_size: usize,
    ) -> Result<Page<ProfileRecord>, StoreError> {
        let mut state = lock(&self.state);
        state.calls.list += 1;
        state.faults.check_list(StoreKind::Profile)?;
        Ok(state.table.page(page_token, page_size.min(self.page_limit)))
    }
}
