//! Full scans of both stores.
//!
//! `next_*_page` fetches exactly one bounded page and never retries; the
//! `scan_*` functions are the callers that walk every page from an empty
//! cursor and wrap each fetch in [`with_retry`]. No cursor survives between
//! runs, so every scan starts from scratch.

use std::collections::HashSet;

use usine_core::{
    IdentityRecord, IdentityStore, Page, PageToken, ProfileRecord, ProfileStore, StoreError,
    StoreKind,
};

use crate::control::PassControl;
use crate::error::SyncError;
use crate::retry::{with_retry, RetryPolicy};

/// Everything currently in both stores.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub identities: Vec<IdentityRecord>,
    pub profiles: Vec<ProfileRecord>,
}

/// One page of identities, `page_size` clamped to the store maximum.
pub async fn next_identity_page(
    store: &dyn IdentityStore,
    cursor: Option<&PageToken>,
    page_size: usize,
) -> Result<Page<IdentityRecord>, StoreError> {
    let size = page_size.clamp(1, store.max_page_size());
    store.list_identities(cursor, size).await
}

/// One page of profiles, `page_size` clamped to the store maximum.
pub async fn next_profile_page(
    store: &dyn ProfileStore,
    cursor: Option<&PageToken>,
    page_size: usize,
) -> Result<Page<ProfileRecord>, StoreError> {
    let size = page_size.clamp(1, store.max_page_size());
    store.list_profiles(cursor, size).await
}

/// Remembers every cursor handed out during one scan.
struct CursorGuard {
    store: StoreKind,
    seen: HashSet<PageToken>,
}

impl CursorGuard {
    fn new(store: StoreKind) -> Self {
        Self {
            store,
            seen: HashSet::new(),
        }
    }

    fn advance(&mut self, next: Option<PageToken>) -> Result<Option<PageToken>, SyncError> {
        match next {
            Some(token) if !self.seen.insert(token.clone()) => Err(SyncError::CursorLoop {
                store: self.store,
                token: token.0,
            }),
            other => Ok(other),
        }
    }
}

pub async fn scan_identities(
    store: &dyn IdentityStore,
    page_size: usize,
    retry: &RetryPolicy,
    control: &PassControl,
) -> Result<Vec<IdentityRecord>, SyncError> {
    let mut records = Vec::new();
    let mut guard = CursorGuard::new(StoreKind::Identity);
    let mut cursor: Option<PageToken> = None;
    let mut pages = 0usize;
    loop {
        control.check()?;
        let page = with_retry(retry, "list identities", StoreError::is_transient, || {
            next_identity_page(store, cursor.as_ref(), page_size)
        })
        .await?;
        pages += 1;
        records.extend(page.records);
        cursor = guard.advance(page.next_page_token)?;
        if cursor.is_none() {
            break;
        }
    }
    tracing::debug!("scanned {} identities in {pages} page(s)", records.len());
    Ok(records)
}

pub async fn scan_profiles(
    store: &dyn ProfileStore,
    page_size: usize,
    retry: &RetryPolicy,
    control: &PassControl,
) -> Result<Vec<ProfileRecord>, SyncError> {
    let mut records = Vec::new();
    let mut guard = CursorGuard::new(StoreKind::Profile);
    let mut cursor: Option<PageToken> = None;
    let mut pages = 0usize;
    loop {
        control.check()?;
        let page = with_retry(retry, "list profiles", StoreError::is_transient, || {
            next_profile_page(store, cursor.as_ref(), page_size)
        })
        .await?;
        pages += 1;
        records.extend(page.records);
        cursor = guard.advance(page.next_page_token)?;
        if cursor.is_none() {
            break;
        }
    }
    tracing::debug!("scanned {} profiles in {pages} page(s)", records.len());
    Ok(records)
}

/// Scan identities then profiles, sequentially.
pub async fn snapshot(
    identities: &dyn IdentityStore,
    profiles: &dyn ProfileStore,
    page_sizes: (usize, usize),
    retry: &RetryPolicy,
    control: &PassControl,
) -> Result<Snapshot, SyncError> {
    let identities = scan_identities(identities, page_sizes.0, retry, control).await?;
    let profiles = scan_profiles(profiles, page_sizes.1, retry, control).await?;
    Ok(Snapshot {
        identities,
        profiles,
    })
}
