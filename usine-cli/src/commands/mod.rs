pub mod diff;
pub mod init;
pub mod provision;
pub mod reconcile;
pub mod status;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use serde::Serialize;

use usine_core::file::{FileIdentityStore, FileProfileStore};
use usine_core::{paths, Settings};
use usine_sync::{snapshot, DiffReport, PassControl, RetryPolicy, Snapshot};

/// Home directory, validated settings and the data directory they point at.
pub struct Workspace {
    pub home: PathBuf,
    pub settings: Settings,
    pub data_dir: PathBuf,
}

impl Workspace {
    pub fn load() -> Result<Self> {
        let home = paths::home()?;
        let settings =
            Settings::load_at(&home).context("failed to load ~/.usine/config.yaml")?;
        let data_dir = settings.data_dir_at(&home);
        Ok(Self {
            home,
            settings,
            data_dir,
        })
    }

    pub fn open_stores(&self) -> Result<(FileIdentityStore, FileProfileStore)> {
        let identities = FileIdentityStore::open(&self.data_dir).with_context(|| {
            format!("failed to open identity store in {}", self.data_dir.display())
        })?;
        let profiles = FileProfileStore::open(&self.data_dir).with_context(|| {
            format!("failed to open profile store in {}", self.data_dir.display())
        })?;
        Ok((identities, profiles))
    }

    /// Read both stores in full.
    pub fn read_snapshot(&self) -> Result<Snapshot> {
        let (identities, profiles) = self.open_stores()?;
        let retry = RetryPolicy::from_settings(&self.settings.retry);
        let page_sizes = (
            self.settings.identity.page_size,
            self.settings.profile.page_size,
        );
        runtime()?
            .block_on(snapshot(
                &identities,
                &profiles,
                page_sizes,
                &retry,
                &PassControl::unbounded(),
            ))
            .context("failed to enumerate stores")
    }
}

/// Single-threaded runtime; every store call is awaited in sequence.
pub fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")
}

pub fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("failed to serialize JSON output")?
    );
    Ok(())
}

/// Orphans, duplicates or drifted emails.
pub fn needs_attention(report: &DiffReport) -> bool {
    !report.is_consistent() || !report.email_drift.is_empty()
}

pub fn exit_code(ok: bool) -> ExitCode {
    if ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
