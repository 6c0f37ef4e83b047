//! `usine provision <seed.yaml>` — create accounts identity-first.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;

use usine_core::lock::ReconcileLock;
use usine_sync::{load_seed, provision, ProvisionAction, RetryPolicy};

use super::{exit_code, runtime, Workspace};

/// Arguments for `usine provision`.
#[derive(Args, Debug)]
pub struct ProvisionArgs {
    /// YAML file with a `users:` list of { email, password, role, name, company }.
    pub seed: PathBuf,

    /// Look accounts up without creating anything.
    #[arg(long)]
    pub dry_run: bool,
}

impl ProvisionArgs {
    pub fn run(self) -> Result<ExitCode> {
        let workspace = Workspace::load()?;
        let seed = load_seed(&self.seed)
            .with_context(|| format!("failed to load seed file '{}'", self.seed.display()))?;

        let _lock = if self.dry_run {
            None
        } else {
            Some(
                ReconcileLock::acquire_at(
                    &workspace.home,
                    "usine provision",
                    workspace.settings.lock_ttl(),
                )
                .context("cannot start provisioning")?,
            )
        };

        let (identities, profiles) = workspace.open_stores()?;
        let retry = RetryPolicy::from_settings(&workspace.settings.retry);
        let results = runtime()?.block_on(provision(
            &identities,
            &profiles,
            &seed,
            &retry,
            workspace.settings.default_role,
            self.dry_run,
        ));

        let prefix = if self.dry_run { "[dry-run] " } else { "" };
        let mut ok = true;
        for result in &results {
            let id = result
                .id
                .as_ref()
                .map(|id| id.to_string())
                .unwrap_or_else(|| "-".to_string());
            match &result.action {
                ProvisionAction::Created => {
                    println!("{prefix}{}  created   {}  {id}", "✓".green(), result.email)
                }
                ProvisionAction::Existing => {
                    println!("{prefix}{}  existing  {}  {id}", "·".bright_black(), result.email)
                }
                ProvisionAction::WouldCreate => {
                    println!("{prefix}{}  would create  {}", "~".yellow(), result.email)
                }
                ProvisionAction::Failed(reason) => {
                    ok = false;
                    println!("{prefix}{}  failed    {}  {reason}", "✗".red(), result.email)
                }
            }
        }
        if results.is_empty() {
            println!("Seed file lists no users.");
        }
        Ok(exit_code(ok))
    }
}
