//! `usine reconcile <policy>` — one reconciliation pass.

use std::io::{self, BufReader};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;

use usine_core::lock::ReconcileLock;
use usine_sync::{
    AlwaysConfirm, Confirmation, DriverOptions, InteractiveConfirm, NeverConfirm, Outcome,
    Policy, ReconcileReport, Reconciler, Stores,
};

use super::{print_json, runtime, Workspace};

/// Arguments for `usine reconcile`.
#[derive(Args, Debug)]
pub struct ReconcileArgs {
    /// sync | create-defaults | cleanup | delete-all
    pub policy: Policy,

    /// Stop after diffing and print what would change.
    #[arg(long)]
    pub dry_run: bool,

    /// Run destructive plans without asking.
    #[arg(long)]
    pub force: bool,

    /// Decline destructive plans instead of asking.
    #[arg(long, conflicts_with = "force")]
    pub no_input: bool,

    /// Wall-clock bound for the pass, in seconds.
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,

    /// Emit the report as JSON.
    #[arg(long)]
    pub json: bool,
}

impl ReconcileArgs {
    pub fn run(self) -> Result<ExitCode> {
        let workspace = Workspace::load()?;
        if let Some(secs) = self.timeout {
            let ttl = workspace.settings.lock_ttl_secs;
            anyhow::ensure!(
                secs > 0 && secs <= ttl,
                "--timeout must be between 1 and lock_ttl_secs ({ttl}), got {secs}"
            );
        }

        let _lock = if self.dry_run {
            None
        } else {
            let holder = format!("usine reconcile {}", self.policy);
            Some(
                ReconcileLock::acquire_at(&workspace.home, &holder, workspace.settings.lock_ttl())
                    .context("cannot start reconciliation")?,
            )
        };

        let (identities, profiles) = workspace.open_stores()?;
        let stores = Stores {
            identities: &identities,
            profiles: &profiles,
        };

        let mut options = DriverOptions::from_settings(&workspace.settings);
        options.dry_run = self.dry_run;
        if let Some(secs) = self.timeout {
            options.timeout = Some(Duration::from_secs(secs));
        }

        let confirmation: Box<dyn Confirmation> = if self.force {
            Box::new(AlwaysConfirm)
        } else if self.no_input {
            Box::new(NeverConfirm)
        } else {
            Box::new(InteractiveConfirm::new(BufReader::new(io::stdin()), io::stderr()))
        };

        let reconciler = Reconciler::new(stores, options, &*confirmation);
        let report = runtime()?
            .block_on(reconciler.run_until_interrupted(self.policy, tokio::signal::ctrl_c()));

        if self.json {
            print_json(&report)?;
        } else {
            print_report(&report);
        }
        Ok(ExitCode::from(report.exit_code()))
    }
}

fn print_report(report: &ReconcileReport) {
    let prefix = if report.dry_run { "[dry-run] " } else { "" };
    let outcome = match report.outcome {
        Outcome::Done => "DONE".green().bold(),
        Outcome::Partial => "PARTIAL".yellow().bold(),
    };
    println!("{prefix}{}: {outcome}", report.policy);

    if let Some(initial) = &report.initial {
        println!(
            "  found {} identities, {} profiles ({} orphan identities, {} orphan profiles)",
            initial.identities, initial.profiles, initial.orphan_identities, initial.orphan_profiles
        );
    }

    if report.dry_run {
        if report.plan.is_empty() {
            println!("{prefix}nothing to do");
        }
        for intent in &report.plan.intents {
            println!("{prefix}  ~  {intent}");
        }
    }

    for batch in &report.batches {
        println!(
            "  ✎  {} batch {}: {}/{} applied in {} attempt(s)",
            batch.store, batch.index, batch.succeeded, batch.attempted, batch.attempts
        );
    }
    for failure in &report.failures {
        println!(
            "  {}  {}: {} ({})",
            "✗".red(),
            failure.id,
            failure.reason,
            failure.kind
        );
    }
    for duplicate in &report.duplicates {
        println!("  {}  {duplicate}", "!".red().bold());
    }
    for violation in &report.violations {
        println!("  {}  {violation}", "!".yellow());
    }

    if let Some(residual) = &report.residual {
        println!(
            "  residual: {} orphan identities, {} orphan profiles, {} duplicate emails, {} email drift",
            residual.orphan_identities,
            residual.orphan_profiles,
            residual.duplicate_emails,
            residual.email_drift
        );
    }
    if let Some(halt) = &report.halt {
        println!("  halted: {halt}");
    }
}
