//! `usine diff` — every record that has no counterpart.

use std::process::ExitCode;

use anyhow::Result;
use clap::Args;
use colored::Colorize;

use usine_sync::diff;

use super::{exit_code, needs_attention, print_json, Workspace};

/// Arguments for `usine diff`.
#[derive(Args, Debug)]
pub struct DiffArgs {
    /// Emit the full report as JSON.
    #[arg(long)]
    pub json: bool,
}

impl DiffArgs {
    pub fn run(self) -> Result<ExitCode> {
        let workspace = Workspace::load()?;
        let snapshot = workspace.read_snapshot()?;
        let report = diff(&snapshot.identities, &snapshot.profiles);
        let ok = !needs_attention(&report);

        if self.json {
            print_json(&report)?;
            return Ok(exit_code(ok));
        }

        if ok {
            println!("No differences.");
            return Ok(exit_code(ok));
        }

        for duplicate in &report.duplicate_emails {
            println!("{}  {duplicate}", "!".red().bold());
        }
        for identity in &report.orphan_identities {
            println!("{}  identity {} <{}> has no profile", "+".green(), identity.id, identity.email);
        }
        for profile in &report.orphan_profiles {
            println!("{}  profile {} <{}> has no identity", "-".red(), profile.id, profile.email);
        }
        for misplaced in &report.misplaced {
            println!(
                "{}  profile {} belongs to identity {} <{}>",
                "~".yellow(),
                misplaced.profile.id,
                misplaced.identity.id,
                misplaced.identity.email
            );
        }
        for drift in &report.email_drift {
            println!(
                "{}  profile {} email <{}> differs from identity <{}>",
                "~".yellow(),
                drift.profile.id,
                drift.profile.email,
                drift.identity_email
            );
        }
        Ok(exit_code(ok))
    }
}
