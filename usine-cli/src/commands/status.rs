//! `usine status` — record counts and whether the two stores agree.

use std::process::ExitCode;

use anyhow::Result;
use clap::Args;
use colored::Colorize;
use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};

use usine_core::StoreKind;
use usine_sync::{diff, DiffSummary};

use super::{exit_code, needs_attention, print_json, Workspace};

/// Arguments for `usine status`.
#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Serialize)]
struct StatusJson {
    data_dir: String,
    consistent: bool,
    summary: DiffSummary,
}

#[derive(Tabled)]
struct StoreRow {
    #[tabled(rename = "store")]
    store: String,
    #[tabled(rename = "records")]
    records: usize,
    #[tabled(rename = "orphans")]
    orphans: usize,
    #[tabled(rename = "duplicate emails")]
    duplicates: usize,
}

impl StatusArgs {
    pub fn run(self) -> Result<ExitCode> {
        let workspace = Workspace::load()?;
        let snapshot = workspace.read_snapshot()?;
        let report = diff(&snapshot.identities, &snapshot.profiles);
        let ok = !needs_attention(&report);
        let summary = report.summary();

        if self.json {
            print_json(&StatusJson {
                data_dir: workspace.data_dir.display().to_string(),
                consistent: ok,
                summary,
            })?;
            return Ok(exit_code(ok));
        }

        let dup_in = |store: StoreKind| {
            report
                .duplicate_emails
                .iter()
                .filter(|d| d.store == store)
                .count()
        };
        let rows = vec![
            StoreRow {
                store: "identity".to_string(),
                records: summary.identities,
                orphans: summary.orphan_identities,
                duplicates: dup_in(StoreKind::Identity),
            },
            StoreRow {
                store: "profile".to_string(),
                records: summary.profiles,
                orphans: summary.orphan_profiles,
                duplicates: dup_in(StoreKind::Profile),
            },
        ];

        println!(
            "Usine v{} | {}",
            env!("CARGO_PKG_VERSION"),
            workspace.data_dir.display()
        );
        let mut table = Table::new(rows);
        table.with(Style::rounded());
        println!("{table}");
        println!(
            "{} consistent  {} misplaced  {} email drift  {} quarantined",
            summary.consistent, summary.misplaced, summary.email_drift, summary.quarantined
        );

        if ok {
            println!("{} stores are consistent", "■".green().bold());
        } else {
            println!("{} stores need reconciliation", "■".yellow().bold());
            if summary.duplicate_emails > 0 {
                println!(
                    "  {} duplicate email(s) must be resolved by hand; run 'usine diff'",
                    summary.duplicate_emails
                );
            }
            println!("Run 'usine reconcile sync' to repair.");
        }
        Ok(exit_code(ok))
    }
}
