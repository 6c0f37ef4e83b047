//! `usine init [--data-dir <path>]`

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Args;

use usine_core::file::{identities_path, profiles_path, write_snapshot};
use usine_core::{paths, IdentityRecord, ProfileRecord, Settings};

/// Write the settings file and create empty stores.
#[derive(Args, Debug)]
pub struct InitArgs {
    /// Directory for identities.json and profiles.json. Defaults to
    /// ~/.usine/data
    #[arg(long, value_name = "PATH")]
    pub data_dir: Option<PathBuf>,
}

impl InitArgs {
    pub fn run(self) -> Result<ExitCode> {
        let home = paths::home()?;

        let mut settings =
            Settings::read_at(&home).context("failed to read existing ~/.usine/config.yaml")?;
        if let Some(dir) = self.data_dir {
            let dir = if dir.is_absolute() {
                dir
            } else {
                std::env::current_dir()
                    .context("cannot resolve current directory")?
                    .join(dir)
            };
            settings.data_dir = Some(dir);
        }
        settings.validate().context("invalid settings")?;
        let config = settings
            .save_at(&home)
            .context("failed to write ~/.usine/config.yaml")?;

        let data_dir = settings.data_dir_at(&home);
        let identities = identities_path(&data_dir);
        if !identities.exists() {
            write_snapshot::<IdentityRecord>(&identities, &[])
                .context("failed to create identity store")?;
        }
        let profiles = profiles_path(&data_dir);
        if !profiles.exists() {
            write_snapshot::<ProfileRecord>(&profiles, &[])
                .context("failed to create profile store")?;
        }

        println!("✓ Wrote {}", config.display());
        println!("  Stores in: {}", data_dir.display());
        Ok(ExitCode::SUCCESS)
    }
}
