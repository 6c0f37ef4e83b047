use std::path::{Path, PathBuf};

use crate::error::ConfigError;

pub const USINE_DIR: &str = ".usine";
pub const CONFIG_FILE: &str = "config.yaml";
pub const LOCK_FILE: &str = "reconcile.lock";
pub const DATA_DIR: &str = "data";

pub fn usine_root(home: &Path) -> PathBuf {
    home.join(USINE_DIR)
}

pub fn config_path(home: &Path) -> PathBuf {
    usine_root(home).join(CONFIG_FILE)
}

pub fn lock_path(home: &Path) -> PathBuf {
    usine_root(home).join(LOCK_FILE)
}

pub fn default_data_dir(home: &Path) -> PathBuf {
    usine_root(home).join(DATA_DIR)
}

pub fn home() -> Result<PathBuf, ConfigError> {
    dirs::home_dir().ok_or(ConfigError::HomeNotFound)
}
