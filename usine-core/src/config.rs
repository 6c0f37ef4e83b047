//! Reconciler settings.
//!
//! Loading order:
//! 1. `<home>/.usine/config.yaml` if it exists, else defaults
//! 2. `USINE_*` environment overrides
//! 3. `validate()`
//!
//! Everything takes the home directory explicitly; callers resolve it with
//! [`paths::home`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::paths;
use crate::store::{IDENTITY_BATCH_LIMIT, IDENTITY_PAGE_LIMIT, PROFILE_BATCH_LIMIT, PROFILE_PAGE_LIMIT};
use crate::types::Role;

// Retry constraints
pub const MIN_MAX_ATTEMPTS: u32 = 1;
pub const MAX_MAX_ATTEMPTS: u32 = 10;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

pub const MIN_BASE_DELAY_MS: u64 = 10;
pub const MAX_BASE_DELAY_MS: u64 = 60_000;
pub const DEFAULT_BASE_DELAY_MS: u64 = 1_000;

pub const DEFAULT_MAX_DELAY_MS: u64 = 30_000;

pub const MIN_BACKOFF_MULTIPLIER: f64 = 1.0;
pub const MAX_BACKOFF_MULTIPLIER: f64 = 10.0;
pub const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;

// Pass constraints
pub const MAX_BATCH_PAUSE_MS: u64 = 60_000;
pub const DEFAULT_BATCH_PAUSE_MS: u64 = 0;
pub const MIN_LOCK_TTL_SECS: u64 = 10;
pub const DEFAULT_LOCK_TTL_SECS: u64 = 15 * 60;

/// How the delay grows between retry attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    /// `base × attempt`.
    #[default]
    Linear,
    /// `base × multiplier^(attempt - 1)`.
    Exponential,
}

/// Retry settings for transient store failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Total attempts per batch, including the first one.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff: BackoffKind,
    /// Only used with [`BackoffKind::Exponential`].
    pub multiplier: f64,
    pub jitter: bool,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            backoff: BackoffKind::default(),
            multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            jitter: false,
        }
    }
}

/// Page and batch sizes used against one store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreLimits {
    pub page_size: usize,
    pub batch_size: usize,
}

impl StoreLimits {
    pub fn identity_default() -> Self {
        Self {
            page_size: IDENTITY_PAGE_LIMIT,
            batch_size: IDENTITY_BATCH_LIMIT,
        }
    }

    pub fn profile_default() -> Self {
        Self {
            page_size: PROFILE_PAGE_LIMIT,
            batch_size: PROFILE_BATCH_LIMIT,
        }
    }

    fn validate(&self, section: &str, page_max: usize, batch_max: usize) -> Result<(), ConfigError> {
        if self.page_size == 0 || self.page_size > page_max {
            return Err(ConfigError::Invalid(format!(
                "{section}.page_size must be 1-{page_max}, got {}",
                self.page_size
            )));
        }
        if self.batch_size == 0 || self.batch_size > batch_max {
            return Err(ConfigError::Invalid(format!(
                "{section}.batch_size must be 1-{batch_max}, got {}",
                self.batch_size
            )));
        }
        Ok(())
    }
}

/// Top-level settings document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Directory holding the store snapshots. Defaults to `~/.usine/data`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
    #[serde(default = "StoreLimits::identity_default")]
    pub identity: StoreLimits,
    #[serde(default = "StoreLimits::profile_default")]
    pub profile: StoreLimits,
    pub retry: RetrySettings,
    /// Wall-clock bound for one reconciliation pass. Defaults to, and may
    /// not exceed, `lock_ttl_secs`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pass_timeout_secs: Option<u64>,
    /// Pause between batches to stay under the stores' rate limits.
    pub batch_pause_ms: u64,
    pub lock_ttl_secs: u64,
    /// Role given to generated profiles when the email says nothing.
    pub default_role: Role,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            data_dir: None,
            identity: StoreLimits::identity_default(),
            profile: StoreLimits::profile_default(),
            retry: RetrySettings::default(),
            pass_timeout_secs: None,
            batch_pause_ms: DEFAULT_BATCH_PAUSE_MS,
            lock_ttl_secs: DEFAULT_LOCK_TTL_SECS,
            default_role: Role::Customer,
        }
    }
}

impl Settings {
    /// Load settings for `home`, apply the process environment and validate.
    pub fn load_at(home: &Path) -> Result<Self, ConfigError> {
        let mut settings = Self::read_at(home)?;
        settings.apply_overrides(std::env::vars())?;
        settings.validate()?;
        Ok(settings)
    }

    /// Parse `config.yaml` without environment overrides or validation.
    pub fn read_at(home: &Path) -> Result<Self, ConfigError> {
        let path = paths::config_path(home);
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(&path).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(&contents).map_err(|source| ConfigError::Parse { path, source })
    }

    /// Write `config.yaml` (`.tmp` + rename).
    pub fn save_at(&self, home: &Path) -> Result<PathBuf, ConfigError> {
        let path = paths::config_path(home);
        let root = paths::usine_root(home);
        std::fs::create_dir_all(&root).map_err(|source| ConfigError::Io {
            path: root.clone(),
            source,
        })?;
        let yaml = serde_yaml::to_string(self)?;
        let tmp = path.with_extension("yaml.tmp");
        std::fs::write(&tmp, yaml).map_err(|source| ConfigError::Io {
            path: tmp.clone(),
            source,
        })?;
        std::fs::rename(&tmp, &path).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;
        Ok(path)
    }

    /// Apply `USINE_*` overrides from `vars`. Unknown keys are ignored.
    pub fn apply_overrides<I>(&mut self, vars: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            match key.as_str() {
                "USINE_DATA_DIR" => self.data_dir = Some(PathBuf::from(value)),
                "USINE_RETRY_MAX_ATTEMPTS" => {
                    self.retry.max_attempts = parse_env(&key, &value)?;
                }
                "USINE_RETRY_BASE_DELAY_MS" => {
                    self.retry.base_delay_ms = parse_env(&key, &value)?;
                }
                "USINE_PASS_TIMEOUT_SECS" => {
                    self.pass_timeout_secs = Some(parse_env(&key, &value)?);
                }
                "USINE_BATCH_PAUSE_MS" => {
                    self.batch_pause_ms = parse_env(&key, &value)?;
                }
                "USINE_DEFAULT_ROLE" => {
                    self.default_role = value.parse().map_err(ConfigError::Invalid)?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.identity
            .validate("identity", IDENTITY_PAGE_LIMIT, IDENTITY_BATCH_LIMIT)?;
        self.profile
            .validate("profile", PROFILE_PAGE_LIMIT, PROFILE_BATCH_LIMIT)?;

        let retry = &self.retry;
        if retry.max_attempts < MIN_MAX_ATTEMPTS || retry.max_attempts > MAX_MAX_ATTEMPTS {
            return Err(ConfigError::Invalid(format!(
                "retry.max_attempts must be {}-{}, got {}",
                MIN_MAX_ATTEMPTS, MAX_MAX_ATTEMPTS, retry.max_attempts
            )));
        }
        if retry.base_delay_ms < MIN_BASE_DELAY_MS || retry.base_delay_ms > MAX_BASE_DELAY_MS {
            return Err(ConfigError::Invalid(format!(
                "retry.base_delay_ms must be {}-{}, got {}",
                MIN_BASE_DELAY_MS, MAX_BASE_DELAY_MS, retry.base_delay_ms
            )));
        }
        if retry.max_delay_ms < retry.base_delay_ms {
            return Err(ConfigError::Invalid(format!(
                "retry.max_delay_ms ({}) must not be below retry.base_delay_ms ({})",
                retry.max_delay_ms, retry.base_delay_ms
            )));
        }
        if !(MIN_BACKOFF_MULTIPLIER..=MAX_BACKOFF_MULTIPLIER).contains(&retry.multiplier) {
            return Err(ConfigError::Invalid(format!(
                "retry.multiplier must be {}-{}, got {}",
                MIN_BACKOFF_MULTIPLIER, MAX_BACKOFF_MULTIPLIER, retry.multiplier
            )));
        }

        if self.pass_timeout_secs == Some(0) {
            return Err(ConfigError::Invalid(
                "pass_timeout_secs must be positive when set".to_string(),
            ));
        }
        if let Some(timeout) = self.pass_timeout_secs {
            if timeout > self.lock_ttl_secs {
                return Err(ConfigError::Invalid(format!(
                    "pass_timeout_secs ({timeout}) must not exceed lock_ttl_secs ({})",
                    self.lock_ttl_secs
                )));
            }
        }
        if self.batch_pause_ms > MAX_BATCH_PAUSE_MS {
            return Err(ConfigError::Invalid(format!(
                "batch_pause_ms must be at most {MAX_BATCH_PAUSE_MS}, got {}",
                self.batch_pause_ms
            )));
        }
        if self.lock_ttl_secs < MIN_LOCK_TTL_SECS {
            return Err(ConfigError::Invalid(format!(
                "lock_ttl_secs must be at least {MIN_LOCK_TTL_SECS}, got {}",
                self.lock_ttl_secs
            )));
        }
        Ok(())
    }

    /// Snapshot directory, falling back to `~/.usine/data`.
    pub fn data_dir_at(&self, home: &Path) -> PathBuf {
        self.data_dir
            .clone()
            .unwrap_or_else(|| paths::default_data_dir(home))
    }

    /// Pass deadline. Unset means "as long as the lock lives", so a pass
    /// never outlasts the lock that keeps others out.
    pub fn pass_timeout(&self) -> Duration {
        Duration::from_secs(self.pass_timeout_secs.unwrap_or(self.lock_ttl_secs))
    }

    pub fn batch_pause(&self) -> Duration {
        Duration::from_millis(self.batch_pause_ms)
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::Invalid(format!("{key}: cannot parse '{value}'")))
}
