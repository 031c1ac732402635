//! Configuration loading and validation.
//!
//! The engine reads a single human-owned `config.toml` from `~/.tryout/`.
//! Every section is optional; missing values fall back to the defaults below.
//! The token signing secret is never stored here, only the name of the
//! `.env` key that holds it (see [`crate::credentials`]).

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// SQLite database location.
    pub database: DatabaseConfig,

    /// Access and submission token settings.
    pub tokens: TokensConfig,

    /// Exam runtime countdown and persistence cadence.
    pub runtime: RuntimeConfig,

    /// Access-log writer settings.
    pub audit: AuditConfig,
}

/// SQLite database location.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Explicit database path. Defaults to `~/.tryout/tryout.db`.
    pub path: Option<PathBuf>,
}

/// Token issuance settings.
#[derive(Debug, Clone, Deserialize)]
pub struct TokensConfig {
    /// `.env` key holding the HMAC signing secret.
    #[serde(default = "default_secret_env")]
    pub secret_env: String,

    /// Lifetime of an access token in seconds. Covers navigation to the
    /// intro screen, not the exam itself.
    #[serde(default = "default_access_ttl")]
    pub access_ttl_secs: u64,

    /// Lifetime of a submission token in seconds.
    #[serde(default = "default_submission_ttl")]
    pub submission_ttl_secs: u64,
}

impl Default for TokensConfig {
    fn default() -> Self {
        Self {
            secret_env: default_secret_env(),
            access_ttl_secs: default_access_ttl(),
            submission_ttl_secs: default_submission_ttl(),
        }
    }
}

impl TokensConfig {
    /// Access token lifetime as a [`Duration`].
    pub fn access_ttl(&self) -> Duration {
        Duration::from_secs(self.access_ttl_secs)
    }

    /// Submission token lifetime as a [`Duration`].
    pub fn submission_ttl(&self) -> Duration {
        Duration::from_secs(self.submission_ttl_secs)
    }
}

/// Exam runtime cadence.
#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeConfig {
    /// Countdown tick period in milliseconds.
    #[serde(default = "default_tick_millis")]
    pub tick_millis: u64,

    /// Persist `time_remaining` whenever it is a multiple of this many seconds.
    #[serde(default = "default_persist_interval")]
    pub persist_interval_secs: u32,

    /// Wall-clock slack allowed past the exam duration before a submission
    /// is flagged as overtime.
    #[serde(default = "default_submit_grace")]
    pub submit_grace_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            tick_millis: default_tick_millis(),
            persist_interval_secs: default_persist_interval(),
            submit_grace_secs: default_submit_grace(),
        }
    }
}

impl RuntimeConfig {
    /// Countdown tick period.
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_millis)
    }

    /// Overtime slack applied at submission.
    pub fn submit_grace(&self) -> Duration {
        Duration::from_secs(self.submit_grace_secs)
    }
}

/// Access-log writer settings.
#[derive(Debug, Clone, Deserialize)]
pub struct AuditConfig {
    /// Bounded channel capacity between request paths and the writer.
    #[serde(default = "default_audit_capacity")]
    pub channel_capacity: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_audit_capacity(),
        }
    }
}

// Default value functions for serde

fn default_secret_env() -> String {
    "TRYOUT_TOKEN_SECRET".to_owned()
}
fn default_access_ttl() -> u64 {
    300
}
fn default_submission_ttl() -> u64 {
    600
}
fn default_tick_millis() -> u64 {
    1000
}
fn default_persist_interval() -> u32 {
    30
}
fn default_submit_grace() -> u64 {
    30
}
fn default_audit_capacity() -> usize {
    256
}

/// Resolved filesystem locations under `~/.tryout/`.
#[derive(Debug, Clone)]
pub struct RuntimePaths {
    /// Root directory (`~/.tryout`).
    pub root: PathBuf,
    /// Human-owned configuration file.
    pub config_toml: PathBuf,
    /// Private `.env` file with the signing secret.
    pub env_file: PathBuf,
    /// Default SQLite database.
    pub database: PathBuf,
    /// Rotated JSON logs.
    pub logs_dir: PathBuf,
}

/// Load configuration from a TOML file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed.
pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read config at {}: {e}", path.display()))?;
    let config: Config = toml::from_str(&contents)
        .map_err(|e| anyhow::anyhow!("failed to parse config at {}: {e}", path.display()))?;
    Ok(config)
}

/// Load `~/.tryout/config.toml`, or defaults when the file does not exist.
///
/// # Errors
///
/// Returns an error if the home directory cannot be resolved or an existing
/// file fails to parse.
pub fn load_default_config() -> anyhow::Result<Config> {
    let paths = runtime_paths()?;
    if !paths.config_toml.exists() {
        tracing::info!(path = %paths.config_toml.display(), "no config file found, using defaults");
        return Ok(Config::default());
    }
    load_config(&paths.config_toml)
}

/// Resolve the default config directory (`~/.tryout/`).
///
/// # Errors
///
/// Returns an error if the home directory cannot be determined.
pub fn config_dir() -> anyhow::Result<PathBuf> {
    let home = directories::BaseDirs::new()
        .ok_or_else(|| anyhow::anyhow!("cannot determine home directory"))?;
    Ok(home.home_dir().join(".tryout"))
}

/// Resolve every runtime path relative to [`config_dir`].
///
/// # Errors
///
/// Returns an error if the home directory cannot be determined.
pub fn runtime_paths() -> anyhow::Result<RuntimePaths> {
    let root = config_dir()?;
    Ok(RuntimePaths {
        config_toml: root.join("config.toml"),
        env_file: root.join(".env"),
        database: root.join("tryout.db"),
        logs_dir: root.join("logs"),
        root,
    })
}

impl Config {
    /// Database path from config, falling back to the runtime default.
    pub fn database_path(&self, paths: &RuntimePaths) -> PathBuf {
        self.database
            .path
            .clone()
            .unwrap_or_else(|| paths.database.clone())
    }
}
