//! Migration configuration.
//!
//! [`MigrationConfig::load`] reads an optional TOML file (a `[migration]`
//! table) and then environment variables prefixed with `CHANGEGUARD`, e.g.
//! `CHANGEGUARD__MIGRATION__TARGET_CONNECTION_STRING`.

use crate::migration::MigrationError;
use config::{Config, ConfigError, Environment, File};
use regex::Regex;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

/// Default location of the configuration file
pub const DEFAULT_CONFIG_PATH: &str = "config/changeguard.toml";

static IDENTIFIER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,62}$").expect("identifier pattern is a valid regex")
});

/// What to do when an applied changeset's checksum no longer matches the changelog
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MismatchPolicy {
    /// Fail the run before any forward body executes
    #[default]
    Fail,
    /// Log a warning and continue
    Warn,
}

/// What to do with a changeset whose preconditions asked for a skip
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SkipPolicy {
    /// Record it in history as `MARK_RAN`
    #[default]
    Record,
    /// Leave history untouched; it will be re-evaluated next run
    Ignore,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MigrationConfig {
    #[serde(default)]
    pub target_connection_string: String,
    #[serde(default)]
    pub reference_connection_string: Option<String>,
    #[serde(default = "default_changelog_path")]
    pub changelog_path: PathBuf,
    #[serde(default)]
    pub checksum_normalize_whitespace: bool,
    #[serde(default = "default_lock_timeout_seconds")]
    pub lock_timeout_seconds: u64,
    #[serde(default)]
    pub on_checksum_mismatch: MismatchPolicy,
    #[serde(default)]
    pub on_skip: SkipPolicy,
    #[serde(default = "default_history_table")]
    pub history_table: String,
    #[serde(default = "default_lock_table")]
    pub lock_table: String,
    #[serde(default = "default_lock_owner")]
    pub lock_owner: String,
}

fn default_changelog_path() -> PathBuf {
    PathBuf::from("db.changelog.toml")
}

fn default_lock_timeout_seconds() -> u64 {
    60
}

fn default_history_table() -> String {
    "changeguard_history".to_string()
}

fn default_lock_table() -> String {
    "changeguard_lock".to_string()
}

fn default_lock_owner() -> String {
    "changeguard".to_string()
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            target_connection_string: String::new(),
            reference_connection_string: None,
            changelog_path: default_changelog_path(),
            checksum_normalize_whitespace: false,
            lock_timeout_seconds: default_lock_timeout_seconds(),
            on_checksum_mismatch: MismatchPolicy::default(),
            on_skip: SkipPolicy::default(),
            history_table: default_history_table(),
            lock_table: default_lock_table(),
            lock_owner: default_lock_owner(),
        }
    }
}

/// The subset of configuration the engine itself consumes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationSettings {
    pub normalize_whitespace: bool,
    pub lock_timeout: Duration,
    pub on_checksum_mismatch: MismatchPolicy,
    pub on_skip: SkipPolicy,
    pub history_table: String,
    pub lock_table: String,
    pub lock_owner: String,
}

impl Default for MigrationSettings {
    fn default() -> Self {
        MigrationConfig::default().settings()
    }
}

impl MigrationConfig {
    /// Load the configuration from `path` (or [`DEFAULT_CONFIG_PATH`]), then env vars.
    ///
    /// A missing file is fine; an explicitly named file must exist.
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::Config` if a source cannot be parsed, a value
    /// has the wrong type, or a table name is not a plain SQL identifier.
    pub fn load(path: Option<&Path>) -> Result<Self, MigrationError> {
        let (file, required) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => (PathBuf::from(DEFAULT_CONFIG_PATH), false),
        };

        let settings = Config::builder()
            .add_source(File::from(file.as_path()).required(required))
            .add_source(Environment::with_prefix("CHANGEGUARD").separator("__"))
            .build()
            .map_err(|e| config_error(&file, &e))?;

        // An absent [migration] section means "all defaults".
        let config = match settings.get::<MigrationConfig>("migration") {
            Ok(config) => config,
            Err(ConfigError::NotFound(_)) => MigrationConfig::default(),
            Err(e) => return Err(config_error(&file, &e)),
        };

        config.validate()?;
        Ok(config)
    }

    /// Check the values that cannot be expressed in the type system
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::Config` describing the first invalid value.
    pub fn validate(&self) -> Result<(), MigrationError> {
        let tables = [("history_table", &self.history_table), ("lock_table", &self.lock_table)];
        for (key, name) in tables {
            if !is_identifier(name) {
                return Err(MigrationError::Config(format!(
                    "{key} '{name}' must be a plain SQL identifier ([A-Za-z_][A-Za-z0-9_]*)"
                )));
            }
        }
        if self.history_table.eq_ignore_ascii_case(&self.lock_table) {
            return Err(MigrationError::Config(
                "history_table and lock_table must differ".to_string(),
            ));
        }
        if self.lock_owner.trim().is_empty() {
            return Err(MigrationError::Config("lock_owner cannot be empty".to_string()));
        }
        Ok(())
    }

    /// Engine-facing settings
    #[must_use]
    pub fn settings(&self) -> MigrationSettings {
        MigrationSettings {
            normalize_whitespace: self.checksum_normalize_whitespace,
            lock_timeout: Duration::from_secs(self.lock_timeout_seconds),
            on_checksum_mismatch: self.on_checksum_mismatch,
            on_skip: self.on_skip,
            history_table: self.history_table.clone(),
            lock_table: self.lock_table.clone(),
            lock_owner: self.lock_owner.clone(),
        }
    }
}

/// Whether `name` can be interpolated into SQL as a table name
#[must_use]
pub fn is_identifier(name: &str) -> bool {
    IDENTIFIER.is_match(name)
}

fn config_error(file: &Path, err: &ConfigError) -> MigrationError {
    MigrationError::Config(format!(
        "failed to load configuration from {} and environment: {err}",
        file.display()
    ))
}
