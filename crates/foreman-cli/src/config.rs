//! Configuration file management for foreman.
//!
//! Provides a TOML-based config file at `~/.config/foreman/config.toml` and a
//! resolution chain: CLI flag > env var > config file > default.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use foreman_core::harness::CommandOptions;
use foreman_core::harness::registry::HarnessBinaries;
use foreman_core::runner::RunnerConfig;
use foreman_db::config::DbConfig;

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConfigFile {
    pub database: DatabaseSection,
    #[serde(default)]
    pub runner: RunnerSection,
    #[serde(default)]
    pub harness: HarnessSection,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct DatabaseSection {
    pub url: String,
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self {
            url: DbConfig::DEFAULT_URL.to_string(),
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunnerSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grace_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backoff_secs: Option<u64>,
    /// Harness used for pm and retrospect jobs the runner queues itself.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feedback_harness: Option<String>,
}

/// Binary overrides for the built-in harness adapters.
#[derive(Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct HarnessSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claude: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub codex: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gemini: Option<String>,
    /// Launch options keyed by harness name (`[harness.options.codex]`).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub options: BTreeMap<String, HarnessOptions>,
}

#[derive(Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct HarnessOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_args: Vec<String>,
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the foreman config directory: `$XDG_CONFIG_HOME/foreman` or
/// `~/.config/foreman`, on every platform.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("foreman");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("foreman")
}

pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

// -----------------------------------------------------------------------
// Read / write
// -----------------------------------------------------------------------

/// Load and parse the config file. Returns an error if it does not exist.
pub fn load_config() -> Result<ConfigFile> {
    let path = config_path();
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    parse_config(&contents)
}

pub fn parse_config(contents: &str) -> Result<ConfigFile> {
    toml::from_str(contents).context("failed to parse config file")
}

/// Serialize and write the config file, creating parent dirs as needed.
/// Sets file permissions to 0600 on Unix.
pub fn save_config(config: &ConfigFile) -> Result<PathBuf> {
    let path = config_path();
    let dir = config_dir();
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create config directory {}", dir.display()))?;

    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(&path, &contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(&path, perms)
            .with_context(|| format!("failed to set permissions on {}", path.display()))?;
    }

    Ok(path)
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

/// Fully resolved configuration, ready for use.
#[derive(Debug)]
pub struct ForemanConfig {
    pub db_config: DbConfig,
    pub runner: RunnerConfig,
    pub binaries: HarnessBinaries,
}

impl ForemanConfig {
    /// Resolve configuration from the CLI flag, the environment and the
    /// config file, if one exists.
    pub fn resolve(cli_db_url: Option<&str>) -> Result<Self> {
        let file = if config_path().exists() {
            Some(load_config()?)
        } else {
            None
        };
        Self::resolve_with(cli_db_url, file.as_ref())
    }

    /// - DB URL: `cli_db_url` > `FOREMAN_DATABASE_URL` > `[database].url` > default
    /// - Job timeout: `FOREMAN_JOB_TIMEOUT_SECS` > `[runner].timeout_secs` > default
    /// - Harness binaries: `FOREMAN_{CLAUDE,CODEX,GEMINI}_BIN` > `[harness]` > `$PATH`
    /// - Harness model and extra args: `[harness.options.<name>]` only
    pub fn resolve_with(cli_db_url: Option<&str>, file: Option<&ConfigFile>) -> Result<Self> {
        let db_url = if let Some(url) = cli_db_url {
            url.to_string()
        } else if let Ok(url) = std::env::var("FOREMAN_DATABASE_URL") {
            url
        } else if let Some(cfg) = file {
            cfg.database.url.clone()
        } else {
            DbConfig::DEFAULT_URL.to_string()
        };
        let mut db_config = DbConfig::from_env();
        db_config.database_url = db_url;

        let runner_file = file.map(|f| &f.runner);
        let mut runner = RunnerConfig::default();
        let timeout = match std::env::var("FOREMAN_JOB_TIMEOUT_SECS") {
            Ok(raw) => Some(
                raw.parse::<u64>()
                    .with_context(|| format!("FOREMAN_JOB_TIMEOUT_SECS is not a number: {raw:?}"))?,
            ),
            Err(_) => runner_file.and_then(|r| r.timeout_secs),
        };
        if let Some(secs) = timeout {
            runner.job_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = runner_file.and_then(|r| r.grace_secs) {
            runner.kill_grace = Duration::from_secs(secs);
        }
        if let Some(secs) = runner_file.and_then(|r| r.backoff_secs) {
            runner.restart_backoff = Duration::from_secs(secs);
        }
        runner.feedback_harness = runner_file.and_then(|r| r.feedback_harness.clone());
        runner.database_url = Some(db_config.database_url.clone());

        let harness = file.map(|f| &f.harness);
        if let Some(section) = harness {
            runner.harness_options = section
                .options
                .iter()
                .map(|(name, opts)| {
                    let options = CommandOptions {
                        model: opts.model.clone(),
                        extra_args: opts.extra_args.clone(),
                        ..Default::default()
                    };
                    (name.clone(), options)
                })
                .collect();
        }
        let binaries = HarnessBinaries {
            claude: binary_override("FOREMAN_CLAUDE_BIN", harness.and_then(|h| h.claude.as_ref())),
            codex: binary_override("FOREMAN_CODEX_BIN", harness.and_then(|h| h.codex.as_ref())),
            gemini: binary_override("FOREMAN_GEMINI_BIN", harness.and_then(|h| h.gemini.as_ref())),
        };

        Ok(Self {
            db_config,
            runner,
            binaries,
        })
    }
}

fn binary_override(var: &str, from_file: Option<&String>) -> Option<String> {
    std::env::var(var)
        .ok()
        .filter(|v| !v.is_empty())
        .or_else(|| from_file.cloned())
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------
