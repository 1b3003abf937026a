//! TOML configuration for the flakescope daemon and CLI.
//!
//! Layered lookup: an explicit `--config` path, then the `FLAKESCOPE_CONFIG`
//! environment variable, then `/etc/flakescope/flakescope.toml`, then
//! compiled-in defaults.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::flaky::MIN_SAMPLES;
use crate::tracker::DEFAULT_MIN_EXECUTIONS;

/// Environment variable naming a config file.
pub const CONFIG_ENV_VAR: &str = "FLAKESCOPE_CONFIG";

const SYSTEM_CONFIG_PATH: &str = "/etc/flakescope/flakescope.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlakescopeConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub analysis: AnalysisConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// A resolved configuration and how it was found. Resolution runs before the
/// subscriber exists, so the outcome is logged afterwards via [`ResolvedConfig::log`].
#[derive(Debug)]
pub struct ResolvedConfig {
    pub config: FlakescopeConfig,
    /// File the config was loaded from; `None` means compiled-in defaults.
    pub source: Option<PathBuf>,
    /// Fallback candidates that could not be loaded, with the error.
    pub skipped: Vec<(PathBuf, String)>,
}

impl ResolvedConfig {
    pub fn log(&self) {
        for (path, error) in &self.skipped {
            warn!(
                path = %path.display(),
                error = %error,
                "config file could not be loaded, trying fallback"
            );
        }
        match &self.source {
            Some(path) => info!(path = %path.display(), "loaded configuration"),
            None => debug!("no config file found, using compiled-in defaults"),
        }
    }
}

impl FlakescopeConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("invalid config file: {}", path.display()))?;
        Ok(config)
    }

    /// Resolve configuration. An explicit path must load; the env var and
    /// system locations fall through to defaults on error.
    pub fn resolve(explicit: Option<&Path>) -> Result<ResolvedConfig> {
        let env_path = std::env::var_os(CONFIG_ENV_VAR).map(PathBuf::from);
        Self::resolve_from(explicit, env_path, Path::new(SYSTEM_CONFIG_PATH))
    }

    fn resolve_from(
        explicit: Option<&Path>,
        env_path: Option<PathBuf>,
        system_path: &Path,
    ) -> Result<ResolvedConfig> {
        if let Some(path) = explicit {
            return Ok(ResolvedConfig {
                config: Self::load(path)?,
                source: Some(path.to_path_buf()),
                skipped: Vec::new(),
            });
        }

        let mut skipped = Vec::new();
        let system = system_path.exists().then(|| system_path.to_path_buf());
        for path in env_path.into_iter().chain(system) {
            match Self::load(&path) {
                Ok(config) => {
                    return Ok(ResolvedConfig {
                        config,
                        source: Some(path),
                        skipped,
                    })
                }
                Err(e) => skipped.push((path, format!("{:#}", e))),
            }
        }

        Ok(ResolvedConfig {
            config: Self::default(),
            source: None,
            skipped,
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.analysis.min_executions < MIN_SAMPLES {
            anyhow::bail!(
                "analysis.min_executions must be at least {}, got {}",
                MIN_SAMPLES,
                self.analysis.min_executions
            );
        }
        if !matches!(self.logging.format.as_str(), "text" | "json") {
            anyhow::bail!("logging.format must be 'text' or 'json', got '{}'", self.logging.format);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address and port for the HTTP API.
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database file. Parent directories are created on open.
    pub database_path: String,
    /// Keep everything in memory; nothing survives a restart.
    pub in_memory: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: "data/flakescope.db".to_string(),
            in_memory: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Analysis
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Executions a test case needs before it is analysed on record.
    pub min_executions: usize,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            min_executions: DEFAULT_MIN_EXECUTIONS,
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum tracing level (`trace`, `debug`, `info`, `warn`, `error`).
    /// `RUST_LOG` takes precedence when set.
    pub level: String,
    /// `text` or `json`.
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
