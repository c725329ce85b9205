//! Configuration system: TOML file + env var overrides + contract-bounded defaults.

#![allow(missing_docs)]

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::core::errors::{EmrtError, Result};

/// Hard ceiling on accepted export size (100 MiB).
pub const MAX_FILE_BYTES: u64 = 100 * 1024 * 1024;
/// Rows scanned from the time column when bucketing visits.
pub const VISIT_SCAN_ROWS: usize = 5000;
/// Most recent hourly buckets returned.
pub const VISIT_BUCKETS: usize = 24;
/// Groups returned for the state and operator series.
pub const GROUP_LIMIT: usize = 50;
/// Raw duration samples returned.
pub const DURATION_SAMPLES: usize = 100;
/// Automatic engine restarts allowed per session.
pub const MAX_ENGINE_RESTARTS: u32 = 1;

/// Full analyzer configuration model.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    pub limits: LimitsConfig,
    pub engine: EngineConfig,
    pub logging: LoggingConfig,
    pub display: DisplayConfig,
    /// Where this config was loaded from. Not serialized.
    #[serde(skip)]
    pub source_path: Option<PathBuf>,
}

/// Input and output size caps. May be lowered, never raised past the defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_file_bytes: u64,
    pub visit_scan_rows: usize,
    pub visit_buckets: usize,
    pub group_limit: usize,
    pub duration_samples: usize,
}

/// Worker supervision knobs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    /// How long to wait for the worker's readiness signal.
    pub boot_timeout_ms: u64,
    /// Automatic restarts after a crash or boot timeout.
    pub max_restarts: u32,
    /// Poll interval for worker liveness while a job is in flight.
    pub health_check_interval_ms: u64,
}

/// Activity log sink.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    pub enabled: bool,
    /// JSONL file. `None` means stderr when enabled.
    pub path: Option<PathBuf>,
    pub max_size_bytes: u64,
    pub max_rotated_files: u32,
}

/// Cosmetic output settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DisplayConfig {
    /// High-contrast, uncoloured layout for bright or low-quality screens.
    pub field_mode: bool,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_file_bytes: MAX_FILE_BYTES,
            visit_scan_rows: VISIT_SCAN_ROWS,
            visit_buckets: VISIT_BUCKETS,
            group_limit: GROUP_LIMIT,
            duration_samples: DURATION_SAMPLES,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            boot_timeout_ms: 5_000,
            max_restarts: MAX_ENGINE_RESTARTS,
            health_check_interval_ms: 250,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: None,
            max_size_bytes: 10 * 1024 * 1024,
            max_rotated_files: 3,
        }
    }
}

impl Config {
    /// Default configuration path.
    #[must_use]
    pub fn default_path() -> PathBuf {
        let base = env::var_os("XDG_CONFIG_HOME")
            .filter(|raw| !raw.is_empty())
            .map(PathBuf::from)
            .or_else(|| env::var_os("HOME").map(|home| PathBuf::from(home).join(".config")))
            .unwrap_or_else(|| PathBuf::from("/tmp"));
        base.join("emrt").join("config.toml")
    }

    /// Load config from default or explicit path, then apply env overrides.
    ///
    /// Missing config file is not an error when loading from default path; defaults are used.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path_buf = path.map_or_else(Self::default_path, Path::to_path_buf);
        let is_explicit_path = path.is_some();

        let mut cfg = if path_buf.exists() {
            let raw = fs::read_to_string(&path_buf).map_err(|source| EmrtError::Io {
                path: path_buf.clone(),
                source,
            })?;
            let mut parsed: Self = toml::from_str(&raw)?;
            parsed.source_path = Some(path_buf);
            parsed
        } else if is_explicit_path {
            return Err(EmrtError::MissingConfig { path: path_buf });
        } else {
            Self::default()
        };

        cfg.apply_env_overrides_from(env_var)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Deterministic SHA-256 of the effective config, for log correlation.
    pub fn stable_hash(&self) -> Result<String> {
        let canonical = serde_json::to_string(self)?;
        let digest = Sha256::digest(canonical.as_bytes());
        Ok(digest.iter().take(8).map(|b| format!("{b:02x}")).collect())
    }

    fn apply_env_overrides_from<F>(&mut self, mut lookup: F) -> Result<()>
    where
        F: FnMut(&str) -> Option<String>,
    {
        if let Some(raw) = lookup("EMRT_MAX_FILE_BYTES") {
            self.limits.max_file_bytes = parse_env_u64("EMRT_MAX_FILE_BYTES", &raw)?;
        }
        if let Some(raw) = lookup("EMRT_BOOT_TIMEOUT_MS") {
            self.engine.boot_timeout_ms = parse_env_u64("EMRT_BOOT_TIMEOUT_MS", &raw)?;
        }
        if let Some(raw) = lookup("EMRT_MAX_RESTARTS") {
            let value = parse_env_u64("EMRT_MAX_RESTARTS", &raw)?;
            self.engine.max_restarts =
                u32::try_from(value).map_err(|error| EmrtError::ConfigParse {
                    context: "env",
                    details: format!("EMRT_MAX_RESTARTS={raw:?}: {error}"),
                })?;
        }
        if let Some(raw) = lookup("EMRT_HEALTH_CHECK_INTERVAL_MS") {
            self.engine.health_check_interval_ms =
                parse_env_u64("EMRT_HEALTH_CHECK_INTERVAL_MS", &raw)?;
        }
        if let Some(raw) = lookup("EMRT_LOG_ENABLED") {
            self.logging.enabled = parse_env_bool("EMRT_LOG_ENABLED", &raw)?;
        }
        if let Some(raw) = lookup("EMRT_LOG_PATH") {
            self.logging.path = Some(PathBuf::from(raw.trim()));
        }
        if let Some(raw) = lookup("EMRT_FIELD_MODE") {
            self.display.field_mode = parse_env_bool("EMRT_FIELD_MODE", &raw)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let limits = &self.limits;
        if limits.max_file_bytes == 0 || limits.max_file_bytes > MAX_FILE_BYTES {
            return Err(EmrtError::InvalidConfig {
                details: format!(
                    "limits.max_file_bytes must be in [1, {MAX_FILE_BYTES}], got {}",
                    limits.max_file_bytes
                ),
            });
        }

        for (name, value, ceiling) in [
            ("visit_scan_rows", limits.visit_scan_rows, VISIT_SCAN_ROWS),
            ("visit_buckets", limits.visit_buckets, VISIT_BUCKETS),
            ("group_limit", limits.group_limit, GROUP_LIMIT),
            ("duration_samples", limits.duration_samples, DURATION_SAMPLES),
        ] {
            if value == 0 || value > ceiling {
                return Err(EmrtError::InvalidConfig {
                    details: format!("limits.{name} must be in [1, {ceiling}], got {value}"),
                });
            }
        }

        if self.engine.boot_timeout_ms == 0 {
            return Err(EmrtError::InvalidConfig {
                details: "engine.boot_timeout_ms must be >= 1".to_string(),
            });
        }
        if self.engine.health_check_interval_ms == 0 {
            return Err(EmrtError::InvalidConfig {
                details: "engine.health_check_interval_ms must be >= 1".to_string(),
            });
        }
        if self.engine.max_restarts > MAX_ENGINE_RESTARTS {
            return Err(EmrtError::InvalidConfig {
                details: format!(
                    "engine.max_restarts must be <= {MAX_ENGINE_RESTARTS}, got {}",
                    self.engine.max_restarts
                ),
            });
        }

        if self.logging.path.is_some() && self.logging.max_size_bytes < 4096 {
            return Err(EmrtError::InvalidConfig {
                details: format!(
                    "logging.max_size_bytes ({}) must be >= 4096",
                    self.logging.max_size_bytes
                ),
            });
        }

        Ok(())
    }
}

fn env_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|raw| !raw.trim().is_empty())
}

fn parse_env_u64(name: &str, raw: &str) -> Result<u64> {
    raw.trim().parse::<u64>().map_err(|error| EmrtError::ConfigParse {
        context: "env",
        details: format!("{name}={raw:?}: {error}"),
    })
}

fn parse_env_bool(name: &str, raw: &str) -> Result<bool> {
    raw.trim().parse::<bool>().map_err(|error| EmrtError::ConfigParse {
        context: "env",
        details: format!("{name}={raw:?}: {error}"),
    })
}
