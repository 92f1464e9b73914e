// SPDX-License-Identifier: MIT OR Apache-2.0
//! Configuration loading, validation, and environment overlay for the ISX
//! pipeline daemon.
//!
//! [`PipelineConfig`] is the typed top-level settings object. Loading never
//! fails on a missing file — absence just means defaults apply — and
//! semantic validation separates hard errors (the daemon refuses to start)
//! from advisory [`ConfigWarning`]s (logged, never blocking).
#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::Path;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors that can occur while loading or validating a [`PipelineConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The requested configuration file was not found.
    #[error("config file not found: {path}")]
    FileNotFound {
        /// Path that was requested.
        path: String,
    },

    /// The file could not be parsed as valid TOML.
    #[error("failed to parse config: {reason}")]
    ParseError {
        /// Human-readable parse error detail.
        reason: String,
    },

    /// Semantic validation failed (one or more hard problems).
    #[error("config validation failed: {reasons:?}")]
    ValidationError {
        /// Individual validation failure messages.
        reasons: Vec<String>,
    },
}

// ---------------------------------------------------------------------------
// Warnings
// ---------------------------------------------------------------------------

/// Advisory-level issues that never block startup but deserve attention.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigWarning {
    /// A stage timeout of zero was configured; the stage will time out on
    /// its very first poll.
    ZeroTimeout {
        /// `"default"` or a specific stage id.
        target: String,
    },
    /// A timeout is unusually large.
    LargeTimeout {
        /// `"default"` or a specific stage id.
        target: String,
        /// Timeout value in milliseconds.
        ms: u64,
    },
    /// A recommended optional field is missing or left at its default.
    MissingOptionalField {
        /// Name of the field.
        field: String,
        /// Why it matters.
        hint: String,
    },
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigWarning::ZeroTimeout { target } => {
                write!(f, "timeout for '{target}' is zero; it will time out immediately")
            }
            ConfigWarning::LargeTimeout { target, ms } => {
                write!(f, "timeout for '{target}' is unusually large ({ms}ms)")
            }
            ConfigWarning::MissingOptionalField { field, hint } => {
                write!(f, "missing optional field '{field}': {hint}")
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Top-level runtime configuration for the pipeline daemon.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    /// HTTP/WS bind address, e.g. `"127.0.0.1:8080"`.
    pub bind_addr: String,

    /// Root directory for per-stage NDJSON duration logs.
    pub metrics_dir: String,

    /// Log output format: `"pretty"` or `"json"`.
    pub log_format: String,

    /// `tracing` `EnvFilter` seed, e.g. `"info"`.
    pub log_level: String,

    /// Default per-stage execution timeout, in milliseconds.
    pub default_stage_timeout_ms: u64,

    /// Per-stage timeout overrides, keyed by stage id.
    pub stage_timeouts_ms: BTreeMap<String, u64>,

    /// Maximum retry attempts for a retryable stage failure (total attempts,
    /// not extra retries beyond the first).
    pub max_retries: u32,

    /// How long a positive license validation result is cached, in
    /// milliseconds.
    pub license_cache_ttl_ms: u64,

    /// Timeout for a single license validation call, in milliseconds.
    pub license_validation_timeout_ms: u64,

    /// Request paths exempt from the license-validation gate.
    pub license_exempt_paths: Vec<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".into(),
            metrics_dir: "./data/metrics".into(),
            log_format: "pretty".into(),
            log_level: "info".into(),
            default_stage_timeout_ms: 600_000,
            stage_timeouts_ms: BTreeMap::new(),
            max_retries: 2,
            license_cache_ttl_ms: 300_000,
            license_validation_timeout_ms: 5_000,
            license_exempt_paths: vec![
                "/healthz".into(),
                "/license".into(),
                "/ws".into(),
            ],
        }
    }
}

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

const LARGE_TIMEOUT_THRESHOLD_MS: u64 = 3_600_000;
const VALID_LOG_LEVELS: &[&str] = &["error", "warn", "info", "debug", "trace"];
const VALID_LOG_FORMATS: &[&str] = &["pretty", "json"];
const STAGE_TIMEOUT_ENV_PREFIX: &str = "PIPELINE_STAGE_TIMEOUT_MS_";

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Load a [`PipelineConfig`] from an optional TOML file path.
///
/// `path: None` returns [`PipelineConfig::default`]; a missing file at a
/// given `path` is a [`ConfigError::FileNotFound`]. Environment overrides
/// (see [`apply_env_overrides`]) are applied on top in both cases.
pub fn load_config(path: Option<&Path>) -> Result<PipelineConfig, ConfigError> {
    let mut config = match path {
        Some(p) => {
            let content = std::fs::read_to_string(p).map_err(|_| ConfigError::FileNotFound {
                path: p.display().to_string(),
            })?;
            parse_toml(&content)?
        }
        None => PipelineConfig::default(),
    };
    apply_env_overrides(&mut config);
    Ok(config)
}

/// Parse a TOML string into a [`PipelineConfig`].
pub fn parse_toml(content: &str) -> Result<PipelineConfig, ConfigError> {
    toml::from_str::<PipelineConfig>(content).map_err(|e| ConfigError::ParseError {
        reason: e.to_string(),
    })
}

// ---------------------------------------------------------------------------
// Env overrides
// ---------------------------------------------------------------------------

/// Apply environment variable overrides, per the daemon's documented
/// environment surface:
/// - `PIPELINE_BIND_ADDR`
/// - `PIPELINE_LOG_FORMAT`
/// - `METRICS_DIR`
/// - `PIPELINE_MAX_RETRIES`
/// - `PIPELINE_STAGE_TIMEOUT_MS_<STAGE_ID>` (one per stage, id upper-cased)
///
/// `RUST_LOG` is read separately by `isx-telemetry::init_tracing`, not here.
pub fn apply_env_overrides(config: &mut PipelineConfig) {
    if let Ok(val) = std::env::var("PIPELINE_BIND_ADDR") {
        config.bind_addr = val;
    }
    if let Ok(val) = std::env::var("PIPELINE_LOG_FORMAT") {
        config.log_format = val;
    }
    if let Ok(val) = std::env::var("METRICS_DIR") {
        config.metrics_dir = val;
    }
    if let Ok(val) = std::env::var("PIPELINE_MAX_RETRIES") {
        if let Ok(n) = val.parse::<u32>() {
            config.max_retries = n;
        }
    }
    for (key, val) in std::env::vars() {
        if let Some(stage_id) = key.strip_prefix(STAGE_TIMEOUT_ENV_PREFIX) {
            if let Ok(ms) = val.parse::<u64>() {
                config.stage_timeouts_ms.insert(stage_id.to_lowercase(), ms);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate a parsed configuration, returning advisory warnings.
///
/// Hard errors (unknown log level/format, unparsable bind address, zero
/// retry attempts) come back as [`ConfigError::ValidationError`]; suspicious
/// but non-fatal values (zero or very large timeouts) come back as
/// [`ConfigWarning`]s that never block startup.
pub fn validate_config(config: &PipelineConfig) -> Result<Vec<ConfigWarning>, ConfigError> {
    let mut errors: Vec<String> = Vec::new();
    let mut warnings: Vec<ConfigWarning> = Vec::new();

    if !VALID_LOG_LEVELS.contains(&config.log_level.as_str()) {
        errors.push(format!("invalid log_level '{}'", config.log_level));
    }
    if !VALID_LOG_FORMATS.contains(&config.log_format.as_str()) {
        errors.push(format!("invalid log_format '{}'", config.log_format));
    }
    if config.bind_addr.parse::<SocketAddr>().is_err() {
        errors.push(format!("invalid bind_addr '{}'", config.bind_addr));
    }
    if config.max_retries == 0 {
        errors.push("max_retries must be at least 1".into());
    }

    check_timeout("default", config.default_stage_timeout_ms, &mut warnings);
    for (stage_id, ms) in &config.stage_timeouts_ms {
        check_timeout(stage_id, *ms, &mut warnings);
    }

    if !config.license_exempt_paths.iter().any(|p| p == "/healthz") {
        warnings.push(ConfigWarning::MissingOptionalField {
            field: "license_exempt_paths".into(),
            hint: "/healthz is not exempt; liveness probes will be gated by license validation"
                .into(),
        });
    }

    if errors.is_empty() {
        Ok(warnings)
    } else {
        Err(ConfigError::ValidationError { reasons: errors })
    }
}

fn check_timeout(target: &str, ms: u64, warnings: &mut Vec<ConfigWarning>) {
    if ms == 0 {
        warnings.push(ConfigWarning::ZeroTimeout { target: target.to_string() });
    } else if ms > LARGE_TIMEOUT_THRESHOLD_MS {
        warnings.push(ConfigWarning::LargeTimeout { target: target.to_string(), ms });
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
