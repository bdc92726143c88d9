// SPDX-License-Identifier: MIT OR Apache-2.0
//! Configuration loading and validation for the upwatch engine.
//!
//! Settings come from the environment (`HOST`, `PORT`, `DATABASE_URL`,
//! `RESULTS_RETENTION`, `CORS_ORIGINS`, `MAX_CONCURRENT_CHECKS`) with
//! defaults suitable for local operation. Loading returns advisory
//! [`ConfigWarning`]s alongside the config so callers can log them without
//! refusing to start.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors that can occur during configuration loading or validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// An environment variable could not be parsed as its expected type.
    #[error("invalid {name}: {reason}")]
    ParseError {
        /// Environment variable name.
        name: String,
        /// Human-readable parse failure.
        reason: String,
    },

    /// Semantic validation failed (one or more problems).
    #[error("config validation failed: {reasons:?}")]
    ValidationError {
        /// Individual validation failure messages.
        reasons: Vec<String>,
    },
}

// ---------------------------------------------------------------------------
// Warnings
// ---------------------------------------------------------------------------

/// Advisory-level issues that do not prevent operation but deserve a log
/// line at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigWarning {
    /// The result retention cap is unusually large.
    LargeRetention {
        /// Configured retention.
        retention: u32,
    },
    /// The check worker pool is unusually wide.
    WideWorkerPool {
        /// Configured concurrency.
        concurrency: usize,
    },
    /// A wildcard CORS origin was configured.
    WildcardCors,
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigWarning::LargeRetention { retention } => {
                write!(f, "RESULTS_RETENTION={retention} keeps a lot of history per monitor")
            }
            ConfigWarning::WideWorkerPool { concurrency } => {
                write!(f, "MAX_CONCURRENT_CHECKS={concurrency} is a very wide worker pool")
            }
            ConfigWarning::WildcardCors => {
                write!(f, "CORS_ORIGINS=* allows any origin")
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

const LARGE_RETENTION_THRESHOLD: u32 = 10_000;
const WIDE_POOL_THRESHOLD: usize = 256;
const MAX_POOL_SIZE: usize = 1024;

/// Top-level runtime configuration for the upwatch engine.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct EngineConfig {
    /// Bind host for the HTTP API.
    pub host: String,

    /// Bind port for the HTTP API.
    pub port: u16,

    /// Storage URI (SQLite URL).
    pub database_url: String,

    /// Per-monitor result retention cap.
    pub results_retention: u32,

    /// Allowed CORS origins; `*` means any, empty disables CORS.
    #[serde(default)]
    pub cors_origins: Vec<String>,

    /// Worker-pool bound for concurrently running checks.
    pub max_concurrent_checks: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8080,
            database_url: "sqlite://upwatch.db".into(),
            results_retention: 100,
            cors_origins: Vec::new(),
            max_concurrent_checks: 32,
        }
    }
}

impl EngineConfig {
    /// Load configuration from the process environment.
    ///
    /// # Errors
    ///
    /// [`ConfigError::ParseError`] on malformed values,
    /// [`ConfigError::ValidationError`] on out-of-range ones.
    pub fn from_env() -> Result<(Self, Vec<ConfigWarning>), ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary lookup function (the
    /// environment in production, a map in tests).
    ///
    /// # Errors
    ///
    /// Same as [`EngineConfig::from_env`].
    pub fn from_lookup(
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(Self, Vec<ConfigWarning>), ConfigError> {
        let mut config = Self::default();

        if let Some(host) = lookup("HOST") {
            config.host = host;
        }
        if let Some(port) = lookup("PORT") {
            config.port = parse("PORT", &port)?;
        }
        if let Some(url) = lookup("DATABASE_URL") {
            config.database_url = url;
        }
        if let Some(retention) = lookup("RESULTS_RETENTION") {
            config.results_retention = parse("RESULTS_RETENTION", &retention)?;
        }
        if let Some(origins) = lookup("CORS_ORIGINS") {
            config.cors_origins = origins
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(ToString::to_string)
                .collect();
        }
        if let Some(pool) = lookup("MAX_CONCURRENT_CHECKS") {
            config.max_concurrent_checks = parse("MAX_CONCURRENT_CHECKS", &pool)?;
        }

        config.validate()?;
        let warnings = config.warnings();
        Ok((config, warnings))
    }

    /// Semantic validation beyond type parsing.
    ///
    /// # Errors
    ///
    /// [`ConfigError::ValidationError`] listing every problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut reasons = Vec::new();
        if self.host.trim().is_empty() {
            reasons.push("HOST must not be empty".to_string());
        }
        if self.database_url.trim().is_empty() {
            reasons.push("DATABASE_URL must not be empty".to_string());
        }
        if self.results_retention == 0 {
            reasons.push("RESULTS_RETENTION must be at least 1".to_string());
        }
        if self.max_concurrent_checks == 0 || self.max_concurrent_checks > MAX_POOL_SIZE {
            reasons.push(format!(
                "MAX_CONCURRENT_CHECKS must be 1-{MAX_POOL_SIZE}, got {}",
                self.max_concurrent_checks
            ));
        }
        if reasons.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::ValidationError { reasons })
        }
    }

    /// Advisory warnings for the current settings.
    #[must_use]
    pub fn warnings(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();
        if self.results_retention > LARGE_RETENTION_THRESHOLD {
            warnings.push(ConfigWarning::LargeRetention {
                retention: self.results_retention,
            });
        }
        if self.max_concurrent_checks > WIDE_POOL_THRESHOLD {
            warnings.push(ConfigWarning::WideWorkerPool {
                concurrency: self.max_concurrent_checks,
            });
        }
        if self.cors_origins.iter().any(|o| o == "*") {
            warnings.push(ConfigWarning::WildcardCors);
        }
        warnings
    }
}

fn parse<T: std::str::FromStr>(name: &str, raw: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e| ConfigError::ParseError {
        name: name.to_string(),
        reason: format!("`{raw}`: {e}"),
    })
}
