//! Reclaimer configuration
//!
//! ## Priority Order (highest to lowest)
//!
//! 1. Environment variables (`GOLE_SWEEP_INTERVAL_MS`, `GOLE_EXIT_RETENTION_MS`,
//!    `GOLE_RECLAIM_POLICY`)
//! 2. Config file (TOML)
//! 3. Defaults

use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TlsError};

pub const ENV_SWEEP_INTERVAL: &str = "GOLE_SWEEP_INTERVAL_MS";
pub const ENV_EXIT_RETENTION: &str = "GOLE_EXIT_RETENTION_MS";
pub const ENV_RECLAIM_POLICY: &str = "GOLE_RECLAIM_POLICY";

/// Which entries a sweep may remove
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReclaimPolicy {
    /// Only entries of tasks the directory saw exit
    #[default]
    Conservative,
    /// Every entry whose task is not live in the directory, including tasks
    /// spawned with plain `tokio::spawn`
    Strict,
}

impl FromStr for ReclaimPolicy {
    type Err = TlsError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "conservative" => Ok(Self::Conservative),
            "strict" => Ok(Self::Strict),
            _ => Err(TlsError::InvalidSetting {
                key: "policy".into(),
                value: s.into(),
            }),
        }
    }
}

impl fmt::Display for ReclaimPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Conservative => "conservative",
            Self::Strict => "strict",
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TlsConfig {
    /// Milliseconds between background sweeps
    pub sweep_interval_ms: u64,

    /// Milliseconds an exit record is kept after the task finished
    pub exit_retention_ms: u64,

    pub policy: ReclaimPolicy,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            sweep_interval_ms: 1_000,
            exit_retention_ms: 30_000,
            policy: ReclaimPolicy::Conservative,
        }
    }
}

impl TlsConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn exit_retention(&self) -> Duration {
        Duration::from_millis(self.exit_retention_ms)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| TlsError::Config {
            reason: format!("Failed to parse config: {}", e),
        })
    }

    /// Load configuration from a TOML file
    ///
    /// Returns default config if the file doesn't exist.
    /// Returns error if the file exists but is malformed.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Merge with environment variables
    ///
    /// Environment variables take precedence over file values. A variable
    /// that is set but doesn't parse is an error, not silently ignored.
    pub fn with_env(mut self) -> Result<Self> {
        if let Some(ms) = env_millis(ENV_SWEEP_INTERVAL)? {
            self.sweep_interval_ms = ms;
        }
        if let Some(ms) = env_millis(ENV_EXIT_RETENTION)? {
            self.exit_retention_ms = ms;
        }
        if let Some(raw) = env_value(ENV_RECLAIM_POLICY) {
            self.policy = raw.parse()?;
        }
        Ok(self)
    }

    /// Reject settings the reclaimer can't run with
    pub fn validate(&self) -> Result<()> {
        if self.sweep_interval_ms == 0 {
            return Err(TlsError::InvalidSetting {
                key: "sweep_interval_ms".into(),
                value: "0".into(),
            });
        }
        // A zero retention would let a sweep prune an exit record before the
        // next sweep had a chance to reclaim its entries.
        if self.exit_retention_ms == 0 {
            return Err(TlsError::InvalidSetting {
                key: "exit_retention_ms".into(),
                value: "0".into(),
            });
        }
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| TlsError::Config {
            reason: format!("Failed to serialize config: {}", e),
        })
    }
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_millis(key: &str) -> Result<Option<u64>> {
    env_value(key)
        .map(|raw| {
            raw.trim().parse::<u64>().map_err(|_| TlsError::InvalidSetting {
                key: key.into(),
                value: raw.clone(),
            })
        })
        .transpose()
}
