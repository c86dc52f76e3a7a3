// src/utils/config.rs
//! Layered configuration for the interpreter pool
//!
//! Sources, lowest precedence first:
//!
//! 1. Built-in defaults
//! 2. `deploy.{toml,yaml,json}` in the working directory, or the file named
//!    by `DEPLOY_CONFIG`
//! 3. Environment variables such as `DEPLOY__POOL__SIZE=8`

use crate::utils::errors::{DeployError, Result};
use config::{Config, Environment, File};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;

/// Top-level configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DeployConfig {
    /// Pool sizing
    pub pool: PoolConfig,

    /// Interpreter image locations
    pub image: ImageConfig,

    /// Module sources registered with every interpreter at startup
    pub modules: HashMap<String, String>,

    /// Logging
    pub log: LogConfig,
}

/// Pool sizing
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Number of interpreter instances (default: 4)
    pub size: usize,

    /// Restrict the balancer to the first N instances
    pub resource_limit: Option<usize>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: 4,
            resource_limit: None,
        }
    }
}

/// Where interpreter images come from
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ImageConfig {
    /// Shared library for hosts without an accelerator
    pub path: Option<PathBuf>,

    /// Shared library built with accelerator support
    pub accelerated_path: Option<PathBuf>,

    /// Directory for staging images before loading (default: OS temp dir)
    pub temp_dir: Option<PathBuf>,

    /// Override the accelerator check
    pub accelerator: Option<bool>,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default filter directive when `RUST_LOG` is unset
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl DeployConfig {
    /// Load configuration from the default file and the environment
    pub fn load() -> Result<Self> {
        let file = std::env::var("DEPLOY_CONFIG").unwrap_or_else(|_| "deploy".to_string());
        Self::load_from(&file)
    }

    /// Load configuration from the named file (extension optional) and the environment
    pub fn load_from(file: &str) -> Result<Self> {
        let config: DeployConfig = Config::builder()
            .add_source(File::with_name(file).required(false))
            .add_source(
                Environment::with_prefix("DEPLOY")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the pool cannot be built from
    pub fn validate(&self) -> Result<()> {
        if self.pool.size == 0 {
            return Err(DeployError::Config("pool.size must be at least 1".into()));
        }

        if let Some(limit) = self.pool.resource_limit {
            if limit == 0 || limit > self.pool.size {
                return Err(DeployError::Config(format!(
                    "pool.resource_limit must be within 1..={}, got {}",
                    self.pool.size, limit
                )));
            }
        }

        Ok(())
    }
}
