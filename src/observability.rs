// src/observability.rs
//! Tracing and metrics setup
//!
//! Metrics recorded by the pool:
//!
//! | name                               | kind    |
//! |------------------------------------|---------|
//! | `deploy_interpreters`              | gauge   |
//! | `deploy_sessions_acquired_total`   | counter |
//! | `deploy_balancer_slow_path_total`  | counter |
//! | `deploy_objects_replicated_total`  | counter |
//! | `deploy_objects_unloaded_total`    | counter |

use crate::utils::config::LogConfig;
use crate::utils::errors::{DeployError, Result};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber
///
/// `RUST_LOG` wins over `config.level` when set.
pub fn init_tracing(config: &LogConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| DeployError::Config(format!("invalid log level '{}': {}", config.level, e)))?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_ids(true)
        .with_target(true);

    let installed = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| DeployError::Config(format!("tracing already initialized: {}", e)))
}

/// Install the Prometheus recorder and return a handle for rendering
pub fn init_metrics() -> Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| DeployError::Config(format!("failed to install metrics recorder: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_level_is_rejected() {
        if std::env::var_os("RUST_LOG").is_some() {
            return;
        }
        let config = LogConfig {
            level: "deploy_engine=loud".to_string(),
            json: false,
        };
        assert!(matches!(
            init_tracing(&config).unwrap_err(),
            DeployError::Config(_)
        ));
    }
}
