// src/main.rs
//! Deploy Engine pool runner
//!
//! Brings up an interpreter pool from configuration, checks that every
//! instance answers, and optionally calls `<module> <function>` once per
//! interpreter from concurrent threads.

use anyhow::{Context, Result};
use deploy_engine::observability::{init_metrics, init_tracing};
use deploy_engine::utils::config::DeployConfig;
use deploy_engine::{BuildInfo, DeployError, InterpreterManager, RuntimeSource, Value};
use tracing::{error, info, warn};

fn main() -> Result<()> {
    // Load configuration first so it can drive the log level
    let config = DeployConfig::load().context("failed to load configuration")?;

    init_tracing(&config.log)?;
    let metrics = init_metrics()?;

    let build = BuildInfo::current();
    info!(
        "Starting deployd v{} ({}, embedded image: {})",
        build.version, build.git_hash, build.embedded_image
    );
    info!("Configuration loaded: {:?}", config);

    let mut source = RuntimeSource::from_config(&config.image)?;
    if let Err(e) = source.check() {
        let configured = config.image.path.is_some() || config.image.accelerated_path.is_some();
        match e {
            DeployError::MissingImage { .. } if !configured => {
                warn!("No interpreter image available, using the in-process reference runtime");
                source = RuntimeSource::reference();
            }
            e => return Err(e).context("interpreter image is unusable"),
        }
    }

    let manager = InterpreterManager::from_config_with_source(&config, source)
        .context("failed to start interpreter pool")?;

    for interp in manager.all_instances() {
        let session = interp.acquire_session();
        let tag = session.global("deploy", "interp")?.to_value()?;
        info!("Interpreter {:?} ready (deploy.interp = {})", interp.index(), tag);
    }

    let args: Vec<String> = std::env::args().skip(1).collect();
    if let [module, function] = args.as_slice() {
        let results = call_everywhere(&manager, module, function);
        for (i, result) in results.into_iter().enumerate() {
            match result {
                Ok(value) => info!("call {}: {}.{}() = {}", i, module, function, value),
                Err(e) => error!("call {}: {}.{}() failed: {}", i, module, function, e),
            }
        }
    } else if !args.is_empty() {
        warn!("Usage: deployd [<module> <function>]");
    }

    println!("{}", metrics.render());
    info!("Shutting down interpreter pool");
    Ok(())
}

/// Call `module.function()` from one thread per interpreter
fn call_everywhere(
    manager: &InterpreterManager,
    module: &str,
    function: &str,
) -> Vec<deploy_engine::Result<Value>> {
    std::thread::scope(|scope| {
        let handles: Vec<_> = (0..manager.len())
            .map(|_| {
                scope.spawn(|| {
                    let session = manager.acquire_one();
                    let value = session.global(module, function)?.call(&[])?.to_value()?;
                    Ok::<_, DeployError>(value)
                })
            })
            .collect();

        handles
            .into_iter()
            .map(|handle| {
                handle.join().unwrap_or_else(|_| {
                    Err(DeployError::InvariantViolation("worker panicked".into()))
                })
            })
            .collect()
    })
}
