// src/utils/mod.rs
//! Shared utilities: configuration loading and the crate error type

pub mod config;
pub mod errors;

pub use config::DeployConfig;
pub use errors::{DeployError, Result};
