// src/utils/errors.rs
//! Error types for the interpreter pool
//!
//! Errors fall into three families:
//!
//! - **Misconfiguration**: missing or unloadable interpreter images. These
//!   mean the build or deployment is broken; callers should abort.
//! - **Invariant violations**: API misuse such as replicating an object from
//!   a session that has no owning manager.
//! - **Runtime errors**: exceptions raised inside an embedded interpreter,
//!   rewrapped so callers never see the runtime's native representation.

use crate::runtime::abi::RuntimeError;
use std::path::PathBuf;
use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, DeployError>;

/// Errors raised by the interpreter pool
#[derive(Error, Debug)]
pub enum DeployError {
    #[error("no embedded interpreter image was supplied (accelerator available: {accelerator_available})")]
    MissingImage { accelerator_available: bool },

    #[error("embedded interpreter image is empty")]
    EmptyImage,

    #[error("failed to stage interpreter image: {0}")]
    ImageStaging(#[source] std::io::Error),

    #[error("failed to load interpreter image {path}: {source}")]
    ImageLoad {
        path: PathBuf,
        #[source]
        source: libloading::Error,
    },

    #[error("interpreter image does not export `{0}`")]
    MissingSymbol(&'static str),

    #[error("`{0}` returned no interpreter")]
    NullInterpreter(&'static str),

    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    #[error("embedded runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    #[error("package error: {0}")]
    Package(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl DeployError {
    /// True for errors that indicate a broken build or deployment
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            DeployError::MissingImage { .. }
                | DeployError::EmptyImage
                | DeployError::ImageStaging(_)
                | DeployError::ImageLoad { .. }
                | DeployError::MissingSymbol(_)
                | DeployError::NullInterpreter(_)
        )
    }

    pub(crate) fn invariant(message: impl Into<String>) -> Self {
        DeployError::InvariantViolation(message.into())
    }
}

impl From<config::ConfigError> for DeployError {
    fn from(err: config::ConfigError) -> Self {
        DeployError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(DeployError::EmptyImage.is_fatal());
        assert!(DeployError::MissingSymbol("deploy_new_interpreter_impl").is_fatal());
        assert!(DeployError::MissingImage { accelerator_available: false }.is_fatal());
        assert!(DeployError::NullInterpreter("deploy_new_interpreter_impl").is_fatal());
        assert!(!DeployError::Io(std::io::ErrorKind::NotFound.into()).is_fatal());
        assert!(!DeployError::invariant("no manager").is_fatal());
        assert!(!DeployError::Package("bad".into()).is_fatal());
    }

    #[test]
    fn test_runtime_error_is_wrapped() {
        let err: DeployError = RuntimeError::new("NameError", "name 'x' is not defined").into();
        assert!(!err.is_fatal());
        assert_eq!(
            err.to_string(),
            "embedded runtime error: NameError: name 'x' is not defined"
        );
    }
}
