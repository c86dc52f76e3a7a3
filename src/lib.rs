// src/lib.rs
//! Deploy Engine Library
//!
//! Runs many isolated interpreter instances inside one process so that
//! multiple threads can execute model code concurrently, each on its own
//! interpreter with its own execution lock.
//!
//! # Architecture
//!
//! - **deploy**: the interpreter pool, sessions, replicated objects, packages
//! - **runtime**: the embedding ABI, image loading, the reference runtime
//! - **observability**: tracing and metrics setup
//! - **utils**: configuration and errors
//!
//! # Example
//!
//! ```no_run
//! use deploy_engine::{InterpreterManager, RuntimeSource};
//!
//! let manager = InterpreterManager::with_source(4, RuntimeSource::reference())?;
//! manager.register_module_source("foo", "def f(): return 1");
//!
//! let session = manager.acquire_one();
//! let one = session.global("foo", "f")?.call(&[])?.to_value()?;
//! # Ok::<(), deploy_engine::DeployError>(())
//! ```

// Public module exports
pub mod deploy;
pub mod observability;
pub mod runtime;
pub mod utils;

// Re-export commonly used types
pub use deploy::{
    Interpreter, InterpreterManager, InterpreterSession, MethodWrapper, Obj, Package,
    ReplicatedObj, RuntimeSource,
};
pub use runtime::{Arg, ObjectId, Value};
pub use utils::config::DeployConfig;
pub use utils::errors::{DeployError, Result};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const GIT_HASH: &str = env!("GIT_HASH");

/// Engine build information
#[derive(Debug)]
pub struct BuildInfo {
    pub version: &'static str,
    pub git_hash: &'static str,
    pub build_timestamp: &'static str,
    pub rustc_version: &'static str,
    pub embedded_image: bool,
}

impl BuildInfo {
    pub fn current() -> Self {
        Self {
            version: VERSION,
            git_hash: GIT_HASH,
            build_timestamp: env!("BUILD_TIMESTAMP"),
            rustc_version: env!("RUSTC_VERSION"),
            embedded_image: cfg!(embedded_image),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_build_info() {
        let info = BuildInfo::current();
        assert!(!info.version.is_empty());
        assert!(!info.git_hash.is_empty());
    }
}
