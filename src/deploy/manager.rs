// src/deploy/manager.rs
//! Interpreter pool
//!
//! The [`InterpreterManager`] owns a fixed set of interpreters and a
//! [`LoadBalancer`] over them. Construction is all-or-nothing: if any
//! interpreter fails to come up, the ones already created are torn down and
//! the error is returned.

use crate::deploy::interpreter::{Interpreter, RuntimeSource, ARGUMENT_NAMES_MODULE};
use crate::deploy::load_balancer::{BalancerCursor, LoadBalancer};
use crate::deploy::package::{DirectoryArchive, Package};
use crate::deploy::session::InterpreterSession;
use crate::runtime::abi::{ModuleFinder, PackageArchive};
use crate::runtime::value::ObjectId;
use crate::utils::config::DeployConfig;
use crate::utils::errors::{DeployError, Result};
use dashmap::DashMap;
use std::cell::Cell;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

thread_local! {
    static CURSOR: Cell<BalancerCursor> = Cell::new(BalancerCursor::new());
}

/// State shared by the manager, its sessions and its replicated objects
pub(crate) struct ManagerShared {
    pub(crate) instances: Vec<Arc<Interpreter>>,
    pub(crate) resources: LoadBalancer,
    module_sources: Arc<DashMap<String, String>>,
    next_object_id: AtomicU64,
}

impl ManagerShared {
    pub(crate) fn next_object_id(&self) -> ObjectId {
        ObjectId(self.next_object_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Balanced acquisition using this thread's cursor
    pub(crate) fn acquire_one(self: &Arc<Self>) -> InterpreterSession {
        CURSOR.with(|cell| {
            let mut cursor = cell.get();
            let session = self.acquire_one_with(&mut cursor);
            cell.set(cursor);
            session
        })
    }

    pub(crate) fn acquire_one_with(
        self: &Arc<Self>,
        cursor: &mut BalancerCursor,
    ) -> InterpreterSession {
        let slot = self.resources.acquire(cursor);
        InterpreterSession::new(
            Arc::clone(&self.instances[slot]),
            Some(Arc::clone(self)),
            Some(slot),
        )
    }
}

/// A pool of isolated interpreters
pub struct InterpreterManager {
    shared: Arc<ManagerShared>,
}

impl InterpreterManager {
    /// Pool of `n` interpreters loaded from the compiled-in image
    pub fn new(n: usize) -> Result<Self> {
        Self::with_source(n, RuntimeSource::builtin())
    }

    /// Pool of `n` interpreters built from `source`
    pub fn with_source(n: usize, source: RuntimeSource) -> Result<Self> {
        if n == 0 {
            return Err(DeployError::Config(
                "interpreter pool needs at least one interpreter".to_string(),
            ));
        }

        let mut instances = Vec::with_capacity(n);
        for i in 0..n {
            debug!("Creating interpreter {}/{}", i + 1, n);
            instances.push(Arc::new(Interpreter::create(&source)?));
        }

        let module_sources = Arc::new(DashMap::new());
        module_sources.insert(
            ARGUMENT_NAMES_MODULE.to_string(),
            source.argument_names_source().to_string(),
        );

        let shared = Arc::new(ManagerShared {
            instances,
            resources: LoadBalancer::new(n),
            module_sources,
            next_object_id: AtomicU64::new(0),
        });

        for (i, interp) in shared.instances.iter().enumerate() {
            interp.attach(i, Arc::downgrade(&shared))?;

            let sources = Arc::clone(&shared.module_sources);
            let finder: ModuleFinder =
                Arc::new(move |name: &str| sources.get(name).map(|entry| entry.value().clone()));
            interp.runtime().set_find_module(finder);

            // Tag each instance so code inside can tell which one it runs on
            let session = interp.acquire_session();
            session.set_global("deploy", "interp", i as i64)?;
        }

        metrics::gauge!("deploy_interpreters").set(n as f64);
        info!("Interpreter pool ready with {} interpreters", n);
        Ok(Self { shared })
    }

    /// Pool described by configuration
    ///
    /// Modules listed under `modules` are registered before the pool is
    /// returned.
    pub fn from_config(config: &DeployConfig) -> Result<Self> {
        config.validate()?;
        let source = RuntimeSource::from_config(&config.image)?;
        Self::from_config_with_source(config, source)
    }

    /// Like [`from_config`](Self::from_config) with an explicit source
    pub fn from_config_with_source(config: &DeployConfig, source: RuntimeSource) -> Result<Self> {
        let manager = Self::with_source(config.pool.size, source)?;
        for (name, module_source) in &config.modules {
            manager.register_module_source(name, module_source);
        }
        if let Some(limit) = config.pool.resource_limit {
            manager.debug_limit_interpreters(limit);
        }
        Ok(manager)
    }

    /// Session on the least-loaded interpreter, preferring an idle one
    ///
    /// Never blocks: when every interpreter is busy, two sessions may end
    /// up sharing one.
    pub fn acquire_one(&self) -> InterpreterSession {
        self.shared.acquire_one()
    }

    /// Like [`acquire_one`](Self::acquire_one) with a caller-owned cursor
    pub fn acquire_one_with(&self, cursor: &mut BalancerCursor) -> InterpreterSession {
        self.shared.acquire_one_with(cursor)
    }

    /// Every interpreter, for operations that must touch all of them
    pub fn all_instances(&self) -> &[Arc<Interpreter>] {
        &self.shared.instances
    }

    pub fn instance(&self, i: usize) -> Option<&Arc<Interpreter>> {
        self.shared.instances.get(i)
    }

    pub fn len(&self) -> usize {
        self.shared.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.instances.is_empty()
    }

    /// Make `name` importable on every interpreter
    ///
    /// Takes effect for imports that happen after this call; interpreters
    /// that already imported `name` keep their copy.
    pub fn register_module_source(&self, name: impl Into<String>, source: impl Into<String>) {
        let name = name.into();
        debug!("Registered module source {}", name);
        self.shared.module_sources.insert(name, source.into());
    }

    /// Restrict acquisition to the first `n` interpreters
    pub fn debug_limit_interpreters(&self, n: usize) {
        self.shared.resources.set_resource_limit(n);
        debug!(
            "Limited acquisition to {} interpreters",
            self.shared.resources.resource_limit()
        );
    }

    /// Open the package at `uri` (a directory of records)
    pub fn load_package(&self, uri: impl AsRef<Path>) -> Result<Package> {
        let archive = DirectoryArchive::open(uri)?;
        self.load_package_from(Arc::new(archive))
    }

    /// Open a package backed by `archive`
    pub fn load_package_from(&self, archive: Arc<dyn PackageArchive>) -> Result<Package> {
        Ok(Package::new(Arc::clone(&self.shared), archive))
    }

    #[cfg(test)]
    pub(crate) fn balancer(&self) -> &LoadBalancer {
        &self.shared.resources
    }

    #[cfg(test)]
    pub(crate) fn shared(&self) -> &Arc<ManagerShared> {
        &self.shared
    }
}

impl std::fmt::Debug for InterpreterManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterpreterManager")
            .field("interpreters", &self.len())
            .field("resource_limit", &self.shared.resources.resource_limit())
            .finish()
    }
}
