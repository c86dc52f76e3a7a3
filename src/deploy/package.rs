// src/deploy/package.rs
//! Model packages
//!
//! A package is an archive of named records. Opening one gives sessions
//! whose `self_obj` is an importer bound to the archive; the importer loads
//! pickled records with `load_pickle(package, resource)`, reading the record
//! `package/with/slashes/resource`.

use crate::deploy::manager::ManagerShared;
use crate::deploy::replicated::ReplicatedObj;
use crate::deploy::session::InterpreterSession;
use crate::runtime::abi::PackageArchive;
use crate::runtime::value::Arg;
use crate::utils::errors::{DeployError, Result};
use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Package stored as a directory tree, one file per record
#[derive(Debug, Clone)]
pub struct DirectoryArchive {
    root: PathBuf,
}

impl DirectoryArchive {
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        if !fs::metadata(root)?.is_dir() {
            return Err(DeployError::Package(format!(
                "{} is not a package directory",
                root.display()
            )));
        }
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl PackageArchive for DirectoryArchive {
    fn read_record(&self, name: &str) -> io::Result<Option<Bytes>> {
        let relative = Path::new(name);
        if !relative
            .components()
            .all(|component| matches!(component, Component::Normal(_)))
        {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("record name '{}' escapes the package", name),
            ));
        }

        match fs::read(self.root.join(relative)) {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn describe(&self) -> String {
        format!("package {}", self.root.display())
    }
}

/// Package held in memory
#[derive(Debug, Clone, Default)]
pub struct MemoryArchive {
    name: String,
    records: HashMap<String, Bytes>,
}

impl MemoryArchive {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            records: HashMap::new(),
        }
    }

    pub fn with_record(mut self, name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        self.records.insert(name.into(), data.into());
        self
    }
}

impl PackageArchive for MemoryArchive {
    fn read_record(&self, name: &str) -> io::Result<Option<Bytes>> {
        Ok(self.records.get(name).cloned())
    }

    fn describe(&self) -> String {
        format!("package {}", self.name)
    }
}

/// An opened package bound to a pool
pub struct Package {
    manager: Arc<ManagerShared>,
    archive: Arc<dyn PackageArchive>,
}

impl Package {
    pub(crate) fn new(manager: Arc<ManagerShared>, archive: Arc<dyn PackageArchive>) -> Self {
        debug!("Opened {}", archive.describe());
        Self { manager, archive }
    }

    pub fn archive(&self) -> &Arc<dyn PackageArchive> {
        &self.archive
    }

    /// Pool session whose `self_obj` is this package's importer
    pub fn acquire_session(&self) -> Result<InterpreterSession> {
        let mut session = self.manager.acquire_one();
        let importer = session.open_package(Arc::clone(&self.archive))?;
        session.set_self(importer);
        Ok(session)
    }

    /// Load a pickled record and replicate it across the pool
    pub fn load_pickle(&self, package: &str, resource: &str) -> Result<ReplicatedObj> {
        let session = self.acquire_session()?;
        let importer = session
            .self_obj()
            .ok_or_else(|| DeployError::invariant("package session has no importer"))?;
        let loaded = importer
            .attr("load_pickle")?
            .call(&[Arg::from(package), Arg::from(resource)])?;
        let movable = session.create_movable(&loaded)?;
        Ok(movable)
    }
}

impl fmt::Debug for Package {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Package")
            .field("archive", &self.archive.describe())
            .finish()
    }
}
