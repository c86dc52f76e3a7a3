// src/deploy/interpreter.rs
//! A single interpreter instance and where instances come from
//!
//! An [`Interpreter`] owns one runtime: either a private copy of a loaded
//! image or an in-process implementation. It is created once and torn down
//! only when the last owner (the manager or a live session) lets go.

use crate::deploy::manager::ManagerShared;
use crate::deploy::session::InterpreterSession;
use crate::runtime::abi::InterpreterImpl;
use crate::runtime::image::{detect_accelerator, EmbeddedImage, ImageSet};
use crate::runtime::loader::LoadedImage;
use crate::runtime::reference::ReferenceInterpreter;
use crate::utils::config::ImageConfig;
use crate::utils::errors::{DeployError, Result};
use once_cell::sync::OnceCell;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use tracing::debug;

/// Module pre-registered for argument-name introspection
pub const ARGUMENT_NAMES_MODULE: &str = "GetArgumentNamesModule";

/// Helper for runtimes loaded from Python interpreter images
const PYTHON_ARGUMENT_NAMES_SOURCE: &str = "from inspect import signature\n\
def getArgumentNames(function): return list(signature(function).parameters.keys())\n";

/// Helper for the reference runtime
const REFERENCE_ARGUMENT_NAMES_SOURCE: &str =
    "def getArgumentNames(function): return params(function)\n";

/// Builds in-process interpreter implementations
pub type RuntimeFactory = Arc<dyn Fn() -> Box<dyn InterpreterImpl> + Send + Sync>;

/// Where a pool's interpreters come from
#[derive(Clone)]
pub enum RuntimeSource {
    /// Load a private copy of a shared-library image per interpreter
    Images {
        images: ImageSet,
        /// Staging directory (default: OS temp dir)
        temp_dir: Option<PathBuf>,
        /// Override the accelerator check
        accelerator: Option<bool>,
    },

    /// Construct interpreters in-process
    InProcess {
        factory: RuntimeFactory,
        /// Source of `GetArgumentNamesModule` in this runtime's language
        argument_names_source: String,
    },
}

impl RuntimeSource {
    pub fn images(images: ImageSet) -> Self {
        RuntimeSource::Images {
            images,
            temp_dir: None,
            accelerator: None,
        }
    }

    /// The image compiled into this crate, if any
    pub fn builtin() -> Self {
        Self::images(ImageSet::builtin())
    }

    /// In-process reference runtime
    pub fn reference() -> Self {
        RuntimeSource::InProcess {
            factory: Arc::new(|| Box::new(ReferenceInterpreter::new())),
            argument_names_source: REFERENCE_ARGUMENT_NAMES_SOURCE.to_string(),
        }
    }

    /// Images named in configuration, falling back to the compiled-in image
    pub fn from_config(config: &ImageConfig) -> Result<Self> {
        let mut images = ImageSet::default();
        if let Some(path) = &config.path {
            images.standard = Some(EmbeddedImage::from_file(path)?);
        }
        if let Some(path) = &config.accelerated_path {
            images.accelerated = Some(EmbeddedImage::from_file(path)?);
        }
        if images.standard.is_none() && images.accelerated.is_none() {
            images = ImageSet::builtin();
        }

        Ok(RuntimeSource::Images {
            images,
            temp_dir: config.temp_dir.clone(),
            accelerator: config.accelerator,
        })
    }

    /// Fail early if this source cannot produce interpreters
    pub fn check(&self) -> Result<()> {
        if let RuntimeSource::Images {
            images,
            accelerator,
            ..
        } = self
        {
            images.select(accelerator.unwrap_or_else(detect_accelerator))?;
        }
        Ok(())
    }

    pub(crate) fn argument_names_source(&self) -> &str {
        match self {
            RuntimeSource::Images { .. } => PYTHON_ARGUMENT_NAMES_SOURCE,
            RuntimeSource::InProcess {
                argument_names_source,
                ..
            } => argument_names_source,
        }
    }
}

impl fmt::Debug for RuntimeSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeSource::Images {
                images,
                temp_dir,
                accelerator,
            } => f
                .debug_struct("Images")
                .field("standard", &images.standard.as_ref().map(|i| i.len()))
                .field("accelerated", &images.accelerated.as_ref().map(|i| i.len()))
                .field("temp_dir", temp_dir)
                .field("accelerator", accelerator)
                .finish(),
            RuntimeSource::InProcess { .. } => f.write_str("InProcess"),
        }
    }
}

enum Backing {
    Image(LoadedImage),
    InProcess(Box<dyn InterpreterImpl>),
}

/// One interpreter instance
pub struct Interpreter {
    backing: Backing,

    /// Position in the owning pool
    index: OnceCell<usize>,

    /// Owning manager, set once the pool is assembled
    manager: OnceCell<Weak<ManagerShared>>,
}

impl Interpreter {
    /// Create an interpreter from `source`
    pub fn create(source: &RuntimeSource) -> Result<Self> {
        match source {
            RuntimeSource::Images {
                images,
                temp_dir,
                accelerator,
            } => {
                let accelerator = accelerator.unwrap_or_else(detect_accelerator);
                let image = images.select(accelerator)?;
                Self::from_image(image, temp_dir.as_deref())
            }
            RuntimeSource::InProcess { factory, .. } => Ok(Self::from_runtime(factory())),
        }
    }

    /// Load a private copy of `image`
    pub fn from_image(image: &EmbeddedImage, temp_dir: Option<&Path>) -> Result<Self> {
        let loaded = LoadedImage::load(image, temp_dir)?;
        Ok(Self::with_backing(Backing::Image(loaded)))
    }

    /// Wrap an in-process runtime
    pub fn from_runtime(runtime: Box<dyn InterpreterImpl>) -> Self {
        Self::with_backing(Backing::InProcess(runtime))
    }

    fn with_backing(backing: Backing) -> Self {
        Self {
            backing,
            index: OnceCell::new(),
            manager: OnceCell::new(),
        }
    }

    pub(crate) fn attach(&self, index: usize, manager: Weak<ManagerShared>) -> Result<()> {
        self.index
            .set(index)
            .map_err(|_| DeployError::invariant("interpreter already belongs to a pool"))?;
        self.manager
            .set(manager)
            .map_err(|_| DeployError::invariant("interpreter already belongs to a pool"))
    }

    /// The runtime implementation
    pub fn runtime(&self) -> &dyn InterpreterImpl {
        match &self.backing {
            Backing::Image(loaded) => loaded.runtime(),
            Backing::InProcess(runtime) => runtime.as_ref(),
        }
    }

    /// Position in the owning pool, if any
    pub fn index(&self) -> Option<usize> {
        self.index.get().copied()
    }

    pub(crate) fn manager(&self) -> Option<Arc<ManagerShared>> {
        self.manager.get().and_then(Weak::upgrade)
    }

    /// Open a session on this interpreter, bypassing the pool's balancer
    pub fn acquire_session(self: &Arc<Self>) -> InterpreterSession {
        InterpreterSession::new(Arc::clone(self), self.manager(), None)
    }
}

impl fmt::Debug for Interpreter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let backing = match &self.backing {
            Backing::Image(_) => "image",
            Backing::InProcess(_) => "in-process",
        };
        f.debug_struct("Interpreter")
            .field("index", &self.index())
            .field("backing", &backing)
            .finish()
    }
}

impl Drop for Interpreter {
    fn drop(&mut self) {
        debug!("Tearing down interpreter {:?}", self.index());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::value::Value;

    #[test]
    fn test_reference_source_creates_interpreter() {
        let interp = Arc::new(Interpreter::create(&RuntimeSource::reference()).unwrap());
        assert_eq!(interp.index(), None);

        let session = interp.acquire_session();
        let obj = session.from_value(Value::Int(5)).unwrap();
        assert_eq!(obj.to_value().unwrap(), Value::Int(5));
    }

    #[test]
    fn test_image_source_without_images_is_fatal() {
        let source = RuntimeSource::Images {
            images: ImageSet::default(),
            temp_dir: None,
            accelerator: Some(false),
        };
        assert!(source.check().unwrap_err().is_fatal());
        assert!(Interpreter::create(&source).unwrap_err().is_fatal());
    }

    #[test]
    fn test_bad_image_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let source = RuntimeSource::Images {
            images: ImageSet::standard(EmbeddedImage::from_static(b"not an image")),
            temp_dir: Some(dir.path().to_path_buf()),
            accelerator: Some(false),
        };
        let err = Interpreter::create(&source).unwrap_err();
        assert!(matches!(err, DeployError::ImageLoad { .. }));
    }

    #[test]
    fn test_from_config_reads_image_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("interp.so");
        std::fs::write(&path, b"image bytes").unwrap();

        let config = ImageConfig {
            path: Some(path),
            accelerator: Some(true),
            ..Default::default()
        };
        let RuntimeSource::Images {
            images,
            accelerator,
            ..
        } = RuntimeSource::from_config(&config).unwrap()
        else {
            panic!("expected an image source");
        };
        assert_eq!(images.select(true).unwrap().as_bytes(), b"image bytes");
        assert_eq!(accelerator, Some(true));
    }

    #[test]
    fn test_attach_only_once() {
        let interp = Interpreter::create(&RuntimeSource::reference()).unwrap();
        interp.attach(0, Weak::new()).unwrap();
        assert!(interp.attach(1, Weak::new()).is_err());
        assert_eq!(interp.index(), Some(0));
    }
}
