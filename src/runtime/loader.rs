// src/runtime/loader.rs
//! Loading interpreter images into the process
//!
//! Each interpreter gets a private copy of the runtime's global state by
//! loading its own copy of the image:
//!
//! 1. Stage the image bytes into a uniquely named temp file
//! 2. `dlopen` the file with local symbol binding
//! 3. Delete the temp file (the mapping stays valid)
//! 4. Resolve and call the factory symbol
//!
//! Every step releases what the earlier steps acquired if it fails.

use crate::runtime::abi::{
    FlushRuntimeFn, InterpreterImpl, NewInterpreterFn, FLUSH_RUNTIME_SYMBOL,
    NEW_INTERPRETER_SYMBOL,
};
use crate::runtime::image::EmbeddedImage;
use crate::utils::errors::{DeployError, Result};
use libloading::Library;
use std::io::Write;
use std::mem::ManuallyDrop;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Prefix of staged image files
const STAGING_PREFIX: &str = "deploy_interp";

/// A loaded image and the interpreter it produced
pub struct LoadedImage {
    /// Dropped explicitly before the library is unloaded
    runtime: ManuallyDrop<Box<dyn InterpreterImpl>>,

    library: Library,

    /// Staging path the image was loaded from (already deleted)
    staged_path: PathBuf,
}

impl LoadedImage {
    /// Stage, load and instantiate `image`
    pub fn load(image: &EmbeddedImage, temp_dir: Option<&Path>) -> Result<Self> {
        if image.is_empty() {
            return Err(DeployError::EmptyImage);
        }

        // Stage the image; the temp file is removed on every error path
        let mut builder = tempfile::Builder::new();
        builder.prefix(STAGING_PREFIX).suffix(".so");
        let mut staged = match temp_dir {
            Some(dir) => builder.tempfile_in(dir),
            None => builder.tempfile(),
        }
        .map_err(DeployError::ImageStaging)?;

        staged
            .write_all(image.as_bytes())
            .and_then(|_| staged.flush())
            .map_err(DeployError::ImageStaging)?;

        let staged_path = staged.path().to_path_buf();
        debug!(
            "Staged interpreter image at {:?} ({} bytes)",
            staged_path,
            image.len()
        );

        let library = open_library(&staged_path).map_err(|source| DeployError::ImageLoad {
            path: staged_path.clone(),
            source,
        })?;

        // The loader holds its own reference to the file
        staged.close().map_err(DeployError::ImageStaging)?;

        let runtime = unsafe { instantiate(&library)? };
        debug!("Instantiated interpreter from {:?}", staged_path);

        Ok(Self {
            runtime: ManuallyDrop::new(runtime),
            library,
            staged_path,
        })
    }

    pub fn runtime(&self) -> &dyn InterpreterImpl {
        &**self.runtime
    }

    pub fn staged_path(&self) -> &Path {
        &self.staged_path
    }
}

impl Drop for LoadedImage {
    fn drop(&mut self) {
        // Shut the runtime down while its code is still mapped
        unsafe { ManuallyDrop::drop(&mut self.runtime) };

        unsafe {
            if let Ok(flush) = self
                .library
                .get::<FlushRuntimeFn>(FLUSH_RUNTIME_SYMBOL.as_bytes())
            {
                flush();
            }
        }

        debug!("Unloading interpreter image {:?}", self.staged_path);
    }
}

/// Resolve the factory and take ownership of the interpreter it returns
///
/// # Safety
///
/// The library must export [`NEW_INTERPRETER_SYMBOL`] with the
/// [`NewInterpreterFn`] signature and the documented ownership contract.
unsafe fn instantiate(library: &Library) -> Result<Box<dyn InterpreterImpl>> {
    let factory = library
        .get::<NewInterpreterFn>(NEW_INTERPRETER_SYMBOL.as_bytes())
        .map_err(|_| DeployError::MissingSymbol(NEW_INTERPRETER_SYMBOL))?;

    adopt(*factory)
}

/// Call `factory` and take ownership of its leaked `Box<Box<dyn InterpreterImpl>>`
///
/// # Safety
///
/// A non-null return must come from `Box::into_raw` on a
/// `Box<Box<dyn InterpreterImpl>>` built against this crate version.
unsafe fn adopt(factory: NewInterpreterFn) -> Result<Box<dyn InterpreterImpl>> {
    let raw = factory();
    if raw.is_null() {
        warn!("{} returned null", NEW_INTERPRETER_SYMBOL);
        return Err(DeployError::NullInterpreter(NEW_INTERPRETER_SYMBOL));
    }

    Ok(*Box::from_raw(raw as *mut Box<dyn InterpreterImpl>))
}

#[cfg(unix)]
fn open_library(path: &Path) -> std::result::Result<Library, libloading::Error> {
    use libloading::os::unix::{Library as UnixLibrary, RTLD_LAZY, RTLD_LOCAL};

    #[cfg(all(target_os = "linux", target_env = "gnu"))]
    let flags = RTLD_LOCAL | RTLD_LAZY | libc::RTLD_DEEPBIND;
    #[cfg(not(all(target_os = "linux", target_env = "gnu")))]
    let flags = RTLD_LOCAL | RTLD_LAZY;

    unsafe { UnixLibrary::open(Some(path), flags) }.map(Library::from)
}

#[cfg(not(unix))]
fn open_library(path: &Path) -> std::result::Result<Library, libloading::Error> {
    unsafe { Library::new(path) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::reference::ReferenceInterpreter;
    use crate::runtime::value::Value;

    fn staged_files(dir: &Path) -> usize {
        std::fs::read_dir(dir)
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().starts_with(STAGING_PREFIX))
            .count()
    }

    #[test]
    fn test_empty_image_is_rejected() {
        let result = LoadedImage::load(&EmbeddedImage::from_static(b""), None);
        assert!(matches!(result, Err(DeployError::EmptyImage)));
    }

    #[test]
    fn test_invalid_image_fails_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let image = EmbeddedImage::from_static(b"definitely not a shared library");

        let err = LoadedImage::load(&image, Some(dir.path())).err().unwrap();
        assert!(matches!(err, DeployError::ImageLoad { .. }));
        assert!(err.is_fatal());
        assert_eq!(staged_files(dir.path()), 0);
    }

    unsafe extern "C" fn null_factory() -> *mut std::ffi::c_void {
        std::ptr::null_mut()
    }

    unsafe extern "C" fn reference_factory() -> *mut std::ffi::c_void {
        let runtime: Box<dyn InterpreterImpl> = Box::new(ReferenceInterpreter::new());
        Box::into_raw(Box::new(runtime)) as *mut std::ffi::c_void
    }

    #[test]
    fn test_null_factory_is_fatal() {
        let err = unsafe { adopt(null_factory) }.err().unwrap();
        assert!(matches!(err, DeployError::NullInterpreter(NEW_INTERPRETER_SYMBOL)));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_adopt_takes_ownership() {
        let runtime = unsafe { adopt(reference_factory) }.unwrap();
        let mut session = runtime.acquire_session();
        let obj = session.from_value(Value::Int(7)).unwrap();
        assert_eq!(session.to_value(obj).unwrap(), Value::Int(7));
    }

    #[test]
    fn test_missing_staging_dir_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("does-not-exist");
        let image = EmbeddedImage::from_static(b"bytes");

        let err = LoadedImage::load(&image, Some(&missing)).err().unwrap();
        assert!(matches!(err, DeployError::ImageStaging(_)));
    }
}
