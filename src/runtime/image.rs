// src/runtime/image.rs
//! Interpreter images and variant selection
//!
//! An image is the raw bytes of an interpreter shared library. Images are
//! supplied explicitly through an [`ImageSet`] when a pool is built; there is
//! no process-wide registration state.

use crate::utils::errors::{DeployError, Result};
use bytes::Bytes;
use once_cell::sync::OnceCell;
use std::path::Path;
use tracing::debug;

/// Bytes of one loadable interpreter image
#[derive(Debug, Clone)]
pub struct EmbeddedImage {
    bytes: Bytes,
}

impl EmbeddedImage {
    /// Wrap a compiled-in blob (e.g. from `include_bytes!`)
    pub fn from_static(bytes: &'static [u8]) -> Self {
        Self {
            bytes: Bytes::from_static(bytes),
        }
    }

    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        Self {
            bytes: bytes.into(),
        }
    }

    /// Read an image from disk
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(DeployError::ImageStaging)?;
        debug!("Read interpreter image {:?} ({} bytes)", path, bytes.len());
        Ok(Self::from_bytes(bytes))
    }

    /// Wrap a `[start, end)` byte range registered by a linker-provided blob
    ///
    /// # Safety
    ///
    /// Both pointers must come from the same allocation that stays valid and
    /// unmodified for the rest of the process, with `start <= end`.
    pub unsafe fn from_raw_range(start: *const u8, end: *const u8) -> Result<Self> {
        if start.is_null() || end.is_null() {
            return Err(DeployError::invariant("expected non-null image range"));
        }
        let len = end.offset_from(start);
        if len <= 0 {
            return Err(DeployError::EmptyImage);
        }
        let slice: &'static [u8] = std::slice::from_raw_parts(start, len as usize);
        Ok(Self::from_static(slice))
    }

    /// The image compiled into this crate via `DEPLOY_INTERPRETER_IMAGE`
    #[cfg(embedded_image)]
    pub fn builtin() -> Option<Self> {
        Some(Self::from_static(include_bytes!(env!(
            "DEPLOY_EMBEDDED_IMAGE_PATH"
        ))))
    }

    /// The image compiled into this crate via `DEPLOY_INTERPRETER_IMAGE`
    #[cfg(not(embedded_image))]
    pub fn builtin() -> Option<Self> {
        None
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// The image variants available to a pool
#[derive(Debug, Clone, Default)]
pub struct ImageSet {
    /// Image built without accelerator support
    pub standard: Option<EmbeddedImage>,

    /// Image built with accelerator support
    pub accelerated: Option<EmbeddedImage>,
}

impl ImageSet {
    pub fn standard(image: EmbeddedImage) -> Self {
        Self {
            standard: Some(image),
            accelerated: None,
        }
    }

    pub fn with_accelerated(mut self, image: EmbeddedImage) -> Self {
        self.accelerated = Some(image);
        self
    }

    /// The compiled-in image, if the crate was built with one
    pub fn builtin() -> Self {
        Self {
            standard: EmbeddedImage::builtin(),
            accelerated: None,
        }
    }

    /// Pick the variant for this host
    ///
    /// Prefers the accelerated image when an accelerator is present and the
    /// standard image otherwise, falling back to whichever one exists.
    pub fn select(&self, accelerator_available: bool) -> Result<&EmbeddedImage> {
        let (preferred, fallback) = if accelerator_available {
            (&self.accelerated, &self.standard)
        } else {
            (&self.standard, &self.accelerated)
        };

        let image = preferred
            .as_ref()
            .or(fallback.as_ref())
            .ok_or(DeployError::MissingImage {
                accelerator_available,
            })?;

        if image.is_empty() {
            return Err(DeployError::EmptyImage);
        }
        Ok(image)
    }
}

/// Whether this host has an accelerator the runtime can use
///
/// `DEPLOY_ACCELERATOR=0|1` overrides the device check. The answer is cached
/// for the life of the process.
pub fn detect_accelerator() -> bool {
    static AVAILABLE: OnceCell<bool> = OnceCell::new();

    *AVAILABLE.get_or_init(|| {
        let available = match std::env::var("DEPLOY_ACCELERATOR") {
            Ok(value) => matches!(value.as_str(), "1" | "true" | "yes"),
            Err(_) => Path::new("/dev/nvidiactl").exists(),
        };
        debug!("Accelerator available: {}", available);
        available
    })
}
