// src/runtime/mod.rs
//! Embedded interpreter runtime support
//!
//! This module covers everything below the pool:
//!
//! - **ABI**: the traits every interpreter implements, plus the image symbols
//! - **Values**: data and handles crossing the interpreter boundary
//! - **Images**: interpreter shared-library bytes and variant selection
//! - **Loader**: staging an image to disk and `dlopen`-ing a private copy
//! - **Reference runtime**: an in-process interpreter for tests and tooling
//!
//! # Architecture
//!
//! ```text
//! ImageSet ──select──▶ EmbeddedImage ──stage──▶ /tmp/deploy_interpXXXX.so
//!                                                   │ dlopen + unlink
//!                                                   ▼
//!                                       deploy_new_interpreter_impl()
//!                                                   │
//!                                                   ▼
//!                                       Box<dyn InterpreterImpl>
//! ```

pub mod abi;
pub mod image;
pub mod loader;
pub mod reference;
pub mod value;

// Re-export commonly used types
pub use abi::{
    InterpreterImpl, InterpreterSessionImpl, ModuleFinder, PackageArchive, RuntimeError,
    RuntimeResult,
};
pub use image::{detect_accelerator, EmbeddedImage, ImageSet};
pub use loader::LoadedImage;
pub use reference::ReferenceInterpreter;
pub use value::{Arg, ObjHandle, ObjectId, Value};
