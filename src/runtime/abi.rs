// src/runtime/abi.rs
//! Boundary between the pool and an embedded interpreter
//!
//! Every interpreter, whether loaded from a shared-library image or built
//! in-process, is driven through [`InterpreterImpl`]. Work happens inside a
//! per-session [`InterpreterSessionImpl`] that owns the session's object
//! table; dropping it releases every handle it handed out.
//!
//! # Image ABI
//!
//! A loadable image exports:
//!
//! - `deploy_new_interpreter_impl`: `extern "C" fn() -> *mut c_void`,
//!   returning a leaked `Box<Box<dyn InterpreterImpl>>`
//! - `deploy_flush_runtime_libs` (optional): `extern "C" fn()`, called after
//!   the implementation is dropped and before the image is unloaded
//!
//! Use [`export_interpreter!`](crate::export_interpreter) to generate both.
//! Images must be built with the same toolchain and crate version as the
//! host, since trait objects cross the boundary.

use crate::runtime::value::{Arg, ObjHandle, ObjectId, Value};
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;

/// Factory symbol every image must export
pub const NEW_INTERPRETER_SYMBOL: &str = "deploy_new_interpreter_impl";

/// Optional teardown symbol
pub const FLUSH_RUNTIME_SYMBOL: &str = "deploy_flush_runtime_libs";

/// Signature of [`NEW_INTERPRETER_SYMBOL`]
pub type NewInterpreterFn = unsafe extern "C" fn() -> *mut std::ffi::c_void;

/// Signature of [`FLUSH_RUNTIME_SYMBOL`]
pub type FlushRuntimeFn = unsafe extern "C" fn();

/// Module-source resolver installed into each interpreter
pub type ModuleFinder = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Exception raised inside an embedded interpreter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeError {
    /// Runtime-specific exception class, e.g. `NameError`
    pub kind: String,

    /// Human-readable message
    pub message: String,
}

impl RuntimeError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for RuntimeError {}

pub type RuntimeResult<T> = std::result::Result<T, RuntimeError>;

/// Read access to a package archive
pub trait PackageArchive: Send + Sync {
    /// Read one record; `Ok(None)` when the record does not exist
    fn read_record(&self, name: &str) -> std::io::Result<Option<Bytes>>;

    /// Where the archive came from, for diagnostics
    fn describe(&self) -> String;
}

/// One loaded interpreter instance
pub trait InterpreterImpl: Send + Sync {
    /// Open a new session with its own object table
    fn acquire_session(&self) -> Box<dyn InterpreterSessionImpl>;

    /// Install the resolver consulted before built-in modules
    fn set_find_module(&self, finder: ModuleFinder);
}

/// Work performed inside one interpreter on behalf of one session
pub trait InterpreterSessionImpl: Send {
    /// Look up `name` in `module`, importing the module if needed
    fn global(&mut self, module: &str, name: &str) -> RuntimeResult<ObjHandle>;

    /// Bind `name` in `module` to `value`, creating the module if needed
    fn set_global(&mut self, module: &str, name: &str, value: &Arg) -> RuntimeResult<()>;

    fn attr(&mut self, obj: ObjHandle, name: &str) -> RuntimeResult<ObjHandle>;

    fn call(&mut self, callee: ObjHandle, args: &[Arg]) -> RuntimeResult<ObjHandle>;

    /// Copy an object out as plain data
    fn to_value(&mut self, obj: ObjHandle) -> RuntimeResult<Value>;

    /// Copy plain data in as a new object
    fn from_value(&mut self, value: Value) -> RuntimeResult<ObjHandle>;

    /// Serialize `obj`; `container` is the package importer the object came from, if any
    fn pickle(&mut self, container: Option<ObjHandle>, obj: ObjHandle) -> RuntimeResult<Vec<u8>>;

    /// Return the interpreter's copy of `id`, deserializing `data` on first use
    fn unpickle_or_get(&mut self, id: ObjectId, data: &[u8]) -> RuntimeResult<ObjHandle>;

    /// Forget the interpreter's copy of `id`; unknown ids are ignored
    fn unload(&mut self, id: ObjectId) -> RuntimeResult<()>;

    /// Create an importer object reading from `archive`
    fn open_package(&mut self, archive: Arc<dyn PackageArchive>) -> RuntimeResult<ObjHandle>;
}

/// Export an interpreter implementation from a loadable image
///
/// ```ignore
/// deploy_engine::export_interpreter!(MyRuntime::new());
/// deploy_engine::export_interpreter!(MyRuntime::new(), flush = my_runtime::flush);
/// ```
#[macro_export]
macro_rules! export_interpreter {
    ($ctor:expr) => {
        #[no_mangle]
        pub extern "C" fn deploy_new_interpreter_impl() -> *mut ::std::ffi::c_void {
            let runtime: ::std::boxed::Box<dyn $crate::runtime::abi::InterpreterImpl> =
                ::std::boxed::Box::new($ctor);
            ::std::boxed::Box::into_raw(::std::boxed::Box::new(runtime)) as *mut ::std::ffi::c_void
        }
    };
    ($ctor:expr, flush = $flush:path) => {
        $crate::export_interpreter!($ctor);

        #[no_mangle]
        pub extern "C" fn deploy_flush_runtime_libs() {
            $flush()
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_error_display() {
        let err = RuntimeError::new("AttributeError", "no attribute 'x'");
        assert_eq!(err.to_string(), "AttributeError: no attribute 'x'");
    }
}
