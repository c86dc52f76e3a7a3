// src/runtime/reference/mod.rs
//! In-process reference runtime
//!
//! A small interpreter that implements the embedding ABI without loading a
//! shared library. Pools built on it behave like pools of loaded images:
//! every instance has its own heap, module table and replicated-object
//! table, and an instance-wide lock plays the part of the runtime's global
//! execution lock.
//!
//! See [`parser`] for the module language.

pub mod eval;
pub mod parser;

use crate::runtime::abi::{
    InterpreterImpl, InterpreterSessionImpl, ModuleFinder, PackageArchive, RuntimeError,
    RuntimeResult,
};
use crate::runtime::value::{Arg, ObjHandle, ObjectId, Value};
use eval::{HeapId, Operand, State};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Handles are unique process-wide, so a handle from another session never
/// resolves to an object here
static NEXT_HANDLE: AtomicU64 = AtomicU64::new(1);

/// One reference-runtime instance
pub struct ReferenceInterpreter {
    state: Arc<Mutex<State>>,
}

impl ReferenceInterpreter {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State::new())),
        }
    }

    /// Number of live heap objects, for leak checks
    pub fn live_objects(&self) -> usize {
        self.state.lock().live_objects()
    }

    /// Number of replicated objects this instance holds a copy of
    pub fn replicated_count(&self) -> usize {
        self.state.lock().replicated_count()
    }
}

impl Default for ReferenceInterpreter {
    fn default() -> Self {
        Self::new()
    }
}

impl InterpreterImpl for ReferenceInterpreter {
    fn acquire_session(&self) -> Box<dyn InterpreterSessionImpl> {
        Box::new(ReferenceSession {
            state: Arc::clone(&self.state),
            handles: HashMap::new(),
        })
    }

    fn set_find_module(&self, finder: ModuleFinder) {
        self.state.lock().set_finder(finder);
    }
}

/// Per-session handle table over a shared instance
struct ReferenceSession {
    state: Arc<Mutex<State>>,
    handles: HashMap<ObjHandle, HeapId>,
}

impl ReferenceSession {
    fn heap_id(&self, handle: ObjHandle) -> RuntimeResult<HeapId> {
        self.handles.get(&handle).copied().ok_or_else(|| {
            RuntimeError::new(
                "ReferenceError",
                format!("handle {} does not belong to this session", handle.0),
            )
        })
    }

    fn operand(&self, arg: &Arg) -> RuntimeResult<Operand> {
        match arg {
            Arg::Value(value) => Ok(Operand::Val(value.clone())),
            Arg::Obj(handle) => self.heap_id(*handle).map(Operand::Obj),
        }
    }

    /// Hand out a handle for an owned heap reference
    fn track(&mut self, id: HeapId) -> ObjHandle {
        let handle = ObjHandle(NEXT_HANDLE.fetch_add(1, Ordering::Relaxed));
        self.handles.insert(handle, id);
        handle
    }

    /// Run `op` under the instance lock, storing its result for this session
    fn with_state<F>(&mut self, op: F) -> RuntimeResult<ObjHandle>
    where
        F: FnOnce(&mut State) -> RuntimeResult<Operand>,
    {
        let mut state = self.state.lock();
        let result = op(&mut *state).map(|operand| state.store(operand));
        state.clear_temporaries();
        drop(state);
        result.map(|id| self.track(id))
    }
}

impl InterpreterSessionImpl for ReferenceSession {
    fn global(&mut self, module: &str, name: &str) -> RuntimeResult<ObjHandle> {
        self.with_state(|state| state.global(module, name).map(Operand::Obj))
    }

    fn set_global(&mut self, module: &str, name: &str, value: &Arg) -> RuntimeResult<()> {
        let operand = self.operand(value)?;
        let mut state = self.state.lock();
        let id = state.store(operand);
        state.bind(module, name, id);
        Ok(())
    }

    fn attr(&mut self, obj: ObjHandle, name: &str) -> RuntimeResult<ObjHandle> {
        let target = Operand::Obj(self.heap_id(obj)?);
        self.with_state(|state| state.attr(target, name))
    }

    fn call(&mut self, callee: ObjHandle, args: &[Arg]) -> RuntimeResult<ObjHandle> {
        let callee = Operand::Obj(self.heap_id(callee)?);
        let args = args
            .iter()
            .map(|arg| self.operand(arg))
            .collect::<RuntimeResult<Vec<_>>>()?;
        self.with_state(|state| state.call(callee, args))
    }

    fn to_value(&mut self, obj: ObjHandle) -> RuntimeResult<Value> {
        let operand = Operand::Obj(self.heap_id(obj)?);
        self.state.lock().to_value(&operand)
    }

    fn from_value(&mut self, value: Value) -> RuntimeResult<ObjHandle> {
        self.with_state(|_| Ok(Operand::Val(value)))
    }

    fn pickle(&mut self, _container: Option<ObjHandle>, obj: ObjHandle) -> RuntimeResult<Vec<u8>> {
        let id = self.heap_id(obj)?;
        self.state.lock().pickle(id)
    }

    fn unpickle_or_get(&mut self, id: ObjectId, data: &[u8]) -> RuntimeResult<ObjHandle> {
        self.with_state(|state| state.unpickle_or_get(id, data).map(Operand::Obj))
    }

    fn unload(&mut self, id: ObjectId) -> RuntimeResult<()> {
        self.state.lock().unload(id);
        Ok(())
    }

    fn open_package(&mut self, archive: Arc<dyn PackageArchive>) -> RuntimeResult<ObjHandle> {
        let id = self.state.lock().alloc_importer(archive);
        Ok(self.track(id))
    }
}

impl Drop for ReferenceSession {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        for (_, id) in self.handles.drain() {
            state.release(id);
        }
    }
}
