// src/deploy/session.rs
//! Scoped access to one interpreter
//!
//! An [`InterpreterSession`] is the only way to touch objects inside an
//! interpreter. Handles ([`Obj`]) borrow the session, so they cannot outlive
//! it. A handle passed to a different session is rejected: `create_movable`
//! checks ownership, and the runtime refuses handles it did not issue.
//! Dropping a session returns its slot to the pool's balancer.

use crate::deploy::interpreter::Interpreter;
use crate::deploy::manager::ManagerShared;
use crate::deploy::replicated::ReplicatedObj;
use crate::runtime::abi::InterpreterSessionImpl;
use crate::runtime::value::{Arg, ObjHandle, ObjectId, Value};
use crate::utils::errors::{DeployError, Result};
use std::cell::RefCell;
use std::fmt;
use std::sync::Arc;
use tracing::trace;

/// A live session on one interpreter
pub struct InterpreterSession {
    // Declared first: the runtime session must go away while its
    // interpreter is still loaded.
    inner: RefCell<Box<dyn InterpreterSessionImpl>>,
    interpreter: Arc<Interpreter>,
    manager: Option<Arc<ManagerShared>>,

    /// Balancer slot to free on drop
    notify_idx: Option<usize>,

    /// Implicit receiver for replicated-object and package sessions
    self_obj: Option<ObjHandle>,
}

impl InterpreterSession {
    pub(crate) fn new(
        interpreter: Arc<Interpreter>,
        manager: Option<Arc<ManagerShared>>,
        notify_idx: Option<usize>,
    ) -> Self {
        let inner = interpreter.runtime().acquire_session();
        metrics::counter!("deploy_sessions_acquired_total").increment(1);
        trace!(
            "Opened session on interpreter {:?} (slot {:?})",
            interpreter.index(),
            notify_idx
        );

        Self {
            inner: RefCell::new(inner),
            interpreter,
            manager,
            notify_idx,
            self_obj: None,
        }
    }

    /// The interpreter this session runs on
    pub fn interpreter(&self) -> &Arc<Interpreter> {
        &self.interpreter
    }

    /// Balancer slot held by this session, if it came from the pool
    pub fn slot(&self) -> Option<usize> {
        self.notify_idx
    }

    /// Look up `module.name`, importing `module` on first use
    pub fn global(&self, module: &str, name: &str) -> Result<Obj<'_>> {
        let handle = self.inner.borrow_mut().global(module, name)?;
        Ok(self.wrap(handle))
    }

    /// Bind `module.name` to `value`
    pub fn set_global(&self, module: &str, name: &str, value: impl Into<Arg>) -> Result<()> {
        let value = value.into();
        self.inner.borrow_mut().set_global(module, name, &value)?;
        Ok(())
    }

    /// Convert a host value into an interpreter object
    pub fn from_value(&self, value: impl Into<Value>) -> Result<Obj<'_>> {
        let handle = self.inner.borrow_mut().from_value(value.into())?;
        Ok(self.wrap(handle))
    }

    /// This interpreter's copy of `obj`, deserialized on first use
    pub fn from_movable(&self, obj: &ReplicatedObj) -> Result<Obj<'_>> {
        let handle = self
            .inner
            .borrow_mut()
            .unpickle_or_get(obj.object_id(), obj.payload())?;
        Ok(self.wrap(handle))
    }

    /// Serialize `obj` into a handle that any pool interpreter can load
    pub fn create_movable(&self, obj: &Obj<'_>) -> Result<ReplicatedObj> {
        if !std::ptr::eq(obj.session, self) {
            return Err(DeployError::invariant(
                "can only create a movable object from an object owned by this session",
            ));
        }

        let manager = self.manager.as_ref().ok_or_else(|| {
            DeployError::invariant(
                "can only create a movable object when the session was created \
                 from an interpreter that is part of an InterpreterManager",
            )
        })?;

        let payload = self.inner.borrow_mut().pickle(self.self_obj, obj.handle)?;
        let id = manager.next_object_id();
        metrics::counter!("deploy_objects_replicated_total").increment(1);
        trace!("Created movable {} ({} bytes)", id, payload.len());

        Ok(ReplicatedObj::new(id, payload.into(), Arc::downgrade(manager)))
    }

    /// The implicit receiver, if this session has one
    pub fn self_obj(&self) -> Option<Obj<'_>> {
        self.self_obj.map(|handle| self.wrap(handle))
    }

    pub(crate) fn set_self(&mut self, handle: ObjHandle) {
        self.self_obj = Some(handle);
    }

    pub(crate) fn open_package(
        &self,
        archive: Arc<dyn crate::runtime::abi::PackageArchive>,
    ) -> Result<ObjHandle> {
        Ok(self.inner.borrow_mut().open_package(archive)?)
    }

    /// Drop this interpreter's copy of a replicated object
    pub(crate) fn unload(&self, id: ObjectId) -> Result<()> {
        self.inner.borrow_mut().unload(id)?;
        Ok(())
    }

    fn wrap(&self, handle: ObjHandle) -> Obj<'_> {
        Obj {
            session: self,
            handle,
        }
    }
}

impl fmt::Debug for InterpreterSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterpreterSession")
            .field("interpreter", &self.interpreter.index())
            .field("slot", &self.notify_idx)
            .field("self_obj", &self.self_obj)
            .finish()
    }
}

impl Drop for InterpreterSession {
    fn drop(&mut self) {
        if let (Some(manager), Some(slot)) = (&self.manager, self.notify_idx) {
            manager.resources.free(slot);
        }
    }
}

/// An object handle valid for the lifetime of its session
#[derive(Clone, Copy)]
pub struct Obj<'s> {
    session: &'s InterpreterSession,
    handle: ObjHandle,
}

impl<'s> Obj<'s> {
    pub fn handle(&self) -> ObjHandle {
        self.handle
    }

    pub fn session(&self) -> &'s InterpreterSession {
        self.session
    }

    /// Call this object with positional arguments
    pub fn call(&self, args: &[Arg]) -> Result<Obj<'s>> {
        let handle = self.session.inner.borrow_mut().call(self.handle, args)?;
        Ok(self.session.wrap(handle))
    }

    pub fn attr(&self, name: &str) -> Result<Obj<'s>> {
        let handle = self.session.inner.borrow_mut().attr(self.handle, name)?;
        Ok(self.session.wrap(handle))
    }

    /// Copy this object out as a host value
    pub fn to_value(&self) -> Result<Value> {
        Ok(self.session.inner.borrow_mut().to_value(self.handle)?)
    }
}

impl fmt::Debug for Obj<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Obj").field(&self.handle.0).finish()
    }
}

impl From<Obj<'_>> for Arg {
    fn from(obj: Obj<'_>) -> Self {
        Arg::Obj(obj.handle)
    }
}

impl From<&Obj<'_>> for Arg {
    fn from(obj: &Obj<'_>) -> Self {
        Arg::Obj(obj.handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deploy::interpreter::RuntimeSource;

    fn standalone() -> Arc<Interpreter> {
        Arc::new(Interpreter::create(&RuntimeSource::reference()).unwrap())
    }

    #[test]
    fn test_values_roundtrip_through_session() {
        let interp = standalone();
        let session = interp.acquire_session();

        let list = session.from_value(vec![1i64, 2]).unwrap();
        let append = list.attr("append").unwrap();
        append.call(&[Arg::from(3i64)]).unwrap();
        assert_eq!(list.to_value().unwrap(), Value::from(vec![1i64, 2, 3]));
    }

    #[test]
    fn test_set_global_accepts_objects() {
        let interp = standalone();
        let session = interp.acquire_session();

        let obj = session.from_value("hello").unwrap();
        session.set_global("scratch", "greeting", &obj).unwrap();
        let read = session.global("scratch", "greeting").unwrap();
        assert_eq!(read.to_value().unwrap(), Value::from("hello"));
    }

    #[test]
    fn test_runtime_errors_propagate() {
        let interp = standalone();
        let session = interp.acquire_session();

        let err = session.global("missing", "f").unwrap_err();
        assert!(matches!(err, DeployError::Runtime(_)));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_create_movable_requires_manager() {
        let interp = standalone();
        let session = interp.acquire_session();

        let obj = session.from_value(1i64).unwrap();
        let err = session.create_movable(&obj).unwrap_err();
        assert!(matches!(err, DeployError::InvariantViolation(_)));
    }

    #[test]
    fn test_objects_from_another_session_are_rejected() {
        let manager =
            crate::deploy::manager::InterpreterManager::with_source(2, RuntimeSource::reference())
                .unwrap();
        let a = manager.acquire_one();
        let b = manager.acquire_one();

        let in_a = a.from_value("from A").unwrap();
        let in_b = b.from_value("from B").unwrap();

        let err = b.create_movable(&in_a).unwrap_err();
        assert!(matches!(err, DeployError::InvariantViolation(_)));

        let len = b.global("builtins", "len").unwrap();
        let err = len.call(&[Arg::from(&in_a)]).unwrap_err();
        assert!(matches!(err, DeployError::Runtime(ref e) if e.kind == "ReferenceError"));

        // The owning session still works
        let movable = b.create_movable(&in_b).unwrap();
        let copy = a.from_movable(&movable).unwrap();
        assert_eq!(copy.to_value().unwrap(), Value::from("from B"));
    }

    #[test]
    fn test_standalone_session_has_no_slot() {
        let interp = standalone();
        let session = interp.acquire_session();
        assert_eq!(session.slot(), None);
        assert!(session.self_obj().is_none());
    }
}
