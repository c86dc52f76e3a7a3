// src/deploy/replicated.rs
//! Objects replicated lazily across a pool
//!
//! A [`ReplicatedObj`] carries a pool-unique id and a serialized payload.
//! Each interpreter deserializes its own copy the first time a session asks
//! for it; later requests on that interpreter return the same copy. When the
//! last handle goes away, every interpreter's copy is released.

use crate::deploy::interpreter::Interpreter;
use crate::deploy::manager::ManagerShared;
use crate::deploy::session::InterpreterSession;
use crate::runtime::value::{Arg, ObjectId, Value};
use crate::utils::errors::{DeployError, Result};
use bytes::Bytes;
use std::fmt;
use std::sync::{Arc, Weak};
use tracing::{trace, warn};

pub(crate) struct ReplicatedObjImpl {
    id: ObjectId,
    payload: Bytes,
    manager: Weak<ManagerShared>,
}

impl ReplicatedObjImpl {
    /// Release the copy held by `on`, or by every pool interpreter
    fn unload(&self, on: Option<&Arc<Interpreter>>) -> Result<()> {
        match on {
            Some(interp) => interp.acquire_session().unload(self.id),
            None => {
                // Pool already gone: its interpreters took their copies with them
                let Some(manager) = self.manager.upgrade() else {
                    return Ok(());
                };
                for interp in &manager.instances {
                    interp.acquire_session().unload(self.id)?;
                }
                metrics::counter!("deploy_objects_unloaded_total").increment(1);
                trace!("Unloaded {} from {} interpreters", self.id, manager.instances.len());
                Ok(())
            }
        }
    }
}

impl Drop for ReplicatedObjImpl {
    fn drop(&mut self) {
        if let Err(e) = self.unload(None) {
            warn!("Failed to unload {}: {}", self.id, e);
        }
    }
}

/// Shared handle to a replicated object
#[derive(Clone)]
pub struct ReplicatedObj {
    inner: Arc<ReplicatedObjImpl>,
}

impl ReplicatedObj {
    pub(crate) fn new(id: ObjectId, payload: Bytes, manager: Weak<ManagerShared>) -> Self {
        Self {
            inner: Arc::new(ReplicatedObjImpl {
                id,
                payload,
                manager,
            }),
        }
    }

    pub fn object_id(&self) -> ObjectId {
        self.inner.id
    }

    /// Serialized form shared by every interpreter
    pub fn payload(&self) -> &[u8] {
        &self.inner.payload
    }

    /// Open a session whose `self_obj` is this interpreter's copy
    ///
    /// Uses `on` when given, otherwise whatever interpreter the pool hands
    /// out.
    pub fn acquire_session(&self, on: Option<&Arc<Interpreter>>) -> Result<InterpreterSession> {
        let mut session = match on {
            Some(interp) => interp.acquire_session(),
            None => {
                let manager = self.inner.manager.upgrade().ok_or_else(|| {
                    DeployError::invariant("the interpreter pool was dropped before this object")
                })?;
                manager.acquire_one()
            }
        };

        let handle = session.from_movable(self)?.handle();
        session.set_self(handle);
        Ok(session)
    }

    /// Call the object on some pool interpreter and copy out the result
    pub fn call(&self, args: &[Arg]) -> Result<Value> {
        let session = self.acquire_session(None)?;
        let value = match session.self_obj() {
            Some(obj) => obj.call(args)?.to_value()?,
            None => return Err(DeployError::invariant("replicated session has no receiver")),
        };
        Ok(value)
    }

    /// Release copies early: on `on` only, or on every pool interpreter
    ///
    /// A later [`InterpreterSession::from_movable`] deserializes a fresh copy.
    pub fn unload(&self, on: Option<&Arc<Interpreter>>) -> Result<()> {
        self.inner.unload(on)
    }
}

impl fmt::Debug for ReplicatedObj {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicatedObj")
            .field("id", &self.inner.id)
            .field("payload_len", &self.inner.payload.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deploy::interpreter::RuntimeSource;
    use crate::deploy::manager::InterpreterManager;

    fn pool(n: usize) -> InterpreterManager {
        InterpreterManager::with_source(n, RuntimeSource::reference()).unwrap()
    }

    fn movable_list(manager: &InterpreterManager) -> ReplicatedObj {
        let session = manager.acquire_one();
        let list = session.from_value(vec![1i64]).unwrap();
        session.create_movable(&list).unwrap()
    }

    #[test]
    fn test_ids_are_unique() {
        let manager = pool(2);
        let a = movable_list(&manager);
        let b = movable_list(&manager);
        assert_ne!(a.object_id(), b.object_id());
    }

    #[test]
    fn test_copies_are_independent() {
        let manager = pool(2);
        let obj = movable_list(&manager);
        let [a, b] = [manager.instance(0).unwrap(), manager.instance(1).unwrap()];

        let sa = obj.acquire_session(Some(a)).unwrap();
        let append = sa.self_obj().unwrap().attr("append").unwrap();
        append.call(&[Arg::from(2i64)]).unwrap();

        // Same copy on the same interpreter
        let again = a.acquire_session();
        let copy = again.from_movable(&obj).unwrap();
        assert_eq!(copy.to_value().unwrap(), Value::from(vec![1i64, 2]));

        let sb = obj.acquire_session(Some(b)).unwrap();
        assert_eq!(
            sb.self_obj().unwrap().to_value().unwrap(),
            Value::from(vec![1i64])
        );
    }

    #[test]
    fn test_unload_then_rematerialize() {
        let manager = pool(1);
        let obj = movable_list(&manager);
        let interp = manager.instance(0).unwrap();

        {
            let session = interp.acquire_session();
            let copy = session.from_movable(&obj).unwrap();
            copy.attr("append").unwrap().call(&[Arg::from(5i64)]).unwrap();
        }

        obj.unload(Some(interp)).unwrap();

        let session = interp.acquire_session();
        let fresh = session.from_movable(&obj).unwrap();
        assert_eq!(fresh.to_value().unwrap(), Value::from(vec![1i64]));
    }

    #[test]
    fn test_drop_releases_every_copy() {
        let manager = pool(2);
        let obj = movable_list(&manager);
        let id = obj.object_id();
        let payload = Bytes::copy_from_slice(obj.payload());
        for interp in manager.all_instances() {
            obj.acquire_session(Some(interp)).unwrap();
        }

        drop(obj);

        // Unloading an id that is already gone is a no-op
        for interp in manager.all_instances() {
            interp.acquire_session().unload(id).unwrap();
        }

        // A new handle over the same payload materializes everywhere again
        let shared = manager.shared();
        let fresh = ReplicatedObj::new(shared.next_object_id(), payload, Arc::downgrade(shared));
        assert_ne!(fresh.object_id(), id);
        for interp in manager.all_instances() {
            let session = fresh.acquire_session(Some(interp)).unwrap();
            let value = session.self_obj().unwrap().to_value().unwrap();
            assert_eq!(value, Value::from(vec![1i64]));
        }
    }

    #[test]
    fn test_outlives_manager() {
        let manager = pool(2);
        let obj = movable_list(&manager);
        drop(manager);

        assert!(obj.acquire_session(None).is_err());
        obj.unload(None).unwrap();
        drop(obj);
    }

    #[test]
    fn test_call_runs_on_pool() {
        let manager = pool(2);
        manager.register_module_source("math2", "def double(x): return x + x");

        let session = manager.acquire_one();
        let double = session.global("math2", "double").unwrap();
        let movable = session.create_movable(&double).unwrap();
        drop(session);

        assert_eq!(movable.call(&[Arg::from(21i64)]).unwrap(), Value::Int(42));
    }
}
