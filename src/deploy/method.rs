// src/deploy/method.rs
//! Calling a named method of a replicated model

use crate::deploy::interpreter::ARGUMENT_NAMES_MODULE;
use crate::deploy::replicated::ReplicatedObj;
use crate::runtime::value::{Arg, Value};
use crate::utils::errors::{DeployError, Result};

/// A method of a replicated object, callable on any pool interpreter
#[derive(Debug, Clone)]
pub struct MethodWrapper {
    model: ReplicatedObj,
    method_name: String,
}

impl MethodWrapper {
    pub fn new(model: ReplicatedObj, method_name: impl Into<String>) -> Self {
        Self {
            model,
            method_name: method_name.into(),
        }
    }

    pub fn model(&self) -> &ReplicatedObj {
        &self.model
    }

    pub fn method_name(&self) -> &str {
        &self.method_name
    }

    /// Parameter names of the method, in declaration order
    pub fn argument_names(&self) -> Result<Vec<String>> {
        let session = self.model.acquire_session(None)?;
        let method = session
            .self_obj()
            .ok_or_else(|| DeployError::invariant("replicated session has no receiver"))?
            .attr(&self.method_name)?;
        let names = session
            .global(ARGUMENT_NAMES_MODULE, "getArgumentNames")?
            .call(&[Arg::from(method)])?
            .to_value()?;

        match names {
            Value::List(items) => items
                .into_iter()
                .map(|item| match item {
                    Value::Str(name) => Ok(name),
                    other => Err(DeployError::invariant(format!(
                        "argument name is a {}, not a str",
                        other.type_name()
                    ))),
                })
                .collect(),
            other => Err(DeployError::invariant(format!(
                "getArgumentNames returned a {}, not a list",
                other.type_name()
            ))),
        }
    }

    pub fn call(&self, args: &[Arg]) -> Result<Value> {
        let session = self.model.acquire_session(None)?;
        let value = match session.self_obj() {
            Some(receiver) => receiver.attr(&self.method_name)?.call(args)?.to_value()?,
            None => return Err(DeployError::invariant("replicated session has no receiver")),
        };
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deploy::interpreter::RuntimeSource;
    use crate::deploy::manager::InterpreterManager;

    /// Replicate module `model` so its functions act as methods
    fn replicated_model(manager: &InterpreterManager) -> ReplicatedObj {
        manager.register_module_source(
            "model",
            "def forward(x, bias): return x + bias\ndef describe(): return \"linear\"",
        );
        let session = manager.acquire_one();
        let module = session
            .global("builtins", "import_module")
            .unwrap()
            .call(&[Arg::from("model")])
            .unwrap();
        session.create_movable(&module).unwrap()
    }

    #[test]
    fn test_argument_names() {
        let manager = InterpreterManager::with_source(2, RuntimeSource::reference()).unwrap();
        let forward = MethodWrapper::new(replicated_model(&manager), "forward");

        assert_eq!(forward.argument_names().unwrap(), vec!["x", "bias"]);
    }

    #[test]
    fn test_call() {
        let manager = InterpreterManager::with_source(2, RuntimeSource::reference()).unwrap();
        let model = replicated_model(&manager);

        let forward = MethodWrapper::new(model.clone(), "forward");
        let out = forward.call(&[Arg::from(40i64), Arg::from(2i64)]).unwrap();
        assert_eq!(out, Value::Int(42));

        let describe = MethodWrapper::new(model, "describe");
        assert_eq!(describe.call(&[]).unwrap(), Value::from("linear"));
    }

    #[test]
    fn test_unknown_method() {
        let manager = InterpreterManager::with_source(1, RuntimeSource::reference()).unwrap();
        let missing = MethodWrapper::new(replicated_model(&manager), "backward");
        assert!(matches!(
            missing.call(&[]).unwrap_err(),
            DeployError::Runtime(_)
        ));
    }
}
