// src/runtime/reference/eval.rs
//! Heap, module table and evaluator of the reference runtime
//!
//! Heap objects are reference counted. Owners are module globals, the
//! replicated-object table, session handle tables and bound methods; an
//! object is freed when its last owner releases it. Evaluation works on
//! borrowed [`Operand`]s and only takes ownership via [`State::store`].

use crate::runtime::abi::{ModuleFinder, PackageArchive, RuntimeError, RuntimeResult};
use crate::runtime::reference::parser::{parse_module, Expr, FunctionDef, Stmt};
use crate::runtime::value::{ObjectId, Value};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::trace;

pub type HeapId = u64;

/// Module holding the builtin functions
pub const BUILTINS_MODULE: &str = "builtins";

/// Deepest call nesting before `RecursionError`
const MAX_CALL_DEPTH: usize = 64;

/// Builtin functions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    /// `params(fn)`: parameter names of a function
    Params,
    /// `len(x)`
    Len,
    /// `list(x)`: shallow copy of a list
    List,
    /// `import_module(name)`: the module object
    ImportModule,
}

impl Builtin {
    const ALL: [Builtin; 4] = [
        Builtin::Params,
        Builtin::Len,
        Builtin::List,
        Builtin::ImportModule,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Builtin::Params => "params",
            Builtin::Len => "len",
            Builtin::List => "list",
            Builtin::ImportModule => "import_module",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|b| b.name() == name)
    }
}

/// Live heap object
pub enum Object {
    Data(Value),
    Function {
        def: Arc<FunctionDef>,
        module: String,
    },
    Builtin(Builtin),
    Module(String),
    BoundMethod {
        receiver: HeapId,
        method: String,
    },
    Importer(Arc<dyn PackageArchive>),
}

impl Object {
    fn type_name(&self) -> &'static str {
        match self {
            Object::Data(value) => value.type_name(),
            Object::Function { .. } => "function",
            Object::Builtin(_) => "builtin_function",
            Object::Module(_) => "module",
            Object::BoundMethod { .. } => "method",
            Object::Importer(_) => "PackageImporter",
        }
    }
}

struct Slot {
    object: Object,
    refs: usize,
}

/// Intermediate result of evaluation
#[derive(Debug, Clone)]
pub enum Operand {
    /// Plain data not (yet) on the heap
    Val(Value),
    /// Borrowed reference to a heap object
    Obj(HeapId),
    /// `receiver.method` not yet called
    Method(Box<Operand>, String),
}

/// Serialized form of an object
#[derive(Debug, Serialize, Deserialize)]
pub enum Pickled {
    Data(Value),
    Function { module: String, name: String },
    Builtin(String),
    Module(String),
    Method { receiver: Box<Pickled>, name: String },
}

/// All mutable state of one interpreter instance
pub struct State {
    heap: HashMap<HeapId, Slot>,
    next_id: HeapId,
    modules: HashMap<String, HashMap<String, HeapId>>,
    replicated: HashMap<ObjectId, HeapId>,
    finder: Option<ModuleFinder>,
    /// Objects allocated mid-operation that no owner has claimed yet
    temporaries: Vec<HeapId>,
    depth: usize,
}

fn type_error(message: impl Into<String>) -> RuntimeError {
    RuntimeError::new("TypeError", message)
}

impl State {
    pub fn new() -> Self {
        let mut state = Self {
            heap: HashMap::new(),
            next_id: 1,
            modules: HashMap::new(),
            replicated: HashMap::new(),
            finder: None,
            temporaries: Vec::new(),
            depth: 0,
        };

        let mut builtins = HashMap::new();
        for builtin in Builtin::ALL {
            let id = state.alloc(Object::Builtin(builtin));
            builtins.insert(builtin.name().to_string(), id);
        }
        state.modules.insert(BUILTINS_MODULE.to_string(), builtins);
        state
    }

    pub fn set_finder(&mut self, finder: ModuleFinder) {
        self.finder = Some(finder);
    }

    pub fn live_objects(&self) -> usize {
        self.heap.len()
    }

    pub fn replicated_count(&self) -> usize {
        self.replicated.len()
    }

    /// Allocate an object owned by the caller
    fn alloc(&mut self, object: Object) -> HeapId {
        let id = self.next_id;
        self.next_id += 1;
        self.heap.insert(id, Slot { object, refs: 1 });
        id
    }

    pub fn retain(&mut self, id: HeapId) {
        if let Some(slot) = self.heap.get_mut(&id) {
            slot.refs += 1;
        }
    }

    pub fn release(&mut self, id: HeapId) {
        let freed = match self.heap.get_mut(&id) {
            Some(slot) if slot.refs > 1 => {
                slot.refs -= 1;
                None
            }
            Some(_) => self.heap.remove(&id),
            None => None,
        };

        if let Some(Slot {
            object: Object::BoundMethod { receiver, .. },
            ..
        }) = freed
        {
            self.release(receiver);
        }
    }

    fn object(&self, id: HeapId) -> RuntimeResult<&Object> {
        self.heap
            .get(&id)
            .map(|slot| &slot.object)
            .ok_or_else(|| RuntimeError::new("ReferenceError", format!("object {} was freed", id)))
    }

    /// Take an owned reference to an operand, allocating if needed
    pub fn store(&mut self, operand: Operand) -> HeapId {
        match operand {
            Operand::Val(value) => self.alloc(Object::Data(value)),
            Operand::Obj(id) => {
                self.retain(id);
                id
            }
            Operand::Method(receiver, method) => {
                let receiver = self.store(*receiver);
                self.alloc(Object::BoundMethod { receiver, method })
            }
        }
    }

    pub fn alloc_importer(&mut self, archive: Arc<dyn PackageArchive>) -> HeapId {
        self.alloc(Object::Importer(archive))
    }

    /// Copy an operand out as plain data
    pub fn to_value(&self, operand: &Operand) -> RuntimeResult<Value> {
        match operand {
            Operand::Val(value) => Ok(value.clone()),
            Operand::Obj(id) => match self.object(*id)? {
                Object::Data(value) => Ok(value.clone()),
                other => Err(type_error(format!(
                    "cannot convert {} to a value",
                    other.type_name()
                ))),
            },
            Operand::Method(_, _) => Err(type_error("cannot convert method to a value")),
        }
    }

    // -- modules ----------------------------------------------------------

    /// Make sure `module` is loaded
    pub fn import(&mut self, module: &str) -> RuntimeResult<()> {
        if self.modules.contains_key(module) {
            return Ok(());
        }

        let source = self
            .finder
            .as_ref()
            .and_then(|finder| finder(module))
            .ok_or_else(|| {
                RuntimeError::new("ModuleNotFoundError", format!("No module named '{}'", module))
            })?;

        trace!("Importing module {}", module);
        let stmts = parse_module(&source)?;

        self.modules.insert(module.to_string(), HashMap::new());
        if let Err(err) = self.exec_module(module, &stmts) {
            self.drop_module(module);
            return Err(err);
        }
        Ok(())
    }

    fn exec_module(&mut self, module: &str, stmts: &[Stmt]) -> RuntimeResult<()> {
        for stmt in stmts {
            let (name, id) = match stmt {
                Stmt::Def(def) => {
                    let id = self.alloc(Object::Function {
                        def: Arc::clone(def),
                        module: module.to_string(),
                    });
                    (def.name.clone(), id)
                }
                Stmt::Assign { name, value } => {
                    let operand = self.eval(module, &HashMap::new(), value)?;
                    (name.clone(), self.store(operand))
                }
            };
            self.bind(module, &name, id);
        }
        Ok(())
    }

    fn drop_module(&mut self, module: &str) {
        if let Some(globals) = self.modules.remove(module) {
            for id in globals.into_values() {
                self.release(id);
            }
        }
    }

    /// Bind an owned reference as a module global
    pub fn bind(&mut self, module: &str, name: &str, id: HeapId) {
        let globals = self.modules.entry(module.to_string()).or_default();
        if let Some(old) = globals.insert(name.to_string(), id) {
            self.release(old);
        }
    }

    /// Borrowed reference to a module global
    pub fn global(&mut self, module: &str, name: &str) -> RuntimeResult<HeapId> {
        self.import(module)?;
        self.modules
            .get(module)
            .and_then(|globals| globals.get(name))
            .copied()
            .ok_or_else(|| {
                RuntimeError::new(
                    "AttributeError",
                    format!("module '{}' has no attribute '{}'", module, name),
                )
            })
    }

    fn module_object(&mut self, module: &str) -> RuntimeResult<HeapId> {
        self.import(module)?;
        Ok(self.alloc(Object::Module(module.to_string())))
    }

    // -- evaluation -------------------------------------------------------

    fn lookup(
        &mut self,
        module: &str,
        env: &HashMap<String, Operand>,
        name: &str,
    ) -> RuntimeResult<Operand> {
        if let Some(operand) = env.get(name) {
            return Ok(operand.clone());
        }
        for scope in [module, BUILTINS_MODULE] {
            if let Some(id) = self.modules.get(scope).and_then(|g| g.get(name)) {
                return Ok(Operand::Obj(*id));
            }
        }
        Err(RuntimeError::new(
            "NameError",
            format!("name '{}' is not defined", name),
        ))
    }

    fn eval(
        &mut self,
        module: &str,
        env: &HashMap<String, Operand>,
        expr: &Expr,
    ) -> RuntimeResult<Operand> {
        match expr {
            Expr::Literal(value) => Ok(Operand::Val(value.clone())),
            Expr::Name(name) => self.lookup(module, env, name),
            Expr::List(items) => {
                let mut values = Vec::with_capacity(items.len());
                for item in items {
                    let operand = self.eval(module, env, item)?;
                    values.push(self.to_value(&operand)?);
                }
                Ok(Operand::Val(Value::List(values)))
            }
            Expr::Add(lhs, rhs) => {
                let lhs = self.eval(module, env, lhs)?;
                let rhs = self.eval(module, env, rhs)?;
                add(self.to_value(&lhs)?, self.to_value(&rhs)?).map(Operand::Val)
            }
            Expr::Attr { target, name } => {
                let target = self.eval(module, env, target)?;
                self.attr(target, name)
            }
            Expr::Call { callee, args } => {
                let callee = self.eval(module, env, callee)?;
                let mut evaluated = Vec::with_capacity(args.len());
                for arg in args {
                    evaluated.push(self.eval(module, env, arg)?);
                }
                self.call(callee, evaluated)
            }
        }
    }

    /// Attribute access; module attributes are globals, others are methods
    pub fn attr(&mut self, target: Operand, name: &str) -> RuntimeResult<Operand> {
        if let Operand::Obj(id) = &target {
            let object = self.object(*id)?;
            match object {
                Object::Module(module) => {
                    let module = module.clone();
                    return self.global(&module, name).map(Operand::Obj);
                }
                Object::Data(_) | Object::Importer(_) => {}
                other => {
                    return Err(RuntimeError::new(
                        "AttributeError",
                        format!("'{}' object has no attribute '{}'", other.type_name(), name),
                    ))
                }
            }
        }
        Ok(Operand::Method(Box::new(target), name.to_string()))
    }

    pub fn call(&mut self, callee: Operand, args: Vec<Operand>) -> RuntimeResult<Operand> {
        if self.depth >= MAX_CALL_DEPTH {
            return Err(RuntimeError::new(
                "RecursionError",
                "maximum call depth exceeded",
            ));
        }
        self.depth += 1;
        let result = self.dispatch(callee, args);
        self.depth -= 1;
        result
    }

    fn dispatch(&mut self, callee: Operand, args: Vec<Operand>) -> RuntimeResult<Operand> {
        let id = match callee {
            Operand::Obj(id) => id,
            Operand::Method(receiver, method) => return self.call_method(*receiver, &method, args),
            Operand::Val(value) => {
                return Err(type_error(format!(
                    "'{}' object is not callable",
                    value.type_name()
                )))
            }
        };

        let object = self.object(id)?;
        match object {
            Object::Function { def, module } => {
                let (def, module) = (Arc::clone(def), module.clone());
                if def.params.len() != args.len() {
                    return Err(type_error(format!(
                        "{}() takes {} arguments but {} were given",
                        def.name,
                        def.params.len(),
                        args.len()
                    )));
                }
                let env: HashMap<String, Operand> =
                    def.params.iter().cloned().zip(args).collect();
                self.eval(&module, &env, &def.body)
            }
            Object::Builtin(builtin) => {
                let builtin = *builtin;
                self.call_builtin(builtin, args)
            }
            Object::BoundMethod { receiver, method } => {
                let (receiver, method) = (*receiver, method.clone());
                self.call_method(Operand::Obj(receiver), &method, args)
            }
            other => Err(type_error(format!(
                "'{}' object is not callable",
                other.type_name()
            ))),
        }
    }

    fn call_builtin(&mut self, builtin: Builtin, args: Vec<Operand>) -> RuntimeResult<Operand> {
        let [arg]: [Operand; 1] = args.try_into().map_err(|_| {
            type_error(format!("{}() takes exactly one argument", builtin.name()))
        })?;

        match builtin {
            Builtin::Params => match &arg {
                Operand::Obj(id) => match self.object(*id)? {
                    Object::Function { def, .. } => Ok(Operand::Val(Value::List(
                        def.params.iter().cloned().map(Value::Str).collect(),
                    ))),
                    other => Err(type_error(format!(
                        "params() expects a function, got {}",
                        other.type_name()
                    ))),
                },
                _ => Err(type_error("params() expects a function")),
            },
            Builtin::Len => match self.to_value(&arg)? {
                Value::Str(s) => Ok(Operand::Val(Value::Int(s.chars().count() as i64))),
                Value::List(items) => Ok(Operand::Val(Value::Int(items.len() as i64))),
                Value::Dict(entries) => Ok(Operand::Val(Value::Int(entries.len() as i64))),
                other => Err(type_error(format!(
                    "object of type '{}' has no len()",
                    other.type_name()
                ))),
            },
            Builtin::List => match self.to_value(&arg)? {
                Value::List(items) => Ok(Operand::Val(Value::List(items))),
                Value::Dict(entries) => Ok(Operand::Val(Value::List(
                    entries.into_keys().map(Value::Str).collect(),
                ))),
                other => Err(type_error(format!(
                    "'{}' object is not iterable",
                    other.type_name()
                ))),
            },
            Builtin::ImportModule => match self.to_value(&arg)? {
                Value::Str(name) => {
                    let id = self.module_object(&name)?;
                    Ok(Operand::Obj(self.adopt_temporary(id)))
                }
                other => Err(type_error(format!(
                    "import_module() expects a str, got {}",
                    other.type_name()
                ))),
            },
        }
    }

    /// Park a freshly allocated object until the current operation ends
    fn adopt_temporary(&mut self, id: HeapId) -> HeapId {
        self.temporaries.push(id);
        id
    }

    /// Release objects allocated during an operation that nobody stored
    pub fn clear_temporaries(&mut self) {
        for id in std::mem::take(&mut self.temporaries) {
            self.release(id);
        }
    }

    fn call_method(
        &mut self,
        receiver: Operand,
        method: &str,
        args: Vec<Operand>,
    ) -> RuntimeResult<Operand> {
        let mut values = Vec::with_capacity(args.len());
        for arg in &args {
            values.push(self.to_value(arg)?);
        }

        let id = match receiver {
            Operand::Obj(id) => id,
            other => {
                // Methods on temporaries act on a copy
                let mut value = self.to_value(&other)?;
                return data_method(&mut value, method, values).map(Operand::Val);
            }
        };

        let slot = self
            .heap
            .get_mut(&id)
            .ok_or_else(|| RuntimeError::new("ReferenceError", format!("object {} was freed", id)))?;

        match &mut slot.object {
            Object::Data(value) => data_method(value, method, values).map(Operand::Val),
            Object::Importer(archive) if method == "load_pickle" => {
                let archive = Arc::clone(archive);
                let [package, resource]: [Value; 2] = values
                    .try_into()
                    .map_err(|_| type_error("load_pickle() takes (package, resource)"))?;
                let (Value::Str(package), Value::Str(resource)) = (package, resource) else {
                    return Err(type_error("load_pickle() arguments must be str"));
                };
                let record = format!("{}/{}", package.replace('.', "/"), resource);
                let bytes = archive
                    .read_record(&record)
                    .map_err(|e| RuntimeError::new("OSError", e.to_string()))?
                    .ok_or_else(|| {
                        RuntimeError::new(
                            "FileNotFoundError",
                            format!("{} has no record '{}'", archive.describe(), record),
                        )
                    })?;
                let id = self.unpickle(&bytes)?;
                Ok(Operand::Obj(self.adopt_temporary(id)))
            }
            other => Err(RuntimeError::new(
                "AttributeError",
                format!("'{}' object has no method '{}'", other.type_name(), method),
            )),
        }
    }

    // -- pickling ---------------------------------------------------------

    pub fn pickle(&self, id: HeapId) -> RuntimeResult<Vec<u8>> {
        let pickled = self.pickled_form(id)?;
        serde_json::to_vec(&pickled).map_err(|e| RuntimeError::new("PicklingError", e.to_string()))
    }

    fn pickled_form(&self, id: HeapId) -> RuntimeResult<Pickled> {
        Ok(match self.object(id)? {
            Object::Data(value) => Pickled::Data(value.clone()),
            Object::Function { def, module } => Pickled::Function {
                module: module.clone(),
                name: def.name.clone(),
            },
            Object::Builtin(builtin) => Pickled::Builtin(builtin.name().to_string()),
            Object::Module(module) => Pickled::Module(module.clone()),
            Object::BoundMethod { receiver, method } => Pickled::Method {
                receiver: Box::new(self.pickled_form(*receiver)?),
                name: method.clone(),
            },
            Object::Importer(_) => {
                return Err(RuntimeError::new(
                    "PicklingError",
                    "cannot pickle a package importer",
                ))
            }
        })
    }

    /// Deserialize into a new object owned by the caller
    pub fn unpickle(&mut self, data: &[u8]) -> RuntimeResult<HeapId> {
        let pickled: Pickled = serde_json::from_slice(data)
            .map_err(|e| RuntimeError::new("UnpicklingError", e.to_string()))?;
        self.materialize(pickled)
    }

    fn materialize(&mut self, pickled: Pickled) -> RuntimeResult<HeapId> {
        Ok(match pickled {
            Pickled::Data(value) => self.alloc(Object::Data(value)),
            Pickled::Function { module, name } => {
                let id = self.global(&module, &name)?;
                self.store(Operand::Obj(id))
            }
            Pickled::Builtin(name) => {
                let builtin = Builtin::from_name(&name).ok_or_else(|| {
                    RuntimeError::new("UnpicklingError", format!("unknown builtin '{}'", name))
                })?;
                let id = self.global(BUILTINS_MODULE, builtin.name())?;
                self.store(Operand::Obj(id))
            }
            Pickled::Module(module) => self.module_object(&module)?,
            Pickled::Method { receiver, name } => {
                let receiver = self.materialize(*receiver)?;
                self.alloc(Object::BoundMethod {
                    receiver,
                    method: name,
                })
            }
        })
    }

    // -- replicated objects -----------------------------------------------

    /// Borrowed reference to the copy of `id`, deserializing on first use
    pub fn unpickle_or_get(&mut self, id: ObjectId, data: &[u8]) -> RuntimeResult<HeapId> {
        if let Some(heap_id) = self.replicated.get(&id) {
            return Ok(*heap_id);
        }
        let heap_id = self.unpickle(data)?;
        trace!("Materialized {} as heap object {}", id, heap_id);
        self.replicated.insert(id, heap_id);
        Ok(heap_id)
    }

    pub fn unload(&mut self, id: ObjectId) {
        if let Some(heap_id) = self.replicated.remove(&id) {
            trace!("Unloaded {}", id);
            self.release(heap_id);
        }
    }
}

fn add(lhs: Value, rhs: Value) -> RuntimeResult<Value> {
    Ok(match (lhs, rhs) {
        (Value::Int(a), Value::Int(b)) => Value::Int(a.wrapping_add(b)),
        (Value::Int(a), Value::Float(b)) => Value::Float(a as f64 + b),
        (Value::Float(a), Value::Int(b)) => Value::Float(a + b as f64),
        (Value::Float(a), Value::Float(b)) => Value::Float(a + b),
        (Value::Str(a), Value::Str(b)) => Value::Str(a + &b),
        (Value::List(mut a), Value::List(b)) => {
            a.extend(b);
            Value::List(a)
        }
        (a, b) => {
            return Err(type_error(format!(
                "unsupported operand types for +: '{}' and '{}'",
                a.type_name(),
                b.type_name()
            )))
        }
    })
}

/// Methods on list and dict data
fn data_method(value: &mut Value, method: &str, args: Vec<Value>) -> RuntimeResult<Value> {
    match (value, method) {
        (Value::List(items), "append") => {
            let [item]: [Value; 1] = args
                .try_into()
                .map_err(|_| type_error("append() takes exactly one argument"))?;
            items.push(item);
            Ok(Value::None)
        }
        (Value::List(items), "get") => match args.as_slice() {
            [Value::Int(index)] => {
                let len = items.len() as i64;
                let index = if *index < 0 { len + index } else { *index };
                usize::try_from(index)
                    .ok()
                    .and_then(|i| items.get(i))
                    .cloned()
                    .ok_or_else(|| RuntimeError::new("IndexError", "list index out of range"))
            }
            _ => Err(type_error("get() takes one int index")),
        },
        (Value::Dict(entries), "set") => match <[Value; 2]>::try_from(args) {
            Ok([Value::Str(key), item]) => {
                entries.insert(key, item);
                Ok(Value::None)
            }
            _ => Err(type_error("set() takes (str, value)")),
        },
        (Value::Dict(entries), "get") => match args.as_slice() {
            [Value::Str(key)] => entries
                .get(key)
                .cloned()
                .ok_or_else(|| RuntimeError::new("KeyError", key.clone())),
            _ => Err(type_error("get() takes one str key")),
        },
        (value, method) => Err(RuntimeError::new(
            "AttributeError",
            format!("'{}' object has no attribute '{}'", value.type_name(), method),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_with(modules: &[(&str, &str)]) -> State {
        let sources: HashMap<String, String> = modules
            .iter()
            .map(|(name, src)| (name.to_string(), src.to_string()))
            .collect();
        let mut state = State::new();
        state.set_finder(Arc::new(move |name: &str| sources.get(name).cloned()));
        state
    }

    fn call_global(state: &mut State, module: &str, name: &str, args: Vec<Operand>) -> Value {
        let f = state.global(module, name).unwrap();
        let result = state.call(Operand::Obj(f), args).unwrap();
        let value = state.to_value(&result).unwrap();
        state.clear_temporaries();
        value
    }

    #[test]
    fn test_import_and_call() {
        let mut state = state_with(&[("foo", "def f(): return 1")]);
        assert_eq!(call_global(&mut state, "foo", "f", vec![]), Value::Int(1));
    }

    #[test]
    fn test_functions_see_module_globals_and_params() {
        let mut state = state_with(&[(
            "m",
            "base = 40\ndef add(a, b): return a + b\ndef answer(): return add(base, 2)",
        )]);
        assert_eq!(call_global(&mut state, "m", "answer", vec![]), Value::Int(42));
        assert_eq!(
            call_global(
                &mut state,
                "m",
                "add",
                vec![Operand::Val("a".into()), Operand::Val("b".into())]
            ),
            Value::Str("ab".into())
        );
    }

    #[test]
    fn test_missing_module_and_name() {
        let mut state = state_with(&[("m", "x = 1")]);
        assert_eq!(state.global("nope", "x").unwrap_err().kind, "ModuleNotFoundError");
        assert_eq!(state.global("m", "y").unwrap_err().kind, "AttributeError");
    }

    #[test]
    fn test_failed_import_leaves_no_module() {
        let mut state = state_with(&[("bad", "x = 1\ny = missing")]);
        assert_eq!(state.global("bad", "x").unwrap_err().kind, "NameError");
        assert!(!state.modules.contains_key("bad"));
    }

    #[test]
    fn test_params_builtin() {
        let mut state = state_with(&[("m", "def g(alpha, beta): return alpha")]);
        let g = state.global("m", "g").unwrap();
        let params = state.global(BUILTINS_MODULE, "params").unwrap();
        let result = state.call(Operand::Obj(params), vec![Operand::Obj(g)]).unwrap();
        assert_eq!(
            state.to_value(&result).unwrap(),
            Value::from(vec!["alpha", "beta"])
        );
    }

    #[test]
    fn test_list_methods_mutate_heap_object() {
        let mut state = State::new();
        let list = state.store(Operand::Val(Value::from(vec![1i64])));
        let append = state.attr(Operand::Obj(list), "append").unwrap();
        state.call(append, vec![Operand::Val(Value::Int(2))]).unwrap();
        assert_eq!(
            state.to_value(&Operand::Obj(list)).unwrap(),
            Value::from(vec![1i64, 2])
        );
    }

    #[test]
    fn test_recursion_limit() {
        let mut state = state_with(&[("m", "def f(): return f()")]);
        let f = state.global("m", "f").unwrap();
        let err = state.call(Operand::Obj(f), vec![]).unwrap_err();
        assert_eq!(err.kind, "RecursionError");
        assert_eq!(state.depth, 0);
    }

    #[test]
    fn test_pickle_function_by_reference() {
        let mut a = state_with(&[("m", "def f(): return 7")]);
        let mut b = state_with(&[("m", "def f(): return 7")]);

        let f = a.global("m", "f").unwrap();
        let bytes = a.pickle(f).unwrap();

        let copy = b.unpickle(&bytes).unwrap();
        let result = b.call(Operand::Obj(copy), vec![]).unwrap();
        assert_eq!(b.to_value(&result).unwrap(), Value::Int(7));
    }

    #[test]
    fn test_unpickle_or_get_memoizes_and_unload_frees() {
        let mut state = State::new();
        let baseline = state.live_objects();
        let data = serde_json::to_vec(&Pickled::Data(Value::Int(5))).unwrap();

        let first = state.unpickle_or_get(ObjectId(1), &data).unwrap();
        let second = state.unpickle_or_get(ObjectId(1), &data).unwrap();
        assert_eq!(first, second);
        assert_eq!(state.replicated_count(), 1);

        state.unload(ObjectId(1));
        state.unload(ObjectId(1));
        assert_eq!(state.replicated_count(), 0);
        assert_eq!(state.live_objects(), baseline);
    }

    #[test]
    fn test_release_frees_bound_method_receiver() {
        let mut state = State::new();
        let baseline = state.live_objects();
        let method = state.store(Operand::Method(
            Box::new(Operand::Val(Value::List(vec![]))),
            "append".into(),
        ));
        assert_eq!(state.live_objects(), baseline + 2);
        state.release(method);
        assert_eq!(state.live_objects(), baseline);
    }
}
