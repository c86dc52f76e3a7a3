// src/deploy/mod.rs
//! Multi-interpreter pool
//!
//! - **load_balancer**: lock-free slot allocation across interpreters
//! - **interpreter**: one isolated runtime instance and its sources
//! - **session**: scoped, non-shareable access to one interpreter
//! - **replicated**: objects serialized once and copied lazily per interpreter
//! - **manager**: the pool itself
//! - **package**: archives of pickled records opened through the pool
//! - **method**: named methods of replicated models
//!
//! # Lifetimes
//!
//! ```text
//! InterpreterManager ──owns──▶ ManagerShared ──owns──▶ Arc<Interpreter> × n
//!                                  ▲   ▲
//!         InterpreterSession ──────┘   └─ weak ── ReplicatedObj
//!                │
//!                └──▶ Arc<Interpreter>   (kept alive while the session is)
//! ```

pub mod interpreter;
pub mod load_balancer;
pub mod manager;
pub mod method;
pub mod package;
pub mod replicated;
pub mod session;

pub use interpreter::{Interpreter, RuntimeFactory, RuntimeSource, ARGUMENT_NAMES_MODULE};
pub use load_balancer::{BalancerCursor, LoadBalancer};
pub use manager::InterpreterManager;
pub use method::MethodWrapper;
pub use package::{DirectoryArchive, MemoryArchive, Package};
pub use replicated::ReplicatedObj;
pub use session::{InterpreterSession, Obj};
