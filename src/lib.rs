//! moonlink - a sandboxed Lua 5.4 embedding bridge.
//!
//! A host program opens an [`Engine`], registers values, functions,
//! modules, and typed objects into it, and runs script code against them.
//! Scripts start with a minimal library subset (base, package, table,
//! string); everything else - math, os, io, coroutine, module loading from
//! disk - is an explicit opt-in.
//!
//! Host functions and scripts exchange arguments over a shared value
//! stack: a registered function receives the engine, pops its arguments
//! (last-pushed first), pushes its results, and returns how many it
//! pushed. Calls are synchronous and reentrant in both directions.
//!
//! ```
//! use moonlink::{Engine, HostValue};
//!
//! let engine = Engine::new()?;
//! engine.run_string("function double(n) return n * 2 end")?;
//!
//! let results = engine.call("double", 1, &[HostValue::from(21.0)])?;
//! assert_eq!(results[0].as_number(), 42.0);
//!
//! engine.register_function("add", |e| {
//!     let b = e.pop_int();
//!     let a = e.pop_int();
//!     e.push_value(a + b)?;
//!     Ok(1)
//! })?;
//! let results = engine.call("add", 1, &[10.into(), 11.into()])?;
//! assert_eq!(results[0].as_number(), 21.0);
//! # Ok::<(), moonlink::EngineError>(())
//! ```
//!
//! A session and every handle created from it are single-threaded; wrap
//! the engine in external synchronization if multiple threads must share
//! one. Handles outliving [`Engine::close`] go inert rather than dangling,
//! but retaining them past close is a caller bug.

mod engine;
mod error;
mod host;
mod object;
mod options;
mod require;
mod transform;
mod value;

pub use engine::Engine;
pub use error::{EngineError, Result};
pub use host::{HostValue, ScriptFunction, TableMap};
pub use object::TypeDef;
pub use options::{EngineOptions, NamingConvention};
pub use transform::{to_camel_case, to_snake_case};
pub use value::Value;
