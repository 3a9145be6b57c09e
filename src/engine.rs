//! The runtime session.
//!
//! # Architecture Notes
//!
//! An [`Engine`] owns exactly one `mlua::Lua` state for its lifetime. The
//! state lives behind `RefCell<Option<..>>` so [`Engine::close`] can drop it
//! deterministically; every operation re-checks the closed flag first.
//!
//! Host functions called from scripts use a stack protocol rather than
//! direct parameter binding: the engine keeps a shadow stack of Lua values,
//! arguments are pushed left to right before the host function runs, and
//! the function pops them back off (top = last argument), pushes its
//! results, and returns the count it pushed. Each such call opens a frame;
//! a drop guard truncates the stack back to the frame base on exit, so
//! reentrant host -> script -> host nesting cannot leak entries.

use std::any::{Any, TypeId};
use std::cell::{Cell, Ref, RefCell};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::rc::{Rc, Weak};

use log::debug;
use mlua::{
    Function, Lua, LuaOptions, MultiValue, StdLib, Table, Value as LuaValue,
};

use crate::error::{EngineError, Result};
use crate::host::{HostValue, ScriptFunction, TableMap};
use crate::object::TypeInfo;
use crate::options::EngineOptions;
use crate::value::Value;

/// Lua-owned session state, dropped as a unit on close.
pub(crate) struct LuaCore {
    /// Session-private registry table (mlua does not expose the C registry).
    pub(crate) registry: Table,
    /// `a == b` through the runtime, metamethod-aware.
    pub(crate) eq: Function,
    /// `t[k]` through the runtime, metamethod-aware; works on userdata too.
    pub(crate) index: Function,
    pub(crate) lua: Lua,
}

pub(crate) struct EngineInner {
    pub(crate) core: RefCell<Option<LuaCore>>,
    pub(crate) closed: Cell<bool>,
    pub(crate) options: EngineOptions,
    /// Shadow value stack shared by all in-flight host-function calls.
    stack: RefCell<Vec<LuaValue>>,
    /// Frame bases, one per active host-function call.
    frames: RefCell<Vec<usize>>,
    /// Side-channel metadata, unrelated to script state.
    meta: RefCell<HashMap<String, Box<dyn Any>>>,
    /// Generated prototype tables, one per registered host type.
    pub(crate) types: RefCell<HashMap<TypeId, Rc<TypeInfo>>>,
}

impl EngineInner {
    fn frame_base(&self) -> usize {
        self.frames.borrow().last().copied().unwrap_or(0)
    }
}

/// Restores the shadow stack to its frame base when a host-function call
/// unwinds, normally or on error.
struct FrameGuard {
    inner: Rc<EngineInner>,
    base: usize,
}

impl FrameGuard {
    fn enter(engine: &Engine) -> Self {
        let base = engine.inner.stack.borrow().len();
        engine.inner.frames.borrow_mut().push(base);
        Self {
            inner: Rc::clone(&engine.inner),
            base,
        }
    }

    /// Take the top `pushed` values (in push order) as the call's results.
    /// Never reaches below the frame base.
    fn results(&self, pushed: i32) -> Vec<LuaValue> {
        let mut stack = self.inner.stack.borrow_mut();
        let n = pushed.max(0) as usize;
        let at = stack.len().saturating_sub(n).max(self.base);
        stack.split_off(at)
    }
}

impl Drop for FrameGuard {
    fn drop(&mut self) {
        self.inner.stack.borrow_mut().truncate(self.base);
        self.inner.frames.borrow_mut().pop();
    }
}

/// A sandboxed Lua session.
///
/// Cheap to clone handles into callbacks are held internally via `Rc`; the
/// engine itself is single-threaded and not `Send`.
pub struct Engine {
    pub(crate) inner: Rc<EngineInner>,
}

impl Engine {
    /// Open a session with the default options: minimal library subset
    /// (base, package, table, string), snake_case member names.
    pub fn new() -> Result<Self> {
        Self::open(EngineOptions::default())
    }

    /// Open a session with explicit options.
    pub fn open(options: EngineOptions) -> Result<Self> {
        let libs = if options.open_libs {
            StdLib::ALL_SAFE
        } else {
            StdLib::PACKAGE | StdLib::TABLE | StdLib::STRING
        };
        let lua = Lua::new_with(libs, LuaOptions::default()).map_err(EngineError::from_lua)?;

        let registry = lua.create_table().map_err(EngineError::from_lua)?;
        let eq = lua
            .load("local a, b = ...\nreturn a == b")
            .set_name("=eq")
            .into_function()
            .map_err(EngineError::from_lua)?;
        let index = lua
            .load("local t, k = ...\nreturn t[k]")
            .set_name("=index")
            .into_function()
            .map_err(EngineError::from_lua)?;

        let inner = Rc::new(EngineInner {
            core: RefCell::new(Some(LuaCore {
                registry,
                eq,
                index,
                lua,
            })),
            closed: Cell::new(false),
            options,
            stack: RefCell::new(Vec::new()),
            frames: RefCell::new(Vec::new()),
            meta: RefCell::new(HashMap::new()),
            types: RefCell::new(HashMap::new()),
        });

        // Callbacks reach the session back through app data; weak, so a
        // registered function never keeps a dropped engine alive.
        if let Some(core) = inner.core.borrow().as_ref() {
            core.lua.set_app_data(Rc::downgrade(&inner));
        }

        debug!("engine opened (full stdlib: {})", inner.options.open_libs);
        Ok(Self { inner })
    }

    /// Recover the session owning a Lua state, from inside a callback.
    pub(crate) fn current(lua: &Lua) -> mlua::Result<Self> {
        let weak = lua
            .app_data_ref::<Weak<EngineInner>>()
            .ok_or_else(|| mlua::Error::RuntimeError("no engine attached to this state".into()))?;
        let inner = weak
            .upgrade()
            .ok_or_else(|| mlua::Error::RuntimeError("engine has been dropped".into()))?;
        Ok(Self { inner })
    }

    pub(crate) fn from_inner(inner: Rc<EngineInner>) -> Self {
        Self { inner }
    }

    /// Release the Lua state. Not idempotent: a second close is an error,
    /// as is any other operation afterwards. Handles created from this
    /// session become inert.
    pub fn close(&self) -> Result<()> {
        if self.inner.closed.get() {
            return Err(EngineError::Closed);
        }
        let mut core = self.inner.core.try_borrow_mut().map_err(|_| EngineError::Runtime {
            message: "cannot close the engine while a call is in flight".into(),
            traceback: None,
        })?;
        self.inner.closed.set(true);
        *core = None;
        drop(core);
        self.inner.stack.borrow_mut().clear();
        self.inner.frames.borrow_mut().clear();
        self.inner.types.borrow_mut().clear();
        self.inner.meta.borrow_mut().clear();
        debug!("engine closed");
        Ok(())
    }

    pub fn options(&self) -> &EngineOptions {
        &self.inner.options
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.inner.closed.get() {
            Err(EngineError::Closed)
        } else {
            Ok(())
        }
    }

    pub(crate) fn lua_core(&self) -> Result<Ref<'_, LuaCore>> {
        self.ensure_open()?;
        let borrow = self.inner.core.borrow();
        Ref::filter_map(borrow, |core| core.as_ref()).map_err(|_| EngineError::Closed)
    }

    // ========================================================================
    // Library toggles
    // ========================================================================

    /// Load the full safe standard library into an already-open session.
    pub fn open_libs(&self) -> Result<()> {
        self.open_lib(StdLib::ALL_SAFE)
    }

    pub fn open_math(&self) -> Result<()> {
        self.open_lib(StdLib::MATH)
    }

    pub fn open_os(&self) -> Result<()> {
        self.open_lib(StdLib::OS)
    }

    pub fn open_io(&self) -> Result<()> {
        self.open_lib(StdLib::IO)
    }

    pub fn open_coroutine(&self) -> Result<()> {
        self.open_lib(StdLib::COROUTINE)
    }

    /// The debug library is gated behind unsafe state construction by mlua;
    /// under the default safe construction this surfaces mlua's safety
    /// error rather than loading the library.
    pub fn open_debug(&self) -> Result<()> {
        self.open_lib(StdLib::DEBUG)
    }

    fn open_lib(&self, lib: StdLib) -> Result<()> {
        self.lua_core()?
            .lua
            .load_std_libs(lib)
            .map_err(EngineError::from_lua)
    }

    // ========================================================================
    // Running and loading chunks
    // ========================================================================

    /// Compile and immediately execute `source`.
    pub fn run_string(&self, source: &str) -> Result<()> {
        let core = self.lua_core()?;
        core.lua.load(source).exec().map_err(EngineError::from_lua)
    }

    /// Compile and immediately execute the file at `path`.
    pub fn run_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let source = fs::read_to_string(path)
            .map_err(|e| EngineError::Io(format!("{}: {}", path.display(), e)))?;
        let core = self.lua_core()?;
        core.lua
            .load(&source)
            .set_name(format!("@{}", path.display()))
            .exec()
            .map_err(EngineError::from_lua)
    }

    /// Compile `source` without executing; the returned handle is callable.
    pub fn load_string(&self, source: &str) -> Result<Value> {
        let func = {
            let core = self.lua_core()?;
            core.lua
                .load(source)
                .into_function()
                .map_err(EngineError::from_lua)?
        };
        Ok(self.make_value(LuaValue::Function(func)))
    }

    /// Compile the file at `path` without executing.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<Value> {
        let path = path.as_ref();
        let source = fs::read_to_string(path)
            .map_err(|e| EngineError::Io(format!("{}: {}", path.display(), e)))?;
        let func = {
            let core = self.lua_core()?;
            core.lua
                .load(&source)
                .set_name(format!("@{}", path.display()))
                .into_function()
                .map_err(EngineError::from_lua)?
        };
        Ok(self.make_value(LuaValue::Function(func)))
    }

    // ========================================================================
    // Globals and calling
    // ========================================================================

    pub fn set_global(&self, name: &str, value: impl Into<HostValue>) -> Result<()> {
        let lval = self.lua_value_for(&value.into())?;
        self.lua_core()?
            .lua
            .globals()
            .set(name, lval)
            .map_err(EngineError::from_lua)
    }

    pub fn get_global(&self, name: &str) -> Result<Value> {
        let lval = self
            .lua_core()?
            .lua
            .globals()
            .get::<LuaValue>(name)
            .map_err(EngineError::from_lua)?;
        Ok(self.make_value(lval))
    }

    /// Call the global `name` under protection.
    ///
    /// Arguments are converted left to right; exactly `ret_count` handles
    /// come back, in the order the callee produced them (padded with nil or
    /// truncated as needed). A script-level error is caught and returned as
    /// [`EngineError::Call`].
    pub fn call(&self, name: &str, ret_count: usize, args: &[HostValue]) -> Result<Vec<Value>> {
        let target = {
            self.lua_core()?
                .lua
                .globals()
                .get::<LuaValue>(name)
                .map_err(EngineError::from_lua)?
        };
        let func = match target {
            LuaValue::Function(f) => f,
            _ => {
                return Err(EngineError::NotCallable {
                    name: name.to_string(),
                })
            }
        };

        let mut lua_args = Vec::with_capacity(args.len());
        for arg in args {
            lua_args.push(self.lua_value_for(arg)?);
        }

        let results = {
            // Holding the core borrow keeps close() from firing mid-call.
            let _core = self.lua_core()?;
            func.call::<MultiValue>(MultiValue::from_iter(lua_args))
                .map_err(|e| EngineError::Call(Box::new(EngineError::from_lua(e))))?
        };
        Ok(self.collect_results(results, ret_count))
    }

    pub(crate) fn collect_results(&self, results: MultiValue, ret_count: usize) -> Vec<Value> {
        let mut out: Vec<Value> = results
            .into_iter()
            .take(ret_count)
            .map(|v| self.make_value(v))
            .collect();
        while out.len() < ret_count {
            out.push(self.nil_value());
        }
        out
    }

    // ========================================================================
    // Registering host functions and modules
    // ========================================================================

    /// Bind a stack-protocol host function under `name` in global scope.
    pub fn register_function<F>(&self, name: &str, func: F) -> Result<()>
    where
        F: Fn(&Engine) -> Result<i32> + 'static,
    {
        let wrapped = self.wrap_script_function(Rc::new(func))?;
        self.lua_core()?
            .lua
            .globals()
            .set(name, wrapped)
            .map_err(EngineError::from_lua)?;
        debug!("registered host function '{name}'");
        Ok(())
    }

    /// Build a table from `fields` and preload it so `require(name)`
    /// resolves it without a filesystem lookup. Returns the module table.
    pub fn register_module(&self, name: &str, fields: TableMap) -> Result<Value> {
        let table = {
            let core = self.lua_core()?;
            core.lua.create_table().map_err(EngineError::from_lua)?
        };
        for (key, value) in &fields {
            let lval = self.lua_value_for(value)?;
            table
                .raw_set(key.as_str(), lval)
                .map_err(EngineError::from_lua)?;
        }

        let loader = {
            let core = self.lua_core()?;
            let module = table.clone();
            core.lua
                .create_function(move |_, _: MultiValue| Ok(module.clone()))
                .map_err(EngineError::from_lua)?
        };
        self.preload_table()?
            .set(name, loader)
            .map_err(EngineError::from_lua)?;
        debug!("registered module '{name}'");
        Ok(self.make_value(LuaValue::Table(table)))
    }

    pub(crate) fn preload_table(&self) -> Result<Table> {
        let core = self.lua_core()?;
        let package: Table = core.lua.globals().get("package").map_err(|_| EngineError::Runtime {
            message: "package library is not loaded".into(),
            traceback: None,
        })?;
        package.get("preload").map_err(EngineError::from_lua)
    }

    /// Wrap a [`ScriptFunction`] into the Lua calling convention: incoming
    /// arguments land on the shadow stack, the count returned selects the
    /// topmost values as results, and the frame guard clears the rest.
    pub(crate) fn wrap_script_function(&self, func: ScriptFunction) -> Result<Function> {
        let core = self.lua_core()?;
        core.lua
            .create_function(move |lua, args: MultiValue| {
                let engine = Engine::current(lua)?;
                if engine.inner.closed.get() {
                    return Err(EngineError::Closed.into_lua());
                }
                let guard = FrameGuard::enter(&engine);
                {
                    let mut stack = engine.inner.stack.borrow_mut();
                    for value in args {
                        stack.push(value);
                    }
                }
                let pushed = func(&engine).map_err(EngineError::into_lua)?;
                let results = guard.results(pushed);
                Ok(MultiValue::from_iter(results))
            })
            .map_err(EngineError::from_lua)
    }

    // ========================================================================
    // The shared value stack
    // ========================================================================

    /// Number of values in the current call frame.
    pub fn stack_size(&self) -> usize {
        self.inner.stack.borrow().len() - self.inner.frame_base()
    }

    /// Push a value; host functions use this to return results.
    pub fn push_value(&self, value: impl Into<HostValue>) -> Result<()> {
        self.ensure_open()?;
        let lval = self.lua_value_for(&value.into())?;
        self.inner.stack.borrow_mut().push(lval);
        Ok(())
    }

    /// Pop the top of the current frame; nil once the frame is empty.
    /// Arguments come back last-pushed first.
    pub fn pop_value(&self) -> Value {
        let base = self.inner.frame_base();
        let mut stack = self.inner.stack.borrow_mut();
        let lval = if stack.len() > base {
            stack.pop().unwrap_or(LuaValue::Nil)
        } else {
            LuaValue::Nil
        };
        drop(stack);
        self.make_value(lval)
    }

    pub fn pop_bool(&self) -> bool {
        self.pop_value().as_bool()
    }

    pub fn pop_int(&self) -> i64 {
        self.pop_value().as_int()
    }

    pub fn pop_number(&self) -> f64 {
        self.pop_value().as_number()
    }

    pub fn pop_string(&self) -> String {
        self.pop_value().as_string()
    }

    /// Alias for [`pop_value`](Self::pop_value), for readability when the
    /// argument is expected to be a function.
    pub fn pop_function(&self) -> Value {
        self.pop_value()
    }

    /// Alias for [`pop_value`](Self::pop_value), for readability when the
    /// argument is expected to be a table.
    pub fn pop_table(&self) -> Value {
        self.pop_value()
    }

    pub fn pop_raw(&self) -> HostValue {
        self.pop_value().as_raw()
    }

    // ========================================================================
    // Marshaling
    // ========================================================================

    /// Convert a host value into a script-side handle.
    pub fn value_for(&self, value: impl Into<HostValue>) -> Result<Value> {
        let lval = self.lua_value_for(&value.into())?;
        Ok(self.make_value(lval))
    }

    /// The single dispatch point from host values into Lua values.
    pub(crate) fn lua_value_for(&self, value: &HostValue) -> Result<LuaValue> {
        match value {
            HostValue::Nil => Ok(LuaValue::Nil),
            HostValue::Bool(b) => Ok(LuaValue::Boolean(*b)),
            HostValue::Int(i) => Ok(LuaValue::Integer(*i)),
            HostValue::Float(f) => Ok(LuaValue::Number(*f)),
            HostValue::Str(s) => {
                let core = self.lua_core()?;
                let lstr = core.lua.create_string(s).map_err(EngineError::from_lua)?;
                Ok(LuaValue::String(lstr))
            }
            HostValue::Seq(items) => Ok(LuaValue::Table(self.build_slice_table(items)?)),
            HostValue::Map(pairs) => Ok(LuaValue::Table(self.build_map_table(pairs)?)),
            HostValue::Func(f) => Ok(LuaValue::Function(
                self.wrap_script_function(Rc::clone(f))?,
            )),
            HostValue::Handle(v) => {
                if !v.is_nil() && !v.owned_by(&self.inner) {
                    return Err(EngineError::Runtime {
                        message: "value handle belongs to a different session".into(),
                        traceback: None,
                    });
                }
                Ok(v.lua_value())
            }
        }
    }

    /// Fresh empty table.
    pub fn new_table(&self) -> Result<Value> {
        let table = {
            let core = self.lua_core()?;
            core.lua.create_table().map_err(EngineError::from_lua)?
        };
        Ok(self.make_value(LuaValue::Table(table)))
    }

    /// Build a keyed table from host pairs, recursing into nested maps and
    /// sequences. Keys are marshaled as-is, not stringified.
    pub fn table_from_map(&self, pairs: &[(HostValue, HostValue)]) -> Result<Value> {
        Ok(self.make_value(LuaValue::Table(self.build_map_table(pairs)?)))
    }

    /// Build a 1-based contiguous table from host items in source order,
    /// recursing the same way.
    pub fn table_from_slice(&self, items: &[HostValue]) -> Result<Value> {
        Ok(self.make_value(LuaValue::Table(self.build_slice_table(items)?)))
    }

    fn build_map_table(&self, pairs: &[(HostValue, HostValue)]) -> Result<Table> {
        let table = {
            let core = self.lua_core()?;
            core.lua.create_table().map_err(EngineError::from_lua)?
        };
        for (key, value) in pairs {
            let k = self.lua_value_for(key)?;
            let v = self.lua_value_for(value)?;
            table.raw_set(k, v).map_err(EngineError::from_lua)?;
        }
        Ok(table)
    }

    fn build_slice_table(&self, items: &[HostValue]) -> Result<Table> {
        let table = {
            let core = self.lua_core()?;
            core.lua.create_table().map_err(EngineError::from_lua)?
        };
        for item in items {
            let v = self.lua_value_for(item)?;
            table.raw_push(v).map_err(EngineError::from_lua)?;
        }
        Ok(table)
    }

    pub(crate) fn make_value(&self, lval: LuaValue) -> Value {
        Value::new(lval, Rc::downgrade(&self.inner))
    }

    // ========================================================================
    // Core namespaces and constants
    // ========================================================================

    /// The global table.
    pub fn globals(&self) -> Result<Value> {
        let globals = self.lua_core()?.lua.globals();
        Ok(self.make_value(LuaValue::Table(globals)))
    }

    /// The default chunk environment. Under Lua 5.4 the default `_ENV` is
    /// the globals table; the 5.1-era distinct environ table no longer
    /// exists.
    pub fn environment(&self) -> Result<Value> {
        self.globals()
    }

    /// The session-owned registry table. Never shared between sessions.
    pub fn registry(&self) -> Result<Value> {
        let registry = self.lua_core()?.registry.clone();
        Ok(self.make_value(LuaValue::Table(registry)))
    }

    pub fn true_value(&self) -> Value {
        self.make_value(LuaValue::Boolean(true))
    }

    pub fn false_value(&self) -> Value {
        self.make_value(LuaValue::Boolean(false))
    }

    pub fn nil_value(&self) -> Value {
        self.make_value(LuaValue::Nil)
    }

    // ========================================================================
    // Host-function error helpers
    // ========================================================================

    /// Error for a bad script-supplied argument; `index` is 1-based.
    pub fn argument_error(&self, index: usize, message: impl Into<String>) -> EngineError {
        EngineError::Argument {
            index,
            message: message.into(),
        }
    }

    /// Generic script-visible error raised from a host function.
    pub fn raise_error(&self, message: impl Into<String>) -> EngineError {
        EngineError::Runtime {
            message: message.into(),
            traceback: None,
        }
    }

    // ========================================================================
    // Side-channel metadata
    // ========================================================================

    /// Attach an arbitrary host value to the session, outside script scope.
    pub fn set_meta(&self, key: impl Into<String>, value: impl Any) {
        self.inner
            .meta
            .borrow_mut()
            .insert(key.into(), Box::new(value));
    }

    /// Typed read of a metadata entry; `None` if absent or the wrong type.
    pub fn meta<T: Any + Clone>(&self, key: &str) -> Option<T> {
        self.inner
            .meta
            .borrow()
            .get(key)
            .and_then(|v| v.downcast_ref::<T>())
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_and_call_a_script_function() {
        let engine = Engine::new().unwrap();
        engine
            .run_string("function hello(name) return 'Hello, ' .. name .. '!' end")
            .unwrap();
        let results = engine.call("hello", 1, &["World".into()]).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].as_string(), "Hello, World!");
    }

    #[test]
    fn syntax_error_is_a_compile_error() {
        let engine = Engine::new().unwrap();
        let err = engine.run_string("if then").unwrap_err();
        assert!(matches!(err, EngineError::Compile { .. }));
    }

    #[test]
    fn script_error_is_a_runtime_error() {
        let engine = Engine::new().unwrap();
        let err = engine.run_string("error('oops')").unwrap_err();
        match err {
            EngineError::Runtime { message, .. } => assert!(message.contains("oops")),
            other => panic!("expected Runtime, got {other:?}"),
        }
    }

    #[test]
    fn load_string_compiles_without_executing() {
        let engine = Engine::new().unwrap();
        engine.set_global("ran", false).unwrap();
        let chunk = engine.load_string("ran = true\nreturn 7").unwrap();
        assert!(!engine.get_global("ran").unwrap().as_bool());
        let results = chunk.call(1, &[]).unwrap();
        assert_eq!(results[0].as_number(), 7.0);
        assert!(engine.get_global("ran").unwrap().as_bool());
    }

    #[test]
    fn call_on_non_function_global_fails() {
        let engine = Engine::new().unwrap();
        engine.set_global("not_fn", 42).unwrap();
        let err = engine.call("not_fn", 0, &[]).unwrap_err();
        assert!(matches!(err, EngineError::NotCallable { .. }));
    }

    #[test]
    fn call_pads_missing_results_with_nil() {
        let engine = Engine::new().unwrap();
        engine.run_string("function one() return 1 end").unwrap();
        let results = engine.call("one", 3, &[]).unwrap();
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].as_number(), 1.0);
        assert!(results[1].is_nil());
        assert!(results[2].is_nil());
    }

    #[test]
    fn set_and_get_globals_round_trip() {
        let engine = Engine::new().unwrap();
        engine.set_global("gbl", "testing").unwrap();
        engine.run_string("copy = gbl").unwrap();
        assert_eq!(engine.get_global("copy").unwrap().as_string(), "testing");
    }

    #[test]
    fn sandbox_has_no_os_or_io_by_default() {
        let engine = Engine::new().unwrap();
        assert!(engine.run_string("os.time()").is_err());
        assert!(engine.run_string("io.open('x')").is_err());
        // table and string stay available
        engine.run_string("return table.concat({'a','b'}, ',')").unwrap();
        engine.run_string("return string.upper('x')").unwrap();
    }

    #[test]
    fn open_math_makes_the_library_available() {
        let engine = Engine::new().unwrap();
        assert!(engine.run_string("return math.floor(3.7)").is_err());
        engine.open_math().unwrap();
        engine.run_string("x = math.floor(3.7)").unwrap();
        assert_eq!(engine.get_global("x").unwrap().as_number(), 3.0);
    }

    #[test]
    fn full_stdlib_option_opens_everything_safe() {
        let engine = Engine::open(EngineOptions {
            open_libs: true,
            ..EngineOptions::default()
        })
        .unwrap();
        engine.run_string("x = math.pi ~= nil and os.time() ~= nil").unwrap();
        assert!(engine.get_global("x").unwrap().as_bool());
    }

    #[test]
    fn close_twice_errors() {
        let engine = Engine::new().unwrap();
        engine.close().unwrap();
        assert!(matches!(engine.close(), Err(EngineError::Closed)));
    }

    #[test]
    fn operations_after_close_error() {
        let engine = Engine::new().unwrap();
        engine.run_string("x = 1").unwrap();
        engine.close().unwrap();
        assert!(matches!(
            engine.run_string("x = 2"),
            Err(EngineError::Closed)
        ));
        assert!(matches!(engine.get_global("x"), Err(EngineError::Closed)));
        assert!(matches!(
            engine.call("x", 0, &[]),
            Err(EngineError::Closed)
        ));
    }

    #[test]
    fn meta_is_a_typed_side_channel() {
        let engine = Engine::new().unwrap();
        engine.set_meta("owner", String::from("host"));
        assert_eq!(engine.meta::<String>("owner").unwrap(), "host");
        assert!(engine.meta::<i64>("owner").is_none());
        assert!(engine.meta::<String>("absent").is_none());
        // invisible to scripts
        engine.run_string("assert(owner == nil)").unwrap();
    }

    #[test]
    fn registered_function_pops_in_reverse_and_pushes_results() {
        let engine = Engine::new().unwrap();
        engine
            .register_function("sub", |e| {
                let second = e.pop_int();
                let first = e.pop_int();
                e.push_value(first - second)?;
                Ok(1)
            })
            .unwrap();
        let results = engine.call("sub", 1, &[11.into(), 10.into()]).unwrap();
        assert_eq!(results[0].as_number(), 1.0);
    }

    #[test]
    fn frame_guard_leaves_no_residue() {
        let engine = Engine::new().unwrap();
        // Pops nothing; pushes one result on top of its untouched args.
        engine
            .register_function("nargs", |e| {
                let n = e.stack_size() as i64;
                e.push_value(n)?;
                Ok(1)
            })
            .unwrap();
        let first = engine
            .call("nargs", 1, &[1.into(), 2.into(), 3.into()])
            .unwrap();
        assert_eq!(first[0].as_number(), 3.0);
        // No residue from the previous frame.
        let second = engine.call("nargs", 1, &[1.into()]).unwrap();
        assert_eq!(second[0].as_number(), 1.0);
    }

    #[test]
    fn reentrant_host_script_host_calls_are_stack_safe() {
        let engine = Engine::new().unwrap();
        engine
            .register_function("host_inc", |e| {
                let n = e.pop_int();
                e.push_value(n + 1)?;
                Ok(1)
            })
            .unwrap();
        engine
            .register_function("apply", |e| {
                let n = e.pop_int();
                let f = e.pop_function();
                let results = f.call(1, &[HostValue::Int(n)])?;
                e.push_value(results[0].clone())?;
                Ok(1)
            })
            .unwrap();
        engine
            .run_string("function lua_inc(n) return host_inc(n) + 1 end")
            .unwrap();
        let f = engine.get_global("lua_inc").unwrap();
        let results = engine
            .call("apply", 1, &[HostValue::Handle(f), 5.into()])
            .unwrap();
        assert_eq!(results[0].as_number(), 7.0);
    }

    #[test]
    fn host_function_argument_error_reaches_the_script() {
        let engine = Engine::new().unwrap();
        engine
            .register_function("strict", |e| {
                let arg = e.pop_value();
                if !arg.is_string() {
                    return Err(e.argument_error(1, "expected a string"));
                }
                e.push_value(arg.as_string())?;
                Ok(1)
            })
            .unwrap();
        let err = engine.call("strict", 1, &[42.into()]).unwrap_err();
        assert!(err.to_string().contains("bad argument #1"));
        // and a script can pcall around it
        engine
            .run_string("ok = pcall(function() return strict(42) end)")
            .unwrap();
        assert!(!engine.get_global("ok").unwrap().as_bool());
    }

    #[test]
    fn popping_an_empty_frame_yields_nil() {
        let engine = Engine::new().unwrap();
        engine
            .register_function("greedy", |e| {
                let _ = e.pop_value();
                let _ = e.pop_value();
                let extra = e.pop_value();
                e.push_value(extra.is_nil())?;
                Ok(1)
            })
            .unwrap();
        let results = engine.call("greedy", 1, &[1.into()]).unwrap();
        assert!(results[0].as_bool());
    }

    #[test]
    fn register_module_is_requirable() {
        let engine = Engine::new().unwrap();
        let mut fields = TableMap::new();
        fields.insert("pi".into(), HostValue::Float(3.25));
        fields.insert(
            "add".into(),
            HostValue::func(|e| {
                let b = e.pop_int();
                let a = e.pop_int();
                e.push_value(a + b)?;
                Ok(1)
            }),
        );
        engine.register_module("mathx", fields).unwrap();
        engine
            .run_string("local m = require('mathx')\nsum = m.add(2, 3)\npi = m.pi")
            .unwrap();
        assert_eq!(engine.get_global("sum").unwrap().as_number(), 5.0);
        assert_eq!(engine.get_global("pi").unwrap().as_number(), 3.25);
    }

    #[test]
    fn registry_is_invisible_to_scripts() {
        let engine = Engine::new().unwrap();
        let registry = engine.registry().unwrap();
        registry.raw_set("token", 99).unwrap();
        engine.run_string("assert(token == nil)").unwrap();
        assert_eq!(registry.raw_get("token").as_number(), 99.0);
    }
}
