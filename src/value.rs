//! Handles to script-side values.
//!
//! A [`Value`] pairs one Lua value with a weak back-reference to its owning
//! session. Handles are cheap, ephemeral, and never extend the session's
//! lifetime; once the engine is closed they go inert (coercions return
//! zero values, table operations return defaults).

use std::collections::HashMap;
use std::fmt;
use std::rc::{Rc, Weak};

use mlua::{MultiValue, Value as LuaValue};

use crate::engine::EngineInner;
use crate::error::{EngineError, Result};
use crate::host::HostValue;
use crate::object::HostObject;
use crate::Engine;

/// Display formatting for Lua numbers: integral floats render without a
/// decimal point.
pub(crate) fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{n:.0}")
    } else {
        format!("{n}")
    }
}

/// Lua-flavored number parsing for string coercion (decimal or 0x hex).
fn parse_lua_number(text: &str) -> Option<f64> {
    let trimmed = text.trim();
    if let Some(hex) = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
    {
        return i64::from_str_radix(hex, 16).ok().map(|v| v as f64);
    }
    trimmed.parse::<f64>().ok()
}

/// Raw (metamethod-free) equality used for key matching during traversal.
fn raw_eq(a: &LuaValue, b: &LuaValue) -> bool {
    match (a, b) {
        (LuaValue::Nil, LuaValue::Nil) => true,
        (LuaValue::Boolean(x), LuaValue::Boolean(y)) => x == y,
        (LuaValue::Integer(x), LuaValue::Integer(y)) => x == y,
        (LuaValue::Number(x), LuaValue::Number(y)) => x == y,
        (LuaValue::Integer(x), LuaValue::Number(y))
        | (LuaValue::Number(y), LuaValue::Integer(x)) => (*x as f64) == *y,
        (LuaValue::String(x), LuaValue::String(y)) => *x.as_bytes() == *y.as_bytes(),
        (x, y) => {
            // Reference types compare by identity; to_pointer is null for
            // everything else, so mismatched scalar types stay unequal.
            let p = x.to_pointer();
            !p.is_null() && p == y.to_pointer()
        }
    }
}

/// A reference to a single value living inside a session's Lua state.
#[derive(Debug, Clone)]
pub struct Value {
    lval: LuaValue,
    owner: Weak<EngineInner>,
}

impl Value {
    pub(crate) fn new(lval: LuaValue, owner: Weak<EngineInner>) -> Self {
        Self { lval, owner }
    }

    pub(crate) fn lua_value(&self) -> LuaValue {
        self.lval.clone()
    }

    pub(crate) fn owned_by(&self, inner: &Rc<EngineInner>) -> bool {
        self.owner
            .upgrade()
            .map_or(false, |owner| Rc::ptr_eq(&owner, inner))
    }

    /// The owning session, if it is still alive and open.
    fn engine(&self) -> Option<Engine> {
        self.owner
            .upgrade()
            .filter(|inner| !inner.closed.get())
            .map(Engine::from_inner)
    }

    fn detached_nil(&self) -> Value {
        Value {
            lval: LuaValue::Nil,
            owner: self.owner.clone(),
        }
    }

    // ========================================================================
    // Type predicates
    // ========================================================================

    pub fn is_nil(&self) -> bool {
        matches!(self.lval, LuaValue::Nil)
    }

    pub fn is_bool(&self) -> bool {
        matches!(self.lval, LuaValue::Boolean(_))
    }

    pub fn is_number(&self) -> bool {
        matches!(self.lval, LuaValue::Integer(_) | LuaValue::Number(_))
    }

    pub fn is_string(&self) -> bool {
        matches!(self.lval, LuaValue::String(_))
    }

    pub fn is_table(&self) -> bool {
        matches!(self.lval, LuaValue::Table(_))
    }

    pub fn is_function(&self) -> bool {
        matches!(self.lval, LuaValue::Function(_))
    }

    /// True for opaque host-object handles (userdata).
    pub fn is_object(&self) -> bool {
        matches!(self.lval, LuaValue::UserData(_))
    }

    /// Lua truthiness: only nil and false are falsy. `0` and `""` are true.
    pub fn is_truthy(&self) -> bool {
        self.as_bool()
    }

    pub fn is_falsy(&self) -> bool {
        !self.as_bool()
    }

    // ========================================================================
    // Coercions (best effort, never fail)
    // ========================================================================

    pub fn as_bool(&self) -> bool {
        !matches!(self.lval, LuaValue::Nil | LuaValue::Boolean(false))
    }

    /// Lua string coercion: strings pass through, numbers format, anything
    /// else becomes "".
    pub fn as_string(&self) -> String {
        match &self.lval {
            LuaValue::String(s) if self.engine().is_some() => {
                s.to_str().map(|v| v.to_string()).unwrap_or_default()
            }
            LuaValue::Integer(i) => i.to_string(),
            LuaValue::Number(n) => format_number(*n),
            _ => String::new(),
        }
    }

    /// Lua number coercion: numbers pass through, numeric strings parse,
    /// anything else is 0.
    pub fn as_number(&self) -> f64 {
        match &self.lval {
            LuaValue::Integer(i) => *i as f64,
            LuaValue::Number(n) => *n,
            LuaValue::String(s) if self.engine().is_some() => s
                .to_str()
                .ok()
                .and_then(|v| parse_lua_number(&v))
                .unwrap_or(0.0),
            _ => 0.0,
        }
    }

    /// [`as_number`](Self::as_number) truncated toward zero.
    pub fn as_int(&self) -> i64 {
        match self.lval {
            LuaValue::Integer(i) => i,
            _ => self.as_number() as i64,
        }
    }

    /// The most natural host value: simple types convert directly, tables
    /// convert to a sequence when `len() > 0` and a map otherwise, object
    /// handles stay handles, functions (and anything else) become nil.
    pub fn as_raw(&self) -> HostValue {
        match &self.lval {
            LuaValue::Nil => HostValue::Nil,
            LuaValue::Boolean(b) => HostValue::Bool(*b),
            LuaValue::Integer(i) => HostValue::Int(*i),
            LuaValue::Number(n) => HostValue::Float(*n),
            LuaValue::String(_) => HostValue::Str(self.as_string()),
            LuaValue::Table(_) => {
                if self.len() > 0 {
                    HostValue::Seq(self.to_slice())
                } else {
                    HostValue::Map(self.table_entries())
                }
            }
            LuaValue::UserData(_) => HostValue::Handle(self.clone()),
            _ => HostValue::Nil,
        }
    }

    // ========================================================================
    // Table operations (defaults when the handle is not a table)
    // ========================================================================

    /// Metamethod-aware index; may trigger a script-defined `__index`.
    pub fn get(&self, key: impl Into<HostValue>) -> Value {
        let Some(engine) = self.engine() else {
            return self.detached_nil();
        };
        let LuaValue::Table(ref table) = self.lval else {
            return engine.nil_value();
        };
        let Ok(k) = engine.lua_value_for(&key.into()) else {
            return engine.nil_value();
        };
        match table.get::<LuaValue>(k) {
            Ok(v) => engine.make_value(v),
            Err(_) => engine.nil_value(),
        }
    }

    /// Metamethod-aware assignment; may trigger `__newindex`.
    pub fn set(&self, key: impl Into<HostValue>, value: impl Into<HostValue>) -> Result<()> {
        let engine = self.engine().ok_or(EngineError::Closed)?;
        let LuaValue::Table(ref table) = self.lval else {
            return Ok(());
        };
        let k = engine.lua_value_for(&key.into())?;
        let v = engine.lua_value_for(&value.into())?;
        table.set(k, v).map_err(EngineError::from_lua)
    }

    /// Index bypassing metamethods.
    pub fn raw_get(&self, key: impl Into<HostValue>) -> Value {
        let Some(engine) = self.engine() else {
            return self.detached_nil();
        };
        let LuaValue::Table(ref table) = self.lval else {
            return engine.nil_value();
        };
        let Ok(k) = engine.lua_value_for(&key.into()) else {
            return engine.nil_value();
        };
        match table.raw_get::<LuaValue>(k) {
            Ok(v) => engine.make_value(v),
            Err(_) => engine.nil_value(),
        }
    }

    /// Assignment bypassing metamethods.
    pub fn raw_set(&self, key: impl Into<HostValue>, value: impl Into<HostValue>) -> Result<()> {
        let engine = self.engine().ok_or(EngineError::Closed)?;
        let LuaValue::Table(ref table) = self.lval else {
            return Ok(());
        };
        let k = engine.lua_value_for(&key.into())?;
        let v = engine.lua_value_for(&value.into())?;
        table.raw_set(k, v).map_err(EngineError::from_lua)
    }

    /// Integer-keyed assignment bypassing metamethods.
    pub fn raw_set_int(&self, index: i64, value: impl Into<HostValue>) -> Result<()> {
        self.raw_set(HostValue::Int(index), value)
    }

    /// Sequence length; -1 when the handle is not a table.
    pub fn len(&self) -> i64 {
        match (&self.lval, self.engine()) {
            (LuaValue::Table(table), Some(_)) => table.raw_len() as i64,
            _ => -1,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() <= 0
    }

    /// Largest positive integer key holding a non-nil value, 0 if none.
    pub fn max_index_used(&self) -> i64 {
        let LuaValue::Table(ref table) = self.lval else {
            return 0;
        };
        if self.engine().is_none() {
            return 0;
        }
        let mut max = 0i64;
        for pair in table.clone().pairs::<LuaValue, LuaValue>() {
            let Ok((key, _)) = pair else { continue };
            match key {
                LuaValue::Integer(i) if i > max => max = i,
                LuaValue::Number(n) if n.fract() == 0.0 && (n as i64) > max => max = n as i64,
                _ => {}
            }
        }
        max
    }

    /// Append to the sequence part.
    pub fn append(&self, value: impl Into<HostValue>) -> Result<()> {
        let engine = self.engine().ok_or(EngineError::Closed)?;
        let LuaValue::Table(ref table) = self.lval else {
            return Ok(());
        };
        let v = engine.lua_value_for(&value.into())?;
        table.raw_push(v).map_err(EngineError::from_lua)
    }

    /// Insert at `pos` (1-based), shifting later elements up.
    pub fn insert(&self, pos: i64, value: impl Into<HostValue>) -> Result<()> {
        let engine = self.engine().ok_or(EngineError::Closed)?;
        let LuaValue::Table(ref table) = self.lval else {
            return Ok(());
        };
        let v = engine.lua_value_for(&value.into())?;
        table.raw_insert(pos, v).map_err(EngineError::from_lua)
    }

    /// Remove the element at `pos` (1-based), shifting later elements down.
    /// Returns the removed value.
    pub fn remove(&self, pos: i64) -> Result<Value> {
        let engine = self.engine().ok_or(EngineError::Closed)?;
        let LuaValue::Table(ref table) = self.lval else {
            return Ok(self.detached_nil());
        };
        let removed = table
            .raw_get::<LuaValue>(pos)
            .map_err(EngineError::from_lua)?;
        table.raw_remove(pos).map_err(EngineError::from_lua)?;
        Ok(engine.make_value(removed))
    }

    /// Visit every key/value pair in the table's native order. The order is
    /// implementation-defined and must not be assumed sorted.
    pub fn for_each<F: FnMut(Value, Value)>(&self, mut callback: F) {
        let Some(engine) = self.engine() else { return };
        let LuaValue::Table(ref table) = self.lval else {
            return;
        };
        for pair in table.clone().pairs::<LuaValue, LuaValue>() {
            let Ok((key, value)) = pair else { continue };
            callback(engine.make_value(key), engine.make_value(value));
        }
    }

    /// Stateless traversal primitive: the pair following `key` in native
    /// order, or the first pair when `key` is nil. `(nil, nil)` at the end.
    pub fn next(&self, key: impl Into<HostValue>) -> (Value, Value) {
        let Some(engine) = self.engine() else {
            return (self.detached_nil(), self.detached_nil());
        };
        let LuaValue::Table(ref table) = self.lval else {
            return (engine.nil_value(), engine.nil_value());
        };
        let Ok(target) = engine.lua_value_for(&key.into()) else {
            return (engine.nil_value(), engine.nil_value());
        };
        let mut found = matches!(target, LuaValue::Nil);
        for pair in table.clone().pairs::<LuaValue, LuaValue>() {
            let Ok((k, v)) = pair else { continue };
            if found {
                return (engine.make_value(k), engine.make_value(v));
            }
            if raw_eq(&k, &target) {
                found = true;
            }
        }
        (engine.nil_value(), engine.nil_value())
    }

    /// The list/map heuristic: list-like iff key 1 holds a non-nil value.
    /// A sparse or nil-headed integer-keyed table reports false; this is a
    /// known false-negative source, kept for behavior compatibility.
    pub fn looks_like_list(&self) -> bool {
        self.is_table() && !self.raw_get(1).is_nil()
    }

    // ========================================================================
    // Inverse marshaling
    // ========================================================================

    /// Convert a table to a host map, stringifying keys. Nested tables pick
    /// slice or map via [`looks_like_list`](Self::looks_like_list). Not
    /// safe for cyclic tables.
    pub fn to_map(&self) -> HashMap<String, HostValue> {
        let mut out = HashMap::new();
        self.for_each(|key, value| {
            out.insert(key.as_string(), convert_nested(&value));
        });
        out
    }

    /// Convert the sequence part (`1..=len()`) to a host vector, recursing
    /// like [`to_map`](Self::to_map). Not safe for cyclic tables.
    pub fn to_slice(&self) -> Vec<HostValue> {
        let mut out = Vec::new();
        if !self.is_table() {
            return out;
        }
        let len = self.len().max(0);
        for i in 1..=len {
            out.push(convert_nested(&self.get(i)));
        }
        out
    }

    /// Table pairs with keys converted via `as_raw`, preserving key types.
    pub(crate) fn table_entries(&self) -> Vec<(HostValue, HostValue)> {
        let mut out = Vec::new();
        self.for_each(|key, value| {
            out.push((key.as_raw(), convert_nested(&value)));
        });
        out
    }

    // ========================================================================
    // Invocation
    // ========================================================================

    /// Call the handle itself as a function under protection, returning
    /// exactly `ret_count` results in callee order.
    pub fn call(&self, ret_count: usize, args: &[HostValue]) -> Result<Vec<Value>> {
        let engine = self.engine().ok_or(EngineError::Closed)?;
        let func = match &self.lval {
            LuaValue::Function(f) => f.clone(),
            other => {
                return Err(EngineError::Invocation {
                    target: other.type_name().to_string(),
                })
            }
        };
        let mut lua_args = Vec::with_capacity(args.len());
        for arg in args {
            lua_args.push(engine.lua_value_for(arg)?);
        }
        let results = {
            let _core = engine.lua_core()?;
            func.call::<MultiValue>(MultiValue::from_iter(lua_args))
                .map_err(|e| EngineError::Call(Box::new(EngineError::from_lua(e))))?
        };
        Ok(engine.collect_results(results, ret_count))
    }

    /// Look up `key` on the handle and call it. Object handles resolve the
    /// key on their generated prototype; tables use plain indexing. The
    /// handle is NOT passed as an implicit receiver; callers wanting self
    /// must pass it in `args`.
    pub fn invoke(
        &self,
        key: impl Into<HostValue>,
        ret_count: usize,
        args: &[HostValue],
    ) -> Result<Vec<Value>> {
        let engine = self.engine().ok_or(EngineError::Closed)?;
        let key = key.into();
        let label = match &key {
            HostValue::Str(s) => s.clone(),
            other => format!("{other:?}"),
        };
        let target = if let LuaValue::UserData(ref ud) = self.lval {
            match ud.borrow::<HostObject>() {
                Ok(obj) => {
                    let k = engine.lua_value_for(&key)?;
                    let method = obj
                        .info
                        .proto
                        .raw_get::<LuaValue>(k)
                        .unwrap_or(LuaValue::Nil);
                    engine.make_value(method)
                }
                Err(_) => engine.nil_value(),
            }
        } else {
            self.get(key)
        };
        if !target.is_function() {
            return Err(EngineError::Invocation { target: label });
        }
        target.call(ret_count, args)
    }

    // ========================================================================
    // Equality
    // ========================================================================

    /// Same session AND runtime `==` (metamethod-aware). Nil handles are
    /// equal to each other regardless of origin.
    pub fn equals(&self, other: &Value) -> bool {
        if self.is_nil() && other.is_nil() {
            return true;
        }
        let (Some(a), Some(b)) = (self.owner.upgrade(), other.owner.upgrade()) else {
            return false;
        };
        if !Rc::ptr_eq(&a, &b) || a.closed.get() {
            return false;
        }
        let engine = Engine::from_inner(a);
        let Ok(core) = engine.lua_core() else {
            return false;
        };
        core.eq
            .call::<bool>((self.lval.clone(), other.lval.clone()))
            .unwrap_or(false)
    }

    // ========================================================================
    // Debug rendering
    // ========================================================================

    /// Human-readable, recursively indented rendering for debugging.
    pub fn inspect(&self, indent: &str) -> String {
        let next_indent = format!("{indent}  ");

        match &self.lval {
            LuaValue::String(_) => format!("{:?}", self.as_string()),
            LuaValue::Boolean(b) => b.to_string(),
            LuaValue::Nil => "nil".to_string(),
            LuaValue::Integer(i) => i.to_string(),
            LuaValue::Number(n) => format_number(*n),
            LuaValue::UserData(_) => self.inspect_object(indent),
            LuaValue::Table(_) => {
                // A table may provide its own inspect method.
                if let Ok(results) = self.invoke("inspect", 1, &[HostValue::Handle(self.clone())])
                {
                    if let Some(first) = results.first() {
                        if !first.is_nil() {
                            return first.inspect(&next_indent);
                        }
                    }
                }
                let mut buf = String::from("{\n");
                self.for_each(|key, value| {
                    buf.push_str(&next_indent);
                    buf.push('[');
                    buf.push_str(&key.inspect(&next_indent));
                    buf.push_str("] = ");
                    buf.push_str(&value.inspect(&next_indent));
                    buf.push_str(",\n");
                });
                buf.push_str(indent);
                buf.push('}');
                buf
            }
            LuaValue::Function(_) => "<function>".to_string(),
            _ => "nil".to_string(),
        }
    }

    /// Object-handle rendering. Tried in order: the host-side inspect
    /// closure from the type definition, an `inspect` function on the
    /// prototype's `ptr_methods` side table, one on the prototype itself,
    /// one reachable through the object's own indexed surface, then a
    /// generic fallback. The order is the customization contract.
    fn inspect_object(&self, indent: &str) -> String {
        let Some(engine) = self.engine() else {
            return "<userdata>".to_string();
        };
        let LuaValue::UserData(ref ud) = self.lval else {
            return "<userdata>".to_string();
        };
        let Ok(obj) = ud.borrow::<HostObject>() else {
            return "<userdata>".to_string();
        };

        if let Some(host_inspect) = &obj.info.inspect {
            let data = obj.data.borrow();
            if let Some(rendered) = host_inspect(&**data, indent) {
                return rendered;
            }
        }

        let self_arg = [HostValue::Handle(self.clone()), indent.into()];
        let proto = engine.make_value(LuaValue::Table(obj.info.proto.clone()));

        let ptr_methods = proto.raw_get("ptr_methods");
        if let Ok(results) = ptr_methods.invoke("inspect", 1, &self_arg) {
            if let Some(first) = results.first() {
                if !first.is_nil() {
                    return first.as_string();
                }
            }
        }

        if let Ok(results) = proto.invoke("inspect", 1, &self_arg) {
            if let Some(first) = results.first() {
                if !first.is_nil() {
                    return first.as_string();
                }
            }
        }

        // The object's own exposed surface (metamethod-aware indexing).
        let surface = engine.lua_core().ok().and_then(|core| {
            core.index
                .call::<LuaValue>((self.lval.clone(), "inspect"))
                .ok()
        });
        if let Some(method @ LuaValue::Function(_)) = surface {
            let method = engine.make_value(method);
            if let Ok(results) = method.call(1, &self_arg) {
                if let Some(first) = results.first() {
                    if !first.is_nil() {
                        return first.as_string();
                    }
                }
            }
        }

        format!("{}({:p})", obj.info.name, self.lval.to_pointer())
    }

    // ========================================================================
    // Host object access
    // ========================================================================

    /// Borrow the underlying host object immutably, if this handle wraps a
    /// registered host type `T`.
    pub fn with_object<T: 'static, R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        let LuaValue::UserData(ref ud) = self.lval else {
            return None;
        };
        let obj = ud.borrow::<HostObject>().ok()?;
        let data = obj.data.borrow();
        (**data).downcast_ref::<T>().map(f)
    }

    /// Borrow the underlying host object mutably.
    pub fn with_object_mut<T: 'static, R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let LuaValue::UserData(ref ud) = self.lval else {
            return None;
        };
        let obj = ud.borrow::<HostObject>().ok()?;
        let mut data = obj.data.borrow_mut();
        (**data).downcast_mut::<T>().map(f)
    }
}

fn convert_nested(value: &Value) -> HostValue {
    if value.is_table() {
        if value.looks_like_list() {
            HostValue::Seq(value.to_slice())
        } else {
            HostValue::Map(value.table_entries())
        }
    } else {
        value.as_raw()
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.equals(other)
    }
}

impl fmt::Display for Value {
    /// Mirrors the runtime's `tostring` rendering.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.lval {
            LuaValue::Nil => write!(f, "nil"),
            LuaValue::Boolean(b) => write!(f, "{b}"),
            LuaValue::Integer(i) => write!(f, "{i}"),
            LuaValue::Number(n) => write!(f, "{}", format_number(*n)),
            LuaValue::String(_) => write!(f, "{}", self.as_string()),
            other => write!(f, "{}: {:p}", other.type_name(), other.to_pointer()),
        }
    }
}
