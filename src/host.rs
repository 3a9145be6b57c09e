//! Host-side value model.
//!
//! [`HostValue`] is the closed set of things a host program can send across
//! the boundary. Every marshaling path funnels through exactly one match on
//! this enum ([`Engine::lua_value_for`](crate::Engine)), so the "is this a
//! handle / a host function / a plain value" decision lives in one place.

use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use crate::error::Result;
use crate::{Engine, Value};

/// A host function callable from scripts.
///
/// The function receives the owning [`Engine`] and pulls its arguments off
/// the shared stack with the `pop_*` family (top of stack = last argument).
/// It pushes its results with [`Engine::push_value`] and returns how many
/// it pushed.
pub type ScriptFunction = Rc<dyn Fn(&Engine) -> Result<i32>>;

/// Field map accepted by [`Engine::register_module`](crate::Engine::register_module).
pub type TableMap = HashMap<String, HostValue>;

/// A host value ready to cross into script space.
#[derive(Clone)]
pub enum HostValue {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    /// Marshals to a 1-based contiguous sequence.
    Seq(Vec<HostValue>),
    /// Marshals to a keyed table. Keys are marshaled as-is, so non-string
    /// keys are legal. Equality on this variant is positional.
    Map(Vec<(HostValue, HostValue)>),
    /// A host function, wrapped into the stack-protocol calling convention.
    Func(ScriptFunction),
    /// An existing script-side value, passed back through unchanged.
    Handle(Value),
}

impl HostValue {
    /// Wrap a host closure as a script-callable function value.
    pub fn func(f: impl Fn(&Engine) -> Result<i32> + 'static) -> Self {
        Self::Func(Rc::new(f))
    }
}

impl fmt::Debug for HostValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nil => write!(f, "Nil"),
            Self::Bool(b) => write!(f, "Bool({b})"),
            Self::Int(i) => write!(f, "Int({i})"),
            Self::Float(n) => write!(f, "Float({n})"),
            Self::Str(s) => write!(f, "Str({s:?})"),
            Self::Seq(items) => f.debug_tuple("Seq").field(items).finish(),
            Self::Map(pairs) => f.debug_tuple("Map").field(pairs).finish(),
            Self::Func(_) => write!(f, "Func(<host function>)"),
            Self::Handle(v) => f.debug_tuple("Handle").field(v).finish(),
        }
    }
}

impl PartialEq for HostValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Nil, Self::Nil) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a == b,
            (Self::Str(a), Self::Str(b)) => a == b,
            (Self::Seq(a), Self::Seq(b)) => a == b,
            (Self::Map(a), Self::Map(b)) => a == b,
            (Self::Func(a), Self::Func(b)) => Rc::ptr_eq(a, b),
            (Self::Handle(a), Self::Handle(b)) => a == b,
            _ => false,
        }
    }
}

impl From<()> for HostValue {
    fn from(_: ()) -> Self {
        Self::Nil
    }
}

impl From<bool> for HostValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i32> for HostValue {
    fn from(v: i32) -> Self {
        Self::Int(v as i64)
    }
}

impl From<i64> for HostValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<u32> for HostValue {
    fn from(v: u32) -> Self {
        Self::Int(v as i64)
    }
}

impl From<f32> for HostValue {
    fn from(v: f32) -> Self {
        Self::Float(v as f64)
    }
}

impl From<f64> for HostValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for HostValue {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<String> for HostValue {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

impl From<Value> for HostValue {
    fn from(v: Value) -> Self {
        Self::Handle(v)
    }
}

impl From<ScriptFunction> for HostValue {
    fn from(v: ScriptFunction) -> Self {
        Self::Func(v)
    }
}

impl<T: Into<HostValue>> From<Vec<T>> for HostValue {
    fn from(items: Vec<T>) -> Self {
        Self::Seq(items.into_iter().map(Into::into).collect())
    }
}

impl<V: Into<HostValue>> From<HashMap<String, V>> for HostValue {
    fn from(map: HashMap<String, V>) -> Self {
        Self::Map(
            map.into_iter()
                .map(|(k, v)| (Self::Str(k), v.into()))
                .collect(),
        )
    }
}

impl<T: Into<HostValue>> From<Option<T>> for HostValue {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(inner) => inner.into(),
            None => Self::Nil,
        }
    }
}
