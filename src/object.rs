//! Host types exposed into script scope.
//!
//! Rust has no runtime reflection, so a type's script surface is declared
//! explicitly: a [`TypeDef`] collects field accessor closures and
//! stack-protocol methods. Registration generates one prototype table per
//! distinct host type, renames every member per the session's naming
//! conventions, and caches the result in a per-session arena keyed by
//! `TypeId`. Instances travel as userdata wrapping the prototype reference
//! plus the host payload.

use std::any::{Any, TypeId};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use log::debug;
use mlua::{
    MetaMethod, MultiValue, Table, UserData, UserDataMethods, Value as LuaValue,
};

use crate::error::{EngineError, Result};
use crate::value::Value;
use crate::Engine;

pub(crate) type FieldGetter = Rc<dyn Fn(&dyn Any) -> Result<crate::HostValue>>;
pub(crate) type FieldSetter = Rc<dyn Fn(&mut dyn Any, Value) -> Result<()>>;
pub(crate) type ErasedInspect = Rc<dyn Fn(&dyn Any, &str) -> Option<String>>;

/// Generated script surface of one host type, cached per `TypeId`.
pub(crate) struct TypeInfo {
    pub(crate) name: String,
    /// Prototype table: renamed methods plus a `ptr_methods` side table
    /// hosts can extend through `metatable_for`.
    pub(crate) proto: Table,
    pub(crate) getters: HashMap<String, FieldGetter>,
    pub(crate) setters: HashMap<String, FieldSetter>,
    /// Host-side debug rendering, first in the inspect fallback chain.
    pub(crate) inspect: Option<ErasedInspect>,
}

struct FieldDef<T> {
    name: String,
    get: Rc<dyn Fn(&T) -> crate::HostValue>,
    set: Option<Rc<dyn Fn(&mut T, Value) -> Result<()>>>,
}

/// Declares the script-visible surface of a host type `T`.
pub struct TypeDef<T> {
    fields: Vec<FieldDef<T>>,
    methods: Vec<(String, crate::ScriptFunction)>,
    inspect: Option<Rc<dyn Fn(&T, &str) -> String>>,
}

impl<T: 'static> TypeDef<T> {
    pub fn new() -> Self {
        Self {
            fields: Vec::new(),
            methods: Vec::new(),
            inspect: None,
        }
    }

    /// Expose a read-only field. The name is rewritten per the session's
    /// field casing at registration time.
    pub fn field(mut self, name: &str, get: impl Fn(&T) -> crate::HostValue + 'static) -> Self {
        self.fields.push(FieldDef {
            name: name.to_string(),
            get: Rc::new(get),
            set: None,
        });
        self
    }

    /// Expose a read/write field.
    pub fn field_with_setter(
        mut self,
        name: &str,
        get: impl Fn(&T) -> crate::HostValue + 'static,
        set: impl Fn(&mut T, Value) -> Result<()> + 'static,
    ) -> Self {
        self.fields.push(FieldDef {
            name: name.to_string(),
            get: Rc::new(get),
            set: Some(Rc::new(set)),
        });
        self
    }

    /// Expose a stack-protocol method. When scripts use colon-call syntax
    /// the receiver arrives as the first (deepest) stack argument, so a
    /// method pops its declared arguments first and the receiver last.
    pub fn method(mut self, name: &str, func: impl Fn(&Engine) -> Result<i32> + 'static) -> Self {
        self.methods.push((name.to_string(), Rc::new(func)));
        self
    }

    /// Host-side debug rendering for [`Value::inspect`], consulted before
    /// any script-side override.
    pub fn inspect_with(mut self, func: impl Fn(&T, &str) -> String + 'static) -> Self {
        self.inspect = Some(Rc::new(func));
        self
    }
}

impl<T: 'static> Default for TypeDef<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Script-side instance of a registered host type.
#[derive(Clone)]
pub(crate) struct HostObject {
    pub(crate) data: Rc<RefCell<Box<dyn Any>>>,
    pub(crate) info: Rc<TypeInfo>,
}

impl UserData for HostObject {
    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_meta_method(MetaMethod::Index, |lua, this, key: LuaValue| {
            let name = match key {
                LuaValue::String(ref s) => s.to_str().map(|v| v.to_string()).unwrap_or_default(),
                _ => return Ok(LuaValue::Nil),
            };
            // Methods shadow fields, as on the prototype chain.
            let method = this.info.proto.raw_get::<LuaValue>(name.as_str())?;
            if !matches!(method, LuaValue::Nil) {
                return Ok(method);
            }
            if let Some(getter) = this.info.getters.get(&name) {
                let engine = Engine::current(lua)?;
                let host = {
                    let data = this.data.borrow();
                    getter(&**data).map_err(EngineError::into_lua)?
                };
                return engine.lua_value_for(&host).map_err(EngineError::into_lua);
            }
            Ok(LuaValue::Nil)
        });

        methods.add_meta_method(
            MetaMethod::NewIndex,
            |lua, this, (key, value): (LuaValue, LuaValue)| {
                let LuaValue::String(ref s) = key else {
                    return Err(mlua::Error::RuntimeError(
                        "host object fields are keyed by string names".into(),
                    ));
                };
                let name = s.to_str().map(|v| v.to_string()).unwrap_or_default();
                let Some(setter) = this.info.setters.get(&name) else {
                    return Err(mlua::Error::RuntimeError(format!(
                        "no writable field '{}' on {}",
                        name, this.info.name
                    )));
                };
                let engine = Engine::current(lua)?;
                let handle = engine.make_value(value);
                let mut data = this.data.borrow_mut();
                setter(&mut **data, handle).map_err(EngineError::into_lua)
            },
        );

        methods.add_meta_method(MetaMethod::ToString, |_, this, ()| {
            Ok(this.info.name.clone())
        });
    }
}

impl Engine {
    /// Expose `T` under a global constructor: `Name(...)` in script code
    /// yields a fresh copy of `prototype`. Member names are rewritten per
    /// the session's naming conventions. The generated surface is built
    /// once per type and reused by later registrations.
    pub fn register_type<T: Clone + 'static>(
        &self,
        name: &str,
        prototype: T,
        def: TypeDef<T>,
    ) -> Result<()> {
        let ctor = self.type_constructor(name, prototype, def)?;
        self.lua_core()?
            .lua
            .globals()
            .set(name, ctor)
            .map_err(EngineError::from_lua)?;
        debug!("registered type '{name}'");
        Ok(())
    }

    /// Like [`register_type`](Self::register_type), but constructed with
    /// `Name.new(...)` for a method-call construction idiom.
    pub fn register_class<T: Clone + 'static>(
        &self,
        name: &str,
        prototype: T,
        def: TypeDef<T>,
    ) -> Result<()> {
        let ctor = self.type_constructor(name, prototype, def)?;
        self.install_class_table(name, LuaValue::Function(ctor))?;
        debug!("registered class '{name}'");
        Ok(())
    }

    /// Like [`register_class`](Self::register_class), but `Name.new` maps
    /// to the supplied host constructor, which builds instances itself
    /// (typically via [`new_object`](Self::new_object)) and pushes them.
    pub fn register_class_with_ctor<T, F>(&self, name: &str, def: TypeDef<T>, ctor: F) -> Result<()>
    where
        T: 'static,
        F: Fn(&Engine) -> Result<i32> + 'static,
    {
        self.ensure_type_info(name, def)?;
        let wrapped = self.wrap_script_function(Rc::new(ctor))?;
        self.install_class_table(name, LuaValue::Function(wrapped))?;
        debug!("registered class '{name}' with host constructor");
        Ok(())
    }

    /// Wrap a host value of an already-registered type as an object handle.
    pub fn new_object<T: 'static>(&self, value: T) -> Result<Value> {
        let info = self.registered_info::<T>()?;
        let ud = {
            let core = self.lua_core()?;
            core.lua
                .create_userdata(HostObject {
                    data: Rc::new(RefCell::new(Box::new(value) as Box<dyn Any>)),
                    info,
                })
                .map_err(EngineError::from_lua)?
        };
        Ok(self.make_value(LuaValue::UserData(ud)))
    }

    /// The generated prototype table for a registered type, for host-side
    /// customization (e.g. installing an `inspect` override into its
    /// `ptr_methods` side table).
    pub fn metatable_for<T: 'static>(&self) -> Result<Value> {
        let info = self.registered_info::<T>()?;
        Ok(self.make_value(LuaValue::Table(info.proto.clone())))
    }

    fn registered_info<T: 'static>(&self) -> Result<Rc<TypeInfo>> {
        self.inner
            .types
            .borrow()
            .get(&TypeId::of::<T>())
            .cloned()
            .ok_or_else(|| EngineError::Runtime {
                message: format!(
                    "host type '{}' is not registered",
                    std::any::type_name::<T>()
                ),
                traceback: None,
            })
    }

    fn install_class_table(&self, name: &str, ctor: LuaValue) -> Result<()> {
        let table = {
            let core = self.lua_core()?;
            core.lua.create_table().map_err(EngineError::from_lua)?
        };
        table.raw_set("new", ctor).map_err(EngineError::from_lua)?;
        self.lua_core()?
            .lua
            .globals()
            .set(name, table)
            .map_err(EngineError::from_lua)
    }

    fn type_constructor<T: Clone + 'static>(
        &self,
        name: &str,
        prototype: T,
        def: TypeDef<T>,
    ) -> Result<mlua::Function> {
        let info = self.ensure_type_info(name, def)?;
        let core = self.lua_core()?;
        core.lua
            .create_function(move |lua, _args: MultiValue| {
                lua.create_userdata(HostObject {
                    data: Rc::new(RefCell::new(Box::new(prototype.clone()) as Box<dyn Any>)),
                    info: Rc::clone(&info),
                })
            })
            .map_err(EngineError::from_lua)
    }

    fn ensure_type_info<T: 'static>(&self, name: &str, def: TypeDef<T>) -> Result<Rc<TypeInfo>> {
        if let Some(info) = self.inner.types.borrow().get(&TypeId::of::<T>()) {
            return Ok(Rc::clone(info));
        }

        let (proto, ptr_methods) = {
            let core = self.lua_core()?;
            let proto = core.lua.create_table().map_err(EngineError::from_lua)?;
            let ptr = core.lua.create_table().map_err(EngineError::from_lua)?;
            (proto, ptr)
        };
        proto
            .raw_set("ptr_methods", ptr_methods)
            .map_err(EngineError::from_lua)?;

        for (method_name, func) in &def.methods {
            let wrapped = self.wrap_script_function(Rc::clone(func))?;
            for alias in self.inner.options.method_casing.apply(method_name) {
                proto
                    .raw_set(alias.as_str(), wrapped.clone())
                    .map_err(EngineError::from_lua)?;
            }
        }

        let mut getters: HashMap<String, FieldGetter> = HashMap::new();
        let mut setters: HashMap<String, FieldSetter> = HashMap::new();
        for field in def.fields {
            let FieldDef { name: field_name, get, set } = field;
            let erased_get: FieldGetter = Rc::new(move |any: &dyn Any| {
                let target = any.downcast_ref::<T>().ok_or_else(type_mismatch)?;
                Ok(get(target))
            });
            for alias in self.inner.options.field_casing.apply(&field_name) {
                getters.insert(alias, Rc::clone(&erased_get));
            }
            if let Some(set) = set {
                let erased_set: FieldSetter = Rc::new(move |any: &mut dyn Any, value| {
                    let target = any.downcast_mut::<T>().ok_or_else(type_mismatch)?;
                    set(target, value)
                });
                for alias in self.inner.options.field_casing.apply(&field_name) {
                    setters.insert(alias, Rc::clone(&erased_set));
                }
            }
        }

        let inspect = def.inspect.map(|func| {
            let erased: ErasedInspect = Rc::new(move |any: &dyn Any, indent: &str| {
                any.downcast_ref::<T>().map(|target| func(target, indent))
            });
            erased
        });

        let info = Rc::new(TypeInfo {
            name: name.to_string(),
            proto,
            getters,
            setters,
            inspect,
        });
        self.inner
            .types
            .borrow_mut()
            .insert(TypeId::of::<T>(), Rc::clone(&info));
        debug!("generated prototype for host type '{name}'");
        Ok(info)
    }
}

fn type_mismatch() -> EngineError {
    EngineError::Runtime {
        message: "host object payload does not match its registered type".into(),
        traceback: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::HostValue;

    #[derive(Clone)]
    struct Point {
        x: f64,
        y: f64,
    }

    fn point_def() -> TypeDef<Point> {
        TypeDef::new()
            .field("X", |p: &Point| p.x.into())
            .field_with_setter(
                "Y",
                |p: &Point| p.y.into(),
                |p: &mut Point, v| {
                    p.y = v.as_number();
                    Ok(())
                },
            )
            .method("Magnitude", |e| {
                let receiver = e.pop_value();
                let mag = receiver
                    .with_object::<Point, _>(|p| (p.x * p.x + p.y * p.y).sqrt())
                    .unwrap_or(0.0);
                e.push_value(mag)?;
                Ok(1)
            })
    }

    #[test]
    fn constructor_fields_and_methods_in_snake_case() {
        let engine = Engine::new().unwrap();
        engine
            .register_type("Point", Point { x: 3.0, y: 4.0 }, point_def())
            .unwrap();
        engine
            .run_string("p = Point()\nmag = p:magnitude()\npx = p.x")
            .unwrap();
        assert_eq!(engine.get_global("mag").unwrap().as_number(), 5.0);
        assert_eq!(engine.get_global("px").unwrap().as_number(), 3.0);
    }

    #[test]
    fn each_construction_clones_the_prototype() {
        let engine = Engine::new().unwrap();
        engine
            .register_type("Point", Point { x: 1.0, y: 2.0 }, point_def())
            .unwrap();
        engine
            .run_string("a = Point()\nb = Point()\na.y = 9\nay = a.y\nby = b.y")
            .unwrap();
        assert_eq!(engine.get_global("ay").unwrap().as_number(), 9.0);
        assert_eq!(engine.get_global("by").unwrap().as_number(), 2.0);
    }

    #[test]
    fn writing_a_read_only_field_errors() {
        let engine = Engine::new().unwrap();
        engine
            .register_type("Point", Point { x: 0.0, y: 0.0 }, point_def())
            .unwrap();
        let err = engine.run_string("p = Point()\np.x = 5").unwrap_err();
        assert!(err.to_string().contains("no writable field"));
    }

    #[test]
    fn dual_case_exposes_both_spellings() {
        let engine = Engine::open(crate::EngineOptions {
            field_casing: crate::NamingConvention::DualCase,
            method_casing: crate::NamingConvention::DualCase,
            ..crate::EngineOptions::default()
        })
        .unwrap();
        engine
            .register_type("Point", Point { x: 7.0, y: 0.0 }, point_def())
            .unwrap();
        engine
            .run_string("p = Point()\na = p.x\nb = p.X\nc = p:magnitude()\nd = p:Magnitude()")
            .unwrap();
        assert_eq!(engine.get_global("a").unwrap().as_number(), 7.0);
        assert_eq!(engine.get_global("b").unwrap().as_number(), 7.0);
        assert_eq!(engine.get_global("c").unwrap().as_number(), 7.0);
        assert_eq!(engine.get_global("d").unwrap().as_number(), 7.0);
    }

    #[test]
    fn class_registration_constructs_via_new() {
        let engine = Engine::new().unwrap();
        engine
            .register_class("Point", Point { x: 1.0, y: 0.0 }, point_def())
            .unwrap();
        assert!(engine.run_string("p = Point()").is_err());
        engine.run_string("p = Point.new()\nx = p.x").unwrap();
        assert_eq!(engine.get_global("x").unwrap().as_number(), 1.0);
    }

    #[test]
    fn class_with_host_constructor_reads_its_arguments() {
        let engine = Engine::new().unwrap();
        engine
            .register_class_with_ctor("Point", point_def(), |e| {
                let y = e.pop_number();
                let x = e.pop_number();
                let handle = e.new_object(Point { x, y })?;
                e.push_value(handle)?;
                Ok(1)
            })
            .unwrap();
        engine
            .run_string("p = Point.new(6, 8)\nmag = p:magnitude()")
            .unwrap();
        assert_eq!(engine.get_global("mag").unwrap().as_number(), 10.0);
    }

    #[test]
    fn tostring_uses_the_type_name() {
        let engine = Engine::new().unwrap();
        engine
            .register_type("Point", Point { x: 0.0, y: 0.0 }, point_def())
            .unwrap();
        engine.run_string("s = tostring(Point())").unwrap();
        assert_eq!(engine.get_global("s").unwrap().as_string(), "Point");
    }

    #[test]
    fn new_object_requires_registration() {
        let engine = Engine::new().unwrap();
        assert!(engine.new_object(Point { x: 0.0, y: 0.0 }).is_err());
    }

    #[test]
    fn inspect_prefers_the_host_closure() {
        let engine = Engine::new().unwrap();
        let def = point_def().inspect_with(|p, _| format!("Point({}, {})", p.x, p.y));
        engine
            .register_type("Point", Point { x: 1.0, y: 2.0 }, def)
            .unwrap();
        let p = engine.new_object(Point { x: 1.0, y: 2.0 }).unwrap();
        assert_eq!(p.inspect(""), "Point(1, 2)");
    }

    #[test]
    fn inspect_falls_back_to_ptr_methods_override() {
        let engine = Engine::new().unwrap();
        engine
            .register_type("Point", Point { x: 0.0, y: 0.0 }, point_def())
            .unwrap();
        let proto = engine.metatable_for::<Point>().unwrap();
        let ptr_methods = proto.raw_get("ptr_methods");
        ptr_methods
            .set(
                "inspect",
                HostValue::func(|e| {
                    // (receiver, indent) arrive as arguments
                    let _indent = e.pop_value();
                    let _receiver = e.pop_value();
                    e.push_value("from ptr_methods")?;
                    Ok(1)
                }),
            )
            .unwrap();
        let p = engine.new_object(Point { x: 0.0, y: 0.0 }).unwrap();
        assert_eq!(p.inspect(""), "from ptr_methods");
    }
}
