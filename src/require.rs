//! Sandboxed module resolution.
//!
//! `secure_require` replaces the default `package.searchers` chain with two
//! entries: the preload searcher (so modules registered in memory always
//! win and are never shadowed by the filesystem) and an allow-listed path
//! resolver. The resolver substitutes the requested module name (dots
//! converted to the platform path separator) into each `?` template in
//! order and compiles the first existing file without executing it; the
//! file's top-level return value becomes the module's export on first
//! `require`, after which Lua's own `package.loaded` cache takes over.
//!
//! This is the only sanctioned way to hand script code to the filesystem
//! when sandboxing matters; direct file access is a separate privilege
//! toggled via the `io`/`os` libraries.

use std::path::Path;
use std::rc::Rc;

use log::{debug, warn};

use crate::error::{EngineError, Result};
use crate::Engine;

impl Engine {
    /// Install the restricted module-resolution chain. Each rule is a path
    /// template with a single `?` wildcard, e.g. `"./scripts/?.lua"`.
    pub fn secure_require<S: AsRef<str>>(&self, search_rules: &[S]) -> Result<()> {
        let rules: Vec<String> = search_rules
            .iter()
            .map(|rule| rule.as_ref().to_string())
            .collect();

        let preload_fn = self.wrap_script_function(Rc::new(preload_searcher))?;
        let rule_fn =
            self.wrap_script_function(Rc::new(move |engine: &Engine| rule_searcher(engine, &rules)))?;

        let core = self.lua_core()?;
        let searchers = core.lua.create_table().map_err(EngineError::from_lua)?;
        searchers
            .raw_set(1, preload_fn)
            .map_err(EngineError::from_lua)?;
        searchers
            .raw_set(2, rule_fn)
            .map_err(EngineError::from_lua)?;

        let package: mlua::Table =
            core.lua
                .globals()
                .get("package")
                .map_err(|_| EngineError::Runtime {
                    message: "package library is not loaded".into(),
                    traceback: None,
                })?;
        package
            .set("searchers", searchers.clone())
            .map_err(EngineError::from_lua)?;
        // Pin the chain in the session registry so host code can find it.
        core.registry
            .raw_set("_LOADERS", searchers)
            .map_err(EngineError::from_lua)?;

        debug!("secure module resolution installed ({} rules)", search_rules.len());
        Ok(())
    }
}

/// Searcher 1: in-memory modules from `package.preload`.
fn preload_searcher(engine: &Engine) -> Result<i32> {
    if engine.stack_size() == 0 {
        return Err(engine.argument_error(1, "expected a module name, got nothing"));
    }
    let name = engine.pop_string();

    let preload = engine.globals()?.raw_get("package").raw_get("preload");
    if !preload.is_table() {
        return Err(engine.raise_error("package.preload must be a table"));
    }
    let module = preload.raw_get(name.as_str());
    if module.is_nil() {
        // Lua searcher convention: a string explains why this searcher
        // failed, and require moves on to the next one.
        engine.push_value(format!("no field package.preload['{name}']"))?;
        return Ok(1);
    }

    engine.push_value(module)?;
    Ok(1)
}

/// Searcher 2: allow-listed path templates, first existing file wins.
fn rule_searcher(engine: &Engine, rules: &[String]) -> Result<i32> {
    if engine.stack_size() == 0 {
        return Err(engine.argument_error(1, "expected a module name, got nothing"));
    }
    let name = engine.pop_string();
    let relative = name.replace('.', std::path::MAIN_SEPARATOR_STR);

    for rule in rules {
        let candidate = rule.replace('?', &relative);
        if Path::new(&candidate).exists() {
            let loader = engine.load_file(&candidate)?;
            engine.push_value(loader)?;
            return Ok(1);
        }
    }

    warn!("module '{name}' matched none of {} search rules", rules.len());
    Err(EngineError::ModuleNotFound { name })
}
