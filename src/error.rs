//! Error surface for the bridge.
//!
//! Lua-side failures are mapped into typed variants exactly once, at the
//! mlua boundary (`EngineError::from_lua`). Host functions signal failure
//! the other way through `EngineError::into_lua`, so a script sees an
//! ordinary Lua error it can `pcall` around.

use std::fmt;

/// Crate-wide result alias.
pub type Result<T, E = EngineError> = std::result::Result<T, E>;

#[derive(Debug, Clone)]
pub enum EngineError {
    /// Source text failed to compile.
    Compile { message: String },
    /// Script raised an uncaught error during execution.
    Runtime {
        message: String,
        traceback: Option<String>,
    },
    /// A protected call into script code failed; wraps the script error.
    Call(Box<EngineError>),
    /// The named global resolved to something that is not a function.
    NotCallable { name: String },
    /// A handle invocation target was nil or not callable.
    Invocation { target: String },
    /// A host function rejected one of its arguments (1-based index).
    Argument { index: usize, message: String },
    /// The secure module loader exhausted every search rule.
    ModuleNotFound { name: String },
    /// Operation attempted on a closed engine.
    Closed,
    /// Filesystem failure while loading script source.
    Io(String),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Compile { message } => write!(f, "compile error: {message}"),
            Self::Runtime { message, traceback } => {
                write!(f, "runtime error: {message}")?;
                if let Some(tb) = traceback {
                    write!(f, "\n{tb}")?;
                }
                Ok(())
            }
            Self::Call(inner) => write!(f, "call failed: {inner}"),
            Self::NotCallable { name } => write!(f, "global '{name}' is not callable"),
            Self::Invocation { target } => {
                write!(f, "invocation target '{target}' is nil or not a function")
            }
            Self::Argument { index, message } => write!(f, "bad argument #{index}: {message}"),
            Self::ModuleNotFound { name } => write!(f, "module '{name}' not found"),
            Self::Closed => write!(f, "engine is closed"),
            Self::Io(msg) => write!(f, "IO error: {msg}"),
        }
    }
}

impl std::error::Error for EngineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Call(inner) => Some(inner),
            _ => None,
        }
    }
}

impl EngineError {
    /// Map an mlua error into the typed surface. `CallbackError` is
    /// unwrapped to its cause so a host-function error round-trips intact.
    pub(crate) fn from_lua(err: mlua::Error) -> Self {
        match err {
            mlua::Error::SyntaxError { message, .. } => Self::Compile { message },
            mlua::Error::RuntimeError(message) => Self::Runtime {
                message,
                traceback: None,
            },
            mlua::Error::CallbackError { traceback, cause } => {
                match Self::from_lua(cause.as_ref().clone()) {
                    Self::Runtime {
                        message,
                        traceback: None,
                    } => Self::Runtime {
                        message,
                        traceback: Some(traceback),
                    },
                    other => other,
                }
            }
            mlua::Error::ExternalError(err) => match err.downcast_ref::<EngineError>() {
                Some(own) => own.clone(),
                None => Self::Runtime {
                    message: err.to_string(),
                    traceback: None,
                },
            },
            other => Self::Runtime {
                message: other.to_string(),
                traceback: None,
            },
        }
    }

    /// Convert into an error the Lua runtime can raise and scripts can
    /// `pcall` around. The typed value survives the round trip.
    pub(crate) fn into_lua(self) -> mlua::Error {
        mlua::Error::external(self)
    }
}
