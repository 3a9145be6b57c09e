//! Engine configuration.

use serde::{Deserialize, Serialize};

use crate::transform::{to_camel_case, to_snake_case};

/// How host member names are rewritten when a type is exposed to scripts.
///
/// Applied independently to field names and method names via
/// [`EngineOptions::field_casing`] and [`EngineOptions::method_casing`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NamingConvention {
    /// Register each member under both its snake_case and its unchanged
    /// name (`GetName` becomes `get_name` *and* `GetName`).
    DualCase,
    /// snake_case only (default).
    Snake,
    /// Unchanged, as written on the host type.
    Pascal,
    /// camelCase only.
    Camel,
}

impl NamingConvention {
    /// All script-visible names for a host member under this convention.
    pub fn apply(&self, name: &str) -> Vec<String> {
        match self {
            Self::DualCase => {
                let snake = to_snake_case(name);
                if snake == name {
                    vec![snake]
                } else {
                    vec![snake, name.to_string()]
                }
            }
            Self::Snake => vec![to_snake_case(name)],
            Self::Pascal => vec![name.to_string()],
            Self::Camel => vec![to_camel_case(name)],
        }
    }
}

/// Configuration for [`Engine::open`](crate::Engine::open).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineOptions {
    /// Load the full (safe) standard library instead of the minimal subset.
    /// Leave off when scripts are untrusted.
    pub open_libs: bool,
    /// Casing applied to exposed field names of registered host types.
    pub field_casing: NamingConvention,
    /// Casing applied to exposed method names of registered host types.
    pub method_casing: NamingConvention,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            open_libs: false,
            field_casing: NamingConvention::Snake,
            method_casing: NamingConvention::Snake,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sandboxed_snake_case() {
        let opts = EngineOptions::default();
        assert!(!opts.open_libs);
        assert_eq!(opts.field_casing, NamingConvention::Snake);
        assert_eq!(opts.method_casing, NamingConvention::Snake);
    }

    #[test]
    fn dual_case_registers_both_names() {
        let names = NamingConvention::DualCase.apply("GetName");
        assert_eq!(names, vec!["get_name".to_string(), "GetName".to_string()]);
    }

    #[test]
    fn dual_case_collapses_identical_names() {
        let names = NamingConvention::DualCase.apply("value");
        assert_eq!(names, vec!["value".to_string()]);
    }

    #[test]
    fn options_deserialize_from_json() {
        let opts: EngineOptions = serde_json::from_str(
            r#"{ "open_libs": true, "field_casing": "dual_case", "method_casing": "camel" }"#,
        )
        .unwrap();
        assert!(opts.open_libs);
        assert_eq!(opts.field_casing, NamingConvention::DualCase);
        assert_eq!(opts.method_casing, NamingConvention::Camel);
    }

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let opts: EngineOptions = serde_json::from_str("{}").unwrap();
        assert!(!opts.open_libs);
        assert_eq!(opts.field_casing, NamingConvention::Snake);
    }
}
