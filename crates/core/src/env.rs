//! The build-time-fixed environment of the packaged process.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Interpreter variable that stops `.pyc` files from being written next to sources.
pub const DISABLE_BYTECODE_CACHE_VAR: &str = "PYTHONDONTWRITEBYTECODE";
/// Interpreter variable that makes stdout/stderr unbuffered.
pub const FORCE_UNBUFFERED_OUTPUT_VAR: &str = "PYTHONUNBUFFERED";

/// Names the recipe's free-form `env` table may not redefine.
pub const RESERVED_VARS: &[&str] = &[DISABLE_BYTECODE_CACHE_VAR, FORCE_UNBUFFERED_OUTPUT_VAR];

fn default_true() -> bool {
    true
}

/// Interpreter behaviour switches, both on by default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterpreterOptions {
    #[serde(default = "default_true")]
    pub disable_bytecode_cache: bool,
    #[serde(default = "default_true")]
    pub force_unbuffered_output: bool,
}

impl Default for InterpreterOptions {
    fn default() -> Self {
        Self {
            disable_bytecode_cache: true,
            force_unbuffered_output: true,
        }
    }
}

/// Immutable name → value mapping applied to every execution of the image.
///
/// Ordered so that the rendered `K=V` list, and everything hashed from it, is stable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EnvironmentSet {
    vars: BTreeMap<String, String>,
}

impl EnvironmentSet {
    pub fn new(options: InterpreterOptions, extra: &BTreeMap<String, String>) -> Self {
        let mut vars = extra.clone();
        if options.disable_bytecode_cache {
            vars.insert(DISABLE_BYTECODE_CACHE_VAR.to_string(), "1".to_string());
        }
        if options.force_unbuffered_output {
            vars.insert(FORCE_UNBUFFERED_OUTPUT_VAR.to_string(), "1".to_string());
        }
        Self { vars }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// `K=V` pairs sorted by name, as container configs expect them.
    pub fn to_env_list(&self) -> Vec<String> {
        self.vars
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect()
    }
}

/// Valid POSIX-style variable name.
pub fn is_valid_var_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c == '_' || c.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_enable_both_switches() {
        let env = EnvironmentSet::new(InterpreterOptions::default(), &BTreeMap::new());
        assert_eq!(env.get(DISABLE_BYTECODE_CACHE_VAR), Some("1"));
        assert_eq!(env.get(FORCE_UNBUFFERED_OUTPUT_VAR), Some("1"));
        assert_eq!(
            env.to_env_list(),
            vec!["PYTHONDONTWRITEBYTECODE=1", "PYTHONUNBUFFERED=1"]
        );
    }

    #[test]
    fn test_switches_off() {
        let options = InterpreterOptions {
            disable_bytecode_cache: false,
            force_unbuffered_output: false,
        };
        let env = EnvironmentSet::new(options, &BTreeMap::new());
        assert!(env.is_empty());
    }

    #[test]
    fn test_extra_vars_sorted() {
        let mut extra = BTreeMap::new();
        extra.insert("TZ".to_string(), "UTC".to_string());
        extra.insert("APP_MODE".to_string(), "prod".to_string());

        let env = EnvironmentSet::new(InterpreterOptions::default(), &extra);
        assert_eq!(env.len(), 4);
        assert_eq!(
            env.to_env_list(),
            vec![
                "APP_MODE=prod",
                "PYTHONDONTWRITEBYTECODE=1",
                "PYTHONUNBUFFERED=1",
                "TZ=UTC"
            ]
        );
    }

    #[test]
    fn test_var_names() {
        assert!(is_valid_var_name("PYTHONPATH"));
        assert!(is_valid_var_name("_private"));
        assert!(is_valid_var_name("A1"));
        assert!(!is_valid_var_name("1A"));
        assert!(!is_valid_var_name("WITH-DASH"));
        assert!(!is_valid_var_name(""));
    }

    #[test]
    fn test_interpreter_options_missing_fields_default_on() {
        let options: InterpreterOptions = serde_yaml::from_str("{}").unwrap();
        assert_eq!(options, InterpreterOptions::default());
    }
}
