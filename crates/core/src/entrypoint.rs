use serde::{Deserialize, Serialize};
use std::fmt;

/// Fixed `<interpreter> -m <module>` command, built once and never altered per instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntrypointCommand {
    interpreter: String,
    module: String,
}

impl EntrypointCommand {
    pub fn new(interpreter: impl Into<String>, module: impl Into<String>) -> Self {
        Self {
            interpreter: interpreter.into(),
            module: module.into(),
        }
    }

    pub fn interpreter(&self) -> &str {
        &self.interpreter
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn argv(&self) -> Vec<String> {
        vec![
            self.interpreter.clone(),
            "-m".to_string(),
            self.module.clone(),
        ]
    }
}

impl fmt::Display for EntrypointCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -m {}", self.interpreter, self.module)
    }
}

/// Dotted Python module path (`app.main`), each segment an identifier.
pub fn is_valid_module_name(module: &str) -> bool {
    !module.is_empty()
        && module.split('.').all(|segment| {
            let mut chars = segment.chars();
            matches!(chars.next(), Some(c) if c == '_' || c.is_ascii_alphabetic())
                && chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
        })
}
