use std::env;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;

const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_PLATFORM: &str = "linux/amd64";
const DEFAULT_RECIPE_FILE: &str = "pybox.yaml";
const DEFAULT_PULL_TIMEOUT_SECS: u64 = 300;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    #[error("Failed to parse {field}: {error}")]
    ParseError { field: String, error: String },
}

/// Process-level settings, read from `PYBOX_*` environment variables.
#[derive(Debug, Clone)]
pub struct PyboxConfig {
    pub cache_dir: PathBuf,
    pub log_level: String,
    pub platform: String,
    pub recipe_file: String,
    pub pull_timeout_secs: u64,
}

impl Default for PyboxConfig {
    fn default() -> Self {
        let cache_dir = env::var("PYBOX_CACHE_DIR")
            .ok()
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| env::temp_dir().join("pybox-cache"));

        let log_level = env::var("PYBOX_LOG_LEVEL")
            .unwrap_or_else(|_| DEFAULT_LOG_LEVEL.to_string())
            .to_lowercase();

        let platform =
            env::var("PYBOX_PLATFORM").unwrap_or_else(|_| DEFAULT_PLATFORM.to_string());

        let recipe_file =
            env::var("PYBOX_RECIPE").unwrap_or_else(|_| DEFAULT_RECIPE_FILE.to_string());

        let pull_timeout_secs = env_secs("PYBOX_PULL_TIMEOUT", DEFAULT_PULL_TIMEOUT_SECS);

        Self {
            cache_dir,
            log_level,
            platform,
            recipe_file,
            pull_timeout_secs,
        }
    }
}

/// Whole seconds from `name`; unset falls back silently, garbage falls back with a warning.
fn env_secs(name: &str, default: u64) -> u64 {
    match env::var(name) {
        Ok(raw) => raw.trim().parse::<u64>().unwrap_or_else(|_| {
            warn!(
                "Ignoring {}={:?}: expected whole seconds, using {}",
                name, raw, default
            );
            default
        }),
        Err(_) => default,
    }
}

impl PyboxConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.log_level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => {
                return Err(ConfigError::ValidationFailed(format!(
                    "Invalid log level: {}. Valid options: trace, debug, info, warn, error",
                    self.log_level
                )))
            }
        }

        let (os, arch) = self.platform_parts()?;
        if os != "linux" {
            return Err(ConfigError::ValidationFailed(format!(
                "Unsupported platform OS '{}': only linux images can be built",
                os
            )));
        }
        if arch.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "Platform architecture must not be empty".to_string(),
            ));
        }

        if self.recipe_file.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "Recipe file name must not be empty".to_string(),
            ));
        }

        if self.pull_timeout_secs == 0 {
            return Err(ConfigError::ValidationFailed(
                "Pull timeout must be at least 1 second".to_string(),
            ));
        }
        if self.pull_timeout_secs > 3600 {
            return Err(ConfigError::ValidationFailed(
                "Pull timeout cannot exceed 1 hour".to_string(),
            ));
        }

        Ok(())
    }

    /// `(os, architecture)` split of `platform`; a trailing variant is ignored.
    pub fn platform_parts(&self) -> Result<(&str, &str), ConfigError> {
        let mut parts = self.platform.split('/');
        match (parts.next(), parts.next()) {
            (Some(os), Some(arch)) if !os.is_empty() => Ok((os, arch)),
            _ => Err(ConfigError::ParseError {
                field: "PYBOX_PLATFORM".to_string(),
                error: format!("expected os/arch, got '{}'", self.platform),
            }),
        }
    }

    /// Recipe path for a build context: the configured file name resolved against it.
    pub fn recipe_path(&self, context_dir: &Path) -> PathBuf {
        let file = Path::new(&self.recipe_file);
        if file.is_absolute() {
            file.to_path_buf()
        } else {
            context_dir.join(file)
        }
    }

    pub fn project_dir(&self, project: &str) -> PathBuf {
        let safe_name = project.replace(['/', '\\', ':', '*', '?', '"', '<', '>', '|'], "_");
        self.cache_dir.join(safe_name)
    }

    pub fn ledger_path(&self, project: &str) -> PathBuf {
        self.project_dir(project).join("ledger.json")
    }

    pub fn to_display_map(&self) -> std::collections::HashMap<String, String> {
        let mut map = std::collections::HashMap::new();
        map.insert("cache_dir".to_string(), self.cache_dir.display().to_string());
        map.insert("log_level".to_string(), self.log_level.clone());
        map.insert("platform".to_string(), self.platform.clone());
        map.insert("recipe_file".to_string(), self.recipe_file.clone());
        map.insert(
            "pull_timeout_secs".to_string(),
            self.pull_timeout_secs.to_string(),
        );
        map
    }
}

impl fmt::Display for PyboxConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Pybox Configuration:")?;
        writeln!(f, "  Cache Dir: {}", self.cache_dir.display())?;
        writeln!(f, "  Log Level: {}", self.log_level)?;
        writeln!(f, "  Platform: {}", self.platform)?;
        writeln!(f, "  Recipe File: {}", self.recipe_file)?;
        writeln!(f, "  Pull Timeout: {}s", self.pull_timeout_secs)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    struct EnvGuard {
        key: String,
        old_value: Option<String>,
    }

    impl EnvGuard {
        fn set(key: &str, value: &str) -> Self {
            let old_value = env::var(key).ok();
            env::set_var(key, value);
            Self {
                key: key.to_string(),
                old_value,
            }
        }

        fn remove(key: &str) -> Self {
            let old_value = env::var(key).ok();
            env::remove_var(key);
            Self {
                key: key.to_string(),
                old_value,
            }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            match &self.old_value {
                Some(v) => env::set_var(&self.key, v),
                None => env::remove_var(&self.key),
            }
        }
    }

    fn base_config() -> PyboxConfig {
        PyboxConfig {
            cache_dir: PathBuf::from("/tmp/cache"),
            log_level: "info".to_string(),
            platform: "linux/amd64".to_string(),
            recipe_file: "pybox.yaml".to_string(),
            pull_timeout_secs: 300,
        }
    }

    #[test]
    #[serial]
    fn test_default_configuration() {
        let _guards = [
            EnvGuard::remove("PYBOX_CACHE_DIR"),
            EnvGuard::remove("PYBOX_LOG_LEVEL"),
            EnvGuard::remove("PYBOX_PLATFORM"),
            EnvGuard::remove("PYBOX_RECIPE"),
            EnvGuard::remove("PYBOX_PULL_TIMEOUT"),
        ];

        let config = PyboxConfig::default();

        assert_eq!(config.cache_dir, env::temp_dir().join("pybox-cache"));
        assert_eq!(config.log_level, DEFAULT_LOG_LEVEL);
        assert_eq!(config.platform, DEFAULT_PLATFORM);
        assert_eq!(config.recipe_file, DEFAULT_RECIPE_FILE);
        assert_eq!(config.pull_timeout_secs, DEFAULT_PULL_TIMEOUT_SECS);
        assert!(config.validate().is_ok());
    }

    #[test]
    #[serial]
    fn test_environment_variable_parsing() {
        let _guards = [
            EnvGuard::set("PYBOX_CACHE_DIR", "/var/cache/pybox"),
            EnvGuard::set("PYBOX_LOG_LEVEL", "DEBUG"),
            EnvGuard::set("PYBOX_PLATFORM", "linux/arm64"),
            EnvGuard::set("PYBOX_RECIPE", "build/pybox.toml"),
            EnvGuard::set("PYBOX_PULL_TIMEOUT", "60"),
        ];

        let config = PyboxConfig::default();

        assert_eq!(config.cache_dir, PathBuf::from("/var/cache/pybox"));
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.platform, "linux/arm64");
        assert_eq!(config.recipe_file, "build/pybox.toml");
        assert_eq!(config.pull_timeout_secs, 60);
    }

    #[test]
    #[serial]
    fn test_invalid_timeout_falls_back() {
        let _guard = EnvGuard::set("PYBOX_PULL_TIMEOUT", "soon");
        assert_eq!(
            PyboxConfig::default().pull_timeout_secs,
            DEFAULT_PULL_TIMEOUT_SECS
        );
        assert_eq!(env_secs("PYBOX_PULL_TIMEOUT", 42), 42);

        let _guard = EnvGuard::set("PYBOX_PULL_TIMEOUT", " 90 ");
        assert_eq!(PyboxConfig::default().pull_timeout_secs, 90);
    }

    #[test]
    fn test_validation_invalid_log_level() {
        let config = PyboxConfig {
            log_level: "loud".to_string(),
            ..base_config()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_platform() {
        let config = PyboxConfig {
            platform: "windows/amd64".to_string(),
            ..base_config()
        };
        assert!(config.validate().unwrap_err().to_string().contains("linux"));

        let config = PyboxConfig {
            platform: "amd64".to_string(),
            ..base_config()
        };
        assert!(config.validate().is_err());

        let config = PyboxConfig {
            platform: "linux/arm64/v8".to_string(),
            ..base_config()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_timeout_bounds() {
        let config = PyboxConfig {
            pull_timeout_secs: 0,
            ..base_config()
        };
        assert!(config.validate().is_err());

        let config = PyboxConfig {
            pull_timeout_secs: 7200,
            ..base_config()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_ledger_path_sanitizes_name() {
        let config = base_config();
        assert_eq!(
            config.ledger_path("site-checker"),
            PathBuf::from("/tmp/cache/site-checker/ledger.json")
        );
        assert_eq!(
            config.ledger_path("team/app:dev"),
            PathBuf::from("/tmp/cache/team_app_dev/ledger.json")
        );
    }

    #[test]
    fn test_recipe_path() {
        let config = base_config();
        assert_eq!(
            config.recipe_path(Path::new("/src/project")),
            PathBuf::from("/src/project/pybox.yaml")
        );

        let config = PyboxConfig {
            recipe_file: "/etc/pybox.yaml".to_string(),
            ..config
        };
        assert_eq!(
            config.recipe_path(Path::new("/src/project")),
            PathBuf::from("/etc/pybox.yaml")
        );
    }

    #[test]
    fn test_config_display() {
        let display = format!("{}", base_config());
        assert!(display.contains("Pybox Configuration:"));
        assert!(display.contains("Platform: linux/amd64"));
        assert_eq!(base_config().to_display_map().len(), 5);
    }
}
