//! Build recipe: the declarative description of one packaged Python process.
//!
//! Every field has a default matching the stock layout (pinned slim Python base with CA
//! certificates, `/app` working directory, `requirements.txt` installed before `app/` is
//! copied, `python -m app.main` as entrypoint), so an empty recipe file is valid.

use crate::entrypoint::{is_valid_module_name, EntrypointCommand};
use crate::env::{is_valid_var_name, EnvironmentSet, InterpreterOptions, RESERVED_VARS};
use crate::image_ref::{ImageRefError, ImageReference};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

const DEFAULT_BASE_IMAGE: &str = "python:3.12-slim";
const DEFAULT_WORKDIR: &str = "/app";
const DEFAULT_MANIFEST: &str = "requirements.txt";
const DEFAULT_SOURCE: &str = "app";
const DEFAULT_INTERPRETER: &str = "python";
const DEFAULT_MODULE: &str = "app.main";
const DEFAULT_VOLUME: &str = "/logs";
/// OS package carrying the CA trust store; every base must install it.
const TRUST_PACKAGE: &str = "ca-certificates";

#[derive(Debug, Error)]
pub enum RecipeError {
    #[error("Failed to read recipe {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse recipe {}: {message}", path.display())]
    Parse { path: PathBuf, message: String },

    #[error(transparent)]
    Image(#[from] ImageRefError),

    #[error("Invalid field '{field}': {message}")]
    InvalidField { field: String, message: String },
}

impl RecipeError {
    fn field(field: &str, message: impl Into<String>) -> Self {
        RecipeError::InvalidField {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

fn deserialize_null_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::deserialize(deserializer)?.unwrap_or_default())
}

fn default_version() -> String {
    "1.0".to_string()
}

fn default_workdir() -> String {
    DEFAULT_WORKDIR.to_string()
}

fn default_volumes() -> Vec<String> {
    vec![DEFAULT_VOLUME.to_string()]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageManager {
    Apt,
    Apk,
}

impl PackageManager {
    /// Shell argv installing `packages` without leaving package indexes behind.
    pub fn install_command(&self, packages: &[String]) -> Vec<String> {
        let mut sorted = packages.to_vec();
        sorted.sort();
        sorted.dedup();
        let list = sorted.join(" ");

        let script = match self {
            PackageManager::Apt => format!(
                "apt-get update && apt-get install -y --no-install-recommends {} && rm -rf /var/lib/apt/lists/*",
                list
            ),
            PackageManager::Apk => format!("apk add --no-cache {}", list),
        };
        vec!["/bin/sh".to_string(), "-c".to_string(), script]
    }
}

impl fmt::Display for PackageManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PackageManager::Apt => write!(f, "apt"),
            PackageManager::Apk => write!(f, "apk"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaseSpec {
    #[serde(default = "BaseSpec::default_image")]
    pub image: String,
    #[serde(default = "BaseSpec::default_packages")]
    pub packages: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package_manager: Option<PackageManager>,
}

impl BaseSpec {
    fn default_image() -> String {
        DEFAULT_BASE_IMAGE.to_string()
    }

    fn default_packages() -> Vec<String> {
        vec![TRUST_PACKAGE.to_string()]
    }
}

impl Default for BaseSpec {
    fn default() -> Self {
        Self {
            image: Self::default_image(),
            packages: Self::default_packages(),
            package_manager: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencySpec {
    #[serde(default = "DependencySpec::default_manifest")]
    pub manifest: String,
    #[serde(default = "DependencySpec::default_install")]
    pub install: Vec<String>,
}

impl DependencySpec {
    fn default_manifest() -> String {
        DEFAULT_MANIFEST.to_string()
    }

    fn default_install() -> Vec<String> {
        ["pip", "install", "--no-cache-dir", "-r"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }
}

impl Default for DependencySpec {
    fn default() -> Self {
        Self {
            manifest: Self::default_manifest(),
            install: Self::default_install(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSpec {
    #[serde(default = "SourceSpec::default_path")]
    pub path: String,
    #[serde(default = "SourceSpec::default_path")]
    pub dest: String,
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub exclude: Vec<String>,
}

impl SourceSpec {
    fn default_path() -> String {
        DEFAULT_SOURCE.to_string()
    }
}

impl Default for SourceSpec {
    fn default() -> Self {
        Self {
            path: Self::default_path(),
            dest: Self::default_path(),
            exclude: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntrypointSpec {
    #[serde(default = "EntrypointSpec::default_interpreter")]
    pub interpreter: String,
    #[serde(default = "EntrypointSpec::default_module")]
    pub module: String,
}

impl EntrypointSpec {
    fn default_interpreter() -> String {
        DEFAULT_INTERPRETER.to_string()
    }

    fn default_module() -> String {
        DEFAULT_MODULE.to_string()
    }
}

impl Default for EntrypointSpec {
    fn default() -> Self {
        Self {
            interpreter: Self::default_interpreter(),
            module: Self::default_module(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipe {
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub base: BaseSpec,
    #[serde(default = "default_workdir")]
    pub workdir: String,
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub interpreter: InterpreterOptions,
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub env: BTreeMap<String, String>,
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub dependencies: DependencySpec,
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub source: SourceSpec,
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub entrypoint: EntrypointSpec,
    #[serde(default = "default_volumes")]
    pub volumes: Vec<String>,
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub labels: BTreeMap<String, String>,
}

impl Default for Recipe {
    fn default() -> Self {
        Self {
            version: default_version(),
            name: None,
            base: BaseSpec::default(),
            workdir: default_workdir(),
            interpreter: InterpreterOptions::default(),
            env: BTreeMap::new(),
            dependencies: DependencySpec::default(),
            source: SourceSpec::default(),
            entrypoint: EntrypointSpec::default(),
            volumes: default_volumes(),
            labels: BTreeMap::new(),
        }
    }
}

impl Recipe {
    /// Load from a `.yaml`/`.yml` or `.toml` file.
    pub fn load(path: &Path) -> Result<Self, RecipeError> {
        let content = std::fs::read_to_string(path).map_err(|source| RecipeError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let is_toml = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("toml"))
            .unwrap_or(false);

        let parsed = if is_toml {
            Self::from_toml_str(&content)
        } else {
            Self::from_yaml_str(&content)
        };

        parsed.map_err(|message| RecipeError::Parse {
            path: path.to_path_buf(),
            message,
        })
    }

    pub fn from_yaml_str(content: &str) -> Result<Self, String> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(content).map_err(|e| e.to_string())
    }

    pub fn from_toml_str(content: &str) -> Result<Self, String> {
        toml::from_str(content).map_err(|e| e.to_string())
    }

    pub fn to_yaml(&self) -> anyhow::Result<String> {
        use anyhow::Context;
        serde_yaml::to_string(self).context("Failed to serialize recipe to YAML")
    }

    pub fn validate(&self) -> Result<(), RecipeError> {
        self.base_image()?.require_pinned()?;

        if self.base.packages.iter().any(|p| p.trim().is_empty()) {
            return Err(RecipeError::field("base.packages", "empty package name"));
        }
        if let Some(bad) = self
            .base
            .packages
            .iter()
            .find(|p| p.chars().any(|c| c.is_whitespace() || ";&|`$".contains(c)))
        {
            return Err(RecipeError::field(
                "base.packages",
                format!("'{}' is not a package name", bad),
            ));
        }

        if !self.base.packages.iter().any(|p| p == TRUST_PACKAGE) {
            return Err(RecipeError::field(
                "base.packages",
                format!("must include {} (the CA trust store)", TRUST_PACKAGE),
            ));
        }

        validate_absolute("workdir", &self.workdir)?;
        validate_relative("dependencies.manifest", &self.dependencies.manifest)?;
        validate_relative("source.path", &self.source.path)?;
        validate_relative("source.dest", &self.source.dest)?;

        if self.dependencies.install.is_empty()
            || self.dependencies.install.iter().any(|a| a.is_empty())
        {
            return Err(RecipeError::field(
                "dependencies.install",
                "installer command must be a non-empty argv",
            ));
        }

        for name in self.env.keys() {
            if !is_valid_var_name(name) {
                return Err(RecipeError::field(
                    "env",
                    format!("'{}' is not a valid variable name", name),
                ));
            }
            if RESERVED_VARS.contains(&name.as_str()) {
                return Err(RecipeError::field(
                    "env",
                    format!("'{}' is controlled by the interpreter options", name),
                ));
            }
        }

        if self.entrypoint.interpreter.trim().is_empty() {
            return Err(RecipeError::field(
                "entrypoint.interpreter",
                "interpreter must not be empty",
            ));
        }
        if !is_valid_module_name(&self.entrypoint.module) {
            return Err(RecipeError::field(
                "entrypoint.module",
                format!("'{}' is not a dotted module path", self.entrypoint.module),
            ));
        }

        for volume in &self.volumes {
            validate_absolute("volumes", volume)?;
        }

        if self.labels.keys().any(|k| k.trim().is_empty()) {
            return Err(RecipeError::field("labels", "label keys must not be empty"));
        }

        if let Some(name) = &self.name {
            if sanitize_project_name(name).is_empty() {
                return Err(RecipeError::field("name", "name has no usable characters"));
            }
        }

        Ok(())
    }

    pub fn base_image(&self) -> Result<ImageReference, RecipeError> {
        Ok(ImageReference::parse(&self.base.image)?)
    }

    pub fn package_manager(&self) -> PackageManager {
        if let Some(pm) = self.base.package_manager {
            return pm;
        }
        match ImageReference::parse(&self.base.image) {
            Ok(image) if image.is_alpine() => PackageManager::Apk,
            _ => PackageManager::Apt,
        }
    }

    pub fn environment(&self) -> EnvironmentSet {
        EnvironmentSet::new(self.interpreter, &self.env)
    }

    pub fn entrypoint_command(&self) -> EntrypointCommand {
        EntrypointCommand::new(&self.entrypoint.interpreter, &self.entrypoint.module)
    }

    /// File name the manifest gets inside the working directory.
    pub fn manifest_file_name(&self) -> String {
        Path::new(&self.dependencies.manifest)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.dependencies.manifest.clone())
    }

    /// Absolute in-image path of the copied manifest.
    pub fn manifest_dest(&self) -> String {
        join_image_path(&self.workdir, &self.manifest_file_name())
    }

    /// Absolute in-image path receiving the source tree.
    pub fn source_dest(&self) -> String {
        join_image_path(&self.workdir, &self.source.dest)
    }

    /// Host directory laid out like the image workdir, with the source tree at `source.dest`
    /// below it. `None` when `source.path` does not end with `source.dest`.
    pub fn host_workdir(&self, context_dir: &Path) -> Option<PathBuf> {
        let path = normal_components(&self.source.path);
        let dest = normal_components(&self.source.dest);
        if !path.ends_with(&dest) {
            return None;
        }
        let mut dir = context_dir.to_path_buf();
        dir.extend(&path[..path.len() - dest.len()]);
        Some(dir)
    }

    /// Full installer argv, manifest file name appended.
    pub fn install_command(&self) -> Vec<String> {
        let mut argv = self.dependencies.install.clone();
        argv.push(self.manifest_file_name());
        argv
    }

    /// Explicit `name`, else the context directory's name; sanitized for image tags.
    pub fn project_name(&self, context_dir: &Path) -> String {
        let raw = self.name.clone().unwrap_or_else(|| {
            context_dir
                .canonicalize()
                .ok()
                .as_deref()
                .unwrap_or(context_dir)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default()
        });
        let name = sanitize_project_name(&raw);
        if name.is_empty() {
            "app".to_string()
        } else {
            name
        }
    }
}

impl fmt::Display for Recipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_yaml() {
            Ok(yaml) => write!(f, "{}", yaml),
            Err(e) => write!(f, "Error formatting recipe: {}", e),
        }
    }
}

/// Join an absolute image directory with a relative path using `/` separators.
pub fn join_image_path(dir: &str, rel: &str) -> String {
    let rel = rel.trim_start_matches("./").trim_end_matches('/');
    if rel.is_empty() || rel == "." {
        return dir.to_string();
    }
    if dir.ends_with('/') {
        format!("{}{}", dir, rel)
    } else {
        format!("{}/{}", dir, rel)
    }
}

fn sanitize_project_name(raw: &str) -> String {
    let lowered: String = raw
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect();
    lowered
        .trim_matches(|c: char| !c.is_ascii_alphanumeric())
        .to_string()
}

fn validate_absolute(field: &str, value: &str) -> Result<(), RecipeError> {
    let path = Path::new(value);
    if !path.is_absolute() {
        return Err(RecipeError::field(
            field,
            format!("'{}' must be an absolute path", value),
        ));
    }
    if path.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(RecipeError::field(
            field,
            format!("'{}' must not contain '..'", value),
        ));
    }
    Ok(())
}

fn normal_components(value: &str) -> Vec<&std::ffi::OsStr> {
    Path::new(value)
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part),
            _ => None,
        })
        .collect()
}

fn validate_relative(field: &str, value: &str) -> Result<(), RecipeError> {
    let path = Path::new(value);
    if value.trim().is_empty() {
        return Err(RecipeError::field(field, "path must not be empty"));
    }
    if path.is_absolute() {
        return Err(RecipeError::field(
            field,
            format!("'{}' must be relative to the build context", value),
        ));
    }
    if path.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(RecipeError::field(
            field,
            format!("'{}' must not contain '..'", value),
        ));
    }
    Ok(())
}
