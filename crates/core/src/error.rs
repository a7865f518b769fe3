use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Coarse classification of a build failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    /// The recipe itself is unusable (unpinned base, bad paths, ...)
    Configuration,
    /// The base image or a declared dependency cannot be located or installed
    Resolution,
    /// The manifest or source tree is missing, unreadable or malformed
    Input,
    /// The build engine failed for reasons outside the inputs
    Backend,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Configuration => "configuration",
            ErrorKind::Resolution => "resolution",
            ErrorKind::Input => "input",
            ErrorKind::Backend => "backend",
        };
        write!(f, "{}", name)
    }
}

/// Every way an image build can fail. All variants are fatal for the build.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("Invalid recipe: {0}")]
    InvalidRecipe(#[from] crate::recipe::RecipeError),

    #[error("Base image {reference} could not be resolved: {message}")]
    BaseImageUnresolvable { reference: String, message: String },

    #[error("Dependency installation failed: {message}")]
    DependencyInstall { message: String },

    #[error("Dependency manifest not found: {}", path.display())]
    ManifestMissing { path: PathBuf },

    #[error("Dependency manifest {} is malformed at line {line}: {message}", path.display())]
    ManifestMalformed {
        path: PathBuf,
        line: usize,
        message: String,
    },

    #[error("Application source tree {} is unreadable: {message}", path.display())]
    SourceUnreadable { path: PathBuf, message: String },

    #[error("Application source tree {} contains no files", path.display())]
    SourceEmpty { path: PathBuf },

    #[error("Build backend error: {0}")]
    Backend(String),

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl BuildError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BuildError::InvalidRecipe(_) => ErrorKind::Configuration,
            BuildError::BaseImageUnresolvable { .. } | BuildError::DependencyInstall { .. } => {
                ErrorKind::Resolution
            }
            BuildError::ManifestMissing { .. }
            | BuildError::ManifestMalformed { .. }
            | BuildError::SourceUnreadable { .. }
            | BuildError::SourceEmpty { .. } => ErrorKind::Input,
            BuildError::Backend(_) | BuildError::Io { .. } => ErrorKind::Backend,
        }
    }

    pub fn backend(err: impl fmt::Display) -> Self {
        BuildError::Backend(err.to_string())
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        BuildError::Io {
            path: path.into(),
            source,
        }
    }
}
