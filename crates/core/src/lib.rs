pub mod config;
pub mod digest;
pub mod entrypoint;
pub mod env;
pub mod error;
pub mod image_ref;
pub mod manifest;
pub mod progress;
pub mod recipe;
pub mod source;

pub use config::{ConfigError, PyboxConfig};
pub use digest::Digest;
pub use entrypoint::EntrypointCommand;
pub use env::{EnvironmentSet, InterpreterOptions};
pub use error::{BuildError, ErrorKind};
pub use image_ref::{ImageRefError, ImageReference};
pub use manifest::{DependencyManifest, Requirement};
pub use progress::{LoggingHandler, NoOpHandler, ProgressEvent, ProgressHandler};
pub use recipe::{PackageManager, Recipe, RecipeError};
pub use source::{SourceEntry, SourceTree};
