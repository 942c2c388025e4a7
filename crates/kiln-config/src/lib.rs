//! kiln configuration system
//!
//! Provides configuration management for kiln pipelines including:
//! - Pipeline manifests (kiln.toml)
//! - Global user configuration (~/.kiln/config.toml)
//! - Parameter overrides from the environment
//! - Configuration precedence and merging
//!
//! # Configuration Hierarchy
//!
//! Configuration is loaded and merged in the following order (later overrides earlier):
//! 1. Global config (~/.kiln/config.toml)
//! 2. Pipeline manifest (./kiln.toml)
//! 3. Environment variables (KILN_*)
//! 4. Caller-supplied overrides
//!
//! # Example
//!
//! ```no_run
//! use kiln_config::ConfigLoader;
//! use std::path::Path;
//!
//! let mut loader = ConfigLoader::new();
//! let config = loader.load_from_directory(Path::new(".")).unwrap();
//! println!("{} stages", config.manifest.stages.len());
//! ```

pub mod global;
pub mod loader;
pub mod manifest;

use std::path::PathBuf;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    NotFound(PathBuf),

    #[error("Failed to read configuration file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Invalid TOML syntax in {file}: {error}")]
    TomlParseError {
        file: PathBuf,
        error: toml::de::Error,
    },

    #[error("Invalid configuration: {0}")]
    ValidationError(String),

    #[error("Invalid value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Unknown repository '{repository}' referenced by stage '{stage}'")]
    UnknownRepository { stage: String, repository: String },

    #[error("Duplicate stage name '{0}'")]
    DuplicateStage(String),

    #[error("Home directory not found")]
    HomeNotFound,
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

// Re-export main types
pub use global::{BuildDefaults, GlobalConfig};
pub use loader::{Config, ConfigLoader};
pub use manifest::{
    ArtifactSpec, ImageSpec, ParameterDetail, ParameterLiteral, ParameterSpec, ParameterType,
    PipelineInfo, PipelineManifest, RepositorySpec, SourcePin, SourceSpec, StageSpec,
};

/// Name of the pipeline manifest file searched for by the loader
pub const MANIFEST_FILE: &str = "kiln.toml";

/// Check that a stage or parameter name is usable as an override key
///
/// Names are ASCII alphanumerics plus `-` and `_`; `.` is reserved for
/// stage-scoped override keys (`stage.param`).
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}
