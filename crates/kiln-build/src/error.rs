/// Build pipeline error types
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

pub type BuildResult<T> = Result<T, BuildError>;

/// Step of a stage's lifecycle, reported with every stage failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageStep {
    Instantiate,
    Setup,
    Fetch,
    Build,
    Extract,
}

impl fmt::Display for StageStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Instantiate => "instantiate",
            Self::Setup => "setup",
            Self::Fetch => "fetch",
            Self::Build => "build",
            Self::Extract => "extract",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("Unresolved parameter '{parameter}' referenced by {scope}")]
    UnresolvedParameter { scope: String, parameter: String },

    #[error("Invalid value for parameter '{parameter}': {reason}")]
    InvalidParameter { parameter: String, reason: String },

    #[error("Stage '{stage}' failed during {step}: {operation}: {reason}")]
    Setup {
        stage: String,
        step: StageStep,
        operation: String,
        reason: String,
    },

    #[error("Stage '{stage}' failed during fetch: {repository}@{revision}: {reason}")]
    SourceFetch {
        stage: String,
        repository: String,
        revision: String,
        reason: String,
    },

    #[error("Stage '{stage}' failed during build: {reason}")]
    Build { stage: String, reason: String },

    #[error("Stage '{stage}' failed during extract: pattern '{pattern}' matched no files")]
    ContractUnsatisfied { stage: String, pattern: String },

    #[error("Stages '{first}' and '{second}' both claim destination '{destination}'")]
    DestinationOverlap {
        first: String,
        second: String,
        destination: String,
    },

    #[error("Invalid image metadata for '{field}': {reason}")]
    Metadata { field: String, reason: String },

    #[error("Stage '{stage}' cancelled before {step} after a sibling stage failed")]
    Cancelled { stage: String, step: StageStep },

    #[error("Invalid pipeline definition: {0}")]
    InvalidDefinition(String),

    #[error("Refusing to replace {path}: it is not a published image (no image.json)")]
    OutputOccupied { path: PathBuf },

    #[error("Scheduler error: {0}")]
    Scheduler(String),

    #[error("I/O error at {path}: {error}")]
    IoError {
        path: PathBuf,
        error: std::io::Error,
    },

    #[error("Invalid image manifest at {path}: {error}")]
    ImageManifest {
        path: PathBuf,
        error: serde_json::Error,
    },

    #[error("Configuration error: {0}")]
    Config(#[from] kiln_config::ConfigError),
}

impl BuildError {
    /// Create an I/O error with path context
    pub fn io(path: impl Into<PathBuf>, error: std::io::Error) -> Self {
        Self::IoError {
            path: path.into(),
            error,
        }
    }

    /// Create a setup error for a stage
    pub fn setup(
        stage: impl Into<String>,
        operation: impl Into<String>,
        reason: impl ToString,
    ) -> Self {
        Self::Setup {
            stage: stage.into(),
            step: StageStep::Setup,
            operation: operation.into(),
            reason: reason.to_string(),
        }
    }

    /// Create a build error for a stage
    pub fn build(stage: impl Into<String>, reason: impl ToString) -> Self {
        Self::Build {
            stage: stage.into(),
            reason: reason.to_string(),
        }
    }

    /// Create a metadata error
    pub fn metadata(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Metadata {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Name of the stage this error is attributed to, if any
    pub fn stage(&self) -> Option<&str> {
        match self {
            Self::Setup { stage, .. }
            | Self::SourceFetch { stage, .. }
            | Self::Build { stage, .. }
            | Self::ContractUnsatisfied { stage, .. }
            | Self::Cancelled { stage, .. } => Some(stage),
            Self::DestinationOverlap { second, .. } => Some(second),
            _ => None,
        }
    }

    /// Lifecycle step that failed, if this is a stage error
    pub fn step(&self) -> Option<StageStep> {
        match self {
            Self::Setup { step, .. } | Self::Cancelled { step, .. } => Some(*step),
            Self::SourceFetch { .. } => Some(StageStep::Fetch),
            Self::Build { .. } => Some(StageStep::Build),
            Self::ContractUnsatisfied { .. } => Some(StageStep::Extract),
            _ => None,
        }
    }

    /// Whether this error only reflects a sibling's failure
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_error_carries_identity_and_step() {
        let err = BuildError::ContractUnsatisfied {
            stage: "ext-a".to_string(),
            pattern: "/usr/lib/libA*.so".to_string(),
        };
        assert_eq!(err.stage(), Some("ext-a"));
        assert_eq!(err.step(), Some(StageStep::Extract));
        assert_eq!(
            err.to_string(),
            "Stage 'ext-a' failed during extract: pattern '/usr/lib/libA*.so' matched no files"
        );
    }

    #[test]
    fn test_setup_error_display() {
        let err = BuildError::setup("ext-a", "install packages [gcc]", "exited with status 100");
        assert_eq!(err.step(), Some(StageStep::Setup));
        assert!(err.to_string().contains("failed during setup"));
        assert!(err.to_string().contains("install packages [gcc]"));
    }

    #[test]
    fn test_non_stage_errors() {
        let err = BuildError::metadata("user", "uid 0");
        assert_eq!(err.stage(), None);
        assert_eq!(err.step(), None);
        assert!(!err.is_cancellation());
    }
}
