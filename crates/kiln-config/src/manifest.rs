//! Pipeline Manifest (kiln.toml)
//!
//! Declares the parameters, stages, artifact rules and final image of a
//! pipeline. This module only parses and validates the document; turning it
//! into an executable pipeline is the build crate's job.

use crate::loader::param_env_var;
use crate::{is_valid_name, ConfigError, ConfigResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::Path;

/// Pipeline manifest from kiln.toml
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct PipelineManifest {
    /// Pipeline metadata
    pub pipeline: PipelineInfo,

    /// Global parameters
    #[serde(default)]
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, ParameterSpec>,

    /// Package repositories, registered by the stages that reference them
    #[serde(default)]
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub repositories: BTreeMap<String, RepositorySpec>,

    /// Build stages
    #[serde(default)]
    pub stages: Vec<StageSpec>,

    /// Final image
    pub image: ImageSpec,
}

/// Pipeline metadata
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct PipelineInfo {
    /// Pipeline name
    pub name: String,

    /// Pipeline description
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Declared type of a parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ParameterType {
    #[default]
    String,
    Integer,
    Bool,
}

impl fmt::Display for ParameterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String => write!(f, "string"),
            Self::Integer => write!(f, "integer"),
            Self::Bool => write!(f, "bool"),
        }
    }
}

/// A literal parameter value as written in TOML
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ParameterLiteral {
    Bool(bool),
    Integer(i64),
    String(String),
}

impl ParameterLiteral {
    /// Type implied by the literal
    pub fn implied_type(&self) -> ParameterType {
        match self {
            Self::Bool(_) => ParameterType::Bool,
            Self::Integer(_) => ParameterType::Integer,
            Self::String(_) => ParameterType::String,
        }
    }
}

impl fmt::Display for ParameterLiteral {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{}", b),
            Self::Integer(i) => write!(f, "{}", i),
            Self::String(s) => write!(f, "{}", s),
        }
    }
}

/// Parameter declaration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ParameterSpec {
    /// Shorthand: the default value (e.g., `pg_major = 17`)
    Literal(ParameterLiteral),

    /// Detailed declaration
    Detailed(ParameterDetail),
}

/// Table form of a parameter declaration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct ParameterDetail {
    /// Default value; without one the caller must supply an override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<ParameterLiteral>,

    /// Declared type (inferred from the default when omitted)
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<ParameterType>,

    /// Human-readable description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl ParameterSpec {
    /// Default value rendered as a string
    pub fn default_value(&self) -> Option<String> {
        match self {
            Self::Literal(lit) => Some(lit.to_string()),
            Self::Detailed(detail) => detail.default.as_ref().map(|d| d.to_string()),
        }
    }

    /// Declared type, falling back to the default's type, then to string
    pub fn kind(&self) -> ParameterType {
        match self {
            Self::Literal(lit) => lit.implied_type(),
            Self::Detailed(detail) => detail
                .kind
                .or_else(|| detail.default.as_ref().map(|d| d.implied_type()))
                .unwrap_or_default(),
        }
    }
}

/// Package repository registration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct RepositorySpec {
    /// Repository URL
    pub url: String,

    /// Signing key URL or fingerprint
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signing_key: Option<String>,
}

/// Build stage declaration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct StageSpec {
    /// Stage name
    pub name: String,

    /// Base environment reference (e.g., "debian:bookworm-slim")
    pub base: String,

    /// Repositories registered before packages are installed
    #[serde(default)]
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub repositories: Vec<String>,

    /// Packages installed into the stage
    #[serde(default)]
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub packages: Vec<String>,

    /// Additional setup commands, run after package installation
    #[serde(default)]
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub setup: Vec<String>,

    /// Source reference
    pub source: SourceSpec,

    /// Stage-scoped parameters
    #[serde(default)]
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, ParameterSpec>,

    /// Environment bindings for the build command
    #[serde(default)]
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,

    /// Build command
    pub build: String,

    /// Artifact contract
    #[serde(default)]
    pub artifacts: Vec<ArtifactSpec>,
}

/// Source reference declaration
///
/// Either `repository` + `revision` (an exact pin) or `index` + `package`
/// (whatever the index currently serves).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct SourceSpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub index: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub package: Option<String>,
}

/// Validated form of a [`SourceSpec`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourcePin {
    Revision { repository: String, revision: String },
    Index { index: String, package: String },
}

impl SourceSpec {
    /// Classify the source declaration, rejecting mixed or partial forms
    pub fn pin(&self, stage: &str) -> ConfigResult<SourcePin> {
        let field = format!("stages.{}.source", stage);
        match (
            &self.repository,
            &self.revision,
            &self.index,
            &self.package,
        ) {
            (Some(repository), Some(revision), None, None) => {
                if repository.is_empty() || revision.is_empty() {
                    return Err(ConfigError::InvalidValue {
                        field,
                        reason: "repository and revision cannot be empty".to_string(),
                    });
                }
                Ok(SourcePin::Revision {
                    repository: repository.clone(),
                    revision: revision.clone(),
                })
            }
            (None, None, Some(index), Some(package)) => {
                if index.is_empty() || package.is_empty() {
                    return Err(ConfigError::InvalidValue {
                        field,
                        reason: "index and package cannot be empty".to_string(),
                    });
                }
                Ok(SourcePin::Index {
                    index: index.clone(),
                    package: package.clone(),
                })
            }
            (Some(_), None, None, None) => Err(ConfigError::InvalidValue {
                field,
                reason: "a repository source must pin a revision".to_string(),
            }),
            _ => Err(ConfigError::InvalidValue {
                field,
                reason: "specify either repository + revision or index + package".to_string(),
            }),
        }
    }
}

/// Artifact rule: files matching `from` in the stage are copied into `to`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ArtifactSpec {
    /// Glob pattern inside the stage filesystem
    pub from: String,

    /// Destination directory inside the final image
    pub to: String,
}

/// Final image declaration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ImageSpec {
    /// Base runtime reference
    pub base: String,

    /// Numeric user the image runs as
    pub user: u32,

    /// Numeric group (defaults to the user id)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<u32>,

    /// Descriptive labels
    #[serde(default)]
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

impl PipelineManifest {
    /// Load a manifest from a file
    pub fn load_from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::NotFound(path.to_path_buf())
            } else {
                ConfigError::IoError(e)
            }
        })?;

        let manifest: Self = toml::from_str(&content).map_err(|e| ConfigError::TomlParseError {
            file: path.to_path_buf(),
            error: e,
        })?;

        manifest.validate()?;
        Ok(manifest)
    }

    /// Parse and validate a manifest from a string
    pub fn parse(content: &str) -> ConfigResult<Self> {
        let manifest: Self = toml::from_str(content).map_err(|e| ConfigError::TomlParseError {
            file: crate::MANIFEST_FILE.into(),
            error: e,
        })?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Validate the manifest
    pub fn validate(&self) -> ConfigResult<()> {
        if self.pipeline.name.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "pipeline.name".to_string(),
                reason: "name cannot be empty".to_string(),
            });
        }

        for name in self.parameters.keys() {
            validate_parameter_name("parameters", name)?;
        }

        for (name, repo) in &self.repositories {
            if repo.url.is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: format!("repositories.{}.url", name),
                    reason: "url cannot be empty".to_string(),
                });
            }
        }

        if self.stages.is_empty() {
            return Err(ConfigError::ValidationError(
                "pipeline declares no stages".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for stage in &self.stages {
            if !is_valid_name(&stage.name) {
                return Err(ConfigError::InvalidValue {
                    field: "stages.name".to_string(),
                    reason: format!("invalid stage name '{}'", stage.name),
                });
            }
            if !seen.insert(stage.name.as_str()) {
                return Err(ConfigError::DuplicateStage(stage.name.clone()));
            }
            self.validate_stage(stage)?;
        }

        self.validate_parameter_env_vars()?;

        if self.image.base.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "image.base".to_string(),
                reason: "base cannot be empty".to_string(),
            });
        }

        Ok(())
    }

    fn validate_stage(&self, stage: &StageSpec) -> ConfigResult<()> {
        if stage.base.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: format!("stages.{}.base", stage.name),
                reason: "base cannot be empty".to_string(),
            });
        }

        for repo in &stage.repositories {
            if !self.repositories.contains_key(repo) {
                return Err(ConfigError::UnknownRepository {
                    stage: stage.name.clone(),
                    repository: repo.clone(),
                });
            }
        }

        stage.source.pin(&stage.name)?;

        for name in stage.parameters.keys() {
            validate_parameter_name(&format!("stages.{}.parameters", stage.name), name)?;
        }

        if stage.build.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: format!("stages.{}.build", stage.name),
                reason: "build command cannot be empty".to_string(),
            });
        }

        if stage.artifacts.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: format!("stages.{}.artifacts", stage.name),
                reason: "a stage must declare at least one artifact".to_string(),
            });
        }

        for artifact in &stage.artifacts {
            if artifact.from.is_empty() || artifact.to.is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: format!("stages.{}.artifacts", stage.name),
                    reason: "artifact 'from' and 'to' cannot be empty".to_string(),
                });
            }
        }

        Ok(())
    }

    /// Reject parameters whose override environment variables coincide
    ///
    /// Global names are visible to every stage and stage names only to
    /// their own stage, so two names clash when they are visible together
    /// and map to the same `KILN_PARAM_*` variable. Full override keys
    /// (`stage.name`) must also map to distinct variables.
    fn validate_parameter_env_vars(&self) -> ConfigResult<()> {
        let mut keys: BTreeMap<String, String> = BTreeMap::new();
        let mut claim = |key: String| -> ConfigResult<()> {
            let var = param_env_var(&key);
            match keys.get(&var) {
                Some(other) => Err(env_var_clash(other, &key, &var)),
                None => {
                    keys.insert(var, key);
                    Ok(())
                }
            }
        };
        for name in self.parameters.keys() {
            claim(name.clone())?;
        }
        for stage in &self.stages {
            for name in stage.parameters.keys() {
                claim(format!("{}.{}", stage.name, name))?;
            }
        }

        let globals: BTreeMap<String, &String> = self
            .parameters
            .keys()
            .map(|name| (param_env_var(name), name))
            .collect();
        for stage in &self.stages {
            let mut visible = globals.clone();
            for name in stage.parameters.keys() {
                let var = param_env_var(name);
                if let Some(other) = visible.get(&var) {
                    if *other != name {
                        return Err(env_var_clash(other, name, &var));
                    }
                }
                visible.insert(var, name);
            }
        }
        Ok(())
    }

    /// Look up a stage by name
    pub fn stage(&self, name: &str) -> Option<&StageSpec> {
        self.stages.iter().find(|s| s.name == name)
    }
}

fn env_var_clash(a: &str, b: &str, var: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: "parameters".to_string(),
        reason: format!("parameters '{}' and '{}' both map to {}", a, b, var),
    }
}

fn validate_parameter_name(section: &str, name: &str) -> ConfigResult<()> {
    if is_valid_name(name) {
        Ok(())
    } else {
        Err(ConfigError::InvalidValue {
            field: section.to_string(),
            reason: format!("invalid parameter name '{}'", name),
        })
    }
}
