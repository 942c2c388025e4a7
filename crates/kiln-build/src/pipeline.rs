//! Pipeline definitions and resolution
//!
//! A [`Pipeline`] is the in-memory form of a `kiln.toml` manifest: declared
//! parameters, stage definitions and the final image definition. Resolving
//! it once per run produces a [`ResolvedPipeline`] in which every stage and
//! the image metadata are concrete.

use crate::assembler::ImageMetadata;
use crate::contract::check_disjoint;
use crate::error::{BuildError, BuildResult};
use crate::graph::ExecutionGraph;
use crate::params::{ParameterDecl, ParameterScope, ParameterSet, ResolvedParameters};
use crate::runner::PROVENANCE_LABEL_PREFIX;
use crate::stage::{ResolvedStage, SetupOperation, SourceRef, StageDefinition};
use kiln_config::{PipelineManifest, SourcePin};
use std::collections::{BTreeMap, HashSet};
use tracing::debug;

/// Final image as declared; labels may reference global parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageDefinition {
    /// Runtime base reference
    pub base: String,
    pub user: u32,
    /// Defaults to `user`
    pub group: Option<u32>,
    pub labels: BTreeMap<String, String>,
}

impl ImageDefinition {
    /// Create an image definition running as `user`
    pub fn new(base: impl Into<String>, user: u32) -> Self {
        Self {
            base: base.into(),
            user,
            group: None,
            labels: BTreeMap::new(),
        }
    }

    /// Add a label
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }
}

/// A multi-stage build pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pipeline {
    pub name: String,
    pub description: Option<String>,
    pub parameters: ParameterSet,
    /// Stages in declaration order
    pub stages: Vec<StageDefinition>,
    pub image: ImageDefinition,
}

impl Pipeline {
    /// Create a pipeline with no parameters or stages
    pub fn new(name: impl Into<String>, image: ImageDefinition) -> Self {
        Self {
            name: name.into(),
            description: None,
            parameters: ParameterSet::new(),
            stages: Vec::new(),
            image,
        }
    }

    /// Declare a parameter
    pub fn with_parameter(mut self, decl: ParameterDecl) -> BuildResult<Self> {
        self.parameters.declare(decl)?;
        Ok(self)
    }

    /// Append a stage
    pub fn with_stage(mut self, stage: StageDefinition) -> Self {
        self.stages.push(stage);
        self
    }

    /// Build a pipeline from a validated manifest
    ///
    /// Repository references expand into one `RegisterRepository` operation
    /// each, followed by a single package install and the setup commands.
    pub fn from_manifest(manifest: &PipelineManifest) -> BuildResult<Self> {
        manifest.validate()?;

        let mut image = ImageDefinition::new(&manifest.image.base, manifest.image.user);
        image.group = manifest.image.group;
        image.labels = manifest.image.labels.clone();

        let mut pipeline = Pipeline::new(&manifest.pipeline.name, image);
        pipeline.description = manifest.pipeline.description.clone();

        for (name, spec) in &manifest.parameters {
            let mut decl = ParameterDecl::global(name, spec.kind());
            decl.default = spec.default_value();
            pipeline.parameters.declare(decl)?;
        }

        for spec in &manifest.stages {
            for (name, param) in &spec.parameters {
                let mut decl = ParameterDecl::stage(&spec.name, name, param.kind());
                decl.default = param.default_value();
                pipeline.parameters.declare(decl)?;
            }

            let source = match spec.source.pin(&spec.name)? {
                SourcePin::Revision {
                    repository,
                    revision,
                } => SourceRef::pinned(repository, revision),
                SourcePin::Index { index, package } => SourceRef::from_index(index, package),
            };

            let mut stage = StageDefinition::new(&spec.name, &spec.base, source, &spec.build);
            for repo_name in &spec.repositories {
                let repo = manifest.repositories.get(repo_name).ok_or_else(|| {
                    BuildError::InvalidDefinition(format!(
                        "stage '{}' references unknown repository '{}'",
                        spec.name, repo_name
                    ))
                })?;
                stage.setup.push(SetupOperation::RegisterRepository {
                    name: repo_name.clone(),
                    url: repo.url.clone(),
                    signing_key: repo.signing_key.clone(),
                });
            }
            if !spec.packages.is_empty() {
                stage.setup.push(SetupOperation::InstallPackages {
                    packages: spec.packages.clone(),
                });
            }
            for command in &spec.setup {
                stage.setup.push(SetupOperation::Run {
                    command: command.clone(),
                });
            }
            stage.env = spec.env.clone();
            for artifact in &spec.artifacts {
                stage = stage.with_artifact(&artifact.from, &artifact.to);
            }

            pipeline.stages.push(stage);
        }

        pipeline.validate()?;
        Ok(pipeline)
    }

    /// Look up a stage definition by name
    pub fn stage(&self, name: &str) -> Option<&StageDefinition> {
        self.stages.iter().find(|s| s.name == name)
    }

    /// Structural checks, including a first overlap check on the
    /// destinations as written
    pub fn validate(&self) -> BuildResult<()> {
        if self.name.trim().is_empty() {
            return Err(BuildError::InvalidDefinition(
                "pipeline name cannot be empty".to_string(),
            ));
        }
        if self.stages.is_empty() {
            return Err(BuildError::InvalidDefinition(format!(
                "pipeline '{}' declares no stages",
                self.name
            )));
        }
        if self.image.base.trim().is_empty() {
            return Err(BuildError::InvalidDefinition(
                "image base cannot be empty".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for stage in &self.stages {
            stage.validate()?;
            if !seen.insert(stage.name.as_str()) {
                return Err(BuildError::InvalidDefinition(format!(
                    "stage '{}' declared twice",
                    stage.name
                )));
            }
        }

        for decl in self.parameters.iter() {
            if let ParameterScope::Stage(stage) = &decl.scope {
                if !seen.contains(stage.as_str()) {
                    return Err(BuildError::InvalidDefinition(format!(
                        "parameter '{}' is scoped to unknown stage '{}'",
                        decl.name, stage
                    )));
                }
            }
        }

        check_disjoint(self.stages.iter().map(|s| (s.name.as_str(), &s.contract)))
    }

    /// Execution graph: every stage independent, assembler last
    pub fn graph(&self) -> ExecutionGraph {
        ExecutionGraph::fan_in(self.stages.iter().map(|s| s.name.as_str()))
    }

    /// Resolve parameters once and render every stage and the image
    pub fn resolve(&self, overrides: &BTreeMap<String, String>) -> BuildResult<ResolvedPipeline> {
        self.validate()?;
        let parameters = self.parameters.resolve(overrides)?;

        let stages = self
            .stages
            .iter()
            .map(|stage| stage.resolve(&parameters))
            .collect::<BuildResult<Vec<_>>>()?;
        check_disjoint(stages.iter().map(|s| (s.name.as_str(), &s.contract)))?;

        let mut view = parameters.global_scope();
        let image_base = view.render(&self.image.base)?;
        let mut metadata = ImageMetadata::new(self.image.user);
        if let Some(group) = self.image.group {
            metadata.group = group;
        }
        for (key, value) in &self.image.labels {
            if key.starts_with(PROVENANCE_LABEL_PREFIX) {
                return Err(BuildError::metadata(
                    format!("labels.{}", key),
                    format!("labels under '{}' are set by kiln", PROVENANCE_LABEL_PREFIX),
                ));
            }
            metadata.labels.insert(key.clone(), view.render(value)?);
        }
        metadata.validate()?;

        for stage in &stages {
            debug!(
                "Resolved stage '{}' with {} parameters",
                stage.name,
                stage.parameters.len()
            );
        }

        Ok(ResolvedPipeline {
            name: self.name.clone(),
            parameters,
            stages,
            image_base,
            metadata,
        })
    }
}

/// A pipeline with every parameter substituted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPipeline {
    pub name: String,
    pub parameters: ResolvedParameters,
    pub stages: Vec<ResolvedStage>,
    /// Runtime base of the final image
    pub image_base: String,
    pub metadata: ImageMetadata,
}

impl ResolvedPipeline {
    /// Look up a resolved stage by name
    pub fn stage(&self, name: &str) -> Option<&ResolvedStage> {
        self.stages.iter().find(|s| s.name == name)
    }

    /// Execution graph: every stage independent, assembler last
    pub fn graph(&self) -> ExecutionGraph {
        ExecutionGraph::fan_in(self.stages.iter().map(|s| s.name.as_str()))
    }
}
