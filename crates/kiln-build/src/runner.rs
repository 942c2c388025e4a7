//! Pipeline runner
//!
//! Resolves the pipeline once, runs every stage in parallel, waits for all of
//! them, then assembles and publishes the image. Stage workspaces are
//! discarded after assembly, or as soon as the run fails.

use crate::assembler::{check_replaceable, Assembler, FinalImage};
use crate::backend::StageBackend;
use crate::error::{BuildError, BuildResult};
use crate::executor::{StageExecutor, StageOutput};
use crate::graph::NodeId;
use crate::pipeline::{Pipeline, ResolvedPipeline};
use crate::stage::ResolvedStage;
use kiln_config::Config;
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, instrument, warn};

/// Label prefix recording where each stage's source came from; pipelines
/// cannot declare labels under it
pub const PROVENANCE_LABEL_PREFIX: &str = "io.kiln.stage.";

/// Provenance label key for a stage
pub fn provenance_label(stage: &str) -> String {
    format!("{}{}.source", PROVENANCE_LABEL_PREFIX, stage)
}

/// Run settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunConfig {
    /// Parent directory of stage workspaces
    pub work_dir: PathBuf,
    /// Where the finished image is published
    pub output: PathBuf,
    /// Worker threads for stages (rayon's default when unset)
    pub jobs: Option<usize>,
    /// Stop sibling stages once one fails
    pub cancel_on_failure: bool,
    /// Leave stage workspaces on disk
    pub keep_workspaces: bool,
}

impl RunConfig {
    /// Create run settings with defaults
    pub fn new(work_dir: impl Into<PathBuf>, output: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
            output: output.into(),
            jobs: None,
            cancel_on_failure: true,
            keep_workspaces: false,
        }
    }

    /// Derive run settings from loaded configuration
    ///
    /// Workspaces go to `<work_dir>/stages` and the image to
    /// `<work_dir>/images/<pipeline>`.
    pub fn from_config(config: &Config) -> Self {
        let work_dir = config.work_dir();
        Self {
            work_dir: work_dir.join("stages"),
            output: work_dir.join("images").join(config.pipeline_name()),
            jobs: config.jobs(),
            cancel_on_failure: config.cancel_on_failure(),
            keep_workspaces: config.keep_workspaces(),
        }
    }

    /// Set the worker thread count
    pub fn with_jobs(mut self, jobs: usize) -> Self {
        self.jobs = Some(jobs);
        self
    }

    /// Set whether a failure cancels sibling stages
    pub fn with_cancel_on_failure(mut self, cancel: bool) -> Self {
        self.cancel_on_failure = cancel;
        self
    }

    /// Set whether stage workspaces are kept
    pub fn with_keep_workspaces(mut self, keep: bool) -> Self {
        self.keep_workspaces = keep;
        self
    }
}

/// Per-stage summary
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageReport {
    pub name: String,
    pub cache_key: String,
    /// `repository@revision`, or the index package for unpinned stages
    pub source: String,
    /// False for stages taking the latest version from an index
    pub reproducible: bool,
    /// Number of artifacts this stage contributed
    pub artifacts: usize,
    pub duration: Duration,
}

/// Result of a successful run
#[derive(Debug, Clone)]
pub struct PipelineReport {
    pub pipeline: String,
    pub image: FinalImage,
    /// Stages in declaration order
    pub stages: Vec<StageReport>,
    pub total_time: Duration,
}

impl PipelineReport {
    /// Stages whose sources are not pinned
    pub fn unpinned_stages(&self) -> impl Iterator<Item = &str> {
        self.stages
            .iter()
            .filter(|s| !s.reproducible)
            .map(|s| s.name.as_str())
    }
}

/// Runs pipelines against a stage backend
pub struct PipelineRunner {
    backend: Arc<dyn StageBackend>,
    config: RunConfig,
}

impl PipelineRunner {
    /// Create a runner
    pub fn new(backend: Arc<dyn StageBackend>, config: RunConfig) -> Self {
        Self { backend, config }
    }

    /// Run settings
    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Build the pipeline described by loaded configuration
    ///
    /// `caller` overrides take precedence over environment and global
    /// configuration values.
    pub fn run_config(
        &self,
        config: &Config,
        caller: &BTreeMap<String, String>,
    ) -> BuildResult<PipelineReport> {
        let pipeline = Pipeline::from_manifest(&config.manifest)?;
        self.run(&pipeline, &config.overrides_with(caller))
    }

    /// Resolve and run a pipeline
    #[instrument(skip_all, fields(pipeline = %pipeline.name))]
    pub fn run(
        &self,
        pipeline: &Pipeline,
        overrides: &BTreeMap<String, String>,
    ) -> BuildResult<PipelineReport> {
        let resolved = pipeline.resolve(overrides)?;
        self.run_resolved(&resolved)
    }

    /// Run an already resolved pipeline
    pub fn run_resolved(&self, resolved: &ResolvedPipeline) -> BuildResult<PipelineReport> {
        let start = Instant::now();
        check_replaceable(&self.config.output)?;
        info!(
            "Running pipeline '{}' with {} stages",
            resolved.name,
            resolved.stages.len()
        );
        for stage in resolved.stages.iter().filter(|s| !s.is_reproducible()) {
            warn!(
                "Stage '{}' is not pinned to a revision ({})",
                stage.name, stage.source
            );
        }

        let cancel = AtomicBool::new(false);
        let mut outputs: Vec<StageOutput> = Vec::new();
        let mut image = None;

        for group in resolved.graph().parallel_groups()? {
            let stages: Vec<&ResolvedStage> = group
                .iter()
                .filter_map(|node| match node {
                    NodeId::Stage(name) => resolved.stage(name),
                    NodeId::Assembler => None,
                })
                .collect();
            if !stages.is_empty() {
                outputs.extend(self.execute_group(resolved, &stages, &cancel)?);
            }
            if group.contains(&NodeId::Assembler) {
                image = Some(self.assemble(resolved, &outputs)?);
            }
        }

        let image = image.ok_or_else(|| {
            BuildError::Scheduler("execution graph has no assembler".to_string())
        })?;

        let stages = resolved
            .stages
            .iter()
            .map(|stage| {
                let output = outputs.iter().find(|o| o.stage.name == stage.name);
                StageReport {
                    name: stage.name.clone(),
                    cache_key: stage.cache_key(),
                    source: stage.source.to_string(),
                    reproducible: stage.is_reproducible(),
                    artifacts: image
                        .artifacts()
                        .iter()
                        .filter(|a| a.stage == stage.name)
                        .count(),
                    duration: output.map(|o| o.duration).unwrap_or_default(),
                }
            })
            .collect();

        let total_time = start.elapsed();
        info!(
            "Pipeline '{}' finished in {:.2}s",
            resolved.name,
            total_time.as_secs_f64()
        );

        Ok(PipelineReport {
            pipeline: resolved.name.clone(),
            image,
            stages,
            total_time,
        })
    }

    /// Run stages concurrently and join; any failure fails the group
    fn execute_group(
        &self,
        resolved: &ResolvedPipeline,
        stages: &[&ResolvedStage],
        cancel: &AtomicBool,
    ) -> BuildResult<Vec<StageOutput>> {
        let executor = StageExecutor::new(self.backend.as_ref(), &self.config.work_dir)
            .with_keep_workspaces(self.config.keep_workspaces)
            .with_cancel_flag(cancel);
        let cancel_on_failure = self.config.cancel_on_failure;

        let run_one = |stage: &&ResolvedStage| {
            let result = executor.execute(stage);
            if let Err(e) = &result {
                if !e.is_cancellation() {
                    error!("{}", e);
                    if cancel_on_failure {
                        cancel.store(true, Ordering::SeqCst);
                    }
                }
            }
            result
        };

        let results: Vec<BuildResult<StageOutput>> = match self.config.jobs {
            Some(jobs) => {
                let pool = rayon::ThreadPoolBuilder::new()
                    .num_threads(jobs)
                    .thread_name(|i| format!("kiln-stage-{}", i))
                    .build()
                    .map_err(|e| BuildError::Scheduler(e.to_string()))?;
                pool.install(|| stages.par_iter().map(run_one).collect())
            }
            None => stages.par_iter().map(run_one).collect(),
        };

        let mut outputs = Vec::with_capacity(results.len());
        let mut failures = Vec::new();
        for result in results {
            match result {
                Ok(output) => outputs.push(output),
                Err(e) => failures.push(e),
            }
        }

        match select_failure(resolved, failures) {
            Some(e) => Err(e),
            None => Ok(outputs),
        }
    }

    fn assemble(
        &self,
        resolved: &ResolvedPipeline,
        outputs: &[StageOutput],
    ) -> BuildResult<FinalImage> {
        let mut assembler = Assembler::new(
            self.backend.as_ref(),
            &resolved.name,
            &resolved.image_base,
            &self.config.output,
        )?;

        for stage in &resolved.stages {
            if let Some(output) = outputs.iter().find(|o| o.stage.name == stage.name) {
                assembler.extract(output)?;
            }
        }

        let mut metadata = resolved.metadata.clone();
        for stage in &resolved.stages {
            metadata
                .labels
                .insert(provenance_label(&stage.name), stage.source.to_string());
        }
        assembler.apply_metadata(&metadata)?;
        assembler.publish()
    }
}

/// The error to report for a failed group
///
/// A real failure always wins over a cancellation it caused; ties go to the
/// stage declared first.
fn select_failure(
    resolved: &ResolvedPipeline,
    mut failures: Vec<BuildError>,
) -> Option<BuildError> {
    let position = |e: &BuildError| {
        e.stage()
            .and_then(|name| resolved.stages.iter().position(|s| s.name == name))
            .unwrap_or(usize::MAX)
    };
    failures.sort_by_key(|e| (e.is_cancellation(), position(e)));
    failures.into_iter().next()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StageStep;

    fn resolved(names: &[&str]) -> ResolvedPipeline {
        use crate::pipeline::ImageDefinition;
        use crate::stage::{SourceRef, StageDefinition};

        let mut pipeline = Pipeline::new("p", ImageDefinition::new("runtime", 26));
        for name in names {
            pipeline = pipeline.with_stage(
                StageDefinition::new(*name, "base", SourceRef::pinned("r", "v1"), "make")
                    .with_artifact(format!("/out/{}*", name), "/out/"),
            );
        }
        pipeline.resolve(&BTreeMap::new()).unwrap()
    }

    #[test]
    fn test_real_failure_beats_cancellation() {
        let resolved = resolved(&["a", "b", "c"]);
        let failures = vec![
            BuildError::Cancelled {
                stage: "a".to_string(),
                step: StageStep::Build,
            },
            BuildError::build("c", "exit 2"),
            BuildError::setup("b", "install packages [gcc]", "exit 100"),
        ];
        let chosen = select_failure(&resolved, failures).unwrap();
        assert_eq!(chosen.stage(), Some("b"));
        assert_eq!(chosen.step(), Some(StageStep::Setup));
    }

    #[test]
    fn test_no_failures() {
        assert!(select_failure(&resolved(&["a"]), Vec::new()).is_none());
    }

    #[test]
    fn test_provenance_label() {
        assert_eq!(provenance_label("ext-a"), "io.kiln.stage.ext-a.source");
    }

    #[test]
    fn test_run_config_defaults() {
        let config = RunConfig::new("/tmp/work", "/tmp/out").with_jobs(2);
        assert_eq!(config.jobs, Some(2));
        assert!(config.cancel_on_failure);
        assert!(!config.keep_workspaces);
    }
}
