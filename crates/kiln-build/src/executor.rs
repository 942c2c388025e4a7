//! Stage execution: instantiate, setup, fetch, build
//!
//! Each stage runs in its own workspace under the work directory, named
//! after the stage and its cache key. Nothing in a workspace is shared with
//! another stage, and the workspace is deleted when its [`StageOutput`] is
//! dropped unless workspaces are kept for debugging.

use crate::backend::{CommandOutput, StageBackend, StageContext};
use crate::error::{BuildError, BuildResult, StageStep};
use crate::stage::{ResolvedStage, VersionPin};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tracing::{debug, info, instrument, warn};

/// Private directory tree of one stage run
#[derive(Debug)]
pub struct StageWorkspace {
    dir: WorkspaceDir,
}

#[derive(Debug)]
enum WorkspaceDir {
    Temporary(TempDir),
    Kept(PathBuf),
}

impl StageWorkspace {
    /// Create a fresh workspace for `stage` under `work_dir`
    pub fn create(work_dir: &Path, stage: &str, cache_key: &str, keep: bool) -> BuildResult<Self> {
        fs::create_dir_all(work_dir).map_err(|e| BuildError::io(work_dir, e))?;
        let short_key = &cache_key[..cache_key.len().min(12)];
        let prefix = format!("{}-{}", stage, short_key);

        let dir = if keep {
            let path = work_dir.join(&prefix);
            if path.exists() {
                fs::remove_dir_all(&path).map_err(|e| BuildError::io(&path, e))?;
            }
            fs::create_dir_all(&path).map_err(|e| BuildError::io(&path, e))?;
            WorkspaceDir::Kept(path)
        } else {
            let temp = tempfile::Builder::new()
                .prefix(&format!("{}-", prefix))
                .tempdir_in(work_dir)
                .map_err(|e| BuildError::io(work_dir, e))?;
            WorkspaceDir::Temporary(temp)
        };

        let workspace = Self { dir };
        let root = workspace.root();
        fs::create_dir_all(&root).map_err(|e| BuildError::io(&root, e))?;
        Ok(workspace)
    }

    /// Workspace directory
    pub fn path(&self) -> &Path {
        match &self.dir {
            WorkspaceDir::Temporary(temp) => temp.path(),
            WorkspaceDir::Kept(path) => path,
        }
    }

    /// Stage filesystem root
    pub fn root(&self) -> PathBuf {
        self.path().join("rootfs")
    }

    /// Source checkout directory
    pub fn source_dir(&self) -> PathBuf {
        self.path().join("src")
    }

    /// Whether the workspace survives being dropped
    pub fn is_kept(&self) -> bool {
        matches!(self.dir, WorkspaceDir::Kept(_))
    }
}

/// A successfully built stage and its populated filesystem
#[derive(Debug)]
pub struct StageOutput {
    pub stage: ResolvedStage,
    pub workspace: StageWorkspace,
    pub duration: Duration,
}

impl StageOutput {
    /// Stage filesystem root
    pub fn root(&self) -> PathBuf {
        self.workspace.root()
    }
}

/// Runs resolved stages against a backend
pub struct StageExecutor<'a> {
    backend: &'a dyn StageBackend,
    work_dir: PathBuf,
    keep_workspaces: bool,
    cancel: Option<&'a AtomicBool>,
}

impl<'a> StageExecutor<'a> {
    /// Create an executor placing workspaces under `work_dir`
    pub fn new(backend: &'a dyn StageBackend, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            backend,
            work_dir: work_dir.into(),
            keep_workspaces: false,
            cancel: None,
        }
    }

    /// Keep workspaces on disk after the run
    pub fn with_keep_workspaces(mut self, keep: bool) -> Self {
        self.keep_workspaces = keep;
        self
    }

    /// Stop at the next step boundary once `flag` is set
    pub fn with_cancel_flag(mut self, flag: &'a AtomicBool) -> Self {
        self.cancel = Some(flag);
        self
    }

    /// Execute one stage to completion
    #[instrument(skip(self, stage), fields(stage = %stage.name))]
    pub fn execute(&self, stage: &ResolvedStage) -> BuildResult<StageOutput> {
        let start = Instant::now();
        let name = stage.name.as_str();

        self.check_cancelled(name, StageStep::Instantiate)?;
        let cache_key = stage.cache_key();
        info!("Starting stage '{}' ({})", name, &cache_key[..12]);

        let workspace =
            StageWorkspace::create(&self.work_dir, name, &cache_key, self.keep_workspaces)?;
        let ctx = StageContext {
            stage: stage.name.clone(),
            root: workspace.root(),
            source_dir: workspace.source_dir(),
            env: stage.environment(),
        };

        self.backend
            .instantiate(&stage.base, &ctx.root)
            .map_err(|e| BuildError::Setup {
                stage: stage.name.clone(),
                step: StageStep::Instantiate,
                operation: format!("instantiate base '{}'", stage.base),
                reason: e.to_string(),
            })?;

        for op in &stage.setup {
            self.check_cancelled(name, StageStep::Setup)?;
            let output = self
                .backend
                .apply_setup(&ctx, op)
                .map_err(|e| BuildError::setup(name, op.describe(), e))?;
            if !output.success() {
                return Err(BuildError::setup(
                    name,
                    op.describe(),
                    output.failure_summary(),
                ));
            }
        }

        self.check_cancelled(name, StageStep::Fetch)?;
        match &stage.source.pin {
            VersionPin::PinnedRevision(revision) => {
                let fetched = self
                    .backend
                    .fetch_source(&ctx, &stage.source.repository, revision);
                let reason = match fetched {
                    Ok(output) if output.success() => None,
                    Ok(output) => Some(output.failure_summary()),
                    Err(e) => Some(e.to_string()),
                };
                if let Some(reason) = reason {
                    return Err(BuildError::SourceFetch {
                        stage: stage.name.clone(),
                        repository: stage.source.repository.clone(),
                        revision: revision.clone(),
                        reason,
                    });
                }
            }
            VersionPin::LatestFromIndex { package } => {
                warn!(
                    "Stage '{}' takes '{}' unpinned from {}; rebuilds may differ",
                    name, package, stage.source.repository
                );
            }
        }

        self.check_cancelled(name, StageStep::Build)?;
        let output = self
            .backend
            .run_build(&ctx, &stage.build_command)
            .map_err(|e| BuildError::build(name, e))?;
        log_output(name, &output);
        if !output.success() {
            return Err(BuildError::build(name, output.failure_summary()));
        }

        let duration = start.elapsed();
        info!("Stage '{}' built in {:.2}s", name, duration.as_secs_f64());

        Ok(StageOutput {
            stage: stage.clone(),
            workspace,
            duration,
        })
    }

    fn check_cancelled(&self, stage: &str, step: StageStep) -> BuildResult<()> {
        match self.cancel {
            Some(flag) if flag.load(Ordering::SeqCst) => {
                warn!("Stage '{}' cancelled before {}", stage, step);
                Err(BuildError::Cancelled {
                    stage: stage.to_string(),
                    step,
                })
            }
            _ => Ok(()),
        }
    }
}

fn log_output(stage: &str, output: &CommandOutput) {
    debug!(
        "Build of '{}' exited with {} after {:.2}s",
        stage,
        output.exit_code,
        output.duration.as_secs_f64()
    );
    if !output.success() && !output.stderr.is_empty() {
        debug!("Build output of '{}':\n{}", stage, output.output());
    }
}
