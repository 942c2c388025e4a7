//! Stage backends: the boundary to base environments, package tooling,
//! version control and command execution
//!
//! The executor drives a [`StageBackend`] through a stage's lifecycle and
//! interprets its results. [`LocalBackend`] runs everything as host processes
//! inside the stage's private directory tree.

use crate::stage::SetupOperation;
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};
use tracing::debug;
use walkdir::WalkDir;

/// Repository registration hook used by [`LocalBackend`] unless overridden
///
/// Rewrites one file per repository, so applying it again is a no-op.
pub const DEFAULT_REPOSITORY_HOOK: &str = "mkdir -p \"$KILN_STAGE_ROOT/etc/kiln/repositories\" && \
printf '%s\\n%s\\n' \"$KILN_REPO_URL\" \"$KILN_REPO_KEY\" \
> \"$KILN_STAGE_ROOT/etc/kiln/repositories/$KILN_REPO_NAME\"";

/// Per-stage execution context handed to every backend call
#[derive(Debug, Clone)]
pub struct StageContext {
    /// Stage name
    pub stage: String,
    /// Root of the stage filesystem
    pub root: PathBuf,
    /// Source checkout directory
    pub source_dir: PathBuf,
    /// Resolved parameters and bindings from the stage definition
    pub env: BTreeMap<String, String>,
}

impl StageContext {
    /// Full environment for commands run in this stage
    pub fn environment(&self) -> BTreeMap<String, String> {
        let mut env = self.env.clone();
        let root = self.root.display().to_string();
        env.insert("DESTDIR".to_string(), root.clone());
        env.insert("KILN_STAGE_ROOT".to_string(), root);
        env.insert(
            "KILN_SOURCE_DIR".to_string(),
            self.source_dir.display().to_string(),
        );
        env.insert("KILN_STAGE".to_string(), self.stage.clone());
        env
    }
}

/// Result of one external command
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

impl CommandOutput {
    /// Successful output with no captured text
    pub fn ok() -> Self {
        Self {
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
            duration: Duration::ZERO,
        }
    }

    /// Failed output carrying `stderr`
    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stdout: String::new(),
            stderr: stderr.into(),
            duration: Duration::ZERO,
        }
    }

    /// Check if the command succeeded
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Get combined output
    pub fn output(&self) -> String {
        let mut output = String::new();
        if !self.stdout.is_empty() {
            output.push_str("STDOUT:\n");
            output.push_str(&self.stdout);
            output.push('\n');
        }
        if !self.stderr.is_empty() {
            output.push_str("STDERR:\n");
            output.push_str(&self.stderr);
        }
        output
    }

    /// One-line failure reason: exit status plus the last stderr line
    pub fn failure_summary(&self) -> String {
        match self.stderr.lines().rev().find(|l| !l.trim().is_empty()) {
            Some(line) => format!("exited with status {}: {}", self.exit_code, line.trim()),
            None => format!("exited with status {}", self.exit_code),
        }
    }
}

/// External collaborators needed to run a stage
pub trait StageBackend: Send + Sync {
    /// Materialize the base environment `base` at `root`
    fn instantiate(&self, base: &str, root: &Path) -> io::Result<()>;

    /// Apply one setup operation inside the stage
    fn apply_setup(&self, ctx: &StageContext, op: &SetupOperation) -> io::Result<CommandOutput>;

    /// Shallow-fetch `repository` at `revision` into `ctx.source_dir`
    fn fetch_source(
        &self,
        ctx: &StageContext,
        repository: &str,
        revision: &str,
    ) -> io::Result<CommandOutput>;

    /// Run the build command
    fn run_build(&self, ctx: &StageContext, command: &str) -> io::Result<CommandOutput>;
}

/// Where a [`LocalBackend`] base environment comes from
#[derive(Debug, Clone, PartialEq, Eq)]
enum BaseSource {
    Tree(PathBuf),
    Empty,
}

/// Host-process backend
///
/// Base environments are directory trees registered with
/// [`with_base`](Self::with_base) and copied into each stage root. Bases
/// that should start from nothing must be registered with
/// [`with_empty_base`](Self::with_empty_base); any other name fails to
/// instantiate with [`io::ErrorKind::NotFound`].
///
/// Stages run in parallel on one host, so nothing here touches host-wide
/// state. There is no default package installer: `InstallPackages` fails
/// until [`with_install_command`](Self::with_install_command) names a command
/// that installs into `$KILN_STAGE_ROOT` (also exported as `DESTDIR`), for
/// example `apt-get download` followed by `dpkg -x` into the stage root.
#[derive(Debug, Clone)]
pub struct LocalBackend {
    bases: BTreeMap<String, BaseSource>,
    shell: String,
    git: String,
    install_command: Option<String>,
    repository_hook: String,
}

impl LocalBackend {
    /// Create a backend with the default toolchain
    pub fn new() -> Self {
        Self {
            bases: BTreeMap::new(),
            shell: "sh".to_string(),
            git: "git".to_string(),
            install_command: None,
            repository_hook: DEFAULT_REPOSITORY_HOOK.to_string(),
        }
    }

    /// Register a directory tree as base environment `name`
    pub fn with_base(mut self, name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        self.bases.insert(name.into(), BaseSource::Tree(path.into()));
        self
    }

    /// Register base environment `name` as an empty root
    pub fn with_empty_base(mut self, name: impl Into<String>) -> Self {
        self.bases.insert(name.into(), BaseSource::Empty);
        self
    }

    /// Set the shell used for commands
    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }

    /// Set the git executable
    pub fn with_git(mut self, git: impl Into<String>) -> Self {
        self.git = git.into();
        self
    }

    /// Set the package install command; package names are appended
    ///
    /// The command runs with the stage root as working directory and must
    /// install into `$KILN_STAGE_ROOT`, never into the host.
    pub fn with_install_command(mut self, command: impl Into<String>) -> Self {
        self.install_command = Some(command.into());
        self
    }

    /// Set the repository registration hook
    pub fn with_repository_hook(mut self, hook: impl Into<String>) -> Self {
        self.repository_hook = hook.into();
        self
    }

    fn shell_command(&self, ctx: &StageContext, script: &str, cwd: &Path) -> Command {
        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c")
            .arg(script)
            .current_dir(cwd)
            .envs(ctx.environment());
        cmd
    }
}

impl Default for LocalBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl StageBackend for LocalBackend {
    fn instantiate(&self, base: &str, root: &Path) -> io::Result<()> {
        match self.bases.get(base) {
            Some(BaseSource::Tree(source)) => {
                debug!("Copying base '{}' from {}", base, source.display());
                fs::create_dir_all(root)?;
                copy_tree(source, root)
            }
            Some(BaseSource::Empty) => {
                debug!("Base '{}' starts from an empty root", base);
                fs::create_dir_all(root)
            }
            None => Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("base environment '{}' is not registered", base),
            )),
        }
    }

    fn apply_setup(&self, ctx: &StageContext, op: &SetupOperation) -> io::Result<CommandOutput> {
        let cmd = match op {
            SetupOperation::RegisterRepository {
                name,
                url,
                signing_key,
            } => {
                let mut cmd = self.shell_command(ctx, &self.repository_hook, &ctx.root);
                cmd.env("KILN_REPO_NAME", name)
                    .env("KILN_REPO_URL", url)
                    .env("KILN_REPO_KEY", signing_key.as_deref().unwrap_or(""));
                cmd
            }
            SetupOperation::InstallPackages { packages } => {
                let installer = self.install_command.as_deref().ok_or_else(|| {
                    io::Error::new(
                        io::ErrorKind::Unsupported,
                        "no package install command is configured",
                    )
                })?;
                let script = format!("{} {}", installer, packages.join(" "));
                self.shell_command(ctx, &script, &ctx.root)
            }
            SetupOperation::Run { command } => self.shell_command(ctx, command, &ctx.root),
        };
        debug!(stage = %ctx.stage, "Setup: {}", op.describe());
        run(cmd)
    }

    fn fetch_source(
        &self,
        ctx: &StageContext,
        repository: &str,
        revision: &str,
    ) -> io::Result<CommandOutput> {
        let mut cmd = Command::new(&self.git);
        cmd.args(["clone", "--quiet", "--depth", "1", "--branch", revision])
            .arg(repository)
            .arg(&ctx.source_dir);
        debug!(stage = %ctx.stage, "Fetching {}@{}", repository, revision);
        run(cmd)
    }

    fn run_build(&self, ctx: &StageContext, command: &str) -> io::Result<CommandOutput> {
        let cwd = if ctx.source_dir.is_dir() {
            &ctx.source_dir
        } else {
            &ctx.root
        };
        debug!(stage = %ctx.stage, "Build: {}", command);
        run(self.shell_command(ctx, command, cwd))
    }
}

fn run(mut cmd: Command) -> io::Result<CommandOutput> {
    let start = Instant::now();
    let output = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?
        .wait_with_output()?;

    Ok(CommandOutput {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        duration: start.elapsed(),
    })
}

/// Recursively copy `from` into `to`, preserving symlinks on unix
pub fn copy_tree(from: &Path, to: &Path) -> io::Result<()> {
    for entry in WalkDir::new(from).follow_links(false) {
        let entry = entry.map_err(io::Error::from)?;
        let relative = match entry.path().strip_prefix(from) {
            Ok(rel) => rel,
            Err(_) => continue,
        };
        let target = to.join(relative);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir_all(&target)?;
        } else if file_type.is_symlink() {
            copy_symlink(entry.path(), &target)?;
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn copy_symlink(from: &Path, to: &Path) -> io::Result<()> {
    let link = fs::read_link(from)?;
    if to.symlink_metadata().is_ok() {
        fs::remove_file(to)?;
    }
    std::os::unix::fs::symlink(link, to)
}

#[cfg(not(unix))]
fn copy_symlink(from: &Path, to: &Path) -> io::Result<()> {
    fs::copy(from, to).map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn context(dir: &Path) -> StageContext {
        let root = dir.join("rootfs");
        fs::create_dir_all(&root).unwrap();
        StageContext {
            stage: "ext".to_string(),
            root,
            source_dir: dir.join("src"),
            env: [("KILN_PARAM_VERSION".to_string(), "1.2.3".to_string())]
                .into_iter()
                .collect(),
        }
    }

    #[test]
    fn test_context_environment() {
        let dir = TempDir::new().unwrap();
        let ctx = context(dir.path());
        let env = ctx.environment();
        assert_eq!(env.get("DESTDIR"), env.get("KILN_STAGE_ROOT"));
        assert_eq!(env.get("KILN_STAGE"), Some(&"ext".to_string()));
        assert_eq!(env.get("KILN_PARAM_VERSION"), Some(&"1.2.3".to_string()));
    }

    #[test]
    fn test_failure_summary_uses_last_stderr_line() {
        let output = CommandOutput::failed(2, "warning: x\nerror: no such tag\n\n");
        assert!(!output.success());
        assert_eq!(output.failure_summary(), "exited with status 2: error: no such tag");
        assert_eq!(CommandOutput::failed(1, "").failure_summary(), "exited with status 1");
    }

    #[cfg(unix)]
    #[test]
    fn test_build_command_sees_environment() {
        let dir = TempDir::new().unwrap();
        let ctx = context(dir.path());
        let backend = LocalBackend::new();

        let output = backend
            .run_build(
                &ctx,
                "mkdir -p \"$DESTDIR/out\" && echo \"$KILN_PARAM_VERSION\" > \"$DESTDIR/out/version\"",
            )
            .unwrap();
        assert!(output.success(), "{}", output.output());
        let written = fs::read_to_string(ctx.root.join("out/version")).unwrap();
        assert_eq!(written.trim(), "1.2.3");
    }

    #[cfg(unix)]
    #[test]
    fn test_nonzero_exit_is_reported() {
        let dir = TempDir::new().unwrap();
        let ctx = context(dir.path());
        let output = LocalBackend::new()
            .run_build(&ctx, "echo boom >&2; exit 3")
            .unwrap();
        assert_eq!(output.exit_code, 3);
        assert_eq!(output.failure_summary(), "exited with status 3: boom");
    }

    #[cfg(unix)]
    #[test]
    fn test_repository_registration_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let ctx = context(dir.path());
        let backend = LocalBackend::new();
        let op = SetupOperation::RegisterRepository {
            name: "pgdg".to_string(),
            url: "https://apt.example.com/pgdg".to_string(),
            signing_key: Some("ABCD".to_string()),
        };

        for _ in 0..2 {
            let output = backend.apply_setup(&ctx, &op).unwrap();
            assert!(output.success(), "{}", output.output());
        }
        let written = fs::read_to_string(ctx.root.join("etc/kiln/repositories/pgdg")).unwrap();
        assert_eq!(written, "https://apt.example.com/pgdg\nABCD\n");
    }

    #[test]
    fn test_instantiate_copies_registered_base() {
        let dir = TempDir::new().unwrap();
        let base = dir.path().join("base");
        fs::create_dir_all(base.join("usr/bin")).unwrap();
        fs::write(base.join("usr/bin/postgres"), "binary").unwrap();

        let backend = LocalBackend::new()
            .with_base("runtime", &base)
            .with_empty_base("scratch");
        let root = dir.path().join("image");
        backend.instantiate("runtime", &root).unwrap();
        assert!(root.join("usr/bin/postgres").is_file());

        let empty = dir.path().join("empty");
        backend.instantiate("scratch", &empty).unwrap();
        assert_eq!(fs::read_dir(&empty).unwrap().count(), 0);
    }

    #[test]
    fn test_unregistered_base_is_an_error() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("image");
        let err = LocalBackend::new()
            .instantiate("postgres:17-bookworm", &root)
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
        assert!(err.to_string().contains("postgres:17-bookworm"));
        assert!(!root.exists());
    }

    #[test]
    fn test_install_requires_configured_command() {
        let dir = TempDir::new().unwrap();
        let ctx = context(dir.path());
        let op = SetupOperation::InstallPackages {
            packages: vec!["build-essential".to_string()],
        };
        let err = LocalBackend::new().apply_setup(&ctx, &op).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Unsupported);
    }

    #[cfg(unix)]
    #[test]
    fn test_install_command_runs_in_stage_root() {
        let dir = TempDir::new().unwrap();
        let ctx = context(dir.path());
        let backend = LocalBackend::new()
            .with_install_command("printf '%s ' >> \"$KILN_STAGE_ROOT/installed\"");
        let op = SetupOperation::InstallPackages {
            packages: vec!["clang".to_string(), "libssl-dev".to_string()],
        };
        let output = backend.apply_setup(&ctx, &op).unwrap();
        assert!(output.success(), "{}", output.output());
        let installed = fs::read_to_string(ctx.root.join("installed")).unwrap();
        assert_eq!(installed.trim(), "clang libssl-dev");
    }
}
