//! Build stage definitions
//!
//! A [`StageDefinition`] holds `{{param}}` templates as loaded from the
//! pipeline manifest. Resolving it against a parameter mapping yields a
//! [`ResolvedStage`] with every string concrete and a record of exactly which
//! parameters the stage consumed.

use crate::contract::{ArtifactContract, ArtifactRule};
use crate::error::{BuildError, BuildResult};
use crate::params::{ParameterView, ResolvedParameters};
use kiln_config::loader::param_env_var;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

/// One declarative step applied to a fresh base environment
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SetupOperation {
    /// Register a package repository; applying it twice is harmless
    RegisterRepository {
        name: String,
        url: String,
        signing_key: Option<String>,
    },
    /// Install packages from the registered repositories
    InstallPackages { packages: Vec<String> },
    /// Run an arbitrary setup command
    Run { command: String },
}

impl SetupOperation {
    /// Short description used in logs and errors
    pub fn describe(&self) -> String {
        match self {
            Self::RegisterRepository { name, url, .. } => {
                format!("register repository '{}' ({})", name, url)
            }
            Self::InstallPackages { packages } => {
                format!("install packages [{}]", packages.join(", "))
            }
            Self::Run { command } => format!("run '{}'", command),
        }
    }

    fn render(&self, view: &mut ParameterView<'_>) -> BuildResult<Self> {
        Ok(match self {
            Self::RegisterRepository {
                name,
                url,
                signing_key,
            } => Self::RegisterRepository {
                name: name.clone(),
                url: view.render(url)?,
                signing_key: signing_key.as_deref().map(|k| view.render(k)).transpose()?,
            },
            Self::InstallPackages { packages } => Self::InstallPackages {
                packages: packages
                    .iter()
                    .map(|p| view.render(p))
                    .collect::<BuildResult<_>>()?,
            },
            Self::Run { command } => Self::Run {
                command: view.render(command)?,
            },
        })
    }

    fn digest_into(&self, hasher: &mut Sha256) {
        match self {
            Self::RegisterRepository {
                name,
                url,
                signing_key,
            } => {
                field(hasher, "repo", name);
                field(hasher, "url", url);
                field(hasher, "key", signing_key.as_deref().unwrap_or(""));
            }
            Self::InstallPackages { packages } => {
                for package in packages {
                    field(hasher, "pkg", package);
                }
            }
            Self::Run { command } => field(hasher, "run", command),
        }
    }
}

/// How a stage's source version is chosen
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum VersionPin {
    /// Exact tag or branch, fetched with a depth-1 checkout
    PinnedRevision(String),
    /// Whatever the package index currently serves for `package`
    LatestFromIndex { package: String },
}

impl VersionPin {
    /// Whether two runs with identical inputs fetch identical sources
    pub fn is_reproducible(&self) -> bool {
        matches!(self, Self::PinnedRevision(_))
    }
}

/// Source repository (or package index) plus pin
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourceRef {
    /// Repository URL, or the index URL for [`VersionPin::LatestFromIndex`]
    pub repository: String,
    pub pin: VersionPin,
}

impl SourceRef {
    /// Pinned VCS source
    pub fn pinned(repository: impl Into<String>, revision: impl Into<String>) -> Self {
        Self {
            repository: repository.into(),
            pin: VersionPin::PinnedRevision(revision.into()),
        }
    }

    /// Floating package-index source
    pub fn from_index(index: impl Into<String>, package: impl Into<String>) -> Self {
        Self {
            repository: index.into(),
            pin: VersionPin::LatestFromIndex {
                package: package.into(),
            },
        }
    }

    /// Revision or `latest:<package>`
    pub fn revision_label(&self) -> String {
        match &self.pin {
            VersionPin::PinnedRevision(rev) => rev.clone(),
            VersionPin::LatestFromIndex { package } => format!("latest:{}", package),
        }
    }

    fn render(&self, view: &mut ParameterView<'_>) -> BuildResult<Self> {
        let pin = match &self.pin {
            VersionPin::PinnedRevision(rev) => VersionPin::PinnedRevision(view.render(rev)?),
            VersionPin::LatestFromIndex { package } => VersionPin::LatestFromIndex {
                package: view.render(package)?,
            },
        };
        Ok(Self {
            repository: view.render(&self.repository)?,
            pin,
        })
    }
}

impl fmt::Display for SourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.pin {
            VersionPin::PinnedRevision(rev) => write!(f, "{}@{}", self.repository, rev),
            VersionPin::LatestFromIndex { package } => {
                write!(f, "{} (latest from {})", package, self.repository)
            }
        }
    }
}

/// A stage as declared, with unresolved parameter templates
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageDefinition {
    pub name: String,
    /// Base environment reference
    pub base: String,
    pub setup: Vec<SetupOperation>,
    pub source: SourceRef,
    pub build_command: String,
    /// Extra build environment bindings
    pub env: BTreeMap<String, String>,
    pub contract: ArtifactContract,
}

impl StageDefinition {
    /// Create a stage with no setup, env bindings or artifacts
    pub fn new(
        name: impl Into<String>,
        base: impl Into<String>,
        source: SourceRef,
        build_command: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            base: base.into(),
            setup: Vec::new(),
            source,
            build_command: build_command.into(),
            env: BTreeMap::new(),
            contract: ArtifactContract::new(),
        }
    }

    /// Append a setup operation
    pub fn with_setup(mut self, op: SetupOperation) -> Self {
        self.setup.push(op);
        self
    }

    /// Add an environment binding
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Append an artifact rule
    pub fn with_artifact(
        mut self,
        source: impl Into<String>,
        destination: impl Into<String>,
    ) -> Self {
        self.contract.push(ArtifactRule::new(source, destination));
        self
    }

    /// Structural checks that do not need parameter values
    pub fn validate(&self) -> BuildResult<()> {
        let invalid = |reason: String| -> BuildResult<()> {
            Err(BuildError::InvalidDefinition(format!(
                "stage '{}': {}",
                self.name, reason
            )))
        };

        if !kiln_config::is_valid_name(&self.name) {
            return invalid("stage names use ASCII letters, digits, '-' and '_'".to_string());
        }
        if self.base.trim().is_empty() {
            return invalid("base environment cannot be empty".to_string());
        }
        if self.build_command.trim().is_empty() {
            return invalid("build command cannot be empty".to_string());
        }
        if self.source.repository.trim().is_empty() {
            return invalid("source repository cannot be empty".to_string());
        }
        for key in self.env.keys() {
            if key.is_empty() || key.contains(['=', '\0']) {
                return invalid(format!("invalid environment variable name '{}'", key));
            }
        }
        self.contract.validate(&self.name)
    }

    /// Substitute parameters into every templated field
    pub fn resolve(&self, params: &ResolvedParameters) -> BuildResult<ResolvedStage> {
        let mut view = params.scope_for(&self.name);

        let base = view.render(&self.base)?;
        let setup = self
            .setup
            .iter()
            .map(|op| op.render(&mut view))
            .collect::<BuildResult<Vec<_>>>()?;
        let source = self.source.render(&mut view)?;
        let build_command = view.render(&self.build_command)?;

        let mut env = BTreeMap::new();
        for (key, value) in &self.env {
            env.insert(key.clone(), view.render(value)?);
        }

        let mut contract = ArtifactContract::new();
        for rule in self.contract.rules() {
            contract.push(ArtifactRule::new(
                view.render(&rule.source)?,
                view.render(&rule.destination)?,
            ));
        }
        contract.validate(&self.name)?;
        view.bind_stage_parameters()?;

        Ok(ResolvedStage {
            name: self.name.clone(),
            base,
            setup,
            source,
            build_command,
            env,
            contract,
            parameters: view.into_referenced(),
        })
    }
}

/// A stage with every parameter substituted, ready to execute
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedStage {
    pub name: String,
    pub base: String,
    pub setup: Vec<SetupOperation>,
    pub source: SourceRef,
    pub build_command: String,
    pub env: BTreeMap<String, String>,
    pub contract: ArtifactContract,
    /// Parameters this stage referenced, by plain name
    pub parameters: BTreeMap<String, String>,
}

impl ResolvedStage {
    /// Whether the source is pinned to an exact revision
    pub fn is_reproducible(&self) -> bool {
        self.source.pin.is_reproducible()
    }

    /// SHA-256 over everything that determines the stage's output
    pub fn cache_key(&self) -> String {
        let mut hasher = Sha256::new();

        field(&mut hasher, "base", &self.base);
        for (name, value) in &self.parameters {
            field(&mut hasher, "param", name);
            field(&mut hasher, "value", value);
        }
        field(&mut hasher, "source", &self.source.repository);
        field(&mut hasher, "pin", &self.source.revision_label());
        for op in &self.setup {
            op.digest_into(&mut hasher);
        }
        field(&mut hasher, "build", &self.build_command);
        for (key, value) in &self.env {
            field(&mut hasher, "env", key);
            field(&mut hasher, "value", value);
        }

        format!("{:x}", hasher.finalize())
    }

    /// Environment handed to the build command, minus workspace paths
    pub fn environment(&self) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();

        env.insert("KILN_STAGE".to_string(), self.name.clone());
        for (name, value) in &self.parameters {
            env.insert(param_env_var(name), value.clone());
        }
        if let VersionPin::LatestFromIndex { package } = &self.source.pin {
            env.insert("KILN_INDEX_URL".to_string(), self.source.repository.clone());
            env.insert("KILN_INDEX_PACKAGE".to_string(), package.clone());
        }
        for (key, value) in &self.env {
            env.insert(key.clone(), value.clone());
        }

        env
    }
}

/// Length-prefixed, tagged field so adjacent values cannot run together
fn field(hasher: &mut Sha256, tag: &str, value: &str) {
    hasher.update(tag.as_bytes());
    hasher.update((value.len() as u64).to_le_bytes());
    hasher.update(value.as_bytes());
}
