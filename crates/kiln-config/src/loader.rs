//! Configuration Loader
//!
//! Handles loading and merging configuration from multiple sources with proper precedence.

use crate::global::{BuildDefaults, GlobalConfig};
use crate::manifest::PipelineManifest;
use crate::{ConfigError, ConfigResult, MANIFEST_FILE};
use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};

/// Prefix of environment variables carrying parameter overrides
pub const PARAM_ENV_PREFIX: &str = "KILN_PARAM_";

/// Configuration loader
///
/// Loads configuration from multiple sources and merges them with proper precedence:
/// 1. Global config (~/.kiln/config.toml) - lowest priority
/// 2. Pipeline manifest (./kiln.toml) - overrides global
/// 3. Environment variables (KILN_*) - overrides manifest
/// 4. Caller overrides - highest priority (handled by caller)
pub struct ConfigLoader {
    /// Cached global config path
    global_config_path: Option<PathBuf>,
}

/// Merged configuration result
#[derive(Debug, Clone)]
pub struct Config {
    /// Pipeline manifest
    pub manifest: PipelineManifest,

    /// Global configuration
    pub global: GlobalConfig,

    /// Project root directory (where kiln.toml was found)
    pub project_root: Option<PathBuf>,

    /// Effective build settings after environment overrides
    pub build: BuildDefaults,

    /// Parameter overrides gathered from global config and environment,
    /// keyed by `name` (global) or `stage.name` (stage-scoped)
    pub overrides: BTreeMap<String, String>,
}

impl ConfigLoader {
    /// Create a new configuration loader
    pub fn new() -> Self {
        Self {
            global_config_path: None,
        }
    }

    /// Use an explicit global config file instead of ~/.kiln/config.toml
    pub fn with_global_config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.global_config_path = Some(path.into());
        self
    }

    /// Load configuration starting from the given directory
    ///
    /// Walks up the directory tree to find kiln.toml, then loads and merges
    /// global config if it exists.
    pub fn load_from_directory(&mut self, start_dir: &Path) -> ConfigResult<Config> {
        let (project_root, manifest_path) = Self::find_manifest(start_dir)?;
        let manifest = PipelineManifest::load_from_file(&manifest_path)?;
        self.assemble(manifest, Some(project_root), |key| env::var(key).ok())
    }

    /// Load configuration from a specific manifest file
    pub fn load_from_file(&mut self, manifest_path: &Path) -> ConfigResult<Config> {
        let manifest = PipelineManifest::load_from_file(manifest_path)?;
        let project_root = manifest_path.parent().map(|p| p.to_path_buf());
        self.assemble(manifest, project_root, |key| env::var(key).ok())
    }

    /// Merge a manifest with global config and an environment lookup
    ///
    /// `lookup` stands in for the process environment so precedence can be
    /// exercised without mutating global state.
    pub fn assemble<F>(
        &mut self,
        manifest: PipelineManifest,
        project_root: Option<PathBuf>,
        lookup: F,
    ) -> ConfigResult<Config>
    where
        F: Fn(&str) -> Option<String>,
    {
        let global = self.load_global_config()?;
        let mut build = global.build_defaults();
        apply_build_env(&mut build, &lookup)?;

        let mut overrides = BTreeMap::new();
        for key in declared_keys(&manifest) {
            if let Some(value) = global.parameters.get(&key) {
                overrides.insert(key.clone(), value.clone());
            }
            if let Some(value) = lookup(&param_env_var(&key)) {
                overrides.insert(key, value);
            }
        }

        Ok(Config {
            manifest,
            global,
            project_root,
            build,
            overrides,
        })
    }

    /// Find kiln.toml by walking up the directory tree
    fn find_manifest(start_dir: &Path) -> ConfigResult<(PathBuf, PathBuf)> {
        let mut current = start_dir.to_path_buf();

        loop {
            let manifest_path = current.join(MANIFEST_FILE);

            if manifest_path.exists() {
                return Ok((current, manifest_path));
            }

            match current.parent() {
                Some(parent) => current = parent.to_path_buf(),
                None => return Err(ConfigError::NotFound(start_dir.join(MANIFEST_FILE))),
            }
        }
    }

    /// Load global configuration; a missing file yields the defaults
    fn load_global_config(&mut self) -> ConfigResult<GlobalConfig> {
        let path = match &self.global_config_path {
            Some(path) => path.clone(),
            None => match GlobalConfig::global_config_path() {
                Ok(path) => {
                    self.global_config_path = Some(path.clone());
                    path
                }
                Err(ConfigError::HomeNotFound) => return Ok(GlobalConfig::default()),
                Err(e) => return Err(e),
            },
        };

        if !path.exists() {
            return Ok(GlobalConfig::default());
        }

        GlobalConfig::load_from_file(&path)
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// Override keys for every parameter the manifest declares
fn declared_keys(manifest: &PipelineManifest) -> Vec<String> {
    let mut keys: Vec<String> = manifest.parameters.keys().cloned().collect();
    for stage in &manifest.stages {
        for name in stage.parameters.keys() {
            keys.push(format!("{}.{}", stage.name, name));
        }
    }
    keys
}

/// Environment variable carrying the override for a parameter key
///
/// `pg_major` -> `KILN_PARAM_PG_MAJOR`, `pgvector.version` ->
/// `KILN_PARAM_PGVECTOR__VERSION`.
pub fn param_env_var(key: &str) -> String {
    let body = key
        .replace('.', "__")
        .replace('-', "_")
        .to_ascii_uppercase();
    format!("{}{}", PARAM_ENV_PREFIX, body)
}

fn apply_build_env<F>(build: &mut BuildDefaults, lookup: &F) -> ConfigResult<()>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(dir) = lookup("KILN_WORK_DIR") {
        build.work_dir = Some(PathBuf::from(dir));
    }

    if let Some(jobs) = lookup("KILN_JOBS") {
        let parsed = jobs
            .parse::<usize>()
            .ok()
            .filter(|n| *n > 0)
            .ok_or_else(|| ConfigError::InvalidValue {
                field: "KILN_JOBS".to_string(),
                reason: format!("expected a positive integer, got '{}'", jobs),
            })?;
        build.jobs = Some(parsed);
    }

    if let Some(cancel) = lookup("KILN_CANCEL_ON_FAILURE") {
        build.cancel_on_failure = Some(parse_bool("KILN_CANCEL_ON_FAILURE", &cancel)?);
    }

    if let Some(keep) = lookup("KILN_KEEP_WORKSPACES") {
        build.keep_workspaces = Some(parse_bool("KILN_KEEP_WORKSPACES", &keep)?);
    }

    Ok(())
}

fn parse_bool(field: &str, value: &str) -> ConfigResult<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            field: field.to_string(),
            reason: format!("expected true/false, 1/0 or yes/no, got '{}'", value),
        }),
    }
}

impl Config {
    /// Directory holding stage workspaces
    pub fn work_dir(&self) -> PathBuf {
        if let Some(dir) = &self.build.work_dir {
            return dir.clone();
        }
        match &self.project_root {
            Some(root) => root.join("target").join("kiln"),
            None => PathBuf::from("target/kiln"),
        }
    }

    /// Maximum number of concurrent stages (None = one per core)
    pub fn jobs(&self) -> Option<usize> {
        self.build.jobs
    }

    /// Whether a failing stage cancels its siblings (default: true)
    pub fn cancel_on_failure(&self) -> bool {
        self.build.cancel_on_failure.unwrap_or(true)
    }

    /// Whether stage workspaces survive the run (default: false)
    pub fn keep_workspaces(&self) -> bool {
        self.build.keep_workspaces.unwrap_or(false)
    }

    /// Get the project root directory
    pub fn project_root(&self) -> Option<&Path> {
        self.project_root.as_deref()
    }

    /// Get the pipeline name
    pub fn pipeline_name(&self) -> &str {
        &self.manifest.pipeline.name
    }

    /// Configured overrides with caller-supplied values layered on top
    pub fn overrides_with(&self, caller: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        let mut merged = self.overrides.clone();
        for (key, value) in caller {
            merged.insert(key.clone(), value.clone());
        }
        merged
    }
}
