//! Global Configuration (~/.kiln/config.toml)
//!
//! Handles user-level configuration stored in `~/.kiln/config.toml`.

use crate::{ConfigError, ConfigResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Global user configuration from ~/.kiln/config.toml
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct GlobalConfig {
    /// Build defaults
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build: Option<BuildDefaults>,

    /// User-level parameter overrides, applied only to parameters a
    /// pipeline actually declares
    #[serde(default)]
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, String>,
}

/// Build defaults
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct BuildDefaults {
    /// Directory holding stage workspaces
    #[serde(skip_serializing_if = "Option::is_none")]
    pub work_dir: Option<PathBuf>,

    /// Maximum number of stages built concurrently
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jobs: Option<usize>,

    /// Stop sibling stages once one stage fails
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancel_on_failure: Option<bool>,

    /// Keep stage workspaces after the run (debugging aid)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keep_workspaces: Option<bool>,
}

impl GlobalConfig {
    /// Load global configuration from a file
    pub fn load_from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::NotFound(path.to_path_buf())
            } else {
                ConfigError::IoError(e)
            }
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::TomlParseError {
            file: path.to_path_buf(),
            error: e,
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the global configuration
    pub fn validate(&self) -> ConfigResult<()> {
        if let Some(build) = &self.build {
            if build.jobs == Some(0) {
                return Err(ConfigError::InvalidValue {
                    field: "build.jobs".to_string(),
                    reason: "jobs must be at least 1".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Get the global config file path (~/.kiln/config.toml)
    pub fn global_config_path() -> ConfigResult<PathBuf> {
        let home = dirs::home_dir().ok_or(ConfigError::HomeNotFound)?;
        Ok(home.join(".kiln").join("config.toml"))
    }

    /// Build defaults, or empty defaults when the section is absent
    pub fn build_defaults(&self) -> BuildDefaults {
        self.build.clone().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_parse_global_config() {
        let toml = r#"
[build]
work_dir = "/var/tmp/kiln"
jobs = 4
cancel_on_failure = false

[parameters]
pg_major = "16"
"#;
        let config: GlobalConfig = toml::from_str(toml).unwrap();
        assert!(config.validate().is_ok());
        let build = config.build_defaults();
        assert_eq!(build.work_dir, Some(PathBuf::from("/var/tmp/kiln")));
        assert_eq!(build.jobs, Some(4));
        assert_eq!(build.cancel_on_failure, Some(false));
        assert_eq!(config.parameters.get("pg_major"), Some(&"16".to_string()));
    }

    #[test]
    fn test_zero_jobs_rejected() {
        let config = GlobalConfig {
            build: Some(BuildDefaults {
                jobs: Some(0),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_missing_file() {
        let temp_dir = TempDir::new().unwrap();
        let result = GlobalConfig::load_from_file(&temp_dir.path().join("config.toml"));
        assert!(matches!(result, Err(ConfigError::NotFound(_))));
    }

    #[test]
    fn test_load_from_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");
        fs::write(&path, "[build]\nkeep_workspaces = true\n").unwrap();

        let config = GlobalConfig::load_from_file(&path).unwrap();
        assert_eq!(config.build_defaults().keep_workspaces, Some(true));
    }
}
