//! Final image assembly
//!
//! The assembler instantiates the runtime base into a hidden staging
//! directory beside the output path, copies contract-matched artifacts out
//! of each finished stage, applies image metadata and renames the staging
//! directory into place. Until [`Assembler::publish`] succeeds nothing is
//! visible at the output path.
//!
//! Only a previously published image (a directory holding `image.json`) is
//! ever replaced. It is moved aside before the new image is renamed in and
//! restored if that rename fails.

use crate::backend::StageBackend;
use crate::error::{BuildError, BuildResult};
use crate::executor::StageOutput;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, info, warn};

/// Image configuration file inside a published image
pub const IMAGE_MANIFEST_FILE: &str = "image.json";

/// Root filesystem directory inside a published image
pub const ROOTFS_DIR: &str = "rootfs";

/// Classification of an extracted file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArtifactKind {
    /// Loadable or linkable binary object
    SharedObject,
    /// SQL scripts, control files and other non-binary payloads
    Metadata,
}

impl ArtifactKind {
    /// Classify by file name
    pub fn classify(path: &Path) -> Self {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let binary = name.ends_with(".so")
            || name.contains(".so.")
            || name.ends_with(".dylib")
            || name.ends_with(".a");
        if binary {
            Self::SharedObject
        } else {
            Self::Metadata
        }
    }
}

/// A file copied from a stage into the image
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    /// Owning stage
    pub stage: String,
    /// Path inside the stage filesystem
    pub source: PathBuf,
    /// Path inside the image
    pub destination: PathBuf,
    pub kind: ArtifactKind,
    pub size: u64,
    pub sha256: String,
}

/// Execution identity and labels of the final image
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageMetadata {
    pub user: u32,
    pub group: u32,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl ImageMetadata {
    /// Run as `user`, with the group defaulting to the same id
    pub fn new(user: u32) -> Self {
        Self {
            user,
            group: user,
            labels: BTreeMap::new(),
        }
    }

    /// Set the group
    pub fn with_group(mut self, group: u32) -> Self {
        self.group = group;
        self
    }

    /// Add a label
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Reject privileged identities and malformed labels
    pub fn validate(&self) -> BuildResult<()> {
        if self.user == 0 {
            return Err(BuildError::metadata(
                "user",
                "the image must not run as uid 0",
            ));
        }
        for (key, value) in &self.labels {
            if key.is_empty() || key.chars().any(char::is_whitespace) {
                return Err(BuildError::metadata(
                    "labels",
                    format!("invalid label key '{}'", key),
                ));
            }
            if value.chars().any(char::is_control) {
                return Err(BuildError::metadata(
                    format!("labels.{}", key),
                    "label values cannot contain control characters",
                ));
            }
        }
        Ok(())
    }
}

/// Contents of `image.json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageManifest {
    /// Pipeline that produced the image
    pub name: String,
    /// Runtime base reference
    pub base: String,
    #[serde(flatten)]
    pub metadata: ImageMetadata,
    pub artifacts: Vec<Artifact>,
}

/// A published image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalImage {
    pub path: PathBuf,
    pub manifest: ImageManifest,
}

impl FinalImage {
    /// Load a published image
    pub fn load(path: impl Into<PathBuf>) -> BuildResult<Self> {
        let path = path.into();
        let manifest_path = path.join(IMAGE_MANIFEST_FILE);
        let content =
            fs::read_to_string(&manifest_path).map_err(|e| BuildError::io(&manifest_path, e))?;
        let manifest = serde_json::from_str(&content).map_err(|error| {
            BuildError::ImageManifest {
                path: manifest_path,
                error,
            }
        })?;
        Ok(Self { path, manifest })
    }

    /// Image root filesystem
    pub fn rootfs(&self) -> PathBuf {
        self.path.join(ROOTFS_DIR)
    }

    /// Extracted artifacts, ordered by destination
    pub fn artifacts(&self) -> &[Artifact] {
        &self.manifest.artifacts
    }
}

/// Builds one image from finished stages
#[derive(Debug)]
pub struct Assembler {
    name: String,
    base: String,
    output: PathBuf,
    staging: TempDir,
    artifacts: Vec<Artifact>,
    /// Image path -> (stage, source path)
    claims: BTreeMap<PathBuf, (String, PathBuf)>,
    metadata: Option<ImageMetadata>,
}

impl Assembler {
    /// Stage a fresh copy of `base` next to `output`
    pub fn new(
        backend: &dyn StageBackend,
        name: impl Into<String>,
        base: impl Into<String>,
        output: impl Into<PathBuf>,
    ) -> BuildResult<Self> {
        let output = output.into();
        let base = base.into();
        check_replaceable(&output)?;
        let parent = parent_dir(&output);
        fs::create_dir_all(&parent).map_err(|e| BuildError::io(&parent, e))?;

        let staging = tempfile::Builder::new()
            .prefix(".kiln-staging-")
            .tempdir_in(&parent)
            .map_err(|e| BuildError::io(&parent, e))?;
        let rootfs = staging.path().join(ROOTFS_DIR);
        backend
            .instantiate(&base, &rootfs)
            .map_err(|e| BuildError::io(&rootfs, e))?;
        debug!("Staging image at {}", staging.path().display());

        Ok(Self {
            name: name.into(),
            base,
            output,
            staging,
            artifacts: Vec::new(),
            claims: BTreeMap::new(),
            metadata: None,
        })
    }

    /// Staged root filesystem
    pub fn rootfs(&self) -> PathBuf {
        self.staging.path().join(ROOTFS_DIR)
    }

    /// Artifacts extracted so far
    pub fn artifacts(&self) -> &[Artifact] {
        &self.artifacts
    }

    /// Copy every file matching the stage's contract into the image
    pub fn extract(&mut self, output: &StageOutput) -> BuildResult<Vec<Artifact>> {
        let stage = &output.stage.name;
        let stage_root = output.root();
        let rootfs = self.rootfs();
        let mut extracted = Vec::new();

        for rule in output.stage.contract.rules() {
            let matches = rule.find_matches(&stage_root)?;
            if matches.is_empty() {
                return Err(BuildError::ContractUnsatisfied {
                    stage: stage.clone(),
                    pattern: rule.source.clone(),
                });
            }

            let dest_dir = rule.destination_dir()?;
            for relative in matches {
                let Some(file_name) = relative.file_name() else {
                    continue;
                };
                let destination = dest_dir.join(file_name);

                if let Some((owner, source)) = self.claims.get(&destination) {
                    if owner == stage && *source == relative {
                        continue;
                    }
                    return Err(BuildError::DestinationOverlap {
                        first: owner.clone(),
                        second: stage.clone(),
                        destination: format!("/{}", destination.display()),
                    });
                }

                let from = stage_root.join(&relative);
                let to = rootfs.join(&destination);
                if let Some(parent) = to.parent() {
                    fs::create_dir_all(parent).map_err(|e| BuildError::io(parent, e))?;
                }
                fs::copy(&from, &to).map_err(|e| BuildError::io(&from, e))?;
                let (size, sha256) = digest_file(&to).map_err(|e| BuildError::io(&to, e))?;
                debug!("Extracted {} -> /{}", relative.display(), destination.display());

                let artifact = Artifact {
                    stage: stage.clone(),
                    source: Path::new("/").join(&relative),
                    destination: Path::new("/").join(&destination),
                    kind: ArtifactKind::classify(&destination),
                    size,
                    sha256,
                };
                self.claims
                    .insert(destination, (stage.clone(), relative.clone()));
                self.artifacts.push(artifact.clone());
                extracted.push(artifact);
            }
        }

        info!("Extracted {} artifacts from '{}'", extracted.len(), stage);
        Ok(extracted)
    }

    /// Set the image identity and labels; applying the same metadata twice
    /// leaves the image unchanged
    pub fn apply_metadata(&mut self, metadata: &ImageMetadata) -> BuildResult<()> {
        metadata.validate()?;
        self.metadata = Some(metadata.clone());
        Ok(())
    }

    /// Write `image.json` and move the image to the output path
    pub fn publish(mut self) -> BuildResult<FinalImage> {
        let metadata = self.metadata.take().ok_or_else(|| {
            BuildError::metadata("user", "no execution identity was applied")
        })?;

        let mut artifacts = std::mem::take(&mut self.artifacts);
        artifacts.sort_by(|a, b| a.destination.cmp(&b.destination));
        let manifest = ImageManifest {
            name: self.name.clone(),
            base: self.base.clone(),
            metadata,
            artifacts,
        };

        let manifest_path = self.staging.path().join(IMAGE_MANIFEST_FILE);
        let json = serde_json::to_string_pretty(&manifest).map_err(|error| {
            BuildError::ImageManifest {
                path: manifest_path.clone(),
                error,
            }
        })?;
        fs::write(&manifest_path, json).map_err(|e| BuildError::io(&manifest_path, e))?;

        check_replaceable(&self.output)?;
        let previous = self.move_previous_aside()?;
        if let Err(e) = fs::rename(self.staging.path(), &self.output) {
            if let Some(backup) = &previous {
                if let Err(restore) = fs::rename(backup, &self.output) {
                    warn!(
                        "Could not restore previous image from {}: {}",
                        backup.display(),
                        restore
                    );
                }
            }
            return Err(BuildError::io(&self.output, e));
        }
        if let Some(backup) = previous {
            if let Err(e) = fs::remove_dir_all(&backup) {
                warn!("Could not remove previous image at {}: {}", backup.display(), e);
            }
        }
        info!("Published image '{}' at {}", self.name, self.output.display());

        Ok(FinalImage {
            path: self.output.clone(),
            manifest,
        })
    }

    /// Rename an existing image at the output path to its backup sibling
    fn move_previous_aside(&self) -> BuildResult<Option<PathBuf>> {
        if fs::symlink_metadata(&self.output).is_err() {
            return Ok(None);
        }
        let backup = backup_path(&self.output);
        if fs::symlink_metadata(&backup).is_ok() {
            check_replaceable(&backup)?;
            fs::remove_dir_all(&backup).map_err(|e| BuildError::io(&backup, e))?;
        }
        fs::rename(&self.output, &backup).map_err(|e| BuildError::io(&self.output, e))?;
        Ok(Some(backup))
    }
}

/// Fail unless `output` is absent or holds a previously published image
pub fn check_replaceable(output: &Path) -> BuildResult<()> {
    match fs::symlink_metadata(output) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(BuildError::io(output, e)),
        Ok(meta) if meta.is_dir() && output.join(IMAGE_MANIFEST_FILE).is_file() => Ok(()),
        Ok(_) => Err(BuildError::OutputOccupied {
            path: output.to_path_buf(),
        }),
    }
}

fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

/// Hidden sibling holding the previous image while a new one moves in
fn backup_path(output: &Path) -> PathBuf {
    let name = output
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "image".to_string());
    parent_dir(output).join(format!(".{}.kiln-previous", name))
}

fn digest_file(path: &Path) -> io::Result<(u64, String)> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let size = io::copy(&mut file, &mut hasher)?;
    Ok((size, format!("{:x}", hasher.finalize())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("vector.so", ArtifactKind::SharedObject)]
    #[case("libpq.so.5", ArtifactKind::SharedObject)]
    #[case("libfoo.a", ArtifactKind::SharedObject)]
    #[case("vector--0.8.1.sql", ArtifactKind::Metadata)]
    #[case("vector.control", ArtifactKind::Metadata)]
    fn test_classify(#[case] name: &str, #[case] expected: ArtifactKind) {
        assert_eq!(ArtifactKind::classify(Path::new(name)), expected);
    }

    #[test]
    fn test_metadata_validation() {
        assert!(ImageMetadata::new(26).validate().is_ok());
        assert!(matches!(
            ImageMetadata::new(0).validate(),
            Err(BuildError::Metadata { field, .. }) if field == "user"
        ));
        assert!(ImageMetadata::new(26)
            .with_label("has space", "x")
            .validate()
            .is_err());
        assert!(ImageMetadata::new(26).with_label("", "x").validate().is_err());
        assert!(ImageMetadata::new(26)
            .with_label("title", "line\nbreak")
            .validate()
            .is_err());
    }

    #[test]
    fn test_manifest_json_shape() {
        let manifest = ImageManifest {
            name: "pg".to_string(),
            base: "postgres:17".to_string(),
            metadata: ImageMetadata::new(26).with_label("title", "pg"),
            artifacts: Vec::new(),
        };
        let value = serde_json::to_value(&manifest).unwrap();
        assert_eq!(value["user"], 26);
        assert_eq!(value["group"], 26);
        assert_eq!(value["labels"]["title"], "pg");
    }

    #[test]
    fn test_check_replaceable() {
        let dir = tempfile::TempDir::new().unwrap();
        assert!(check_replaceable(&dir.path().join("absent")).is_ok());

        let image = dir.path().join("image");
        fs::create_dir_all(&image).unwrap();
        fs::write(image.join(IMAGE_MANIFEST_FILE), "{}").unwrap();
        assert!(check_replaceable(&image).is_ok());

        let thesis = dir.path().join("thesis");
        fs::create_dir_all(&thesis).unwrap();
        fs::write(thesis.join("thesis.tex"), "draft").unwrap();
        assert!(matches!(
            check_replaceable(&thesis),
            Err(BuildError::OutputOccupied { path }) if path == thesis
        ));

        let file = dir.path().join("notes.txt");
        fs::write(&file, "x").unwrap();
        assert!(check_replaceable(&file).is_err());
    }

    #[test]
    fn test_backup_path_is_hidden_sibling() {
        assert_eq!(
            backup_path(Path::new("/work/images/pg")),
            PathBuf::from("/work/images/.pg.kiln-previous")
        );
    }
}
