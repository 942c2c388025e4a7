//! Artifact contracts: what a stage promises to leave in its filesystem
//!
//! A rule pairs a glob pattern inside the stage filesystem with a destination
//! directory in the final image. Patterns follow `glob` semantics with
//! `require_literal_separator`, so `*` never crosses a `/`.

use crate::error::{BuildError, BuildResult};
use glob::{MatchOptions, Pattern};
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// One (source pattern, destination directory) pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactRule {
    /// Glob pattern inside the stage filesystem (absolute-style, e.g. `/usr/lib/libA*.so`)
    pub source: String,
    /// Destination directory inside the final image
    pub destination: String,
}

impl ArtifactRule {
    /// Create a new rule
    pub fn new(source: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
        }
    }

    /// Pattern relative to the stage root
    pub fn relative_source(&self) -> &str {
        self.source.trim_start_matches('/')
    }

    /// Compile the source pattern
    pub fn pattern(&self) -> BuildResult<Pattern> {
        Pattern::new(self.relative_source()).map_err(|e| {
            BuildError::InvalidDefinition(format!(
                "invalid artifact pattern '{}': {}",
                self.source, e
            ))
        })
    }

    /// Destination directory relative to the image root
    pub fn destination_dir(&self) -> BuildResult<PathBuf> {
        normalize(&self.destination).ok_or_else(|| {
            BuildError::InvalidDefinition(format!(
                "artifact destination '{}' must stay inside the image",
                self.destination
            ))
        })
    }

    /// Literal directory prefix of the pattern; the only subtree worth walking
    pub fn search_root(&self) -> PathBuf {
        let mut root = PathBuf::new();
        let components: Vec<&str> = self.relative_source().split('/').collect();
        let dirs = components.len().saturating_sub(1);
        for part in &components[..dirs] {
            if has_wildcard(part) {
                break;
            }
            root.push(part);
        }
        root
    }

    /// Final path component of the pattern
    pub fn file_name_pattern(&self) -> &str {
        self.relative_source()
            .rsplit('/')
            .next()
            .unwrap_or_default()
    }

    /// Check the rule is well-formed
    pub fn validate(&self) -> BuildResult<()> {
        if self.relative_source().is_empty() || self.file_name_pattern().is_empty() {
            return Err(BuildError::InvalidDefinition(format!(
                "artifact pattern '{}' must name files",
                self.source
            )));
        }
        if self.relative_source().split('/').any(|part| part == "..") {
            return Err(BuildError::InvalidDefinition(format!(
                "artifact pattern '{}' must stay inside the stage filesystem",
                self.source
            )));
        }
        self.pattern()?;
        self.destination_dir()?;
        Ok(())
    }

    /// Files under `root` matching this rule, as sorted root-relative paths
    pub fn find_matches(&self, root: &Path) -> BuildResult<Vec<PathBuf>> {
        let pattern = self.pattern()?;
        let start = root.join(self.search_root());
        if !start.exists() {
            return Ok(Vec::new());
        }

        let mut matches = Vec::new();
        for entry in WalkDir::new(&start).follow_links(false) {
            let entry = entry.map_err(|e| {
                let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| start.clone());
                BuildError::io(path, std::io::Error::from(e))
            })?;
            if entry.file_type().is_dir() {
                continue;
            }
            let relative = match entry.path().strip_prefix(root) {
                Ok(rel) => rel,
                Err(_) => continue,
            };
            if pattern.matches_path_with(relative, MATCH_OPTIONS) {
                matches.push(relative.to_path_buf());
            }
        }

        matches.sort();
        Ok(matches)
    }

    /// Whether this rule and `other` could deliver a file to the same path
    ///
    /// Conservative: two file-name patterns collide unless their literal
    /// prefixes or literal suffixes rule out a common name.
    pub fn may_overlap(&self, other: &ArtifactRule) -> BuildResult<bool> {
        if self.destination_dir()? != other.destination_dir()? {
            return Ok(false);
        }
        Ok(names_may_collide(
            self.file_name_pattern(),
            other.file_name_pattern(),
        ))
    }
}

/// Ordered artifact rules of one stage
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArtifactContract {
    rules: Vec<ArtifactRule>,
}

impl ArtifactContract {
    /// Create an empty contract
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a rule
    pub fn with_rule(mut self, source: impl Into<String>, destination: impl Into<String>) -> Self {
        self.rules.push(ArtifactRule::new(source, destination));
        self
    }

    /// Append a rule
    pub fn push(&mut self, rule: ArtifactRule) {
        self.rules.push(rule);
    }

    /// Rules in declaration order
    pub fn rules(&self) -> &[ArtifactRule] {
        &self.rules
    }

    /// Check if the contract has no rules
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Validate every rule; an empty contract is a definition error
    pub fn validate(&self, stage: &str) -> BuildResult<()> {
        if self.rules.is_empty() {
            return Err(BuildError::InvalidDefinition(format!(
                "stage '{}' declares no artifacts",
                stage
            )));
        }
        for rule in &self.rules {
            rule.validate()?;
        }
        Ok(())
    }
}

/// Refuse contracts of different stages that could write the same path
pub fn check_disjoint<'a, I>(contracts: I) -> BuildResult<()>
where
    I: IntoIterator<Item = (&'a str, &'a ArtifactContract)>,
{
    let contracts: Vec<(&str, &ArtifactContract)> = contracts.into_iter().collect();

    for (i, (first, a)) in contracts.iter().enumerate() {
        for (second, b) in &contracts[i + 1..] {
            for rule_a in a.rules() {
                for rule_b in b.rules() {
                    if rule_a.may_overlap(rule_b)? {
                        let destination = rule_a
                            .destination_dir()?
                            .join(rule_a.file_name_pattern())
                            .display()
                            .to_string();
                        return Err(BuildError::DestinationOverlap {
                            first: first.to_string(),
                            second: second.to_string(),
                            destination: format!("/{}", destination),
                        });
                    }
                }
            }
        }
    }

    Ok(())
}

fn has_wildcard(s: &str) -> bool {
    s.contains(['*', '?', '['])
}

/// Text before the first wildcard
fn literal_prefix(pattern: &str) -> &str {
    match pattern.find(['*', '?', '[']) {
        Some(i) => &pattern[..i],
        None => pattern,
    }
}

/// Text after the last wildcard or character class
fn literal_suffix(pattern: &str) -> &str {
    match pattern.rfind(['*', '?', ']']) {
        Some(i) => &pattern[i + 1..],
        None => pattern,
    }
}

fn names_may_collide(a: &str, b: &str) -> bool {
    match (has_wildcard(a), has_wildcard(b)) {
        (false, false) => a == b,
        (true, false) => Pattern::new(a).map(|p| p.matches(b)).unwrap_or(true),
        (false, true) => Pattern::new(b).map(|p| p.matches(a)).unwrap_or(true),
        (true, true) => {
            let (pa, pb) = (literal_prefix(a), literal_prefix(b));
            let (sa, sb) = (literal_suffix(a), literal_suffix(b));
            let prefixes = pa.starts_with(pb) || pb.starts_with(pa);
            let suffixes = sa.ends_with(sb) || sb.ends_with(sa);
            prefixes && suffixes
        }
    }
}

/// Collapse a destination into image-relative normal components
fn normalize(path: &str) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in Path::new(path).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::RootDir | Component::CurDir => {}
            Component::ParentDir | Component::Prefix(_) => return None,
        }
    }
    Some(out)
}
