//! Build parameter declaration and resolution
//!
//! Parameters are declared globally or per stage, each with an optional
//! default and a type. Resolution merges caller overrides over defaults and is
//! pure: ordered maps throughout, so identical inputs always produce an
//! identical mapping.

use crate::error::{BuildError, BuildResult};
use crate::template::{self, TemplateError};
use kiln_config::loader::param_env_var;
use std::collections::{BTreeMap, BTreeSet};

pub use kiln_config::ParameterType;

/// Where a parameter is visible
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ParameterScope {
    /// Visible to every stage and to the image definition
    Global,
    /// Visible to one stage only, shadowing a global of the same name
    Stage(String),
}

/// A declared parameter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterDecl {
    pub name: String,
    pub kind: ParameterType,
    pub default: Option<String>,
    pub scope: ParameterScope,
}

impl ParameterDecl {
    /// Declare a global parameter
    pub fn global(name: impl Into<String>, kind: ParameterType) -> Self {
        Self {
            name: name.into(),
            kind,
            default: None,
            scope: ParameterScope::Global,
        }
    }

    /// Declare a parameter scoped to one stage
    pub fn stage(stage: impl Into<String>, name: impl Into<String>, kind: ParameterType) -> Self {
        Self {
            name: name.into(),
            kind,
            default: None,
            scope: ParameterScope::Stage(stage.into()),
        }
    }

    /// Set the default value
    pub fn with_default(mut self, default: impl Into<String>) -> Self {
        self.default = Some(default.into());
        self
    }

    /// Override key: `name` for globals, `stage.name` for stage parameters
    pub fn key(&self) -> String {
        match &self.scope {
            ParameterScope::Global => self.name.clone(),
            ParameterScope::Stage(stage) => format!("{}.{}", stage, self.name),
        }
    }

    fn check_value(&self, value: &str) -> BuildResult<()> {
        let ok = match self.kind {
            ParameterType::String => true,
            ParameterType::Integer => value.parse::<i64>().is_ok(),
            ParameterType::Bool => matches!(value, "true" | "false"),
        };
        if ok {
            Ok(())
        } else {
            Err(BuildError::InvalidParameter {
                parameter: self.key(),
                reason: format!("expected {}, got '{}'", self.kind, value),
            })
        }
    }
}

/// The declared parameters of a pipeline
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParameterSet {
    decls: BTreeMap<String, ParameterDecl>,
}

impl ParameterSet {
    /// Create an empty parameter set
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a declaration; keys must be unique
    pub fn declare(&mut self, decl: ParameterDecl) -> BuildResult<()> {
        let key = decl.key();
        if self.decls.contains_key(&key) {
            return Err(BuildError::InvalidDefinition(format!(
                "parameter '{}' declared twice",
                key
            )));
        }
        if let Some(other) = self.decls.values().find(|d| env_collision(d, &decl)) {
            return Err(BuildError::InvalidDefinition(format!(
                "parameters '{}' and '{}' map to the same environment variable",
                other.key(),
                key
            )));
        }
        if let Some(default) = &decl.default {
            decl.check_value(default)?;
        }
        self.decls.insert(key, decl);
        Ok(())
    }

    /// Builder-style [`declare`](Self::declare)
    pub fn with(mut self, decl: ParameterDecl) -> BuildResult<Self> {
        self.declare(decl)?;
        Ok(self)
    }

    /// Look up a declaration by override key
    pub fn get(&self, key: &str) -> Option<&ParameterDecl> {
        self.decls.get(key)
    }

    /// Number of declarations
    pub fn len(&self) -> usize {
        self.decls.len()
    }

    /// Check if no parameters are declared
    pub fn is_empty(&self) -> bool {
        self.decls.is_empty()
    }

    /// All declarations, ordered by key
    pub fn iter(&self) -> impl Iterator<Item = &ParameterDecl> {
        self.decls.values()
    }

    /// Merge overrides over defaults
    ///
    /// Parameters with neither a default nor an override stay unresolved;
    /// that is only an error once something references them. Overrides for
    /// undeclared keys are rejected so typos cannot silently fall back to a
    /// default.
    pub fn resolve(
        &self,
        overrides: &BTreeMap<String, String>,
    ) -> BuildResult<ResolvedParameters> {
        for key in overrides.keys() {
            if !self.decls.contains_key(key) {
                return Err(BuildError::InvalidParameter {
                    parameter: key.clone(),
                    reason: "no such parameter is declared".to_string(),
                });
            }
        }

        let mut values = BTreeMap::new();
        let mut stage_declared: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for (key, decl) in &self.decls {
            if let ParameterScope::Stage(stage) = &decl.scope {
                stage_declared
                    .entry(stage.clone())
                    .or_default()
                    .insert(decl.name.clone());
            }
            let value = overrides.get(key).or(decl.default.as_ref());
            if let Some(value) = value {
                decl.check_value(value)?;
                values.insert(key.clone(), value.clone());
            }
        }

        Ok(ResolvedParameters {
            values,
            stage_declared,
        })
    }
}

/// Two declarations whose values would land in one `KILN_PARAM_*` variable,
/// either as override keys or as names visible to the same stage
fn env_collision(a: &ParameterDecl, b: &ParameterDecl) -> bool {
    if param_env_var(&a.key()) == param_env_var(&b.key()) {
        return true;
    }
    let visible_together = match (&a.scope, &b.scope) {
        (ParameterScope::Stage(x), ParameterScope::Stage(y)) => x == y,
        _ => true,
    };
    visible_together && a.name != b.name && param_env_var(&a.name) == param_env_var(&b.name)
}

/// Concrete parameter values keyed by override key
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedParameters {
    values: BTreeMap<String, String>,
    /// Stage name -> names declared in that stage's scope
    stage_declared: BTreeMap<String, BTreeSet<String>>,
}

impl ResolvedParameters {
    /// Value for an override key
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// All resolved values
    pub fn values(&self) -> &BTreeMap<String, String> {
        &self.values
    }

    /// View seen by the image definition (globals only)
    pub fn global_scope(&self) -> ParameterView<'_> {
        ParameterView {
            params: self,
            stage: None,
            referenced: BTreeMap::new(),
        }
    }

    /// View seen by one stage (its own parameters, then globals)
    pub fn scope_for<'a>(&'a self, stage: &'a str) -> ParameterView<'a> {
        ParameterView {
            params: self,
            stage: Some(stage),
            referenced: BTreeMap::new(),
        }
    }
}

/// Parameter lookup for one scope that records every name it hands out
#[derive(Debug)]
pub struct ParameterView<'a> {
    params: &'a ResolvedParameters,
    stage: Option<&'a str>,
    referenced: BTreeMap<String, String>,
}

impl<'a> ParameterView<'a> {
    /// Look a plain parameter name up in this scope
    pub fn lookup(&self, name: &str) -> Option<&'a str> {
        lookup_in(self.params, self.stage, name)
    }

    /// Render a template in this scope
    pub fn render(&mut self, template: &str) -> BuildResult<String> {
        let params = self.params;
        let stage = self.stage;
        let referenced = &mut self.referenced;

        let rendered = template::render(template, |name| {
            let value = lookup_in(params, stage, name)?;
            referenced.insert(name.to_string(), value.to_string());
            Some(value.to_string())
        });

        rendered.map_err(|e| match e {
            TemplateError::Unresolved(parameter) => BuildError::UnresolvedParameter {
                scope: self.describe(),
                parameter,
            },
            other => BuildError::InvalidDefinition(format!("{}: {}", self.describe(), other)),
        })
    }

    /// Record every parameter declared in this stage's own scope, whether or
    /// not a template mentions it
    ///
    /// Build commands may read these only as `$KILN_PARAM_*`, so each one
    /// must have a value.
    pub fn bind_stage_parameters(&mut self) -> BuildResult<()> {
        let params = self.params;
        let Some(stage) = self.stage else {
            return Ok(());
        };
        let Some(names) = params.stage_declared.get(stage) else {
            return Ok(());
        };
        for name in names {
            match lookup_in(params, Some(stage), name) {
                Some(value) => {
                    self.referenced.insert(name.clone(), value.to_string());
                }
                None => {
                    return Err(BuildError::UnresolvedParameter {
                        scope: self.describe(),
                        parameter: name.clone(),
                    })
                }
            }
        }
        Ok(())
    }

    /// Parameters referenced through this view so far, by plain name
    pub fn referenced(&self) -> &BTreeMap<String, String> {
        &self.referenced
    }

    /// Consume the view, returning the referenced parameters
    pub fn into_referenced(self) -> BTreeMap<String, String> {
        self.referenced
    }

    fn describe(&self) -> String {
        match self.stage {
            Some(stage) => format!("stage '{}'", stage),
            None => "the image definition".to_string(),
        }
    }
}

fn lookup_in<'a>(
    params: &'a ResolvedParameters,
    stage: Option<&str>,
    name: &str,
) -> Option<&'a str> {
    if let Some(stage) = stage {
        if let Some(value) = params.get(&format!("{}.{}", stage, name)) {
            return Some(value);
        }
    }
    params.get(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn set() -> ParameterSet {
        ParameterSet::new()
            .with(ParameterDecl::global("pg_major", ParameterType::Integer).with_default("17"))
            .unwrap()
            .with(
                ParameterDecl::stage("ext-a", "version", ParameterType::String)
                    .with_default("0.8.1"),
            )
            .unwrap()
            .with(ParameterDecl::global("toolchain", ParameterType::String))
            .unwrap()
    }

    #[test]
    fn test_defaults_resolve() {
        let resolved = set().resolve(&BTreeMap::new()).unwrap();
        assert_eq!(resolved.get("pg_major"), Some("17"));
        assert_eq!(resolved.get("ext-a.version"), Some("0.8.1"));
        assert_eq!(resolved.get("toolchain"), None);
    }

    #[test]
    fn test_overrides_win() {
        let mut overrides = BTreeMap::new();
        overrides.insert("ext-a.version".to_string(), "0.7.4".to_string());
        overrides.insert("toolchain".to_string(), "1.80.0".to_string());
        let resolved = set().resolve(&overrides).unwrap();
        assert_eq!(resolved.get("ext-a.version"), Some("0.7.4"));
        assert_eq!(resolved.get("toolchain"), Some("1.80.0"));
    }

    #[test]
    fn test_undeclared_override_rejected() {
        let mut overrides = BTreeMap::new();
        overrides.insert("pg_majro".to_string(), "16".to_string());
        assert!(matches!(
            set().resolve(&overrides),
            Err(BuildError::InvalidParameter { parameter, .. }) if parameter == "pg_majro"
        ));
    }

    #[test]
    fn test_type_checked() {
        let mut overrides = BTreeMap::new();
        overrides.insert("pg_major".to_string(), "seventeen".to_string());
        assert!(matches!(
            set().resolve(&overrides),
            Err(BuildError::InvalidParameter { .. })
        ));

        let bad_default = ParameterDecl::global("debug", ParameterType::Bool).with_default("yes");
        assert!(ParameterSet::new().with(bad_default).is_err());
    }

    #[test]
    fn test_duplicate_declaration_rejected() {
        let result = set().with(ParameterDecl::global("pg_major", ParameterType::Integer));
        assert!(matches!(result, Err(BuildError::InvalidDefinition(_))));
    }

    #[test]
    fn test_stage_scope_shadows_global() {
        let params = ParameterSet::new()
            .with(ParameterDecl::global("version", ParameterType::String).with_default("1"))
            .unwrap()
            .with(ParameterDecl::stage("a", "version", ParameterType::String).with_default("2"))
            .unwrap();
        let resolved = params.resolve(&BTreeMap::new()).unwrap();

        assert_eq!(resolved.scope_for("a").lookup("version"), Some("2"));
        assert_eq!(resolved.scope_for("b").lookup("version"), Some("1"));
        assert_eq!(resolved.global_scope().lookup("version"), Some("1"));
    }

    #[test]
    fn test_render_records_references() {
        let resolved = set().resolve(&BTreeMap::new()).unwrap();
        let mut view = resolved.scope_for("ext-a");
        let out = view.render("v{{version}} for pg{{pg_major}}").unwrap();
        assert_eq!(out, "v0.8.1 for pg17");

        let referenced = view.into_referenced();
        assert_eq!(referenced.len(), 2);
        assert_eq!(referenced.get("version"), Some(&"0.8.1".to_string()));
    }

    #[test]
    fn test_render_unresolved_names_scope() {
        let resolved = set().resolve(&BTreeMap::new()).unwrap();
        let mut view = resolved.scope_for("ext-b");
        match view.render("{{toolchain}}") {
            Err(BuildError::UnresolvedParameter { scope, parameter }) => {
                assert_eq!(scope, "stage 'ext-b'");
                assert_eq!(parameter, "toolchain");
            }
            other => panic!("Expected UnresolvedParameter, got {:?}", other),
        }
    }

    #[test]
    fn test_env_var_collisions_rejected() {
        let dashed = ParameterSet::new()
            .with(ParameterDecl::global("pg_major", ParameterType::Integer))
            .unwrap()
            .with(ParameterDecl::global("pg-major", ParameterType::Integer));
        assert!(matches!(dashed, Err(BuildError::InvalidDefinition(_))));

        let nested = ParameterSet::new()
            .with(ParameterDecl::global("a__b", ParameterType::String))
            .unwrap()
            .with(ParameterDecl::stage("a", "b", ParameterType::String));
        assert!(matches!(nested, Err(BuildError::InvalidDefinition(_))));

        let stage_and_global = ParameterSet::new()
            .with(ParameterDecl::global("pg_major", ParameterType::Integer))
            .unwrap()
            .with(ParameterDecl::stage("a", "pg-major", ParameterType::Integer));
        assert!(stage_and_global.is_err());
    }

    #[test]
    fn test_env_var_names_may_repeat_across_stages() {
        let params = ParameterSet::new()
            .with(ParameterDecl::stage("a", "pg_major", ParameterType::Integer))
            .unwrap()
            .with(ParameterDecl::stage("b", "pg-major", ParameterType::Integer));
        assert!(params.is_ok());
    }

    #[test]
    fn test_bind_stage_parameters() {
        let params = set()
            .with(
                ParameterDecl::stage("ext-a", "features", ParameterType::String)
                    .with_default("avx2"),
            )
            .unwrap();
        let resolved = params.resolve(&BTreeMap::new()).unwrap();

        let mut view = resolved.scope_for("ext-a");
        view.bind_stage_parameters().unwrap();
        let referenced = view.into_referenced();
        assert_eq!(referenced.get("features"), Some(&"avx2".to_string()));
        assert_eq!(referenced.get("version"), Some(&"0.8.1".to_string()));
        assert_eq!(referenced.get("pg_major"), None);

        let mut other = resolved.scope_for("ext-b");
        other.bind_stage_parameters().unwrap();
        assert!(other.referenced().is_empty());
    }

    #[test]
    fn test_bind_stage_parameters_requires_values() {
        let params = ParameterSet::new()
            .with(ParameterDecl::stage("ext", "token", ParameterType::String))
            .unwrap();
        let resolved = params.resolve(&BTreeMap::new()).unwrap();
        match resolved.scope_for("ext").bind_stage_parameters() {
            Err(BuildError::UnresolvedParameter { scope, parameter }) => {
                assert_eq!(scope, "stage 'ext'");
                assert_eq!(parameter, "token");
            }
            other => panic!("Expected UnresolvedParameter, got {:?}", other),
        }
    }
}
