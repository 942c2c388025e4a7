//! `{{name}}` placeholder substitution for stage strings
//!
//! Placeholders use double braces so they never collide with shell
//! `$VAR`/`${VAR}` syntax inside build commands.

use std::fmt;

/// Template rendering failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplateError {
    /// Placeholder name has no value
    Unresolved(String),
    /// `{{` without a closing `}}`
    Unterminated(String),
    /// `{{}}` or whitespace only
    EmptyName(String),
}

impl fmt::Display for TemplateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unresolved(name) => write!(f, "unresolved placeholder '{{{{{}}}}}'", name),
            Self::Unterminated(template) => {
                write!(f, "unterminated placeholder in '{}'", template)
            }
            Self::EmptyName(template) => write!(f, "empty placeholder in '{}'", template),
        }
    }
}

/// Render a template, looking each placeholder name up with `lookup`
pub fn render<F>(template: &str, mut lookup: F) -> Result<String, TemplateError>
where
    F: FnMut(&str) -> Option<String>,
{
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after
            .find("}}")
            .ok_or_else(|| TemplateError::Unterminated(template.to_string()))?;
        let name = after[..end].trim();
        if name.is_empty() {
            return Err(TemplateError::EmptyName(template.to_string()));
        }
        let value = lookup(name).ok_or_else(|| TemplateError::Unresolved(name.to_string()))?;
        out.push_str(&value);
        rest = &after[end + 2..];
    }

    out.push_str(rest);
    Ok(out)
}

/// Placeholder names referenced by a template, in order of first use
pub fn references(template: &str) -> Result<Vec<String>, TemplateError> {
    let mut names: Vec<String> = Vec::new();
    render(template, |name| {
        if !names.iter().any(|n| n == name) {
            names.push(name.to_string());
        }
        Some(String::new())
    })?;
    Ok(names)
}
