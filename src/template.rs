//! Template Rendering
//!
//! The render seam used for script bodies, output path expressions and
//! expectation commands. Expressions reference the job namespace with
//! `{{dotted.path}}` placeholders, e.g. `{{i.infile}}`, `{{job.outdir}}`,
//! `{{o.result}}`.
//!
//! Rendering is total: an unresolvable placeholder is an error, never
//! silently dropped.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use thiserror::Error;

/// Matches `{{ path.to.var }}` placeholders.
static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*(?:\.[A-Za-z0-9_]+)*)\s*\}\}").unwrap());

/// Errors raised while rendering a template.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TemplateError {
    #[error("undefined variable '{0}' in template")]
    UndefinedVariable(String),

    #[error("variable '{0}' is not renderable as text")]
    NotRenderable(String),
}

/// A compiled template expression.
///
/// Templates are cheap to clone and carry only their source text; all
/// resolution happens at render time against a JSON namespace.
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    source: String,
}

impl Template {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
        }
    }

    /// Returns the raw template text.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Returns true if the template has no content.
    pub fn is_empty(&self) -> bool {
        self.source.trim().is_empty()
    }

    /// Renders the template against a namespace.
    ///
    /// Every placeholder must resolve; strings render verbatim, numbers and
    /// booleans via their display form, arrays as space-joined elements.
    pub fn render(&self, data: &Value) -> Result<String, TemplateError> {
        let mut out = String::with_capacity(self.source.len());
        let mut last = 0;

        for caps in PLACEHOLDER.captures_iter(&self.source) {
            let whole = caps.get(0).unwrap();
            let path = caps.get(1).unwrap().as_str();

            out.push_str(&self.source[last..whole.start()]);
            out.push_str(&render_value(lookup(data, path)?, path)?);
            last = whole.end();
        }

        out.push_str(&self.source[last..]);
        Ok(out)
    }
}

/// Resolves a dotted path inside a JSON namespace.
fn lookup<'a>(data: &'a Value, path: &str) -> Result<&'a Value, TemplateError> {
    let mut current = data;
    for part in path.split('.') {
        current = match current {
            Value::Object(map) => map
                .get(part)
                .ok_or_else(|| TemplateError::UndefinedVariable(path.to_string()))?,
            _ => return Err(TemplateError::UndefinedVariable(path.to_string())),
        };
    }
    Ok(current)
}

/// Converts a resolved value into its textual form.
fn render_value(value: &Value, path: &str) -> Result<String, TemplateError> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        Value::Array(items) => {
            let parts: Result<Vec<String>, TemplateError> = items
                .iter()
                .map(|item| render_value(item, path))
                .collect();
            Ok(parts?.join(" "))
        }
        Value::Null | Value::Object(_) => Err(TemplateError::NotRenderable(path.to_string())),
    }
}
