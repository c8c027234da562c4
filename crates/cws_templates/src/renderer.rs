//! `{{placeholder}}` substitution.
//!
//! Used for the script skeleton slots and for template parameter values.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::{Captures, Regex};

use crate::error::{TemplateError, TemplateResult};

fn placeholder_pattern() -> TemplateResult<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"\{\{\s*([a-zA-Z_][a-zA-Z0-9_]*)\s*\}\}").ok())
        .as_ref()
        .ok_or_else(|| TemplateError::ScriptGeneration("invalid placeholder pattern".into()))
}

/// Placeholder renderer.
#[derive(Debug, Clone, Copy, Default)]
pub struct TemplateRenderer {
    /// Fail on placeholders that have no value instead of leaving them as-is.
    strict: bool,
}

impl TemplateRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    /// A renderer that rejects unknown placeholders.
    pub fn strict() -> Self {
        Self { strict: true }
    }

    /// Replace every `{{name}}` in `content` with its value. Unknown names are
    /// left untouched unless the renderer is strict.
    pub fn render_content(
        &self,
        content: &str,
        variables: &BTreeMap<String, String>,
    ) -> TemplateResult<String> {
        let pattern = placeholder_pattern()?;
        let mut missing = None;
        let rendered = pattern.replace_all(content, |caps: &Captures| {
            let name = &caps[1];
            match variables.get(name) {
                Some(value) => value.clone(),
                None => {
                    if missing.is_none() {
                        missing = Some(name.to_string());
                    }
                    caps[0].to_string()
                }
            }
        });

        match missing {
            Some(name) if self.strict => Err(TemplateError::MissingParameter(name)),
            _ => Ok(rendered.into_owned()),
        }
    }

    /// Names of every placeholder in `content`, in order of appearance.
    pub fn placeholders(&self, content: &str) -> TemplateResult<Vec<String>> {
        let pattern = placeholder_pattern()?;
        let mut names: Vec<String> = Vec::new();
        for caps in pattern.captures_iter(content) {
            let name = caps[1].to_string();
            if !names.contains(&name) {
                names.push(name);
            }
        }
        Ok(names)
    }

    /// Render each string of a list in place.
    pub fn render_all(
        &self,
        items: &mut [String],
        variables: &BTreeMap<String, String>,
    ) -> TemplateResult<()> {
        for item in items.iter_mut() {
            *item = self.render_content(item, variables)?;
        }
        Ok(())
    }
}
