//! Template document parsing.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use tracing::debug;

use crate::error::{TemplateError, TemplateResult};
use crate::images::ImageCatalog;
use crate::manifest::{Template, DEFAULT_SHELL};
use crate::validator::ValidationPipeline;

/// Slug used when nothing usable is left of the name.
pub const FALLBACK_SLUG: &str = "template";

const SLUG_REPLACEMENTS: &[(&str, &str)] = &[
    ("(simplified)", ""),
    ("(apt)", ""),
    ("(dnf)", ""),
    ("(ami)", ""),
    ("+ conda stack", "-conda"),
    ("machine learning", "ml"),
    ("development", "dev"),
    ("environment", "env"),
    ("simplified", ""),
    ("research", ""),
    ("basic", ""),
];

/// Derive a short identifier from a display name.
///
/// `"Python Machine Learning (Simplified)"` becomes `"python-ml"`.
pub fn derive_slug(name: &str) -> String {
    let mut slug = name.to_lowercase();
    for (from, to) in SLUG_REPLACEMENTS {
        slug = slug.replace(from, to);
    }

    let mut out = String::with_capacity(slug.len());
    let mut pending_dash = false;
    for c in slug.chars() {
        if c.is_ascii_lowercase() || c.is_ascii_digit() {
            if pending_dash && !out.is_empty() {
                out.push('-');
            }
            pending_dash = false;
            out.push(c);
        } else if c.is_whitespace() || c == '-' {
            pending_dash = true;
        }
    }

    if out.is_empty() {
        FALLBACK_SLUG.to_string()
    } else {
        out
    }
}

/// Fill in defaults that the document may leave implicit.
pub fn apply_defaults(template: &mut Template) {
    for service in &mut template.services {
        if service.port != 0 && service.enable.is_none() {
            service.enable = Some(true);
        }
    }
    for user in &mut template.users {
        if user.shell.as_deref().map_or(true, str::is_empty) {
            user.shell = Some(DEFAULT_SHELL.to_string());
        }
    }
    if template.slug.is_empty() {
        template.slug = derive_slug(&template.name);
    }
}

/// Parses template documents and validates them fail-fast.
pub struct TemplateParser {
    pipeline: ValidationPipeline,
}

impl TemplateParser {
    pub fn new(catalog: Arc<ImageCatalog>) -> Self {
        Self {
            pipeline: ValidationPipeline::new(catalog),
        }
    }

    /// Use a custom validation pipeline.
    pub fn with_pipeline(pipeline: ValidationPipeline) -> Self {
        Self { pipeline }
    }

    pub fn pipeline(&self) -> &ValidationPipeline {
        &self.pipeline
    }

    /// Parse a YAML document.
    pub fn parse(&self, bytes: &[u8]) -> TemplateResult<Template> {
        let template: Template = serde_yaml::from_slice(bytes)?;
        self.finish(template)
    }

    pub fn parse_str(&self, content: &str) -> TemplateResult<Template> {
        self.parse(content.as_bytes())
    }

    /// Parse a template file. A document without a `name` takes the file stem.
    pub fn parse_file(&self, path: &Path) -> TemplateResult<Template> {
        debug!("Parsing template file {:?}", path);
        let result = fs::read(path)
            .map_err(TemplateError::from)
            .and_then(|bytes| {
                serde_yaml::from_slice::<Template>(&bytes).map_err(TemplateError::from)
            })
            .and_then(|mut template| {
                if template.name.trim().is_empty() {
                    if let Some(stem) = path.file_stem() {
                        template.name = stem.to_string_lossy().into_owned();
                    }
                }
                self.finish(template)
            });
        result.map_err(|e| e.at_path(path))
    }

    fn finish(&self, mut template: Template) -> TemplateResult<Template> {
        apply_defaults(&mut template);
        self.pipeline.validate(&template)?;
        Ok(template)
    }
}
