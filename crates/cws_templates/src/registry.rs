//! In-memory registry of every template found in the configured directories.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::error::{TemplateError, TemplateResult};
use crate::inheritance;
use crate::loader::TemplateLoader;
use crate::manifest::Template;
use crate::parser::TemplateParser;
use crate::validator::ValidationPipeline;

/// Templates keyed by name, with a secondary slug index. Rebuilt fully by
/// each [`scan`](TemplateRegistry::scan).
#[derive(Debug, Clone, Default)]
pub struct TemplateRegistry {
    dirs: Vec<PathBuf>,
    templates: BTreeMap<String, Arc<Template>>,
    slug_index: BTreeMap<String, String>,
    sources: BTreeMap<String, PathBuf>,
    last_scan: Option<DateTime<Utc>>,
}

impl TemplateRegistry {
    pub fn new<I, P>(dirs: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self {
            dirs: dirs.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    /// Build a registry from already-parsed templates and resolve their
    /// inheritance. Earlier templates win on name collisions.
    pub fn from_templates(templates: impl IntoIterator<Item = Template>) -> TemplateResult<Self> {
        let mut registry = Self::default();
        let entries = templates.into_iter().map(|t| (None, t));
        registry.rebuild(entries, None)?;
        Ok(registry)
    }

    pub fn dirs(&self) -> &[PathBuf] {
        &self.dirs
    }

    /// Reload every directory, replacing the current contents. Returns the
    /// number of templates registered.
    pub fn scan(&mut self, parser: &TemplateParser) -> TemplateResult<usize> {
        let loader = TemplateLoader::new(self.dirs.iter().cloned());
        let loaded = loader.load_all(parser)?;
        self.rebuild(
            loaded.into_iter().map(|(path, t)| (Some(path), t)),
            Some(parser.pipeline()),
        )?;
        info!(
            "Scanned {} template directories, registered {} templates",
            self.dirs.len(),
            self.templates.len()
        );
        Ok(self.templates.len())
    }

    /// Merged templates are checked again when a pipeline is given, since a
    /// child can combine its own fields with inherited ones into an invalid
    /// whole.
    fn rebuild(
        &mut self,
        entries: impl Iterator<Item = (Option<PathBuf>, Template)>,
        pipeline: Option<&ValidationPipeline>,
    ) -> TemplateResult<()> {
        let mut raw: BTreeMap<String, Template> = BTreeMap::new();
        let mut slug_index = BTreeMap::new();
        let mut sources = BTreeMap::new();

        for (path, template) in entries {
            if raw.contains_key(&template.name) {
                warn!(
                    "Duplicate template name '{}' in {:?}; keeping the first one",
                    template.name, path
                );
                continue;
            }
            if !template.slug.is_empty() {
                slug_index
                    .entry(template.slug.clone())
                    .or_insert_with(|| template.name.clone());
            }
            if let Some(path) = path {
                sources.insert(template.name.clone(), path);
            }
            raw.insert(template.name.clone(), template);
        }

        let mut templates = BTreeMap::new();
        for (name, template) in &raw {
            let resolved = if template.has_inheritance() {
                let merged = inheritance::resolve(name, &raw)?;
                if let Some(pipeline) = pipeline {
                    if let Err(err) = pipeline.validate(&merged) {
                        let err = TemplateError::from(err);
                        return Err(match sources.get(name) {
                            Some(path) => err.at_path(path.clone()),
                            None => err,
                        });
                    }
                }
                merged
            } else {
                template.clone()
            };
            templates.insert(name.clone(), Arc::new(resolved));
        }

        debug!("Indexed {} slugs", slug_index.len());
        self.templates = templates;
        self.slug_index = slug_index;
        self.sources = sources;
        self.last_scan = Some(Utc::now());
        Ok(())
    }

    /// Look up by name, then by slug.
    pub fn find(&self, name_or_slug: &str) -> Option<&Arc<Template>> {
        self.templates.get(name_or_slug).or_else(|| {
            self.slug_index
                .get(name_or_slug)
                .and_then(|name| self.templates.get(name))
        })
    }

    pub fn get(&self, name_or_slug: &str) -> TemplateResult<Arc<Template>> {
        self.find(name_or_slug)
            .cloned()
            .ok_or_else(|| TemplateError::NotFound(name_or_slug.to_string()))
    }

    pub fn contains(&self, name_or_slug: &str) -> bool {
        self.find(name_or_slug).is_some()
    }

    /// All templates, ordered by name.
    pub fn list(&self) -> Vec<&Arc<Template>> {
        self.templates.values().collect()
    }

    pub fn names(&self) -> Vec<&str> {
        self.templates.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    /// File a template was loaded from.
    pub fn source_path(&self, name: &str) -> Option<&Path> {
        self.sources.get(name).map(PathBuf::as_path)
    }

    pub fn last_scan(&self) -> Option<DateTime<Utc>> {
        self.last_scan
    }
}
