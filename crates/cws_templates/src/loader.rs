//! Template file discovery.

use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::{TemplateError, TemplateResult};
use crate::manifest::Template;
use crate::parser::TemplateParser;

/// File extensions recognised as template documents.
pub const TEMPLATE_EXTENSIONS: [&str; 2] = ["yml", "yaml"];

/// Whether a path has a template document extension.
pub fn is_template_file(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
        .is_some_and(|ext| TEMPLATE_EXTENSIONS.contains(&ext.as_str()))
}

/// Walks template directories in order.
#[derive(Debug, Clone, Default)]
pub struct TemplateLoader {
    dirs: Vec<PathBuf>,
}

impl TemplateLoader {
    pub fn new<I, P>(dirs: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self {
            dirs: dirs.into_iter().map(Into::into).collect(),
        }
    }

    pub fn dirs(&self) -> &[PathBuf] {
        &self.dirs
    }

    /// Template files under one directory, recursively, sorted by file name
    /// within each directory level.
    pub fn template_files(dir: &Path) -> TemplateResult<Vec<PathBuf>> {
        let mut files = Vec::new();
        for entry in WalkDir::new(dir).sort_by_file_name() {
            let entry = entry.map_err(|e| TemplateError::from(io::Error::from(e)).at_path(dir))?;
            if entry.file_type().is_file() && is_template_file(entry.path()) {
                files.push(entry.into_path());
            }
        }
        Ok(files)
    }

    /// Parse every template file of every directory, in directory order.
    /// Missing directories are skipped; the first parse failure aborts.
    pub fn load_all(&self, parser: &TemplateParser) -> TemplateResult<Vec<(PathBuf, Template)>> {
        let mut loaded = Vec::new();
        for dir in &self.dirs {
            if !dir.is_dir() {
                warn!("Template directory does not exist: {:?}", dir);
                continue;
            }
            for path in Self::template_files(dir)? {
                let template = parser.parse_file(&path)?;
                debug!("Loaded template {} from {:?}", template.name, path);
                loaded.push((path, template));
            }
        }
        Ok(loaded)
    }
}
