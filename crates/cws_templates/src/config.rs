//! Engine configuration.
//!
//! Defaults, then an optional YAML or TOML file, then `CWS_*` environment
//! variables.

use std::env;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{TemplateError, TemplateResult};
use crate::images::{ImageCatalog, PrebuiltImages};
use crate::manifest::Architecture;
use crate::optimized::OptimizedResolver;
use crate::parser::TemplateParser;
use crate::registry::TemplateRegistry;
use crate::resolver::TemplateResolver;
use crate::stats::StatsCollector;

pub const DEFAULT_REGION: &str = "us-east-1";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Searched in order; the first template loaded under a name wins.
    pub template_dirs: Vec<PathBuf>,
    pub default_region: String,
    pub default_arch: Architecture,
    pub cache_ttl_secs: u64,
    pub resolve_timeout_secs: u64,
    /// YAML file of template → region → arch → image id.
    pub prebuilt_images: Option<PathBuf>,
    /// Replaces the built-in base OS image catalog.
    pub image_catalog: Option<PathBuf>,
    pub stats_file: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            template_dirs: default_template_dirs(env::var_os("HOME")),
            default_region: DEFAULT_REGION.to_string(),
            default_arch: Architecture::X86_64,
            cache_ttl_secs: 300,
            resolve_timeout_secs: 120,
            prebuilt_images: None,
            image_catalog: None,
            stats_file: None,
        }
    }
}

fn default_template_dirs(home: Option<OsString>) -> Vec<PathBuf> {
    let mut dirs = vec![PathBuf::from("templates")];
    if let Some(home) = home {
        dirs.push(PathBuf::from(home).join(".cloudworkstation").join("templates"));
    }
    dirs.push(PathBuf::from("/etc/cloudworkstation/templates"));
    dirs
}

impl EngineConfig {
    /// Defaults overridden by the process environment.
    pub fn from_env() -> TemplateResult<Self> {
        let mut config = Self::default();
        config.apply_env(|key| env::var(key).ok())?;
        Ok(config)
    }

    /// Read a YAML or TOML file, chosen by extension.
    pub fn load(path: &Path) -> TemplateResult<Self> {
        let content = fs::read_to_string(path).map_err(|e| TemplateError::from(e).at_path(path))?;
        let ext = path
            .extension()
            .map(|e| e.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();
        let config = match ext.as_str() {
            "yaml" | "yml" => serde_yaml::from_str(&content).map_err(TemplateError::from),
            "toml" => toml::from_str(&content).map_err(TemplateError::from),
            other => Err(TemplateError::Config(format!(
                "unsupported config file extension '{}'",
                other
            ))),
        };
        config.map_err(|e| e.at_path(path))
    }

    /// Apply `CWS_*` overrides from a variable lookup.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> TemplateResult<()> {
        if let Some(dirs) = lookup("CWS_TEMPLATE_DIRS").filter(|v| !v.is_empty()) {
            self.template_dirs = env::split_paths(&dirs).collect();
        }
        if let Some(region) = lookup("CWS_REGION").filter(|v| !v.is_empty()) {
            self.default_region = region;
        }
        if let Some(arch) = lookup("CWS_ARCH").filter(|v| !v.is_empty()) {
            self.default_arch = arch.parse()?;
        }
        if let Some(ttl) = lookup("CWS_CACHE_TTL_SECS") {
            self.cache_ttl_secs = parse_secs("CWS_CACHE_TTL_SECS", &ttl)?;
        }
        if let Some(timeout) = lookup("CWS_RESOLVE_TIMEOUT_SECS") {
            self.resolve_timeout_secs = parse_secs("CWS_RESOLVE_TIMEOUT_SECS", &timeout)?;
        }
        if let Some(path) = lookup("CWS_PREBUILT_IMAGES").filter(|v| !v.is_empty()) {
            self.prebuilt_images = Some(PathBuf::from(path));
        }
        if let Some(path) = lookup("CWS_IMAGE_CATALOG").filter(|v| !v.is_empty()) {
            self.image_catalog = Some(PathBuf::from(path));
        }
        if let Some(path) = lookup("CWS_STATS_FILE").filter(|v| !v.is_empty()) {
            self.stats_file = Some(PathBuf::from(path));
        }
        Ok(())
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn resolve_timeout(&self) -> Duration {
        Duration::from_secs(self.resolve_timeout_secs)
    }

    /// The configured image catalog, or the built-in one.
    pub fn catalog(&self) -> TemplateResult<Arc<ImageCatalog>> {
        let catalog = match &self.image_catalog {
            Some(path) => ImageCatalog::load(path)?,
            None => ImageCatalog::builtin()?,
        };
        Ok(Arc::new(catalog))
    }

    pub fn prebuilt(&self) -> TemplateResult<PrebuiltImages> {
        match &self.prebuilt_images {
            Some(path) => PrebuiltImages::load(path),
            None => Ok(PrebuiltImages::new()),
        }
    }

    /// Scan the template directories.
    pub fn registry(&self, catalog: Arc<ImageCatalog>) -> TemplateResult<TemplateRegistry> {
        let mut registry = TemplateRegistry::new(self.template_dirs.iter().cloned());
        registry.scan(&TemplateParser::new(catalog))?;
        Ok(registry)
    }

    pub fn resolver(&self, catalog: Arc<ImageCatalog>) -> TemplateResult<OptimizedResolver> {
        let resolver = TemplateResolver::new(catalog).with_prebuilt(Arc::new(self.prebuilt()?));
        debug!(
            "Resolver cache TTL {:?}, timeout {:?}",
            self.cache_ttl(),
            self.resolve_timeout()
        );
        Ok(OptimizedResolver::new(resolver)
            .with_ttl(self.cache_ttl())
            .with_timeout(self.resolve_timeout()))
    }

    /// The stats file's collector, or an empty one when none is configured.
    pub fn stats(&self) -> TemplateResult<StatsCollector> {
        match &self.stats_file {
            Some(path) => StatsCollector::load(path),
            None => Ok(StatsCollector::new()),
        }
    }
}

fn parse_secs(key: &str, value: &str) -> TemplateResult<u64> {
    value
        .trim()
        .parse()
        .map_err(|_| {
            TemplateError::Config(format!(
                "{} must be a whole number of seconds, got '{}'",
                key, value
            ))
        })
}
