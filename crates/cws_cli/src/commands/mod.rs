//! CLI command definitions.
//!
//! This module defines the command structure for the `cws` CLI and the
//! engine setup shared by every subcommand.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use cws_templates::{EngineConfig, ImageCatalog, TemplateRegistry};
use tracing::debug;

pub mod image;
pub mod info;
pub mod list;
pub mod resolve;
pub mod script;
pub mod validate;

/// cws - CloudWorkstation template engine
#[derive(Parser)]
#[command(name = "cws")]
#[command(version, about = "CloudWorkstation template resolution engine")]
#[command(long_about = r#"
Resolves CloudWorkstation templates into launch-ready configurations:
base image ids, instance types, provisioning scripts, ports and costs.

COMMANDS:
  list      → List every template found in the template directories
  info      → Show a template after inheritance is applied
  validate  → Validate template files and report every problem
  resolve   → Resolve a template for a region and architecture
  script    → Print the provisioning script of a template
  image     → Look up a base OS image id

EXIT CODES:
  0 - Success
  1 - General error
  2 - Invalid arguments
  3 - Validation failure
  4 - Template error
"#)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Template directory, searched in the order given (repeatable)
    #[arg(long = "templates-dir", global = true)]
    pub templates_dir: Vec<PathBuf>,

    /// YAML or TOML configuration file
    #[arg(long, global = true, env = "CWS_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List available templates
    List(list::ListArgs),

    /// Show a merged template
    Info(info::InfoArgs),

    /// Validate template files
    Validate(validate::ValidateArgs),

    /// Resolve a template into a launch configuration
    Resolve(resolve::ResolveArgs),

    /// Print a template's provisioning script
    Script(script::ScriptArgs),

    /// Look up a base OS image
    Image(image::ImageArgs),
}

/// Options shared by every command.
#[derive(Debug, Clone, Default)]
pub struct Globals {
    pub quiet: bool,
    pub templates_dir: Vec<PathBuf>,
    pub config: Option<PathBuf>,
}

impl Cli {
    pub fn globals(&self) -> Globals {
        Globals {
            quiet: self.quiet,
            templates_dir: self.templates_dir.clone(),
            config: self.config.clone(),
        }
    }
}

impl Globals {
    /// Configuration file (or defaults), then environment, then flags.
    pub fn config(&self) -> Result<EngineConfig> {
        let mut config = match &self.config {
            Some(path) => {
                let mut config = EngineConfig::load(path)
                    .with_context(|| format!("Failed to load config file {:?}", path))?;
                config
                    .apply_env(|key| std::env::var(key).ok())
                    .context("Invalid CWS_* environment option")?;
                config
            }
            None => EngineConfig::from_env().context("Invalid CWS_* environment option")?,
        };
        if !self.templates_dir.is_empty() {
            config.template_dirs = self.templates_dir.clone();
        }
        debug!("Template directories: {:?}", config.template_dirs);
        Ok(config)
    }

    /// Load configuration, image catalog and scanned templates.
    pub fn engine(&self) -> Result<Engine> {
        let config = self.config()?;
        let catalog = config.catalog().context("Failed to load image catalog")?;
        let registry = config
            .registry(Arc::clone(&catalog))
            .context("Failed to scan template directories")?;
        Ok(Engine {
            config,
            catalog,
            registry,
        })
    }
}

/// Everything a command needs to look up and resolve templates.
pub struct Engine {
    pub config: EngineConfig,
    pub catalog: Arc<ImageCatalog>,
    pub registry: TemplateRegistry,
}

/// Parse repeated `KEY=VALUE` arguments.
pub fn parse_key_values(pairs: &[String]) -> Result<BTreeMap<String, String>> {
    let mut values = BTreeMap::new();
    for pair in pairs {
        let Some((key, value)) = pair.split_once('=') else {
            anyhow::bail!("invalid argument --param '{}': expected KEY=VALUE", pair);
        };
        let key = key.trim();
        if key.is_empty() {
            anyhow::bail!("invalid argument --param '{}': empty key", pair);
        }
        values.insert(key.to_string(), value.to_string());
    }
    Ok(values)
}
