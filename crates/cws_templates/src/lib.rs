//! # cws_templates
//!
//! Template resolution engine for CloudWorkstation research environments.
//!
//! Templates are YAML documents describing a workstation: a base OS, a package
//! manager, packages, users, services and launch defaults. This crate:
//!
//! - Parses and validates template documents
//! - Indexes template directories and resolves multi-parent inheritance
//! - Selects OS versions and resolves base images per region and architecture
//! - Generates provisioning scripts per package manager
//! - Produces launch-ready [`ResolvedConfiguration`]s, optionally concurrently
//!   with cached sub-results
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use cws_templates::{
//!     Architecture, ImageCatalog, OptimizedResolver, ResolveOptions, TemplateParser,
//!     TemplateRegistry, TemplateResolver,
//! };
//!
//! # async fn run() -> cws_templates::TemplateResult<()> {
//! let catalog = Arc::new(ImageCatalog::builtin()?);
//!
//! let mut registry = TemplateRegistry::new(["templates"]);
//! registry.scan(&TemplateParser::new(Arc::clone(&catalog)))?;
//!
//! let resolver = OptimizedResolver::new(TemplateResolver::new(catalog));
//! let template = registry.get("python-ml")?;
//! let config = resolver
//!     .resolve(&template, "us-east-1", Architecture::X86_64, &ResolveOptions::new())
//!     .await?;
//! println!("{}", config.user_data);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod images;
pub mod inheritance;
pub mod loader;
pub mod manifest;
pub mod optimized;
pub mod package_manager;
pub mod parameters;
pub mod parser;
pub mod registry;
pub mod renderer;
pub mod resolver;
pub mod script;
pub mod sizing;
pub mod stats;
pub mod validator;
pub mod version;

pub use config::EngineConfig;
pub use error::{TemplateError, TemplateResult, ValidationError};
pub use images::{BaseOs, ImageCatalog, PrebuiltImageSource, PrebuiltImages};
pub use loader::TemplateLoader;
pub use manifest::{
    AmiConfig, Architecture, IdleDetectionConfig, ImageMap, InstanceDefaults, PackageDefinitions,
    ServiceConfig, Template, TemplateParameter, UserConfig,
};
pub use optimized::{CacheStats, OptimizedResolver};
pub use package_manager::PackageManager;
pub use parser::TemplateParser;
pub use registry::TemplateRegistry;
pub use renderer::TemplateRenderer;
pub use resolver::{ResolveOptions, ResolvedConfiguration, TemplateResolver};
pub use script::ScriptGenerator;
pub use sizing::{InstanceSize, WorkloadClass};
pub use stats::{StatsCollector, TemplateUsage};
pub use validator::{ValidationPipeline, ValidationReport};
pub use version::{DependencyResolver, ResolvedDependencies, VersionConstraint};
