//! Template resolver turning a merged template into a launch configuration.
//!
//! The resolver handles:
//! - Parameter substitution
//! - Package manager selection
//! - Provisioning script selection or generation
//! - Image, instance type, port, cost and idle policy resolution
//!
//! Each step is exposed on its own so the concurrent resolver can run them
//! independently.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{TemplateError, TemplateResult};
use crate::images::{ImageCatalog, PrebuiltImageSource, PrebuiltImages};
use crate::manifest::{Architecture, IdleDetectionConfig, ImageMap, Template};
use crate::package_manager::PackageManager;
use crate::parameters;
use crate::registry::TemplateRegistry;
use crate::script::ScriptGenerator;
use crate::sizing::{estimate_cost, InstanceSize, WorkloadClass};
use crate::version::{DependencyResolver, ResolvedDependencies};

/// Administrative port present on every instance.
pub const ADMIN_PORT: u16 = 22;

/// Options for resolving a template.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolveOptions {
    /// Overrides the template's declared package manager.
    pub package_manager: Option<PackageManager>,
    /// Instance size; `M` when unset.
    pub size: Option<InstanceSize>,
    /// OS version or alias overriding the template's base.
    pub os_version: Option<String>,
    /// Values for the template's parameters.
    pub parameters: BTreeMap<String, String>,
}

impl ResolveOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_package_manager(mut self, manager: PackageManager) -> Self {
        self.package_manager = Some(manager);
        self
    }

    pub fn with_size(mut self, size: InstanceSize) -> Self {
        self.size = Some(size);
        self
    }

    pub fn with_os_version(mut self, version: impl Into<String>) -> Self {
        self.os_version = Some(version.into());
        self
    }

    pub fn with_parameter(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(name.into(), value.into());
        self
    }

    pub fn with_parameters(mut self, values: BTreeMap<String, String>) -> Self {
        self.parameters.extend(values);
        self
    }

    pub fn size(&self) -> InstanceSize {
        self.size.unwrap_or_default()
    }
}

/// Everything needed to launch an instance of a template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedConfiguration {
    pub name: String,
    pub slug: String,
    pub description: String,
    pub package_manager: PackageManager,
    /// Region → architecture → image id.
    pub ami: ImageMap,
    /// Architecture → instance type.
    pub instance_type: BTreeMap<String, String>,
    /// Provisioning script passed as boot-time user data.
    pub user_data: String,
    pub ports: Vec<u16>,
    /// Architecture → hourly cost in USD.
    pub estimated_cost_per_hour: BTreeMap<String, f64>,
    pub idle_detection: IdleDetectionConfig,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    pub generated_at: DateTime<Utc>,
}

impl ResolvedConfiguration {
    pub fn image_for(&self, region: &str, arch: Architecture) -> Option<&str> {
        self.ami
            .get(region)
            .and_then(|archs| archs.get(arch.as_str()))
            .map(String::as_str)
    }

    pub fn instance_type_for(&self, arch: Architecture) -> Option<&str> {
        self.instance_type.get(arch.as_str()).map(String::as_str)
    }

    pub fn cost_for(&self, arch: Architecture) -> Option<f64> {
        self.estimated_cost_per_hour.get(arch.as_str()).copied()
    }
}

/// Whether an image map has an id for the region and architecture.
pub fn covers(map: &ImageMap, region: &str, arch: Architecture) -> bool {
    map.get(region)
        .and_then(|archs| archs.get(arch.as_str()))
        .is_some_and(|id| !id.is_empty())
}

/// Template resolver.
#[derive(Clone)]
pub struct TemplateResolver {
    dependencies: DependencyResolver,
    prebuilt: Arc<dyn PrebuiltImageSource>,
    scripts: ScriptGenerator,
}

impl TemplateResolver {
    /// Create a resolver with no pre-built images.
    pub fn new(catalog: Arc<ImageCatalog>) -> Self {
        Self {
            dependencies: DependencyResolver::new(catalog),
            prebuilt: Arc::new(PrebuiltImages::new()),
            scripts: ScriptGenerator::new(),
        }
    }

    pub fn with_prebuilt(mut self, prebuilt: Arc<dyn PrebuiltImageSource>) -> Self {
        self.prebuilt = prebuilt;
        self
    }

    pub fn catalog(&self) -> &ImageCatalog {
        self.dependencies.catalog()
    }

    pub fn dependencies(&self) -> &DependencyResolver {
        &self.dependencies
    }

    pub fn scripts(&self) -> &ScriptGenerator {
        &self.scripts
    }

    /// Substitute parameter values and choose the package manager.
    pub fn prepare(
        &self,
        template: &Template,
        options: &ResolveOptions,
    ) -> TemplateResult<(Template, PackageManager)> {
        let values = parameters::resolve_values(template, &options.parameters)?;
        let prepared = parameters::apply(template, &values)?;
        let manager = select_package_manager(&prepared, options)?;
        Ok((prepared, manager))
    }

    /// The template's literal user data, or a generated script.
    pub fn provisioning_script(
        &self,
        template: &Template,
        manager: PackageManager,
    ) -> TemplateResult<String> {
        if !template.user_data.trim().is_empty() {
            debug!("Using literal user data for {}", template.name);
            return Ok(template.user_data.clone());
        }
        self.scripts.generate(template, manager)
    }

    /// Image map from the template's own mapping, a pre-built image, or the
    /// base OS catalog, in that order.
    pub fn image_map(
        &self,
        template: &Template,
        region: &str,
        arch: Architecture,
        os_version: Option<&str>,
    ) -> TemplateResult<ImageMap> {
        if let Some(map) = self.direct_image_map(template, region, arch)? {
            return Ok(map);
        }
        let resolved = self.base_image(template, region, arch, os_version)?;
        self.catalog_images(&resolved)
    }

    /// The template's literal mapping or a pre-built image, when either
    /// applies. `None` means the base OS catalog must be consulted.
    pub fn direct_image_map(
        &self,
        template: &Template,
        region: &str,
        arch: Architecture,
    ) -> TemplateResult<Option<ImageMap>> {
        if template.ami_config.has_mappings() || template.is_ami_based() {
            if !covers(&template.ami_config.amis, region, arch) {
                return Err(TemplateError::MissingImageMapping {
                    template: template.name.clone(),
                    region: region.to_string(),
                    arch: arch.to_string(),
                });
            }
            return Ok(Some(template.ami_config.amis.clone()));
        }

        let prebuilt = self
            .prebuilt
            .images_for(&template.name)
            .or_else(|| self.prebuilt.images_for(&template.slug));
        if let Some(map) = prebuilt.filter(|m| covers(m, region, arch)) {
            info!(
                "Fast launch available: pre-built image for {} in {}/{}",
                template.name, region, arch
            );
            return Ok(Some(map));
        }
        Ok(None)
    }

    /// Select the OS version and check the catalog has an image for it.
    pub fn base_image(
        &self,
        template: &Template,
        region: &str,
        arch: Architecture,
        os_version: Option<&str>,
    ) -> TemplateResult<ResolvedDependencies> {
        self.dependencies.resolve(template, os_version, region, arch)
    }

    /// Every region's images for an already-selected OS version.
    pub fn catalog_images(&self, resolved: &ResolvedDependencies) -> TemplateResult<ImageMap> {
        self.catalog()
            .version_images(&resolved.distro, &resolved.version)
            .cloned()
    }

    /// Resolve a template for a region and architecture.
    pub fn resolve(
        &self,
        template: &Template,
        region: &str,
        arch: Architecture,
        options: &ResolveOptions,
    ) -> TemplateResult<ResolvedConfiguration> {
        info!("Resolving template '{}' for {}/{}", template.name, region, arch);

        let (prepared, manager) = self.prepare(template, options)?;
        let script = self.provisioning_script(&prepared, manager)?;
        let ami = self.image_map(&prepared, region, arch, options.os_version.as_deref())?;
        let instance_types = instance_types(&prepared, options.size());
        let ports = ports(&prepared);
        let costs = costs(&prepared, &instance_types);

        Ok(assemble(&prepared, manager, script, ami, instance_types, ports, costs))
    }

    /// Resolve every template in a registry. Each entry carries its own
    /// result so one failure does not hide the rest.
    pub fn resolve_all(
        &self,
        registry: &TemplateRegistry,
        region: &str,
        arch: Architecture,
    ) -> Vec<(String, TemplateResult<ResolvedConfiguration>)> {
        let options = ResolveOptions::default();
        registry
            .list()
            .into_iter()
            .map(|template| {
                let result = self.resolve(template, region, arch, &options);
                (template.name.clone(), result)
            })
            .collect()
    }
}

/// Explicit override, else the declared manager, else `ami` for image-based
/// templates.
pub fn select_package_manager(
    template: &Template,
    options: &ResolveOptions,
) -> TemplateResult<PackageManager> {
    if let Some(manager) = options.package_manager {
        return Ok(manager);
    }
    match template.declared_package_manager()? {
        Some(manager) => Ok(manager),
        None if template.is_ami_based() => Ok(PackageManager::Ami),
        None => Err(TemplateError::MissingPackageManager(template.name.clone())),
    }
}

/// Architecture → instance type.
///
/// Image-based templates with their own instance types use them; an explicit
/// `instance_defaults.type` applies to every architecture; otherwise the
/// workload class ladder picks by size.
pub fn instance_types(template: &Template, size: InstanceSize) -> BTreeMap<String, String> {
    if template.ami_config.has_mappings() && !template.ami_config.instance_types.is_empty() {
        return template.ami_config.instance_types.clone();
    }
    if let Some(explicit) = template
        .instance_defaults
        .instance_type
        .as_deref()
        .filter(|t| !t.is_empty())
    {
        return Architecture::ALL
            .into_iter()
            .map(|arch| (arch.to_string(), explicit.to_string()))
            .collect();
    }
    let class = WorkloadClass::classify(template);
    debug!("Template {} classified as {} workload", template.name, class);
    class.instance_types(size)
}

/// Administrative port, service ports, then default ports, without
/// duplicates, in first-seen order.
pub fn ports(template: &Template) -> Vec<u16> {
    let declared = template
        .services
        .iter()
        .filter_map(|s| s.exposed_port())
        .chain(
            template
                .instance_defaults
                .ports
                .iter()
                .filter_map(|p| u16::try_from(*p).ok())
                .filter(|p| *p != 0),
        );

    let mut ports = vec![ADMIN_PORT];
    for port in declared {
        if !ports.contains(&port) {
            ports.push(port);
        }
    }
    ports
}

/// The template's literal estimate, else the price of each selected type.
pub fn costs(
    template: &Template,
    instance_types: &BTreeMap<String, String>,
) -> BTreeMap<String, f64> {
    if !template.instance_defaults.estimated_cost_per_hour.is_empty() {
        return template.instance_defaults.estimated_cost_per_hour.clone();
    }
    instance_types
        .iter()
        .map(|(arch, instance_type)| (arch.clone(), estimate_cost(instance_type)))
        .collect()
}

pub fn idle_policy(template: &Template) -> IdleDetectionConfig {
    template.idle_detection.unwrap_or_default()
}

/// Build the final configuration from independently resolved parts.
pub fn assemble(
    template: &Template,
    manager: PackageManager,
    user_data: String,
    ami: ImageMap,
    instance_type: BTreeMap<String, String>,
    ports: Vec<u16>,
    estimated_cost_per_hour: BTreeMap<String, f64>,
) -> ResolvedConfiguration {
    ResolvedConfiguration {
        name: template.name.clone(),
        slug: template.slug.clone(),
        description: template.description.clone(),
        package_manager: manager,
        ami,
        instance_type,
        user_data,
        ports,
        estimated_cost_per_hour,
        idle_detection: idle_policy(template),
        tags: template.tags.clone(),
        generated_at: Utc::now(),
    }
}
