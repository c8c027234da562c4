//! Template validation pipeline.
//!
//! Validators are independent checks run in a fixed order. [`ValidationPipeline::validate`]
//! stops at the first failing validator; [`ValidationPipeline::validate_all`] runs
//! every check and also collects advisory warnings.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::images::ImageCatalog;
use crate::manifest::{Ecosystem, Template};
use crate::package_manager::PackageManager;
use crate::parameters;

/// A single self-contained validation check.
pub trait TemplateValidator: Send + Sync {
    fn name(&self) -> &'static str;

    /// Every failure found by this check, in field order.
    fn check(&self, template: &Template) -> Vec<ValidationError>;
}

/// Name, description and base OS.
pub struct RequiredFieldValidator {
    catalog: Arc<ImageCatalog>,
}

impl RequiredFieldValidator {
    pub fn new(catalog: Arc<ImageCatalog>) -> Self {
        Self { catalog }
    }
}

impl TemplateValidator for RequiredFieldValidator {
    fn name(&self) -> &'static str {
        "required_fields"
    }

    fn check(&self, template: &Template) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        if template.name.trim().is_empty() {
            errors.push(ValidationError::new("name", "template name is required"));
        }
        if template.description.trim().is_empty() {
            errors.push(ValidationError::new(
                "description",
                "template description is required",
            ));
        }
        if template.base.trim().is_empty() {
            if template.inherits.is_empty() {
                errors.push(ValidationError::new(
                    "base",
                    "template base OS is required when no parent template is inherited",
                ));
            }
        } else if !template.is_ami_based() && !self.catalog.is_known_base(&template.base) {
            errors.push(ValidationError::new(
                "base",
                format!("unsupported base OS: {}", template.base),
            ));
        }
        errors
    }
}

/// Declared package manager must be one of the supported managers.
pub struct PackageManagerValidator;

impl TemplateValidator for PackageManagerValidator {
    fn name(&self) -> &'static str {
        "package_manager"
    }

    fn check(&self, template: &Template) -> Vec<ValidationError> {
        match template.declared_package_manager() {
            Ok(_) => Vec::new(),
            Err(_) => vec![ValidationError::new(
                "package_manager",
                format!(
                    "unsupported package manager: {} (valid: {})",
                    template.package_manager.as_deref().unwrap_or_default(),
                    PackageManager::valid_names()
                ),
            )],
        }
    }
}

pub struct ServiceValidator;

impl TemplateValidator for ServiceValidator {
    fn name(&self) -> &'static str {
        "services"
    }

    fn check(&self, template: &Template) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        for (i, service) in template.services.iter().enumerate() {
            if service.name.trim().is_empty() {
                errors.push(ValidationError::new(
                    format!("services[{}].name", i),
                    "service name is required",
                ));
            }
            if !(0..=65535).contains(&service.port) {
                errors.push(ValidationError::new(
                    format!("services[{}].port", i),
                    "service port must be between 0 and 65535",
                ));
            }
        }
        errors
    }
}

pub struct UserValidator;

impl TemplateValidator for UserValidator {
    fn name(&self) -> &'static str {
        "users"
    }

    fn check(&self, template: &Template) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        for (i, user) in template.users.iter().enumerate() {
            let field = format!("users[{}].name", i);
            if user.name.is_empty() {
                errors.push(ValidationError::new(field, "user name is required"));
            } else if user.name.contains([' ', ':']) {
                errors.push(ValidationError::new(
                    field,
                    "user name cannot contain spaces or colons",
                ));
            }
        }
        errors
    }
}

/// Explicit default ports.
pub struct PortValidator;

impl TemplateValidator for PortValidator {
    fn name(&self) -> &'static str {
        "ports"
    }

    fn check(&self, template: &Template) -> Vec<ValidationError> {
        template
            .instance_defaults
            .ports
            .iter()
            .enumerate()
            .filter(|(_, port)| !(1..=65535).contains(*port))
            .map(|(i, _)| {
                ValidationError::new(
                    format!("instance_defaults.ports[{}]", i),
                    "port must be between 1 and 65535",
                )
            })
            .collect()
    }
}

/// Direct self-reference and empty parent names.
pub struct InheritanceValidator;

impl TemplateValidator for InheritanceValidator {
    fn name(&self) -> &'static str {
        "inheritance"
    }

    fn check(&self, template: &Template) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        for (i, parent) in template.inherits.iter().enumerate() {
            if parent.trim().is_empty() {
                errors.push(ValidationError::new(
                    format!("inherits[{}]", i),
                    "parent template name cannot be empty",
                ));
            } else if *parent == template.name {
                errors.push(ValidationError::new(
                    "inherits",
                    format!("template cannot inherit from itself: {}", parent),
                ));
            }
        }
        errors
    }
}

/// Package lists must suit the package manager.
pub struct PackageConsistencyValidator;

impl TemplateValidator for PackageConsistencyValidator {
    fn name(&self) -> &'static str {
        "package_consistency"
    }

    fn check(&self, template: &Template) -> Vec<ValidationError> {
        let manager = if template.is_ami_based() {
            Some(PackageManager::Ami)
        } else {
            template.declared_package_manager().ok().flatten()
        };
        let Some(manager) = manager else {
            return Vec::new();
        };

        if manager == PackageManager::Ami {
            if template.packages.is_empty() {
                return Vec::new();
            }
            return vec![ValidationError::new(
                "packages",
                "AMI-based templates should not define packages (the image is pre-configured)",
            )];
        }

        let offending: Vec<&str> = manager
            .forbidden_ecosystems()
            .iter()
            .filter(|e| !template.packages.list(**e).is_empty())
            .map(|e| e.as_str())
            .collect();
        if offending.is_empty() {
            return Vec::new();
        }
        vec![ValidationError::new(
            "packages",
            format!(
                "template uses {} package manager but has {} packages defined",
                manager,
                offending.join("/")
            ),
        )]
    }
}

/// Parameter definitions and their defaults.
pub struct ParameterValidator;

impl TemplateValidator for ParameterValidator {
    fn name(&self) -> &'static str {
        "parameters"
    }

    fn check(&self, template: &Template) -> Vec<ValidationError> {
        template
            .parameters
            .iter()
            .filter_map(|(name, param)| parameters::check_definition(name, param).err())
            .collect()
    }
}

/// Result of running every validator against one template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub template: String,
    pub valid: bool,
    pub errors: Vec<ValidationError>,
    pub warnings: Vec<ValidationError>,
}

impl ValidationReport {
    pub fn new(template: &str) -> Self {
        Self {
            template: template.to_string(),
            valid: true,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn add_error(&mut self, error: ValidationError) {
        self.errors.push(error);
        self.valid = false;
    }

    pub fn add_warning(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.warnings.push(ValidationError::new(field, message));
    }

    pub fn merge(&mut self, other: ValidationReport) {
        if !other.valid {
            self.valid = false;
        }
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }
}

/// Ordered list of validators.
pub struct ValidationPipeline {
    validators: Vec<Box<dyn TemplateValidator>>,
}

impl ValidationPipeline {
    /// The standard validators in their fixed order.
    pub fn new(catalog: Arc<ImageCatalog>) -> Self {
        Self::empty()
            .with_validator(RequiredFieldValidator::new(catalog))
            .with_validator(PackageManagerValidator)
            .with_validator(ServiceValidator)
            .with_validator(UserValidator)
            .with_validator(PortValidator)
            .with_validator(InheritanceValidator)
            .with_validator(PackageConsistencyValidator)
            .with_validator(ParameterValidator)
    }

    pub fn empty() -> Self {
        Self {
            validators: Vec::new(),
        }
    }

    pub fn with_validator(mut self, validator: impl TemplateValidator + 'static) -> Self {
        self.validators.push(Box::new(validator));
        self
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.validators.iter().map(|v| v.name()).collect()
    }

    /// First error of the first failing validator.
    pub fn validate(&self, template: &Template) -> Result<(), ValidationError> {
        for validator in &self.validators {
            if let Some(error) = validator.check(template).into_iter().next() {
                return Err(error);
            }
        }
        Ok(())
    }

    /// Every error from every validator, plus advisories.
    pub fn validate_all(&self, template: &Template) -> ValidationReport {
        let mut report = ValidationReport::new(&template.name);
        for validator in &self.validators {
            for error in validator.check(template) {
                report.add_error(error);
            }
        }
        add_advisories(template, &mut report);
        report
    }
}

fn add_advisories(template: &Template, report: &mut ValidationReport) {
    if let Ok(Some(PackageManager::Conda)) = template.declared_package_manager() {
        if !template.packages.list(Ecosystem::System).is_empty() {
            report.add_warning(
                "packages.system",
                "conda templates do not install system packages \
                 unless the package manager is overridden",
            );
        }
    }

    let mut ports: BTreeMap<i32, &str> = BTreeMap::new();
    for (i, service) in template.services.iter().enumerate() {
        if service.port > 0 && service.port < 1024 && service.port != 22 {
            report.add_warning(
                format!("services[{}].port", i),
                format!("service {} uses privileged port {}", service.name, service.port),
            );
        }
        if service.port > 0 {
            if let Some(other) = ports.insert(service.port, &service.name) {
                report.add_warning(
                    format!("services[{}].port", i),
                    format!(
                        "services {} and {} both use port {}",
                        other, service.name, service.port
                    ),
                );
            }
        }
    }

    match &template.idle_detection {
        None => report.add_warning(
            "idle_detection",
            "no idle detection policy; instances will not stop when idle",
        ),
        Some(policy) if !policy.enabled => {
            report.add_warning("idle_detection", "idle detection is disabled")
        }
        Some(_) => {}
    }

    let mut seen = BTreeSet::new();
    for (i, user) in template.users.iter().enumerate() {
        if !user.name.is_empty() && !seen.insert(user.name.as_str()) {
            report.add_warning(
                format!("users[{}].name", i),
                format!("user {} is declared more than once", user.name),
            );
        }
    }
}
