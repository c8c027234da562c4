//! Template document model.
//!
//! A template is a YAML document describing a research workstation: the base
//! operating system, packages per ecosystem, services, users and launch
//! metadata. Field names match the document keys. Maps use `BTreeMap` so that
//! serialized output is stable.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{TemplateError, TemplateResult};
use crate::package_manager::PackageManager;

/// Sentinel `base` value for templates launched from a pre-baked image.
pub const AMI_BASED: &str = "ami-based";

/// Default login shell assigned to users that do not declare one.
pub const DEFAULT_SHELL: &str = "/bin/bash";

/// A workstation template.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Template {
    #[serde(default)]
    pub name: String,
    /// Short identifier, derived from the name when absent.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub slug: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub long_description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    /// Base OS identifier (`ubuntu-22.04`, `rocky-9`, ...) or `ami-based`.
    #[serde(default)]
    pub base: String,
    /// Parent templates, merged in declaration order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inherits: Vec<String>,
    /// Raw package manager name; checked by the validation pipeline.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package_manager: Option<String>,
    #[serde(default)]
    pub packages: PackageDefinitions,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub services: Vec<ServiceConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub users: Vec<UserConfig>,
    #[serde(default)]
    pub instance_defaults: InstanceDefaults,
    #[serde(default)]
    pub ami_config: AmiConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle_detection: Option<IdleDetectionConfig>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, TemplateParameter>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub variables: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<TemplateDependency>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub post_install: String,
    /// Literal provisioning script; bypasses script generation when set.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user_data: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maintainer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<String>,
}

impl Template {
    /// Whether the template launches from a pre-baked image.
    pub fn is_ami_based(&self) -> bool {
        self.base == AMI_BASED
    }

    pub fn has_inheritance(&self) -> bool {
        !self.inherits.is_empty()
    }

    /// The declared package manager, parsed.
    pub fn declared_package_manager(&self) -> TemplateResult<Option<PackageManager>> {
        match self.package_manager.as_deref() {
            None | Some("") => Ok(None),
            Some(raw) => raw.parse().map(Some),
        }
    }

    /// Every package name across all ecosystems, in list order.
    pub fn all_packages(&self) -> impl Iterator<Item = &str> {
        self.packages.iter_all()
    }
}

/// Package lists, one per ecosystem. Order is preserved and lists are not
/// de-duplicated against each other.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageDefinitions {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub system: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conda: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub spack: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pip: Vec<String>,
}

impl PackageDefinitions {
    pub fn is_empty(&self) -> bool {
        self.system.is_empty()
            && self.conda.is_empty()
            && self.spack.is_empty()
            && self.pip.is_empty()
    }

    /// The list for one ecosystem.
    pub fn list(&self, ecosystem: Ecosystem) -> &[String] {
        match ecosystem {
            Ecosystem::System => &self.system,
            Ecosystem::Conda => &self.conda,
            Ecosystem::Spack => &self.spack,
            Ecosystem::Pip => &self.pip,
        }
    }

    pub fn list_mut(&mut self, ecosystem: Ecosystem) -> &mut Vec<String> {
        match ecosystem {
            Ecosystem::System => &mut self.system,
            Ecosystem::Conda => &mut self.conda,
            Ecosystem::Spack => &mut self.spack,
            Ecosystem::Pip => &mut self.pip,
        }
    }

    /// Append every list of `other` onto the matching list of `self`.
    pub fn append(&mut self, other: &PackageDefinitions) {
        for ecosystem in Ecosystem::ALL {
            self.list_mut(ecosystem)
                .extend(other.list(ecosystem).iter().cloned());
        }
    }

    pub fn iter_all(&self) -> impl Iterator<Item = &str> {
        Ecosystem::ALL
            .into_iter()
            .flat_map(move |e| self.list(e).iter().map(String::as_str))
    }
}

/// A package ecosystem with its own list in [`PackageDefinitions`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Ecosystem {
    System,
    Conda,
    Spack,
    Pip,
}

impl Ecosystem {
    pub const ALL: [Ecosystem; 4] = [
        Ecosystem::System,
        Ecosystem::Conda,
        Ecosystem::Spack,
        Ecosystem::Pip,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Ecosystem::System => "system",
            Ecosystem::Conda => "conda",
            Ecosystem::Spack => "spack",
            Ecosystem::Pip => "pip",
        }
    }
}

impl fmt::Display for Ecosystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A service configured and optionally started on the instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default)]
    pub name: String,
    /// `0` means the service exposes no port.
    #[serde(default)]
    pub port: i32,
    /// Lines appended to `/etc/<name>/<name>.conf`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub config: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable: Option<bool>,
}

impl ServiceConfig {
    pub fn is_enabled(&self) -> bool {
        self.enable.unwrap_or(false)
    }

    /// The service port if set and representable.
    pub fn exposed_port(&self) -> Option<u16> {
        if self.port == 0 {
            return None;
        }
        u16::try_from(self.port).ok()
    }
}

/// A login user created on the instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserConfig {
    #[serde(default)]
    pub name: String,
    /// Empty or `auto-generated` requests a random password.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shell: Option<String>,
}

/// Launch defaults for instances of this template.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstanceDefaults {
    /// Explicit instance type; disables workload-based sizing.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub instance_type: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<i32>,
    /// Hourly cost per architecture.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub estimated_cost_per_hour: BTreeMap<String, f64>,
}

/// How a pre-baked image is preferred over package installation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AmiStrategy {
    AmiPreferred,
    AmiRequired,
    AmiFallback,
}

/// Region → architecture → image id.
pub type ImageMap = BTreeMap<String, BTreeMap<String, String>>;

/// Image configuration for pre-baked templates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AmiConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<AmiStrategy>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub amis: ImageMap,
    /// Architecture → instance type.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub instance_types: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ami_search: Option<AmiSearch>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub marketplace_search: Option<MarketplaceSearch>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_data_script: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_user: Option<String>,
}

impl AmiConfig {
    pub fn has_mappings(&self) -> bool {
        !self.amis.is_empty()
    }
}

/// Descriptor for an owner/name-pattern image search.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AmiSearch {
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub name_pattern: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub architectures: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub required_tags: BTreeMap<String, String>,
}

/// Descriptor for a marketplace listing lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketplaceSearch {
    #[serde(default)]
    pub product_code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_constraint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publisher: Option<String>,
}

/// Idle detection policy applied to launched instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdleDetectionConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub idle_threshold_minutes: u32,
    #[serde(default)]
    pub hibernate_threshold_minutes: u32,
    #[serde(default)]
    pub check_interval_minutes: u32,
}

impl IdleDetectionConfig {
    /// Policy used when a template declares none.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            idle_threshold_minutes: 999_999,
            hibernate_threshold_minutes: 999_999,
            check_interval_minutes: 60,
        }
    }
}

impl Default for IdleDetectionConfig {
    fn default() -> Self {
        Self::disabled()
    }
}

/// Type of a user-overridable template parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterType {
    #[default]
    String,
    Int,
    Bool,
    Choice,
}

impl fmt::Display for ParameterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ParameterType::String => "string",
            ParameterType::Int => "int",
            ParameterType::Bool => "bool",
            ParameterType::Choice => "choice",
        };
        f.write_str(s)
    }
}

/// A typed, user-overridable value substituted into the template.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TemplateParameter {
    #[serde(rename = "type", default)]
    pub kind: ParameterType,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub choices: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    #[serde(default)]
    pub required: bool,
}

/// A declared dependency of the template.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateDependency {
    pub name: String,
    /// Version requirement: `>=X`, `^X`, `~X` or an exact version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

impl TemplateDependency {
    pub fn is_base_os(&self) -> bool {
        self.kind.as_deref() == Some("base_os")
    }
}

/// CPU architecture of the launched instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Architecture {
    #[serde(rename = "x86_64")]
    X86_64,
    #[serde(rename = "arm64")]
    Arm64,
}

impl Architecture {
    pub const ALL: [Architecture; 2] = [Architecture::X86_64, Architecture::Arm64];

    pub fn as_str(&self) -> &'static str {
        match self {
            Architecture::X86_64 => "x86_64",
            Architecture::Arm64 => "arm64",
        }
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Architecture {
    type Err = TemplateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "x86_64" | "amd64" => Ok(Architecture::X86_64),
            "arm64" | "aarch64" => Ok(Architecture::Arm64),
            _ => Err(TemplateError::InvalidArchitecture(s.to_string())),
        }
    }
}
