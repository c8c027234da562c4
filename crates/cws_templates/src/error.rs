//! Error types for template parsing, validation and resolution.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for template operations.
pub type TemplateResult<T> = Result<T, TemplateError>;

/// A single structured validation failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationError {
    /// Dotted path of the offending field, e.g. `services[0].port`.
    pub field: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "template validation error in {}: {}",
            self.field, self.message
        )
    }
}

impl std::error::Error for ValidationError {}

/// Errors that can occur during template operations.
#[derive(Error, Debug)]
pub enum TemplateError {
    #[error("Template not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Validation(#[from] ValidationError),

    #[error("Failed to load template {path}: {source}")]
    Load {
        path: PathBuf,
        #[source]
        source: Box<TemplateError>,
    },

    #[error("Parent template '{parent}' not found for template '{template}'")]
    MissingParent { template: String, parent: String },

    #[error("Inheritance cycle detected: {}", .chain.join(" -> "))]
    InheritanceCycle { chain: Vec<String> },

    #[error("Unsupported base OS: {0}")]
    UnsupportedBase(String),

    #[error("Unsupported distribution: {0}")]
    UnsupportedDistro(String),

    #[error("Unsupported version {version} for distribution {distro}")]
    UnsupportedVersion { distro: String, version: String },

    #[error("Unknown version alias '{alias}' for distribution {distro}")]
    UnknownAlias { distro: String, alias: String },

    #[error("Region {region} not supported for {distro} {version}")]
    UnsupportedRegion {
        distro: String,
        version: String,
        region: String,
    },

    #[error("Architecture {arch} not supported for {distro} {version} in {region}")]
    UnsupportedArchitecture {
        distro: String,
        version: String,
        region: String,
        arch: String,
    },

    #[error("No AMI mapping for region {region} and architecture {arch} in template {template}")]
    MissingImageMapping {
        template: String,
        region: String,
        arch: String,
    },

    #[error("Unsupported package manager: {0}")]
    UnsupportedPackageManager(String),

    #[error("Template {0} does not declare a package manager")]
    MissingPackageManager(String),

    #[error("Invalid size '{0}' (expected XS, S, M, L or XL)")]
    InvalidSize(String),

    #[error("Invalid architecture '{0}' (expected x86_64 or arm64)")]
    InvalidArchitecture(String),

    #[error("Invalid version constraint: {0}")]
    InvalidConstraint(String),

    #[error("No known {distro} version satisfies '{constraint}'")]
    UnsatisfiableConstraint { distro: String, constraint: String },

    #[error("Script generation failed: {0}")]
    ScriptGeneration(String),

    #[error("Parameter not provided: {0}")]
    MissingParameter(String),

    #[error("Invalid value for parameter {parameter}: {message}")]
    InvalidParameter { parameter: String, message: String },

    #[error("Template resolution timed out after {0:?}")]
    Timeout(Duration),

    #[error("Resolution task failed: {0}")]
    TaskFailed(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl TemplateError {
    /// Wrap an error with the file it came from.
    pub fn at_path(self, path: impl Into<PathBuf>) -> Self {
        TemplateError::Load {
            path: path.into(),
            source: Box::new(self),
        }
    }

    /// The structured validation failure, if this error carries one.
    pub fn validation(&self) -> Option<&ValidationError> {
        match self {
            TemplateError::Validation(err) => Some(err),
            TemplateError::Load { source, .. } => source.validation(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_display() {
        let err = ValidationError::new("inherits", "template cannot inherit from itself: base");
        assert_eq!(
            err.to_string(),
            "template validation error in inherits: template cannot inherit from itself: base"
        );
    }

    #[test]
    fn test_validation_survives_path_wrapping() {
        let err = TemplateError::from(ValidationError::new("name", "template name is required"))
            .at_path("/tmp/t.yml");
        assert_eq!(err.validation().map(|v| v.field.as_str()), Some("name"));
        assert!(err.to_string().contains("/tmp/t.yml"));
    }

    #[test]
    fn test_cycle_display() {
        let err = TemplateError::InheritanceCycle {
            chain: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "Inheritance cycle detected: a -> b -> a");
    }
}
