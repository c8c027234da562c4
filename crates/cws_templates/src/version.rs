//! OS version constraints and dependency resolution.
//!
//! Version requirements come from `dependencies` entries of type `base_os`
//! and accept `>=X`, `>X`, `^X`, `~X` or an exact version. Constraints are
//! satisfied against the versions the [`ImageCatalog`] knows for the distro,
//! picking the highest match.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{TemplateError, TemplateResult};
use crate::images::ImageCatalog;
use crate::manifest::{Architecture, Template};

/// Parse the leading numeric part of a version into components, padded to at
/// least major and minor.
pub fn parse_version(version: &str) -> TemplateResult<Vec<u64>> {
    let numeric: String = version
        .trim()
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    if numeric.is_empty() {
        return Err(TemplateError::InvalidConstraint(format!(
            "no numeric version found in: {}",
            version
        )));
    }

    let mut components = numeric
        .split('.')
        .map(|part| {
            part.parse::<u64>().map_err(|_| {
                TemplateError::InvalidConstraint(format!(
                    "invalid version component '{}' in {}",
                    part, version
                ))
            })
        })
        .collect::<TemplateResult<Vec<_>>>()?;

    while components.len() < 2 {
        components.push(0);
    }
    Ok(components)
}

/// Compare component vectors, treating missing components as zero.
pub fn compare_components(a: &[u64], b: &[u64]) -> Ordering {
    let len = a.len().max(b.len());
    for i in 0..len {
        let left = a.get(i).copied().unwrap_or(0);
        let right = b.get(i).copied().unwrap_or(0);
        match left.cmp(&right) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

/// Compare two dotted version strings.
pub fn compare_versions(a: &str, b: &str) -> TemplateResult<Ordering> {
    Ok(compare_components(&parse_version(a)?, &parse_version(b)?))
}

/// A parsed version requirement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionConstraint {
    Exact(String),
    /// `>=X`
    AtLeast(String),
    /// `>X`
    GreaterThan(String),
    /// `^X`: same major version.
    Compatible(String),
    /// `~X`: same major and minor version.
    Approximate(String),
}

impl VersionConstraint {
    pub fn parse(constraint: &str) -> TemplateResult<Self> {
        let constraint = constraint.trim();
        let invalid = || TemplateError::InvalidConstraint(constraint.to_string());

        let (make, rest): (fn(String) -> Self, &str) =
            if let Some(rest) = constraint.strip_prefix(">=") {
                (VersionConstraint::AtLeast, rest)
            } else if let Some(rest) = constraint.strip_prefix('>') {
                (VersionConstraint::GreaterThan, rest)
            } else if let Some(rest) = constraint.strip_prefix('^') {
                (VersionConstraint::Compatible, rest)
            } else if let Some(rest) = constraint.strip_prefix('~') {
                (VersionConstraint::Approximate, rest)
            } else if let Some(rest) = constraint.strip_prefix('=') {
                (VersionConstraint::Exact, rest)
            } else {
                (VersionConstraint::Exact, constraint)
            };

        let bound = rest.trim();
        if bound.is_empty() || bound.contains(['<', '>', '=', '^', '~', '*']) {
            return Err(invalid());
        }
        let parsed = make(bound.to_string());
        if !matches!(parsed, VersionConstraint::Exact(_)) {
            parse_version(bound).map_err(|_| invalid())?;
        }
        Ok(parsed)
    }

    /// The version literal the constraint is anchored on.
    pub fn bound(&self) -> &str {
        match self {
            VersionConstraint::Exact(v)
            | VersionConstraint::AtLeast(v)
            | VersionConstraint::GreaterThan(v)
            | VersionConstraint::Compatible(v)
            | VersionConstraint::Approximate(v) => v,
        }
    }

    /// Whether `version` satisfies the constraint.
    pub fn matches(&self, version: &str) -> TemplateResult<bool> {
        if let VersionConstraint::Exact(bound) = self {
            return Ok(version == bound);
        }

        let candidate = parse_version(version)?;
        let bound = parse_version(self.bound())?;
        let satisfied = match self {
            VersionConstraint::AtLeast(_) => {
                compare_components(&candidate, &bound) != Ordering::Less
            }
            VersionConstraint::GreaterThan(_) => {
                compare_components(&candidate, &bound) == Ordering::Greater
            }
            VersionConstraint::Compatible(_) => candidate[0] == bound[0],
            VersionConstraint::Approximate(_) => {
                candidate[0] == bound[0] && candidate[1] == bound[1]
            }
            VersionConstraint::Exact(_) => false,
        };
        Ok(satisfied)
    }

    /// Highest known version of `distro` satisfying the constraint.
    pub fn resolve(&self, distro: &str, catalog: &ImageCatalog) -> TemplateResult<String> {
        let mut best: Option<(&str, Vec<u64>)> = None;
        for version in catalog.versions(distro)? {
            if !self.matches(version)? {
                continue;
            }
            let components = parse_version(version)?;
            let better = match &best {
                Some((_, current)) => compare_components(&components, current) == Ordering::Greater,
                None => true,
            };
            if better {
                best = Some((version, components));
            }
        }

        best.map(|(version, _)| version.to_string())
            .ok_or_else(|| TemplateError::UnsatisfiableConstraint {
                distro: distro.to_string(),
                constraint: self.to_string(),
            })
    }
}

impl FromStr for VersionConstraint {
    type Err = TemplateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for VersionConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VersionConstraint::Exact(v) => write!(f, "{}", v),
            VersionConstraint::AtLeast(v) => write!(f, ">={}", v),
            VersionConstraint::GreaterThan(v) => write!(f, ">{}", v),
            VersionConstraint::Compatible(v) => write!(f, "^{}", v),
            VersionConstraint::Approximate(v) => write!(f, "~{}", v),
        }
    }
}

/// Where the selected OS version came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionSource {
    UserOverride,
    Base,
    TemplateRequirement,
    Default,
}

impl fmt::Display for VersionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            VersionSource::UserOverride => "user_override",
            VersionSource::Base => "base",
            VersionSource::TemplateRequirement => "template_requirement",
            VersionSource::Default => "default",
        };
        f.write_str(s)
    }
}

/// Outcome of OS version selection for a template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedDependencies {
    pub distro: String,
    pub version: String,
    pub image: String,
    pub source: VersionSource,
    /// False when a `base_os` requirement exists and the chosen version
    /// does not satisfy it.
    pub satisfies_requirement: bool,
}

/// Chooses the OS version for a template and resolves its image.
#[derive(Debug, Clone)]
pub struct DependencyResolver {
    catalog: Arc<ImageCatalog>,
}

impl DependencyResolver {
    pub fn new(catalog: Arc<ImageCatalog>) -> Self {
        Self { catalog }
    }

    pub fn catalog(&self) -> &ImageCatalog {
        &self.catalog
    }

    /// The template's first `base_os` requirement, parsed.
    pub fn requirement(template: &Template) -> TemplateResult<Option<VersionConstraint>> {
        template
            .dependencies
            .iter()
            .find(|dep| dep.is_base_os() && dep.version.as_deref().is_some_and(|v| !v.is_empty()))
            .and_then(|dep| dep.version.as_deref())
            .map(VersionConstraint::parse)
            .transpose()
    }

    /// Pick the OS version by priority (user override, version in `base`,
    /// `base_os` requirement, distro default) and resolve its image.
    pub fn resolve(
        &self,
        template: &Template,
        user_version: Option<&str>,
        region: &str,
        arch: Architecture,
    ) -> TemplateResult<ResolvedDependencies> {
        if template.base.trim().is_empty() {
            return Err(TemplateError::UnsupportedBase(String::new()));
        }
        let base = self.catalog.parse_base(&template.base)?;
        let requirement = Self::requirement(template)?;

        let (version, source) = match (user_version.filter(|v| !v.is_empty()), &base.version) {
            (Some(user), _) => (
                self.catalog.resolve_version(&base.distro, user)?,
                VersionSource::UserOverride,
            ),
            (None, Some(embedded)) => (
                self.catalog.resolve_version(&base.distro, embedded)?,
                VersionSource::Base,
            ),
            (None, None) => match &requirement {
                Some(constraint) => (
                    constraint.resolve(&base.distro, &self.catalog)?,
                    VersionSource::TemplateRequirement,
                ),
                None => (
                    self.catalog.resolve_version(&base.distro, "")?,
                    VersionSource::Default,
                ),
            },
        };

        let satisfies_requirement = match &requirement {
            Some(constraint) => constraint.matches(&version)?,
            None => true,
        };
        let image = self.catalog.lookup(&base.distro, &version, region, arch)?;
        debug!(
            "Template {} uses {} {} ({})",
            template.name, base.distro, version, source
        );

        Ok(ResolvedDependencies {
            distro: base.distro,
            version,
            image,
            source,
            satisfies_requirement,
        })
    }

    /// Human-readable summary of a template's OS requirements.
    pub fn describe_requirements(template: &Template) -> String {
        let requirements: Vec<String> = template
            .dependencies
            .iter()
            .filter(|dep| dep.is_base_os())
            .filter_map(|dep| dep.version.as_deref())
            .map(|version| format!("Requires: {} {}", template.base, version))
            .collect();
        if requirements.is_empty() {
            "No specific version requirements".to_string()
        } else {
            requirements.join(", ")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::TemplateDependency;

    fn resolver() -> DependencyResolver {
        DependencyResolver::new(Arc::new(ImageCatalog::builtin().unwrap()))
    }

    fn template(base: &str, requirement: Option<&str>) -> Template {
        Template {
            name: "test".into(),
            base: base.into(),
            dependencies: requirement
                .map(|v| {
                    vec![TemplateDependency {
                        name: "os".into(),
                        version: Some(v.into()),
                        kind: Some("base_os".into()),
                    }]
                })
                .unwrap_or_default(),
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_version_pads_components() {
        assert_eq!(parse_version("9").unwrap(), vec![9, 0]);
        assert_eq!(parse_version("22.04").unwrap(), vec![22, 4]);
        assert_eq!(parse_version("3.20.1-r0").unwrap(), vec![3, 20, 1]);
        assert!(parse_version("latest").is_err());
    }

    #[test]
    fn test_compare_versions() {
        assert_eq!(compare_versions("22.04", "24.04").unwrap(), Ordering::Less);
        assert_eq!(compare_versions("9", "9.0.0").unwrap(), Ordering::Equal);
        assert_eq!(compare_versions("10", "9.5").unwrap(), Ordering::Greater);
    }

    #[test]
    fn test_constraint_parse_and_bound() {
        assert_eq!(
            VersionConstraint::parse(">=22.04").unwrap(),
            VersionConstraint::AtLeast("22.04".into())
        );
        assert_eq!(VersionConstraint::parse("^9").unwrap().bound(), "9");
        assert_eq!(VersionConstraint::parse("~ 22.04").unwrap().bound(), "22.04");
        assert_eq!(
            VersionConstraint::parse("24.04").unwrap(),
            VersionConstraint::Exact("24.04".into())
        );
        assert!(VersionConstraint::parse("<=22.04").is_err());
        assert!(VersionConstraint::parse(">=").is_err());
        assert!(VersionConstraint::parse("1.*").is_err());
    }

    #[test]
    fn test_constraint_matching() {
        let caret = VersionConstraint::parse("^22.04").unwrap();
        assert!(caret.matches("22.10").unwrap());
        assert!(!caret.matches("24.04").unwrap());

        let tilde = VersionConstraint::parse("~3.20").unwrap();
        assert!(tilde.matches("3.20.2").unwrap());
        assert!(!tilde.matches("3.21").unwrap());

        let gt = VersionConstraint::parse(">22.04").unwrap();
        assert!(!gt.matches("22.04").unwrap());
        assert!(gt.matches("24.04").unwrap());
    }

    #[test]
    fn test_constraint_picks_highest_known_version() {
        let catalog = ImageCatalog::builtin().unwrap();
        let at_least = VersionConstraint::parse(">=20.04").unwrap();
        assert_eq!(at_least.resolve("ubuntu", &catalog).unwrap(), "24.04");

        let caret = VersionConstraint::parse("^22").unwrap();
        assert_eq!(caret.resolve("ubuntu", &catalog).unwrap(), "22.04");

        let rocky = VersionConstraint::parse(">=9").unwrap();
        assert_eq!(rocky.resolve("rocky", &catalog).unwrap(), "10");

        let none = VersionConstraint::parse(">=30").unwrap();
        assert!(matches!(
            none.resolve("ubuntu", &catalog),
            Err(TemplateError::UnsatisfiableConstraint { .. })
        ));
    }

    #[test]
    fn test_version_source_priority() {
        let resolver = resolver();

        let resolved = resolver
            .resolve(
                &template("ubuntu-22.04", Some(">=20.04")),
                Some("20.04"),
                "us-east-1",
                Architecture::X86_64,
            )
            .unwrap();
        assert_eq!(resolved.source, VersionSource::UserOverride);
        assert_eq!(resolved.version, "20.04");

        let resolved = resolver
            .resolve(&template("ubuntu-22.04", None), None, "us-east-1", Architecture::X86_64)
            .unwrap();
        assert_eq!(resolved.source, VersionSource::Base);
        assert_eq!(resolved.image, "ami-02029c87fa31fb148");

        let resolved = resolver
            .resolve(&template("ubuntu", Some("^22")), None, "us-east-1", Architecture::Arm64)
            .unwrap();
        assert_eq!(resolved.source, VersionSource::TemplateRequirement);
        assert_eq!(resolved.version, "22.04");

        let resolved = resolver
            .resolve(&template("ubuntu", None), None, "us-east-1", Architecture::X86_64)
            .unwrap();
        assert_eq!(resolved.source, VersionSource::Default);
        assert_eq!(resolved.version, "24.04");
    }

    #[test]
    fn test_requirement_mismatch_is_reported() {
        let resolved = resolver()
            .resolve(
                &template("ubuntu-20.04", Some(">=22.04")),
                None,
                "us-east-1",
                Architecture::X86_64,
            )
            .unwrap();
        assert!(!resolved.satisfies_requirement);
    }

    #[test]
    fn test_describe_requirements() {
        assert_eq!(
            DependencyResolver::describe_requirements(&template("ubuntu", Some(">=22.04"))),
            "Requires: ubuntu >=22.04"
        );
        assert_eq!(
            DependencyResolver::describe_requirements(&template("ubuntu", None)),
            "No specific version requirements"
        );
    }
}
