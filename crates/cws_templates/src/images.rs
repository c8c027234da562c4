//! Machine image lookup.
//!
//! [`ImageCatalog`] maps distro → version → region → architecture to a base
//! image id and owns each distro's alias table. [`PrebuiltImageSource`] is the
//! seam for images baked from a specific template.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{TemplateError, TemplateResult};
use crate::manifest::{Architecture, ImageMap};

const BUILTIN_CATALOG: &str = include_str!("../data/base_images.yaml");

/// Version strings treated as aliases rather than concrete versions.
pub const VERSION_ALIASES: [&str; 3] = ["latest", "lts", "previous-lts"];

/// Whether `version` is one of the recognised alias tokens.
pub fn is_version_alias(version: &str) -> bool {
    VERSION_ALIASES.contains(&version)
}

/// Images and aliases for one distribution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistroImages {
    pub default_version: String,
    #[serde(default)]
    pub aliases: BTreeMap<String, String>,
    /// Version → region → architecture → image id.
    #[serde(default)]
    pub versions: BTreeMap<String, ImageMap>,
}

/// A parsed `base` identifier such as `ubuntu-22.04`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BaseOs {
    pub distro: String,
    /// Version or alias embedded in the identifier, if any.
    pub version: Option<String>,
}

impl BaseOs {
    /// `distro-version`, or just `distro` when no version is set.
    pub fn identifier(&self) -> String {
        match &self.version {
            Some(version) => format!("{}-{}", self.distro, version),
            None => self.distro.clone(),
        }
    }
}

/// Base image table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImageCatalog {
    distros: BTreeMap<String, DistroImages>,
}

impl ImageCatalog {
    /// The catalog shipped with the crate.
    pub fn builtin() -> TemplateResult<Self> {
        Self::from_yaml_str(BUILTIN_CATALOG)
    }

    pub fn from_yaml_str(content: &str) -> TemplateResult<Self> {
        let catalog: ImageCatalog = serde_yaml::from_str(content)?;
        Ok(catalog)
    }

    /// Load a catalog file in the same layout as the builtin one.
    pub fn load(path: &Path) -> TemplateResult<Self> {
        debug!("Loading image catalog from {:?}", path);
        let content = fs::read_to_string(path).map_err(|e| TemplateError::from(e).at_path(path))?;
        Self::from_yaml_str(&content).map_err(|e| e.at_path(path))
    }

    /// Add or replace the images of one distro.
    pub fn insert(&mut self, distro: impl Into<String>, images: DistroImages) {
        self.distros.insert(distro.into(), images);
    }

    pub fn distros(&self) -> impl Iterator<Item = &str> {
        self.distros.keys().map(String::as_str)
    }

    fn distro(&self, distro: &str) -> TemplateResult<&DistroImages> {
        self.distros
            .get(distro)
            .ok_or_else(|| TemplateError::UnsupportedDistro(distro.to_string()))
    }

    pub fn default_version(&self, distro: &str) -> TemplateResult<&str> {
        Ok(self.distro(distro)?.default_version.as_str())
    }

    pub fn aliases(&self, distro: &str) -> TemplateResult<&BTreeMap<String, String>> {
        Ok(&self.distro(distro)?.aliases)
    }

    /// Known concrete versions of a distro, in table order.
    pub fn versions(&self, distro: &str) -> TemplateResult<Vec<&str>> {
        Ok(self
            .distro(distro)?
            .versions
            .keys()
            .map(String::as_str)
            .collect())
    }

    /// Reduce an empty string, alias or exact version to a known version.
    pub fn resolve_version(&self, distro: &str, version: &str) -> TemplateResult<String> {
        let images = self.distro(distro)?;

        let resolved = if version.is_empty() {
            images.default_version.clone()
        } else if is_version_alias(version) {
            images
                .aliases
                .get(version)
                .cloned()
                .ok_or_else(|| TemplateError::UnknownAlias {
                    distro: distro.to_string(),
                    alias: version.to_string(),
                })?
        } else {
            version.to_string()
        };

        if !images.versions.contains_key(&resolved) {
            return Err(TemplateError::UnsupportedVersion {
                distro: distro.to_string(),
                version: resolved,
            });
        }
        Ok(resolved)
    }

    /// Region → architecture map for a concrete version.
    pub fn version_images(&self, distro: &str, version: &str) -> TemplateResult<&ImageMap> {
        self.distro(distro)?
            .versions
            .get(version)
            .ok_or_else(|| TemplateError::UnsupportedVersion {
                distro: distro.to_string(),
                version: version.to_string(),
            })
    }

    /// Four-level lookup of a concrete version's image id.
    pub fn lookup(
        &self,
        distro: &str,
        version: &str,
        region: &str,
        arch: Architecture,
    ) -> TemplateResult<String> {
        let regions = self.version_images(distro, version)?;
        let archs = regions
            .get(region)
            .ok_or_else(|| TemplateError::UnsupportedRegion {
                distro: distro.to_string(),
                version: version.to_string(),
                region: region.to_string(),
            })?;
        archs
            .get(arch.as_str())
            .filter(|id| !id.is_empty())
            .cloned()
            .ok_or_else(|| TemplateError::UnsupportedArchitecture {
                distro: distro.to_string(),
                version: version.to_string(),
                region: region.to_string(),
                arch: arch.to_string(),
            })
    }

    /// Resolve an image id from a version, alias or empty string.
    pub fn resolve_image(
        &self,
        distro: &str,
        version_or_alias: &str,
        region: &str,
        arch: Architecture,
    ) -> TemplateResult<String> {
        let version = self.resolve_version(distro, version_or_alias)?;
        let image = self.lookup(distro, &version, region, arch)?;
        debug!(
            "Resolved {} {} ({}) in {}/{} to {}",
            distro, version, version_or_alias, region, arch, image
        );
        Ok(image)
    }

    /// Split a `base` identifier into distro and optional version.
    pub fn parse_base(&self, base: &str) -> TemplateResult<BaseOs> {
        let base = base.trim();
        if self.distros.contains_key(base) {
            return Ok(BaseOs {
                distro: base.to_string(),
                version: None,
            });
        }
        match base.split_once('-') {
            Some((distro, version)) if self.distros.contains_key(distro) && !version.is_empty() => {
                Ok(BaseOs {
                    distro: distro.to_string(),
                    version: Some(version.to_string()),
                })
            }
            _ => Err(TemplateError::UnsupportedBase(base.to_string())),
        }
    }

    /// Whether `base` names a distro in the catalog with a known version or
    /// alias.
    pub fn is_known_base(&self, base: &str) -> bool {
        let Ok(parsed) = self.parse_base(base) else {
            return false;
        };
        match parsed.version {
            None => true,
            Some(version) => self.resolve_version(&parsed.distro, &version).is_ok(),
        }
    }
}

/// Source of images pre-built from a specific template.
#[cfg_attr(test, mockall::automock)]
pub trait PrebuiltImageSource: Send + Sync {
    /// Region → architecture map for a template, if any image was baked.
    fn images_for(&self, template: &str) -> Option<ImageMap>;
}

/// In-memory pre-built image registry keyed by template name or slug.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PrebuiltImages {
    images: BTreeMap<String, ImageMap>,
}

impl PrebuiltImages {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a `template → region → arch → id` YAML file.
    pub fn load(path: &Path) -> TemplateResult<Self> {
        let content = fs::read_to_string(path).map_err(|e| TemplateError::from(e).at_path(path))?;
        let images: PrebuiltImages =
            serde_yaml::from_str(&content).map_err(|e| TemplateError::from(e).at_path(path))?;
        debug!("Loaded pre-built images for {} templates", images.len());
        Ok(images)
    }

    pub fn insert(
        &mut self,
        template: impl Into<String>,
        region: impl Into<String>,
        arch: Architecture,
        image: impl Into<String>,
    ) {
        self.images
            .entry(template.into())
            .or_default()
            .entry(region.into())
            .or_default()
            .insert(arch.to_string(), image.into());
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }
}

impl PrebuiltImageSource for PrebuiltImages {
    fn images_for(&self, template: &str) -> Option<ImageMap> {
        self.images.get(template).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_catalog_parses() {
        let catalog = ImageCatalog::builtin().unwrap();
        let distros: Vec<&str> = catalog.distros().collect();
        for distro in ["ubuntu", "rocky", "amazonlinux", "debian", "rhel", "alpine"] {
            assert!(distros.contains(&distro), "missing {}", distro);
            let default = catalog.default_version(distro).unwrap().to_string();
            assert!(catalog.versions(distro).unwrap().contains(&default.as_str()));
        }
    }

    #[test]
    fn test_known_ubuntu_image() {
        let catalog = ImageCatalog::builtin().unwrap();
        let image = catalog
            .lookup("ubuntu", "22.04", "us-east-1", Architecture::X86_64)
            .unwrap();
        assert_eq!(image, "ami-02029c87fa31fb148");
    }

    #[test]
    fn test_alias_matches_direct_version() {
        let catalog = ImageCatalog::builtin().unwrap();
        for arch in Architecture::ALL {
            let via_alias = catalog
                .resolve_image("ubuntu", "latest", "us-west-2", arch)
                .unwrap();
            let direct = catalog
                .resolve_image("ubuntu", "24.04", "us-west-2", arch)
                .unwrap();
            assert_eq!(via_alias, direct);
        }
        assert_eq!(catalog.resolve_version("rocky", "lts").unwrap(), "9");
        assert_eq!(catalog.resolve_version("ubuntu", "previous-lts").unwrap(), "22.04");
    }

    #[test]
    fn test_empty_version_uses_default() {
        let catalog = ImageCatalog::builtin().unwrap();
        assert_eq!(catalog.resolve_version("ubuntu", "").unwrap(), "24.04");
        assert_eq!(catalog.resolve_version("amazonlinux", "").unwrap(), "2023");
    }

    #[test]
    fn test_each_lookup_level_reports_its_failure() {
        let catalog = ImageCatalog::builtin().unwrap();
        assert!(matches!(
            catalog.resolve_image("gentoo", "", "us-east-1", Architecture::X86_64),
            Err(TemplateError::UnsupportedDistro(_))
        ));
        assert!(matches!(
            catalog.resolve_image("ubuntu", "18.04", "us-east-1", Architecture::X86_64),
            Err(TemplateError::UnsupportedVersion { .. })
        ));
        assert!(matches!(
            catalog.resolve_image("amazonlinux", "previous-lts", "us-east-1", Architecture::X86_64),
            Err(TemplateError::UnknownAlias { .. })
        ));
        assert!(matches!(
            catalog.resolve_image("ubuntu", "20.04", "eu-west-1", Architecture::X86_64),
            Err(TemplateError::UnsupportedRegion { .. })
        ));
    }

    #[test]
    fn test_missing_architecture() {
        let mut catalog = ImageCatalog::default();
        let mut regions = ImageMap::new();
        regions
            .entry("us-east-1".to_string())
            .or_default()
            .insert("x86_64".to_string(), "ami-1".to_string());
        let mut versions = BTreeMap::new();
        versions.insert("1".to_string(), regions);
        catalog.insert(
            "tiny",
            DistroImages {
                default_version: "1".into(),
                aliases: BTreeMap::new(),
                versions,
            },
        );
        assert!(matches!(
            catalog.lookup("tiny", "1", "us-east-1", Architecture::Arm64),
            Err(TemplateError::UnsupportedArchitecture { .. })
        ));
    }

    #[test]
    fn test_parse_base() {
        let catalog = ImageCatalog::builtin().unwrap();
        let base = catalog.parse_base("ubuntu-22.04").unwrap();
        assert_eq!(base.distro, "ubuntu");
        assert_eq!(base.version.as_deref(), Some("22.04"));
        assert_eq!(base.identifier(), "ubuntu-22.04");

        let base = catalog.parse_base("amazonlinux-2023").unwrap();
        assert_eq!(base.distro, "amazonlinux");

        assert_eq!(catalog.parse_base("rocky").unwrap().version, None);
        assert!(catalog.parse_base("windows-2022").is_err());
    }

    #[test]
    fn test_known_base() {
        let catalog = ImageCatalog::builtin().unwrap();
        assert!(catalog.is_known_base("ubuntu-22.04"));
        assert!(catalog.is_known_base("rocky-9"));
        assert!(catalog.is_known_base("ubuntu-latest"));
        assert!(!catalog.is_known_base("ubuntu-18.04"));
        assert!(!catalog.is_known_base("freebsd-14"));
    }

    #[test]
    fn test_prebuilt_images() {
        let mut images = PrebuiltImages::new();
        images.insert("python-ml", "us-east-1", Architecture::X86_64, "ami-abc");
        let map = images.images_for("python-ml").unwrap();
        assert_eq!(map["us-east-1"]["x86_64"], "ami-abc");
        assert!(images.images_for("r-research").is_none());
    }
}
