//! End-to-end resolution tests.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use cws_templates::sizing::FALLBACK_HOURLY_COST;
use cws_templates::version::VersionSource;
use cws_templates::{
    Architecture, DependencyResolver, ImageCatalog, InstanceSize, OptimizedResolver,
    PackageManager, ResolveOptions, ServiceConfig, StatsCollector, Template, TemplateError,
    TemplateParser, TemplateRegistry, TemplateResolver,
};

fn templates_path() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../../templates")
}

fn catalog() -> Arc<ImageCatalog> {
    Arc::new(ImageCatalog::builtin().unwrap())
}

fn registry() -> TemplateRegistry {
    let mut registry = TemplateRegistry::new([templates_path()]);
    registry.scan(&TemplateParser::new(catalog())).unwrap();
    registry
}

fn scenario_template() -> Template {
    let mut template = Template {
        name: "Test".into(),
        description: "end to end".into(),
        base: "ubuntu-22.04".into(),
        package_manager: Some("apt".into()),
        ..Default::default()
    };
    template.packages.system = vec!["git".into()];
    template.services.push(ServiceConfig {
        name: "nginx".into(),
        port: 80,
        enable: Some(true),
        ..Default::default()
    });
    template.instance_defaults.ports = vec![8080];
    template
}

#[test]
fn test_end_to_end_scenario() {
    let resolver = TemplateResolver::new(catalog());
    let config = resolver
        .resolve(
            &scenario_template(),
            "us-east-1",
            Architecture::X86_64,
            &ResolveOptions::new(),
        )
        .unwrap();

    let mut ports = config.ports.clone();
    ports.sort_unstable();
    assert_eq!(ports, vec![22, 80, 8080]);
    assert!(!config.user_data.is_empty());
    assert!(config.user_data.contains("apt-get install -y git"));
    assert!(config.image_for("us-east-1", Architecture::X86_64).is_some());
    assert!(!config.idle_detection.enabled);
}

#[tokio::test]
async fn test_end_to_end_scenario_concurrent() {
    let resolver = OptimizedResolver::new(TemplateResolver::new(catalog()));
    let config = resolver
        .resolve(
            &scenario_template(),
            "us-east-1",
            Architecture::X86_64,
            &ResolveOptions::new(),
        )
        .await
        .unwrap();

    assert_eq!(config.ports, vec![22, 80, 8080]);
    assert!(config.user_data.contains("apt-get install -y git"));
    assert!(config.image_for("us-east-1", Architecture::X86_64).is_some());
    assert!(!config.idle_detection.enabled);
}

#[test]
fn test_alias_stability() {
    let catalog = catalog();
    for arch in Architecture::ALL {
        let via_alias = catalog
            .resolve_image("ubuntu", "latest", "us-east-1", arch)
            .unwrap();
        let default = catalog.default_version("ubuntu").unwrap().to_string();
        let direct = catalog
            .resolve_image("ubuntu", &default, "us-east-1", arch)
            .unwrap();
        assert_eq!(via_alias, direct);
        assert_eq!(
            via_alias,
            catalog.resolve_image("ubuntu", "24.04", "us-east-1", arch).unwrap()
        );
    }
}

#[test]
fn test_unknown_instance_type_costs_fallback() {
    let mut template = scenario_template();
    template.instance_defaults.instance_type = Some("x9.unknown".into());
    let config = TemplateResolver::new(catalog())
        .resolve(&template, "us-east-1", Architecture::X86_64, &ResolveOptions::new())
        .unwrap();
    let cost = config.cost_for(Architecture::X86_64).unwrap();
    assert!(cost > 0.0);
    assert_eq!(cost, FALLBACK_HOURLY_COST);
}

#[test]
fn test_ports_idempotent_without_services() {
    let mut template = scenario_template();
    template.services.clear();
    template.instance_defaults.ports.clear();
    let resolver = TemplateResolver::new(catalog());
    let options = ResolveOptions::new();

    let first = resolver
        .resolve(&template, "us-east-1", Architecture::X86_64, &options)
        .unwrap();
    let second = resolver
        .resolve(&template, "us-east-1", Architecture::X86_64, &options)
        .unwrap();
    assert_eq!(first.ports, vec![22]);
    assert_eq!(first.ports, second.ports);
}

#[test]
fn test_bundled_python_ml() {
    let registry = registry();
    let template = registry.get("python-ml").unwrap();
    let config = TemplateResolver::new(catalog())
        .resolve(
            &template,
            "us-west-2",
            Architecture::X86_64,
            &ResolveOptions::new()
                .with_size(InstanceSize::S)
                .with_parameter("python_version", "3.12"),
        )
        .unwrap();

    assert_eq!(config.package_manager, PackageManager::Conda);
    assert_eq!(config.description, "Conda-based Python 3.12 environment for machine learning");
    assert!(config.user_data.contains("conda install -y python=3.12"));
    assert!(config.user_data.contains("/opt/miniforge/bin/pip install wandb transformers"));
    assert!(config.user_data.contains("c.ServerApp.port = 8888"));
    assert_eq!(config.instance_type_for(Architecture::X86_64), Some("g4dn.xlarge"));
    assert_eq!(config.ports, vec![22, 8888]);
    assert!(config.idle_detection.enabled);
}

#[test]
fn test_bundled_python_ml_rejects_bad_parameter() {
    let registry = registry();
    let template = registry.get("python-ml").unwrap();
    let err = TemplateResolver::new(catalog())
        .resolve(
            &template,
            "us-east-1",
            Architecture::X86_64,
            &ResolveOptions::new().with_parameter("python_version", "2.7"),
        )
        .unwrap_err();
    assert!(matches!(err, TemplateError::InvalidParameter { .. }));
}

#[test]
fn test_bundled_version_requirements() {
    let registry = registry();
    let resolver = DependencyResolver::new(catalog());

    let r = registry.get("r-env").unwrap();
    let resolved = resolver
        .resolve(&r, None, "us-east-1", Architecture::X86_64)
        .unwrap();
    assert_eq!(resolved.version, "24.04");
    assert_eq!(resolved.source, VersionSource::TemplateRequirement);

    let rocky = registry.get("rocky-linux-9").unwrap();
    let resolved = resolver
        .resolve(&rocky, None, "us-east-1", Architecture::X86_64)
        .unwrap();
    assert_eq!(resolved.version, "9");

    let pinned = resolver
        .resolve(&rocky, Some("latest"), "us-east-1", Architecture::X86_64)
        .unwrap();
    assert_eq!(pinned.version, "10");
    assert_eq!(pinned.source, VersionSource::UserOverride);
    assert!(!pinned.satisfies_requirement);
}

#[test]
fn test_bundled_ami_template() {
    let registry = registry();
    let template = registry.get("deep-learning").unwrap();
    let resolver = TemplateResolver::new(catalog());

    let config = resolver
        .resolve(&template, "us-east-1", Architecture::Arm64, &ResolveOptions::new())
        .unwrap();
    assert_eq!(config.package_manager, PackageManager::Ami);
    assert_eq!(config.image_for("us-east-1", Architecture::Arm64), Some("ami-0c5b7f4e3d2a1f987"));
    assert_eq!(config.instance_type_for(Architecture::Arm64), Some("g5g.xlarge"));
    assert_eq!(config.cost_for(Architecture::X86_64), Some(0.526));
    assert!(!config.user_data.contains("apt-get"));

    let err = resolver
        .resolve(&template, "us-west-2", Architecture::Arm64, &ResolveOptions::new())
        .unwrap_err();
    assert!(matches!(err, TemplateError::MissingImageMapping { .. }));
}

#[test]
fn test_bundled_spack_and_dnf_scripts() {
    let registry = registry();
    let resolver = TemplateResolver::new(catalog());

    let hpc = resolver
        .resolve(
            &registry.get("hpc-spack-env").unwrap(),
            "us-east-1",
            Architecture::X86_64,
            &ResolveOptions::new(),
        )
        .unwrap();
    assert!(hpc.user_data.contains("spack add openmpi"));
    assert_eq!(hpc.user_data.matches("spack install").count(), 1);
    assert_eq!(hpc.instance_type_for(Architecture::X86_64), Some("c5.2xlarge"));

    let rocky = resolver
        .resolve(
            &registry.get("rocky-linux-9").unwrap(),
            "us-east-1",
            Architecture::X86_64,
            &ResolveOptions::new(),
        )
        .unwrap();
    assert!(rocky.user_data.contains("dnf install -y git python3 python3-pip gcc-gfortran"));
    assert!(rocky.user_data.contains("usermod -aG 'wheel' rocky"));
}

#[test]
fn test_resolve_all_bundled() {
    let registry = registry();
    let results =
        TemplateResolver::new(catalog()).resolve_all(&registry, "us-east-1", Architecture::X86_64);
    assert_eq!(results.len(), registry.len());
    for (name, result) in results {
        assert!(result.is_ok(), "{} failed: {:?}", name, result.err());
    }
}

#[tokio::test]
async fn test_record_launch_after_resolution() {
    let registry = registry();
    let resolver = OptimizedResolver::new(TemplateResolver::new(catalog()));
    let stats = Arc::new(StatsCollector::new());

    for region in ["us-east-1", "us-west-2"] {
        let template = registry.get("web-dev").unwrap();
        let config = resolver
            .resolve(&template, region, Architecture::X86_64, &ResolveOptions::new())
            .await
            .unwrap();
        let instance_type = config.instance_type_for(Architecture::X86_64).unwrap();
        stats.record_launch(&config.slug, region, instance_type);
    }

    let usage = stats.usage("web-dev").unwrap();
    assert_eq!(usage.launch_count, 2);
    assert_eq!(usage.instance_types["t3.large"], 2);
}
