//! Resolve command - Produce a launch configuration for a template.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use clap::Args;
use tracing::{info, warn};

use cws_templates::{
    Architecture, InstanceSize, PackageManager, ResolveOptions, ResolvedConfiguration,
    StatsCollector,
};

use super::{parse_key_values, Globals};

#[derive(Args)]
pub struct ResolveArgs {
    /// Template name or slug
    template: String,

    /// Target region (defaults to the configured region)
    #[arg(short, long)]
    region: Option<String>,

    /// Target architecture: x86_64 or arm64
    #[arg(short, long)]
    arch: Option<String>,

    /// Override the template's package manager
    #[arg(long)]
    package_manager: Option<String>,

    /// Instance size: XS, S, M, L or XL
    #[arg(long)]
    size: Option<String>,

    /// Pin the OS version or alias (latest, lts, previous-lts)
    #[arg(long)]
    os_version: Option<String>,

    /// Template parameter as KEY=VALUE (repeatable)
    #[arg(long = "param")]
    params: Vec<String>,

    /// Print the configuration as JSON
    #[arg(long)]
    json: bool,

    /// Record the launch in the stats file
    #[arg(long)]
    record: bool,
}

impl ResolveArgs {
    fn options(&self) -> Result<ResolveOptions> {
        let mut options = ResolveOptions::new().with_parameters(parse_key_values(&self.params)?);
        if let Some(pm) = &self.package_manager {
            options = options.with_package_manager(pm.parse::<PackageManager>()?);
        }
        if let Some(size) = &self.size {
            options = options.with_size(size.parse::<InstanceSize>()?);
        }
        if let Some(version) = &self.os_version {
            options = options.with_os_version(version.clone());
        }
        Ok(options)
    }
}

pub async fn execute(args: ResolveArgs, globals: &Globals) -> Result<()> {
    let engine = globals.engine()?;
    let region = args
        .region
        .clone()
        .unwrap_or_else(|| engine.config.default_region.clone());
    let arch = match &args.arch {
        Some(arch) => arch.parse::<Architecture>()?,
        None => engine.config.default_arch,
    };
    let options = args.options()?;

    let template = engine.registry.get(&args.template)?;
    let resolver = engine.config.resolver(engine.catalog.clone())?;
    info!("Resolving {} for {}/{}", template.name, region, arch);
    let config = resolver.resolve(&template, &region, arch, &options).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&config)?);
    } else {
        print_summary(&config, &region, arch);
    }

    if args.record {
        record_launch(&engine.config.stats_file, &config, &region, arch)?;
    }
    Ok(())
}

fn print_summary(config: &ResolvedConfiguration, region: &str, arch: Architecture) {
    println!("✅ {} ({})", config.name, config.slug);
    println!("   Package manager: {}", config.package_manager);
    println!(
        "   Image:           {}",
        config.image_for(region, arch).unwrap_or("-")
    );
    println!(
        "   Instance type:   {}",
        config.instance_type_for(arch).unwrap_or("-")
    );
    if let Some(cost) = config.cost_for(arch) {
        println!("   Cost per hour:   ${:.4}", cost);
    }
    let ports: Vec<String> = config.ports.iter().map(u16::to_string).collect();
    println!("   Ports:           {}", ports.join(", "));
    if config.idle_detection.enabled {
        println!(
            "   Idle detection:  {} min idle, hibernate after {} min",
            config.idle_detection.idle_threshold_minutes,
            config.idle_detection.hibernate_threshold_minutes
        );
    }
    print_tags(&config.tags);
    println!(
        "   User data:       {} bytes (see `cws script {}`)",
        config.user_data.len(),
        config.slug
    );
}

fn print_tags(tags: &BTreeMap<String, String>) {
    if tags.is_empty() {
        return;
    }
    let tags: Vec<String> = tags.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
    println!("   Tags:            {}", tags.join(", "));
}

fn record_launch(
    stats_file: &Option<std::path::PathBuf>,
    config: &ResolvedConfiguration,
    region: &str,
    arch: Architecture,
) -> Result<()> {
    let Some(path) = stats_file else {
        warn!("No stats file configured, launch not recorded");
        return Ok(());
    };
    let instance_type = config.instance_type_for(arch).unwrap_or("unknown");
    let stats = StatsCollector::load(path)
        .with_context(|| format!("Failed to load stats from {}", path.display()))?;
    stats.record_launch(&config.slug, region, instance_type);
    stats
        .save(path)
        .with_context(|| format!("Failed to save stats to {}", path.display()))?;
    info!("Recorded launch of {} in {}", config.slug, region);
    Ok(())
}
