//! Image command - Look up base OS images.

use anyhow::{Context, Result};
use clap::Args;

use cws_templates::images::VERSION_ALIASES;
use cws_templates::{Architecture, ImageCatalog};

use super::Globals;

#[derive(Args)]
pub struct ImageArgs {
    /// Distribution name, e.g. ubuntu or rocky
    distro: String,

    /// Version or alias (defaults to the distribution's default version)
    #[arg(long)]
    os_version: Option<String>,

    /// Target region (defaults to the configured region)
    #[arg(short, long)]
    region: Option<String>,

    /// Target architecture: x86_64 or arm64
    #[arg(short, long)]
    arch: Option<String>,

    /// List known versions and aliases instead of resolving
    #[arg(long)]
    list: bool,
}

pub async fn execute(args: ImageArgs, globals: &Globals) -> Result<()> {
    let config = globals.config()?;
    let catalog = config.catalog().context("Failed to load image catalog")?;

    if args.list {
        return list_versions(&catalog, &args.distro);
    }

    let region = args.region.unwrap_or_else(|| config.default_region.clone());
    let arch = match &args.arch {
        Some(arch) => arch.parse::<Architecture>()?,
        None => config.default_arch,
    };
    let requested = args.os_version.unwrap_or_default();
    let version = catalog.resolve_version(&args.distro, &requested)?;
    let image = catalog.lookup(&args.distro, &version, &region, arch)?;

    if globals.quiet {
        println!("{}", image);
    } else {
        println!("✅ {} {} {}/{}: {}", args.distro, version, region, arch, image);
    }
    Ok(())
}

fn list_versions(catalog: &ImageCatalog, distro: &str) -> Result<()> {
    let default = catalog.default_version(distro)?;
    println!("📋 {}", distro);
    for version in catalog.versions(distro)? {
        let marker = if version == default { " (default)" } else { "" };
        println!("   {}{}", version, marker);
    }
    let aliases = catalog.aliases(distro)?;
    for alias in VERSION_ALIASES {
        if let Some(target) = aliases.get(alias) {
            println!("   {} -> {}", alias, target);
        }
    }
    Ok(())
}
