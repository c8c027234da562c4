//! Script command - Print a template's provisioning script.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use tracing::info;

use cws_templates::{PackageManager, ResolveOptions};

use super::{parse_key_values, Globals};

#[derive(Args)]
pub struct ScriptArgs {
    /// Template name or slug
    template: String,

    /// Override the template's package manager
    #[arg(long)]
    package_manager: Option<String>,

    /// Template parameter as KEY=VALUE (repeatable)
    #[arg(long = "param")]
    params: Vec<String>,

    /// Write the script to a file instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,
}

pub async fn execute(args: ScriptArgs, globals: &Globals) -> Result<()> {
    let engine = globals.engine()?;
    let template = engine.registry.get(&args.template)?;

    let mut options = ResolveOptions::new().with_parameters(parse_key_values(&args.params)?);
    if let Some(pm) = &args.package_manager {
        options = options.with_package_manager(pm.parse::<PackageManager>()?);
    }

    let resolver = engine.config.resolver(engine.catalog.clone())?;
    let (prepared, manager) = resolver.resolver().prepare(&template, &options)?;
    let script = resolver
        .resolver()
        .provisioning_script(&prepared, manager)?;

    match &args.output {
        Some(path) => {
            std::fs::write(path, &script)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            info!("Wrote {} script for {} to {:?}", manager, template.name, path);
            if !globals.quiet {
                println!("✅ Script written to {}", path.display());
            }
        }
        None => print!("{}", script),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_script_written_to_file() {
        let temp = tempdir().unwrap();
        fs::write(
            temp.path().join("t.yml"),
            "name: Tiny\ndescription: t\nbase: rocky-9\npackage_manager: dnf\n\
             packages:\n  system: [git]\n",
        )
        .unwrap();
        let output = temp.path().join("out.sh");

        let globals = Globals {
            quiet: true,
            templates_dir: vec![temp.path().to_path_buf()],
            config: None,
        };
        let args = ScriptArgs {
            template: "Tiny".into(),
            package_manager: None,
            params: vec![],
            output: Some(output.clone()),
        };
        execute(args, &globals).await.unwrap();

        let script = fs::read_to_string(output).unwrap();
        assert!(script.starts_with("#!/bin/bash"));
        assert!(script.contains("dnf install -y git"));
    }
}
