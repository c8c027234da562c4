//! Info command - Show a template after inheritance.

use anyhow::Result;
use clap::Args;

use cws_templates::{DependencyResolver, WorkloadClass};

use super::Globals;

#[derive(Args)]
pub struct InfoArgs {
    /// Template name or slug
    template: String,
}

pub async fn execute(args: InfoArgs, globals: &Globals) -> Result<()> {
    let engine = globals.engine()?;
    let template = engine.registry.get(&args.template)?;

    println!("📋 {} ({})", template.name, template.slug);
    if let Some(path) = engine.registry.source_path(&template.name) {
        println!("   Source:   {}", path.display());
    }
    println!("   Workload: {}", WorkloadClass::classify(&template));
    println!("   {}", DependencyResolver::describe_requirements(&template));
    println!();
    print!("{}", serde_yaml::to_string(template.as_ref())?);
    Ok(())
}
