//! List command - Show available templates.

use anyhow::Result;
use clap::Args;
use serde::Serialize;
use tracing::info;

use cws_templates::WorkloadClass;

use super::Globals;

#[derive(Args)]
pub struct ListArgs {
    /// Print JSON instead of a table
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Serialize)]
struct TemplateSummary {
    name: String,
    slug: String,
    base: String,
    package_manager: String,
    workload: WorkloadClass,
    description: String,
}

pub async fn execute(args: ListArgs, globals: &Globals) -> Result<()> {
    let engine = globals.engine()?;
    info!("Found {} template(s)", engine.registry.len());

    let summaries: Vec<TemplateSummary> = engine
        .registry
        .list()
        .into_iter()
        .map(|template| TemplateSummary {
            name: template.name.clone(),
            slug: template.slug.clone(),
            base: template.base.clone(),
            package_manager: template
                .package_manager
                .clone()
                .unwrap_or_else(|| "-".to_string()),
            workload: WorkloadClass::classify(template),
            description: template.description.clone(),
        })
        .collect();

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summaries)?);
        return Ok(());
    }

    if summaries.is_empty() {
        println!("⚠️  No templates found in {:?}", engine.config.template_dirs);
        return Ok(());
    }

    println!(
        "{:<40} {:<20} {:<16} {:<8} {}",
        "NAME", "SLUG", "BASE", "PM", "WORKLOAD"
    );
    for summary in &summaries {
        println!(
            "{:<40} {:<20} {:<16} {:<8} {}",
            summary.name, summary.slug, summary.base, summary.package_manager, summary.workload
        );
    }
    Ok(())
}
