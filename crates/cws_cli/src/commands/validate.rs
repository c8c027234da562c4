//! Validate command - Validate template files.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Args;
use tracing::{debug, info};

use cws_templates::loader::is_template_file;
use cws_templates::parser::apply_defaults;
use cws_templates::{Template, TemplateLoader, ValidationPipeline, ValidationReport};

use super::Globals;

#[derive(Args)]
pub struct ValidateArgs {
    /// Template files or directories (defaults to the template directories)
    paths: Vec<PathBuf>,

    /// Treat warnings as failures
    #[arg(long)]
    strict: bool,
}

pub async fn execute(args: ValidateArgs, globals: &Globals) -> Result<()> {
    let config = globals.config()?;
    let catalog = config.catalog().context("Failed to load image catalog")?;
    let pipeline = ValidationPipeline::new(catalog);

    let roots = if args.paths.is_empty() {
        config.template_dirs.clone()
    } else {
        args.paths.clone()
    };
    let files = collect_files(&roots)?;
    info!("Validating {} template file(s)", files.len());

    if files.is_empty() {
        println!("⚠️  No template files found");
        return Ok(());
    }

    let mut failed = 0;
    for path in &files {
        let report = match validate_file(&pipeline, path) {
            Ok(report) => report,
            Err(e) => {
                failed += 1;
                println!("❌ {}", path.display());
                println!("   - {:#}", e);
                continue;
            }
        };

        let passed = report.valid && !(args.strict && !report.warnings.is_empty());
        if passed {
            if !globals.quiet {
                println!("✅ {} ({})", path.display(), report.template);
            }
        } else {
            failed += 1;
            println!("❌ {} ({})", path.display(), report.template);
            for error in &report.errors {
                println!("   - {}: {}", error.field, error.message);
            }
        }
        if !globals.quiet {
            for warning in &report.warnings {
                println!("   ⚠️  {}: {}", warning.field, warning.message);
            }
        }
    }

    println!();
    if failed > 0 {
        anyhow::bail!("validation failed for {} template file(s)", failed);
    }
    println!("✅ All {} template file(s) are valid", files.len());
    Ok(())
}

/// Expand directories into their template files; files are kept as given.
fn collect_files(roots: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for root in roots {
        if root.is_dir() {
            files.extend(TemplateLoader::template_files(root)?);
        } else if root.is_file() {
            if !is_template_file(root) {
                debug!("Validating {:?} despite its extension", root);
            }
            files.push(root.clone());
        } else if !root.exists() {
            debug!("Skipping missing path {:?}", root);
        }
    }
    Ok(files)
}

/// Every validator runs; only unreadable or malformed YAML is an error.
fn validate_file(pipeline: &ValidationPipeline, path: &Path) -> Result<ValidationReport> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let mut template: Template = serde_yaml::from_str(&content)
        .with_context(|| format!("Invalid template YAML in {}", path.display()))?;
    apply_defaults(&mut template);
    Ok(pipeline.validate_all(&template))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn globals(dir: &Path) -> Globals {
        Globals {
            quiet: true,
            templates_dir: vec![dir.to_path_buf()],
            config: None,
        }
    }

    #[tokio::test]
    async fn test_validate_directory_passes() {
        let temp = tempdir().unwrap();
        fs::write(
            temp.path().join("ok.yml"),
            "name: Ok\ndescription: fine\nbase: ubuntu-22.04\npackage_manager: apt\n",
        )
        .unwrap();

        let args = ValidateArgs {
            paths: vec![],
            strict: false,
        };
        execute(args, &globals(temp.path())).await.unwrap();
    }

    #[tokio::test]
    async fn test_validate_reports_failures() {
        let temp = tempdir().unwrap();
        let broken = temp.path().join("broken.yml");
        fs::write(&broken, "name: Broken\nbase: plan9\n").unwrap();

        let args = ValidateArgs {
            paths: vec![broken],
            strict: false,
        };
        let err = execute(args, &globals(temp.path())).await.unwrap_err();
        assert!(err.to_string().contains("validation failed for 1"));
    }

    #[test]
    fn test_validate_file_collects_errors() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("t.yaml");
        fs::write(&path, "name: T\nbase: ubuntu-22.04\npackage_manager: pacman\n").unwrap();

        let catalog = std::sync::Arc::new(cws_templates::ImageCatalog::builtin().unwrap());
        let report = validate_file(&ValidationPipeline::new(catalog), &path).unwrap();
        assert!(!report.valid);
        let fields: Vec<&str> = report.errors.iter().map(|e| e.field.as_str()).collect();
        assert!(fields.contains(&"description"));
        assert!(fields.contains(&"package_manager"));
    }

    #[test]
    fn test_collect_files_skips_other_extensions() {
        let temp = tempdir().unwrap();
        fs::write(temp.path().join("a.yml"), "").unwrap();
        fs::write(temp.path().join("notes.txt"), "").unwrap();
        let files = collect_files(&[temp.path().to_path_buf()]).unwrap();
        assert_eq!(files.len(), 1);
    }
}
