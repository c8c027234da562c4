//! CloudWorkstation template CLI - Main entry point.
//!
//! Exit codes:
//! - 0: Success
//! - 1: General error
//! - 2: Invalid arguments
//! - 3: Validation failure
//! - 4: Template error

use std::process::ExitCode;

use clap::Parser;
use cws_templates::TemplateError;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod commands;

use commands::{Cli, Commands};

/// CI-friendly exit codes
pub struct ExitCodes;

impl ExitCodes {
    pub const SUCCESS: u8 = 0;
    pub const GENERAL_ERROR: u8 = 1;
    pub const INVALID_ARGS: u8 = 2;
    pub const VALIDATION_FAILURE: u8 = 3;
    pub const TEMPLATE_ERROR: u8 = 4;
}

fn default_directives(verbose: bool, quiet: bool) -> &'static str {
    if verbose {
        "cws=debug,cws_templates=debug,warn"
    } else if quiet {
        "warn"
    } else {
        "cws=info,cws_templates=info,warn"
    }
}

fn init_logging(cli: &Cli) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(cli.verbose, cli.quiet)));

    let log_result = if cli.log_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .with(filter)
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .with(filter)
            .try_init()
    };

    if log_result.is_err() {
        // Logging already initialized, continue
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(&cli);

    let globals = cli.globals();
    let result = match cli.command {
        Commands::List(args) => commands::list::execute(args, &globals).await,
        Commands::Info(args) => commands::info::execute(args, &globals).await,
        Commands::Validate(args) => commands::validate::execute(args, &globals).await,
        Commands::Resolve(args) => commands::resolve::execute(args, &globals).await,
        Commands::Script(args) => commands::script::execute(args, &globals).await,
        Commands::Image(args) => commands::image::execute(args, &globals).await,
    };

    match result {
        Ok(()) => ExitCode::from(ExitCodes::SUCCESS),
        Err(e) => {
            let exit_code = categorize_error(&e);
            eprintln!("❌ Error: {:#}", e);
            ExitCode::from(exit_code)
        }
    }
}

/// Categorize error to determine exit code
fn categorize_error(e: &anyhow::Error) -> u8 {
    let template_error = e
        .chain()
        .find_map(|cause| cause.downcast_ref::<TemplateError>());

    if let Some(err) = template_error {
        if err.validation().is_some() {
            return ExitCodes::VALIDATION_FAILURE;
        }
        return match err {
            TemplateError::InvalidSize(_)
            | TemplateError::InvalidArchitecture(_)
            | TemplateError::UnsupportedPackageManager(_)
            | TemplateError::InvalidParameter { .. }
            | TemplateError::MissingParameter(_) => ExitCodes::INVALID_ARGS,
            _ => ExitCodes::TEMPLATE_ERROR,
        };
    }

    let msg = e.to_string().to_lowercase();
    if msg.contains("validation") {
        ExitCodes::VALIDATION_FAILURE
    } else if msg.contains("template") {
        ExitCodes::TEMPLATE_ERROR
    } else if msg.contains("argument") || msg.contains("option") {
        ExitCodes::INVALID_ARGS
    } else {
        ExitCodes::GENERAL_ERROR
    }
}
