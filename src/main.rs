//! Pipewright CLI Entry Point
//!
//! Provides the command-line interface for pipeline execution.
//!
//! # Usage
//!
//! ```bash
//! # Execute a pipeline
//! pipewright pipeline.yaml
//!
//! # Dry run mode (touch outputs, skip the real commands)
//! pipewright pipeline.yaml --dry-run
//!
//! # Resume from given processes (ancestors are skipped)
//! pipewright pipeline.yaml --resume merge
//!
//! # Set start processes explicitly
//! pipewright pipeline.yaml --start sort
//! ```

use std::env;
use std::process::ExitCode;

use chrono::Local;
use colored::Colorize;
use log::{error, info};

use pipewright::{load_pipeline, APP_NAME, VERSION};

/// Command-line configuration parsed from arguments.
#[derive(Debug, Default)]
struct Config {
    pipeline_path: Option<String>,
    dry_run: bool,
    verbose: bool,
    starts: Vec<String>,
    resumes: Vec<String>,
    resume_plus: bool,
}

/// Configures the logging system with appropriate formatting.
fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| {
            use std::io::Write;

            match record.level() {
                log::Level::Warn | log::Level::Error => {
                    writeln!(buf, "[{}] {}", record.level(), record.args())
                }
                _ => writeln!(buf, "{}", record.args()),
            }
        })
        .init();
}

/// Prints the application banner with version information.
fn print_banner() {
    println!();
    println!("{} v{}", APP_NAME.bold(), VERSION);
    println!("Pipeline Execution Engine");
    println!();
}

/// Prints usage information.
fn print_usage() {
    println!("Usage: pipewright [OPTIONS] <PIPELINE_FILE>");
    println!();
    println!("Arguments:");
    println!("  <PIPELINE_FILE>     Path to pipeline YAML file");
    println!();
    println!("Options:");
    println!("  --dry-run           Touch outputs without running commands");
    println!("  --start ID          Start process (repeatable)");
    println!("  --resume ID         Resume from process, skipping ancestors (repeatable)");
    println!("  --resume-plus       Resume variant propagating through exported artifacts");
    println!("  --verbose           Enable debug logging");
    println!("  --help              Show this help message");
    println!("  --version           Show version information");
    println!();
    println!("Examples:");
    println!("  pipewright pipeline.yaml");
    println!("  pipewright pipeline.yaml --dry-run");
    println!("  pipewright pipeline.yaml --resume merge");
}

/// Parses command-line arguments into a Config struct.
fn parse_arguments(args: &[String]) -> Result<Config, String> {
    let mut config = Config::default();
    let mut i = 1; // Skip program name

    while i < args.len() {
        let arg = &args[i];

        match arg.as_str() {
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("{} {}", APP_NAME, VERSION);
                std::process::exit(0);
            }
            "--dry-run" => {
                config.dry_run = true;
            }
            "--verbose" | "-v" => {
                config.verbose = true;
            }
            "--resume-plus" => {
                config.resume_plus = true;
            }
            "--start" => {
                i += 1;
                if i >= args.len() {
                    return Err("--start requires a process id".to_string());
                }
                config.starts.push(args[i].clone());
            }
            "--resume" => {
                i += 1;
                if i >= args.len() {
                    return Err("--resume requires a process id".to_string());
                }
                config.resumes.push(args[i].clone());
            }
            arg if arg.starts_with('-') => {
                return Err(format!("Unknown option: {}", arg));
            }
            _ => {
                if config.pipeline_path.is_some() {
                    return Err(format!("Unexpected argument: {}", arg));
                }
                config.pipeline_path = Some(arg.clone());
            }
        }
        i += 1;
    }

    Ok(config)
}

/// Main application entry point.
fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();

    let config = parse_arguments(&args).map_err(|e| {
        eprintln!("Error: {}", e);
        eprintln!();
        print_usage();
        e
    })?;

    setup_logging(config.verbose);
    print_banner();

    let Some(path) = config.pipeline_path else {
        print_usage();
        return Err("No pipeline file given".into());
    };

    if config.dry_run {
        info!("Mode: DRY RUN (commands will not execute)");
    }
    info!("Started at {}", Local::now().format("%Y-%m-%d %H:%M:%S"));

    let mut pipeline = load_pipeline(&path).map_err(|e| {
        error!("Failed to load pipeline: {}", e);
        format!("Could not load pipeline from '{}': {}", path, e)
    })?;

    if !config.starts.is_empty() {
        let names: Vec<&str> = config.starts.iter().map(String::as_str).collect();
        pipeline.start(&names)?;
    }
    if !config.resumes.is_empty() {
        let names: Vec<&str> = config.resumes.iter().map(String::as_str).collect();
        pipeline.resume(&names, config.resume_plus)?;
    }

    pipeline.run(config.dry_run)?;
    Ok(())
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!();
            eprintln!("{} {}", "Error:".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}
