//! seqflow CLI Entry Point
//!
//! Runs a pipeline, or acts as the built-in worker for one sample.
//!
//! # Usage
//!
//! ```bash
//! # Run (or resume) a pipeline
//! seqflow pipeline.yaml
//!
//! # Start over, deleting earlier results without asking
//! seqflow pipeline.yaml --clean --yes
//!
//! # Run every task on this machine
//! seqflow pipeline.yaml --local
//!
//! # Cancel the wait for a cluster batch by creating a file
//! seqflow pipeline.yaml /tmp/seqflow.stop
//!
//! # Built-in worker, started by the engine for command steps
//! seqflow exec --step trim_raw_files -i 0 -n 4 -d results/context.json
//! ```

use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{error, info, warn};

use seqflow::execution::step::{parse_exec_arguments, run_command_worker};
use seqflow::execution::Engine;
use seqflow::workflow::Strategy;
use seqflow::{load_pipeline, APP_NAME, VERSION};

/// Default pipeline file used when none is specified.
const DEFAULT_PIPELINE: &str = "pipeline.yaml";

/// Interval at which the stop flag file is checked.
const STOP_FLAG_INTERVAL: Duration = Duration::from_secs(1);

/// Command-line configuration parsed from arguments.
#[derive(Debug)]
struct Config {
    pipeline_path: String,
    stop_flag_path: Option<String>,
    clean: bool,
    local: bool,
    assume_yes: bool,
    verbose: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pipeline_path: DEFAULT_PIPELINE.to_string(),
            stop_flag_path: None,
            clean: false,
            local: false,
            assume_yes: false,
            verbose: false,
        }
    }
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
    println!("{} v{}", APP_NAME, VERSION);
    println!("Resumable Per-Sample Pipeline Engine");
    println!();
}

/// Prints usage information.
fn print_usage() {
    println!("Usage: seqflow [OPTIONS] <PIPELINE_FILE> [STOP_FLAG_PATH]");
    println!("       seqflow exec --step <FLAG> -i <INDEX> -n <CORES> -d <CONTEXT>");
    println!();
    println!("Arguments:");
    println!("  <PIPELINE_FILE>     Path to pipeline YAML file");
    println!("  [STOP_FLAG_PATH]    Creating this file cancels the run while it waits");
    println!();
    println!("Options:");
    println!("  --clean             Ignore and delete results of earlier runs");
    println!("  --local             Run tasks on this machine instead of the cluster");
    println!("  --yes, -y           Do not ask before deleting earlier results");
    println!("  --verbose           Enable debug logging");
    println!("  --help              Show this help message");
    println!("  --version           Show version information");
    println!();
    println!("Examples:");
    println!("  seqflow pipeline.yaml");
    println!("  seqflow pipeline.yaml --clean --yes");
    println!("  seqflow pipeline.yaml --local /tmp/seqflow.stop");
}

/// Parses command-line arguments into a Config struct.
fn parse_arguments(args: &[String]) -> Result<Config, String> {
    let mut config = Config::default();
    let mut positional_index = 0;

    for arg in args.iter().skip(1) {
        match arg.as_str() {
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("{} {}", APP_NAME, VERSION);
                std::process::exit(0);
            }
            "--clean" => config.clean = true,
            "--local" => config.local = true,
            "--yes" | "-y" => config.assume_yes = true,
            "--verbose" | "-v" => config.verbose = true,
            arg if arg.starts_with('-') => {
                return Err(format!("Unknown option: {}", arg));
            }
            _ => {
                match positional_index {
                    0 => config.pipeline_path = arg.clone(),
                    1 => config.stop_flag_path = Some(arg.clone()),
                    _ => return Err(format!("Unexpected argument: {}", arg)),
                }
                positional_index += 1;
            }
        }
    }

    Ok(config)
}

/// Sets `cancel` once `path` exists.
fn watch_stop_flag(path: PathBuf, cancel: Arc<AtomicBool>) {
    thread::spawn(move || loop {
        if path.exists() {
            warn!("Stop flag {} found, cancelling", path.display());
            cancel.store(true, Ordering::Relaxed);
            return;
        }
        thread::sleep(STOP_FLAG_INTERVAL);
    });
}

/// Runs the built-in worker for one sample.
fn run_worker(args: &[String]) -> Result<(), Box<dyn std::error::Error>> {
    setup_logging(false);
    let (flag, worker) = parse_exec_arguments(args)?;
    run_command_worker(&flag, &worker)?;
    Ok(())
}

/// Main application entry point.
fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();

    if args.get(1).map(String::as_str) == Some("exec") {
        return run_worker(&args[2..]);
    }

    // Parse arguments
    let config = parse_arguments(&args).map_err(|e| {
        eprintln!("Error: {}", e);
        eprintln!();
        print_usage();
        e
    })?;

    setup_logging(config.verbose);
    print_banner();

    info!("Loading pipeline: {}", config.pipeline_path);
    let mut pipeline = load_pipeline(&config.pipeline_path).map_err(|e| {
        error!("Failed to load pipeline: {}", e);
        format!(
            "Could not load pipeline from '{}': {}",
            config.pipeline_path, e
        )
    })?;

    if config.clean {
        pipeline.clean_run = true;
    }
    if config.local {
        pipeline.strategy = Strategy::Local;
    }

    info!(
        "Pipeline loaded: {} steps, working directory {}",
        pipeline.steps.len(),
        pipeline.working_dir.display()
    );
    if pipeline.clean_run {
        info!("Mode: CLEAN RUN (earlier results are ignored)");
    }

    let mut engine = Engine::new(pipeline);
    engine.set_assume_yes(config.assume_yes);

    if let Some(path) = config.stop_flag_path {
        info!("Stop flag: {}", path);
        watch_stop_flag(PathBuf::from(&path), engine.cancel_handle());
    }

    let summary = engine.run()?;
    info!(
        "{} of {} samples passed every step ({:.2?})",
        summary.context.run_log().last().success_count(),
        summary.context.sample_count(),
        summary.elapsed
    );

    Ok(())
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!();
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_arguments() {
        let config = parse_arguments(&args(&["seqflow", "--clean", "-y", "run.yaml", "/tmp/stop"])).unwrap();
        assert_eq!(config.pipeline_path, "run.yaml");
        assert_eq!(config.stop_flag_path.as_deref(), Some("/tmp/stop"));
        assert!(config.clean);
        assert!(config.assume_yes);
        assert!(!config.local);
    }

    #[test]
    fn test_parse_arguments_rejects_unknown_option() {
        assert!(parse_arguments(&args(&["seqflow", "--parallel"])).is_err());
        assert!(parse_arguments(&args(&["seqflow", "a.yaml", "b", "c"])).is_err());
    }
}
