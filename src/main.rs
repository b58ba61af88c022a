//! # Main — CLI Entry Point
//!
//! Parses the command line, sets up logging and hands off to `cli`.
//!
//! ## Subcommands
//!
//! - `run`: curves on every number read from `--input` or stdin. Engine
//!   options and the trailing `B1 [B2]` follow the ecmpool options verbatim,
//!   e.g. `ecmpool --threads 8 run -c 400 -maxmem 8000 11e6 < numbers.txt`.
//!   `--job jobNNNN.txt` continues one existing job record instead.
//! - `resume`: stage 2 on every line of a GMP-ECM or Prime95 resume file.
//! - `inspect`: list job records in the work directory.
//!
//! ## Global Options
//!
//! - `--engine` / `ECMPOOL_ENGINE`: GMP-ECM binary (default `./ecm`).
//! - `--threads`: worker processes (default: all logical cores).
//! - `--poll-secs`: seconds between output polls (default 15).
//! - `--config`: TOML settings file; flags override it.
//! - `--work-dir`: where job records and worker files live.
//! - `--out`: merge file collecting reports and worker output.
//!
//! ## Exit Codes
//!
//! 0 job(s) finished (with or without a factor), 2 configuration or parse
//! error, 3 engine launch failure, 4 worker failure, 5 I/O failure,
//! 130 interrupted.

mod cli;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::error;
use tracing_subscriber::EnvFilter;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(
    name = "ecmpool",
    version,
    about = "Run GMP-ECM on many worker processes with crash-safe, resumable progress"
)]
struct Cli {
    /// Path to the GMP-ECM binary
    #[arg(long, env = "ECMPOOL_ENGINE", global = true)]
    engine: Option<PathBuf>,

    /// Number of engine processes to run in parallel
    #[arg(long, global = true)]
    threads: Option<usize>,

    /// Seconds between polls of the worker output files
    #[arg(long, global = true, value_parser = clap::value_parser!(u64).range(1..))]
    poll_secs: Option<u64>,

    /// Durable job log (default: ecmpool.log)
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    /// Do not write the durable job log
    #[arg(long, global = true, conflicts_with = "log_file")]
    no_log: bool,

    /// TOML settings file
    #[arg(long, env = "ECMPOOL_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Directory for job records and worker files
    #[arg(long, global = true)]
    work_dir: Option<PathBuf>,

    /// Append reports and worker output to this file
    #[arg(long, global = true)]
    out: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run curves on each input number (engine options, then B1 [B2])
    Run {
        /// File with one number per line (default: stdin)
        #[arg(long)]
        input: Option<PathBuf>,

        /// Continue this job record with the request stored in it
        #[arg(long, conflicts_with = "input")]
        job: Option<PathBuf>,

        /// Start new job records even when a compatible one exists
        #[arg(long)]
        fresh: bool,

        /// GMP-ECM options followed by B1 [B2]
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        engine_args: Vec<String>,
    },
    /// Run stage 2 on every line of a resume file
    Resume {
        /// GMP-ECM or Prime95 resume file
        #[arg(long)]
        file: PathBuf,

        /// Extra GMP-ECM options (-k, -maxmem) and a default B1
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        engine_args: Vec<String>,
    },
    /// List job records in the work directory
    Inspect {
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },
}

fn main() -> ExitCode {
    let _ = dotenvy::dotenv();

    // LOG_FORMAT=json for log shippers, human-readable otherwise
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();
    if log_format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(false)
            .init();
    }

    let cli = Cli::parse();
    let overrides = ecmpool::config::Overrides {
        engine: cli.engine.clone(),
        threads: cli.threads,
        poll_secs: cli.poll_secs,
        log_file: cli.log_file.clone(),
        no_log: cli.no_log,
        work_dir: cli.work_dir.clone(),
        out: cli.out.clone(),
    };

    let result = match &cli.command {
        Commands::Run {
            input,
            job,
            fresh,
            engine_args,
        } => cli::run_curves(
            cli.config.as_deref(),
            overrides,
            input.as_deref(),
            job.as_deref(),
            *fresh,
            engine_args,
        ),
        Commands::Resume { file, engine_args } => {
            cli::run_resume(cli.config.as_deref(), overrides, file, engine_args)
        }
        Commands::Inspect { json } => cli::run_inspect(cli.config.as_deref(), overrides, *json),
    };

    match result {
        Ok(status) => ExitCode::from(status.code()),
        Err(e) => {
            error!("{:#}", e);
            eprintln!("ecmpool: {:#}", e);
            ExitCode::from(cli::error_code(&e))
        }
    }
}
