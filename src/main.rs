//! CLI that converts zipped DICOM sequences into NIfTI volumes.
//!
//! Each archive in the input directory holds one sequence of one subject. Archives
//! are unzipped into private working directories, optionally split into the four
//! Dixon contrasts, converted with dcm2niix and moved into a per-subject layout.
mod archive;
mod batch;
mod config;
mod converter;
mod dixon;
mod error;
mod organizer;
mod processor;
mod series;
#[cfg(test)]
mod testing;
mod workspace;

use anyhow::{bail, Result};
use clap::{Args, Parser, Subcommand};
use colored::*;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use crate::batch::{run_batch, run_sort, BatchOptions};
use crate::config::{
    load_runtime_config, validate_cores, EffectiveConfig, DEFAULT_CONFIG_PATH,
};
use crate::converter::{check_dcm2niix_available, Dcm2niixConverter};
use crate::organizer::LayoutOptions;
use crate::processor::write_reports;
use crate::workspace::{install_signal_cleanup, WorkspaceRegistry};

#[derive(Parser)]
#[command(name = "dcm2nii_cli")]
#[command(about = "Zipped DICOM to NIfTI batch converter")]
#[command(long_about = "Zipped DICOM to NIfTI batch converter.\n\n\
Conversions run through subcommands: `dcm2nii_cli batch <ZIP_DIR> <OUT_DIR> [--dixon] [--id] \
[--singledir] [--cores N]` converts every archive of a directory, `dcm2nii_cli sort <DICOM_DIR> \
<OUT_DIR> [--id ID]` splits one unzipped Dixon series.")]
/// Entry CLI that dispatches to subcommands.
struct Cli {
    /// Optional runtime config in TOML that supplies defaults for the CLI.
    #[arg(short, long, global = true, help = "TOML config file")]
    config: Option<PathBuf>,

    /// Log every stage of every archive.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Convert every zip archive of a directory
    Batch(BatchArgs),
    /// Split one unzipped Dixon series directory into its four contrasts and convert them
    Sort(SortArgs),
}

#[derive(Args, Clone)]
struct SharedArgs {
    /// dcm2niix executable (defaults to the configured value).
    #[arg(long)]
    dcm2niix: Option<String>,

    /// Directory in which working directories are created.
    #[arg(long, value_name = "DIR")]
    work_dir: Option<PathBuf>,
}

#[derive(Args, Clone)]
struct BatchArgs {
    /// Directory with one zip archive per subject and sequence.
    zip_dir: PathBuf,

    /// Output root for the converted volumes.
    out_dir: PathBuf,

    /// Archives hold composed Dixon series; split them into fat/water/in/opp.
    #[arg(long)]
    dixon: bool,

    /// Prefix output file names with the subject id.
    #[arg(long)]
    id: bool,

    /// Store all volumes in one directory (no per-subject sub-directories).
    #[arg(short, long)]
    singledir: bool,

    /// Number of archives converted in parallel (1 to the number of CPUs).
    #[arg(long)]
    cores: Option<usize>,

    /// Optional destination for the CSV report.
    #[arg(long)]
    report_csv: Option<PathBuf>,

    /// Optional destination for the JSON report.
    #[arg(long)]
    report_json: Option<PathBuf>,

    #[command(flatten)]
    shared: SharedArgs,
}

#[derive(Args, Clone)]
struct SortArgs {
    /// Directory holding one composed Dixon series.
    dicom_dir: PathBuf,

    /// Output directory for the four volumes.
    out_dir: PathBuf,

    /// Subject id used as file name prefix.
    #[arg(long)]
    id: Option<String>,

    #[command(flatten)]
    shared: SharedArgs,
}

/// Entrypoint that wires CLI args, runtime config, logging and the signal handler.
#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Cli::parse();
    init_logging(args.verbose);

    let cfg_path = args
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    let mut effective = EffectiveConfig::defaults();
    if let Some(file) = load_runtime_config(Some(&cfg_path))? {
        effective.apply_file(file)?;
    }

    let registry = WorkspaceRegistry::new();
    install_signal_cleanup(registry.clone());

    match args.command {
        Commands::Batch(cmd) => run_batch_command(cmd, effective, registry, args.verbose).await,
        Commands::Sort(cmd) => run_sort_command(cmd, effective, registry).await,
    }
}

/// `RUST_LOG` wins; otherwise debug output with `--verbose` and warnings only without.
fn init_logging(verbose: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("warn")
        }
    });

    let _ = tracing::subscriber::set_global_default(
        tracing_subscriber::FmtSubscriber::builder()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .finish(),
    );
}

/// Merge CLI overrides on top of the runtime-file/default settings.
fn merge_shared(cli: &SharedArgs, cfg: &mut EffectiveConfig) {
    if let Some(exe) = config::sanitize_optional_string(cli.dcm2niix.clone()) {
        cfg.dcm2niix = exe;
    }
    if let Some(dir) = cli.work_dir.clone() {
        cfg.work_dir = dir;
    }
}

fn ensure_converter(cfg: &EffectiveConfig) -> Result<Dcm2niixConverter> {
    if !check_dcm2niix_available(&cfg.dcm2niix) {
        bail!(
            "dcm2niix not found at '{}' (set --dcm2niix or `dcm2niix` in the config file)",
            cfg.dcm2niix
        );
    }
    Ok(Dcm2niixConverter::new(&cfg.dcm2niix, &cfg.dcm2niix_args))
}

async fn run_batch_command(
    args: BatchArgs,
    mut effective: EffectiveConfig,
    registry: WorkspaceRegistry,
    verbose: bool,
) -> Result<ExitCode> {
    merge_shared(&args.shared, &mut effective);
    effective.cores = validate_cores(args.cores.unwrap_or(effective.cores))?;
    effective.report_csv = args.report_csv.clone().or(effective.report_csv);
    effective.report_json = args.report_json.clone().or(effective.report_json);

    let converter = Arc::new(ensure_converter(&effective)?);
    let options = BatchOptions {
        dixon: args.dixon,
        layout: LayoutOptions {
            add_id: args.id,
            single_dir: args.singledir,
        },
        verbose,
    };

    println!("using {} CPU cores", effective.cores);
    let effective = Arc::new(effective);
    let summary = run_batch(
        &args.zip_dir,
        &args.out_dir,
        effective.clone(),
        options,
        converter,
        registry,
    )
    .await?;

    write_reports(
        effective.report_csv.as_deref(),
        effective.report_json.as_deref(),
        &summary.results,
    )?;

    for r in summary.results.iter().filter(|r| !r.is_success()) {
        eprintln!("{} {}: {}", "✗".red(), r.archive, r.reason);
    }

    let failed = summary.failed();
    let line = format!(
        "Summary: {} Success, {} Failed. elapsed time: {}",
        summary.succeeded(),
        failed,
        summary.elapsed_hms()
    );
    if failed == 0 {
        println!("{} {}", "✓".green(), line);
        Ok(ExitCode::SUCCESS)
    } else {
        println!("{} {}", "✗".red(), line.yellow());
        Ok(ExitCode::from(1))
    }
}

async fn run_sort_command(
    args: SortArgs,
    mut effective: EffectiveConfig,
    registry: WorkspaceRegistry,
) -> Result<ExitCode> {
    merge_shared(&args.shared, &mut effective);
    let converter = ensure_converter(&effective)?;

    let subject = config::sanitize_optional_string(args.id.clone());
    let outputs = run_sort(
        &args.dicom_dir,
        &args.out_dir,
        subject.as_deref(),
        &effective,
        &converter,
        &registry,
    )
    .await?;

    for path in &outputs {
        println!("{} {}", "✓".green(), path.display());
    }
    Ok(ExitCode::SUCCESS)
}
