//! Batch orchestration over a directory of archives.

use crate::archive::discover_archives;
use crate::config::{ClassifierConfig, EffectiveConfig};
use crate::converter::VolumeConverter;
use crate::error::{blocking, FsContext, UnitError};
use crate::organizer::{DestinationLayout, LayoutOptions};
use crate::processor::{place_volumes, process_archive, sort_and_convert, ProcessResult, UnitContext};
use crate::series::series_files;
use crate::workspace::WorkspaceRegistry;
use anyhow::{bail, Context, Result};
use futures::stream::{self, StreamExt};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info};

/// Batch-wide switches. The conversion mode applies to every archive alike.
#[derive(Debug, Clone, Copy, Default)]
pub struct BatchOptions {
    pub dixon: bool,
    pub layout: LayoutOptions,
    pub verbose: bool,
}

pub struct BatchSummary {
    pub results: Vec<ProcessResult>,
    pub elapsed: Duration,
}

impl BatchSummary {
    pub fn succeeded(&self) -> usize {
        self.results.iter().filter(|r| r.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.results.len() - self.succeeded()
    }

    /// Elapsed wall time as `HH:MM:SS`.
    pub fn elapsed_hms(&self) -> String {
        let secs = self.elapsed.as_secs();
        format!("{:02}:{:02}:{:02}", secs / 3600, (secs / 60) % 60, secs % 60)
    }
}

fn progress_bar(len: usize, verbose: bool) -> ProgressBar {
    if verbose {
        // log lines take over in verbose mode
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(len as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .unwrap()
            .progress_chars("#>-"),
    );
    pb
}

/// Converts every archive in `zip_dir` into the layout rooted at `out_dir`.
///
/// With one core the archives are processed in file name order; otherwise up to
/// `config.cores` units run at once, in no particular order. A failing archive
/// never stops the others. Only a batch-fatal failure (no working directory can
/// be created) stops dispatching and is returned as an error.
pub async fn run_batch(
    zip_dir: &Path,
    out_dir: &Path,
    config: Arc<EffectiveConfig>,
    options: BatchOptions,
    converter: Arc<dyn VolumeConverter>,
    registry: WorkspaceRegistry,
) -> Result<BatchSummary> {
    let start = Instant::now();
    let archives = discover_archives(zip_dir)?;
    tokio::fs::create_dir_all(out_dir)
        .await
        .with_context(|| format!("Failed to create output directory {}", out_dir.display()))?;

    info!(
        "{} archive(s) in {}, {} worker(s), mode: {}",
        archives.len(),
        zip_dir.display(),
        config.cores,
        if options.dixon { "dixon" } else { "single series" }
    );

    let cores = config.cores.max(1);
    let ctx = Arc::new(UnitContext {
        layout: DestinationLayout::new(out_dir, options.layout),
        converter,
        registry,
        config,
        dixon: options.dixon,
        abort: AtomicBool::new(false),
    });
    let pb = progress_bar(archives.len(), options.verbose);

    let results: Vec<ProcessResult> = if cores == 1 {
        let mut results = Vec::with_capacity(archives.len());
        for archive in archives {
            pb.set_message(archive.file_name().unwrap_or_default().to_string_lossy().into_owned());
            results.push(spawn_unit(ctx.clone(), archive).await);
            pb.inc(1);
        }
        results
    } else {
        stream::iter(archives)
            .map(|archive| {
                let ctx = ctx.clone();
                let pb = pb.clone();
                async move {
                    let res = spawn_unit(ctx, archive).await;
                    pb.inc(1);
                    res
                }
            })
            .buffer_unordered(cores)
            .collect()
            .await
    };
    pb.finish_and_clear();

    if let Some(fatal) = results.iter().find(|r| r.fatal) {
        bail!("batch stopped: {}", fatal.reason);
    }

    Ok(BatchSummary {
        results,
        elapsed: start.elapsed(),
    })
}

/// Runs one unit on its own task so that a panic fails only that archive.
async fn spawn_unit(ctx: Arc<UnitContext>, archive: PathBuf) -> ProcessResult {
    match tokio::spawn(process_archive(ctx, archive.clone())).await {
        Ok(res) => res,
        Err(e) => {
            error!("{}: worker failed: {}", archive.display(), e);
            ProcessResult::failed(&archive, UnitError::Aborted(format!("worker failed: {}", e)))
        }
    }
}

/// Sorts and converts one unzipped Dixon series directory into `out_dir`.
///
/// The source directory is copied into a working directory first and left untouched.
/// Volumes are named `<channel>.nii.gz`, prefixed with `<id>_` when a subject is given.
pub async fn run_sort(
    dicom_dir: &Path,
    out_dir: &Path,
    subject: Option<&str>,
    config: &EffectiveConfig,
    converter: &dyn VolumeConverter,
    registry: &WorkspaceRegistry,
) -> Result<Vec<PathBuf>> {
    let work = registry
        .create(&config.work_dir, "dcm2nii_sort_")
        .with_context(|| format!("Failed to create working directory in {}", config.work_dir.display()))?;

    let copy_dir = work.path().join("dicom").join("series");
    let (src, dst) = (dicom_dir.to_path_buf(), copy_dir.clone());
    blocking(move || copy_series(&src, &dst)).await?;

    let classifier: &ClassifierConfig = &config.classifier;
    let volumes =
        sort_and_convert(converter, classifier, &copy_dir, &work.path().join("nifti")).await?;

    tokio::fs::create_dir_all(out_dir)
        .await
        .with_context(|| format!("Failed to create output directory {}", out_dir.display()))?;
    let layout = DestinationLayout::new(
        out_dir,
        LayoutOptions {
            add_id: true,
            single_dir: true,
        },
    );
    let outputs = place_volumes(&layout, subject, volumes).await?;

    drop(work);
    Ok(outputs)
}

fn copy_series(src: &Path, dst: &Path) -> Result<usize, UnitError> {
    let files = series_files(src)?;
    if files.is_empty() {
        return Err(UnitError::Series(format!("no DICOM series in {}", src.display())));
    }
    std::fs::create_dir_all(dst).fs_context("create", dst)?;
    for file in &files {
        if let Some(name) = file.file_name() {
            let target = dst.join(name);
            std::fs::copy(file, &target).fs_context("copy", &target)?;
        }
    }
    Ok(files.len())
}
