use crate::archive::{extract_archive, subject_id};
use crate::config::{ClassifierConfig, EffectiveConfig};
use crate::converter::{delete_dicom_files, VolumeConverter};
use crate::dixon::{sort_series_dir, Channel};
use crate::error::{blocking, FsContext, UnitError, UnitResult};
use crate::organizer::{DestinationLayout, Placement};
use crate::series::{locate_series_dir, series_files};
use crate::workspace::WorkspaceRegistry;
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info};

pub const STATUS_SUCCESS: &str = "Success";
pub const STATUS_FAILED: &str = "Failed";

/// Outcome of one conversion unit, as aggregated by the batch and written to reports.
#[derive(Serialize, Default, Debug, Clone)]
pub struct ProcessResult {
    pub archive: String,
    pub subject_id: String,
    pub status: String,
    pub error_kind: String,
    pub reason: String,
    pub outputs: Vec<PathBuf>,
    pub elapsed_ms: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(skip)]
    pub fatal: bool,
}

impl ProcessResult {
    fn new(archive: &Path) -> Self {
        Self {
            archive: archive
                .file_name()
                .unwrap_or_default()
                .to_string_lossy()
                .into_owned(),
            timestamp: Utc::now(),
            ..Default::default()
        }
    }

    /// A unit that failed before or outside its own processing.
    pub fn failed(archive: &Path, err: UnitError) -> Self {
        let mut res = Self::new(archive);
        res.fail(err);
        res
    }

    fn fail(&mut self, err: UnitError) {
        self.status = STATUS_FAILED.into();
        self.error_kind = err.kind().into();
        self.fatal = err.is_batch_fatal();
        self.reason = err.to_string();
    }

    pub fn is_success(&self) -> bool {
        self.status == STATUS_SUCCESS
    }
}

/// Everything a conversion unit needs; shared by all units of a batch.
pub struct UnitContext {
    pub layout: DestinationLayout,
    pub converter: Arc<dyn VolumeConverter>,
    pub registry: WorkspaceRegistry,
    pub config: Arc<EffectiveConfig>,
    pub dixon: bool,
    /// Set once a batch-fatal failure happened; pending units are not started.
    pub abort: AtomicBool,
}

/// Converts one archive. Never panics on unit failures: they end up in the result.
pub async fn process_archive(ctx: Arc<UnitContext>, archive: PathBuf) -> ProcessResult {
    let start = Instant::now();
    let mut res = ProcessResult::new(&archive);

    if ctx.abort.load(Ordering::SeqCst) {
        res.fail(UnitError::Aborted("batch stopped after a fatal error".into()));
        return res;
    }

    match run_unit(&ctx, &archive, &mut res).await {
        Ok(outputs) => {
            res.status = STATUS_SUCCESS.into();
            res.outputs = outputs;
            info!("{} [{}]: {} volume(s)", res.archive, res.subject_id, res.outputs.len());
        }
        Err(e) => {
            error!("{} [{}]: {}", res.archive, res.subject_id, e);
            if e.is_batch_fatal() {
                ctx.abort.store(true, Ordering::SeqCst);
            }
            res.fail(e);
        }
    }

    res.elapsed_ms = start.elapsed().as_millis() as u64;
    res
}

async fn run_unit(ctx: &UnitContext, archive: &Path, res: &mut ProcessResult) -> UnitResult<Vec<PathBuf>> {
    let id = subject_id(archive)?;
    res.subject_id = id.clone();

    let work = ctx
        .registry
        .create(&ctx.config.work_dir, &format!("dcm2nii_{}_", id))
        .map_err(|e| {
            UnitError::Workspace(format!(
                "cannot create working directory in {}: {}",
                ctx.config.work_dir.display(),
                e
            ))
        })?;

    debug!("{} [{}]: unzipping", res.archive, id);
    let dicom_root = work.path().join("dicom");
    let (src, dst) = (archive.to_path_buf(), dicom_root.clone());
    let extracted = blocking(move || extract_archive(&src, &dst)).await?;
    debug!("{} [{}]: {} file(s) extracted", res.archive, id, extracted);

    let root = dicom_root.clone();
    let series_dir = blocking(move || locate_series_dir(&root)).await?;

    let staging = work.path().join("nifti");
    let volumes = if ctx.dixon {
        debug!("{} [{}]: sorting Dixon contrasts", res.archive, id);
        convert_dixon(ctx, &series_dir, &staging).await?
    } else {
        debug!("{} [{}]: converting", res.archive, id);
        let volume = convert_series(
            ctx.converter.as_ref(),
            &series_dir,
            &staging,
            &ctx.config.filename_pattern,
        )
        .await?;
        vec![(None, volume)]
    };

    debug!("{} [{}]: moving volumes to {}", res.archive, id, ctx.layout.root().display());
    let outputs = place_volumes(&ctx.layout, Some(&id), volumes).await?;

    drop(work);
    Ok(outputs)
}

/// Sorts a composed Dixon series and converts each channel into its own staging directory.
pub async fn sort_and_convert(
    converter: &dyn VolumeConverter,
    classifier: &ClassifierConfig,
    series_dir: &Path,
    staging: &Path,
) -> UnitResult<Vec<(Option<Channel>, PathBuf)>> {
    let (dir, cfg) = (series_dir.to_path_buf(), classifier.clone());
    let sorted = blocking(move || sort_series_dir(&dir, &cfg)).await?;
    debug!("channel sizes: {:?}", sorted.counts);

    let mut volumes = Vec::with_capacity(Channel::ALL.len());
    for (channel, dir) in &sorted.channel_dirs {
        let volume =
            convert_series(converter, dir, &staging.join(channel.label()), channel.label()).await?;
        volumes.push((Some(*channel), volume));
    }
    Ok(volumes)
}

async fn convert_dixon(
    ctx: &UnitContext,
    series_dir: &Path,
    staging: &Path,
) -> UnitResult<Vec<(Option<Channel>, PathBuf)>> {
    sort_and_convert(ctx.converter.as_ref(), &ctx.config.classifier, series_dir, staging).await
}

/// Converts the single series in `dicom_dir`, then deletes its DICOM files.
pub async fn convert_series(
    converter: &dyn VolumeConverter,
    dicom_dir: &Path,
    staging: &Path,
    name: &str,
) -> UnitResult<PathBuf> {
    let dir = dicom_dir.to_path_buf();
    let files = blocking(move || series_files(&dir)).await?;
    if files.is_empty() {
        return Err(UnitError::Series(format!(
            "no DICOM series in {}",
            dicom_dir.display()
        )));
    }

    tokio::fs::create_dir_all(staging)
        .await
        .fs_context("create", staging)?;
    let volume = converter.convert(dicom_dir, staging, name).await?;
    delete_dicom_files(&files).await;
    Ok(volume)
}

/// Places every volume; on the first failure everything placed so far is undone.
pub async fn place_volumes(
    layout: &DestinationLayout,
    subject: Option<&str>,
    volumes: Vec<(Option<Channel>, PathBuf)>,
) -> UnitResult<Vec<PathBuf>> {
    let mut placement = Placement::new(layout);
    for (channel, volume) in volumes {
        if let Err(e) = placement.place(&volume, subject, channel).await {
            placement.rollback().await;
            return Err(e);
        }
    }
    Ok(placement.commit())
}

pub fn write_reports(csv_path: Option<&Path>, json_path: Option<&Path>, results: &[ProcessResult]) -> Result<()> {
    if let Some(path) = csv_path {
        write_csv_report(path, results)?;
    }
    if let Some(path) = json_path {
        write_json_report(path, results)?;
    }
    Ok(())
}

fn write_json_report(path: &Path, results: &[ProcessResult]) -> Result<()> {
    let file = File::create(path)?;
    serde_json::to_writer_pretty(file, results)?;
    Ok(())
}

fn write_csv_report(path: &Path, results: &[ProcessResult]) -> Result<()> {
    let mut wtr = csv::Writer::from_path(path)?;
    wtr.write_record(["Archive", "SubjectId", "Status", "ErrorKind", "Reason", "Outputs", "ElapsedMs", "Timestamp"])?;
    for r in results {
        let outputs = r
            .outputs
            .iter()
            .map(|p| p.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("; ");
        wtr.write_record([
            &r.archive,
            &r.subject_id,
            &r.status,
            &r.error_kind,
            &r.reason,
            &outputs,
            &r.elapsed_ms.to_string(),
            &r.timestamp.to_rfc3339(),
        ])?;
    }
    wtr.flush()?;
    Ok(())
}
