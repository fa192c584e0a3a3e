//! Series to volume conversion through dcm2niix.
//!
//! The conversion itself is delegated to the external dcm2niix tool behind the
//! [`VolumeConverter`] trait, so the rest of the pipeline only relies on its
//! contract: one series directory in, exactly one volume file out, nothing left
//! behind on failure.

use crate::error::{UnitError, UnitResult};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, warn};

/// Turns a directory holding one DICOM series into one volumetric file.
#[async_trait]
pub trait VolumeConverter: Send + Sync {
    /// Converts the series in `dicom_dir` into `output_dir`, naming the result after
    /// `name` (a literal name or a converter-specific pattern).
    async fn convert(&self, dicom_dir: &Path, output_dir: &Path, name: &str) -> UnitResult<PathBuf>;
}

/// Result of a dcm2niix invocation.
#[derive(Debug, Clone)]
pub struct ConversionResult {
    /// Exit status of the process was zero.
    pub success: bool,
    /// Volumes found in the output directory afterwards.
    pub nifti_files: Vec<PathBuf>,
    /// Captured stderr (or stdout) of a failed run.
    pub error: Option<String>,
    pub elapsed_ms: u64,
}

/// [`VolumeConverter`] backed by the dcm2niix executable.
pub struct Dcm2niixConverter {
    executable: String,
    extra_args: Vec<String>,
}

impl Dcm2niixConverter {
    pub fn new(executable: &str, extra_args: &[String]) -> Self {
        Self {
            executable: executable.to_string(),
            extra_args: extra_args.to_vec(),
        }
    }

    /// Runs `dcm2niix [extra_args] -f <name> -o <output_dir> <dicom_dir>`.
    pub async fn run(&self, dicom_dir: &Path, output_dir: &Path, name: &str) -> UnitResult<ConversionResult> {
        let start = std::time::Instant::now();

        tokio::fs::create_dir_all(output_dir)
            .await
            .map_err(|e| UnitError::fs("create", output_dir, e))?;

        let output = Command::new(&self.executable)
            .args(&self.extra_args)
            .arg("-f")
            .arg(name)
            .arg("-o")
            .arg(output_dir)
            .arg(dicom_dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| UnitError::Conversion(format!("cannot run {}: {}", self.executable, e)))?;

        let elapsed_ms = start.elapsed().as_millis() as u64;

        // dcm2niix exits with 0 even when nothing was converted, so look at the files
        let nifti_files = find_nifti_files(output_dir).await?;

        if output.status.success() {
            Ok(ConversionResult {
                success: !nifti_files.is_empty(),
                nifti_files,
                error: None,
                elapsed_ms,
            })
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stdout = String::from_utf8_lossy(&output.stdout);
            let error_msg = if stderr.trim().is_empty() {
                stdout.trim().to_string()
            } else {
                stderr.trim().to_string()
            };
            Ok(ConversionResult {
                success: false,
                nifti_files,
                error: Some(error_msg),
                elapsed_ms,
            })
        }
    }
}

#[async_trait]
impl VolumeConverter for Dcm2niixConverter {
    async fn convert(&self, dicom_dir: &Path, output_dir: &Path, name: &str) -> UnitResult<PathBuf> {
        let result = self.run(dicom_dir, output_dir, name).await?;
        debug!(
            "dcm2niix {} -> {} file(s) in {} ms",
            dicom_dir.display(),
            result.nifti_files.len(),
            result.elapsed_ms
        );

        if result.success && result.nifti_files.len() == 1 {
            return Ok(result.nifti_files[0].clone());
        }

        // never leave partial output behind
        for file in &result.nifti_files {
            if let Err(e) = tokio::fs::remove_file(file).await {
                warn!("Failed to delete {}: {}", file.display(), e);
            }
        }

        let reason = match (result.error, result.nifti_files.len()) {
            (Some(err), _) => err,
            (None, 0) => "no volume produced".to_string(),
            (None, n) => format!("{} volumes produced, expected one", n),
        };
        Err(UnitError::Conversion(format!("{}: {}", dicom_dir.display(), reason)))
    }
}

/// Probes `path -h`; false when the executable cannot be started or fails.
pub fn check_dcm2niix_available(path: &str) -> bool {
    std::process::Command::new(path)
        .arg("-h")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Whether a file name carries a NIfTI extension.
pub fn is_nifti(path: &Path) -> bool {
    let name = path.file_name().unwrap_or_default().to_string_lossy();
    name.ends_with(".nii.gz") || name.ends_with(".nii")
}

/// Find all NIfTI files (.nii, .nii.gz) in a directory, sorted by name.
pub async fn find_nifti_files(dir: &Path) -> UnitResult<Vec<PathBuf>> {
    let mut nifti_files = Vec::new();
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| UnitError::fs("read", dir, e))?;

    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| UnitError::fs("read", dir, e))?
    {
        let path = entry.path();
        if is_nifti(&path) {
            nifti_files.push(path);
        }
    }

    nifti_files.sort();
    Ok(nifti_files)
}

/// Delete the DICOM files of a series after a successful conversion.
pub async fn delete_dicom_files(files: &[PathBuf]) -> usize {
    let mut deleted_count = 0;
    for path in files {
        if let Err(e) = tokio::fs::remove_file(path).await {
            warn!("Failed to delete {}: {}", path.display(), e);
        } else {
            deleted_count += 1;
        }
    }
    deleted_count
}
