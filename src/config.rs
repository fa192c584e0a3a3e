use anyhow::{anyhow, bail, Context, Result};
use dicom_core::Tag;
use serde::Deserialize;
use std::fs;
use std::path::PathBuf;

/// Default runtime configuration file path.
pub const DEFAULT_CONFIG_PATH: &str = "config/dcm2nii_cli.toml";
/// Default dcm2niix executable, resolved through `PATH`.
pub const DEFAULT_DCM2NIIX: &str = "dcm2niix";
/// Default dcm2niix output name pattern (series number + protocol name).
pub const DEFAULT_FILENAME_PATTERN: &str = "%s_%p";
/// Upper bound for the default worker count.
pub const DEFAULT_MAX_CORES: usize = 10;
/// Private tag carrying the Dixon image type marker on Siemens scanners.
pub const DEFAULT_PRIVATE_TAG: Tag = Tag(0x0051, 0x1019);
/// Substring of the private tag that marks a fat image.
pub const DEFAULT_FAT_MARKER: &str = "DIXF";
/// Substring of the private tag that marks a water image.
pub const DEFAULT_WATER_MARKER: &str = "DIXW";

/// Arguments passed to dcm2niix ahead of the output options: gzip, no BIDS sidecar.
pub fn default_dcm2niix_args() -> Vec<String> {
    vec!["-z".into(), "y".into(), "-b".into(), "n".into()]
}

/// Settings that drive the Dixon contrast classification.
#[derive(Debug, Clone)]
pub struct ClassifierConfig {
    pub private_tag: Tag,
    pub fat_marker: String,
    pub water_marker: String,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            private_tag: DEFAULT_PRIVATE_TAG,
            fat_marker: DEFAULT_FAT_MARKER.to_string(),
            water_marker: DEFAULT_WATER_MARKER.to_string(),
        }
    }
}

#[derive(Deserialize, Default)]
/// Runtime overrides loaded from the TOML config referenced by `main`.
pub struct RuntimeConfigFile {
    pub cores: Option<usize>,
    pub dcm2niix: Option<String>,
    pub dcm2niix_args: Option<Vec<String>>,
    pub filename_pattern: Option<String>,
    pub work_dir: Option<PathBuf>,
    pub report_csv: Option<PathBuf>,
    pub report_json: Option<PathBuf>,
    pub private_tag: Option<String>,
    pub fat_marker: Option<String>,
    pub water_marker: Option<String>,
}

/// Final configuration handed to the batch orchestrator.
#[derive(Debug, Clone)]
pub struct EffectiveConfig {
    pub cores: usize,
    pub dcm2niix: String,
    pub dcm2niix_args: Vec<String>,
    pub filename_pattern: String,
    pub work_dir: PathBuf,
    pub report_csv: Option<PathBuf>,
    pub report_json: Option<PathBuf>,
    pub classifier: ClassifierConfig,
}

impl EffectiveConfig {
    /// Returns the crate-level defaults before CLI/runtime overrides are merged.
    pub fn defaults() -> Self {
        Self {
            cores: default_cores(),
            dcm2niix: DEFAULT_DCM2NIIX.to_string(),
            dcm2niix_args: default_dcm2niix_args(),
            filename_pattern: DEFAULT_FILENAME_PATTERN.to_string(),
            work_dir: std::env::temp_dir(),
            report_csv: None,
            report_json: None,
            classifier: ClassifierConfig::default(),
        }
    }

    /// Applies the values present in a runtime file on top of the current settings.
    ///
    /// Blank strings in the file are treated as absent.
    pub fn apply_file(&mut self, file: RuntimeConfigFile) -> Result<()> {
        if let Some(cores) = file.cores {
            self.cores = cores;
        }
        if let Some(exe) = sanitize_optional_string(file.dcm2niix) {
            self.dcm2niix = exe;
        }
        if let Some(args) = file.dcm2niix_args {
            self.dcm2niix_args = args
                .into_iter()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Some(pattern) = sanitize_optional_string(file.filename_pattern) {
            self.filename_pattern = pattern;
        }
        if let Some(dir) = file.work_dir {
            self.work_dir = dir;
        }
        self.report_csv = file.report_csv.or(self.report_csv.take());
        self.report_json = file.report_json.or(self.report_json.take());
        if let Some(tag) = sanitize_optional_string(file.private_tag) {
            self.classifier.private_tag = parse_tag(&tag)?;
        }
        if let Some(marker) = sanitize_optional_string(file.fat_marker) {
            self.classifier.fat_marker = marker;
        }
        if let Some(marker) = sanitize_optional_string(file.water_marker) {
            self.classifier.water_marker = marker;
        }
        Ok(())
    }
}

/// Number of CPUs the process may use, at least one.
pub fn available_cores() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Default worker count: ten workers, or fewer on smaller machines.
pub fn default_cores() -> usize {
    DEFAULT_MAX_CORES.min(available_cores())
}

/// Checks that a requested worker count lies within `1..=available CPUs`.
pub fn validate_cores(cores: usize) -> Result<usize> {
    let max = available_cores();
    if cores == 0 || cores > max {
        bail!("--cores must be between 1 and {} (got {})", max, cores);
    }
    Ok(cores)
}

/// Parses a DICOM tag written as `0051,1019`, `(0051,1019)` or `00511019`.
pub fn parse_tag(text: &str) -> Result<Tag> {
    let cleaned: String = text
        .chars()
        .filter(|c| !matches!(c, '(' | ')' | ',' | ' '))
        .collect();
    if cleaned.len() != 8 {
        return Err(anyhow!("Invalid DICOM tag '{}'", text));
    }
    let group = u16::from_str_radix(&cleaned[..4], 16)
        .with_context(|| format!("Invalid tag group in '{}'", text))?;
    let element = u16::from_str_radix(&cleaned[4..], 16)
        .with_context(|| format!("Invalid tag element in '{}'", text))?;
    Ok(Tag(group, element))
}

/// Attempts to read the runtime config file and deserialize CLI overrides.
///
/// Returns `Ok(None)` when the file is missing so defaults are preserved.
pub fn load_runtime_config(path: Option<&PathBuf>) -> Result<Option<RuntimeConfigFile>> {
    let path = match path {
        Some(path) => path.clone(),
        None => PathBuf::from(DEFAULT_CONFIG_PATH),
    };

    if !path.exists() {
        return Ok(None);
    }

    let content = fs::read_to_string(&path).context("Failed to read runtime config")?;
    let parsed: RuntimeConfigFile =
        toml::from_str(&content).context("Failed to parse runtime config")?;
    Ok(Some(parsed))
}

/// Trims whitespace and drops empty strings.
pub fn sanitize_optional_string(value: Option<String>) -> Option<String> {
    value.and_then(|s| {
        let trimmed = s.trim().to_string();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed)
        }
    })
}
