//! DICOM series discovery inside an extracted archive.

use crate::error::{FsContext, UnitError, UnitResult};
use dicom_dictionary_std::tags;
use dicom_object::{DefaultDicomObject, OpenFileOptions};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::debug;

/// One acquisition series: its UID and its files in slice order.
#[derive(Debug, Clone)]
pub struct DicomSeries {
    pub series_uid: String,
    pub files: Vec<PathBuf>,
}

struct SliceHeader {
    path: PathBuf,
    series_uid: String,
    position: Option<f64>,
    instance: Option<i32>,
}

/// Checks for the `DICM` magic after the 128 byte preamble.
pub fn is_dicom_file(path: &Path) -> bool {
    let mut buffer = [0u8; 132];
    match File::open(path) {
        Ok(mut file) => file.read_exact(&mut buffer).is_ok() && &buffer[128..132] == b"DICM",
        Err(_) => false,
    }
}

/// Opens a DICOM file without loading its pixel data.
pub fn open_header(path: &Path) -> UnitResult<DefaultDicomObject> {
    OpenFileOptions::new()
        .read_until(tags::PIXEL_DATA)
        .open_file(path)
        .map_err(|e| UnitError::Series(format!("cannot read {}: {}", path.display(), e)))
}

fn read_slice_header(path: &Path) -> UnitResult<SliceHeader> {
    let obj = open_header(path)?;

    let series_uid = obj
        .element_opt(tags::SERIES_INSTANCE_UID)
        .ok()
        .flatten()
        .and_then(|e| e.to_str().ok())
        .map(|s| s.trim_end_matches('\0').trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| UnitError::Series(format!("{} has no series instance UID", path.display())))?;

    let instance = obj
        .element_opt(tags::INSTANCE_NUMBER)
        .ok()
        .flatten()
        .and_then(|e| e.to_int::<i32>().ok());

    let ipp = obj
        .element_opt(tags::IMAGE_POSITION_PATIENT)
        .ok()
        .flatten()
        .and_then(|e| e.to_multi_float64().ok());
    let iop = obj
        .element_opt(tags::IMAGE_ORIENTATION_PATIENT)
        .ok()
        .flatten()
        .and_then(|e| e.to_multi_float64().ok());

    Ok(SliceHeader {
        path: path.to_path_buf(),
        series_uid,
        position: slice_position(ipp.as_deref(), iop.as_deref()),
        instance,
    })
}

/// Projects the image position onto the slice normal.
fn slice_position(ipp: Option<&[f64]>, iop: Option<&[f64]>) -> Option<f64> {
    let (ipp, iop) = (ipp?, iop?);
    if ipp.len() < 3 || iop.len() < 6 {
        return None;
    }
    let (r, c) = (&iop[..3], &iop[3..6]);
    let normal = [
        r[1] * c[2] - r[2] * c[1],
        r[2] * c[0] - r[0] * c[2],
        r[0] * c[1] - r[1] * c[0],
    ];
    Some(ipp[0] * normal[0] + ipp[1] * normal[1] + ipp[2] * normal[2])
}

/// Slices with a position come first, in position order; the rest follow.
fn compare_slices(a: &SliceHeader, b: &SliceHeader) -> Ordering {
    let by_position = match (a.position, b.position) {
        (Some(x), Some(y)) => x.total_cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    };
    by_position
        .then(a.instance.cmp(&b.instance))
        .then(a.path.cmp(&b.path))
}

/// Groups the DICOM files directly inside `dir` by series UID.
///
/// Files that are not DICOM, or cannot be parsed, are skipped. A directory with no
/// recognizable series yields an empty list.
pub fn discover_series(dir: &Path) -> UnitResult<Vec<DicomSeries>> {
    let mut groups: BTreeMap<String, Vec<SliceHeader>> = BTreeMap::new();

    for entry in fs::read_dir(dir).fs_context("read", dir)? {
        let path = entry.fs_context("read", dir)?.path();
        if !path.is_file() || !is_dicom_file(&path) {
            continue;
        }
        match read_slice_header(&path) {
            Ok(header) => groups
                .entry(header.series_uid.clone())
                .or_default()
                .push(header),
            Err(e) => debug!("skipping {}: {}", path.display(), e),
        }
    }

    Ok(groups
        .into_iter()
        .map(|(series_uid, mut slices)| {
            slices.sort_by(compare_slices);
            DicomSeries {
                series_uid,
                files: slices.into_iter().map(|s| s.path).collect(),
            }
        })
        .collect())
}

/// Returns the ordered files of the single series in `dir`.
///
/// No series yields an empty list; more than one series is a series error.
pub fn series_files(dir: &Path) -> UnitResult<Vec<PathBuf>> {
    let mut series = discover_series(dir)?;
    match series.len() {
        0 => Ok(Vec::new()),
        1 => Ok(series.remove(0).files),
        n => Err(UnitError::Series(format!(
            "{} series found in {}, expected one ({})",
            n,
            dir.display(),
            series
                .iter()
                .map(|s| s.series_uid.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        ))),
    }
}

fn is_ignored(name: &str) -> bool {
    name.starts_with('.') || name == "__MACOSX"
}

/// Walks down from `root` to the directory that holds the series files.
///
/// Each level must contain either files only, or exactly one subdirectory and no
/// files. Anything else is ambiguous and fails instead of picking one candidate.
pub fn locate_series_dir(root: &Path) -> UnitResult<PathBuf> {
    let mut current = root.to_path_buf();
    loop {
        let mut files = 0;
        let mut dirs = Vec::new();
        for entry in fs::read_dir(&current).fs_context("read", &current)? {
            let entry = entry.fs_context("read", &current)?;
            if is_ignored(&entry.file_name().to_string_lossy()) {
                continue;
            }
            let path = entry.path();
            if path.is_dir() {
                dirs.push(path);
            } else {
                files += 1;
            }
        }

        match (files, dirs.len()) {
            (0, 0) => {
                return Err(UnitError::Series(format!(
                    "no DICOM series below {}",
                    root.display()
                )))
            }
            (0, 1) => current = dirs.remove(0),
            (_, 0) => return Ok(current),
            (f, d) => {
                return Err(UnitError::Series(format!(
                    "ambiguous layout in {}: {} files, {} directories",
                    current.display(),
                    f,
                    d
                )))
            }
        }
    }
}
