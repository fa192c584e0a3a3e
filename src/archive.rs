//! Zip archive discovery, subject identifiers and extraction.
//!
//! Each archive holds one imaging sequence of one subject, e.g.
//! `100123_3D_GRE_TRA_W_COMPOSED.zip`; the six digit run in the file name is the
//! subject identifier.

use crate::error::{FsContext, UnitError, UnitResult};
use anyhow::{Context, Result};
use regex::Regex;
use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use zip::ZipArchive;

/// Length of the numeric subject identifier embedded in archive names.
pub const SUBJECT_ID_LEN: usize = 6;

fn digit_runs() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[0-9]+").expect("static regex"))
}

/// Lists the `.zip` files directly inside `dir`, sorted by file name.
pub fn discover_archives(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut archives = Vec::new();
    let entries =
        fs::read_dir(dir).with_context(|| format!("Failed to read {}", dir.display()))?;

    for entry in entries {
        let path = entry?.path();
        let is_zip = path
            .extension()
            .map(|e| e.eq_ignore_ascii_case("zip"))
            .unwrap_or(false);
        if path.is_file() && is_zip {
            archives.push(path);
        }
    }

    archives.sort();
    Ok(archives)
}

/// Extracts the subject identifier from an archive file name.
///
/// The identifier is the last run of exactly six digits in the file stem. Names
/// without such a run violate the naming convention and fail the archive.
pub fn subject_id(archive: &Path) -> UnitResult<String> {
    let stem = archive
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| UnitError::Naming(format!("unreadable file name {}", archive.display())))?;

    digit_runs()
        .find_iter(stem)
        .filter(|m| m.as_str().len() == SUBJECT_ID_LEN)
        .last()
        .map(|m| m.as_str().to_string())
        .ok_or_else(|| {
            UnitError::Naming(format!(
                "no {}-digit subject id in '{}'",
                SUBJECT_ID_LEN,
                archive.file_name().unwrap_or_default().to_string_lossy()
            ))
        })
}

/// Extracts every member of `archive` below `target`, returning the number of files written.
///
/// Corrupt archives and members whose names escape `target` are archive errors.
pub fn extract_archive(archive: &Path, target: &Path) -> UnitResult<usize> {
    let file = File::open(archive)
        .map_err(|e| UnitError::Archive(format!("cannot open {}: {}", archive.display(), e)))?;
    let mut zip = ZipArchive::new(BufReader::new(file))
        .map_err(|e| UnitError::Archive(format!("{}: {}", archive.display(), e)))?;

    fs::create_dir_all(target).fs_context("create", target)?;

    let mut written = 0;
    for i in 0..zip.len() {
        let mut member = zip
            .by_index(i)
            .map_err(|e| UnitError::Archive(format!("{}: {}", archive.display(), e)))?;

        let relative = member.enclosed_name().map(Path::to_path_buf).ok_or_else(|| {
            UnitError::Archive(format!("unsafe member name '{}'", member.name()))
        })?;
        let dest = target.join(relative);

        if member.is_dir() {
            fs::create_dir_all(&dest).fs_context("create", &dest)?;
            continue;
        }

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).fs_context("create", parent)?;
        }
        let mut output = File::create(&dest).fs_context("create", &dest)?;
        std::io::copy(&mut member, &mut output).map_err(|e| {
            UnitError::Archive(format!("cannot inflate '{}': {}", member.name(), e))
        })?;
        written += 1;
    }

    Ok(written)
}
