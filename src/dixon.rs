//! Dixon contrast separation.
//!
//! A composed Dixon series stores four contrasts in one series. Fat and water
//! images carry a marker in a private tag; the remaining in-phase and
//! opposed-phase images are told apart by echo time, the in-phase echo being the
//! longest one in the series.

use crate::config::ClassifierConfig;
use crate::error::{FsContext, UnitError, UnitResult};
use crate::series::{open_header, series_files};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// One of the four Dixon contrasts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum Channel {
    Fat,
    Water,
    InPhase,
    OpposedPhase,
}

impl Channel {
    pub const ALL: [Channel; 4] = [
        Channel::Fat,
        Channel::Water,
        Channel::InPhase,
        Channel::OpposedPhase,
    ];

    /// Short label used for directory and file names.
    pub fn label(self) -> &'static str {
        match self {
            Channel::Fat => "fat",
            Channel::Water => "water",
            Channel::InPhase => "in",
            Channel::OpposedPhase => "opp",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// The two header values the classifier looks at.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DixonTags {
    pub marker: Option<String>,
    pub echo_time: Option<f64>,
}

impl DixonTags {
    fn has_marker(&self, marker: &str) -> bool {
        self.marker.as_deref().map(|m| m.contains(marker)).unwrap_or(false)
    }
}

/// Reads the private marker tag and echo time of one file.
pub fn read_dixon_tags(path: &Path, config: &ClassifierConfig) -> UnitResult<DixonTags> {
    let obj = open_header(path)?;

    // the private tag may come back as raw bytes (implicit VR, no private dictionary)
    let marker = obj
        .element_opt(config.private_tag)
        .ok()
        .flatten()
        .and_then(|e| e.to_bytes().ok().map(|b| String::from_utf8_lossy(&b).into_owned()));

    let echo_time = obj
        .element_opt(dicom_dictionary_std::tags::ECHO_TIME)
        .ok()
        .flatten()
        .and_then(|e| e.to_float64().ok());

    Ok(DixonTags { marker, echo_time })
}

/// Assigns files of one series to contrast channels.
///
/// The maximum echo time is taken over the whole series up front, so a file's
/// channel depends on the series it belongs to and not only on its own header.
pub struct ContrastClassifier<'a> {
    config: &'a ClassifierConfig,
    max_echo_time: Option<f64>,
}

impl<'a> ContrastClassifier<'a> {
    pub fn new(config: &'a ClassifierConfig, series: &[DixonTags]) -> Self {
        let max_echo_time = series
            .iter()
            .filter_map(|t| t.echo_time)
            .fold(None, |max: Option<f64>, te| {
                Some(max.map_or(te, |m| m.max(te)))
            });
        Self {
            config,
            max_echo_time,
        }
    }

    pub fn max_echo_time(&self) -> Option<f64> {
        self.max_echo_time
    }

    /// Fat marker, then water marker, then longest echo → in-phase, else opposed-phase.
    ///
    /// Every file at the maximum echo time is in-phase, even when several
    /// acquisitions share that echo time.
    pub fn classify(&self, tags: &DixonTags) -> UnitResult<Channel> {
        if tags.has_marker(&self.config.fat_marker) {
            return Ok(Channel::Fat);
        }
        if tags.has_marker(&self.config.water_marker) {
            return Ok(Channel::Water);
        }
        match (tags.echo_time, self.max_echo_time) {
            (Some(te), Some(max)) if te == max => Ok(Channel::InPhase),
            (Some(_), _) => Ok(Channel::OpposedPhase),
            (None, _) => Err(UnitError::Classification(
                "file has neither a Dixon marker nor an echo time".into(),
            )),
        }
    }

    /// True when the unmarked files carry fewer than two distinct echo times, so
    /// none of them can land in the opposed-phase channel.
    pub fn echo_times_ambiguous(&self, series: &[DixonTags]) -> bool {
        let distinct: BTreeSet<u64> = series
            .iter()
            .filter(|t| {
                !t.has_marker(&self.config.fat_marker) && !t.has_marker(&self.config.water_marker)
            })
            .filter_map(|t| t.echo_time.map(f64::to_bits))
            .collect();
        distinct.len() < 2
    }
}

/// Directories produced by [`sort_series_dir`], one per channel.
#[derive(Debug, Clone)]
pub struct SortedSeries {
    pub channel_dirs: BTreeMap<Channel, PathBuf>,
    pub counts: BTreeMap<Channel, usize>,
}

/// Splits a composed Dixon series directory into four sibling channel directories.
///
/// Every file of the series is copied into the directory of its channel, then
/// the original directory is deleted. An existing sibling with a channel name is
/// a filesystem error; nothing is overwritten.
pub fn sort_series_dir(series_dir: &Path, config: &ClassifierConfig) -> UnitResult<SortedSeries> {
    let files = series_files(series_dir)?;
    if files.is_empty() {
        return Err(UnitError::Series(format!(
            "no DICOM series in {}",
            series_dir.display()
        )));
    }

    let tags = files
        .iter()
        .map(|f| read_dixon_tags(f, config))
        .collect::<UnitResult<Vec<_>>>()?;

    let classifier = ContrastClassifier::new(config, &tags);
    if classifier.echo_times_ambiguous(&tags) {
        warn!(
            "{}: unmarked images share a single echo time, all of them go to '{}'",
            series_dir.display(),
            Channel::InPhase
        );
    }

    let assignments = files
        .iter()
        .zip(&tags)
        .map(|(file, t)| {
            classifier
                .classify(t)
                .map_err(|e| UnitError::Classification(format!("{}: {}", file.display(), e)))
                .map(|channel| (file, channel))
        })
        .collect::<UnitResult<Vec<_>>>()?;

    let parent = series_dir.parent().ok_or_else(|| {
        UnitError::Filesystem(format!("{} has no parent directory", series_dir.display()))
    })?;

    let mut channel_dirs = BTreeMap::new();
    for channel in Channel::ALL {
        let dir = parent.join(channel.label());
        fs::create_dir(&dir).fs_context("create channel directory", &dir)?;
        channel_dirs.insert(channel, dir);
    }

    let mut counts: BTreeMap<Channel, usize> = Channel::ALL.iter().map(|c| (*c, 0)).collect();
    for (file, channel) in assignments {
        let name = file.file_name().ok_or_else(|| {
            UnitError::Filesystem(format!("{} has no file name", file.display()))
        })?;
        let dest = channel_dirs[&channel].join(name);
        fs::copy(file, &dest).fs_context("copy", &dest)?;
        *counts.entry(channel).or_default() += 1;
    }

    fs::remove_dir_all(series_dir).fs_context("remove", series_dir)?;
    debug!(
        "sorted {} (max echo time {:?}): {}",
        series_dir.display(),
        classifier.max_echo_time(),
        counts
            .iter()
            .map(|(c, n)| format!("{}={}", c, n))
            .collect::<Vec<_>>()
            .join(" ")
    );

    Ok(SortedSeries {
        channel_dirs,
        counts,
    })
}
