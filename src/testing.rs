//! Fixtures shared by the unit tests: synthetic DICOM slices, zip archives and
//! stand-in volume converters.

use crate::config::DEFAULT_PRIVATE_TAG;
use crate::converter::VolumeConverter;
use crate::error::{UnitError, UnitResult};
use async_trait::async_trait;
use dicom_core::{DataElement, PrimitiveValue, VR};
use dicom_dictionary_std::tags;
use dicom_object::{FileMetaTableBuilder, InMemDicomObject};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use zip::write::FileOptions;
use zip::ZipWriter;

const MR_IMAGE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.4";
const EXPLICIT_VR_LE: &str = "1.2.840.10008.1.2.1";

pub struct Slice {
    pub series_uid: String,
    pub instance: i32,
    pub z: Option<f64>,
    pub with_series: bool,
    pub echo_time: Option<String>,
    pub marker: Option<String>,
}

impl Slice {
    pub fn new(series_uid: &str, instance: i32) -> Self {
        Self {
            series_uid: series_uid.to_string(),
            instance,
            z: Some(instance as f64),
            with_series: true,
            echo_time: None,
            marker: None,
        }
    }

    pub fn at(mut self, z: f64) -> Self {
        self.z = Some(z);
        self
    }

    /// No geometry at all.
    pub fn unplaced(mut self) -> Self {
        self.z = None;
        self
    }

    pub fn without_series(mut self) -> Self {
        self.with_series = false;
        self
    }

    pub fn echo(mut self, te: &str) -> Self {
        self.echo_time = Some(te.to_string());
        self
    }

    pub fn marker(mut self, marker: &str) -> Self {
        self.marker = Some(marker.to_string());
        self
    }
}

/// Writes a header-only MR slice.
pub fn write_slice(path: &Path, slice: &Slice) {
    let sop_uid = format!("{}.{}", slice.series_uid, slice.instance);
    let mut obj = InMemDicomObject::new_empty();
    obj.put(DataElement::new(
        tags::SOP_CLASS_UID,
        VR::UI,
        PrimitiveValue::from(MR_IMAGE_STORAGE),
    ));
    obj.put(DataElement::new(
        tags::SOP_INSTANCE_UID,
        VR::UI,
        PrimitiveValue::from(sop_uid.as_str()),
    ));
    if slice.with_series {
        obj.put(DataElement::new(
            tags::SERIES_INSTANCE_UID,
            VR::UI,
            PrimitiveValue::from(slice.series_uid.as_str()),
        ));
    }
    obj.put(DataElement::new(
        tags::INSTANCE_NUMBER,
        VR::IS,
        PrimitiveValue::from(slice.instance.to_string()),
    ));
    if let Some(z) = slice.z {
        obj.put(DataElement::new(
            tags::IMAGE_ORIENTATION_PATIENT,
            VR::DS,
            PrimitiveValue::from("1\\0\\0\\0\\1\\0"),
        ));
        obj.put(DataElement::new(
            tags::IMAGE_POSITION_PATIENT,
            VR::DS,
            PrimitiveValue::from(format!("0\\0\\{}", z)),
        ));
    }
    if let Some(te) = &slice.echo_time {
        obj.put(DataElement::new(
            tags::ECHO_TIME,
            VR::DS,
            PrimitiveValue::from(te.as_str()),
        ));
    }
    if let Some(marker) = &slice.marker {
        obj.put(DataElement::new(
            DEFAULT_PRIVATE_TAG,
            VR::LO,
            PrimitiveValue::from(marker.as_str()),
        ));
    }

    let file = obj
        .with_meta(
            FileMetaTableBuilder::new()
                .media_storage_sop_class_uid(MR_IMAGE_STORAGE)
                .media_storage_sop_instance_uid(sop_uid.as_str())
                .transfer_syntax(EXPLICIT_VR_LE),
        )
        .unwrap();
    file.write_to_file(path).unwrap();
}

/// Writes the slices of a plain single-contrast series into `dir`.
pub fn write_plain_series(dir: &Path, series_uid: &str, count: i32) {
    fs::create_dir_all(dir).unwrap();
    for i in 1..=count {
        write_slice(&dir.join(format!("IM{:04}", i)), &Slice::new(series_uid, i));
    }
}

/// Writes a composed Dixon series: `per_channel` slices of each contrast.
pub fn write_dixon_series(dir: &Path, series_uid: &str, per_channel: i32) {
    fs::create_dir_all(dir).unwrap();
    let mut instance = 0;
    for (marker, te) in [
        (Some("DIXF"), "2.46"),
        (Some("DIXW"), "2.46"),
        (None, "2.46"),
        (None, "1.23"),
    ] {
        for z in 0..per_channel {
            instance += 1;
            let mut slice = Slice::new(series_uid, instance).at(z as f64).echo(te);
            if let Some(m) = marker {
                slice = slice.marker(m);
            }
            write_slice(&dir.join(format!("IM{:04}", instance)), &slice);
        }
    }
}

/// Zips every file below `src` into `zip_path`, keeping relative paths.
pub fn zip_dir(src: &Path, zip_path: &Path) {
    let mut zw = ZipWriter::new(File::create(zip_path).unwrap());
    let mut stack = vec![src.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in fs::read_dir(&dir).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                stack.push(path);
                continue;
            }
            let name = path
                .strip_prefix(src)
                .unwrap()
                .to_string_lossy()
                .replace('\\', "/");
            zw.start_file(name, FileOptions::default()).unwrap();
            zw.write_all(&fs::read(&path).unwrap()).unwrap();
        }
    }
    zw.finish().unwrap();
}

/// Writes one placeholder volume named after `name` (or `volume` for patterns).
pub struct FakeConverter;

#[async_trait]
impl VolumeConverter for FakeConverter {
    async fn convert(&self, dicom_dir: &Path, output_dir: &Path, name: &str) -> UnitResult<PathBuf> {
        let count = fs::read_dir(dicom_dir)
            .map_err(|e| UnitError::Conversion(e.to_string()))?
            .count();
        let stem = if name.contains('%') { "volume" } else { name };
        fs::create_dir_all(output_dir).map_err(|e| UnitError::Conversion(e.to_string()))?;
        let path = output_dir.join(format!("{}.nii.gz", stem));
        fs::write(&path, format!("{} slices", count))
            .map_err(|e| UnitError::Conversion(e.to_string()))?;
        Ok(path)
    }
}

/// Panics inside `convert`, like a converter with a bug.
pub struct PanickingConverter;

#[async_trait]
impl VolumeConverter for PanickingConverter {
    async fn convert(&self, _dicom_dir: &Path, _output_dir: &Path, _name: &str) -> UnitResult<PathBuf> {
        panic!("converter bug")
    }
}

/// Always fails, like a converter that cannot handle the series.
pub struct FailingConverter;

#[async_trait]
impl VolumeConverter for FailingConverter {
    async fn convert(&self, _dicom_dir: &Path, _output_dir: &Path, _name: &str) -> UnitResult<PathBuf> {
        Err(UnitError::Conversion("unsupported series".into()))
    }
}
