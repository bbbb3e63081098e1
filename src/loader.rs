//! Loading of DICOM instances from a directory tree.
//!
//! Every regular file below the root is parsed as a DICOM dataset. Files that
//! are not DICOM are decoded as raster images and converted into a minimal
//! secondary capture dataset stored in a scratch folder owned by the
//! resulting [`LoadedStudy`].

mod synthetic;

use std::borrow::Cow;
use std::path::{Path, PathBuf};

use dicom::core::Tag;
use dicom::dictionary_std::tags;
use dicom::object::{open_file, DefaultDicomObject, InMemDicomObject};
use image::DynamicImage;
use lin_alg::f64::Vec3;
use tempfile::TempDir;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::error::{Error, Result};

pub use synthetic::{new_uid, SyntheticInstance};

/// One DICOM instance as seen by the ordering and rendering stages.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageInstance {
    pub instance_uid: String,
    pub series_uid: String,
    /// ImagePositionPatient.
    pub position: Option<[f64; 3]>,
    /// ImageOrientationPatient (row cosines followed by column cosines).
    pub orientation: Option<[f64; 6]>,
    pub instance_number: Option<i32>,
    /// Index along the temporal axis, assigned once by the series orderer.
    pub timepoint: Option<usize>,
    /// The file the instance was found as.
    pub source_path: PathBuf,
    /// The DICOM file backing the instance. Differs from `source_path` for
    /// converted raster images.
    pub dataset_path: PathBuf,
}

impl ImageInstance {
    /// Build the descriptor from a parsed dataset.
    pub fn from_dataset(
        obj: &InMemDicomObject,
        source_path: &Path,
        dataset_path: &Path,
    ) -> Result<Self> {
        let instance_uid = element_string(obj, tags::SOP_INSTANCE_UID)
            .ok_or_else(|| Error::malformed(source_path, "missing SOPInstanceUID"))?;
        let series_uid = element_string(obj, tags::SERIES_INSTANCE_UID)
            .ok_or_else(|| Error::malformed(source_path, "missing SeriesInstanceUID"))?;

        Ok(Self {
            instance_uid,
            series_uid,
            position: element_floats::<3>(obj, tags::IMAGE_POSITION_PATIENT),
            orientation: element_floats::<6>(obj, tags::IMAGE_ORIENTATION_PATIENT),
            instance_number: obj
                .element(tags::INSTANCE_NUMBER)
                .ok()
                .and_then(|e| e.to_int::<i32>().ok()),
            timepoint: None,
            source_path: source_path.to_path_buf(),
            dataset_path: dataset_path.to_path_buf(),
        })
    }

    /// Slice normal: cross product of the row and column direction cosines.
    pub fn normal(&self) -> Option<Vec3> {
        self.orientation.map(|o| {
            let row = Vec3::new(o[0], o[1], o[2]);
            let col = Vec3::new(o[3], o[4], o[5]);
            row.cross(col)
        })
    }

    pub fn position_vec(&self) -> Option<Vec3> {
        self.position.map(|p| Vec3::new(p[0], p[1], p[2]))
    }

    /// Copy of this instance tagged with a timepoint.
    pub fn with_timepoint(&self, timepoint: usize) -> Self {
        Self {
            timepoint: Some(timepoint),
            ..self.clone()
        }
    }

    /// File name used when naming per-instance outputs.
    pub fn file_name(&self) -> Cow<'_, str> {
        self.source_path
            .file_name()
            .map(|n| n.to_string_lossy())
            .unwrap_or(Cow::Borrowed("image"))
    }

    pub fn open(&self) -> Result<DefaultDicomObject> {
        open_file(&self.dataset_path).map_err(|e| Error::malformed(&self.dataset_path, e))
    }
}

/// Instances loaded from one input tree.
///
/// Holds the scratch folder with converted raster images, so the instances'
/// `dataset_path` stays valid as long as this value lives.
#[derive(Debug)]
pub struct LoadedStudy {
    pub instances: Vec<ImageInstance>,
    /// How many inputs were converted from raster images.
    pub converted: usize,
    scratch: Option<TempDir>,
}

impl LoadedStudy {
    pub fn scratch_dir(&self) -> Option<&Path> {
        self.scratch.as_ref().map(TempDir::path)
    }
}

/// Load every file under `root` as a DICOM instance.
///
/// The order of the result follows directory enumeration and must not be
/// relied upon.
pub fn load_image_data(root: &Path) -> Result<LoadedStudy> {
    let mut instances = Vec::new();
    let mut scratch: Option<TempDir> = None;
    let mut converted = 0;

    for entry in WalkDir::new(root).follow_links(true) {
        let entry = entry.map_err(std::io::Error::from)?;
        let path = entry.path();
        if !entry.file_type().is_file() {
            continue;
        }

        let (obj, dataset_path) = match open_file(path) {
            Ok(obj) => (obj, path.to_path_buf()),
            Err(err) => {
                debug!("{path:?} is not a DICOM file ({err}), converting as image");
                let dir = match &scratch {
                    Some(dir) => dir.path().to_path_buf(),
                    None => {
                        let dir = tempfile::Builder::new().prefix("dcm-infer-").tempdir()?;
                        let dir_path = dir.path().to_path_buf();
                        scratch = Some(dir);
                        dir_path
                    }
                };
                let dataset_path = convert_image_to_dicom(path, &dir)?;
                let obj = open_file(&dataset_path).map_err(|e| Error::malformed(path, e))?;
                converted += 1;
                (obj, dataset_path)
            }
        };

        instances.push(ImageInstance::from_dataset(&obj, path, &dataset_path)?);
    }

    info!(
        "Loaded {} instance(s) from {root:?} ({converted} converted from images)",
        instances.len()
    );

    Ok(LoadedStudy {
        instances,
        converted,
        scratch,
    })
}

/// Convert a raster image into a single-channel DICOM file inside `scratch`.
///
/// Grayscale images are kept as is; RGB and RGBA images keep their first
/// channel. Any other pixel layout is rejected.
pub fn convert_image_to_dicom(image_path: &Path, scratch: &Path) -> Result<PathBuf> {
    let img = image::open(image_path).map_err(|e| Error::malformed(image_path, e))?;
    let (width, height) = raster_dimensions(image_path, img.width(), img.height())?;

    let pixels: Vec<u8> = match img {
        DynamicImage::ImageLuma8(gray) => gray.into_raw(),
        DynamicImage::ImageRgb8(rgb) => rgb.pixels().map(|p| p.0[0]).collect(),
        DynamicImage::ImageRgba8(rgba) => rgba.pixels().map(|p| p.0[0]).collect(),
        other => {
            return Err(Error::malformed(
                image_path,
                format!("unhandled image mode {:?}", other.color()),
            ));
        }
    };

    let stem = image_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".to_string());
    let instance_uid = new_uid();
    let dataset_path = scratch.join(format!("{stem}_{instance_uid}.dcm"));

    SyntheticInstance::new(width, height, pixels)
        .instance_uid(instance_uid)
        .write_to(&dataset_path)
        .map_err(|e| Error::malformed(image_path, e))?;

    Ok(dataset_path)
}

/// Rows and Columns are US elements, so larger rasters cannot be converted.
fn raster_dimensions(image_path: &Path, width: u32, height: u32) -> Result<(u16, u16)> {
    let fit = |value: u32, what: &str| {
        u16::try_from(value).map_err(|_| {
            Error::malformed(image_path, format!("{what} {value} exceeds {}", u16::MAX))
        })
    };
    Ok((fit(width, "width")?, fit(height, "height")?))
}

/// Parse an encoded DICOM file held in memory, with or without preamble.
pub fn read_dicom_bytes(bytes: &[u8]) -> Result<DefaultDicomObject> {
    let body = if bytes.len() >= 132 && &bytes[128..132] == b"DICM" {
        &bytes[128..]
    } else {
        bytes
    };
    dicom::object::from_reader(body).map_err(Error::dicom)
}

pub(crate) fn element_string(obj: &InMemDicomObject, tag: Tag) -> Option<String> {
    obj.element(tag)
        .ok()
        .and_then(|e| e.to_str().ok())
        .map(|s| s.trim_end_matches(['\0', ' ']).trim().to_string())
        .filter(|s| !s.is_empty())
}

fn element_floats<const N: usize>(obj: &InMemDicomObject, tag: Tag) -> Option<[f64; N]> {
    let text = element_string(obj, tag)?;
    let values: Vec<f64> = text
        .split('\\')
        .map(|v| v.trim().parse::<f64>())
        .collect::<std::result::Result<_, _>>()
        .ok()?;
    values.try_into().ok()
}
