//! Error taxonomy shared by the loading, ordering, protocol and rendering stages.

use std::path::PathBuf;

/// Result alias used across the library.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A file is neither a readable DICOM dataset nor a convertible raster image.
    #[error("malformed input {path:?}: {reason}")]
    MalformedInput { path: PathBuf, reason: String },

    /// The number of instances in a series is not a multiple of its timepoint count.
    #[error(
        "series {series_uid} has {instances} instances, which is not a multiple of {timepoints} timepoints"
    )]
    InconsistentVolume {
        series_uid: String,
        instances: usize,
        timepoints: usize,
    },

    /// Buffers and manifest parts do not line up.
    #[error("manifest mismatch: {0}")]
    ManifestMismatch(String),

    #[error("invalid palette {palette:?}: {reason}")]
    PaletteValidation { palette: String, reason: String },

    #[error("invalid label map for part {label:?}: {reason}")]
    LabelMapValidation { label: String, reason: String },

    /// Network failure or a non-2xx answer from the inference endpoint.
    #[error("transport error{}: {message}", .status.map(|s| format!(" (HTTP {s})")).unwrap_or_default())]
    Transport { status: Option<u16>, message: String },

    #[error("multipart error: {0}")]
    Multipart(String),

    #[error("DICOM error: {0}")]
    Dicom(String),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Image(#[from] image::ImageError),

    #[error("font error: {0}")]
    Font(#[from] ab_glyph::InvalidFont),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn malformed(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::MalformedInput {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn dicom(err: impl std::fmt::Display) -> Self {
        Self::Dicom(err.to_string())
    }

    /// Whether the error only invalidates a single manifest part.
    pub fn is_part_local(&self) -> bool {
        matches!(
            self,
            Self::PaletteValidation { .. } | Self::LabelMapValidation { .. }
        )
    }
}
