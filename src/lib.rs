//! # dcm-infer
//!
//! Client side of a DICOM inference exchange: load a study from disk, order
//! its slices spatially and temporally, ship it to a model endpoint as a
//! `multipart/related` request, and render the returned masks, heatmaps and
//! bounding boxes back onto the images.
//!
//! The pipeline stages map onto modules:
//!
//! - [`loader`]: read DICOM files, convert raster images to Secondary Capture
//! - [`ordering`]: group by series, sort along the slice normal, split timepoints
//! - [`protocol`]: manifests, multipart codec and SHA-256 digests
//! - [`client`]: health check and POST against the endpoint
//! - [`pixels`]: decode and normalize pixel data to 8-bit
//! - [`render`]: composite response buffers onto the ordered images

pub mod client;
pub mod error;
pub mod loader;
pub mod ordering;
pub mod pixels;
pub mod protocol;
pub mod render;
pub mod utils;

pub use error::{Error, Result};
