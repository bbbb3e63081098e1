//! Compositing of inference results onto the ordered input images.
//!
//! Buffers are addressed in one of two ways:
//! - Parts naming a `dicom_image` target hold one slice for that image only.
//!   Parts whose target is not among the loaded images are dropped.
//! - All other parts span the ordered volume. A running offset advances by
//!   one slice per image and resets whenever the image timepoint changes.
//!   Parts with more than one timepoint start timepoint `t` at
//!   `t * depth * height * width`; single-timepoint parts only apply to
//!   timepoint 0.
//!
//! Bounding boxes and their labels are drawn after the masks. Study-level
//! classification is listed on the first image only, series-level
//! classification on every image.

pub mod boxes;
pub mod capture;
pub mod heatmap;
pub mod overlay;
pub mod text;

use std::fs;
use std::path::{Path, PathBuf};

use image::RgbImage;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::loader::ImageInstance;
use crate::pixels;
use crate::protocol::InferenceResponse;
use crate::protocol::manifest::{BinaryType, MaskPart, ResponseManifest, pair_filtered};
use crate::utils::sanitize_filename;
use heatmap::Lut;

pub const MASK_ALPHA: f64 = 0.5;
pub const RESPONSE_FILE: &str = "response.json";

/// File name of the `n`th (1-based) raw mask buffer.
pub fn mask_file_name(n: usize) -> String {
    format!("output_masks_{n}.npy")
}

/// File name of the `i`th (0-based) DICOM-carrying buffer.
pub fn dataset_file_name(i: usize) -> String {
    format!("sc_{i}.dcm")
}

/// File name of the overlay rendered for the `index`th ordered image.
pub fn overlay_file_name(index: usize, image: &ImageInstance) -> String {
    format!("{index}_{}.png", sanitize_filename(&image.file_name()))
}

/// A manifest part left out of rendering because it failed validation.
#[derive(Debug, Clone, PartialEq)]
pub struct DroppedPart {
    pub index: usize,
    pub label: String,
    pub reason: String,
}

/// Overlays rendered in memory, one per ordered image.
#[derive(Debug)]
pub struct Composition {
    pub overlays: Vec<RgbImage>,
    pub dropped: Vec<DroppedPart>,
}

/// Files written by [`Compositor::render`].
#[derive(Debug, Default)]
pub struct RenderReport {
    pub overlays: Vec<PathBuf>,
    pub masks: Vec<PathBuf>,
    pub datasets: Vec<PathBuf>,
    pub manifest_copy: Option<PathBuf>,
    pub dropped: Vec<DroppedPart>,
}

enum LayerKind {
    Probability { threshold: f64 },
    Boolean,
    Labels,
    Heatmap(Box<Lut>),
}

struct Layer<'a> {
    mask: MaskPart<'a>,
    kind: LayerKind,
}

impl<'a> Layer<'a> {
    /// The part of the buffer covering `image`, or `None` if the layer does
    /// not apply to it. `dimensions` is the rendered image's `(width, height)`.
    fn slice_for(
        &self,
        image: &ImageInstance,
        timepoint: usize,
        offset: usize,
        dimensions: (u32, u32),
    ) -> Result<Option<&'a [u8]>> {
        let shape = self.mask.shape;
        if let Some(uid) = self.mask.paired.part.target_uid() {
            if uid != image.instance_uid {
                return Ok(None);
            }
            return self.window(image, 0, dimensions).map(Some);
        }
        if shape.timepoints <= 1 && timepoint != 0 {
            return Ok(None);
        }
        let base = if shape.timepoints > 1 {
            timepoint * shape.depth as usize * shape.slice_len()
        } else {
            0
        };
        self.window(image, base + offset, dimensions).map(Some)
    }

    fn window(
        &self,
        image: &ImageInstance,
        start: usize,
        (width, height): (u32, u32),
    ) -> Result<&'a [u8]> {
        let part = self.mask.paired;
        let shape = self.mask.shape;
        if (shape.width, shape.height) != (width, height) {
            return Err(Error::ManifestMismatch(format!(
                "part {} declares {}x{} slices but image {} is {width}x{height}",
                part.index, shape.width, shape.height, image.instance_uid
            )));
        }
        let len = shape.slice_len();
        part.buffer.get(start..start + len).ok_or_else(|| {
            Error::ManifestMismatch(format!(
                "part {} has no data for image {} at offset {start}",
                part.index, image.instance_uid
            ))
        })
    }

    fn apply(&self, image: &mut RgbImage, mask: &[u8]) -> usize {
        let color = overlay::mask_color(self.mask.mask_index);
        match &self.kind {
            LayerKind::Probability { threshold } => {
                overlay::apply_mask(image, mask, color, MASK_ALPHA, |v| f64::from(v) > *threshold)
            }
            LayerKind::Boolean => overlay::apply_mask(image, mask, color, MASK_ALPHA, |v| v != 0),
            LayerKind::Labels => overlay::apply_label_mask(image, mask, MASK_ALPHA),
            LayerKind::Heatmap(lut) => heatmap::apply_heatmap(image, mask, lut, MASK_ALPHA),
        }
    }
}

/// Renders a response manifest and its buffers over the ordered images.
pub struct Compositor<'a> {
    images: &'a [ImageInstance],
    manifest: &'a ResponseManifest,
    buffers: &'a [Vec<u8>],
}

impl<'a> Compositor<'a> {
    pub fn new(
        images: &'a [ImageInstance],
        manifest: &'a ResponseManifest,
        buffers: &'a [Vec<u8>],
    ) -> Self {
        Self {
            images,
            manifest,
            buffers,
        }
    }

    fn prepare(&self, mask: MaskPart<'a>) -> Result<Layer<'a>> {
        let part = mask.paired.part;
        let kind = match part.binary_type {
            BinaryType::ProbabilityMask => LayerKind::Probability {
                threshold: part.mask_threshold(),
            },
            BinaryType::BooleanMask => LayerKind::Boolean,
            BinaryType::NumericLabelMask => {
                let max = mask.paired.buffer.iter().copied().max().unwrap_or(0);
                part.validated_label_map(max)?;
                LayerKind::Labels
            }
            BinaryType::Heatmap => {
                let name = part.palette.as_deref().ok_or_else(|| Error::PaletteValidation {
                    palette: String::new(),
                    reason: format!("heatmap part {:?} names no palette", part.label),
                })?;
                let palette =
                    self.manifest
                        .palettes
                        .get(name)
                        .ok_or_else(|| Error::PaletteValidation {
                            palette: name.to_string(),
                            reason: "not defined in palettes".to_string(),
                        })?;
                LayerKind::Heatmap(Box::new(heatmap::evaluate_palette(name, palette)?))
            }
            other => {
                return Err(Error::ManifestMismatch(format!(
                    "{other} buffers cannot be rendered as overlays"
                )));
            }
        };
        Ok(Layer { mask, kind })
    }

    fn layers(&self, masks: Vec<MaskPart<'a>>) -> Result<(Vec<Layer<'a>>, Vec<DroppedPart>)> {
        let mut layers = Vec::with_capacity(masks.len());
        let mut dropped = Vec::new();
        for mask in masks {
            let part = mask.paired.part;
            if let Some(uid) = part.target_uid()
                && !self.images.iter().any(|i| i.instance_uid == uid)
            {
                debug!("Part {} targets unknown image {uid}, skipping", mask.paired.index);
                continue;
            }
            match self.prepare(mask) {
                Ok(layer) => layers.push(layer),
                Err(e) if e.is_part_local() => {
                    warn!("Dropping part {} ({:?}): {e}", mask.paired.index, part.label);
                    dropped.push(DroppedPart {
                        index: mask.paired.index,
                        label: part.label.clone(),
                        reason: e.to_string(),
                    });
                }
                Err(e) => return Err(e),
            }
        }
        Ok((layers, dropped))
    }

    /// Render one overlay per ordered image without touching the filesystem.
    pub fn compose(&self) -> Result<Composition> {
        let pairing = pair_filtered(&self.manifest.parts, self.buffers)?;
        let (layers, dropped) = self.layers(pairing.masks)?;

        let font = text::font()?;
        let mut overlays = Vec::with_capacity(self.images.len());
        let mut offset = 0;
        let mut last_timepoint = None;
        for (index, image) in self.images.iter().enumerate() {
            let mut obj = image.open()?;
            let mut rgb = pixels::get_pixels(&mut obj)?.into_rgb_image()?;
            let dimensions = rgb.dimensions();

            if image.timepoint.is_some() && image.timepoint != last_timepoint {
                offset = 0;
                last_timepoint = image.timepoint;
            }
            let timepoint = image.timepoint.unwrap_or(0);

            for layer in &layers {
                if let Some(mask) = layer.slice_for(image, timepoint, offset, dimensions)? {
                    let blended = layer.apply(&mut rgb, mask);
                    debug!(
                        "Part {} blended {blended} pixel(s) on {}",
                        layer.mask.paired.index, image.instance_uid
                    );
                }
            }
            for bbox in self
                .manifest
                .bounding_boxes_2d
                .iter()
                .filter(|b| b.sop_instance_uid == image.instance_uid)
            {
                boxes::draw_box(&mut rgb, bbox, &font);
            }
            text::draw_classification(
                &mut rgb,
                &font,
                self.manifest.study_ml_json.as_ref().filter(|_| index == 0),
                self.manifest.series_ml_json.as_ref(),
                &image.series_uid,
            );

            offset += dimensions.0 as usize * dimensions.1 as usize;
            overlays.push(rgb);
        }

        Ok(Composition { overlays, dropped })
    }

    /// Write raw mask buffers, DICOM datasets and overlays to `output_dir`.
    pub fn render(&self, output_dir: &Path) -> Result<RenderReport> {
        fs::create_dir_all(output_dir)?;
        let pairing = pair_filtered(&self.manifest.parts, self.buffers)?;
        let mut report = RenderReport::default();

        for mask in &pairing.masks {
            let path = output_dir.join(mask_file_name(mask.mask_index + 1));
            fs::write(&path, mask.paired.buffer)?;
            report.masks.push(path);
        }
        for (i, dataset) in pairing.datasets.iter().enumerate() {
            let path = output_dir.join(dataset_file_name(i));
            capture::write_dataset(dataset.buffer, &path)?;
            report.datasets.push(path);
        }

        let composition = self.compose()?;
        for (index, (image, overlay)) in self.images.iter().zip(&composition.overlays).enumerate() {
            let path = output_dir.join(overlay_file_name(index, image));
            overlay.save(&path)?;
            report.overlays.push(path);
        }
        report.dropped = composition.dropped;

        info!(
            "Rendered {} overlay(s), {} mask buffer(s), {} dataset(s)",
            report.overlays.len(),
            report.masks.len(),
            report.datasets.len()
        );
        Ok(report)
    }
}

/// Render a decoded response and keep a copy of its manifest.
pub fn render_response(
    images: &[ImageInstance],
    response: &InferenceResponse,
    output_dir: &Path,
) -> Result<RenderReport> {
    let mut report = Compositor::new(images, &response.manifest, &response.buffers).render(output_dir)?;

    let path = output_dir.join(RESPONSE_FILE);
    fs::write(&path, serde_json::to_vec_pretty(&response.raw_manifest)?)?;
    report.manifest_copy = Some(path);

    log_classification(&response.manifest);
    Ok(report)
}

fn log_classification(manifest: &ResponseManifest) {
    for (scope, value) in [
        ("study", &manifest.study_ml_json),
        ("series", &manifest.series_ml_json),
    ] {
        if let Some(value) = value {
            info!("{scope} classification: {value}");
        }
    }
}
