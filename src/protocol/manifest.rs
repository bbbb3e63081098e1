//! JSON manifests exchanged with the inference endpoint, and the rules tying
//! response manifest parts to binary buffers.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::{Error, Result};
use crate::loader::ImageInstance;

pub const PROTOCOL_VERSION: &str = "1.0";

// ============================================================================
// Response manifest
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinaryType {
    ProbabilityMask,
    BooleanMask,
    NumericLabelMask,
    Heatmap,
    DicomSecondaryCapture,
    Dicom,
    DicomStructuredReport,
    DicomGsps,
}

impl BinaryType {
    /// Whether the buffer is a complete encoded DICOM dataset.
    pub fn is_dicom(self) -> bool {
        matches!(
            self,
            Self::Dicom | Self::DicomSecondaryCapture | Self::DicomStructuredReport | Self::DicomGsps
        )
    }

    /// MIME type of the buffer part in a response body.
    pub fn mime_type(self) -> &'static str {
        if self.is_dicom() {
            "application/dicom"
        } else {
            "application/binary"
        }
    }
}

impl fmt::Display for BinaryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ProbabilityMask => "probability_mask",
            Self::BooleanMask => "boolean_mask",
            Self::NumericLabelMask => "numeric_label_mask",
            Self::Heatmap => "heatmap",
            Self::DicomSecondaryCapture => "dicom_secondary_capture",
            Self::Dicom => "dicom",
            Self::DicomStructuredReport => "dicom_structured_report",
            Self::DicomGsps => "dicom_gsps",
        };
        f.write_str(name)
    }
}

fn one() -> u32 {
    1
}

/// Declared dimensions of a mask or heatmap buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shape {
    pub width: u32,
    pub height: u32,
    #[serde(default = "one")]
    pub depth: u32,
    #[serde(default = "one")]
    pub timepoints: u32,
}

impl Shape {
    pub fn new(width: u32, height: u32, depth: u32, timepoints: u32) -> Self {
        Self {
            width,
            height,
            depth,
            timepoints,
        }
    }

    /// Pixels in one slice.
    pub fn slice_len(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Bytes the buffer must hold.
    pub fn buffer_len(&self) -> usize {
        self.slice_len() * self.depth as usize * self.timepoints as usize
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    #[serde(rename = "SOPInstanceUID")]
    pub sop_instance_uid: String,
}

/// One entry of the response `parts` array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestPart {
    #[serde(default)]
    pub label: String,
    #[serde(alias = "binaryType")]
    pub binary_type: BinaryType,
    #[serde(
        default,
        alias = "binaryDataShape",
        alias = "shape",
        skip_serializing_if = "Option::is_none"
    )]
    pub binary_data_shape: Option<Shape>,
    #[serde(default, alias = "dicomImage", skip_serializing_if = "Option::is_none")]
    pub dicom_image: Option<ImageRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub palette: Option<String>,
    #[serde(default, alias = "labelMap", skip_serializing_if = "Option::is_none")]
    pub label_map: Option<BTreeMap<String, String>>,
    #[serde(
        default,
        alias = "probabilityThreshold",
        skip_serializing_if = "Option::is_none"
    )]
    pub probability_threshold: Option<f64>,
    /// Fields not interpreted here, such as `SeriesInstanceUID`.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ManifestPart {
    pub fn new(label: impl Into<String>, binary_type: BinaryType) -> Self {
        Self {
            label: label.into(),
            binary_type,
            binary_data_shape: None,
            dicom_image: None,
            palette: None,
            label_map: None,
            probability_threshold: None,
            extra: Map::new(),
        }
    }

    pub fn with_shape(mut self, shape: Shape) -> Self {
        self.binary_data_shape = Some(shape);
        self
    }

    pub fn with_target(mut self, sop_instance_uid: impl Into<String>) -> Self {
        self.dicom_image = Some(ImageRef {
            sop_instance_uid: sop_instance_uid.into(),
        });
        self
    }

    pub fn with_palette(mut self, palette: impl Into<String>) -> Self {
        self.palette = Some(palette.into());
        self
    }

    pub fn with_label_map<K: ToString, V: Into<String>>(
        mut self,
        labels: impl IntoIterator<Item = (K, V)>,
    ) -> Self {
        self.label_map = Some(
            labels
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.into()))
                .collect(),
        );
        self
    }

    pub fn with_probability_threshold(mut self, threshold: f64) -> Self {
        self.probability_threshold = Some(threshold);
        self
    }

    /// SOPInstanceUID of the single image this part applies to, if any.
    pub fn target_uid(&self) -> Option<&str> {
        self.dicom_image.as_ref().map(|r| r.sop_instance_uid.as_str())
    }

    /// Mask values above this are blended.
    pub fn mask_threshold(&self) -> f64 {
        self.probability_threshold.map_or(128.0, |t| t * 255.0)
    }

    /// Parse the label map and check it covers every value up to `mask_max`.
    pub fn validated_label_map(&self, mask_max: u8) -> Result<BTreeMap<u8, String>> {
        let invalid = |reason: String| Error::LabelMapValidation {
            label: self.label.clone(),
            reason,
        };
        let raw = self
            .label_map
            .as_ref()
            .ok_or_else(|| invalid("numeric label mask without label_map".to_string()))?;

        let mut labels = BTreeMap::new();
        let mut names = BTreeSet::new();
        for (key, name) in raw {
            let value: u8 = key
                .trim()
                .parse()
                .map_err(|_| invalid(format!("key {key:?} is not an integer in 0..=255")))?;
            if !names.insert(name.as_str()) {
                return Err(invalid(format!("label {name:?} is used more than once")));
            }
            labels.insert(value, name.clone());
        }

        let max_key = labels.keys().next_back().copied().unwrap_or(0);
        if mask_max > max_key {
            return Err(invalid(format!(
                "mask holds value {mask_max} but the highest label is {max_key}"
            )));
        }
        Ok(labels)
    }
}

/// One anchor of an `anchorpoints` palette.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Anchor {
    pub threshold: f64,
    /// RGBA, validated when the palette is evaluated.
    pub color: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Palette {
    /// Piecewise-linear RGBA ramp between thresholds 0.0 and 1.0.
    Anchorpoints { data: Vec<Anchor> },
    /// 256 RGBA entries indexed directly by mask value.
    Lut { data: Vec<Vec<u8>> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    #[serde(default)]
    pub label: String,
    #[serde(rename = "SOPInstanceUID")]
    pub sop_instance_uid: String,
    pub top_left: [i64; 2],
    pub bottom_right: [i64; 2],
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseManifest {
    #[serde(default)]
    pub protocol_version: String,
    #[serde(default)]
    pub parts: Vec<ManifestPart>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub palettes: BTreeMap<String, Palette>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bounding_boxes_2d: Vec<BoundingBox>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub study_ml_json: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub series_ml_json: Option<Value>,
}

impl Default for ResponseManifest {
    fn default() -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION.to_string(),
            parts: Vec::new(),
            palettes: BTreeMap::new(),
            bounding_boxes_2d: Vec::new(),
            study_ml_json: None,
            series_ml_json: None,
        }
    }
}

impl ResponseManifest {
    pub fn from_slice(json: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(json)?)
    }

    pub fn to_vec(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

// ============================================================================
// Buffer pairing
// ============================================================================

/// A manifest part together with its buffer.
#[derive(Debug, Clone, Copy)]
pub struct PairedPart<'a> {
    /// Position in the manifest `parts` array.
    pub index: usize,
    pub part: &'a ManifestPart,
    pub buffer: &'a [u8],
}

/// A renderable (non-DICOM) part with its validated shape.
#[derive(Debug, Clone, Copy)]
pub struct MaskPart<'a> {
    /// Position among renderable parts; selects the overlay color.
    pub mask_index: usize,
    pub shape: Shape,
    pub paired: PairedPart<'a>,
}

#[derive(Debug, Clone, Default)]
pub struct Pairing<'a> {
    pub masks: Vec<MaskPart<'a>>,
    pub datasets: Vec<PairedPart<'a>>,
}

/// Pair the Nth buffer with the Nth manifest part.
pub fn pair_positional<'a, B: AsRef<[u8]>>(
    parts: &'a [ManifestPart],
    buffers: &'a [B],
) -> Result<Vec<PairedPart<'a>>> {
    if parts.len() != buffers.len() {
        return Err(Error::ManifestMismatch(format!(
            "manifest declares {} parts but {} buffers were supplied",
            parts.len(),
            buffers.len()
        )));
    }
    Ok(parts
        .iter()
        .zip(buffers)
        .enumerate()
        .map(|(index, (part, buffer))| PairedPart {
            index,
            part,
            buffer: buffer.as_ref(),
        })
        .collect())
}

/// Split positional pairs into renderable masks and DICOM datasets, checking
/// every mask buffer against its declared shape.
pub fn pair_filtered<'a, B: AsRef<[u8]>>(
    parts: &'a [ManifestPart],
    buffers: &'a [B],
) -> Result<Pairing<'a>> {
    let paired = pair_positional(parts, buffers)?;

    let shaped = parts
        .iter()
        .filter(|p| !p.binary_type.is_dicom() && p.binary_data_shape.is_some())
        .count();
    let renderable = parts.iter().filter(|p| !p.binary_type.is_dicom()).count();
    if shaped != renderable {
        return Err(Error::ManifestMismatch(format!(
            "{shaped} parts declare a shape but {renderable} mask buffers were supplied"
        )));
    }

    let mut pairing = Pairing::default();
    for paired in paired {
        let Some(shape) = paired.part.binary_data_shape.filter(|_| !paired.part.binary_type.is_dicom())
        else {
            pairing.datasets.push(paired);
            continue;
        };
        if paired.buffer.len() != shape.buffer_len() {
            return Err(Error::ManifestMismatch(format!(
                "part {} ({:?}) holds {} bytes, shape {}x{}x{}x{} needs {}",
                paired.index,
                paired.part.label,
                paired.buffer.len(),
                shape.width,
                shape.height,
                shape.depth,
                shape.timepoints,
                shape.buffer_len()
            )));
        }
        debug!(
            "Paired part {} ({}) with a {} byte buffer",
            paired.index,
            paired.part.binary_type,
            paired.buffer.len()
        );
        pairing.masks.push(MaskPart {
            mask_index: pairing.masks.len(),
            shape,
            paired,
        });
    }
    Ok(pairing)
}

// ============================================================================
// Request manifest
// ============================================================================

/// Kind of model the request is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ModelKind {
    Segmentation,
    BoundingBox,
    #[default]
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InferenceCommand {
    #[serde(rename = "get-probability-mask-2D")]
    ProbabilityMask2d,
    #[serde(rename = "get-probability-mask-3D")]
    ProbabilityMask3d,
    #[serde(rename = "get-bounding-box-2d")]
    BoundingBox2d,
    #[serde(rename = "other")]
    Other,
}

impl InferenceCommand {
    /// Segmentation is 2-D when the first ordered image has no position.
    pub fn select(kind: ModelKind, first: Option<&ImageInstance>) -> Self {
        match kind {
            ModelKind::BoundingBox => Self::BoundingBox2d,
            ModelKind::Segmentation if first.is_some_and(|i| i.position.is_some()) => {
                Self::ProbabilityMask3d
            }
            ModelKind::Segmentation => Self::ProbabilityMask2d,
            ModelKind::Other => Self::Other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestManifest {
    pub request: String,
    pub route: String,
    pub inference_command: InferenceCommand,
    /// Free-form fields such as `studyUID` or `depth`.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl RequestManifest {
    pub fn new(route: impl Into<String>, inference_command: InferenceCommand) -> Self {
        Self {
            request: "post".to_string(),
            route: route.into(),
            inference_command,
            extra: Map::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn mask(label: &str, w: u32, h: u32) -> ManifestPart {
        ManifestPart::new(label, BinaryType::ProbabilityMask).with_shape(Shape::new(w, h, 1, 1))
    }

    // =========================================================================
    // Schema Tests
    // =========================================================================

    mod schema_tests {
        use super::*;

        #[test]
        fn parses_wire_manifest() {
            let manifest: ResponseManifest = serde_json::from_value(json!({
                "protocol_version": "1.0",
                "parts": [{
                    "label": "Mock seg",
                    "binary_type": "probability_mask",
                    "binary_data_shape": {"timepoints": 1, "depth": 3, "width": 4, "height": 2},
                    "SeriesInstanceUID": "1.2.3"
                }],
                "bounding_boxes_2d": [{
                    "label": "box",
                    "SOPInstanceUID": "9.9",
                    "top_left": [5, 5],
                    "bottom_right": [10, 10]
                }]
            }))
            .unwrap();

            let part = &manifest.parts[0];
            assert_eq!(part.binary_type, BinaryType::ProbabilityMask);
            assert_eq!(part.binary_data_shape.unwrap().buffer_len(), 24);
            assert_eq!(part.extra["SeriesInstanceUID"], "1.2.3");
            assert_eq!(manifest.bounding_boxes_2d[0].bottom_right, [10, 10]);
        }

        #[test]
        fn accepts_camel_case_aliases() {
            let part: ManifestPart = serde_json::from_value(json!({
                "label": "organs",
                "binaryType": "numeric_label_mask",
                "labelMap": {"1": "liver"},
                "probabilityThreshold": 0.2,
                "shape": {"width": 2, "height": 2}
            }))
            .unwrap();
            assert_eq!(part.binary_type, BinaryType::NumericLabelMask);
            assert_eq!(part.binary_data_shape, Some(Shape::new(2, 2, 1, 1)));
            assert!(part.label_map.is_some());
            assert!(part.extra.is_empty());
        }

        #[test]
        fn rejects_unknown_binary_type() {
            let result: std::result::Result<ManifestPart, _> =
                serde_json::from_value(json!({"label": "x", "binary_type": "sample_hdf5"}));
            assert!(result.is_err());
        }

        #[test]
        fn dicom_carrying_types() {
            assert!(BinaryType::DicomSecondaryCapture.is_dicom());
            assert!(BinaryType::DicomGsps.is_dicom());
            assert!(!BinaryType::Heatmap.is_dicom());
            assert_eq!(BinaryType::Dicom.mime_type(), "application/dicom");
            assert_eq!(BinaryType::BooleanMask.mime_type(), "application/binary");
        }

        #[test]
        fn target_uid_from_dicom_image() {
            let part: ManifestPart = serde_json::from_value(json!({
                "binary_type": "boolean_mask",
                "dicom_image": {"SOPInstanceUID": "1.2"}
            }))
            .unwrap();
            assert_eq!(part.target_uid(), Some("1.2"));
        }

        #[test]
        fn parses_palettes() {
            let manifest: ResponseManifest = serde_json::from_value(json!({
                "protocol_version": "1.0",
                "parts": [],
                "palettes": {
                    "gray": {"type": "anchorpoints", "data": [
                        {"threshold": 0.0, "color": [0, 0, 0, 255]},
                        {"threshold": 1.0, "color": [255, 255, 255, 255]}
                    ]}
                }
            }))
            .unwrap();
            let Palette::Anchorpoints { data } = &manifest.palettes["gray"] else {
                panic!("expected anchorpoints palette");
            };
            assert_eq!(data.len(), 2);
        }

        #[test]
        fn mask_threshold_defaults_to_128() {
            assert_eq!(mask("m", 1, 1).mask_threshold(), 128.0);
            assert_eq!(
                mask("m", 1, 1).with_probability_threshold(0.5).mask_threshold(),
                127.5
            );
        }

        #[test]
        fn serialization_omits_empty_optionals() {
            let text = String::from_utf8(ResponseManifest::default().to_vec().unwrap()).unwrap();
            assert_eq!(text, r#"{"protocol_version":"1.0","parts":[]}"#);
        }
    }

    // =========================================================================
    // Label Map Tests
    // =========================================================================

    mod label_map_tests {
        use super::*;

        fn labelled(labels: &[(&str, &str)]) -> ManifestPart {
            ManifestPart::new("organs", BinaryType::NumericLabelMask)
                .with_label_map(labels.iter().map(|&(k, v)| (k, v)))
        }

        #[test]
        fn valid_map_covers_mask() {
            let map = labelled(&[("1", "liver"), ("2", "kidney")])
                .validated_label_map(2)
                .unwrap();
            assert_eq!(map[&2], "kidney");
        }

        #[test]
        fn missing_map_is_rejected() {
            let err = ManifestPart::new("organs", BinaryType::NumericLabelMask)
                .validated_label_map(0)
                .unwrap_err();
            assert!(err.is_part_local());
        }

        #[test]
        fn map_must_cover_mask_max() {
            let err = labelled(&[("1", "liver")]).validated_label_map(3).unwrap_err();
            assert!(matches!(err, Error::LabelMapValidation { .. }));
        }

        #[test]
        fn keys_must_be_integers() {
            assert!(labelled(&[("one", "liver")]).validated_label_map(0).is_err());
        }

        #[test]
        fn names_must_be_unique() {
            assert!(
                labelled(&[("1", "liver"), ("2", "liver")])
                    .validated_label_map(2)
                    .is_err()
            );
        }
    }

    // =========================================================================
    // Pairing Tests
    // =========================================================================

    mod pairing_tests {
        use super::*;

        #[test]
        fn positional_pairing_requires_equal_counts() {
            let parts = vec![mask("a", 1, 1)];
            let buffers: Vec<Vec<u8>> = vec![vec![0], vec![1]];
            let err = pair_positional(&parts, &buffers).unwrap_err();
            assert!(matches!(err, Error::ManifestMismatch(_)));
        }

        #[test]
        fn filtered_pairing_separates_datasets() {
            let parts = vec![
                mask("a", 2, 1),
                ManifestPart::new("sc", BinaryType::DicomSecondaryCapture),
                mask("b", 1, 1),
            ];
            let buffers = vec![vec![0u8, 255], b"DICM".to_vec(), vec![7]];
            let pairing = pair_filtered(&parts, &buffers).unwrap();

            assert_eq!(pairing.masks.len(), 2);
            assert_eq!(pairing.masks[1].mask_index, 1);
            assert_eq!(pairing.masks[1].paired.index, 2);
            assert_eq!(pairing.masks[1].paired.buffer, &[7]);
            assert_eq!(pairing.datasets.len(), 1);
            assert_eq!(pairing.datasets[0].buffer, b"DICM");
        }

        #[test]
        fn unshaped_mask_is_a_mismatch() {
            let parts = vec![ManifestPart::new("a", BinaryType::BooleanMask)];
            let buffers = vec![vec![0u8]];
            assert!(matches!(
                pair_filtered(&parts, &buffers),
                Err(Error::ManifestMismatch(_))
            ));
        }

        #[test]
        fn buffer_length_must_match_shape() {
            let parts = vec![mask("a", 4, 4)];
            let buffers = vec![vec![0u8; 15]];
            assert!(pair_filtered(&parts, &buffers).is_err());
        }

        #[test]
        fn empty_manifest_pairs_nothing() {
            let pairing = pair_filtered::<Vec<u8>>(&[], &[]).unwrap();
            assert!(pairing.masks.is_empty());
            assert!(pairing.datasets.is_empty());
        }
    }

    // =========================================================================
    // Request Manifest Tests
    // =========================================================================

    mod request_tests {
        use super::*;
        use std::path::PathBuf;

        fn instance(position: Option<[f64; 3]>) -> ImageInstance {
            ImageInstance {
                instance_uid: "1".to_string(),
                series_uid: "2".to_string(),
                position,
                orientation: None,
                instance_number: None,
                timepoint: None,
                source_path: PathBuf::from("a.dcm"),
                dataset_path: PathBuf::from("a.dcm"),
            }
        }

        #[test]
        fn command_selection() {
            let flat = instance(None);
            let spatial = instance(Some([0.0; 3]));
            assert_eq!(
                InferenceCommand::select(ModelKind::Segmentation, Some(&flat)),
                InferenceCommand::ProbabilityMask2d
            );
            assert_eq!(
                InferenceCommand::select(ModelKind::Segmentation, Some(&spatial)),
                InferenceCommand::ProbabilityMask3d
            );
            assert_eq!(
                InferenceCommand::select(ModelKind::BoundingBox, Some(&spatial)),
                InferenceCommand::BoundingBox2d
            );
            assert_eq!(
                InferenceCommand::select(ModelKind::Other, None),
                InferenceCommand::Other
            );
        }

        #[test]
        fn serializes_wire_names() {
            let manifest = RequestManifest::new("/", InferenceCommand::ProbabilityMask3d)
                .with_field("studyUID", "1.2.3");
            let value = serde_json::to_value(&manifest).unwrap();
            assert_eq!(
                value,
                json!({
                    "request": "post",
                    "route": "/",
                    "inference_command": "get-probability-mask-3D",
                    "studyUID": "1.2.3"
                })
            );
        }
    }
}
