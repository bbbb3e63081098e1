//! Minimal single-frame DICOM datasets built from raw 8-bit pixels.

use std::path::Path;

use dicom::core::{DataElement, PrimitiveValue, VR};
use dicom::dictionary_std::{tags, uids};
use dicom::object::{DefaultDicomObject, FileMetaTableBuilder, InMemDicomObject};

use crate::error::{Error, Result};

/// Generate a fresh UID under the UUID-derived `2.25` root.
pub fn new_uid() -> String {
    format!("2.25.{}", uuid::Uuid::new_v4().as_u128())
}

/// Builder for a monochrome secondary capture instance.
#[derive(Debug, Clone)]
pub struct SyntheticInstance {
    columns: u16,
    rows: u16,
    pixels: Vec<u8>,
    instance_uid: Option<String>,
    series_uid: Option<String>,
    position: Option<[f64; 3]>,
    orientation: Option<[f64; 6]>,
    instance_number: Option<i32>,
}

impl SyntheticInstance {
    /// `pixels` holds `columns * rows` samples in row-major order.
    pub fn new(columns: u16, rows: u16, pixels: Vec<u8>) -> Self {
        Self {
            columns,
            rows,
            pixels,
            instance_uid: None,
            series_uid: None,
            position: None,
            orientation: None,
            instance_number: None,
        }
    }

    pub fn instance_uid(mut self, uid: impl Into<String>) -> Self {
        self.instance_uid = Some(uid.into());
        self
    }

    pub fn series_uid(mut self, uid: impl Into<String>) -> Self {
        self.series_uid = Some(uid.into());
        self
    }

    pub fn position(mut self, position: [f64; 3]) -> Self {
        self.position = Some(position);
        self
    }

    pub fn orientation(mut self, orientation: [f64; 6]) -> Self {
        self.orientation = Some(orientation);
        self
    }

    pub fn instance_number(mut self, number: i32) -> Self {
        self.instance_number = Some(number);
        self
    }

    pub fn build(self) -> Result<DefaultDicomObject> {
        let expected = usize::from(self.columns) * usize::from(self.rows);
        if self.pixels.len() != expected {
            return Err(Error::Dicom(format!(
                "expected {expected} pixels for a {}x{} image, got {}",
                self.columns,
                self.rows,
                self.pixels.len()
            )));
        }

        let instance_uid = self.instance_uid.unwrap_or_else(new_uid);
        let series_uid = self.series_uid.unwrap_or_else(new_uid);

        let mut obj = InMemDicomObject::new_empty();
        put_str(&mut obj, tags::SOP_CLASS_UID, VR::UI, uids::SECONDARY_CAPTURE_IMAGE_STORAGE);
        put_str(&mut obj, tags::SOP_INSTANCE_UID, VR::UI, &instance_uid);
        put_str(&mut obj, tags::STUDY_INSTANCE_UID, VR::UI, &new_uid());
        put_str(&mut obj, tags::SERIES_INSTANCE_UID, VR::UI, &series_uid);
        put_str(&mut obj, tags::MODALITY, VR::CS, "OT");

        if let Some(number) = self.instance_number {
            put_str(&mut obj, tags::INSTANCE_NUMBER, VR::IS, &number.to_string());
        }
        if let Some(p) = self.position {
            put_str(&mut obj, tags::IMAGE_POSITION_PATIENT, VR::DS, &join_ds(&p));
        }
        if let Some(o) = self.orientation {
            put_str(&mut obj, tags::IMAGE_ORIENTATION_PATIENT, VR::DS, &join_ds(&o));
        }

        put_u16(&mut obj, tags::SAMPLES_PER_PIXEL, 1);
        put_str(&mut obj, tags::PHOTOMETRIC_INTERPRETATION, VR::CS, "MONOCHROME2");
        put_u16(&mut obj, tags::ROWS, self.rows);
        put_u16(&mut obj, tags::COLUMNS, self.columns);
        put_u16(&mut obj, tags::BITS_ALLOCATED, 8);
        put_u16(&mut obj, tags::BITS_STORED, 8);
        put_u16(&mut obj, tags::HIGH_BIT, 7);
        put_u16(&mut obj, tags::PIXEL_REPRESENTATION, 0);
        obj.put(DataElement::new(
            tags::PIXEL_DATA,
            VR::OB,
            PrimitiveValue::from(self.pixels),
        ));

        obj.with_meta(
            FileMetaTableBuilder::new()
                .transfer_syntax(uids::EXPLICIT_VR_LITTLE_ENDIAN)
                .media_storage_sop_class_uid(uids::SECONDARY_CAPTURE_IMAGE_STORAGE)
                .media_storage_sop_instance_uid(instance_uid),
        )
        .map_err(Error::dicom)
    }

    pub fn write_to(self, path: &Path) -> Result<()> {
        self.build()?.write_to_file(path).map_err(Error::dicom)
    }

    /// Encode as a complete DICOM file, preamble included.
    pub fn to_bytes(self) -> Result<Vec<u8>> {
        let obj = self.build()?;
        let mut bytes = Vec::new();
        obj.write_all(&mut bytes).map_err(Error::dicom)?;
        Ok(bytes)
    }
}

fn put_str(obj: &mut InMemDicomObject, tag: dicom::core::Tag, vr: VR, value: &str) {
    obj.put(DataElement::new(tag, vr, PrimitiveValue::from(value)));
}

fn put_u16(obj: &mut InMemDicomObject, tag: dicom::core::Tag, value: u16) {
    obj.put(DataElement::new(tag, VR::US, PrimitiveValue::from(value)));
}

fn join_ds(values: &[f64]) -> String {
    values
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join("\\")
}
