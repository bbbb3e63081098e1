//! Extraction of renderable 8-bit pixels from DICOM datasets.
//!
//! Normalization steps, in order:
//! 1. `PALETTE COLOR` data is expanded through the embedded color LUT.
//! 2. `YBR_FULL` / `YBR_FULL_422` data is converted to RGB by the pixel data decoder and the
//!    dataset's PhotometricInterpretation is rewritten to `RGB`.
//! 3. Single-channel `MONOCHROME1` / `MONOCHROME2` data is replicated to 3 channels.
//! 4. Unsigned 16-bit samples are rescaled with `v * 256 / max`.
//! 5. Signed 16-bit samples are shifted by the minimum and rescaled with `256 / (max - min)`.
//!
//! Photometric interpretation, planar configuration and pixel representation are read from the
//! decoded pixel data, not from the dataset tags. Encapsulated color data is already RGB once
//! decoded.

use dicom::core::{DataElement, PrimitiveValue, Tag, VR};
use dicom::dictionary_std::tags;
use dicom::object::{DefaultDicomObject, InMemDicomObject};
use dicom_pixeldata::image::DynamicImage;
use dicom_pixeldata::{
    PhotometricInterpretation, PixelDecoder, PixelRepresentation, PlanarConfiguration,
};
use image::RgbImage;
use tracing::debug;

use crate::error::{Error, Result};
use crate::loader::element_string;

/// Sample storage of a single decoded frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Samples {
    U8(Vec<u8>),
    U16(Vec<u16>),
    I16(Vec<i16>),
}

impl Samples {
    fn len(&self) -> usize {
        match self {
            Self::U8(v) => v.len(),
            Self::U16(v) => v.len(),
            Self::I16(v) => v.len(),
        }
    }

    fn value(&self, index: usize) -> i64 {
        match self {
            Self::U8(v) => i64::from(v[index]),
            Self::U16(v) => i64::from(v[index]),
            Self::I16(v) => i64::from(v[index]),
        }
    }
}

/// One channel of a palette color lookup table.
#[derive(Debug, Clone, PartialEq)]
pub struct LutChannel {
    pub first_mapped: i64,
    pub bits: u16,
    pub entries: Vec<u16>,
}

impl LutChannel {
    fn lookup(&self, value: i64) -> u16 {
        let last = self.entries.len().saturating_sub(1) as i64;
        let index = (value - self.first_mapped).clamp(0, last) as usize;
        self.entries.get(index).copied().unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PaletteLut {
    pub red: LutChannel,
    pub green: LutChannel,
    pub blue: LutChannel,
}

impl PaletteLut {
    fn apply(&self, samples: &Samples) -> Samples {
        let wide = [&self.red, &self.green, &self.blue]
            .iter()
            .any(|c| c.bits > 8);
        let mut out = Vec::with_capacity(samples.len() * 3);
        for i in 0..samples.len() {
            let v = samples.value(i);
            out.extend([
                self.red.lookup(v),
                self.green.lookup(v),
                self.blue.lookup(v),
            ]);
        }
        if wide {
            Samples::U16(out)
        } else {
            Samples::U8(out.into_iter().map(|v| v.min(255) as u8).collect())
        }
    }
}

/// First frame of a dataset before normalization.
#[derive(Debug, Clone, PartialEq)]
pub struct RawPixels {
    pub rows: u32,
    pub columns: u32,
    pub samples_per_pixel: u16,
    pub photometric: String,
    pub samples: Samples,
    pub palette: Option<PaletteLut>,
}

/// 8-bit pixels ready for compositing, interleaved by channel.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedPixels {
    pub rows: u32,
    pub columns: u32,
    /// 1 or 3.
    pub channels: u16,
    pub photometric: String,
    pub data: Vec<u8>,
}

impl NormalizedPixels {
    pub fn pixel_count(&self) -> usize {
        self.rows as usize * self.columns as usize
    }

    /// Convert into an RGB image, replicating single-channel data.
    pub fn into_rgb_image(self) -> Result<RgbImage> {
        let data = match self.channels {
            3 => self.data,
            1 => self.data.iter().flat_map(|&v| [v, v, v]).collect(),
            n => return Err(Error::Dicom(format!("cannot render {n}-channel pixel data"))),
        };
        RgbImage::from_raw(self.columns, self.rows, data)
            .ok_or_else(|| Error::Dicom("pixel buffer does not match image size".to_string()))
    }
}

/// Decode and normalize the first frame of `obj`.
///
/// Rewrites PhotometricInterpretation to `RGB` when the dataset declares YBR data.
pub fn get_pixels(obj: &mut DefaultDicomObject) -> Result<NormalizedPixels> {
    let raw = extract(obj)?;
    let normalized = normalize(raw)?;
    if normalized.photometric == "RGB" && is_ybr(&photometric_of(obj)) {
        obj.put(DataElement::new(
            tags::PHOTOMETRIC_INTERPRETATION,
            VR::CS,
            PrimitiveValue::from("RGB"),
        ));
    }
    Ok(normalized)
}

/// Decode the first frame of `obj`.
///
/// YBR color data comes back as RGB. Everything else is left as stored.
pub fn extract(obj: &DefaultDicomObject) -> Result<RawPixels> {
    let decoded = obj.decode_pixel_data().map_err(Error::dicom)?;
    let rows = decoded.rows();
    let columns = decoded.columns();
    let samples_per_pixel = decoded.samples_per_pixel();
    let photometric = decoded.photometric_interpretation().clone();

    if samples_per_pixel == 3
        && matches!(
            photometric,
            PhotometricInterpretation::YbrFull | PhotometricInterpretation::YbrFull422
        )
    {
        let samples = match decoded.to_dynamic_image(0).map_err(Error::dicom)? {
            DynamicImage::ImageRgb16(image) => Samples::U16(image.into_raw()),
            image => Samples::U8(image.into_rgb8().into_raw()),
        };
        return Ok(RawPixels {
            rows,
            columns,
            samples_per_pixel,
            photometric: PhotometricInterpretation::Rgb.as_str().to_string(),
            samples,
            palette: None,
        });
    }

    let signed = decoded.pixel_representation() == PixelRepresentation::Signed;
    let mut samples = match (decoded.bits_allocated(), signed) {
        (8, _) => Samples::U8(decoded.frame_data(0).map_err(Error::dicom)?.to_vec()),
        (16, false) => Samples::U16(decoded.frame_data_ow(0).map_err(Error::dicom)?),
        (16, true) => Samples::I16(
            decoded
                .frame_data_ow(0)
                .map_err(Error::dicom)?
                .into_iter()
                .map(|v| v as i16)
                .collect(),
        ),
        (bits, _) => {
            return Err(Error::Dicom(format!(
                "unsupported BitsAllocated {bits}"
            )));
        }
    };

    if samples_per_pixel == 3 && decoded.planar_configuration() == PlanarConfiguration::PixelFirst
    {
        samples = interleave_planes(samples);
    }

    let palette = if photometric == PhotometricInterpretation::PaletteColor {
        Some(read_palette(obj)?)
    } else {
        None
    };

    Ok(RawPixels {
        rows,
        columns,
        samples_per_pixel,
        photometric: photometric.as_str().to_string(),
        samples,
        palette,
    })
}

/// Apply the normalization rules to an extracted frame.
pub fn normalize(raw: RawPixels) -> Result<NormalizedPixels> {
    let RawPixels {
        rows,
        columns,
        samples_per_pixel,
        mut photometric,
        mut samples,
        palette,
    } = raw;
    let mut channels = samples_per_pixel;

    if photometric == "PALETTE COLOR" {
        let lut = palette.ok_or_else(|| {
            Error::Dicom("PALETTE COLOR image without a color lookup table".to_string())
        })?;
        samples = lut.apply(&samples);
        channels = 3;
        photometric = "RGB".to_string();
    } else if matches!(photometric.as_str(), "MONOCHROME1" | "MONOCHROME2") && channels == 1 {
        samples = replicate_channels(samples);
        channels = 3;
    }

    let data = match samples {
        Samples::U8(v) => v,
        Samples::U16(v) => rescale_unsigned(&v),
        Samples::I16(v) => rescale_signed(&v),
    };
    debug!("Normalized {columns}x{rows} {photometric} frame to {channels} channel(s)");

    Ok(NormalizedPixels {
        rows,
        columns,
        channels,
        photometric,
        data,
    })
}

fn is_ybr(photometric: &str) -> bool {
    matches!(photometric, "YBR_FULL" | "YBR_FULL_422")
}

fn photometric_of(obj: &InMemDicomObject) -> String {
    element_string(obj, tags::PHOTOMETRIC_INTERPRETATION).unwrap_or_default()
}

fn interleave_planes(samples: Samples) -> Samples {
    fn interleave<T: Copy>(planar: &[T]) -> Vec<T> {
        let plane = planar.len() / 3;
        (0..plane)
            .flat_map(|i| [planar[i], planar[plane + i], planar[2 * plane + i]])
            .collect()
    }
    match samples {
        Samples::U8(v) => Samples::U8(interleave(&v)),
        Samples::U16(v) => Samples::U16(interleave(&v)),
        Samples::I16(v) => Samples::I16(interleave(&v)),
    }
}

fn replicate_channels(samples: Samples) -> Samples {
    fn triple<T: Copy>(values: &[T]) -> Vec<T> {
        values.iter().flat_map(|&v| [v, v, v]).collect()
    }
    match samples {
        Samples::U8(v) => Samples::U8(triple(&v)),
        Samples::U16(v) => Samples::U16(triple(&v)),
        Samples::I16(v) => Samples::I16(triple(&v)),
    }
}

fn rescale_unsigned(values: &[u16]) -> Vec<u8> {
    let max = values.iter().copied().max().unwrap_or(0);
    if max == 0 {
        return vec![0; values.len()];
    }
    let scale = 256.0 / f64::from(max);
    values
        .iter()
        .map(|&v| (f64::from(v) * scale).min(255.0) as u8)
        .collect()
}

fn rescale_signed(values: &[i16]) -> Vec<u8> {
    let min = values.iter().copied().min().unwrap_or(0);
    let max = values.iter().copied().max().unwrap_or(0);
    if max == min {
        return vec![0; values.len()];
    }
    let scale = 256.0 / (f64::from(max) - f64::from(min));
    values
        .iter()
        .map(|&v| ((f64::from(v) - f64::from(min)) * scale).min(255.0) as u8)
        .collect()
}

fn read_palette(obj: &InMemDicomObject) -> Result<PaletteLut> {
    Ok(PaletteLut {
        red: read_lut_channel(
            obj,
            tags::RED_PALETTE_COLOR_LOOKUP_TABLE_DESCRIPTOR,
            tags::RED_PALETTE_COLOR_LOOKUP_TABLE_DATA,
        )?,
        green: read_lut_channel(
            obj,
            tags::GREEN_PALETTE_COLOR_LOOKUP_TABLE_DESCRIPTOR,
            tags::GREEN_PALETTE_COLOR_LOOKUP_TABLE_DATA,
        )?,
        blue: read_lut_channel(
            obj,
            tags::BLUE_PALETTE_COLOR_LOOKUP_TABLE_DESCRIPTOR,
            tags::BLUE_PALETTE_COLOR_LOOKUP_TABLE_DATA,
        )?,
    })
}

fn read_lut_channel(obj: &InMemDicomObject, descriptor: Tag, data: Tag) -> Result<LutChannel> {
    let descriptor: Vec<i64> = obj
        .element(descriptor)
        .map_err(Error::dicom)?
        .to_multi_int::<i64>()
        .map_err(Error::dicom)?;
    let [count, first_mapped, bits] = descriptor[..] else {
        return Err(Error::Dicom(format!(
            "palette descriptor must have 3 values, got {}",
            descriptor.len()
        )));
    };
    // A count of 0 stands for 2^16 entries.
    let count = if count == 0 { 65_536 } else { count as usize };

    let bytes = obj
        .element(data)
        .map_err(Error::dicom)?
        .to_bytes()
        .map_err(Error::dicom)?;
    let entries: Vec<u16> = if bits == 8 && bytes.len() == count {
        bytes.iter().map(|&b| u16::from(b)).collect()
    } else {
        bytes
            .chunks_exact(2)
            .map(|b| u16::from_le_bytes([b[0], b[1]]))
            .collect()
    };
    if entries.len() < count {
        return Err(Error::Dicom(format!(
            "palette holds {} entries, descriptor declares {count}",
            entries.len()
        )));
    }

    Ok(LutChannel {
        first_mapped,
        bits: bits as u16,
        entries,
    })
}
