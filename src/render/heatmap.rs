//! Palette evaluation and heat map blending.

use image::RgbImage;

use crate::error::{Error, Result};
use crate::protocol::manifest::{Anchor, Palette};

pub const LUT_SIZE: usize = 256;

/// RGBA color per mask value.
pub type Lut = [[u8; 4]; LUT_SIZE];

/// Evaluate a named palette into a 256-entry RGBA table.
pub fn evaluate_palette(name: &str, palette: &Palette) -> Result<Lut> {
    match palette {
        Palette::Anchorpoints { data } => interpolate_anchorpoints(name, data),
        Palette::Lut { data } => direct_lut(name, data),
    }
}

fn invalid(name: &str, reason: impl Into<String>) -> Error {
    Error::PaletteValidation {
        palette: name.to_string(),
        reason: reason.into(),
    }
}

fn rgba(name: &str, color: &[u8]) -> Result<[u8; 4]> {
    color.try_into().map_err(|_| {
        invalid(
            name,
            format!("colors need 4 channels, got {}", color.len()),
        )
    })
}

fn interpolate_anchorpoints(name: &str, anchors: &[Anchor]) -> Result<Lut> {
    let (Some(first), Some(last)) = (anchors.first(), anchors.last()) else {
        return Err(invalid(name, "no anchor points"));
    };
    if anchors.len() < 2 {
        return Err(invalid(name, "at least two anchor points are required"));
    }
    if first.threshold != 0.0 {
        return Err(invalid(
            name,
            format!("first threshold must be 0.0, got {}", first.threshold),
        ));
    }
    if last.threshold != 1.0 {
        return Err(invalid(
            name,
            format!("last threshold must be 1.0, got {}", last.threshold),
        ));
    }
    if anchors.windows(2).any(|w| w[1].threshold <= w[0].threshold) {
        return Err(invalid(name, "thresholds must be strictly increasing"));
    }
    let colors = anchors
        .iter()
        .map(|a| rgba(name, &a.color))
        .collect::<Result<Vec<_>>>()?;

    let mut lut = [[0u8; 4]; LUT_SIZE];
    let mut segment = 0;
    for (i, entry) in lut.iter_mut().enumerate() {
        let x = i as f64 / (LUT_SIZE - 1) as f64;
        while segment + 2 < anchors.len() && x > anchors[segment + 1].threshold {
            segment += 1;
        }
        let (t0, t1) = (anchors[segment].threshold, anchors[segment + 1].threshold);
        let f = ((x - t0) / (t1 - t0)).clamp(0.0, 1.0);
        let (c0, c1) = (colors[segment], colors[segment + 1]);
        for channel in 0..4 {
            let v = f64::from(c0[channel]) + f * (f64::from(c1[channel]) - f64::from(c0[channel]));
            entry[channel] = v.round().clamp(0.0, 255.0) as u8;
        }
    }
    Ok(lut)
}

fn direct_lut(name: &str, data: &[Vec<u8>]) -> Result<Lut> {
    if data.len() != LUT_SIZE {
        return Err(invalid(
            name,
            format!("lookup table needs {LUT_SIZE} entries, got {}", data.len()),
        ));
    }
    let mut lut = [[0u8; 4]; LUT_SIZE];
    for (entry, color) in lut.iter_mut().zip(data) {
        *entry = rgba(name, color)?;
    }
    Ok(lut)
}

/// Blend the LUT color of each mask value using its own alpha scaled by
/// `alpha`.
pub fn apply_heatmap(image: &mut RgbImage, mask: &[u8], lut: &Lut, alpha: f64) -> usize {
    let mut blended = 0;
    for (pixel, &value) in image.pixels_mut().zip(mask) {
        let [r, g, b, a] = lut[usize::from(value)];
        let weight = f64::from(a) / 255.0 * alpha;
        if weight == 0.0 {
            continue;
        }
        for (channel, c) in pixel.0.iter_mut().zip([r, g, b]) {
            let mixed = f64::from(*channel) * (1.0 - weight) + f64::from(c) * weight;
            *channel = mixed.round().clamp(0.0, 255.0) as u8;
        }
        blended += 1;
    }
    blended
}
