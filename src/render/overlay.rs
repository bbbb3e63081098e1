//! Flat-color mask blending.

use image::{Rgb, RgbImage};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Colors of the first six masks, in order.
const BASE_COLORS: [[u8; 3]; 6] = [
    [255, 0, 0],
    [0, 255, 0],
    [0, 0, 255],
    [255, 255, 0],
    [255, 0, 255],
    [0, 255, 255],
];

/// Overlay color for mask `index`. Indices past the base colors get a color
/// drawn from an RNG seeded with the index.
pub fn mask_color(index: usize) -> [u8; 3] {
    if let Some(color) = BASE_COLORS.get(index) {
        return *color;
    }
    let mut rng = StdRng::seed_from_u64(index as u64);
    [
        rng.gen_range(0..255),
        rng.gen_range(0..255),
        rng.gen_range(0..255),
    ]
}

pub fn blend(pixel: &mut Rgb<u8>, color: [u8; 3], alpha: f64) {
    for (channel, c) in pixel.0.iter_mut().zip(color) {
        let mixed = f64::from(*channel) * (1.0 - alpha) + f64::from(c) * alpha;
        *channel = mixed.round().clamp(0.0, 255.0) as u8;
    }
}

/// Blend `color` into every pixel whose mask value satisfies `hit`.
///
/// `mask` holds one value per pixel in row-major order.
pub fn apply_mask(
    image: &mut RgbImage,
    mask: &[u8],
    color: [u8; 3],
    alpha: f64,
    hit: impl Fn(u8) -> bool,
) -> usize {
    let mut blended = 0;
    for (pixel, &value) in image.pixels_mut().zip(mask) {
        if hit(value) {
            blend(pixel, color, alpha);
            blended += 1;
        }
    }
    blended
}

/// Blend each nonzero label value `n` with `mask_color(n)`.
pub fn apply_label_mask(image: &mut RgbImage, mask: &[u8], alpha: f64) -> usize {
    let mut blended = 0;
    for (pixel, &value) in image.pixels_mut().zip(mask) {
        if value != 0 {
            blend(pixel, mask_color(usize::from(value)), alpha);
            blended += 1;
        }
    }
    blended
}
