//! 2-D bounding box outlines and labels.

use ab_glyph::FontRef;
use image::{Rgb, RgbImage};

use super::text;
use crate::protocol::manifest::BoundingBox;

pub const BOX_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
pub const LINE_WIDTH: i64 = 5;
/// Label size is the box height divided by this.
const LABEL_HEIGHT_DIVISOR: u64 = 20;
const MIN_LABEL_SCALE: f32 = 8.0;

/// Draw the outline of `bbox` with its label centered inside.
pub fn draw_box(image: &mut RgbImage, bbox: &BoundingBox, font: &FontRef<'_>) {
    draw_outline(image, bbox);
    if bbox.label.is_empty() {
        return;
    }
    let [x0, y0] = bbox.top_left;
    let [x1, y1] = bbox.bottom_right;
    let scale = ((y0.abs_diff(y1) / LABEL_HEIGHT_DIVISOR) as f32)
        .max(MIN_LABEL_SCALE)
        .min(image.height().max(1) as f32);
    let center = (midpoint(x0, x1), midpoint(y0, y1));
    text::draw_centered(image, font, BOX_COLOR, scale, center, &bbox.label);
}

/// Draw the outline of `bbox` centered on its edges, clipped to the image.
pub fn draw_outline(image: &mut RgbImage, bbox: &BoundingBox) {
    let [x0, y0] = bbox.top_left;
    let [x1, y1] = bbox.bottom_right;
    let (left, right) = (x0.min(x1), x0.max(x1));
    let (top, bottom) = (y0.min(y1), y0.max(y1));
    let half = LINE_WIDTH / 2;
    let (outer_left, outer_right) = (left.saturating_sub(half), right.saturating_add(half));
    let (outer_top, outer_bottom) = (top.saturating_sub(half), bottom.saturating_add(half));

    // Top, bottom, left, right.
    fill_rect(image, outer_left, outer_top, outer_right, top.saturating_add(half));
    fill_rect(image, outer_left, bottom.saturating_sub(half), outer_right, outer_bottom);
    fill_rect(image, outer_left, outer_top, left.saturating_add(half), outer_bottom);
    fill_rect(image, right.saturating_sub(half), outer_top, outer_right, outer_bottom);
}

fn midpoint(a: i64, b: i64) -> i64 {
    a.min(b) + (a.abs_diff(b) / 2) as i64
}

/// Fill the inclusive rectangle `[x0, x1] x [y0, y1]`.
fn fill_rect(image: &mut RgbImage, x0: i64, y0: i64, x1: i64, y1: i64) {
    let (width, height) = (i64::from(image.width()), i64::from(image.height()));
    if width == 0 || height == 0 {
        return;
    }
    let (x0, x1) = (x0.max(0), x1.min(width - 1));
    let (y0, y1) = (y0.max(0), y1.min(height - 1));
    for y in y0..=y1 {
        for x in x0..=x1 {
            image.put_pixel(x as u32, y as u32, BOX_COLOR);
        }
    }
}
