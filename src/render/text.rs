//! Text drawn onto overlays: bounding-box labels and classification results.

use ab_glyph::{FontRef, PxScale};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_text_mut, text_size};
use serde_json::Value;

use crate::error::Result;

const FONT_DATA: &[u8] = include_bytes!("../../assets/DejaVuSansMono.ttf");

pub const TEXT_COLOR: Rgb<u8> = Rgb([255, 255, 255]);
pub const CLASSIFICATION_SCALE: f32 = 11.0;
pub const LINE_HEIGHT: i32 = 12;
const MARGIN: i32 = 5;
const INDENT: i32 = 5;

pub const STUDY_TITLE: &str = "Study level classification prediction:";
pub const SERIES_TITLE: &str = "Series level classification prediction:";

/// The bundled label font.
pub fn font() -> Result<FontRef<'static>> {
    Ok(FontRef::try_from_slice(FONT_DATA)?)
}

/// Draw `text` with its extent centered on `center`. Text falling entirely
/// outside the image is skipped.
pub fn draw_centered(
    image: &mut RgbImage,
    font: &FontRef<'_>,
    color: Rgb<u8>,
    scale: f32,
    center: (i64, i64),
    text: &str,
) {
    let scale = PxScale::from(scale);
    let (width, height) = text_size(scale, font, text);
    let (width, height) = (i64::from(width), i64::from(height));
    let x = center.0.saturating_sub(width / 2);
    let y = center.1.saturating_sub(height / 2);
    let visible = x.saturating_add(width) >= 0
        && y.saturating_add(height) >= 0
        && x < i64::from(image.width())
        && y < i64::from(image.height());
    if !visible {
        return;
    }
    // Bounded by the image on one side and the text extent on the other.
    draw_text_mut(image, color, x as i32, y as i32, scale, font, text);
}

/// One `key: value` line per entry of a classification object.
pub fn classification_lines(labels: &Value) -> Vec<String> {
    match labels {
        Value::Object(map) => map
            .iter()
            .map(|(key, value)| format!("{key}: {}", plain(value)))
            .collect(),
        Value::Null => Vec::new(),
        other => vec![plain(other)],
    }
}

fn plain(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Draw classification results at the top left of `image`.
///
/// `study` is drawn first when given. `series` is the whole series-level
/// object, keyed by SeriesInstanceUID; only the entry for `series_uid` is
/// listed, under a title that is drawn even when the entry is missing.
pub fn draw_classification(
    image: &mut RgbImage,
    font: &FontRef<'_>,
    study: Option<&Value>,
    series: Option<&Value>,
    series_uid: &str,
) {
    let mut y = 0;
    if let Some(study) = study {
        y = draw_block(image, font, y, STUDY_TITLE, study);
    }
    if let Some(series) = series {
        let labels = series.get(series_uid).unwrap_or(&Value::Null);
        draw_block(image, font, y, SERIES_TITLE, labels);
    }
}

fn draw_block(
    image: &mut RgbImage,
    font: &FontRef<'_>,
    mut y: i32,
    title: &str,
    labels: &Value,
) -> i32 {
    draw_text_mut(image, TEXT_COLOR, MARGIN, y, CLASSIFICATION_SCALE, font, title);
    y += LINE_HEIGHT;
    for line in classification_lines(labels) {
        draw_text_mut(
            image,
            TEXT_COLOR,
            MARGIN + INDENT,
            y,
            CLASSIFICATION_SCALE,
            font,
            &line,
        );
        y += LINE_HEIGHT;
    }
    y
}
