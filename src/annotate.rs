//! Frame annotation: match markers, count overlay, JPEG encoding

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::capture::frame::Frame;
use crate::error::AnnotateError;
use crate::matcher::FrameMatches;

/// Annotation knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnnotateConfig {
    /// JPEG quality of the published stream, 1-100.
    pub jpeg_quality: u8,
    /// Draw a marker at every matched frame keypoint.
    pub draw_keypoints: bool,
    /// Integer scale of the overlay glyphs.
    pub text_scale: u32,
}

impl Default for AnnotateConfig {
    fn default() -> Self {
        Self {
            jpeg_quality: 90,
            draw_keypoints: true,
            text_scale: 2,
        }
    }
}

/// Per-slot marker colors, cycled by slot index.
const PALETTE: [[u8; 3]; 4] = [
    [0, 255, 0],
    [255, 128, 0],
    [64, 160, 255],
    [255, 64, 255],
];

const GLYPH_W: u32 = 5;
const GLYPH_H: u32 = 7;

/// Stateless renderer: copies the frame, draws markers and per-slot counts, and
/// encodes the result. The input frame is never touched.
pub fn annotate(
    frame: &Frame,
    matches: &FrameMatches,
    config: &AnnotateConfig,
) -> Result<Bytes, AnnotateError> {
    let mut canvas = frame.pixels.data.to_vec();
    let width = frame.pixels.width;
    let height = frame.pixels.height;

    let mut cursor_y = 4u32;
    for (index, (slot, result)) in matches.slots.iter().enumerate() {
        let color = PALETTE[index % PALETTE.len()];

        if config.draw_keypoints {
            for pair in &result.good {
                draw_circle(
                    &mut canvas,
                    width,
                    height,
                    pair.frame.x as i32,
                    pair.frame.y as i32,
                    4,
                    color,
                );
            }
        }

        let label = format!("{}: {}", slot, result.count());
        draw_text(
            &mut canvas,
            width,
            height,
            4,
            cursor_y,
            &label,
            config.text_scale.max(1),
            color,
        );
        cursor_y += (GLYPH_H + 2) * config.text_scale.max(1);
    }

    encode_jpeg(&canvas, width, height, config.jpeg_quality)
}

/// Encode an RGB24 canvas to JPEG at the configured quality.
pub fn encode_jpeg(
    rgb: &[u8],
    width: u32,
    height: u32,
    quality: u8,
) -> Result<Bytes, AnnotateError> {
    let mut out = Vec::with_capacity(rgb.len() / 4);
    let mut encoder =
        image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100));
    encoder
        .encode(rgb, width, height, image::ExtendedColorType::Rgb8)
        .map_err(|e| AnnotateError::EncodingFailed(e.to_string()))?;
    Ok(Bytes::from(out))
}

#[inline]
fn put_pixel(canvas: &mut [u8], width: u32, height: u32, x: i32, y: i32, color: [u8; 3]) {
    if x < 0 || y < 0 || x >= width as i32 || y >= height as i32 {
        return;
    }
    let idx = (y as usize * width as usize + x as usize) * 3;
    canvas[idx..idx + 3].copy_from_slice(&color);
}

/// Midpoint circle outline.
fn draw_circle(
    canvas: &mut [u8],
    width: u32,
    height: u32,
    cx: i32,
    cy: i32,
    radius: i32,
    color: [u8; 3],
) {
    let mut x = radius;
    let mut y = 0;
    let mut err = 1 - radius;
    while x >= y {
        for (px, py) in [
            (cx + x, cy + y),
            (cx - x, cy + y),
            (cx + x, cy - y),
            (cx - x, cy - y),
            (cx + y, cy + x),
            (cx - y, cy + x),
            (cx + y, cy - x),
            (cx - y, cy - x),
        ] {
            put_pixel(canvas, width, height, px, py, color);
        }
        y += 1;
        if err < 0 {
            err += 2 * y + 1;
        } else {
            x -= 1;
            err += 2 * (y - x) + 1;
        }
    }
}

fn draw_text(
    canvas: &mut [u8],
    width: u32,
    height: u32,
    x: u32,
    y: u32,
    text: &str,
    scale: u32,
    color: [u8; 3],
) {
    let mut cx = x;
    for ch in text.chars() {
        if let Some(glyph) = glyph_rows(ch) {
            for (row, bits) in glyph.iter().enumerate() {
                for col in 0..GLYPH_W {
                    if bits & (0b10000 >> col) == 0 {
                        continue;
                    }
                    for sy in 0..scale {
                        for sx in 0..scale {
                            put_pixel(
                                canvas,
                                width,
                                height,
                                (cx + col * scale + sx) as i32,
                                (y + row as u32 * scale + sy) as i32,
                                color,
                            );
                        }
                    }
                }
            }
        }
        cx += (GLYPH_W + 1) * scale;
    }
}

/// 5x7 glyphs for the overlay: digits, lowercase ascii and a little punctuation.
/// Unknown characters render as a blank advance.
fn glyph_rows(ch: char) -> Option<[u8; 7]> {
    let rows = match ch {
        '0' => [0x0E, 0x11, 0x13, 0x15, 0x19, 0x11, 0x0E],
        '1' => [0x04, 0x0C, 0x04, 0x04, 0x04, 0x04, 0x0E],
        '2' => [0x0E, 0x11, 0x01, 0x02, 0x04, 0x08, 0x1F],
        '3' => [0x1F, 0x02, 0x04, 0x02, 0x01, 0x11, 0x0E],
        '4' => [0x02, 0x06, 0x0A, 0x12, 0x1F, 0x02, 0x02],
        '5' => [0x1F, 0x10, 0x1E, 0x01, 0x01, 0x11, 0x0E],
        '6' => [0x06, 0x08, 0x10, 0x1E, 0x11, 0x11, 0x0E],
        '7' => [0x1F, 0x01, 0x02, 0x04, 0x08, 0x08, 0x08],
        '8' => [0x0E, 0x11, 0x11, 0x0E, 0x11, 0x11, 0x0E],
        '9' => [0x0E, 0x11, 0x11, 0x0F, 0x01, 0x02, 0x0C],
        'a' => [0x00, 0x00, 0x0E, 0x01, 0x0F, 0x11, 0x0F],
        'b' => [0x10, 0x10, 0x1E, 0x11, 0x11, 0x11, 0x1E],
        'c' => [0x00, 0x00, 0x0E, 0x10, 0x10, 0x11, 0x0E],
        'd' => [0x01, 0x01, 0x0F, 0x11, 0x11, 0x11, 0x0F],
        'e' => [0x00, 0x00, 0x0E, 0x11, 0x1F, 0x10, 0x0E],
        'f' => [0x06, 0x09, 0x08, 0x1C, 0x08, 0x08, 0x08],
        'g' => [0x00, 0x0F, 0x11, 0x0F, 0x01, 0x11, 0x0E],
        'h' => [0x10, 0x10, 0x1E, 0x11, 0x11, 0x11, 0x11],
        'i' => [0x04, 0x00, 0x0C, 0x04, 0x04, 0x04, 0x0E],
        'j' => [0x02, 0x00, 0x06, 0x02, 0x02, 0x12, 0x0C],
        'k' => [0x10, 0x10, 0x12, 0x14, 0x18, 0x14, 0x12],
        'l' => [0x0C, 0x04, 0x04, 0x04, 0x04, 0x04, 0x0E],
        'm' => [0x00, 0x00, 0x1A, 0x15, 0x15, 0x15, 0x15],
        'n' => [0x00, 0x00, 0x1E, 0x11, 0x11, 0x11, 0x11],
        'o' => [0x00, 0x00, 0x0E, 0x11, 0x11, 0x11, 0x0E],
        'p' => [0x00, 0x1E, 0x11, 0x1E, 0x10, 0x10, 0x10],
        'q' => [0x00, 0x0F, 0x11, 0x0F, 0x01, 0x01, 0x01],
        'r' => [0x00, 0x00, 0x16, 0x19, 0x10, 0x10, 0x10],
        's' => [0x00, 0x00, 0x0F, 0x10, 0x0E, 0x01, 0x1E],
        't' => [0x08, 0x08, 0x1C, 0x08, 0x08, 0x09, 0x06],
        'u' => [0x00, 0x00, 0x11, 0x11, 0x11, 0x13, 0x0D],
        'v' => [0x00, 0x00, 0x11, 0x11, 0x11, 0x0A, 0x04],
        'w' => [0x00, 0x00, 0x15, 0x15, 0x15, 0x15, 0x0A],
        'x' => [0x00, 0x00, 0x11, 0x0A, 0x04, 0x0A, 0x11],
        'y' => [0x00, 0x11, 0x11, 0x0F, 0x01, 0x11, 0x0E],
        'z' => [0x00, 0x00, 0x1F, 0x02, 0x04, 0x08, 0x1F],
        ':' => [0x00, 0x0C, 0x0C, 0x00, 0x0C, 0x0C, 0x00],
        '.' => [0x00, 0x00, 0x00, 0x00, 0x00, 0x0C, 0x0C],
        '-' => [0x00, 0x00, 0x00, 0x1F, 0x00, 0x00, 0x00],
        '_' => [0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x1F],
        '/' => [0x01, 0x01, 0x02, 0x04, 0x08, 0x10, 0x10],
        ' ' => return None,
        _ => return None,
    };
    Some(rows)
}
