//! Detection overlay and event classification.
//!
//! The annotator filters detections by the confidence threshold (inclusive), draws a
//! box and a `"<class> <conf>"` label for each survivor, and reports whether the
//! frame is a fall event. Text is rendered with a small built-in 5x7 bitmap font.

use anyhow::{anyhow, Result};

use crate::detect::{Detection, FallClass};
use crate::frame::Frame;

pub const FALL_COLOR: [u8; 3] = [255, 0, 0];
pub const NONFALL_COLOR: [u8; 3] = [0, 255, 0];

const BOX_THICKNESS: i32 = 2;
const LABEL_SCALE: i32 = 1;
const BANNER_SCALE: i32 = 2;
const BANNER_ORIGIN: (i32, i32) = (10, 40);
const GLYPH_WIDTH: i32 = 5;
const GLYPH_HEIGHT: i32 = 7;

/// Result of annotating one frame.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Annotation {
    /// Highest qualifying fall confidence; `Some` makes this an event frame.
    pub event_confidence: Option<f32>,
    /// Detections that met the threshold and were drawn.
    pub drawn: usize,
}

impl Annotation {
    pub fn is_event(&self) -> bool {
        self.event_confidence.is_some()
    }
}

#[derive(Clone, Copy, Debug)]
pub struct Annotator {
    threshold: f32,
}

impl Annotator {
    pub fn new(threshold: f32) -> Result<Self> {
        if !(0.0..=1.0).contains(&threshold) {
            return Err(anyhow!(
                "confidence threshold must be within [0, 1], got {}",
                threshold
            ));
        }
        Ok(Self { threshold })
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub fn qualifies(&self, confidence: f32) -> bool {
        confidence >= self.threshold
    }

    /// Draw qualifying detections onto `frame` and classify it.
    ///
    /// Nonfall and sub-threshold detections never suppress a qualifying fall.
    pub fn annotate(&self, frame: &mut Frame, detections: &[Detection]) -> Annotation {
        let mut annotation = Annotation::default();
        for detection in detections {
            if !self.qualifies(detection.confidence) {
                continue;
            }
            let class = detection.class();
            let color = match class {
                FallClass::Fall => FALL_COLOR,
                FallClass::NonFall => NONFALL_COLOR,
            };
            let b = detection.bbox;
            for inset in 0..BOX_THICKNESS {
                draw_rectangle(frame, b.x1 + inset, b.y1 + inset, b.x2 - inset, b.y2 - inset, color);
            }
            let label = format!("{} {:.2}", class.label(), detection.confidence);
            let label_top = (b.y1 - 10 - GLYPH_HEIGHT).max(0);
            draw_text(frame, b.x1, label_top, &label, color, LABEL_SCALE);
            annotation.drawn += 1;

            if class == FallClass::Fall {
                annotation.event_confidence = Some(match annotation.event_confidence {
                    Some(best) => best.max(detection.confidence),
                    None => detection.confidence,
                });
            }
        }
        annotation
    }

    /// Stamp the `FALL DETECTED <timestamp>` banner in the top-left corner.
    pub fn draw_banner(&self, frame: &mut Frame, timestamp: &str) {
        let (x, baseline) = BANNER_ORIGIN;
        let top = baseline - GLYPH_HEIGHT * BANNER_SCALE;
        draw_text(
            frame,
            x,
            top,
            &format!("FALL DETECTED {}", timestamp),
            FALL_COLOR,
            BANNER_SCALE,
        );
    }
}

fn draw_rectangle(frame: &mut Frame, left: i32, top: i32, right: i32, bottom: i32, color: [u8; 3]) {
    if right < left || bottom < top {
        return;
    }
    let width = frame.width as i32;
    let height = frame.height as i32;
    for x in left.max(0)..=right.min(width - 1) {
        frame.put_pixel(x, top, color);
        frame.put_pixel(x, bottom, color);
    }
    for y in top.max(0)..=bottom.min(height - 1) {
        frame.put_pixel(left, y, color);
        frame.put_pixel(right, y, color);
    }
}

/// Render `text` with its top-left corner at (x, y); unknown glyphs advance blank.
fn draw_text(frame: &mut Frame, mut x: i32, y: i32, text: &str, color: [u8; 3], scale: i32) {
    for ch in text.chars().flat_map(|c| c.to_uppercase()) {
        if let Some(glyph) = glyph_bits(ch) {
            for (row, pattern) in glyph.iter().enumerate() {
                for col in 0..GLYPH_WIDTH {
                    if (pattern >> (GLYPH_WIDTH - 1 - col)) & 1 == 0 {
                        continue;
                    }
                    let px = x + col * scale;
                    let py = y + row as i32 * scale;
                    for dy in 0..scale {
                        for dx in 0..scale {
                            frame.put_pixel(px + dx, py + dy, color);
                        }
                    }
                }
            }
        }
        x += (GLYPH_WIDTH + 1) * scale;
    }
}

fn glyph_bits(ch: char) -> Option<[u8; 7]> {
    match ch {
        'A' => Some([0b01110, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001]),
        'C' => Some([0b01110, 0b10001, 0b10000, 0b10000, 0b10000, 0b10001, 0b01110]),
        'D' => Some([0b11110, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b11110]),
        'E' => Some([0b11111, 0b10000, 0b11110, 0b10000, 0b10000, 0b10000, 0b11111]),
        'F' => Some([0b11111, 0b10000, 0b11110, 0b10000, 0b10000, 0b10000, 0b10000]),
        'L' => Some([0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b11111]),
        'N' => Some([0b10001, 0b11001, 0b10101, 0b10101, 0b10011, 0b10001, 0b10001]),
        'O' => Some([0b01110, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110]),
        'T' => Some([0b11111, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100]),
        '0' => Some([0b01110, 0b10001, 0b10011, 0b10101, 0b11001, 0b10001, 0b01110]),
        '1' => Some([0b00100, 0b01100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110]),
        '2' => Some([0b01110, 0b10001, 0b00001, 0b00010, 0b00100, 0b01000, 0b11111]),
        '3' => Some([0b11110, 0b00001, 0b00001, 0b01110, 0b00001, 0b00001, 0b11110]),
        '4' => Some([0b00010, 0b00110, 0b01010, 0b10010, 0b11111, 0b00010, 0b00010]),
        '5' => Some([0b11111, 0b10000, 0b11110, 0b00001, 0b00001, 0b10001, 0b01110]),
        '6' => Some([0b00110, 0b01000, 0b10000, 0b11110, 0b10001, 0b10001, 0b01110]),
        '7' => Some([0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b01000, 0b01000]),
        '8' => Some([0b01110, 0b10001, 0b10001, 0b01110, 0b10001, 0b10001, 0b01110]),
        '9' => Some([0b01110, 0b10001, 0b10001, 0b01111, 0b00001, 0b00010, 0b01100]),
        '.' => Some([0, 0, 0, 0, 0, 0b00110, 0b00110]),
        ':' => Some([0, 0b00110, 0b00110, 0, 0b00110, 0b00110, 0]),
        '-' => Some([0, 0, 0, 0b11111, 0, 0, 0]),
        ' ' => Some([0; 7]),
        _ => None,
    }
}
