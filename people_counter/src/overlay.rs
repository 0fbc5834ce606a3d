//! Annotation of frames with detections and stats.
use std::{path::Path, time::Duration};

use anyhow::{Context, Result};
use image::{Rgb, RgbImage};
use imageproc::{
    drawing::{draw_hollow_rect_mut, draw_text_mut},
    rect::Rect,
};
use rusttype::{Font, Scale};

use crate::ssd::Detection;

const GREEN: Rgb<u8> = Rgb([0, 255, 0]);
const TEXT_SCALE: Scale = Scale { x: 16.0, y: 16.0 };
const TEXT_X: i32 = 20;
// Baselines of the count and latency lines
const COUNT_BASELINE: i32 = 25;
const LATENCY_BASELINE: i32 = 50;

fn top_from_baseline(baseline: i32, ascent: f32) -> i32 {
    baseline - ascent.round() as i32
}

pub struct Overlay {
    font: Option<Font<'static>>,
}

impl Overlay {
    /// Create an overlay, text is only drawn when the font at `font_path` can be loaded.
    pub fn new(font_path: &Path) -> Self {
        match load_font(font_path) {
            Ok(font) => Self { font: Some(font) },
            Err(err) => {
                log::warn!("No text overlay: {err:#}");
                Self::without_text()
            }
        }
    }

    pub fn without_text() -> Self {
        Self { font: None }
    }

    /// Draw bounding boxes, the person count and the inference time onto the frame.
    pub fn annotate(
        &self,
        frame: &mut RgbImage,
        detections: &[Detection],
        inference_time: Duration,
    ) {
        let (width, height) = frame.dimensions();

        for detection in detections {
            // Coordinate frame basis is on the top left corner
            let (x_min, y_min, x_max, y_max) = detection.bbox.to_pixels(width, height);
            let rect = Rect::at(x_min, y_min).of_size(
                (x_max - x_min).max(1) as u32,
                (y_max - y_min).max(1) as u32,
            );
            draw_hollow_rect_mut(frame, rect, GREEN);
        }

        if let Some(font) = &self.font {
            // imageproc positions text by its top edge
            let ascent = font.v_metrics(TEXT_SCALE).ascent;
            draw_text_mut(
                frame,
                GREEN,
                TEXT_X,
                top_from_baseline(COUNT_BASELINE, ascent),
                TEXT_SCALE,
                font,
                &format!("Current count number {}", detections.len()),
            );
            draw_text_mut(
                frame,
                GREEN,
                TEXT_X,
                top_from_baseline(LATENCY_BASELINE, ascent),
                TEXT_SCALE,
                font,
                &format!(
                    "Inference time: {:.3}ms",
                    inference_time.as_secs_f64() * 1000.0
                ),
            );
        }
    }
}

fn load_font(path: &Path) -> Result<Font<'static>> {
    let font_data = std::fs::read(path)
        .with_context(|| format!("failed to read font {}", path.display()))?;
    Font::try_from_vec(font_data).with_context(|| format!("invalid font {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssd::BBox;

    #[test]
    fn test_draws_box_outline() {
        let mut frame = RgbImage::new(100, 50);
        let detection = Detection {
            label: 1,
            confidence: 0.9,
            bbox: BBox {
                x_min: 0.1,
                y_min: 0.2,
                x_max: 0.5,
                y_max: 0.8,
            },
        };

        Overlay::without_text().annotate(&mut frame, &[detection], Duration::from_millis(3));

        assert_eq!(*frame.get_pixel(10, 10), GREEN);
        assert_eq!(*frame.get_pixel(49, 39), GREEN);
        assert_eq!(*frame.get_pixel(30, 25), Rgb([0, 0, 0]));
    }

    #[test]
    fn test_degenerate_box_does_not_panic() {
        let mut frame = RgbImage::new(10, 10);
        let detection = Detection {
            label: 1,
            confidence: 0.9,
            bbox: BBox {
                x_min: 0.5,
                y_min: 0.5,
                x_max: 0.5,
                y_max: 0.2,
            },
        };

        Overlay::without_text().annotate(&mut frame, &[detection], Duration::ZERO);
        assert_eq!(*frame.get_pixel(5, 5), GREEN);
    }

    #[test]
    fn test_text_sits_on_baseline() {
        assert_eq!(top_from_baseline(COUNT_BASELINE, 12.4), 13);
        assert_eq!(top_from_baseline(LATENCY_BASELINE, 12.6), 37);
    }

    #[test]
    fn test_text_drawn_above_baseline_if_font_available() {
        let font_path = Path::new("/usr/share/fonts/truetype/dejavu/DejaVuSansMono.ttf");
        let overlay = Overlay::new(font_path);
        if overlay.font.is_none() {
            println!("Skipping, no font at {}", font_path.display());
            return;
        }

        let mut frame = RgbImage::new(320, 60);
        overlay.annotate(&mut frame, &[], Duration::from_millis(12));

        let text_rows: Vec<u32> = (0..frame.height())
            .filter(|y| (0..frame.width()).any(|x| frame.get_pixel(x, *y)[1] > 0))
            .collect();
        assert!(!text_rows.is_empty());
        // Text stays between the top margin and just below the second baseline
        assert!(text_rows.iter().any(|y| *y < COUNT_BASELINE as u32));
        assert!(text_rows.iter().all(|y| *y < LATENCY_BASELINE as u32 + 6));
        assert!(text_rows.iter().all(|y| *y >= 5));
    }

    #[test]
    fn test_missing_font_disables_text() {
        let overlay = Overlay::new(Path::new("no/such/font.ttf"));
        assert!(overlay.font.is_none());
    }
}
