//! Parsing of SSD `DetectionOutput` tensors.
//!
//! The tensor has shape `[1, 1, N, 7]`, every row being
//! `[image_id, label, confidence, x_min, y_min, x_max, y_max]` with coordinates normalized to the
//! image size. A negative `image_id` terminates the list of valid rows.
use anyhow::{bail, Result};
use ndarray::{ArrayViewD, Axis};

/// Bounding box with corners normalized to `[0, 1]`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BBox {
    pub x_min: f32,
    pub y_min: f32,
    pub x_max: f32,
    pub y_max: f32,
}

impl BBox {
    /// Scale to pixel coordinates `(x_min, y_min, x_max, y_max)` of a `width` x `height` frame.
    pub fn to_pixels(&self, width: u32, height: u32) -> (i32, i32, i32, i32) {
        let (width, height) = (width as f32, height as f32);
        let scale = |v: f32, size: f32| (v.clamp(0.0, 1.0) * size) as i32;

        (
            scale(self.x_min, width),
            scale(self.y_min, height),
            scale(self.x_max, width),
            scale(self.y_max, height),
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Detection {
    pub label: u32,
    pub confidence: f32,
    pub bbox: BBox,
}

/// Extract all detections more confident than `threshold`, optionally only of class `class_id`.
pub fn parse_detections(
    output: ArrayViewD<f32>,
    threshold: f32,
    class_id: Option<u32>,
) -> Result<Vec<Detection>> {
    if output.ndim() == 0 || output.shape()[output.ndim() - 1] != 7 {
        bail!(
            "expected detection rows of 7 values, got output of shape {:?}",
            output.shape()
        );
    }

    let num_rows = output.len() / 7;
    let rows = output.into_shape((num_rows, 7))?;

    let detections = rows
        .axis_iter(Axis(0))
        .take_while(|row| row[0] >= 0.0)
        .filter(|row| row[2] > threshold)
        .map(|row| Detection {
            label: row[1] as u32,
            confidence: row[2],
            bbox: BBox {
                x_min: row[3],
                y_min: row[4],
                x_max: row[5],
                y_max: row[6],
            },
        })
        .filter(|detection| class_id.map_or(true, |id| detection.label == id))
        .collect();

    Ok(detections)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array4;

    fn output(rows: &[[f32; 7]]) -> Array4<f32> {
        let flat: Vec<f32> = rows.iter().flatten().copied().collect();
        Array4::from_shape_vec((1, 1, rows.len(), 7), flat).unwrap()
    }

    #[test]
    fn test_threshold_is_exclusive() {
        let out = output(&[
            [0.0, 1.0, 0.9, 0.1, 0.1, 0.2, 0.4],
            [0.0, 1.0, 0.5, 0.5, 0.5, 0.6, 0.9],
            [0.0, 1.0, 0.2, 0.5, 0.5, 0.6, 0.9],
        ]);

        let detections = parse_detections(out.view().into_dyn(), 0.5, None).unwrap();
        assert_eq!(detections.len(), 1);
        assert_eq!(detections[0].confidence, 0.9);
        assert_eq!(detections[0].bbox.y_max, 0.4);
    }

    #[test]
    fn test_stops_at_end_marker() {
        let out = output(&[
            [0.0, 1.0, 0.9, 0.1, 0.1, 0.2, 0.4],
            [-1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
            [0.0, 1.0, 0.9, 0.5, 0.5, 0.6, 0.9],
        ]);

        let detections = parse_detections(out.view().into_dyn(), 0.5, None).unwrap();
        assert_eq!(detections.len(), 1);
    }

    #[test]
    fn test_class_filter() {
        let out = output(&[
            [0.0, 15.0, 0.9, 0.1, 0.1, 0.2, 0.4],
            [0.0, 7.0, 0.8, 0.5, 0.5, 0.6, 0.9],
        ]);

        let people = parse_detections(out.view().into_dyn(), 0.5, Some(15)).unwrap();
        assert_eq!(people.len(), 1);
        assert_eq!(people[0].label, 15);

        let all = parse_detections(out.view().into_dyn(), 0.5, None).unwrap();
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn test_wrong_row_width() {
        let out = ndarray::Array2::<f32>::zeros((3, 5));
        assert!(parse_detections(out.view().into_dyn(), 0.5, None).is_err());
    }

    #[test]
    fn test_to_pixels_truncates_and_clamps() {
        let bbox = BBox {
            x_min: -0.1,
            y_min: 0.25,
            x_max: 0.999,
            y_max: 1.5,
        };

        assert_eq!(bbox.to_pixels(768, 432), (0, 108, 767, 432));
    }
}
