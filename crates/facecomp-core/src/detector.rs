//! Face localization.
//!
//! [`FaceLocator`] is what the mask, paste and refinement stages need: all faces
//! in an RGB image, plus the largest one. [`FaceDetector`] implements it with
//! an SCRFD network run through ONNX Runtime.

use crate::types::{self, BoundingBox};
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

// --- Named constants ---
const DET_INPUT_SIDE: u32 = 640;
const DET_PIXEL_MEAN: f32 = 127.5;
const DET_PIXEL_SCALE: f32 = 1.0 / 128.0;
const DET_MIN_SCORE: f32 = 0.5;
const DET_MAX_OVERLAP: f32 = 0.4;
const DET_STRIDES: [u32; 3] = [8, 16, 32];
const DET_ANCHORS_PER_CELL: usize = 2;
const DET_HEAD_OUTPUTS: usize = 9;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0} (download det_10g.onnx from insightface into the model dir)")]
    ModelNotFound(String),
    #[error("unexpected detector output: {0}")]
    Output(String),
    #[error("image is empty")]
    EmptyImage,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Anything that can find faces in an RGB image.
pub trait FaceLocator {
    /// All faces, sorted by confidence (highest first).
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError>;

    /// The single largest face by box area, if any.
    fn largest_face(&mut self, image: &RgbImage) -> Result<Option<BoundingBox>, DetectorError> {
        let faces = self.detect(image)?;
        Ok(types::largest(&faces).cloned())
    }
}

/// Placement of the scaled image inside the square network input.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Letterbox {
    scale: f32,
    left: u32,
    top: u32,
    width: u32,
    height: u32,
}

impl Letterbox {
    fn fit(src_width: u32, src_height: u32, side: u32) -> Self {
        let scale = (side as f32 / src_width as f32).min(side as f32 / src_height as f32);
        let width = ((src_width as f32 * scale).round() as u32).clamp(1, side);
        let height = ((src_height as f32 * scale).round() as u32).clamp(1, side);
        Self {
            scale,
            left: (side - width) / 2,
            top: (side - height) / 2,
            width,
            height,
        }
    }

    /// Map a point in network-input space back onto the source image.
    fn to_source(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.left as f32) / self.scale, (y - self.top as f32) / self.scale)
    }
}

/// Which session output holds each head, per stride slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct HeadLayout {
    scores: [usize; 3],
    boxes: [usize; 3],
    points: [usize; 3],
}

impl HeadLayout {
    /// insightface's export order: all score maps, then boxes, then keypoints.
    const POSITIONAL: Self = Self {
        scores: [0, 1, 2],
        boxes: [3, 4, 5],
        points: [6, 7, 8],
    };

    /// Use `score_8`/`bbox_16`/`kps_32`-style names when every head has one.
    fn from_output_names(names: &[String]) -> Self {
        let lookup = |kind: &str| -> Option<[usize; 3]> {
            let mut slots = [0usize; 3];
            for (slot, stride) in slots.iter_mut().zip(DET_STRIDES) {
                let wanted = format!("{kind}_{stride}");
                *slot = names.iter().position(|n| *n == wanted)?;
            }
            Some(slots)
        };

        match (lookup("score"), lookup("bbox"), lookup("kps")) {
            (Some(scores), Some(boxes), Some(points)) => Self { scores, boxes, points },
            _ => {
                tracing::debug!(?names, "detector outputs unnamed, assuming positional layout");
                Self::POSITIONAL
            }
        }
    }
}

/// Raw head outputs for one stride level.
struct StrideHead<'a> {
    stride: u32,
    scores: &'a [f32],
    boxes: &'a [f32],
    points: &'a [f32],
}

impl StrideHead<'_> {
    /// Push every anchor above `min_score` onto `out`, in source-image coordinates.
    ///
    /// Boxes are distances from the anchor centre to each edge, keypoints are
    /// offsets from it, both in units of the stride.
    fn decode(&self, side: u32, min_score: f32, letterbox: &Letterbox, out: &mut Vec<BoundingBox>) {
        let cols = (side / self.stride) as usize;
        let anchors = cols * cols * DET_ANCHORS_PER_CELL;
        let s = self.stride as f32;

        for (i, &score) in self.scores.iter().take(anchors).enumerate() {
            if score <= min_score {
                continue;
            }
            let Some(edges) = self.boxes.get(i * 4..i * 4 + 4) else {
                continue;
            };
            let cell = i / DET_ANCHORS_PER_CELL;
            let ax = (cell % cols) as f32 * s;
            let ay = (cell / cols) as f32 * s;

            let (x0, y0) = letterbox.to_source(ax - edges[0] * s, ay - edges[1] * s);
            let (x1, y1) = letterbox.to_source(ax + edges[2] * s, ay + edges[3] * s);
            let landmarks = self.points.get(i * 10..i * 10 + 10).map(|p| {
                std::array::from_fn(|k| letterbox.to_source(ax + p[2 * k] * s, ay + p[2 * k + 1] * s))
            });

            out.push(BoundingBox {
                x: x0,
                y: y0,
                width: x1 - x0,
                height: y1 - y0,
                confidence: score,
                landmarks,
            });
        }
    }
}

/// Greedy non-maximum suppression. The result is sorted by confidence.
fn suppress_overlaps(mut candidates: Vec<BoundingBox>, max_overlap: f32) -> Vec<BoundingBox> {
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut kept: Vec<BoundingBox> = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        if kept.iter().all(|k| k.iou(&candidate) <= max_overlap) {
            kept.push(candidate);
        }
    }
    kept
}

/// Letterbox `image` into a normalized `1×3×side×side` tensor.
///
/// Padding takes the mean pixel value, which normalizes to zero.
fn to_input_tensor(image: &RgbImage, side: u32) -> (Array4<f32>, Letterbox) {
    let fit = Letterbox::fit(image.width(), image.height(), side);
    let scaled = imageops::resize(image, fit.width, fit.height, FilterType::Triangle);
    let n = side as usize;

    let tensor = Array4::from_shape_fn((1, 3, n, n), |(_, c, y, x)| {
        let (x, y) = (x as u32, y as u32);
        let inside = x >= fit.left && x < fit.left + fit.width && y >= fit.top && y < fit.top + fit.height;
        if inside {
            let value = scaled.get_pixel(x - fit.left, y - fit.top)[c] as f32;
            (value - DET_PIXEL_MEAN) * DET_PIXEL_SCALE
        } else {
            0.0
        }
    });
    (tensor, fit)
}

/// SCRFD face detector.
pub struct FaceDetector {
    session: Session,
    layout: HeadLayout,
}

impl FaceDetector {
    /// Load the SCRFD ONNX model from the given path.
    pub fn load(model_path: &str) -> Result<Self, DetectorError> {
        if !Path::new(model_path).exists() {
            return Err(DetectorError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        if names.len() < DET_HEAD_OUTPUTS {
            return Err(DetectorError::Output(format!(
                "expected {DET_HEAD_OUTPUTS} outputs (score, bbox and kps per stride), model has {}",
                names.len()
            )));
        }
        let layout = HeadLayout::from_output_names(&names);

        tracing::info!(path = model_path, outputs = ?names, ?layout, "loaded SCRFD model");
        Ok(Self { session, layout })
    }
}

impl FaceLocator for FaceDetector {
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError> {
        if image.width() == 0 || image.height() == 0 {
            return Err(DetectorError::EmptyImage);
        }
        let (input, letterbox) = to_input_tensor(image, DET_INPUT_SIDE);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let view = |idx: usize| {
            outputs[idx]
                .try_extract_tensor::<f32>()
                .map(|(_, data)| data)
                .map_err(|e| DetectorError::Output(format!("output {idx}: {e}")))
        };

        let mut candidates = Vec::new();
        for (slot, stride) in DET_STRIDES.into_iter().enumerate() {
            let head = StrideHead {
                stride,
                scores: view(self.layout.scores[slot])?,
                boxes: view(self.layout.boxes[slot])?,
                points: view(self.layout.points[slot])?,
            };
            head.decode(DET_INPUT_SIDE, DET_MIN_SCORE, &letterbox, &mut candidates);
        }

        let faces = suppress_overlaps(candidates, DET_MAX_OVERLAP);
        tracing::debug!(faces = faces.len(), "faces detected");
        Ok(faces)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scored(x: f32, y: f32, side: f32, confidence: f32) -> BoundingBox {
        BoundingBox {
            confidence,
            ..BoundingBox::new(x, y, side, side)
        }
    }

    fn identity_fit() -> Letterbox {
        Letterbox {
            scale: 1.0,
            left: 0,
            top: 0,
            width: DET_INPUT_SIDE,
            height: DET_INPUT_SIDE,
        }
    }

    #[test]
    fn test_letterbox_landscape_portrait() {
        let fit = Letterbox::fit(1280, 960, 640);
        assert_eq!((fit.width, fit.height, fit.left, fit.top), (640, 480, 0, 80));
        let (x, y) = fit.to_source(320.0, 320.0);
        assert!((x - 640.0).abs() < 1e-3 && (y - 480.0).abs() < 1e-3);
    }

    #[test]
    fn test_head_layout_from_shuffled_names() {
        let names: Vec<String> = ["kps_8", "bbox_8", "score_8", "kps_16", "bbox_16", "score_16", "kps_32", "bbox_32", "score_32"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let layout = HeadLayout::from_output_names(&names);
        assert_eq!(layout.scores, [2, 5, 8]);
        assert_eq!(layout.boxes, [1, 4, 7]);
        assert_eq!(layout.points, [0, 3, 6]);
    }

    #[test]
    fn test_head_layout_numeric_names_are_positional() {
        let names: Vec<String> = (440..449).map(|i: usize| i.to_string()).collect();
        assert_eq!(HeadLayout::from_output_names(&names), HeadLayout::POSITIONAL);
    }

    #[test]
    fn test_decode_one_confident_anchor() {
        // stride 32 on 640: a 20×20 grid, two anchors per cell
        let anchor = (5 * 20 + 10) * DET_ANCHORS_PER_CELL;
        let mut scores = vec![0.1f32; 800];
        scores[anchor] = 0.9;
        scores[anchor + 1] = 0.5;
        let mut boxes = vec![0.0f32; 800 * 4];
        boxes[anchor * 4..anchor * 4 + 4].copy_from_slice(&[1.0, 1.0, 1.0, 2.0]);
        let points = vec![0.0f32; 800 * 10];

        let head = StrideHead {
            stride: 32,
            scores: &scores,
            boxes: &boxes,
            points: &points,
        };
        let mut out = Vec::new();
        head.decode(DET_INPUT_SIDE, DET_MIN_SCORE, &identity_fit(), &mut out);

        assert_eq!(out.len(), 1, "scores at the threshold are dropped");
        let face = &out[0];
        assert_eq!((face.x, face.y, face.width, face.height), (288.0, 128.0, 64.0, 96.0));
        assert_eq!(face.landmarks.unwrap()[2], (320.0, 160.0));
    }

    #[test]
    fn test_decode_missing_keypoints_leaves_landmarks_empty() {
        let scores = vec![0.8f32; 2];
        let boxes = vec![0.5f32; 8];
        let head = StrideHead {
            stride: 8,
            scores: &scores,
            boxes: &boxes,
            points: &[],
        };
        let mut out = Vec::new();
        head.decode(DET_INPUT_SIDE, DET_MIN_SCORE, &identity_fit(), &mut out);
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|f| f.landmarks.is_none()));
    }

    #[test]
    fn test_suppression_keeps_strongest_per_face() {
        let faces = suppress_overlaps(
            vec![
                scored(300.0, 300.0, 60.0, 0.7),
                scored(0.0, 0.0, 100.0, 0.8),
                scored(4.0, 4.0, 100.0, 0.95),
            ],
            DET_MAX_OVERLAP,
        );
        let confidences: Vec<f32> = faces.iter().map(|f| f.confidence).collect();
        assert_eq!(confidences, vec![0.95, 0.7]);
        assert!(suppress_overlaps(Vec::new(), DET_MAX_OVERLAP).is_empty());
    }

    #[test]
    fn test_input_tensor_pads_with_zero() {
        let image = RgbImage::from_pixel(20, 10, image::Rgb([255, 255, 255]));
        let (tensor, fit) = to_input_tensor(&image, DET_INPUT_SIDE);
        assert_eq!(tensor.shape(), &[1, 3, 640, 640]);
        assert_eq!((fit.top, fit.height), (160, 320));
        assert_eq!(tensor[[0, 1, 10, 320]], 0.0);
        assert!((tensor[[0, 1, 320, 320]] - 127.5 / 128.0).abs() < 1e-4);
    }

    #[test]
    fn test_largest_face_by_area() {
        struct Fixed(Vec<BoundingBox>);
        impl FaceLocator for Fixed {
            fn detect(&mut self, _: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError> {
                Ok(self.0.clone())
            }
        }
        let img = RgbImage::new(4, 4);
        let mut two = Fixed(vec![scored(0.0, 0.0, 10.0, 0.99), scored(40.0, 40.0, 50.0, 0.6)]);
        let face = two.largest_face(&img).unwrap().unwrap();
        assert_eq!(face.width, 50.0);
        assert!(Fixed(vec![]).largest_face(&img).unwrap().is_none());
    }
}
