//! Semantic face parsing (BiSeNet, 19 CelebAMask-HQ labels).
//!
//! A [`LabelMap`] is the per-pixel class of an image. Masks for the face,
//! hair and neck regions are unions of label sets over that map.

use crate::imaging;
use image::{imageops, imageops::FilterType, GrayImage, Luma, Rgb, RgbImage};
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

// --- Named constants ---
const BISENET_INPUT_SIZE: u32 = 512;
const BISENET_NUM_CLASSES: usize = 19;
const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];
/// Hair below this fraction of the image is treated as absent.
const MIN_HAIR_COVERAGE: f32 = 0.01;
const HAIR_DILATE_ITERATIONS: u32 = 2;

pub mod labels {
    pub const BACKGROUND: u8 = 0;
    pub const SKIN: u8 = 1;
    pub const LEFT_BROW: u8 = 2;
    pub const RIGHT_BROW: u8 = 3;
    pub const LEFT_EYE: u8 = 4;
    pub const RIGHT_EYE: u8 = 5;
    pub const GLASSES: u8 = 6;
    pub const LEFT_EAR: u8 = 7;
    pub const RIGHT_EAR: u8 = 8;
    pub const EARRING: u8 = 9;
    pub const NOSE: u8 = 10;
    pub const MOUTH: u8 = 11;
    pub const UPPER_LIP: u8 = 12;
    pub const LOWER_LIP: u8 = 13;
    pub const NECK: u8 = 14;
    pub const NECKLACE: u8 = 15;
    pub const CLOTH: u8 = 16;
    pub const HAIR: u8 = 17;
    pub const HAT: u8 = 18;
}

/// Facial features, excluding glasses and accessories.
pub const FACE_LABELS: &[u8] = &[
    labels::SKIN,
    labels::LEFT_BROW,
    labels::RIGHT_BROW,
    labels::LEFT_EYE,
    labels::RIGHT_EYE,
    labels::LEFT_EAR,
    labels::RIGHT_EAR,
    labels::NOSE,
    labels::MOUTH,
    labels::UPPER_LIP,
    labels::LOWER_LIP,
];
pub const HAIR_LABELS: &[u8] = &[labels::HAIR];
pub const NECK_LABELS: &[u8] = &[labels::NECK];

/// Face labels plus hair and/or neck when requested.
pub fn region_labels(include_hair: bool, include_neck: bool) -> Vec<u8> {
    let mut set = FACE_LABELS.to_vec();
    if include_hair {
        set.extend_from_slice(HAIR_LABELS);
    }
    if include_neck {
        set.extend_from_slice(NECK_LABELS);
    }
    set
}

#[derive(Error, Debug)]
pub enum ParserError {
    #[error("model file not found: {0} (place bisenet_face.onnx in the model dir)")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Per-pixel semantic labels at image resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct LabelMap {
    width: u32,
    height: u32,
    labels: Vec<u8>,
}

impl LabelMap {
    /// `labels` is row-major and must hold exactly `width * height` entries.
    pub fn new(width: u32, height: u32, labels: Vec<u8>) -> Option<Self> {
        if labels.len() != width as usize * height as usize {
            return None;
        }
        Some(Self { width, height, labels })
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn label_at(&self, x: u32, y: u32) -> u8 {
        self.labels[(y * self.width + x) as usize]
    }

    /// Binary mask (0/255) of every pixel whose label is in `set`.
    pub fn union_mask(&self, set: &[u8]) -> GrayImage {
        GrayImage::from_fn(self.width, self.height, |x, y| {
            if set.contains(&self.label_at(x, y)) {
                Luma([255])
            } else {
                Luma([0])
            }
        })
    }

    /// Fraction of pixels whose label is in `set`.
    pub fn coverage(&self, set: &[u8]) -> f32 {
        if self.labels.is_empty() {
            return 0.0;
        }
        let n = self.labels.iter().filter(|l| set.contains(l)).count();
        n as f32 / self.labels.len() as f32
    }

    /// Nearest-neighbour resample to a new size.
    pub fn resized(&self, width: u32, height: u32) -> LabelMap {
        if (width, height) == (self.width, self.height) {
            return self.clone();
        }
        let mut labels = Vec::with_capacity(width as usize * height as usize);
        for y in 0..height {
            let sy = ((y as u64 * self.height as u64) / height.max(1) as u64) as u32;
            for x in 0..width {
                let sx = ((x as u64 * self.width as u64) / width.max(1) as u64) as u32;
                labels.push(self.label_at(sx.min(self.width - 1), sy.min(self.height - 1)));
            }
        }
        LabelMap { width, height, labels }
    }
}

/// Anything that can produce a label map for an image.
pub trait FaceParser {
    /// The returned map has the same dimensions as `image`.
    fn parse(&mut self, image: &RgbImage) -> Result<LabelMap, ParserError>;
}

/// BiSeNet face parser.
pub struct BiSeNetParser {
    session: Session,
}

impl BiSeNetParser {
    pub fn load(model_path: &str) -> Result<Self, ParserError> {
        if !Path::new(model_path).exists() {
            return Err(ParserError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = model_path,
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded BiSeNet model"
        );

        Ok(Self { session })
    }
}

impl FaceParser for BiSeNetParser {
    fn parse(&mut self, image: &RgbImage) -> Result<LabelMap, ParserError> {
        let size = BISENET_INPUT_SIZE;
        let resized = imageops::resize(image, size, size, FilterType::Triangle);
        let input = imaging::rgb_to_nchw(&resized, 1.0 / 255.0, IMAGENET_MEAN, IMAGENET_STD);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, logits) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| ParserError::InferenceFailed(format!("parsing logits: {e}")))?;

        let plane = (size * size) as usize;
        if logits.len() != BISENET_NUM_CLASSES * plane {
            return Err(ParserError::InferenceFailed(format!(
                "expected {BISENET_NUM_CLASSES}x{size}x{size} logits, got {} values",
                logits.len()
            )));
        }

        let map = LabelMap {
            width: size,
            height: size,
            labels: argmax_labels(logits, BISENET_NUM_CLASSES, plane),
        };
        Ok(map.resized(image.width(), image.height()))
    }
}

/// Per-pixel argmax over a (C, H*W) logit block.
fn argmax_labels(logits: &[f32], classes: usize, plane: usize) -> Vec<u8> {
    (0..plane)
        .map(|i| {
            let mut best = 0usize;
            let mut best_val = f32::NEG_INFINITY;
            for c in 0..classes {
                let v = logits[c * plane + i];
                if v > best_val {
                    best_val = v;
                    best = c;
                }
            }
            best as u8
        })
        .collect()
}

/// Hair pixels of a source face on a neutral-gray canvas.
#[derive(Debug, Clone)]
pub struct HairRegion {
    pub image: RgbImage,
    pub mask: GrayImage,
    /// Raw hair-label coverage before cleanup.
    pub coverage: f32,
}

impl HairRegion {
    /// Keep the hair of `image` and paint everything else gray.
    ///
    /// Returns `None` when hair covers under 1% of the image.
    pub fn extract(image: &RgbImage, map: &LabelMap) -> Option<HairRegion> {
        let coverage = map.coverage(HAIR_LABELS);
        if coverage < MIN_HAIR_COVERAGE {
            tracing::debug!(coverage, "hair region: not enough hair");
            return None;
        }
        let mask = map.resized(image.width(), image.height()).union_mask(HAIR_LABELS);
        let mask = imaging::dilate_iterations(&imaging::fill_holes(&mask), HAIR_DILATE_ITERATIONS);
        let gray = Rgb([imaging::NEUTRAL_GRAY; 3]);
        let region = RgbImage::from_fn(image.width(), image.height(), |x, y| {
            if mask.get_pixel(x, y)[0] > 0 {
                *image.get_pixel(x, y)
            } else {
                gray
            }
        });
        tracing::debug!(coverage, "hair region extracted");
        Some(HairRegion { image: region, mask, coverage })
    }
}
