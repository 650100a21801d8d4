//! Identity face swap (InSwapper 128 / GHOST 256) via ONNX Runtime.
//!
//! The target face is aligned with the five-point template, swapped in the
//! canonical crop, and pasted back through the inverse transform.

use crate::alignment;
use crate::detector::{DetectorError, FaceDetector, FaceLocator};
use crate::imaging;
use crate::recognizer::{FaceRecognizer, RecognizerError};
use image::RgbImage;
use ndarray::Array2;
use ort::session::Session;
use ort::value::TensorRef;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

// --- Named constants ---
const PASTE_FEATHER: u32 = 21;

#[derive(Error, Debug)]
pub enum SwapError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("no face found in the generated image")]
    NoTargetFace,
    #[error("no face found in the source image")]
    NoSourceFace,
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer: {0}")]
    Recognizer(#[from] RecognizerError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Which swap network to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SwapModel {
    /// Fast general-purpose swapper, 128px crop, [0,1] input.
    #[default]
    InSwapper,
    /// Higher-quality alternative, 256px crop, [-1,1] input.
    Ghost,
}

impl SwapModel {
    pub fn file_name(&self) -> &'static str {
        match self {
            SwapModel::InSwapper => "inswapper_128.onnx",
            SwapModel::Ghost => "ghost_unet_2blocks.onnx",
        }
    }

    pub fn crop_size(&self) -> u32 {
        match self {
            SwapModel::InSwapper => 128,
            SwapModel::Ghost => 256,
        }
    }

    /// Value range of the network's image input and output.
    fn pixel_range(&self) -> (f32, f32) {
        match self {
            SwapModel::InSwapper => (0.0, 1.0),
            SwapModel::Ghost => (-1.0, 1.0),
        }
    }
}

impl std::fmt::Display for SwapModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SwapModel::InSwapper => f.write_str("inswapper"),
            SwapModel::Ghost => f.write_str("ghost"),
        }
    }
}

impl std::str::FromStr for SwapModel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "inswapper" | "inswapper_128" => Ok(SwapModel::InSwapper),
            "ghost" => Ok(SwapModel::Ghost),
            other => Err(format!("unknown swap model '{other}' (expected inswapper or ghost)")),
        }
    }
}

/// Puts the identity of `source` onto the largest face of `target`.
pub trait FaceSwapper {
    /// The network this swapper runs.
    fn model(&self) -> SwapModel;

    fn swap(&mut self, target: &RgbImage, source: &RgbImage) -> Result<RgbImage, SwapError>;
}

pub struct OnnxFaceSwapper {
    session: Session,
    model: SwapModel,
    /// Optional 512×512 projection applied to the identity before the swap.
    emap: Option<Array2<f32>>,
    detector: FaceDetector,
    recognizer: FaceRecognizer,
}

impl OnnxFaceSwapper {
    /// Load the swap network plus its own detector/recognizer pair.
    ///
    /// A raw little-endian f32 file next to the model with the extension
    /// `.emap` is used as the identity projection when present.
    pub fn load(
        model_path: &str,
        model: SwapModel,
        scrfd_path: &str,
        arcface_path: &str,
    ) -> Result<Self, SwapError> {
        if !Path::new(model_path).exists() {
            return Err(SwapError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = model_path,
            model = %model,
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            "loaded face swap model"
        );

        let emap_path = Path::new(model_path).with_extension("emap");
        let emap = if emap_path.exists() {
            Some(read_emap(&emap_path)?)
        } else {
            None
        };

        Ok(Self {
            session,
            model,
            emap,
            detector: FaceDetector::load(scrfd_path)?,
            recognizer: FaceRecognizer::load(arcface_path)?,
        })
    }
}

fn read_emap(path: &Path) -> Result<Array2<f32>, SwapError> {
    let bytes = std::fs::read(path)?;
    let values: Vec<f32> = bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect();
    Array2::from_shape_vec((512, 512), values)
        .map_err(|e| SwapError::InferenceFailed(format!("emap {}: {e}", path.display())))
}

/// Project the identity through `emap` (if any) and re-normalize.
fn swap_latent(identity: &[f32], emap: Option<&Array2<f32>>) -> Array2<f32> {
    let mut latent = Array2::from_shape_vec((1, identity.len()), identity.to_vec())
        .unwrap_or_else(|_| Array2::zeros((1, identity.len())));
    if let Some(emap) = emap {
        if emap.nrows() == identity.len() {
            latent = latent.dot(emap);
        }
    }
    let norm = latent.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        latent.mapv_inplace(|v| v / norm);
    }
    latent
}

impl FaceSwapper for OnnxFaceSwapper {
    fn model(&self) -> SwapModel {
        self.model
    }

    fn swap(&mut self, target: &RgbImage, source: &RgbImage) -> Result<RgbImage, SwapError> {
        let target_face = self.detector.largest_face(target)?.ok_or(SwapError::NoTargetFace)?;
        let landmarks = target_face.landmarks.ok_or(SwapError::NoTargetFace)?;
        let source_face = self.detector.largest_face(source)?.ok_or(SwapError::NoSourceFace)?;
        let identity = self.recognizer.extract(source, &source_face)?;

        let size = self.model.crop_size();
        let (crop, matrix) = alignment::align_face(target, &landmarks, size);

        let (lo, hi) = self.model.pixel_range();
        let span = hi - lo;
        let input = imaging::rgb_to_nchw(&crop, span / 255.0, [-lo; 3], [1.0; 3]);
        let latent = swap_latent(&identity.values, self.emap.as_ref());

        let outputs = self.session.run(ort::inputs![
            "target" => TensorRef::from_array_view(input.view())?,
            "source" => TensorRef::from_array_view(latent.view())?,
        ])?;
        let (_, data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| SwapError::InferenceFailed(format!("swap output: {e}")))?;

        let swapped = imaging::nchw_to_rgb(data, size as usize, size as usize, lo, hi)
            .ok_or_else(|| SwapError::InferenceFailed(format!("expected 3x{size}x{size} output")))?;

        tracing::debug!(model = %self.model, confidence = target_face.confidence, "face swapped");
        Ok(alignment::paste_back(target, &swapped, &matrix, PASTE_FEATHER))
    }
}
