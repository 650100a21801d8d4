//! Identity embeddings.
//!
//! The conditioning stage wants one vector per source face and the refiner
//! wants a similarity score between two faces; both come from ArcFace
//! (w600k_r50) run on a landmark-aligned 112×112 crop.

use crate::alignment;
use crate::detector::{DetectorError, FaceDetector, FaceLocator};
use crate::imaging;
use crate::types::{BoundingBox, Embedding};
use image::RgbImage;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

// --- Named constants ---
const ARCFACE_CROP: u32 = 112;
const ARCFACE_CENTER: f32 = 127.5;
pub const ARCFACE_EMBEDDING_DIM: usize = 512;
const ARCFACE_MODEL_VERSION: &str = "w600k_r50";

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("model file not found: {0} (download w600k_r50.onnx from insightface into the model dir)")]
    ModelNotFound(String),
    #[error("embedding output: {0}")]
    Output(String),
    #[error("face has no landmarks to align on")]
    NoLandmarks,
    #[error("no face found in source image")]
    NoFace,
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Produces the identity vector of the single largest face in an image.
pub trait IdentityExtractor {
    fn extract_identity(&mut self, image: &RgbImage) -> Result<Embedding, RecognizerError>;
}

/// ArcFace embedding network.
pub struct FaceRecognizer {
    session: Session,
}

impl FaceRecognizer {
    pub fn load(model_path: &str) -> Result<Self, RecognizerError> {
        if !Path::new(model_path).exists() {
            return Err(RecognizerError::ModelNotFound(model_path.to_string()));
        }
        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;
        tracing::info!(path = model_path, "loaded ArcFace model");
        Ok(Self { session })
    }

    /// Embed `face`, which must carry detector landmarks.
    pub fn extract(&mut self, image: &RgbImage, face: &BoundingBox) -> Result<Embedding, RecognizerError> {
        let landmarks = face.landmarks.as_ref().ok_or(RecognizerError::NoLandmarks)?;
        let (crop, _) = alignment::align_face(image, landmarks, ARCFACE_CROP);
        self.embed_crop(&crop)
    }

    fn embed_crop(&mut self, crop: &RgbImage) -> Result<Embedding, RecognizerError> {
        let input = arcface_input(crop);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| RecognizerError::Output(e.to_string()))?;
        if raw.len() != ARCFACE_EMBEDDING_DIM {
            return Err(RecognizerError::Output(format!(
                "{} values, expected {ARCFACE_EMBEDDING_DIM}",
                raw.len()
            )));
        }
        Ok(Embedding {
            values: unit_length(raw),
            model_version: Some(ARCFACE_MODEL_VERSION.to_string()),
        })
    }
}

/// Pixels mapped to `[-1, 1]` in NCHW order.
fn arcface_input(crop: &RgbImage) -> ndarray::Array4<f32> {
    imaging::rgb_to_nchw(crop, 1.0, [ARCFACE_CENTER; 3], [ARCFACE_CENTER; 3])
}

fn unit_length(raw: &[f32]) -> Vec<f32> {
    let norm = raw.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm == 0.0 {
        return raw.to_vec();
    }
    raw.iter().map(|v| v / norm).collect()
}

/// Finds the largest face and embeds it.
pub struct FaceIdExtractor {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
}

impl FaceIdExtractor {
    pub fn load(scrfd_path: &str, arcface_path: &str) -> Result<Self, RecognizerError> {
        Ok(Self {
            detector: FaceDetector::load(scrfd_path)?,
            recognizer: FaceRecognizer::load(arcface_path)?,
        })
    }
}

impl IdentityExtractor for FaceIdExtractor {
    fn extract_identity(&mut self, image: &RgbImage) -> Result<Embedding, RecognizerError> {
        let Some(face) = self.detector.largest_face(image)? else {
            return Err(RecognizerError::NoFace);
        };
        tracing::debug!(confidence = face.confidence, width = face.width, "embedding largest face");
        self.recognizer.extract(image, &face)
    }
}
