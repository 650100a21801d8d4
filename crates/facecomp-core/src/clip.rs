//! CLIP vision encoder returning penultimate hidden states.
//!
//! The hidden-state sequence (not the pooled embedding) is what the
//! hairstyle-aware identity mode feeds to the engine's projection layer.

use crate::imaging;
use image::{imageops, imageops::FilterType, RgbImage};
use ndarray::Array3;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

// --- Named constants ---
const CLIP_INPUT_SIZE: u32 = 224;
const CLIP_MEAN: [f32; 3] = [0.481_454_66, 0.457_827_5, 0.408_210_73];
const CLIP_STD: [f32; 3] = [0.268_629_55, 0.261_302_6, 0.275_777_1];
/// ViT-H/14 at 224: 16×16 patches plus the class token.
pub const CLIP_SEQ_LEN: usize = 257;
pub const CLIP_HIDDEN_DIM: usize = 1280;

#[derive(Error, Debug)]
pub enum ClipError {
    #[error("model file not found: {0} (export the CLIP vision tower with hidden states to the model dir)")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Encodes an image into CLIP hidden states of shape (1, S, H).
pub trait ClipEncoder {
    fn hidden_states(&mut self, image: &RgbImage) -> Result<Array3<f32>, ClipError>;
}

/// ONNX CLIP vision tower whose output named `penultimate_hidden_states`
/// (or, failing that, the second-to-last output) is the layer we want.
pub struct ClipVisionEncoder {
    session: Session,
    output_index: usize,
}

impl ClipVisionEncoder {
    pub fn load(model_path: &str) -> Result<Self, ClipError> {
        if !Path::new(model_path).exists() {
            return Err(ClipError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        let output_index = penultimate_output(&output_names);

        tracing::info!(
            path = model_path,
            outputs = ?output_names,
            output_index,
            "loaded CLIP vision model"
        );

        Ok(Self { session, output_index })
    }
}

/// Pick the hidden-state output: by name when exported with one, otherwise
/// the second-to-last output (the last is usually the pooled embedding).
fn penultimate_output(names: &[String]) -> usize {
    names
        .iter()
        .position(|n| n == "penultimate_hidden_states")
        .unwrap_or_else(|| names.len().saturating_sub(2))
}

impl ClipEncoder for ClipVisionEncoder {
    fn hidden_states(&mut self, image: &RgbImage) -> Result<Array3<f32>, ClipError> {
        let resized = imageops::resize(image, CLIP_INPUT_SIZE, CLIP_INPUT_SIZE, FilterType::CatmullRom);
        let input = imaging::rgb_to_nchw(&resized, 1.0 / 255.0, CLIP_MEAN, CLIP_STD);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, data) = outputs[self.output_index]
            .try_extract_tensor::<f32>()
            .map_err(|e| ClipError::InferenceFailed(format!("hidden states: {e}")))?;

        if data.len() % CLIP_HIDDEN_DIM != 0 || data.is_empty() {
            return Err(ClipError::InferenceFailed(format!(
                "hidden states of {} values are not a multiple of {CLIP_HIDDEN_DIM}",
                data.len()
            )));
        }
        let seq = data.len() / CLIP_HIDDEN_DIM;
        Array3::from_shape_vec((1, seq, CLIP_HIDDEN_DIM), data.to_vec())
            .map_err(|e| ClipError::InferenceFailed(format!("reshape: {e}")))
    }
}
