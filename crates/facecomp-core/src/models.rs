//! The set of face models a worker loads once and reuses across requests.

use crate::clip::{ClipEncoder, ClipVisionEncoder};
use crate::detector::{DetectorError, FaceDetector, FaceLocator};
use crate::enhance::{FaceRestorer, GfpganRestorer};
use crate::parser::{BiSeNetParser, FaceParser};
use crate::recognizer::{FaceIdExtractor, IdentityExtractor};
use crate::swap::{FaceSwapper, OnnxFaceSwapper, SwapModel};
use serde::Serialize;
use std::path::{Path, PathBuf};

pub const DETECTOR_FILE: &str = "det_10g.onnx";
pub const RECOGNIZER_FILE: &str = "w600k_r50.onnx";
pub const PARSER_FILE: &str = "bisenet_face.onnx";
pub const CLIP_FILE: &str = "clip_vision_h14.onnx";
pub const RESTORER_FILE: &str = "gfpgan_v1.4.onnx";

/// Model file locations.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelPaths {
    pub detector: PathBuf,
    pub recognizer: PathBuf,
    pub parser: PathBuf,
    pub clip: PathBuf,
    pub inswapper: PathBuf,
    pub ghost: PathBuf,
    pub restorer: PathBuf,
}

impl ModelPaths {
    /// Standard file names under `dir`.
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            detector: dir.join(DETECTOR_FILE),
            recognizer: dir.join(RECOGNIZER_FILE),
            parser: dir.join(PARSER_FILE),
            clip: dir.join(CLIP_FILE),
            inswapper: dir.join(SwapModel::InSwapper.file_name()),
            ghost: dir.join(SwapModel::Ghost.file_name()),
            restorer: dir.join(RESTORER_FILE),
        }
    }

    pub fn swapper(&self, model: SwapModel) -> &Path {
        match model {
            SwapModel::InSwapper => &self.inswapper,
            SwapModel::Ghost => &self.ghost,
        }
    }
}

/// Which optional collaborators are loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Availability {
    pub parser: bool,
    pub identity: bool,
    pub clip: bool,
    pub swapper: bool,
    pub restorer: bool,
}

/// Loaded collaborators. Only the detector is required.
pub struct FaceModels {
    pub detector: Box<dyn FaceLocator + Send>,
    pub parser: Option<Box<dyn FaceParser + Send>>,
    pub identity: Option<Box<dyn IdentityExtractor + Send>>,
    pub clip: Option<Box<dyn ClipEncoder + Send>>,
    pub swapper: Option<Box<dyn FaceSwapper + Send>>,
    pub restorer: Option<Box<dyn FaceRestorer + Send>>,
}

impl FaceModels {
    /// Detector only; every optional model unavailable.
    pub fn with_detector(detector: Box<dyn FaceLocator + Send>) -> Self {
        Self {
            detector,
            parser: None,
            identity: None,
            clip: None,
            swapper: None,
            restorer: None,
        }
    }

    /// Load every model under `paths`. A missing detector is fatal; any other
    /// model that fails to load is logged and left unavailable.
    pub fn load(paths: &ModelPaths, swap_model: SwapModel) -> Result<Self, DetectorError> {
        let detector = FaceDetector::load(&path_str(&paths.detector))?;
        let mut models = Self::with_detector(Box::new(detector));

        models.parser = optional("face parser", BiSeNetParser::load(&path_str(&paths.parser)))
            .map(|m| Box::new(m) as Box<dyn FaceParser + Send>);
        models.identity = optional(
            "identity extractor",
            FaceIdExtractor::load(&path_str(&paths.detector), &path_str(&paths.recognizer)),
        )
        .map(|m| Box::new(m) as Box<dyn IdentityExtractor + Send>);
        models.clip = optional("CLIP vision encoder", ClipVisionEncoder::load(&path_str(&paths.clip)))
            .map(|m| Box::new(m) as Box<dyn ClipEncoder + Send>);
        models.swapper = optional(
            "face swapper",
            OnnxFaceSwapper::load(
                &path_str(paths.swapper(swap_model)),
                swap_model,
                &path_str(&paths.detector),
                &path_str(&paths.recognizer),
            ),
        )
        .map(|m| Box::new(m) as Box<dyn FaceSwapper + Send>);
        models.restorer = optional(
            "face restorer",
            GfpganRestorer::load(&path_str(&paths.restorer), &path_str(&paths.detector)),
        )
        .map(|m| Box::new(m) as Box<dyn FaceRestorer + Send>);

        tracing::info!(availability = ?models.availability(), "face models loaded");
        Ok(models)
    }

    pub fn availability(&self) -> Availability {
        Availability {
            parser: self.parser.is_some(),
            identity: self.identity.is_some(),
            clip: self.clip.is_some(),
            swapper: self.swapper.is_some(),
            restorer: self.restorer.is_some(),
        }
    }
}

fn optional<T, E: std::fmt::Display>(what: &str, loaded: Result<T, E>) -> Option<T> {
    match loaded {
        Ok(model) => Some(model),
        Err(e) => {
            tracing::warn!(model = what, error = %e, "optional model unavailable");
            None
        }
    }
}

fn path_str(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
