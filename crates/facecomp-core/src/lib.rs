//! facecomp-core: Face-compositing pipeline.
//!
//! Turns a background portrait and a source face into an ID-style photo:
//! builds an inpainting mask around the background face, conditions an
//! inpainting engine on the source identity, schedules identity strength per
//! step, and optionally swaps, refines and restores the generated face.
//! Face models run via ONNX Runtime on the CPU.

pub mod alignment;
pub mod artifacts;
pub mod clip;
pub mod conditioning;
pub mod detector;
pub mod engine;
pub mod enhance;
pub mod harmonic;
pub mod imaging;
pub mod mask;
pub mod models;
pub mod orchestrator;
pub mod parser;
pub mod prepaste;
pub mod prompt;
pub mod protocol;
pub mod recognizer;
pub mod refine;
pub mod request;
pub mod schedule;
pub mod seamless;
pub mod swap;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

use std::path::PathBuf;

pub use engine::{EngineError, EngineTarget, InpaintEngine};
pub use harmonic::HarmonicInpainter;
pub use models::{FaceModels, ModelPaths};
pub use orchestrator::{ComposeContext, ComposeError, GenerationOrchestrator, GenerationResult, Stage, StageStatus};
pub use prepaste::BlendMethod;
pub use protocol::{ProgressEvent, ProgressSink};
pub use request::{CompositeRequest, GenerationParams, IdentityMode, ModeFlags};
pub use schedule::CancelToken;
pub use swap::SwapModel;
pub use types::{BoundingBox, Embedding};

/// Where model files live unless configured otherwise.
///
/// `FACECOMP_MODEL_DIR`, then `$XDG_DATA_HOME/facecomp/models`, then
/// `~/.local/share/facecomp/models`.
pub fn default_model_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("FACECOMP_MODEL_DIR") {
        return PathBuf::from(dir);
    }
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("facecomp/models")
}
