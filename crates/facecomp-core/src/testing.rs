//! In-process model doubles shared by the unit tests.

use crate::clip::{ClipEncoder, ClipError};
use crate::conditioning::{AdapterScales, ConditioningPayload};
use crate::detector::{DetectorError, FaceLocator};
use crate::engine::{EngineError, EngineTarget, InpaintEngine, InpaintJob, ScheduleDecision, StepContext, StepObserver};
use crate::enhance::{EnhanceError, FaceRestorer};
use crate::harmonic::PixelLatentDecoder;
use crate::models::FaceModels;
use crate::parser::{labels, FaceParser, LabelMap, ParserError};
use crate::protocol::{ProgressEvent, ProgressSink};
use crate::recognizer::{IdentityExtractor, RecognizerError, ARCFACE_EMBEDDING_DIM};
use crate::swap::{FaceSwapper, SwapError, SwapModel};
use crate::types::{BoundingBox, Embedding};
use image::{Rgb, RgbImage};
use ndarray::{Array3, Array4};
use std::sync::{Arc, Mutex};

pub const CLIP_SEQ: usize = 4;
pub const CLIP_HIDDEN: usize = 8;
pub const SWAPPED: Rgb<u8> = Rgb([11, 222, 33]);
pub const RESTORED: Rgb<u8> = Rgb([240, 10, 120]);

/// Reports a fixed list of faces, or one face at a fixed fraction of the frame.
pub struct StubDetector {
    faces: Option<Vec<BoundingBox>>,
}

impl FaceLocator for StubDetector {
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError> {
        if let Some(faces) = &self.faces {
            return Ok(faces.clone());
        }
        let (w, h) = (image.width() as f32, image.height() as f32);
        Ok(vec![BoundingBox::new(0.3125 * w, 0.375 * h, 0.375 * w, 0.4375 * h)])
    }
}

/// Skin where the stub detector puts the face, a hair band above it.
pub fn parse_fixture(width: u32, height: u32) -> LabelMap {
    let (w, h) = (width as f32, height as f32);
    let mut labels = Vec::with_capacity(width as usize * height as usize);
    for y in 0..height {
        let fy = (y as f32 + 0.5) / h;
        for x in 0..width {
            let fx = (x as f32 + 0.5) / w;
            let label = if (0.3125..0.6875).contains(&fx) && (0.375..0.8125).contains(&fy) {
                labels::SKIN
            } else if (0.28..0.72).contains(&fx) && (0.22..0.375).contains(&fy) {
                labels::HAIR
            } else {
                labels::BACKGROUND
            };
            labels.push(label);
        }
    }
    LabelMap::new(width, height, labels).unwrap()
}

pub struct FixtureParser;

impl FaceParser for FixtureParser {
    fn parse(&mut self, image: &RgbImage) -> Result<LabelMap, ParserError> {
        Ok(parse_fixture(image.width(), image.height()))
    }
}

/// Everything is background.
pub struct BlankParser;

impl FaceParser for BlankParser {
    fn parse(&mut self, image: &RgbImage) -> Result<LabelMap, ParserError> {
        let n = image.width() as usize * image.height() as usize;
        Ok(LabelMap::new(image.width(), image.height(), vec![labels::BACKGROUND; n]).unwrap())
    }
}

/// A small skin patch at the centre, well under any usable coverage.
pub struct SpeckParser;

impl FaceParser for SpeckParser {
    fn parse(&mut self, image: &RgbImage) -> Result<LabelMap, ParserError> {
        let (w, h) = image.dimensions();
        let (cx, cy) = (w / 2, h / 2);
        let labels = (0..h)
            .flat_map(|y| (0..w).map(move |x| (x, y)))
            .map(|(x, y)| {
                if x.abs_diff(cx) < 4 && y.abs_diff(cy) < 4 { labels::SKIN } else { labels::BACKGROUND }
            })
            .collect();
        Ok(LabelMap::new(w, h, labels).unwrap())
    }
}

/// Unit embedding derived from the mean colour, so similar images score high.
pub struct FixedIdentity;

impl IdentityExtractor for FixedIdentity {
    fn extract_identity(&mut self, image: &RgbImage) -> Result<Embedding, RecognizerError> {
        let n = (image.width() * image.height()).max(1) as f32;
        let mut mean = [0.0f32; 3];
        for p in image.pixels() {
            for c in 0..3 {
                mean[c] += p[c] as f32 / n;
            }
        }
        let mut values: Vec<f32> = (0..ARCFACE_EMBEDDING_DIM)
            .map(|i| mean[i % 3] / 255.0 + 0.01)
            .collect();
        let norm = values.iter().map(|v| v * v).sum::<f32>().sqrt();
        values.iter_mut().for_each(|v| *v /= norm);
        Ok(Embedding {
            values,
            model_version: Some("stub".into()),
        })
    }
}

pub struct FailingIdentity;

impl IdentityExtractor for FailingIdentity {
    fn extract_identity(&mut self, _image: &RgbImage) -> Result<Embedding, RecognizerError> {
        Err(RecognizerError::NoFace)
    }
}

pub struct FixedClip;

impl ClipEncoder for FixedClip {
    fn hidden_states(&mut self, _image: &RgbImage) -> Result<Array3<f32>, ClipError> {
        Ok(Array3::zeros((1, CLIP_SEQ, CLIP_HIDDEN)))
    }
}

/// Paints the whole target [`SWAPPED`].
pub struct SolidSwapper;

impl FaceSwapper for SolidSwapper {
    fn model(&self) -> SwapModel {
        SwapModel::InSwapper
    }

    fn swap(&mut self, target: &RgbImage, _source: &RgbImage) -> Result<RgbImage, SwapError> {
        Ok(RgbImage::from_pixel(target.width(), target.height(), SWAPPED))
    }
}

pub struct FailingSwapper;

impl FaceSwapper for FailingSwapper {
    fn model(&self) -> SwapModel {
        SwapModel::InSwapper
    }

    fn swap(&mut self, _target: &RgbImage, _source: &RgbImage) -> Result<RgbImage, SwapError> {
        Err(SwapError::NoTargetFace)
    }
}

/// Paints the whole image [`RESTORED`].
pub struct SolidRestorer;

impl FaceRestorer for SolidRestorer {
    fn restore(&mut self, image: &RgbImage) -> Result<RgbImage, EnhanceError> {
        Ok(RgbImage::from_pixel(image.width(), image.height(), RESTORED))
    }
}

#[derive(Default)]
pub struct RecordingSink {
    pub events: Vec<ProgressEvent>,
}

impl ProgressSink for RecordingSink {
    fn emit(&mut self, event: ProgressEvent) {
        self.events.push(event);
    }
}

/// Returns its input unchanged and records what the observer scheduled.
#[derive(Default)]
pub struct ScaleRecordingEngine {
    pub strengths: Vec<f32>,
    /// Scales returned by the observer, one entry per step.
    pub seen: Vec<AdapterScales>,
    shared: Arc<Mutex<Vec<AdapterScales>>>,
}

impl ScaleRecordingEngine {
    /// A view of `seen` that stays readable after the engine is boxed away.
    pub fn seen_handle(&self) -> Arc<Mutex<Vec<AdapterScales>>> {
        Arc::clone(&self.shared)
    }
}

impl InpaintEngine for ScaleRecordingEngine {
    fn target(&self) -> EngineTarget {
        EngineTarget::CPU_F32
    }

    fn inpaint(
        &mut self,
        job: &InpaintJob<'_>,
        _payload: &ConditioningPayload,
        observer: &mut dyn StepObserver,
    ) -> Result<RgbImage, EngineError> {
        self.strengths.push(job.strength);
        let latents = Array4::<f32>::zeros((1, 3, 8, 8));
        for step in 1..=job.steps {
            let ctx = StepContext {
                step,
                total_steps: job.steps,
                latents: &latents,
                decoder: &PixelLatentDecoder,
            };
            match observer.on_step(&ctx) {
                ScheduleDecision::Continue(scales) => {
                    self.seen.push(scales.clone());
                    self.shared.lock().unwrap().push(scales);
                }
                ScheduleDecision::Abort => return Err(EngineError::Cancelled),
            }
            observer.on_step_end(&ctx);
        }
        Ok(job.image.clone())
    }
}

/// Every model loaded, with the fractional stub detector.
pub fn models() -> FaceModels {
    with_all(StubDetector { faces: None })
}

/// Every model loaded; the detector always reports `faces`.
pub fn models_with_faces(faces: Vec<BoundingBox>) -> FaceModels {
    with_all(StubDetector { faces: Some(faces) })
}

fn with_all(detector: StubDetector) -> FaceModels {
    let mut models = FaceModels::with_detector(Box::new(detector));
    models.parser = Some(Box::new(FixtureParser));
    models.identity = Some(Box::new(FixedIdentity));
    models.clip = Some(Box::new(FixedClip));
    models.swapper = Some(Box::new(SolidSwapper));
    models.restorer = Some(Box::new(SolidRestorer));
    models
}
