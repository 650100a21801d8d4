//! Post-processing: face swap, swap refinement and face enhancement.
//!
//! Every stage either returns a new image or an error; the orchestrator
//! decides whether an error degrades (input passed forward) or aborts.

use crate::conditioning::ConditioningPayload;
use crate::engine::{EngineError, InpaintEngine, InpaintJob};
use crate::enhance::{self, EnhanceError};
use crate::imaging;
use crate::models::FaceModels;
use crate::parser;
use crate::protocol::ProgressSink;
use crate::request::{EnhanceOptions, RefineOptions};
use crate::schedule::{CancelToken, StepSchedule, StepScheduleController};
use crate::swap::SwapError;
use image::{GrayImage, RgbImage};
use thiserror::Error;

// --- Named constants ---
const REFINE_MIN_STRENGTH: f32 = 0.1;
const REFINE_MAX_STRENGTH: f32 = 0.5;
const REFINE_MASK_BLUR: f32 = 5.0;
const REFINE_RECT_BLUR_KERNEL: u32 = 21;
const MIN_FACE_COVERAGE: f32 = 0.01;

#[derive(Error, Debug)]
pub enum RefineError {
    #[error("{0} model unavailable")]
    Unavailable(&'static str),
    #[error("swap: {0}")]
    Swap(#[from] SwapError),
    #[error("enhance: {0}")]
    Enhance(#[from] EnhanceError),
    #[error("engine: {0}")]
    Engine(#[from] EngineError),
}

impl RefineError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, RefineError::Engine(EngineError::Cancelled))
    }
}

/// Shared text and sampling knobs for the refinement pass.
#[derive(Debug, Clone, Copy)]
pub struct RefinePass<'a> {
    pub prompt: &'a str,
    pub negative_prompt: &'a str,
    pub guidance_scale: f32,
    pub seed: u64,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PostProcessRefiner;

impl PostProcessRefiner {
    pub fn new() -> Self {
        Self
    }

    /// Put the identity of `source` onto the face in `image`.
    pub fn face_swap(
        &self,
        models: &mut FaceModels,
        image: &RgbImage,
        source: &RgbImage,
    ) -> Result<RgbImage, RefineError> {
        let swapper = models.swapper.as_mut().ok_or(RefineError::Unavailable("face swap"))?;
        Ok(swapper.swap(image, source)?)
    }

    /// Short low-strength inpaint over the face only, identity forced to zero,
    /// to blend a swapped face into its surroundings.
    #[allow(clippy::too_many_arguments)]
    pub fn swap_refine(
        &self,
        models: &mut FaceModels,
        engine: &mut dyn InpaintEngine,
        image: &RgbImage,
        payload: &ConditioningPayload,
        pass: RefinePass<'_>,
        opts: RefineOptions,
        cancel: CancelToken,
        sink: &mut dyn ProgressSink,
    ) -> Result<RgbImage, RefineError> {
        let mask = refine_mask(models, image);
        let strength = opts.strength.clamp(REFINE_MIN_STRENGTH, REFINE_MAX_STRENGTH);
        let zeroed = payload.zeroed();
        let mut observer = StepScheduleController::new(StepSchedule::new(0.0, zeroed.scales.clone()), cancel, sink);

        let job = InpaintJob {
            image,
            mask: &mask,
            prompt: pass.prompt,
            negative_prompt: pass.negative_prompt,
            steps: opts.steps.max(1),
            guidance_scale: pass.guidance_scale,
            strength,
            seed: pass.seed,
        };
        tracing::info!(strength, steps = job.steps, "swap refinement pass");
        Ok(engine.inpaint(&job, &zeroed, &mut observer)?)
    }

    /// Restore the face fully, or blend the restoration in at `opts.ratio`.
    pub fn enhance(
        &self,
        models: &mut FaceModels,
        image: &RgbImage,
        opts: EnhanceOptions,
    ) -> Result<RgbImage, RefineError> {
        let restorer = models.restorer.as_mut().ok_or(RefineError::Unavailable("face enhancer"))?;
        let restored = restorer.restore(image)?;
        if opts.ratio >= 1.0 {
            Ok(restored)
        } else {
            Ok(enhance::blend_ratio(image, &restored, opts.ratio))
        }
    }
}

/// Face-only mask (no hair), or a centered rectangle without a usable parse.
pub fn refine_mask(models: &mut FaceModels, image: &RgbImage) -> GrayImage {
    let (w, h) = image.dimensions();
    let parsed = models.parser.as_mut().and_then(|p| match p.parse(image) {
        Ok(map) => Some(map.resized(w, h).union_mask(parser::FACE_LABELS)),
        Err(e) => {
            tracing::warn!(error = %e, "refine mask parsing failed");
            None
        }
    });
    match parsed {
        Some(mask) if imaging::coverage(&mask) >= MIN_FACE_COVERAGE => {
            imaging::blur_radius(&imaging::fill_holes(&mask), REFINE_MASK_BLUR)
        }
        _ => {
            let mut mask = GrayImage::new(w, h);
            for y in h / 5..h * 4 / 5 {
                for x in w / 4..w * 3 / 4 {
                    mask.put_pixel(x, y, image::Luma([255]));
                }
            }
            imaging::blur_kernel(&mask, REFINE_RECT_BLUR_KERNEL)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harmonic::HarmonicInpainter;
    use crate::request::IdentityMode;
    use crate::testing::{self, RecordingSink};
    use image::Rgb;

    fn pass() -> RefinePass<'static> {
        RefinePass {
            prompt: "portrait",
            negative_prompt: "",
            guidance_scale: 7.5,
            seed: 9,
        }
    }

    #[test]
    fn test_face_swap_unavailable() {
        let mut models = testing::models();
        models.swapper = None;
        let img = RgbImage::new(8, 8);
        let err = PostProcessRefiner::new().face_swap(&mut models, &img, &img).unwrap_err();
        assert!(matches!(err, RefineError::Unavailable(_)));
    }

    #[test]
    fn test_face_swap_uses_swapper() {
        let mut models = testing::models();
        let img = RgbImage::from_pixel(8, 8, Rgb([1, 2, 3]));
        let out = PostProcessRefiner::new().face_swap(&mut models, &img, &img).unwrap();
        assert_eq!(*out.get_pixel(0, 0), testing::SWAPPED);
    }

    #[test]
    fn test_enhance_full_and_partial() {
        let mut models = testing::models();
        let img = RgbImage::from_pixel(8, 8, Rgb([0, 0, 0]));
        let full = PostProcessRefiner::new()
            .enhance(&mut models, &img, EnhanceOptions { ratio: 1.0 })
            .unwrap();
        assert_eq!(*full.get_pixel(0, 0), testing::RESTORED);
        let half = PostProcessRefiner::new()
            .enhance(&mut models, &img, EnhanceOptions { ratio: 0.5 })
            .unwrap();
        assert_eq!(half.get_pixel(0, 0)[0], (testing::RESTORED[0] as f32 * 0.5).round() as u8);
    }

    #[test]
    fn test_refine_mask_rectangle_without_parser() {
        let mut models = testing::models();
        models.parser = None;
        let mask = refine_mask(&mut models, &RgbImage::new(100, 100));
        assert!(mask.get_pixel(50, 50)[0] > 250);
        assert_eq!(mask.get_pixel(2, 2)[0], 0);
    }

    #[test]
    fn test_refine_mask_face_only() {
        let mut models = testing::models();
        let img = RgbImage::new(128, 128);
        let mask = refine_mask(&mut models, &img);
        assert!(mask.get_pixel(64, 76)[0] > 250);
        // Hair band above the face stays out.
        assert_eq!(mask.get_pixel(64, 30)[0], 0);
    }

    #[test]
    fn test_swap_refine_forces_identity_off() {
        let mut models = testing::models();
        let mut engine = testing::ScaleRecordingEngine::default();
        let img = RgbImage::from_pixel(64, 64, Rgb([120, 100, 90]));
        let payload = ConditioningPayload {
            scales: crate::conditioning::AdapterScales::Single(0.9),
            ..ConditioningPayload::none(IdentityMode::Standard)
        };
        let mut sink = RecordingSink::default();
        PostProcessRefiner::new()
            .swap_refine(
                &mut models,
                &mut engine,
                &img,
                &payload,
                pass(),
                RefineOptions { strength: 0.9, steps: 4 },
                CancelToken::new(),
                &mut sink,
            )
            .unwrap();
        assert_eq!(engine.strengths, vec![0.5]);
        assert_eq!(engine.seen.len(), 4);
        assert!(engine.seen.iter().all(|s| s.is_zero()));
    }

    #[test]
    fn test_swap_refine_cancelled() {
        let mut models = testing::models();
        let mut engine = HarmonicInpainter::new();
        let img = RgbImage::from_pixel(32, 32, Rgb([120, 100, 90]));
        let cancel = CancelToken::new();
        cancel.cancel();
        let mut sink = RecordingSink::default();
        let err = PostProcessRefiner::new()
            .swap_refine(
                &mut models,
                &mut engine,
                &img,
                &ConditioningPayload::none(IdentityMode::None),
                pass(),
                RefineOptions::default(),
                cancel,
                &mut sink,
            )
            .unwrap_err();
        assert!(err.is_cancelled());
    }
}
