//! Top-level compose pipeline.
//!
//! `Init -> MaskBuilt -> (PrePasted) -> Conditioned -> Generated -> (Swapped)
//! -> (Refined) -> (Enhanced) -> Saved`. Optional stages are skipped when not
//! requested; a failing optional stage passes its input forward. Only a
//! missing face, a missing required model, an engine failure or cancellation
//! end the request early.

use crate::artifacts::{Artifact, ArtifactError, RunFolder};
use crate::conditioning::IdentityConditioner;
use crate::engine::{EngineError, InpaintEngine, InpaintJob};
use crate::imaging;
use crate::mask::{MaskBuilder, MaskError, MaskOptions};
use crate::models::{Availability, FaceModels};
use crate::parser::{HairRegion, LabelMap, HAIR_LABELS};
use crate::prepaste::{PasteOutcome, PrePasteCompositor};
use crate::prompt::{self, GenderHint, PromptGenerator, SegmentationPrompter};
use crate::protocol::{ProgressEvent, ProgressSink};
use crate::refine::{PostProcessRefiner, RefineError, RefinePass};
use crate::request::{CompositeRequest, IdentityMode, RequestError};
use crate::schedule::{CancelToken, Preview, StepSchedule, StepScheduleController};
use image::RgbImage;
use thiserror::Error;

/// The user-visible failure taxonomy.
#[derive(Error, Debug)]
pub enum ComposeError {
    #[error("no face found")]
    NoFaceFound,
    #[error("model unavailable: {0}")]
    ModelUnavailable(String),
    #[error("engine: {0}")]
    Engine(EngineError),
    #[error("cancelled")]
    Cancelled,
    #[error("invalid request: {0}")]
    InvalidRequest(#[from] RequestError),
    #[error("artifacts: {0}")]
    Artifacts(#[from] ArtifactError),
}

impl From<EngineError> for ComposeError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::Cancelled => ComposeError::Cancelled,
            other => ComposeError::Engine(other),
        }
    }
}

impl From<MaskError> for ComposeError {
    fn from(e: MaskError) -> Self {
        match e {
            MaskError::NoFace => ComposeError::NoFaceFound,
            MaskError::Detector(e) => ComposeError::ModelUnavailable(format!("face detector: {e}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    MaskBuilt,
    PrePasted,
    Conditioned,
    Generated,
    Swapped,
    Refined,
    Enhanced,
    Saved,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StageStatus {
    Done,
    /// Ran, but fell back; the reason says to what.
    Degraded(String),
    /// Not requested, or its input was unusable; the image passed through.
    Skipped(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct StageReport {
    pub stage: Stage,
    pub status: StageStatus,
}

/// The output of one compose call.
#[derive(Debug, Clone)]
pub struct GenerationResult {
    /// At the original background resolution.
    pub image: RgbImage,
    pub previews: Vec<Preview>,
    pub generated_prompt: Option<String>,
    /// The identity mode actually delivered to the engine.
    pub effective_mode: IdentityMode,
    pub stages: Vec<StageReport>,
    /// Cosine similarity between source and result identities, when measurable.
    pub identity_similarity: Option<f32>,
}

impl GenerationResult {
    pub fn status(&self, stage: Stage) -> Option<&StageStatus> {
        self.stages.iter().find(|r| r.stage == stage).map(|r| &r.status)
    }
}

/// Per-call plumbing: where progress goes, how to cancel, where to save.
pub struct ComposeContext<'a> {
    pub sink: &'a mut dyn ProgressSink,
    pub cancel: CancelToken,
    pub run_folder: Option<&'a RunFolder>,
}

pub struct GenerationOrchestrator {
    models: FaceModels,
    engine: Box<dyn InpaintEngine + Send>,
    mode: IdentityMode,
    prompter: Box<dyn PromptGenerator + Send>,
    masks: MaskBuilder,
    prepaste: PrePasteCompositor,
    refiner: PostProcessRefiner,
}

impl GenerationOrchestrator {
    /// Fix the identity mode for this orchestrator, downgraded to what the
    /// loaded models can deliver.
    pub fn new(models: FaceModels, engine: Box<dyn InpaintEngine + Send>, requested: IdentityMode) -> Self {
        let mode = supported_mode(requested, models.availability());
        tracing::info!(mode = %mode, target = ?engine.target(), "orchestrator ready");
        Self {
            models,
            engine,
            mode,
            prompter: Box::new(SegmentationPrompter),
            masks: MaskBuilder::new(),
            prepaste: PrePasteCompositor::new(),
            refiner: PostProcessRefiner::new(),
        }
    }

    pub fn with_prompter(mut self, prompter: Box<dyn PromptGenerator + Send>) -> Self {
        self.prompter = prompter;
        self
    }

    pub fn current_mode(&self) -> &IdentityMode {
        &self.mode
    }

    pub fn availability(&self) -> Availability {
        self.models.availability()
    }

    /// Switch to identity-embedding conditioning.
    pub fn switch_to_faceid(&mut self) -> Result<(), ComposeError> {
        if self.models.identity.is_none() {
            return Err(ComposeError::ModelUnavailable("identity extractor".into()));
        }
        tracing::info!(from = %self.mode, "switching to faceid");
        self.mode = IdentityMode::FaceId;
        Ok(())
    }

    /// Switch to raw-image conditioning. Always possible.
    pub fn switch_to_standard(&mut self) {
        tracing::info!(from = %self.mode, "switching to standard");
        self.mode = IdentityMode::Standard;
    }

    /// Run one request through every stage.
    pub fn compose(
        &mut self,
        request: &CompositeRequest,
        ctx: ComposeContext<'_>,
    ) -> Result<GenerationResult, ComposeError> {
        let ComposeContext {
            sink,
            cancel,
            run_folder,
        } = ctx;
        let params = &request.params;
        params.validate()?;
        let mut stages = Vec::new();
        let mut report = |stage: Stage, status: StageStatus| {
            tracing::debug!(stage = ?stage, status = ?status, "stage finished");
            stages.push(StageReport { stage, status });
        };

        let (orig_w, orig_h) = request.background.dimensions();
        let (work_w, work_h) = imaging::working_size(orig_w, orig_h);
        let mut background = imaging::resize_rgb(&request.background, work_w, work_h);
        tracing::info!(
            original = ?(orig_w, orig_h),
            working = ?(work_w, work_h),
            mode = %self.mode,
            seed = params.seed,
            "compose started"
        );

        if let Some(run) = run_folder {
            best_effort(run, Artifact::Reference, &request.background);
            best_effort(run, Artifact::Face, &request.face);
        }

        // MaskBuilt
        let face_mask = self
            .masks
            .build_mask(&mut self.models, &background, &MaskOptions::from_params(params))?;
        report(Stage::MaskBuilt, StageStatus::Done);

        // PrePasted
        match params.pre_paste {
            Some(opts) => match self.prepaste.paste(&mut self.models, &background, &request.face, opts.blend) {
                PasteOutcome::Pasted { image, method, .. } => {
                    background = image;
                    if let Some(run) = run_folder {
                        best_effort(run, Artifact::PrePaste, &background);
                    }
                    if method == opts.blend {
                        report(Stage::PrePasted, StageStatus::Done);
                    } else {
                        report(Stage::PrePasted, StageStatus::Degraded(format!("blended with {method}")));
                    }
                }
                PasteOutcome::Skipped { reason, .. } => report(Stage::PrePasted, StageStatus::Skipped(reason)),
            },
            None => report(Stage::PrePasted, StageStatus::Skipped("not requested".into())),
        }

        // Source analysis: hair region, gender hint, prompt.
        let source_map = self.parse_source(&request.face);
        let hair = source_map.as_ref().and_then(|m| HairRegion::extract(&request.face, m));
        let gender = match (&source_map, params.gender_detect) {
            (Some(map), true) => {
                let hint = GenderHint::from_hair_coverage(map.coverage(HAIR_LABELS));
                tracing::info!(hint = ?hint, "gender hint from hair coverage");
                Some(hint)
            }
            _ => None,
        };
        let generated_prompt = params
            .auto_prompt
            .then(|| self.prompter.generate(&request.face, source_map.as_ref()));
        if let Some(text) = &generated_prompt {
            sink.emit(ProgressEvent::GeneratedPrompt(text.clone()));
        }
        let user_prompt = generated_prompt.as_deref().unwrap_or(&params.prompt);
        let full_prompt = prompt::build_prompt(gender, user_prompt);
        let negative_prompt = params.negative_prompt.as_deref().unwrap_or(prompt::NEGATIVE_PROMPT);

        // Conditioned
        let mode = self.mode.with_knobs(params);
        let conditioner = IdentityConditioner::new(self.engine.target());
        let payload = conditioner.prepare(
            &mut self.models,
            &mode,
            &request.face,
            hair.as_ref().map(|h| &h.image),
            params.face_strength,
        );
        match &payload.degraded {
            Some(reason) => report(Stage::Conditioned, StageStatus::Degraded(reason.clone())),
            None => report(Stage::Conditioned, StageStatus::Done),
        }

        // Generated
        if let Some(run) = run_folder {
            best_effort(run, Artifact::MaskOverlay, &imaging::mask_overlay(&background, &face_mask.mask));
            best_effort(run, Artifact::InpaintInput, &imaging::inpaint_input(&background, &face_mask.mask));
            if let Err(e) = run.save_mask(Artifact::Mask, &face_mask.mask) {
                tracing::warn!(artifact = Artifact::Mask.file_name(), error = %e, "failed to save artifact");
            }
        }
        let (gen_w, gen_h) = imaging::generation_size(work_w, work_h);
        let gen_image = imaging::resize_rgb(&background, gen_w, gen_h);
        let gen_mask = imaging::resize_gray(&face_mask.mask, gen_w, gen_h);
        let job = InpaintJob {
            image: &gen_image,
            mask: &gen_mask,
            prompt: &full_prompt,
            negative_prompt,
            steps: params.steps,
            guidance_scale: params.guidance_scale,
            strength: params.denoising_strength,
            seed: params.seed,
        };
        let schedule = StepSchedule::new(params.stop_at, payload.scales.clone());
        let (generated, previews) = {
            let mut observer = StepScheduleController::new(schedule, cancel.clone(), &mut *sink);
            if params.save_preview {
                observer = observer.with_previews(run_folder.map(|r| r.preview_dir()));
            }
            let generated = self.engine.inpaint(&job, &payload, &mut observer)?;
            (generated, observer.into_previews())
        };
        let mut image = imaging::resize_rgb(&generated, work_w, work_h);
        report(Stage::Generated, StageStatus::Done);

        // Swapped
        let mut swapped = false;
        match params.face_swap {
            Some(requested) => {
                check_cancel(&cancel)?;
                if let Some(loaded) = self.models.swapper.as_ref().map(|s| s.model()) {
                    if loaded != requested {
                        tracing::warn!(requested = %requested, loaded = %loaded, "using the loaded swap model");
                    }
                }
                match self.refiner.face_swap(&mut self.models, &image, &request.face) {
                    Ok(out) => {
                        image = out;
                        swapped = true;
                        if let Some(run) = run_folder {
                            best_effort(run, Artifact::FaceSwap, &image);
                        }
                        report(Stage::Swapped, StageStatus::Done);
                    }
                    Err(e) => report(Stage::Swapped, degraded("face swap", &e)),
                }
            }
            None => report(Stage::Swapped, StageStatus::Skipped("not requested".into())),
        }

        // Refined
        match params.swap_refine {
            Some(opts) if swapped => {
                let pass = RefinePass {
                    prompt: &full_prompt,
                    negative_prompt,
                    guidance_scale: params.guidance_scale,
                    seed: params.seed,
                };
                let refined = self.refiner.swap_refine(
                    &mut self.models,
                    self.engine.as_mut(),
                    &image,
                    &payload,
                    pass,
                    opts,
                    cancel.clone(),
                    &mut *sink,
                );
                match refined {
                    Ok(out) => {
                        image = out;
                        if let Some(run) = run_folder {
                            best_effort(run, Artifact::SwapRefine, &image);
                        }
                        report(Stage::Refined, StageStatus::Done);
                    }
                    Err(e) if e.is_cancelled() => return Err(ComposeError::Cancelled),
                    Err(e) => report(Stage::Refined, degraded("swap refinement", &e)),
                }
            }
            Some(_) => report(Stage::Refined, StageStatus::Skipped("no swapped face to refine".into())),
            None => report(Stage::Refined, StageStatus::Skipped("not requested".into())),
        }

        // Enhanced
        match params.enhance {
            Some(opts) => {
                check_cancel(&cancel)?;
                match self.refiner.enhance(&mut self.models, &image, opts) {
                    Ok(out) => {
                        image = out;
                        if let Some(run) = run_folder {
                            best_effort(run, Artifact::Enhance, &image);
                        }
                        report(Stage::Enhanced, StageStatus::Done);
                    }
                    Err(e) => report(Stage::Enhanced, degraded("enhancement", &e)),
                }
            }
            None => report(Stage::Enhanced, StageStatus::Skipped("not requested".into())),
        }

        // Saved
        let image = imaging::resize_rgb(&image, orig_w, orig_h);
        if let Some(run) = run_folder {
            run.save(Artifact::Result, &image)?;
        }
        report(Stage::Saved, StageStatus::Done);

        let identity_similarity = self.identity_similarity(&request.face, &image);
        tracing::info!(
            mode = %payload.effective,
            similarity = ?identity_similarity,
            previews = previews.len(),
            "compose finished"
        );

        Ok(GenerationResult {
            image,
            previews,
            generated_prompt,
            effective_mode: payload.effective,
            stages,
            identity_similarity,
        })
    }

    fn parse_source(&mut self, face: &RgbImage) -> Option<LabelMap> {
        let parser = self.models.parser.as_mut()?;
        match parser.parse(face) {
            Ok(map) => Some(map),
            Err(e) => {
                tracing::warn!(error = %e, "source face parsing failed; no hair region or gender hint");
                None
            }
        }
    }

    fn identity_similarity(&mut self, source: &RgbImage, result: &RgbImage) -> Option<f32> {
        let extractor = self.models.identity.as_mut()?;
        let a = extractor.extract_identity(source).ok()?;
        let b = extractor.extract_identity(result).ok()?;
        Some(a.similarity(&b))
    }
}

/// The requested mode if the loaded models can serve it, else the closest weaker one.
fn supported_mode(requested: IdentityMode, available: Availability) -> IdentityMode {
    let downgrade = match &requested {
        IdentityMode::FaceId | IdentityMode::Dual if !available.identity => {
            Some((IdentityMode::Standard, "no identity extractor"))
        }
        IdentityMode::FaceIdPlus { .. } if !available.clip => Some(if available.identity {
            (IdentityMode::FaceId, "no CLIP encoder")
        } else {
            (IdentityMode::Standard, "no CLIP encoder or identity extractor")
        }),
        _ => None,
    };
    match downgrade {
        Some((to, reason)) => {
            tracing::warn!(requested = %requested, fallback = %to, reason, "identity mode unavailable");
            to
        }
        None => requested,
    }
}

fn degraded(what: &str, e: &RefineError) -> StageStatus {
    tracing::warn!(stage = what, error = %e, "stage failed, passing input through");
    StageStatus::Degraded(format!("{what} failed: {e}"))
}

fn check_cancel(cancel: &CancelToken) -> Result<(), ComposeError> {
    if cancel.is_cancelled() {
        Err(ComposeError::Cancelled)
    } else {
        Ok(())
    }
}

fn best_effort(run: &RunFolder, artifact: Artifact, image: &RgbImage) {
    if let Err(e) = run.save(artifact, image) {
        tracing::warn!(artifact = artifact.file_name(), error = %e, "failed to save artifact");
    }
}
