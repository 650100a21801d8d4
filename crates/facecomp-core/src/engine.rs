//! The inpainting-engine contract.
//!
//! An engine receives the job, an explicit [`ConditioningPayload`] and a
//! [`StepObserver`]. It applies the payload's adapter state at the start of
//! the call, asks the observer for the adapter scales before every step, and
//! resets its adapter state before returning, whether it succeeds or not.

use crate::conditioning::{AdapterScales, ConditioningPayload};
use image::{GrayImage, RgbImage};
use ndarray::Array4;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("generation cancelled")]
    Cancelled,
    #[error("engine could not be built: {0}")]
    Build(String),
    #[error("payload rejected: {0}")]
    InvalidPayload(String),
    #[error("generation failed: {0}")]
    Failed(String),
}

/// Numeric precision the engine computes in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precision {
    F16,
    F32,
}

/// Where the engine's tensors live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Device {
    Cpu,
    Gpu(u32),
}

impl std::fmt::Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Device::Cpu => f.write_str("cpu"),
            Device::Gpu(i) => write!(f, "gpu:{i}"),
        }
    }
}

/// Precision and device every conditioning tensor must be cast to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineTarget {
    pub precision: Precision,
    pub device: Device,
}

impl EngineTarget {
    pub const CPU_F32: EngineTarget = EngineTarget {
        precision: Precision::F32,
        device: Device::Cpu,
    };
}

/// One inpainting call, already at engine resolution.
#[derive(Debug, Clone, Copy)]
pub struct InpaintJob<'a> {
    pub image: &'a RgbImage,
    /// 0 keeps the pixel, 255 regenerates it; intermediate values blend.
    pub mask: &'a GrayImage,
    pub prompt: &'a str,
    pub negative_prompt: &'a str,
    pub steps: u32,
    pub guidance_scale: f32,
    pub strength: f32,
    pub seed: u64,
}

/// Turns an engine's latent state into pixels for previews.
pub trait LatentDecoder {
    fn decode(&self, latents: &Array4<f32>) -> Result<RgbImage, EngineError>;
}

/// What the engine exposes to the observer around each step.
pub struct StepContext<'a> {
    /// 1-based index of the step about to run (or, in `on_step_end`, just run).
    pub step: u32,
    pub total_steps: u32,
    pub latents: &'a Array4<f32>,
    pub decoder: &'a dyn LatentDecoder,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScheduleDecision {
    /// Run the step with these adapter scales.
    Continue(AdapterScales),
    /// Abandon the call; the engine returns [`EngineError::Cancelled`].
    Abort,
}

pub trait StepObserver {
    /// Called before the step; the decision sets its adapter scales.
    fn on_step(&mut self, ctx: &StepContext<'_>) -> ScheduleDecision;

    /// Called once the step has updated the latents.
    fn on_step_end(&mut self, _ctx: &StepContext<'_>) {}
}

pub trait InpaintEngine {
    fn target(&self) -> EngineTarget;

    fn inpaint(
        &mut self,
        job: &InpaintJob<'_>,
        payload: &ConditioningPayload,
        observer: &mut dyn StepObserver,
    ) -> Result<RgbImage, EngineError>;
}
