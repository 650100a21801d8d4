//! Per-step identity schedule, previews and cancellation.

use crate::conditioning::AdapterScales;
use crate::engine::{ScheduleDecision, StepContext, StepObserver};
use crate::protocol::{ProgressEvent, ProgressSink};
use image::RgbImage;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

// --- Named constants ---
pub const PREVIEW_INTERVAL: u32 = 5;

/// Identity strength as a function of diffusion progress.
#[derive(Debug, Clone, PartialEq)]
pub struct StepSchedule {
    /// Fraction of steps after which identity conditioning is switched off.
    pub stop_at: f32,
    /// Scales while identity conditioning is on.
    pub scales: AdapterScales,
}

impl StepSchedule {
    pub fn new(stop_at: f32, scales: AdapterScales) -> Self {
        Self { stop_at, scales }
    }

    /// Scales for 1-based `step` of `total`.
    pub fn scales_at(&self, step: u32, total: u32) -> AdapterScales {
        let progress = step as f32 / total.max(1) as f32;
        if progress > self.stop_at {
            self.scales.zeroed()
        } else {
            self.scales.clone()
        }
    }
}

/// Shared flag a supervisor flips to abandon an in-flight request.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A decoded intermediate frame.
#[derive(Debug, Clone)]
pub struct Preview {
    pub step: u32,
    pub image: RgbImage,
    /// Where it was written, when a preview directory is configured.
    pub path: Option<PathBuf>,
}

/// The [`StepObserver`] the orchestrator hands to the engine.
pub struct StepScheduleController<'a> {
    schedule: StepSchedule,
    cancel: CancelToken,
    sink: &'a mut dyn ProgressSink,
    capture_previews: bool,
    preview_dir: Option<PathBuf>,
    previews: Vec<Preview>,
}

impl<'a> StepScheduleController<'a> {
    pub fn new(schedule: StepSchedule, cancel: CancelToken, sink: &'a mut dyn ProgressSink) -> Self {
        Self {
            schedule,
            cancel,
            sink,
            capture_previews: false,
            preview_dir: None,
            previews: Vec::new(),
        }
    }

    /// Decode a preview every [`PREVIEW_INTERVAL`] steps, writing it under `dir` if given.
    pub fn with_previews(mut self, dir: Option<PathBuf>) -> Self {
        self.capture_previews = true;
        self.preview_dir = dir;
        self
    }

    pub fn into_previews(self) -> Vec<Preview> {
        self.previews
    }

    fn capture(&mut self, ctx: &StepContext<'_>) {
        let image = match ctx.decoder.decode(ctx.latents) {
            Ok(image) => image,
            Err(e) => {
                tracing::warn!(step = ctx.step, error = %e, "preview decode failed");
                return;
            }
        };

        let path = self.preview_dir.as_ref().and_then(|dir| {
            let path = dir.join(format!("step_{:03}.png", ctx.step));
            let saved = std::fs::create_dir_all(dir)
                .map_err(|e| e.to_string())
                .and_then(|_| image.save(&path).map_err(|e| e.to_string()));
            match saved {
                Ok(()) => Some(path),
                Err(e) => {
                    tracing::warn!(step = ctx.step, error = %e, "preview save failed");
                    None
                }
            }
        });

        if let Some(path) = &path {
            self.sink.emit(ProgressEvent::Preview(path.clone()));
        }
        self.previews.push(Preview { step: ctx.step, image, path });
    }
}

impl StepObserver for StepScheduleController<'_> {
    fn on_step(&mut self, ctx: &StepContext<'_>) -> ScheduleDecision {
        if self.cancel.is_cancelled() {
            tracing::info!(step = ctx.step, "cancellation requested, aborting generation");
            return ScheduleDecision::Abort;
        }

        self.sink.emit(ProgressEvent::Step {
            step: ctx.step,
            total: ctx.total_steps,
        });

        let scales = self.schedule.scales_at(ctx.step, ctx.total_steps);
        tracing::trace!(step = ctx.step, total = ctx.total_steps, scales = ?scales, "step scheduled");
        ScheduleDecision::Continue(scales)
    }

    fn on_step_end(&mut self, ctx: &StepContext<'_>) {
        if self.capture_previews && ctx.step % PREVIEW_INTERVAL == 0 {
            self.capture(ctx);
        }
    }
}
