//! Deterministic CPU inpainting engine.
//!
//! Fills the masked region by Jacobi relaxation of the Laplace equation,
//! starting from seeded noise mixed into the original pixels, and pulls the
//! fill toward the conditioning images at the scheduled adapter strength.
//! Used wherever no diffusion backend is linked, and by the pipeline tests.

use crate::conditioning::{AdapterScales, ConditioningPayload};
use crate::engine::{
    EngineError, EngineTarget, InpaintEngine, InpaintJob, LatentDecoder, ScheduleDecision, StepContext,
    StepObserver,
};
use crate::imaging;
use image::{GrayImage, RgbImage};
use ndarray::Array4;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

// --- Named constants ---
/// Fraction of the guide difference applied per step at scale 1.0.
const DEFAULT_PULL_RATE: f32 = 0.15;

/// Decodes the working image straight out of the latent tensor.
#[derive(Debug, Default, Clone, Copy)]
pub struct PixelLatentDecoder;

impl LatentDecoder for PixelLatentDecoder {
    fn decode(&self, latents: &Array4<f32>) -> Result<RgbImage, EngineError> {
        let (_, c, h, w) = latents.dim();
        if c != 3 {
            return Err(EngineError::Failed(format!("expected 3 latent channels, got {c}")));
        }
        let data = latents
            .as_slice()
            .ok_or_else(|| EngineError::Failed("latents are not contiguous".into()))?;
        imaging::nchw_to_rgb(data, w, h, 0.0, 1.0)
            .ok_or_else(|| EngineError::Failed("latent decode produced no image".into()))
    }
}

/// A conditioning image fitted into the mask's bounding box.
struct Guide {
    adapter: usize,
    /// Full-frame (1, 3, H, W); only the mask box is meaningful.
    pixels: Array4<f32>,
    rect: (usize, usize, usize, usize),
}

/// Adapter state applied for the duration of one call.
struct AdapterState {
    guides: Vec<Guide>,
    scales: AdapterScales,
}

pub struct HarmonicInpainter {
    pull_rate: f32,
    adapter: Option<AdapterState>,
}

impl Default for HarmonicInpainter {
    fn default() -> Self {
        Self::new()
    }
}

impl HarmonicInpainter {
    pub fn new() -> Self {
        Self {
            pull_rate: DEFAULT_PULL_RATE,
            adapter: None,
        }
    }

    pub fn with_pull_rate(mut self, rate: f32) -> Self {
        self.pull_rate = rate.clamp(0.0, 1.0);
        self
    }

    fn apply_adapter(&mut self, payload: &ConditioningPayload, mask: &GrayImage) -> Result<(), EngineError> {
        if payload.images.len() != payload.routing.len() {
            return Err(EngineError::InvalidPayload(format!(
                "{} images but {} routes",
                payload.images.len(),
                payload.routing.len()
            )));
        }
        let adapters = payload.scales.values().len();
        if let AdapterScales::PerAdapter(_) = payload.scales {
            if let Some(bad) = payload.routing.iter().find(|&&a| a >= adapters) {
                return Err(EngineError::InvalidPayload(format!(
                    "image routed to adapter {bad} but only {adapters} scales given"
                )));
            }
        }

        let guides = match imaging::mask_bounds(mask) {
            Some(rect) => payload
                .images
                .iter()
                .zip(&payload.routing)
                .map(|(image, &adapter)| Guide {
                    adapter: if adapters > 1 { adapter } else { 0 },
                    pixels: fit_guide(image, rect, mask.width(), mask.height()),
                    rect: (rect.0 as usize, rect.1 as usize, rect.2 as usize, rect.3 as usize),
                })
                .collect(),
            None => Vec::new(),
        };

        self.adapter = Some(AdapterState {
            guides,
            scales: payload.scales.clone(),
        });
        Ok(())
    }

    fn reset_adapter(&mut self) {
        self.adapter = None;
    }

    fn run(
        &mut self,
        job: &InpaintJob<'_>,
        payload: &ConditioningPayload,
        observer: &mut dyn StepObserver,
    ) -> Result<RgbImage, EngineError> {
        let (w, h) = job.image.dimensions();
        if job.mask.dimensions() != (w, h) {
            return Err(EngineError::Failed(format!(
                "mask is {:?}, image is {:?}",
                job.mask.dimensions(),
                (w, h)
            )));
        }
        self.apply_adapter(payload, job.mask)?;

        let original = imaging::rgb_to_nchw(job.image, 1.0 / 255.0, [0.0; 3], [1.0; 3]);
        let mut latents = original.clone();
        let masked: Vec<(usize, usize)> = job
            .mask
            .enumerate_pixels()
            .filter(|(_, _, p)| p[0] > 0)
            .map(|(x, y, _)| (x as usize, y as usize))
            .collect();

        let strength = job.strength.clamp(0.0, 1.0);
        let mut rng = StdRng::seed_from_u64(job.seed);
        for &(x, y) in &masked {
            for c in 0..3 {
                let noise: f32 = rng.gen();
                let v = &mut latents[[0, c, y, x]];
                *v = *v * (1.0 - strength) + noise * strength;
            }
        }

        let (w, h) = (w as usize, h as usize);
        let decoder = PixelLatentDecoder;
        for step in 1..=job.steps {
            let decision = observer.on_step(&StepContext {
                step,
                total_steps: job.steps,
                latents: &latents,
                decoder: &decoder,
            });
            if let ScheduleDecision::Continue(scales) = &decision {
                if let Some(state) = self.adapter.as_mut() {
                    state.scales = scales.clone();
                }
            } else {
                return Err(EngineError::Cancelled);
            }

            let previous = latents.clone();
            for &(x, y) in &masked {
                for c in 0..3 {
                    let left = previous[[0, c, y, x.saturating_sub(1)]];
                    let right = previous[[0, c, y, (x + 1).min(w - 1)]];
                    let up = previous[[0, c, y.saturating_sub(1), x]];
                    let down = previous[[0, c, (y + 1).min(h - 1), x]];
                    latents[[0, c, y, x]] = (left + right + up + down) * 0.25;
                }
            }

            if let Some(state) = &self.adapter {
                let values = state.scales.values();
                for guide in &state.guides {
                    let scale = values.get(guide.adapter).copied().unwrap_or(0.0);
                    let rate = (scale * self.pull_rate).clamp(0.0, 1.0);
                    if rate == 0.0 {
                        continue;
                    }
                    let (x0, y0, x1, y1) = guide.rect;
                    for &(x, y) in &masked {
                        if x < x0 || x >= x1 || y < y0 || y >= y1 {
                            continue;
                        }
                        for c in 0..3 {
                            let v = &mut latents[[0, c, y, x]];
                            *v += (guide.pixels[[0, c, y, x]] - *v) * rate;
                        }
                    }
                }
            }

            observer.on_step_end(&StepContext {
                step,
                total_steps: job.steps,
                latents: &latents,
                decoder: &decoder,
            });
        }

        let generated = decoder.decode(&latents)?;
        Ok(imaging::blend_masked(job.image, &generated, job.mask))
    }
}

impl InpaintEngine for HarmonicInpainter {
    fn target(&self) -> EngineTarget {
        EngineTarget::CPU_F32
    }

    fn inpaint(
        &mut self,
        job: &InpaintJob<'_>,
        payload: &ConditioningPayload,
        observer: &mut dyn StepObserver,
    ) -> Result<RgbImage, EngineError> {
        tracing::debug!(
            steps = job.steps,
            strength = job.strength,
            seed = job.seed,
            mode = %payload.effective,
            "harmonic inpaint started"
        );
        let result = self.run(job, payload, observer);
        self.reset_adapter();
        result
    }
}

fn fit_guide(image: &RgbImage, rect: (u32, u32, u32, u32), w: u32, h: u32) -> Array4<f32> {
    let (x0, y0, x1, y1) = rect;
    let fitted = imaging::resize_rgb(image, x1 - x0, y1 - y0);
    let mut pixels = Array4::<f32>::zeros((1, 3, h as usize, w as usize));
    for (x, y, p) in fitted.enumerate_pixels() {
        for c in 0..3 {
            pixels[[0, c, (y0 + y) as usize, (x0 + x) as usize]] = p[c] as f32 / 255.0;
        }
    }
    pixels
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::IdentityMode;
    use image::{Luma, Rgb};

    struct Fixed(AdapterScales, Option<u32>);

    impl StepObserver for Fixed {
        fn on_step(&mut self, ctx: &StepContext<'_>) -> ScheduleDecision {
            if Some(ctx.step) == self.1 {
                return ScheduleDecision::Abort;
            }
            ScheduleDecision::Continue(self.0.clone())
        }
    }

    fn scene() -> (RgbImage, GrayImage) {
        let image = RgbImage::from_pixel(32, 32, Rgb([100, 120, 140]));
        let mask = GrayImage::from_fn(32, 32, |x, y| {
            if (8..24).contains(&x) && (8..24).contains(&y) {
                Luma([255])
            } else {
                Luma([0])
            }
        });
        (image, mask)
    }

    fn job<'a>(image: &'a RgbImage, mask: &'a GrayImage, seed: u64) -> InpaintJob<'a> {
        InpaintJob {
            image,
            mask,
            prompt: "",
            negative_prompt: "",
            steps: 20,
            guidance_scale: 7.5,
            strength: 0.9,
            seed,
        }
    }

    fn standard(image: RgbImage, scale: f32) -> ConditioningPayload {
        ConditioningPayload {
            requested: IdentityMode::Standard,
            effective: IdentityMode::Standard,
            images: vec![image],
            routing: vec![0],
            image_embeds: Vec::new(),
            projection: None,
            scales: AdapterScales::Single(scale),
            degraded: None,
        }
    }

    /// Keeps the decoded latents seen at the end of the last step.
    struct LastFrame(Option<RgbImage>);

    impl StepObserver for LastFrame {
        fn on_step(&mut self, _ctx: &StepContext<'_>) -> ScheduleDecision {
            ScheduleDecision::Continue(AdapterScales::Single(0.0))
        }

        fn on_step_end(&mut self, ctx: &StepContext<'_>) {
            if ctx.step == ctx.total_steps {
                self.0 = ctx.decoder.decode(ctx.latents).ok();
            }
        }
    }

    #[test]
    fn test_step_end_sees_updated_latents() {
        let (image, mask) = scene();
        let mut obs = LastFrame(None);
        let out = HarmonicInpainter::new()
            .inpaint(&job(&image, &mask, 9), &ConditioningPayload::none(IdentityMode::None), &mut obs)
            .unwrap();
        let last = obs.0.unwrap();
        for (x, y) in [(8, 8), (16, 16), (23, 12)] {
            assert_eq!(last.get_pixel(x, y), out.get_pixel(x, y));
        }
    }

    #[test]
    fn test_deterministic_for_seed() {
        let (image, mask) = scene();
        let payload = ConditioningPayload::none(IdentityMode::None);
        let mut engine = HarmonicInpainter::new();
        let mut obs = Fixed(AdapterScales::Single(0.0), None);
        let a = engine.inpaint(&job(&image, &mask, 42), &payload, &mut obs).unwrap();
        let b = engine.inpaint(&job(&image, &mask, 42), &payload, &mut obs).unwrap();
        let c = engine.inpaint(&job(&image, &mask, 7), &payload, &mut obs).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_unmasked_pixels_untouched() {
        let (image, mask) = scene();
        let mut engine = HarmonicInpainter::new();
        let out = engine
            .inpaint(
                &job(&image, &mask, 1),
                &ConditioningPayload::none(IdentityMode::None),
                &mut Fixed(AdapterScales::Single(0.0), None),
            )
            .unwrap();
        assert_eq!(out.get_pixel(2, 2), image.get_pixel(2, 2));
        assert_eq!(out.get_pixel(30, 30), image.get_pixel(30, 30));
    }

    #[test]
    fn test_guide_pulls_toward_identity() {
        let (image, mask) = scene();
        let guide = RgbImage::from_pixel(16, 16, Rgb([250, 10, 10]));
        let mut engine = HarmonicInpainter::new().with_pull_rate(0.5);
        let on = engine
            .inpaint(
                &job(&image, &mask, 3),
                &standard(guide.clone(), 1.0),
                &mut Fixed(AdapterScales::Single(1.0), None),
            )
            .unwrap();
        let off = engine
            .inpaint(
                &job(&image, &mask, 3),
                &standard(guide, 1.0),
                &mut Fixed(AdapterScales::Single(0.0), None),
            )
            .unwrap();
        assert!(on.get_pixel(16, 16)[0] > off.get_pixel(16, 16)[0]);
        assert!(on.get_pixel(16, 16)[0] > 200);
    }

    #[test]
    fn test_abort_returns_cancelled_and_resets() {
        let (image, mask) = scene();
        let mut engine = HarmonicInpainter::new();
        let err = engine
            .inpaint(
                &job(&image, &mask, 1),
                &standard(image.clone(), 0.8),
                &mut Fixed(AdapterScales::Single(0.8), Some(3)),
            )
            .unwrap_err();
        assert!(matches!(err, EngineError::Cancelled));
        assert!(engine.adapter.is_none());
    }

    #[test]
    fn test_rejects_bad_routing() {
        let (image, mask) = scene();
        let mut payload = standard(image.clone(), 0.8);
        payload.routing = vec![0, 1];
        let mut engine = HarmonicInpainter::new();
        let err = engine
            .inpaint(&job(&image, &mask, 1), &payload, &mut Fixed(AdapterScales::Single(0.8), None))
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidPayload(_)));

        payload.images.push(image.clone());
        payload.scales = AdapterScales::PerAdapter(vec![0.4]);
        let err = engine
            .inpaint(&job(&image, &mask, 1), &payload, &mut Fixed(AdapterScales::Single(0.8), None))
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidPayload(_)));
    }

    #[test]
    fn test_decoder_round_trips_pixels() {
        let image = RgbImage::from_pixel(4, 3, Rgb([10, 128, 250]));
        let latents = imaging::rgb_to_nchw(&image, 1.0 / 255.0, [0.0; 3], [1.0; 3]);
        assert_eq!(PixelLatentDecoder.decode(&latents).unwrap(), image);
    }
}
