//! Pre-paste: composite the source face onto the background face before
//! generation, so the inpainting pass starts from the right identity.

use crate::detector::DetectorError;
use crate::imaging;
use crate::models::FaceModels;
use crate::parser;
use crate::seamless;
use crate::types::BoundingBox;
use image::{imageops, GrayImage, RgbImage};
use serde::{Deserialize, Serialize};

// --- Named constants ---
/// Background face box growth: sides, up, down (50% overall, more upward).
const TARGET_EXPAND: (f32, f32, f32) = (0.25, 0.35, 0.15);
/// Source face box growth: sides, up, down (40% overall).
const SOURCE_EXPAND: (f32, f32, f32) = (0.2, 0.25, 0.15);
const ALPHA_BLUR_KERNEL: u32 = 11;
const SEAMLESS_BINARY_THRESHOLD: u8 = 127;
/// Segmentation masks below this coverage are replaced by the fallback ellipse.
const MIN_SEAMLESS_COVERAGE: f32 = 0.01;
const FALLBACK_ELLIPSE_W: f32 = 0.90;
const FALLBACK_ELLIPSE_H: f32 = 0.96;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlendMethod {
    /// Poisson clone of the face and hair region.
    #[default]
    Seamless,
    /// Feathered ellipse, linear blend.
    Alpha,
    /// Hard copy of the whole patch.
    Direct,
}

impl std::fmt::Display for BlendMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlendMethod::Seamless => f.write_str("seamless"),
            BlendMethod::Alpha => f.write_str("alpha"),
            BlendMethod::Direct => f.write_str("direct"),
        }
    }
}

impl std::str::FromStr for BlendMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "seamless" => Ok(BlendMethod::Seamless),
            "alpha" => Ok(BlendMethod::Alpha),
            "direct" => Ok(BlendMethod::Direct),
            other => Err(format!("unknown blend method '{other}' (expected seamless, alpha or direct)")),
        }
    }
}

#[derive(Debug, Clone)]
pub enum PasteOutcome {
    Pasted {
        image: RgbImage,
        /// Where the source patch landed on the background.
        region: BoundingBox,
        /// The method actually used, after any fallback.
        method: BlendMethod,
    },
    /// Background returned unchanged.
    Skipped { image: RgbImage, reason: String },
}

impl PasteOutcome {
    pub fn image(&self) -> &RgbImage {
        match self {
            PasteOutcome::Pasted { image, .. } | PasteOutcome::Skipped { image, .. } => image,
        }
    }

    pub fn into_image(self) -> RgbImage {
        match self {
            PasteOutcome::Pasted { image, .. } | PasteOutcome::Skipped { image, .. } => image,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PrePasteCompositor;

impl PrePasteCompositor {
    pub fn new() -> Self {
        Self
    }

    /// Paste the largest face of `source` over the largest face of `background`.
    ///
    /// Never fails: a missing face or detector error skips the stage.
    pub fn paste(
        &self,
        models: &mut FaceModels,
        background: &RgbImage,
        source: &RgbImage,
        method: BlendMethod,
    ) -> PasteOutcome {
        match self.try_paste(models, background, source, method) {
            Ok((image, region, method)) => {
                tracing::info!(method = %method, x = region.x, y = region.y, "source face pre-pasted");
                PasteOutcome::Pasted { image, region, method }
            }
            Err(reason) => {
                tracing::warn!(reason = %reason, "pre-paste skipped");
                PasteOutcome::Skipped {
                    image: background.clone(),
                    reason,
                }
            }
        }
    }

    fn try_paste(
        &self,
        models: &mut FaceModels,
        background: &RgbImage,
        source: &RgbImage,
        method: BlendMethod,
    ) -> Result<(RgbImage, BoundingBox, BlendMethod), String> {
        let detect_err = |e: DetectorError| format!("detector: {e}");
        let target = models
            .detector
            .largest_face(background)
            .map_err(detect_err)?
            .ok_or("no face in background")?;
        let source_face = models
            .detector
            .largest_face(source)
            .map_err(detect_err)?
            .ok_or("no face in source")?;

        let (side, up, down) = TARGET_EXPAND;
        let (x0, y0, x1, y1) = target
            .expand(side, up, down)
            .clamped_rect(background.width(), background.height())
            .ok_or("background face box is outside the image")?;
        let (side, up, down) = SOURCE_EXPAND;
        let (s0, t0, s1, t1) = source_face
            .expand(side, up, down)
            .clamped_rect(source.width(), source.height())
            .ok_or("source face box is outside the image")?;

        let crop = imageops::crop_imm(source, s0, t0, s1 - s0, t1 - t0).to_image();
        let patch = imaging::resize_rgb(&crop, x1 - x0, y1 - y0);
        let region = BoundingBox::new(x0 as f32, y0 as f32, (x1 - x0) as f32, (y1 - y0) as f32);

        let (image, used) = match method {
            BlendMethod::Direct => (direct(background, &patch, x0, y0), BlendMethod::Direct),
            BlendMethod::Alpha => (alpha(background, &patch, x0, y0), BlendMethod::Alpha),
            BlendMethod::Seamless => {
                let mask = seamless_mask(models, &patch);
                match seamless::seamless_clone(background, &patch, &mask, (x0 as i64, y0 as i64)) {
                    Ok(image) => (image, BlendMethod::Seamless),
                    Err(e) => {
                        tracing::warn!(error = %e, "seamless clone failed, falling back to alpha blend");
                        (alpha(background, &patch, x0, y0), BlendMethod::Alpha)
                    }
                }
            }
        };
        Ok((image, region, used))
    }
}

fn direct(background: &RgbImage, patch: &RgbImage, x0: u32, y0: u32) -> RgbImage {
    let mut out = background.clone();
    imageops::replace(&mut out, patch, x0 as i64, y0 as i64);
    out
}

fn alpha(background: &RgbImage, patch: &RgbImage, x0: u32, y0: u32) -> RgbImage {
    let (w, h) = patch.dimensions();
    let mask = imaging::blur_kernel(&imaging::ellipse_mask(w, h, (0, 0, w, h)), ALPHA_BLUR_KERNEL);
    let region = imageops::crop_imm(background, x0, y0, w, h).to_image();
    let blended = imaging::blend_masked(&region, patch, &mask);
    direct(background, &blended, x0, y0)
}

/// Face and hair of the patch, binarized; a centered ellipse when segmentation
/// is unavailable or nearly empty.
fn seamless_mask(models: &mut FaceModels, patch: &RgbImage) -> GrayImage {
    let (w, h) = patch.dimensions();
    let segmented = models.parser.as_mut().and_then(|p| match p.parse(patch) {
        Ok(map) => {
            let mask = map.resized(w, h).union_mask(&parser::region_labels(true, false));
            Some(imaging::binarize(&mask, SEAMLESS_BINARY_THRESHOLD))
        }
        Err(e) => {
            tracing::warn!(error = %e, "pre-paste parsing failed");
            None
        }
    });
    match segmented {
        Some(mask) if imaging::coverage(&mask) >= MIN_SEAMLESS_COVERAGE => mask,
        _ => {
            let mw = w as f32 * FALLBACK_ELLIPSE_W;
            let mh = h as f32 * FALLBACK_ELLIPSE_H;
            let x0 = ((w as f32 - mw) / 2.0).round() as u32;
            let y0 = ((h as f32 - mh) / 2.0).round() as u32;
            imaging::ellipse_mask(w, h, (x0, y0, (x0 + mw.round() as u32).min(w), (y0 + mh.round() as u32).min(h)))
        }
    }
}
