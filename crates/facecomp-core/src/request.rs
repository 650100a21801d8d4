//! Composite requests, generation knobs and identity-mode selection.

use crate::prepaste::BlendMethod;
use crate::swap::SwapModel;
use image::RgbImage;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum RequestError {
    #[error("{field} = {value} is outside [0, 1]")]
    OutOfUnitRange { field: &'static str, value: f32 },
    #[error("{field} = {value} must not be negative")]
    Negative { field: &'static str, value: f32 },
    #[error("steps must be at least 1")]
    ZeroSteps,
    #[error("{0} image is empty")]
    EmptyImage(&'static str),
}

/// Pre-paste stage configuration.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PrePasteOptions {
    #[serde(default)]
    pub blend: BlendMethod,
}

/// Face-enhancement stage configuration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EnhanceOptions {
    /// 1.0 applies the restorer fully, lower values blend against the input.
    pub ratio: f32,
}

impl Default for EnhanceOptions {
    fn default() -> Self {
        Self { ratio: 1.0 }
    }
}

/// Swap-refinement stage configuration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RefineOptions {
    /// Denoising strength of the harmonizing pass, clamped to [0.1, 0.5].
    pub strength: f32,
    pub steps: u32,
}

impl Default for RefineOptions {
    fn default() -> Self {
        Self { strength: 0.3, steps: 20 }
    }
}

/// Every numeric and boolean knob of a composite request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationParams {
    pub prompt: String,
    /// `None` uses the built-in negative prompt.
    pub negative_prompt: Option<String>,
    pub face_strength: f32,
    pub denoising_strength: f32,
    pub steps: u32,
    pub guidance_scale: f32,
    pub mask_expand: f32,
    pub mask_blur: f32,
    pub mask_padding: i32,
    pub stop_at: f32,
    pub face_blend_weight: f32,
    pub hair_blend_weight: f32,
    pub shortcut_scale: f32,
    pub seed: u64,
    pub include_hair: bool,
    pub include_neck: bool,
    pub use_segmentation: bool,
    pub gender_detect: bool,
    pub auto_prompt: bool,
    pub save_preview: bool,
    pub pre_paste: Option<PrePasteOptions>,
    pub face_swap: Option<SwapModel>,
    pub swap_refine: Option<RefineOptions>,
    pub enhance: Option<EnhanceOptions>,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            prompt: String::new(),
            negative_prompt: None,
            face_strength: 0.85,
            denoising_strength: 0.92,
            steps: 50,
            guidance_scale: 7.5,
            mask_expand: 0.3,
            mask_blur: 15.0,
            mask_padding: 0,
            stop_at: 1.0,
            face_blend_weight: 0.6,
            hair_blend_weight: 0.4,
            shortcut_scale: 1.0,
            seed: 0,
            include_hair: true,
            include_neck: false,
            use_segmentation: true,
            gender_detect: true,
            auto_prompt: false,
            save_preview: false,
            pre_paste: None,
            face_swap: None,
            swap_refine: None,
            enhance: None,
        }
    }
}

impl GenerationParams {
    /// Reject knob values outside their documented ranges.
    pub fn validate(&self) -> Result<(), RequestError> {
        let unit = [
            ("face_strength", self.face_strength),
            ("denoising_strength", self.denoising_strength),
            ("stop_at", self.stop_at),
            ("face_blend_weight", self.face_blend_weight),
            ("hair_blend_weight", self.hair_blend_weight),
            ("shortcut_scale", self.shortcut_scale),
        ];
        for (field, value) in unit {
            if !(0.0..=1.0).contains(&value) {
                return Err(RequestError::OutOfUnitRange { field, value });
            }
        }
        if let Some(enhance) = &self.enhance {
            if !(0.0..=1.0).contains(&enhance.ratio) {
                return Err(RequestError::OutOfUnitRange {
                    field: "enhance_ratio",
                    value: enhance.ratio,
                });
            }
        }
        for (field, value) in [
            ("mask_expand", self.mask_expand),
            ("mask_blur", self.mask_blur),
            ("guidance_scale", self.guidance_scale),
        ] {
            if value < 0.0 || !value.is_finite() {
                return Err(RequestError::Negative { field, value });
            }
        }
        if self.steps == 0 {
            return Err(RequestError::ZeroSteps);
        }
        Ok(())
    }

    /// Face and hair weights scaled to sum to 1. Two zero weights mean face only.
    pub fn normalized_blend_weights(&self) -> (f32, f32) {
        let sum = self.face_blend_weight + self.hair_blend_weight;
        if sum <= 0.0 {
            return (1.0, 0.0);
        }
        (self.face_blend_weight / sum, self.hair_blend_weight / sum)
    }
}

/// Background, source face and knobs for one composite.
#[derive(Debug, Clone)]
pub struct CompositeRequest {
    pub background: RgbImage,
    pub face: RgbImage,
    pub params: GenerationParams,
}

impl CompositeRequest {
    pub fn new(background: RgbImage, face: RgbImage, params: GenerationParams) -> Result<Self, RequestError> {
        if background.width() == 0 || background.height() == 0 {
            return Err(RequestError::EmptyImage("background"));
        }
        if face.width() == 0 || face.height() == 0 {
            return Err(RequestError::EmptyImage("face"));
        }
        params.validate()?;
        Ok(Self { background, face, params })
    }
}

/// How the source identity conditions the inpainting engine.
///
/// Mode-specific tunables live in the variant; the kind is fixed when the
/// orchestrator is built and only changes through explicit switches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum IdentityMode {
    /// Pure inpainting.
    None,
    /// Raw source image through the engine's own image encoder.
    Standard,
    /// 512-d identity embedding only.
    FaceId,
    /// Identity embedding plus CLIP hidden states for the hairstyle.
    FaceIdPlus { shortcut_scale: f32 },
    /// Hair image and face image routed to two adapters.
    Dual,
    /// Pixel-level face/hair composite through one encoder.
    ClipBlend { face_weight: f32, hair_weight: f32 },
}

impl IdentityMode {
    pub fn name(&self) -> &'static str {
        match self {
            IdentityMode::None => "none",
            IdentityMode::Standard => "standard",
            IdentityMode::FaceId => "faceid",
            IdentityMode::FaceIdPlus { .. } => "faceid_plus",
            IdentityMode::Dual => "dual",
            IdentityMode::ClipBlend { .. } => "clip_blend",
        }
    }

    /// Refresh the variant's tunables from request knobs, keeping its kind.
    pub fn with_knobs(&self, params: &GenerationParams) -> IdentityMode {
        match self {
            IdentityMode::FaceIdPlus { .. } => IdentityMode::FaceIdPlus {
                shortcut_scale: params.shortcut_scale,
            },
            IdentityMode::ClipBlend { .. } => {
                let (face_weight, hair_weight) = params.normalized_blend_weights();
                IdentityMode::ClipBlend { face_weight, hair_weight }
            }
            other => other.clone(),
        }
    }
}

impl std::fmt::Display for IdentityMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Requested modes, as loose switches from a CLI or config file.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ModeFlags {
    pub clip_blend: bool,
    pub faceid_plus: bool,
    pub dual: bool,
    pub faceid: bool,
    pub standard: bool,
}

impl ModeFlags {
    /// Resolve to one mode by precedence:
    /// clip_blend > faceid_plus > dual > faceid > standard > none.
    pub fn select(&self, params: &GenerationParams) -> IdentityMode {
        let mode = if self.clip_blend {
            IdentityMode::ClipBlend { face_weight: 0.0, hair_weight: 0.0 }
        } else if self.faceid_plus {
            IdentityMode::FaceIdPlus { shortcut_scale: 0.0 }
        } else if self.dual {
            IdentityMode::Dual
        } else if self.faceid {
            IdentityMode::FaceId
        } else if self.standard {
            IdentityMode::Standard
        } else {
            IdentityMode::None
        };
        mode.with_knobs(params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let p = GenerationParams::default();
        assert!(p.validate().is_ok());
        assert_eq!(p.steps, 50);
        assert!((p.face_strength - 0.85).abs() < 1e-6);
        assert!((p.stop_at - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_validate_bounds() {
        let p = GenerationParams { stop_at: 1.2, ..Default::default() };
        assert_eq!(
            p.validate(),
            Err(RequestError::OutOfUnitRange { field: "stop_at", value: 1.2 })
        );
        let p = GenerationParams { denoising_strength: 1.01, ..Default::default() };
        assert!(p.validate().is_err());
        let p = GenerationParams { steps: 0, ..Default::default() };
        assert_eq!(p.validate(), Err(RequestError::ZeroSteps));
        let p = GenerationParams { mask_blur: -1.0, ..Default::default() };
        assert!(p.validate().is_err());
    }

    #[test]
    fn test_blend_weights_renormalized() {
        let p = GenerationParams { face_blend_weight: 0.3, hair_blend_weight: 0.1, ..Default::default() };
        let (f, h) = p.normalized_blend_weights();
        assert!((f - 0.75).abs() < 1e-6 && (h - 0.25).abs() < 1e-6);
        let p = GenerationParams { face_blend_weight: 0.0, hair_blend_weight: 0.0, ..Default::default() };
        assert_eq!(p.normalized_blend_weights(), (1.0, 0.0));
    }

    #[test]
    fn test_mode_precedence() {
        let p = GenerationParams::default();
        let all = ModeFlags { clip_blend: true, faceid_plus: true, dual: true, faceid: true, standard: true };
        assert_eq!(all.select(&p).name(), "clip_blend");
        let f = ModeFlags { faceid_plus: true, dual: true, faceid: true, ..Default::default() };
        assert_eq!(f.select(&p), IdentityMode::FaceIdPlus { shortcut_scale: 1.0 });
        let f = ModeFlags { dual: true, faceid: true, standard: true, ..Default::default() };
        assert_eq!(f.select(&p), IdentityMode::Dual);
        let f = ModeFlags { faceid: true, standard: true, ..Default::default() };
        assert_eq!(f.select(&p), IdentityMode::FaceId);
        let f = ModeFlags { standard: true, ..Default::default() };
        assert_eq!(f.select(&p), IdentityMode::Standard);
        assert_eq!(ModeFlags::default().select(&p), IdentityMode::None);
    }

    #[test]
    fn test_clip_blend_carries_normalized_weights() {
        let p = GenerationParams::default();
        let f = ModeFlags { clip_blend: true, ..Default::default() };
        match f.select(&p) {
            IdentityMode::ClipBlend { face_weight, hair_weight } => {
                assert!((face_weight - 0.6).abs() < 1e-6);
                assert!((hair_weight - 0.4).abs() < 1e-6);
            }
            other => panic!("unexpected mode {other}"),
        }
    }

    #[test]
    fn test_request_rejects_empty_images() {
        let err = CompositeRequest::new(RgbImage::new(0, 0), RgbImage::new(4, 4), GenerationParams::default());
        assert_eq!(err.err(), Some(RequestError::EmptyImage("background")));
    }

    #[test]
    fn test_params_json_defaults() {
        let p: GenerationParams = serde_json::from_str(r#"{"prompt":"smiling","steps":20}"#).unwrap();
        assert_eq!(p.steps, 20);
        assert_eq!(p.prompt, "smiling");
        assert!((p.mask_expand - 0.3).abs() < 1e-6);
    }
}
