//! Identity conditioning: turns the source face into the payload the
//! inpainting engine consumes, per [`IdentityMode`], with each mode's
//! documented degrade path.

use crate::engine::{Device, EngineTarget, Precision};
use crate::imaging::{self, NEUTRAL_GRAY};
use crate::models::FaceModels;
use crate::request::IdentityMode;
use crate::types::Embedding;
use image::{Rgb, RgbImage};
use ndarray::{concatenate, ArrayD, ArrayViewD, Axis, IxDyn, Slice};

// --- Named constants ---
/// Hair pixels blended into the source face in `standard` mode.
const STANDARD_HAIR_WEIGHT: f32 = 0.3;
/// Per-channel distance from gray that marks a hair pixel in `standard` mode.
const STANDARD_HAIR_THRESHOLD: i16 = 10;
/// Per-channel distance from gray that marks a hair pixel in `clip_blend` mode.
const CLIP_BLEND_HAIR_THRESHOLD: i16 = 20;
const DUAL_HAIR_FACTOR: f32 = 0.4;
const DUAL_FACE_FACTOR: f32 = 0.8;

/// Adapter strengths for one step.
#[derive(Debug, Clone, PartialEq)]
pub enum AdapterScales {
    Single(f32),
    PerAdapter(Vec<f32>),
}

impl AdapterScales {
    pub fn zeroed(&self) -> AdapterScales {
        match self {
            AdapterScales::Single(_) => AdapterScales::Single(0.0),
            AdapterScales::PerAdapter(v) => AdapterScales::PerAdapter(vec![0.0; v.len()]),
        }
    }

    pub fn is_zero(&self) -> bool {
        self.values().iter().all(|v| *v == 0.0)
    }

    pub fn values(&self) -> Vec<f32> {
        match self {
            AdapterScales::Single(s) => vec![*s],
            AdapterScales::PerAdapter(v) => v.clone(),
        }
    }

    /// Strongest single adapter strength.
    pub fn peak(&self) -> f32 {
        self.values().into_iter().fold(0.0, f32::max)
    }
}

/// A negative/positive guidance pair: zeros and the real tensor stacked on axis 0.
#[derive(Debug, Clone, PartialEq)]
pub struct CfgPair {
    tensor: ArrayD<f32>,
    precision: Precision,
    device: Device,
}

impl CfgPair {
    /// Pair `positive` with zeros of the same shape, cast for `target`.
    pub fn new(positive: ArrayViewD<'_, f32>, target: EngineTarget) -> CfgPair {
        let negative = ArrayD::<f32>::zeros(positive.raw_dim());
        let tensor = concatenate(Axis(0), &[negative.view(), positive])
            .unwrap_or_else(|_| ArrayD::zeros(IxDyn(&[0])));
        let tensor = match target.precision {
            Precision::F16 => tensor.mapv(round_to_f16),
            Precision::F32 => tensor,
        };
        CfgPair {
            tensor,
            precision: target.precision,
            device: target.device,
        }
    }

    /// Pair for a single identity vector, shaped (2, 1, D).
    pub fn identity(embedding: &Embedding, target: EngineTarget) -> CfgPair {
        let dim = embedding.dim();
        let positive = ArrayD::from_shape_vec(IxDyn(&[1, 1, dim]), embedding.values.clone())
            .unwrap_or_else(|_| ArrayD::zeros(IxDyn(&[1, 1, dim])));
        CfgPair::new(positive.view(), target)
    }

    pub fn shape(&self) -> &[usize] {
        self.tensor.shape()
    }

    pub fn tensor(&self) -> &ArrayD<f32> {
        &self.tensor
    }

    pub fn precision(&self) -> Precision {
        self.precision
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn negative(&self) -> ArrayViewD<'_, f32> {
        let half = self.tensor.len_of(Axis(0)) / 2;
        self.tensor.slice_axis(Axis(0), Slice::from(..half))
    }

    pub fn positive(&self) -> ArrayViewD<'_, f32> {
        let half = self.tensor.len_of(Axis(0)) / 2;
        self.tensor.slice_axis(Axis(0), Slice::from(half..))
    }

    /// Same shape and tags, all zeros.
    pub fn zeroed(&self) -> CfgPair {
        CfgPair {
            tensor: ArrayD::zeros(self.tensor.raw_dim()),
            precision: self.precision,
            device: self.device,
        }
    }
}

/// Round an f32 to the nearest value representable in IEEE half precision.
pub fn round_to_f16(v: f32) -> f32 {
    const F16_MAX: f32 = 65504.0;
    const F16_MIN_NORMAL: f32 = 6.103_515_6e-5;
    const F16_SUBNORMAL_STEP: f32 = 5.960_464_5e-8;

    if !v.is_finite() {
        return v;
    }
    let a = v.abs();
    if a >= F16_MAX {
        return F16_MAX.copysign(v);
    }
    if a < F16_MIN_NORMAL {
        return (v / F16_SUBNORMAL_STEP).round() * F16_SUBNORMAL_STEP;
    }
    // Keep 10 mantissa bits, round half to even.
    let bits = v.to_bits();
    let lsb = (bits >> 13) & 1;
    let rounded = bits.wrapping_add(0x0FFF + lsb) & !0x1FFF;
    f32::from_bits(rounded)
}

/// CLIP hidden states handed straight to the engine's projection layer.
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectionInjection {
    /// Shaped (2, 1, S, H).
    pub clip_pair: CfgPair,
    pub shortcut_scale: f32,
}

/// Everything the engine needs to apply identity conditioning for one call.
#[derive(Debug, Clone)]
pub struct ConditioningPayload {
    /// The mode the orchestrator asked for.
    pub requested: IdentityMode,
    /// The mode actually delivered after any degrade.
    pub effective: IdentityMode,
    /// Raw images for the engine's own image encoder(s).
    pub images: Vec<RgbImage>,
    /// Adapter index for each entry of `images`.
    pub routing: Vec<usize>,
    /// Conventional embedding inputs (identity pairs).
    pub image_embeds: Vec<CfgPair>,
    pub projection: Option<ProjectionInjection>,
    /// Scales while identity conditioning is on.
    pub scales: AdapterScales,
    /// Why the effective mode differs from the requested one, if it does.
    pub degraded: Option<String>,
}

impl ConditioningPayload {
    /// No conditioning at all.
    pub fn none(requested: IdentityMode) -> ConditioningPayload {
        ConditioningPayload {
            requested,
            effective: IdentityMode::None,
            images: Vec::new(),
            routing: Vec::new(),
            image_embeds: Vec::new(),
            projection: None,
            scales: AdapterScales::Single(0.0),
            degraded: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty() && self.image_embeds.is_empty() && self.projection.is_none()
    }

    /// Same layout with every embedding zeroed and every scale at 0.
    pub fn zeroed(&self) -> ConditioningPayload {
        ConditioningPayload {
            requested: self.requested.clone(),
            effective: self.effective.clone(),
            images: self.images.clone(),
            routing: self.routing.clone(),
            image_embeds: self.image_embeds.iter().map(CfgPair::zeroed).collect(),
            projection: self.projection.as_ref().map(|p| ProjectionInjection {
                clip_pair: p.clip_pair.zeroed(),
                shortcut_scale: 0.0,
            }),
            scales: self.scales.zeroed(),
            degraded: self.degraded.clone(),
        }
    }

    fn standard(requested: IdentityMode, image: RgbImage, strength: f32, degraded: Option<String>) -> Self {
        ConditioningPayload {
            requested,
            effective: IdentityMode::Standard,
            images: vec![image],
            routing: vec![0],
            image_embeds: Vec::new(),
            projection: None,
            scales: AdapterScales::Single(strength),
            degraded,
        }
    }
}

/// True when any channel of `p` is more than `threshold` away from neutral gray.
fn differs_from_gray(p: &Rgb<u8>, threshold: i16) -> bool {
    p.0.iter().any(|&c| (c as i16 - NEUTRAL_GRAY as i16).abs() > threshold)
}

/// Blend hair pixels into the face at `weight`; hair pixels are those far from gray.
fn blend_hair(face: &RgbImage, hair: &RgbImage, hair_weight: f32, threshold: i16) -> RgbImage {
    let hair = imaging::resize_rgb(hair, face.width(), face.height());
    RgbImage::from_fn(face.width(), face.height(), |x, y| {
        let f = face.get_pixel(x, y);
        let h = hair.get_pixel(x, y);
        if !differs_from_gray(h, threshold) {
            return *f;
        }
        Rgb(std::array::from_fn(|c| {
            (f[c] as f32 * (1.0 - hair_weight) + h[c] as f32 * hair_weight)
                .round()
                .clamp(0.0, 255.0) as u8
        }))
    })
}

/// Source image for `standard` conditioning: the face with its hair lightly blended in.
pub fn standard_image(face: &RgbImage, hair: Option<&RgbImage>) -> RgbImage {
    match hair {
        Some(hair) => blend_hair(face, hair, STANDARD_HAIR_WEIGHT, STANDARD_HAIR_THRESHOLD),
        None => face.clone(),
    }
}

/// Source image for `clip_blend` conditioning. Without hair, the face unchanged.
pub fn clip_blend_image(face: &RgbImage, hair: Option<&RgbImage>, hair_weight: f32) -> RgbImage {
    match hair {
        Some(hair) => blend_hair(face, hair, hair_weight, CLIP_BLEND_HAIR_THRESHOLD),
        None => face.clone(),
    }
}

/// Builds [`ConditioningPayload`]s for a given engine precision and device.
pub struct IdentityConditioner {
    target: EngineTarget,
}

impl IdentityConditioner {
    pub fn new(target: EngineTarget) -> Self {
        Self { target }
    }

    /// Prepare conditioning for one request. Never fails: every mode degrades
    /// to a weaker one instead.
    pub fn prepare(
        &self,
        models: &mut FaceModels,
        mode: &IdentityMode,
        face: &RgbImage,
        hair: Option<&RgbImage>,
        strength: f32,
    ) -> ConditioningPayload {
        let payload = match mode {
            IdentityMode::None => ConditioningPayload::none(IdentityMode::None),
            IdentityMode::Standard => {
                ConditioningPayload::standard(mode.clone(), standard_image(face, hair), strength, None)
            }
            IdentityMode::FaceId => match extract_identity(models, face) {
                Ok(embedding) => ConditioningPayload {
                    requested: mode.clone(),
                    effective: IdentityMode::FaceId,
                    images: Vec::new(),
                    routing: Vec::new(),
                    image_embeds: vec![CfgPair::identity(&embedding, self.target)],
                    projection: None,
                    scales: AdapterScales::Single(strength),
                    degraded: None,
                },
                Err(reason) => ConditioningPayload::standard(
                    mode.clone(),
                    standard_image(face, hair),
                    strength,
                    Some(format!("identity extraction failed ({reason}); using standard")),
                ),
            },
            IdentityMode::FaceIdPlus { shortcut_scale } => {
                self.faceid_plus(models, mode, face, hair, strength, *shortcut_scale)
            }
            IdentityMode::Dual => match extract_identity(models, face) {
                Ok(embedding) => {
                    let hair_or_face = hair.cloned().unwrap_or_else(|| face.clone());
                    ConditioningPayload {
                        requested: mode.clone(),
                        effective: IdentityMode::Dual,
                        images: vec![hair_or_face, face.clone()],
                        routing: vec![0, 1],
                        image_embeds: vec![CfgPair::identity(&embedding, self.target)],
                        projection: None,
                        scales: AdapterScales::PerAdapter(vec![
                            strength * DUAL_HAIR_FACTOR,
                            strength * DUAL_FACE_FACTOR,
                        ]),
                        degraded: None,
                    }
                }
                Err(reason) => ConditioningPayload::standard(
                    mode.clone(),
                    face.clone(),
                    strength,
                    Some(format!("identity extraction failed ({reason}); face image under standard")),
                ),
            },
            IdentityMode::ClipBlend { hair_weight, .. } => {
                let degraded = hair.is_none().then(|| "no hair region; unmodified source face".to_string());
                ConditioningPayload {
                    requested: mode.clone(),
                    effective: mode.clone(),
                    images: vec![clip_blend_image(face, hair, *hair_weight)],
                    routing: vec![0],
                    image_embeds: Vec::new(),
                    projection: None,
                    scales: AdapterScales::Single(strength),
                    degraded,
                }
            }
        };

        if let Some(reason) = &payload.degraded {
            tracing::warn!(requested = %payload.requested, effective = %payload.effective, reason = %reason, "identity conditioning degraded");
        } else {
            tracing::info!(mode = %payload.effective, strength, "identity conditioning prepared");
        }
        payload
    }

    fn faceid_plus(
        &self,
        models: &mut FaceModels,
        mode: &IdentityMode,
        face: &RgbImage,
        hair: Option<&RgbImage>,
        strength: f32,
        shortcut_scale: f32,
    ) -> ConditioningPayload {
        let identity = extract_identity(models, face);
        let clip = match models.clip.as_mut() {
            Some(encoder) => encoder.hidden_states(face).map_err(|e| e.to_string()),
            None => Err("CLIP encoder unavailable".to_string()),
        };

        match (identity, clip) {
            (identity, Ok(hidden)) => {
                let (embedding, degraded) = match identity {
                    Ok(e) => (e, None),
                    Err(reason) => (
                        Embedding::zeros(crate::recognizer::ARCFACE_EMBEDDING_DIM),
                        Some(format!("identity extraction failed ({reason}); zero identity with CLIP")),
                    ),
                };
                // (1, S, H) -> (1, 1, S, H) so the pair comes out as (2, 1, S, H).
                let positive = hidden.insert_axis(Axis(1)).into_dyn();
                ConditioningPayload {
                    requested: mode.clone(),
                    effective: mode.clone(),
                    images: Vec::new(),
                    routing: Vec::new(),
                    image_embeds: vec![CfgPair::identity(&embedding, self.target)],
                    projection: Some(ProjectionInjection {
                        clip_pair: CfgPair::new(positive.view(), self.target),
                        shortcut_scale,
                    }),
                    scales: AdapterScales::Single(strength),
                    degraded,
                }
            }
            (Ok(embedding), Err(reason)) => ConditioningPayload {
                requested: mode.clone(),
                effective: IdentityMode::FaceId,
                images: Vec::new(),
                routing: Vec::new(),
                image_embeds: vec![CfgPair::identity(&embedding, self.target)],
                projection: None,
                scales: AdapterScales::Single(strength),
                degraded: Some(format!("CLIP hidden states failed ({reason}); identity only")),
            },
            (Err(id_reason), Err(clip_reason)) => ConditioningPayload::standard(
                mode.clone(),
                standard_image(face, hair),
                strength,
                Some(format!("identity ({id_reason}) and CLIP ({clip_reason}) both failed; using standard")),
            ),
        }
    }
}

fn extract_identity(models: &mut FaceModels, face: &RgbImage) -> Result<Embedding, String> {
    match models.identity.as_mut() {
        Some(extractor) => extractor.extract_identity(face).map_err(|e| e.to_string()),
        None => Err("identity extractor unavailable".to_string()),
    }
}
