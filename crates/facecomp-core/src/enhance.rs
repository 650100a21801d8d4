//! Face restoration (GFPGAN v1.4) and partial-strength blending.

use crate::detector::{DetectorError, FaceDetector, FaceLocator};
use crate::imaging;
use image::{imageops, imageops::FilterType, RgbImage};
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

// --- Named constants ---
const GFPGAN_INPUT_SIZE: u32 = 512;
/// The restored square is this much larger than the detected face box.
const CROP_EXPAND: f32 = 0.5;
const PASTE_FEATHER: u32 = 31;

#[derive(Error, Debug)]
pub enum EnhanceError {
    #[error("model file not found: {0} (place gfpgan_v1.4.onnx in the model dir)")]
    ModelNotFound(String),
    #[error("no face found to enhance")]
    NoFace,
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Restores the largest face of an image at full strength.
pub trait FaceRestorer {
    fn restore(&mut self, image: &RgbImage) -> Result<RgbImage, EnhanceError>;
}

/// `original*(1-ratio) + enhanced*ratio`, resizing `enhanced` when needed.
pub fn blend_ratio(original: &RgbImage, enhanced: &RgbImage, ratio: f32) -> RgbImage {
    let ratio = ratio.clamp(0.0, 1.0);
    let enhanced = imaging::resize_rgb(enhanced, original.width(), original.height());
    RgbImage::from_fn(original.width(), original.height(), |x, y| {
        let o = original.get_pixel(x, y);
        let e = enhanced.get_pixel(x, y);
        image::Rgb(std::array::from_fn(|c| {
            (o[c] as f32 * (1.0 - ratio) + e[c] as f32 * ratio).round().clamp(0.0, 255.0) as u8
        }))
    })
}

pub struct GfpganRestorer {
    session: Session,
    detector: FaceDetector,
}

impl GfpganRestorer {
    pub fn load(model_path: &str, scrfd_path: &str) -> Result<Self, EnhanceError> {
        if !Path::new(model_path).exists() {
            return Err(EnhanceError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = model_path,
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            "loaded GFPGAN model"
        );

        Ok(Self {
            session,
            detector: FaceDetector::load(scrfd_path)?,
        })
    }

    fn restore_crop(&mut self, crop: &RgbImage) -> Result<RgbImage, EnhanceError> {
        let size = GFPGAN_INPUT_SIZE;
        let resized = imageops::resize(crop, size, size, FilterType::Lanczos3);
        let input = imaging::rgb_to_nchw(&resized, 1.0 / 255.0, [0.5; 3], [0.5; 3]);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| EnhanceError::InferenceFailed(format!("restored face: {e}")))?;

        imaging::nchw_to_rgb(data, size as usize, size as usize, -1.0, 1.0)
            .ok_or_else(|| EnhanceError::InferenceFailed(format!("expected 3x{size}x{size} output")))
    }
}

impl FaceRestorer for GfpganRestorer {
    fn restore(&mut self, image: &RgbImage) -> Result<RgbImage, EnhanceError> {
        let face = self.detector.largest_face(image)?.ok_or(EnhanceError::NoFace)?;

        // Square crop centred on the face.
        let side = face.width.max(face.height) * (1.0 + CROP_EXPAND);
        let (cx, cy) = face.center();
        let square = crate::types::BoundingBox::new(cx - side / 2.0, cy - side / 2.0, side, side);
        let (x0, y0, x1, y1) = square
            .clamped_rect(image.width(), image.height())
            .ok_or(EnhanceError::NoFace)?;
        let crop = imageops::crop_imm(image, x0, y0, x1 - x0, y1 - y0).to_image();

        let restored = self.restore_crop(&crop)?;
        let restored = imageops::resize(&restored, crop.width(), crop.height(), FilterType::Lanczos3);

        let mask = imaging::ellipse_mask(crop.width(), crop.height(), (0, 0, crop.width(), crop.height()));
        let mask = imaging::blur_kernel(&mask, PASTE_FEATHER);
        let blended = imaging::blend_masked(&crop, &restored, &mask);

        let mut out = image.clone();
        imageops::replace(&mut out, &blended, x0 as i64, y0 as i64);
        tracing::debug!(confidence = face.confidence, "face restored");
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_blend_ratio_endpoints() {
        let o = RgbImage::from_pixel(4, 4, Rgb([0, 100, 200]));
        let e = RgbImage::from_pixel(4, 4, Rgb([200, 100, 0]));
        assert_eq!(blend_ratio(&o, &e, 0.0), o);
        assert_eq!(blend_ratio(&o, &e, 1.0), e);
        assert_eq!(*blend_ratio(&o, &e, 0.5).get_pixel(1, 1), Rgb([100, 100, 100]));
    }

    #[test]
    fn test_blend_ratio_resizes_enhanced() {
        let o = RgbImage::from_pixel(8, 6, Rgb([50, 50, 50]));
        let e = RgbImage::from_pixel(16, 12, Rgb([150, 150, 150]));
        let out = blend_ratio(&o, &e, 0.8);
        assert_eq!(out.dimensions(), (8, 6));
        assert_eq!(*out.get_pixel(3, 3), Rgb([130, 130, 130]));
    }

    #[test]
    fn test_load_missing_model() {
        assert!(matches!(
            GfpganRestorer::load("/nonexistent/gfpgan.onnx", "").err(),
            Some(EnhanceError::ModelNotFound(_))
        ));
    }
}
