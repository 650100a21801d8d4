//! Inpainting mask: segmentation label union with an ellipse fallback.

use crate::detector::DetectorError;
use crate::imaging;
use crate::models::FaceModels;
use crate::parser;
use crate::request::GenerationParams;
use crate::types::BoundingBox;
use image::{GrayImage, RgbImage};
use thiserror::Error;

// --- Named constants ---
/// Segmentation masks covering less than this fraction are discarded.
const MIN_SEGMENTATION_COVERAGE: f32 = 0.03;
/// Dilation iterations per unit of expansion, relative to the short side.
const DILATE_PER_EXPAND: f32 = 0.02;
const HAIR_EXPAND_MULTIPLIER: f32 = 1.5;
const HAIR_UPWARD_MULTIPLIER: f32 = 1.8;

#[derive(Error, Debug)]
pub enum MaskError {
    #[error("no face found in the background")]
    NoFace,
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaskMethod {
    Segmentation,
    Ellipse,
}

impl std::fmt::Display for MaskMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MaskMethod::Segmentation => f.write_str("segmentation"),
            MaskMethod::Ellipse => f.write_str("ellipse"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MaskOptions {
    pub expand: f32,
    pub blur: f32,
    pub include_hair: bool,
    pub include_neck: bool,
    pub padding: i32,
    pub use_segmentation: bool,
}

impl MaskOptions {
    pub fn from_params(params: &GenerationParams) -> Self {
        Self {
            expand: params.mask_expand,
            blur: params.mask_blur,
            include_hair: params.include_hair,
            include_neck: params.include_neck,
            padding: params.mask_padding,
            use_segmentation: params.use_segmentation,
        }
    }
}

/// Inpainting mask at the working resolution, 0 keep / 255 regenerate.
#[derive(Debug, Clone)]
pub struct FaceMask {
    pub mask: GrayImage,
    pub method: MaskMethod,
    pub include_hair: bool,
    pub include_neck: bool,
    pub expand: f32,
    pub blur: f32,
    pub coverage: f32,
    /// The face the mask was built around: the detected box for the ellipse,
    /// the labelled region's bounds for segmentation.
    pub face_box: BoundingBox,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct MaskBuilder;

impl MaskBuilder {
    pub fn new() -> Self {
        Self
    }

    /// Build the mask for the largest face in `image`.
    ///
    /// Segmentation is tried first when requested and a parser is loaded; it
    /// needs no detection. The detector is consulted only for the ellipse
    /// fallback, and no face there is an error.
    pub fn build_mask(
        &self,
        models: &mut FaceModels,
        image: &RgbImage,
        opts: &MaskOptions,
    ) -> Result<FaceMask, MaskError> {
        let segmented = if opts.use_segmentation {
            self.segmentation_mask(models, image, opts)
        } else {
            None
        };

        let (mask, method, face_box) = match segmented {
            Some((mask, face_box)) => (mask, MaskMethod::Segmentation, face_box),
            None => {
                let face_box = models.detector.largest_face(image)?.ok_or(MaskError::NoFace)?;
                (ellipse_mask(image, &face_box, opts), MaskMethod::Ellipse, face_box)
            }
        };
        let mask = imaging::pad_mask(&mask, opts.padding);
        let coverage = imaging::coverage(&mask);

        tracing::info!(
            method = %method,
            coverage,
            hair = opts.include_hair,
            neck = opts.include_neck,
            padding = opts.padding,
            "face mask built"
        );

        Ok(FaceMask {
            mask,
            method,
            include_hair: opts.include_hair,
            include_neck: opts.include_neck,
            expand: opts.expand,
            blur: opts.blur,
            coverage,
            face_box,
        })
    }

    /// The blurred label-union mask and the box around its labelled pixels.
    fn segmentation_mask(
        &self,
        models: &mut FaceModels,
        image: &RgbImage,
        opts: &MaskOptions,
    ) -> Option<(GrayImage, BoundingBox)> {
        let face_parser = models.parser.as_mut()?;
        let map = match face_parser.parse(image) {
            Ok(map) => map,
            Err(e) => {
                tracing::warn!(error = %e, "face parsing failed, using ellipse mask");
                return None;
            }
        };
        let map = map.resized(image.width(), image.height());
        let mask = map.union_mask(&parser::region_labels(opts.include_hair, opts.include_neck));

        let coverage = imaging::coverage(&mask);
        if coverage < MIN_SEGMENTATION_COVERAGE {
            tracing::warn!(coverage, "segmentation coverage too low, using ellipse mask");
            return None;
        }
        let (x0, y0, x1, y1) = imaging::mask_bounds(&mask)?;
        let face_box = BoundingBox::new(x0 as f32, y0 as f32, (x1 - x0) as f32, (y1 - y0) as f32);

        let mask = imaging::fill_holes(&mask);
        let short = image.width().min(image.height()) as f32;
        let iterations = (short * DILATE_PER_EXPAND * opts.expand).floor().max(0.0) as u32;
        let mask = imaging::dilate_iterations(&mask, iterations);
        Some((imaging::blur_radius(&mask, opts.blur), face_box))
    }
}

/// Ellipse inscribed in the face box grown by `expand` (more upward with hair).
fn ellipse_mask(image: &RgbImage, face: &BoundingBox, opts: &MaskOptions) -> GrayImage {
    let (w, h) = image.dimensions();
    let multiplier = if opts.include_hair { HAIR_EXPAND_MULTIPLIER } else { 1.0 };
    let expand_w = (face.width * opts.expand * multiplier).floor();
    let expand_h = (face.height * opts.expand * multiplier).floor();
    let expand_up = if opts.include_hair {
        (expand_h * HAIR_UPWARD_MULTIPLIER).floor()
    } else {
        expand_h
    };

    let x0 = (face.x - expand_w).max(0.0) as u32;
    let y0 = (face.y - expand_up).max(0.0) as u32;
    let x1 = ((face.x + face.width + expand_w).max(0.0) as u32).min(w);
    let y1 = ((face.y + face.height + expand_h).max(0.0) as u32).min(h);

    let mask = imaging::ellipse_mask(w, h, (x0, y0, x1, y1));
    let feather = opts.blur.max(0.0).round() as u32;
    imaging::blur_kernel(&mask, feather * 2 + 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use image::Rgb;

    fn opts() -> MaskOptions {
        MaskOptions::from_params(&GenerationParams::default())
    }

    fn background() -> RgbImage {
        RgbImage::from_pixel(128, 128, Rgb([90, 110, 130]))
    }

    #[test]
    fn test_no_face_is_error() {
        let mut models = testing::models_with_faces(vec![]);
        models.parser = Some(Box::new(testing::BlankParser));
        let err = MaskBuilder::new().build_mask(&mut models, &background(), &opts()).unwrap_err();
        assert!(matches!(err, MaskError::NoFace));

        models.parser = None;
        let err = MaskBuilder::new().build_mask(&mut models, &background(), &opts()).unwrap_err();
        assert!(matches!(err, MaskError::NoFace));
    }

    #[test]
    fn test_segmentation_needs_no_detection() {
        let mut models = testing::models_with_faces(vec![]);
        let fm = MaskBuilder::new().build_mask(&mut models, &background(), &opts()).unwrap();
        assert_eq!(fm.method, MaskMethod::Segmentation);
        assert!(fm.coverage > MIN_SEGMENTATION_COVERAGE);
        // Box around the fixture's skin and hair labels.
        assert!(fm.face_box.width > 0.0 && fm.face_box.height > 0.0);
        let (cx, cy) = fm.face_box.center();
        assert!(fm.mask.get_pixel(cx as u32, cy as u32)[0] > 250);
    }

    #[test]
    fn test_sparse_parse_falls_back_to_detected_ellipse() {
        let face = BoundingBox::new(40.0, 40.0, 48.0, 56.0);
        let mut models = testing::models_with_faces(vec![face.clone()]);
        models.parser = Some(Box::new(testing::SpeckParser));
        let fm = MaskBuilder::new().build_mask(&mut models, &background(), &opts()).unwrap();
        assert_eq!(fm.method, MaskMethod::Ellipse);
        assert_eq!(fm.face_box, face);
        assert!(fm.mask.get_pixel(64, 68)[0] > 250);
    }

    #[test]
    fn test_segmentation_mask_nonempty_and_sized() {
        let mut models = testing::models();
        let fm = MaskBuilder::new().build_mask(&mut models, &background(), &opts()).unwrap();
        assert_eq!(fm.method, MaskMethod::Segmentation);
        assert_eq!(fm.mask.dimensions(), (128, 128));
        assert!(fm.coverage > 0.0 && fm.coverage <= 1.0);
        assert!(fm.include_hair);
    }

    #[test]
    fn test_low_coverage_falls_back_to_ellipse() {
        let mut models = testing::models();
        models.parser = Some(Box::new(testing::BlankParser));
        let fm = MaskBuilder::new().build_mask(&mut models, &background(), &opts()).unwrap();
        assert_eq!(fm.method, MaskMethod::Ellipse);
        assert!(fm.coverage > 0.0);
    }

    #[test]
    fn test_segmentation_disabled_uses_ellipse() {
        let mut models = testing::models();
        let o = MaskOptions { use_segmentation: false, ..opts() };
        let fm = MaskBuilder::new().build_mask(&mut models, &background(), &o).unwrap();
        assert_eq!(fm.method, MaskMethod::Ellipse);
        // The face centre is inside the ellipse.
        let (cx, cy) = fm.face_box.center();
        assert!(fm.mask.get_pixel(cx as u32, cy as u32)[0] > 250);
    }

    #[test]
    fn test_hair_grows_ellipse_upward() {
        let mut models = testing::models();
        let no_hair = MaskOptions { use_segmentation: false, include_hair: false, blur: 0.0, ..opts() };
        let hair = MaskOptions { include_hair: true, ..no_hair };
        let a = MaskBuilder::new().build_mask(&mut models, &background(), &no_hair).unwrap();
        let b = MaskBuilder::new().build_mask(&mut models, &background(), &hair).unwrap();
        assert!(b.coverage > a.coverage);
        let top = |m: &GrayImage| (0..m.height()).find(|&y| (0..m.width()).any(|x| m.get_pixel(x, y)[0] > 0));
        assert!(top(&b.mask) < top(&a.mask));
    }

    #[test]
    fn test_idempotent() {
        let mut models = testing::models();
        let a = MaskBuilder::new().build_mask(&mut models, &background(), &opts()).unwrap();
        let b = MaskBuilder::new().build_mask(&mut models, &background(), &opts()).unwrap();
        assert_eq!(a.mask, b.mask);
    }

    #[test]
    fn test_padding_zero_is_noop_and_positive_grows() {
        let mut models = testing::models();
        let base = MaskBuilder::new().build_mask(&mut models, &background(), &opts()).unwrap();
        let padded = MaskBuilder::new()
            .build_mask(&mut models, &background(), &MaskOptions { padding: 6, ..opts() })
            .unwrap();
        let eroded = MaskBuilder::new()
            .build_mask(&mut models, &background(), &MaskOptions { padding: -6, ..opts() })
            .unwrap();
        assert!(padded.coverage >= base.coverage);
        assert!(eroded.coverage <= base.coverage);
        assert_eq!(imaging::pad_mask(&base.mask, 0), base.mask);
    }
}
