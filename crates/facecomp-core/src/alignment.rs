//! Landmark alignment.
//!
//! Warps a face onto the five-point ArcFace template so the identity, swap
//! and restoration networks see a canonical crop, and composites processed
//! crops back into the frame they came from.

use image::{GrayImage, ImageBuffer, Luma, Pixel, RgbImage};
use imageproc::geometric_transformations::{warp_into, Interpolation, Projection};

use crate::imaging;

/// ArcFace template for a 112×112 crop: eyes, nose tip, mouth corners.
const TEMPLATE_112: [(f32, f32); 5] = [
    (38.2946, 51.6963),
    (73.5318, 51.5014),
    (56.0252, 71.7366),
    (41.5493, 92.3655),
    (70.7299, 92.2041),
];

pub const ALIGNED_SIZE: u32 = 112;

/// The ArcFace template scaled to a `size`×`size` crop.
pub fn reference_landmarks(size: u32) -> [(f32, f32); 5] {
    let k = size as f32 / ALIGNED_SIZE as f32;
    TEMPLATE_112.map(|(x, y)| (x * k, y * k))
}

/// Rotation, uniform scale and translation taking one landmark set onto another.
///
/// Row-major 2×3: `[a, -b, tx, b, a, ty]`.
pub type Similarity = [f32; 6];

/// Closed-form least-squares similarity from `from` onto `to`.
///
/// Centring both point sets removes the translation; what remains is a
/// complex-number regression for `a + ib`. A degenerate `from` (all points
/// coincident) yields a pure translation.
pub fn fit_similarity(from: &[(f32, f32); 5], to: &[(f32, f32); 5]) -> Similarity {
    let centroid = |pts: &[(f32, f32); 5]| {
        let (sx, sy) = pts.iter().fold((0.0, 0.0), |(ax, ay), &(x, y)| (ax + x, ay + y));
        (sx / 5.0, sy / 5.0)
    };
    let (fx, fy) = centroid(from);
    let (tx, ty) = centroid(to);

    let (mut dot, mut cross, mut spread) = (0.0f32, 0.0f32, 0.0f32);
    for (&(x, y), &(u, v)) in from.iter().zip(to) {
        let (x, y, u, v) = (x - fx, y - fy, u - tx, v - ty);
        dot += x * u + y * v;
        cross += x * v - y * u;
        spread += x * x + y * y;
    }

    let (a, b) = if spread > f32::EPSILON {
        (dot / spread, cross / spread)
    } else {
        (1.0, 0.0)
    };
    [a, -b, tx - (a * fx - b * fy), b, a, ty - (b * fx + a * fy)]
}

fn projection(m: &Similarity) -> Option<Projection> {
    Projection::from_matrix([m[0], m[1], m[2], m[3], m[4], m[5], 0.0, 0.0, 1.0])
}

/// Resample `image` through `m` into a fresh `width`×`height` buffer.
///
/// Pixels that map outside the source stay zero. A singular `m` produces an
/// all-zero buffer.
fn resample<P>(image: &ImageBuffer<P, Vec<u8>>, m: &Projection, width: u32, height: u32) -> ImageBuffer<P, Vec<u8>>
where
    P: Pixel<Subpixel = u8> + Send + Sync,
{
    let mut out = ImageBuffer::new(width, height);
    let blank = *out.get_pixel(0, 0);
    warp_into(image, m, Interpolation::Bilinear, blank, &mut out);
    out
}

/// Align a detected face to a canonical `size`×`size` crop.
///
/// Returns the crop and the frame → crop transform, which [`paste_back`] needs.
pub fn align_face(image: &RgbImage, landmarks: &[(f32, f32); 5], size: u32) -> (RgbImage, Similarity) {
    let m = fit_similarity(landmarks, &reference_landmarks(size));
    let crop = match projection(&m) {
        Some(p) => resample(image, &p, size, size),
        None => {
            tracing::warn!(?landmarks, "degenerate landmarks, crop left blank");
            RgbImage::new(size, size)
        }
    };
    (crop, m)
}

/// Composite a processed crop back into `frame` through the inverse of `m`,
/// feathering the crop border with a Gaussian of kernel size `feather`.
pub fn paste_back(frame: &RgbImage, crop: &RgbImage, m: &Similarity, feather: u32) -> RgbImage {
    let Some(back) = projection(m).map(|p| p.invert()) else {
        return frame.clone();
    };
    let (w, h) = frame.dimensions();
    let placed = resample(crop, &back, w, h);
    let coverage = resample(&GrayImage::from_pixel(crop.width(), crop.height(), Luma([255])), &back, w, h);
    // shrink first so the feather never reaches the crop's zero border
    let coverage = imaging::pad_mask(&coverage, -((feather / 4) as i32));
    let coverage = imaging::blur_kernel(&coverage, feather | 1);
    imaging::blend_masked(frame, &placed, &coverage)
}
