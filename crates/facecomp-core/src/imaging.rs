//! Raster helpers shared by the mask, paste and refinement stages.
//!
//! Blur, morphology, ellipse rasterization, sizing policy and the debug
//! visualizations written to the run folder.

use image::{imageops, imageops::FilterType, GrayImage, Luma, Rgb, RgbImage};
use imageproc::distance_transform::Norm;
use imageproc::morphology::{grayscale_dilate, grayscale_erode, Mask};
use imageproc::region_labelling::{connected_components, Connectivity};
use ndarray::Array4;

// --- Named constants ---
/// Neutral gray used as the "no content" fill for hair-region images.
pub const NEUTRAL_GRAY: u8 = 128;
/// Long-side bound applied to the background before detection and masking.
pub const WORKING_LONG_SIDE: u32 = 1024;
/// Minimum short side handed to the inpainting engine.
pub const GENERATION_SHORT_SIDE: u32 = 1024;
const DIM_MULTIPLE: u32 = 8;
const MASK_ON_THRESHOLD: u8 = 127;

/// Gaussian blur with a radius interpreted as sigma. Radii <= 0 return a copy.
pub fn blur_radius(mask: &GrayImage, radius: f32) -> GrayImage {
    if radius <= 0.0 {
        return mask.clone();
    }
    imageproc::filter::gaussian_blur_f32(mask, radius)
}

/// Sigma for an odd Gaussian kernel size, using the kernel-size convention of
/// common CV toolkits.
pub fn kernel_sigma(ksize: u32) -> f32 {
    0.3 * ((ksize as f32 - 1.0) * 0.5 - 1.0) + 0.8
}

/// Gaussian blur by odd kernel size (e.g. 11, 21, `2*feather+1`).
pub fn blur_kernel(mask: &GrayImage, ksize: u32) -> GrayImage {
    if ksize <= 1 {
        return mask.clone();
    }
    imageproc::filter::gaussian_blur_f32(mask, kernel_sigma(ksize).max(0.1))
}

/// Fraction of pixels that are nonzero, in [0, 1].
pub fn coverage(mask: &GrayImage) -> f32 {
    let total = mask.width() as usize * mask.height() as usize;
    if total == 0 {
        return 0.0;
    }
    let on = mask.pixels().filter(|p| p[0] > 0).count();
    on as f32 / total as f32
}

/// Pixels strictly above `threshold` become 255, everything else 0.
pub fn binarize(mask: &GrayImage, threshold: u8) -> GrayImage {
    GrayImage::from_fn(mask.width(), mask.height(), |x, y| {
        if mask.get_pixel(x, y)[0] > threshold {
            Luma([255])
        } else {
            Luma([0])
        }
    })
}

/// Fill enclosed background regions of a binary mask.
///
/// A background region is a hole when its 4-connected component never touches
/// the image border.
pub fn fill_holes(mask: &GrayImage) -> GrayImage {
    let (w, h) = mask.dimensions();
    if w == 0 || h == 0 {
        return mask.clone();
    }
    let inverted = GrayImage::from_fn(w, h, |x, y| {
        if mask.get_pixel(x, y)[0] > 0 {
            Luma([0])
        } else {
            Luma([255])
        }
    });
    let labels = connected_components(&inverted, Connectivity::Four, Luma([0u8]));

    let mut touches_border = std::collections::HashSet::new();
    for x in 0..w {
        touches_border.insert(labels.get_pixel(x, 0)[0]);
        touches_border.insert(labels.get_pixel(x, h - 1)[0]);
    }
    for y in 0..h {
        touches_border.insert(labels.get_pixel(0, y)[0]);
        touches_border.insert(labels.get_pixel(w - 1, y)[0]);
    }

    GrayImage::from_fn(w, h, |x, y| {
        let label = labels.get_pixel(x, y)[0];
        if mask.get_pixel(x, y)[0] > 0 || (label != 0 && !touches_border.contains(&label)) {
            Luma([255])
        } else {
            Luma([0])
        }
    })
}

/// Bounding box `(x0, y0, x1, y1)`, exclusive end, of the nonzero pixels.
pub fn mask_bounds(mask: &GrayImage) -> Option<(u32, u32, u32, u32)> {
    mask.enumerate_pixels()
        .filter(|(_, _, p)| p[0] > 0)
        .fold(None, |rect, (x, y, _)| {
            Some(match rect {
                None => (x, y, x + 1, y + 1),
                Some((x0, y0, x1, y1)) => (x0.min(x), y0.min(y), x1.max(x + 1), y1.max(y + 1)),
            })
        })
}

/// Binary dilation repeated `iterations` times with a 3×3 cross.
///
/// Iterated cross dilation reaches exactly the pixels within L1 distance
/// `iterations` of the foreground.
pub fn dilate_iterations(mask: &GrayImage, iterations: u32) -> GrayImage {
    let mut out = mask.clone();
    let mut remaining = iterations;
    while remaining > 0 {
        let step = remaining.min(u8::MAX as u32);
        out = imageproc::morphology::dilate(&out, Norm::L1, step as u8);
        remaining -= step;
    }
    out
}

/// Filled ellipse inscribed in `(x0, y0, x1, y1)` (exclusive end), 255 inside.
pub fn ellipse_mask(width: u32, height: u32, rect: (u32, u32, u32, u32)) -> GrayImage {
    let mut mask = GrayImage::new(width, height);
    let (x0, y0, x1, y1) = rect;
    let cx = ((x0 + x1) / 2) as i32;
    let cy = ((y0 + y1) / 2) as i32;
    let rx = (x1.saturating_sub(x0) / 2) as i32;
    let ry = (y1.saturating_sub(y0) / 2) as i32;
    if rx > 0 && ry > 0 {
        imageproc::drawing::draw_filled_ellipse_mut(&mut mask, (cx, cy), rx, ry, Luma([255u8]));
    }
    mask
}

/// Grayscale dilate (`padding > 0`) or erode (`padding < 0`) with a disk of
/// diameter `2*|padding|+1`. `padding == 0` returns an exact copy.
///
/// The radius is capped at 255 px.
pub fn pad_mask(mask: &GrayImage, padding: i32) -> GrayImage {
    if padding == 0 || mask.width() == 0 || mask.height() == 0 {
        return mask.clone();
    }
    let element = Mask::disk(padding.unsigned_abs().min(u8::MAX as u32) as u8);
    if padding > 0 {
        grayscale_dilate(mask, &element)
    } else {
        grayscale_erode(mask, &element)
    }
}

/// Working size: long side scaled to [`WORKING_LONG_SIDE`], both sides floored
/// to a multiple of 8.
pub fn working_size(width: u32, height: u32) -> (u32, u32) {
    let long = width.max(height).max(1) as f32;
    let scale = WORKING_LONG_SIDE as f32 / long;
    (
        floor_multiple((width as f32 * scale) as u32),
        floor_multiple((height as f32 * scale) as u32),
    )
}

/// Engine size: scaled up (never down) so the short side is exactly
/// [`GENERATION_SHORT_SIDE`]; the long side keeps the aspect ratio and is
/// floored to a multiple of 8.
///
/// Integer arithmetic: a float scale can land the short side on 1023 and
/// floor it to 1016.
pub fn generation_size(width: u32, height: u32) -> (u32, u32) {
    let short = width.min(height).max(1);
    if short >= GENERATION_SHORT_SIDE {
        return (floor_multiple(width), floor_multiple(height));
    }
    let scale = |v: u32| floor_multiple((v as u64 * GENERATION_SHORT_SIDE as u64 / short as u64) as u32);
    (scale(width), scale(height))
}

fn floor_multiple(v: u32) -> u32 {
    ((v / DIM_MULTIPLE) * DIM_MULTIPLE).max(DIM_MULTIPLE)
}

/// Lanczos resize, skipped when the size already matches.
pub fn resize_rgb(image: &RgbImage, width: u32, height: u32) -> RgbImage {
    if image.dimensions() == (width, height) {
        return image.clone();
    }
    imageops::resize(image, width, height, FilterType::Lanczos3)
}

/// Resize a mask; bilinear keeps soft edges soft.
pub fn resize_gray(mask: &GrayImage, width: u32, height: u32) -> GrayImage {
    if mask.dimensions() == (width, height) {
        return mask.clone();
    }
    imageops::resize(mask, width, height, FilterType::Triangle)
}

/// Per-pixel linear blend: `base*(1-a) + top*a` with `a = mask/255`.
pub fn blend_masked(base: &RgbImage, top: &RgbImage, mask: &GrayImage) -> RgbImage {
    RgbImage::from_fn(base.width(), base.height(), |x, y| {
        let b = base.get_pixel(x, y);
        if x >= top.width() || y >= top.height() || x >= mask.width() || y >= mask.height() {
            return *b;
        }
        let t = top.get_pixel(x, y);
        let a = mask.get_pixel(x, y)[0] as f32 / 255.0;
        Rgb(std::array::from_fn(|c| {
            (b[c] as f32 * (1.0 - a) + t[c] as f32 * a).round().clamp(0.0, 255.0) as u8
        }))
    })
}

/// Red-tinted overlay of the mask on the image, for the run folder.
pub fn mask_overlay(image: &RgbImage, mask: &GrayImage) -> RgbImage {
    let mut out = image.clone();
    for (x, y, p) in out.enumerate_pixels_mut() {
        if x < mask.width() && y < mask.height() && mask.get_pixel(x, y)[0] > MASK_ON_THRESHOLD {
            p[0] = (p[0] as f32 * 0.5 + 127.0).min(255.0) as u8;
            p[1] = (p[1] as f32 * 0.5) as u8;
            p[2] = (p[2] as f32 * 0.5) as u8;
        }
    }
    out
}

/// The image with the masked area painted black, as handed to the engine.
pub fn inpaint_input(image: &RgbImage, mask: &GrayImage) -> RgbImage {
    let mut out = image.clone();
    for (x, y, p) in out.enumerate_pixels_mut() {
        if x < mask.width() && y < mask.height() && mask.get_pixel(x, y)[0] > MASK_ON_THRESHOLD {
            *p = Rgb([0, 0, 0]);
        }
    }
    out
}

/// Pack an RGB image into a (1, 3, H, W) tensor with `(p*scale - mean[c]) / std[c]`.
pub fn rgb_to_nchw(image: &RgbImage, scale: f32, mean: [f32; 3], std: [f32; 3]) -> Array4<f32> {
    let (w, h) = (image.width() as usize, image.height() as usize);
    let mut tensor = Array4::<f32>::zeros((1, 3, h, w));
    for (x, y, p) in image.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = (p[c] as f32 * scale - mean[c]) / std[c];
        }
    }
    tensor
}

/// Unpack a (1, 3, H, W) slice in `[lo, hi]` back into an RGB image.
pub fn nchw_to_rgb(data: &[f32], width: usize, height: usize, lo: f32, hi: f32) -> Option<RgbImage> {
    let plane = width * height;
    if data.len() < 3 * plane || hi <= lo {
        return None;
    }
    let to_u8 = |v: f32| ((v.clamp(lo, hi) - lo) / (hi - lo) * 255.0).round() as u8;
    Some(RgbImage::from_fn(width as u32, height as u32, |x, y| {
        let i = y as usize * width + x as usize;
        Rgb([to_u8(data[i]), to_u8(data[plane + i]), to_u8(data[2 * plane + i])])
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square_mask(w: u32, h: u32, x0: u32, y0: u32, x1: u32, y1: u32) -> GrayImage {
        GrayImage::from_fn(w, h, |x, y| {
            if x >= x0 && x < x1 && y >= y0 && y < y1 { Luma([255]) } else { Luma([0]) }
        })
    }

    #[test]
    fn test_working_size_bounds_long_side() {
        let (w, h) = working_size(3000, 2000);
        assert_eq!(w, 1024);
        assert_eq!(w % 8, 0);
        assert_eq!(h % 8, 0);
        assert!(h <= 1024 && h >= 672, "h = {h}");
    }

    #[test]
    fn test_generation_size_short_side() {
        assert_eq!(generation_size(1024, 680), (1536, 1024));
        assert_eq!(generation_size(600, 800), (1024, 1360));
        assert_eq!(generation_size(1200, 1600), (1200, 1600));
        // Every working size reaches exactly 1024 on the short side.
        for short in (8..1024).step_by(8) {
            let (w, h) = generation_size(1024, short);
            assert_eq!(h, 1024, "short {short}");
            assert_eq!(w % 8, 0);
            assert!(w >= 1024);
        }
    }

    #[test]
    fn test_pad_zero_is_noop() {
        let m = square_mask(40, 40, 10, 10, 30, 30);
        assert_eq!(pad_mask(&m, 0), m);
    }

    #[test]
    fn test_pad_dilate_grows_and_erode_shrinks() {
        let m = square_mask(60, 60, 20, 20, 40, 40);
        let grown = pad_mask(&m, 5);
        let shrunk = pad_mask(&m, -5);
        assert!(coverage(&grown) > coverage(&m));
        assert!(coverage(&shrunk) < coverage(&m));
        // Disk element: reaches 5px straight out, not the full 5px diagonally.
        assert_eq!(grown.get_pixel(15, 30)[0], 255);
        assert_eq!(grown.get_pixel(14, 30)[0], 0);
        assert_eq!(grown.get_pixel(15, 15)[0], 0);
        assert_eq!(shrunk.get_pixel(25, 30)[0], 255);
        assert_eq!(shrunk.get_pixel(24, 30)[0], 0);
    }

    #[test]
    fn test_fill_holes_fills_enclosed_only() {
        let mut m = square_mask(30, 30, 5, 5, 25, 25);
        for y in 12..18 {
            for x in 12..18 {
                m.put_pixel(x, y, Luma([0]));
            }
        }
        let filled = fill_holes(&m);
        assert_eq!(filled.get_pixel(15, 15)[0], 255);
        assert_eq!(filled.get_pixel(1, 1)[0], 0);
    }

    #[test]
    fn test_dilate_iterations_l1() {
        let mut m = GrayImage::new(21, 21);
        m.put_pixel(10, 10, Luma([255]));
        let d = dilate_iterations(&m, 3);
        assert_eq!(d.get_pixel(13, 10)[0], 255);
        assert_eq!(d.get_pixel(12, 11)[0], 255);
        assert_eq!(d.get_pixel(12, 12)[0], 0);
        assert_eq!(dilate_iterations(&m, 0), m);
    }

    #[test]
    fn test_ellipse_mask_inscribed() {
        let m = ellipse_mask(100, 100, (20, 30, 80, 70));
        assert_eq!(m.get_pixel(50, 50)[0], 255);
        assert_eq!(m.get_pixel(21, 31)[0], 0);
        assert_eq!(m.get_pixel(5, 5)[0], 0);
    }

    #[test]
    fn test_overlay_and_inpaint_input() {
        let img = RgbImage::from_pixel(4, 4, Rgb([100, 200, 50]));
        let m = square_mask(4, 4, 0, 0, 2, 4);
        let o = mask_overlay(&img, &m);
        assert_eq!(*o.get_pixel(0, 0), Rgb([177, 100, 25]));
        assert_eq!(*o.get_pixel(3, 0), Rgb([100, 200, 50]));
        let i = inpaint_input(&img, &m);
        assert_eq!(*i.get_pixel(1, 1), Rgb([0, 0, 0]));
        assert_eq!(*i.get_pixel(2, 1), Rgb([100, 200, 50]));
    }

    #[test]
    fn test_blend_masked_extremes() {
        let base = RgbImage::from_pixel(2, 1, Rgb([0, 0, 0]));
        let top = RgbImage::from_pixel(2, 1, Rgb([200, 100, 50]));
        let mut m = GrayImage::new(2, 1);
        m.put_pixel(1, 0, Luma([255]));
        let out = blend_masked(&base, &top, &m);
        assert_eq!(*out.get_pixel(0, 0), Rgb([0, 0, 0]));
        assert_eq!(*out.get_pixel(1, 0), Rgb([200, 100, 50]));
    }

    #[test]
    fn test_kernel_sigma_matches_convention() {
        assert!((kernel_sigma(21) - 3.5).abs() < 1e-5);
        assert!((kernel_sigma(11) - 2.0).abs() < 1e-5);
    }
}
