//! Poisson "normal clone": paste a patch so its gradients survive and its
//! boundary matches the destination.

use image::{GrayImage, RgbImage};
use thiserror::Error;

// --- Named constants ---
/// Stop once every equation's residual is below this (in 0..255 units).
const RESIDUAL_TOLERANCE: f64 = 1e-3;
/// Conjugate-gradient steps allowed per cell of grid width plus height.
const ITERATIONS_PER_SIDE: usize = 2;
/// Grids up to this many cells are solved from a flat start instead of a coarser grid.
const COARSEST_CELLS: usize = 32 * 32;
const MASK_ON_THRESHOLD: u8 = 127;

#[derive(Error, Debug, PartialEq)]
pub enum CloneError {
    #[error("clone mask is empty")]
    EmptyMask,
    #[error("patch {patch:?} at {offset:?} does not fit a {dst:?} image")]
    OutOfBounds {
        patch: (u32, u32),
        offset: (i64, i64),
        dst: (u32, u32),
    },
    #[error("patch is {patch:?} but mask is {mask:?}")]
    SizeMismatch { patch: (u32, u32), mask: (u32, u32) },
}

/// Clone `src` (with `mask`, both patch-sized) into `dst` at `offset`.
pub fn seamless_clone(
    dst: &RgbImage,
    src: &RgbImage,
    mask: &GrayImage,
    offset: (i64, i64),
) -> Result<RgbImage, CloneError> {
    if src.dimensions() != mask.dimensions() {
        return Err(CloneError::SizeMismatch {
            patch: src.dimensions(),
            mask: mask.dimensions(),
        });
    }
    let (pw, ph) = src.dimensions();
    let (dw, dh) = dst.dimensions();
    let (ox, oy) = offset;
    if ox < 0 || oy < 0 || ox + pw as i64 > dw as i64 || oy + ph as i64 > dh as i64 {
        return Err(CloneError::OutOfBounds {
            patch: (pw, ph),
            offset,
            dst: (dw, dh),
        });
    }
    let (ox, oy) = (ox as usize, oy as usize);
    let (pw, ph, dw, dh) = (pw as usize, ph as usize, dw as usize, dh as usize);

    // Unknowns: mask pixels off the patch edge and off the image edge.
    let mut unknown = vec![false; pw * ph];
    let mut unknowns: Vec<(usize, usize)> = Vec::new();
    for y in 1..ph.saturating_sub(1) {
        for x in 1..pw.saturating_sub(1) {
            let (gx, gy) = (ox + x, oy + y);
            if gx == 0 || gy == 0 || gx + 1 >= dw || gy + 1 >= dh {
                continue;
            }
            if mask.get_pixel(x as u32, y as u32)[0] > MASK_ON_THRESHOLD {
                unknown[y * pw + x] = true;
                unknowns.push((x, y));
            }
        }
    }
    if unknowns.is_empty() {
        return Err(CloneError::EmptyMask);
    }

    let membrane = Membrane {
        width: pw,
        height: ph,
        unknown,
    };
    let mut out = dst.clone();
    for c in 0..3 {
        // The clone is the source plus a membrane that is harmonic inside the
        // mask and meets the destination on its boundary.
        let offsets: Vec<f64> = (0..pw * ph)
            .map(|i| {
                let (x, y) = ((i % pw) as u32, (i / pw) as u32);
                dst.get_pixel(ox as u32 + x, oy as u32 + y)[c] as f64 - src.get_pixel(x, y)[c] as f64
            })
            .collect();
        let fill = membrane.solve(&offsets);
        for &(x, y) in &unknowns {
            let value = src.get_pixel(x as u32, y as u32)[c] as f64 + fill[y * pw + x];
            out.get_pixel_mut((ox + x) as u32, (oy + y) as u32)[c] = value.round().clamp(0.0, 255.0) as u8;
        }
    }

    Ok(out)
}

/// Laplace problem on a `width`×`height` grid: `unknown` cells are filled so
/// the discrete Laplacian vanishes there, every other cell keeps its value.
/// Unknown cells never touch the grid edge.
struct Membrane {
    width: usize,
    height: usize,
    unknown: Vec<bool>,
}

impl Membrane {
    /// `values` everywhere except the unknowns, which get the harmonic fill.
    ///
    /// Large grids start from the solution on a half-resolution grid, so the
    /// conjugate-gradient pass only has to remove fine detail.
    fn solve(&self, values: &[f64]) -> Vec<f64> {
        let mut out = values.to_vec();
        let cells: Vec<usize> = (0..out.len()).filter(|&i| self.unknown[i]).collect();
        if cells.is_empty() {
            return out;
        }

        let w = self.width;
        if w * self.height > COARSEST_CELLS {
            let coarse = self.coarsen();
            let coarse_values: Vec<f64> = (0..coarse.width * coarse.height)
                .map(|i| {
                    let block = self.block(i % coarse.width, i / coarse.width);
                    block.iter().map(|&j| values[j]).sum::<f64>() / block.len() as f64
                })
                .collect();
            let coarse_fill = coarse.solve(&coarse_values);
            for &i in &cells {
                out[i] = coarse_fill[(i / w / 2) * coarse.width + (i % w) / 2];
            }
        } else {
            let rim: Vec<f64> = cells
                .iter()
                .flat_map(|&i| [i - 1, i + 1, i - w, i + w])
                .filter(|&j| !self.unknown[j])
                .map(|j| values[j])
                .collect();
            let start = rim.iter().sum::<f64>() / rim.len().max(1) as f64;
            for &i in &cells {
                out[i] = start;
            }
        }

        self.conjugate_gradient(&cells, &mut out);
        out
    }

    /// Half-resolution grid; a coarse cell is unknown only when its whole block is.
    fn coarsen(&self) -> Membrane {
        let (width, height) = (self.width.div_ceil(2), self.height.div_ceil(2));
        let unknown = (0..width * height)
            .map(|i| self.block(i % width, i / width).iter().all(|&j| self.unknown[j]))
            .collect();
        Membrane { width, height, unknown }
    }

    /// Fine cells under coarse cell (`cx`, `cy`).
    fn block(&self, cx: usize, cy: usize) -> Vec<usize> {
        let w = self.width;
        (2 * cy..(2 * cy + 2).min(self.height))
            .flat_map(|y| (2 * cx..(2 * cx + 2).min(w)).map(move |x| y * w + x))
            .collect()
    }

    /// Refine `out` at `cells` with conjugate gradients on the 5-point Laplacian.
    fn conjugate_gradient(&self, cells: &[usize], out: &mut [f64]) {
        let w = self.width;
        let around = |v: &[f64], i: usize| v[i - 1] + v[i + 1] + v[i - w] + v[i + w];

        let mut residual: Vec<f64> = cells.iter().map(|&i| around(out, i) - 4.0 * out[i]).collect();
        // Search direction on the full grid, zero off the unknowns.
        let mut direction = vec![0.0; out.len()];
        for (k, &i) in cells.iter().enumerate() {
            direction[i] = residual[k];
        }
        let mut applied = vec![0.0; cells.len()];
        let mut rr: f64 = residual.iter().map(|r| r * r).sum();

        let max_iterations = ITERATIONS_PER_SIDE * (w + self.height);
        for iteration in 0..max_iterations {
            if residual.iter().all(|r| r.abs() < RESIDUAL_TOLERANCE) {
                tracing::trace!(width = w, height = self.height, iteration, "poisson solve converged");
                return;
            }
            for (k, &i) in cells.iter().enumerate() {
                applied[k] = 4.0 * direction[i] - around(&direction, i);
            }
            let curvature: f64 = cells.iter().zip(&applied).map(|(&i, a)| direction[i] * a).sum();
            if curvature <= 0.0 {
                return;
            }
            let alpha = rr / curvature;
            for (k, &i) in cells.iter().enumerate() {
                out[i] += alpha * direction[i];
                residual[k] -= alpha * applied[k];
            }
            let rr_next: f64 = residual.iter().map(|r| r * r).sum();
            let beta = rr_next / rr;
            for (k, &i) in cells.iter().enumerate() {
                direction[i] = residual[k] + beta * direction[i];
            }
            rr = rr_next;
        }
        tracing::debug!(width = w, height = self.height, max_iterations, "poisson solve hit its iteration cap");
    }
}
