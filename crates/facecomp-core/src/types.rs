use serde::{Deserialize, Serialize};

/// A located face in pixel coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl BoundingBox {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
            confidence: 1.0,
            landmarks: None,
        }
    }

    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    pub fn center(&self) -> (f32, f32) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    /// Grow the box by per-side fractions of its own size.
    ///
    /// `side` applies to left and right, `up` and `down` to the top and bottom edges.
    pub fn expand(&self, side: f32, up: f32, down: f32) -> BoundingBox {
        let dx = self.width * side;
        BoundingBox {
            x: self.x - dx,
            y: self.y - self.height * up,
            width: self.width + 2.0 * dx,
            height: self.height * (1.0 + up + down),
            confidence: self.confidence,
            landmarks: self.landmarks,
        }
    }

    /// Integer pixel rectangle `(x0, y0, x1, y1)` clamped to a `width`×`height` image.
    ///
    /// `x1`/`y1` are exclusive. Returns `None` when nothing of the box is inside the image.
    pub fn clamped_rect(&self, width: u32, height: u32) -> Option<(u32, u32, u32, u32)> {
        let x0 = self.x.floor().max(0.0) as i64;
        let y0 = self.y.floor().max(0.0) as i64;
        let x1 = ((self.x + self.width).ceil() as i64).min(width as i64);
        let y1 = ((self.y + self.height).ceil() as i64).min(height as i64);
        if x1 <= x0 || y1 <= y0 {
            return None;
        }
        Some((x0 as u32, y0 as u32, x1 as u32, y1 as u32))
    }

    /// Area shared with `other`.
    pub fn intersection(&self, other: &BoundingBox) -> f32 {
        let w = (self.x + self.width).min(other.x + other.width) - self.x.max(other.x);
        let h = (self.y + self.height).min(other.y + other.height) - self.y.max(other.y);
        w.max(0.0) * h.max(0.0)
    }

    pub fn overlaps(&self, other: &BoundingBox) -> bool {
        self.intersection(other) > 0.0
    }

    /// Intersection over union; 0 for degenerate boxes.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let shared = self.intersection(other);
        let union = self.area() + other.area() - shared;
        if union > 0.0 { shared / union } else { 0.0 }
    }
}

/// Pick the detection with the largest area.
pub fn largest(faces: &[BoundingBox]) -> Option<&BoundingBox> {
    faces.iter().max_by(|a, b| {
        a.area()
            .partial_cmp(&b.area())
            .unwrap_or(std::cmp::Ordering::Equal)
    })
}

/// Identity vector of one face.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Network that produced it, when known.
    pub model_version: Option<String>,
}

impl Embedding {
    /// All-zero embedding used as the unconditional half of a guidance pair.
    pub fn zeros(dim: usize) -> Self {
        Self {
            values: vec![0.0; dim],
            model_version: None,
        }
    }

    /// Cosine similarity in `[-1, 1]`; 0 when either vector is all zeros.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let (dot, aa, bb) = self
            .values
            .iter()
            .zip(&other.values)
            .fold((0.0f32, 0.0f32, 0.0f32), |(d, a2, b2), (a, b)| (d + a * b, a2 + a * a, b2 + b * b));
        let denom = (aa * bb).sqrt();
        if denom > 0.0 { dot / denom } else { 0.0 }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_similarity_ignores_magnitude() {
        let a = Embedding { values: vec![2.0, 0.0, 2.0], model_version: None };
        let b = Embedding { values: vec![0.5, 0.0, 0.5], model_version: None };
        let c = Embedding { values: vec![0.0, 3.0, 0.0], model_version: None };
        assert!((a.similarity(&b) - 1.0).abs() < 1e-6);
        assert!(a.similarity(&c).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_zero_vector() {
        let a = Embedding::zeros(2);
        let b = Embedding { values: vec![1.0, 0.0], model_version: None };
        assert_eq!(a.similarity(&b), 0.0);
    }

    #[test]
    fn test_expand_asymmetric() {
        let b = BoundingBox::new(100.0, 100.0, 100.0, 100.0);
        let e = b.expand(0.25, 0.35, 0.15);
        assert!((e.x - 75.0).abs() < 1e-4);
        assert!((e.y - 65.0).abs() < 1e-4);
        assert!((e.width - 150.0).abs() < 1e-4);
        assert!((e.height - 150.0).abs() < 1e-4);
    }

    #[test]
    fn test_clamped_rect() {
        let b = BoundingBox::new(-10.0, 5.0, 50.0, 200.0);
        assert_eq!(b.clamped_rect(100, 100), Some((0, 5, 40, 100)));
        let outside = BoundingBox::new(200.0, 200.0, 10.0, 10.0);
        assert_eq!(outside.clamped_rect(100, 100), None);
    }

    #[test]
    fn test_iou_half_shifted() {
        let a = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        let b = BoundingBox::new(5.0, 0.0, 10.0, 10.0);
        assert!((a.iou(&b) - 50.0 / 150.0).abs() < 1e-6);
        assert!((a.iou(&a) - 1.0).abs() < 1e-6);
        assert_eq!(a.iou(&BoundingBox::new(30.0, 30.0, 5.0, 5.0)), 0.0);
        assert!(!a.overlaps(&BoundingBox::new(10.0, 0.0, 5.0, 5.0)));
    }

    #[test]
    fn test_largest_picks_biggest_area() {
        let faces = vec![
            BoundingBox::new(0.0, 0.0, 10.0, 10.0),
            BoundingBox::new(50.0, 50.0, 30.0, 30.0),
            BoundingBox::new(0.0, 50.0, 20.0, 20.0),
        ];
        let l = largest(&faces).unwrap();
        assert!((l.width - 30.0).abs() < 1e-6);
        assert!(largest(&[]).is_none());
    }
}
