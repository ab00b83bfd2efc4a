//! Geometry library: boxes, affine matrices, similarity alignment, warping,
//! rotation matrices and mask blending.

/// Mask blending and paste-back composition
pub mod blend;

/// Euler-angle rotation matrices
pub mod rotation;

/// Landmark-driven similarity transforms
pub mod similarity;

/// Affine warps, crops and resizes on frames
pub mod warp;

pub use blend::{blend_with_mask, paste_back};
pub use rotation::{compose_relative_rotation, rotation_matrix, rotation_to_euler};
pub use similarity::{
    center_scale_transform, estimate_similarity_transform, estimate_similarity_transform_with, reference_points,
    AlignParams, SimilarityTransform,
};
pub use warp::{affine_transform, crop_frame, pad_to_canvas, paste_region, resize_frame, Interpolation};

use crate::{Error, Result};
use nalgebra::Matrix3;
use opencv::core::{Mat, Point2f, Rect};

/// Axis-aligned box in image coordinates
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FaceBox {
    /// Left edge
    pub x1: f32,
    /// Top edge
    pub y1: f32,
    /// Right edge
    pub x2: f32,
    /// Bottom edge
    pub y2: f32,
}

impl FaceBox {
    /// Create a box from its corners
    #[must_use]
    pub const fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    /// Width (may be negative for malformed boxes)
    #[must_use]
    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    /// Height (may be negative for malformed boxes)
    #[must_use]
    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }

    /// Area, zero for degenerate boxes
    #[must_use]
    pub fn area(&self) -> f32 {
        self.width().max(0.0) * self.height().max(0.0)
    }

    /// Box centre
    #[must_use]
    pub fn center(&self) -> Point2f {
        Point2f::new((self.x1 + self.x2) / 2.0, (self.y1 + self.y2) / 2.0)
    }

    /// Scale every coordinate by `factor`
    #[must_use]
    pub fn scaled(&self, factor: f32) -> Self {
        Self::new(self.x1 * factor, self.y1 * factor, self.x2 * factor, self.y2 * factor)
    }

    /// Fail with `DegenerateBox` unless `x1 < x2` and `y1 < y2`
    ///
    /// # Errors
    ///
    /// Returns `DegenerateBox` for zero or negative extents and non-finite corners
    pub fn validate(&self) -> Result<Self> {
        let finite = [self.x1, self.y1, self.x2, self.y2].iter().all(|v| v.is_finite());
        if finite && self.x1 < self.x2 && self.y1 < self.y2 {
            Ok(*self)
        } else {
            Err(Error::DegenerateBox {
                x1: self.x1,
                y1: self.y1,
                x2: self.x2,
                y2: self.y2,
            })
        }
    }

    /// Intersection over union, using the inclusive-pixel convention of the detector
    #[must_use]
    pub fn iou(&self, other: &Self) -> f32 {
        let area_a = (self.x2 - self.x1 + 1.0) * (self.y2 - self.y1 + 1.0);
        let area_b = (other.x2 - other.x1 + 1.0) * (other.y2 - other.y1 + 1.0);

        let w = (self.x2.min(other.x2) - self.x1.max(other.x1) + 1.0).max(0.0);
        let h = (self.y2.min(other.y2) - self.y1.max(other.y1) + 1.0).max(0.0);
        let inter = w * h;

        let union = area_a + area_b - inter;
        if union <= 0.0 {
            0.0
        } else {
            inter / union
        }
    }

    /// Integer rectangle with truncated corners
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn to_rect(&self) -> Rect {
        let x1 = self.x1 as i32;
        let y1 = self.y1 as i32;
        Rect::new(x1, y1, self.x2 as i32 - x1, self.y2 as i32 - y1)
    }
}

/// 2×3 affine matrix in `f64`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Affine2 {
    /// Row-major coefficients
    pub m: [[f64; 3]; 2],
}

impl Affine2 {
    /// Identity transform
    pub const IDENTITY: Self = Self {
        m: [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0]],
    };

    /// Create from row-major coefficients
    #[must_use]
    pub const fn new(m: [[f64; 3]; 2]) -> Self {
        Self { m }
    }

    /// Uniform scale followed by translation
    #[must_use]
    pub fn scale_translate(scale: f64, tx: f64, ty: f64) -> Self {
        Self::new([[scale, 0.0, tx], [0.0, scale, ty]])
    }

    fn to_homogeneous(self) -> Matrix3<f64> {
        Matrix3::new(
            self.m[0][0], self.m[0][1], self.m[0][2],
            self.m[1][0], self.m[1][1], self.m[1][2],
            0.0, 0.0, 1.0,
        )
    }

    fn from_homogeneous(h: &Matrix3<f64>) -> Self {
        Self::new([[h[(0, 0)], h[(0, 1)], h[(0, 2)]], [h[(1, 0)], h[(1, 1)], h[(1, 2)]]])
    }

    /// Inverse via 3×3 homogeneous inversion
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` for singular matrices
    pub fn invert(&self) -> Result<Self> {
        self.to_homogeneous()
            .try_inverse()
            .map(|inv| Self::from_homogeneous(&inv))
            .ok_or_else(|| Error::InvalidInput("Affine transform is not invertible".to_string()))
    }

    /// `other ∘ self`: apply `self` first, then `other`
    #[must_use]
    pub fn then(&self, other: &Self) -> Self {
        Self::from_homogeneous(&(other.to_homogeneous() * self.to_homogeneous()))
    }

    /// Map a point
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn apply(&self, p: Point2f) -> Point2f {
        let (x, y) = (f64::from(p.x), f64::from(p.y));
        Point2f::new(
            (self.m[0][0] * x + self.m[0][1] * y + self.m[0][2]) as f32,
            (self.m[1][0] * x + self.m[1][1] * y + self.m[1][2]) as f32,
        )
    }

    /// Map every point
    #[must_use]
    pub fn apply_all(&self, points: &[Point2f]) -> Vec<Point2f> {
        points.iter().map(|&p| self.apply(p)).collect()
    }

    /// 2×3 `CV_64F` Mat for OpenCV warps
    ///
    /// # Errors
    ///
    /// Returns an error if OpenCV cannot allocate the matrix
    pub fn to_mat(&self) -> Result<Mat> {
        Ok(Mat::from_slice_2d(&self.m)?)
    }

    /// Largest absolute coefficient difference
    #[must_use]
    pub fn max_abs_diff(&self, other: &Self) -> f64 {
        self.m
            .iter()
            .flatten()
            .zip(other.m.iter().flatten())
            .map(|(a, b)| (a - b).abs())
            .fold(0.0, f64::max)
    }
}
