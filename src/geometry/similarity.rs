//! Similarity alignment derived from facial landmarks.
//!
//! A rotated square is fitted around the landmarks using two reference points
//! (eye centre and lip centre). The resulting transform maps the original
//! image into a `dsize × dsize` crop; its exact inverse maps the crop back.

use super::Affine2;
use crate::{Error, Result};
use opencv::core::Point2f;

/// Eye contour indices of the 106-point layout
const PT106_LEFT_EYE: [usize; 4] = [33, 35, 40, 39];
const PT106_RIGHT_EYE: [usize; 4] = [87, 89, 94, 93];
const PT106_LIP: [usize; 2] = [52, 61];

/// Eye contour indices of the 203-point layout
const PT203_LEFT_EYE: [usize; 4] = [0, 6, 12, 18];
const PT203_RIGHT_EYE: [usize; 4] = [24, 30, 36, 42];
const PT203_LIP: [usize; 2] = [48, 66];

/// Below this length the reference axis falls back to straight down
const MIN_AXIS_LENGTH: f64 = 1e-3;

/// Forward/inverse pair produced by a single estimation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimilarityTransform {
    /// Original image → crop
    pub inverse: Affine2,
    /// Crop → original image
    pub forward: Affine2,
}

impl SimilarityTransform {
    /// Build the pair from the original→crop matrix
    ///
    /// # Errors
    ///
    /// Returns an error if the matrix is singular
    pub fn from_inverse(inverse: Affine2) -> Result<Self> {
        let forward = inverse.invert()?;
        Ok(Self { inverse, forward })
    }
}

/// Parameters of a landmark-driven crop
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AlignParams {
    /// Output crop side in pixels
    pub dsize: i32,
    /// Enlargement of the fitted square
    pub scale: f32,
    /// Horizontal offset as a fraction of the square size
    pub vx_ratio: f32,
    /// Vertical offset as a fraction of the square size
    pub vy_ratio: f32,
    /// Follow the in-plane head rotation
    pub rotate: bool,
    /// Use eye centre → lip centre as the vertical axis instead of the eye line
    pub use_lip: bool,
}

impl AlignParams {
    /// Portrait crop used by the animation pipeline
    pub const PORTRAIT: Self = Self {
        dsize: 512,
        scale: 2.3,
        vx_ratio: 0.0,
        vy_ratio: -0.125,
        rotate: true,
        use_lip: true,
    };

    /// Crop fed to the landmark refiner
    pub const REFINER: Self = Self {
        dsize: 224,
        scale: 1.5,
        vx_ratio: 0.0,
        vy_ratio: -0.1,
        rotate: true,
        use_lip: true,
    };
}

fn mean_of(points: &[Point2f], indices: &[usize]) -> Point2f {
    let n = indices.len() as f32;
    let (sx, sy) = indices
        .iter()
        .fold((0.0f32, 0.0f32), |(sx, sy), &i| (sx + points[i].x, sy + points[i].y));
    Point2f::new(sx / n, sy / n)
}

fn midpoint(a: Point2f, b: Point2f) -> Point2f {
    Point2f::new((a.x + b.x) / 2.0, (a.y + b.y) / 2.0)
}

/// Two reference points for 5-, 106- and 203-point landmark layouts.
///
/// With `use_lip` the pair is (eye centre, lip centre). Otherwise it is the eye
/// line rotated by 90° so that both variants describe the face's vertical axis.
///
/// # Errors
///
/// Returns `InvalidInput` for unsupported landmark counts
pub fn reference_points(points: &[Point2f], use_lip: bool) -> Result<[Point2f; 2]> {
    let (left_eye, right_eye, lip) = match points.len() {
        5 => (points[0], points[1], midpoint(points[3], points[4])),
        106 => (
            mean_of(points, &PT106_LEFT_EYE),
            mean_of(points, &PT106_RIGHT_EYE),
            mean_of(points, &PT106_LIP),
        ),
        203 => (
            mean_of(points, &PT203_LEFT_EYE),
            mean_of(points, &PT203_RIGHT_EYE),
            mean_of(points, &PT203_LIP),
        ),
        n => {
            return Err(Error::InvalidInput(format!(
                "Unsupported landmark layout with {n} points"
            )))
        }
    };

    if use_lip {
        Ok([midpoint(left_eye, right_eye), lip])
    } else {
        let v = right_eye - left_eye;
        Ok([left_eye, Point2f::new(left_eye.x - v.y, left_eye.y + v.x)])
    }
}

/// Rotated square around a set of landmarks
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LandmarkRect {
    /// Centre in image coordinates
    pub center: (f64, f64),
    /// Side length after scaling
    pub size: f64,
    /// In-plane rotation of the x-axis in radians, clockwise positive
    pub angle: f64,
}

/// Fit the rotated square described by [`AlignParams`] around `points`
///
/// # Errors
///
/// Returns an error for unsupported layouts or empty input
pub fn parse_rect_from_landmark(points: &[Point2f], params: &AlignParams) -> Result<LandmarkRect> {
    if points.is_empty() {
        return Err(Error::InvalidInput("No landmarks to align".to_string()));
    }
    let [p0, p1] = reference_points(points, params.use_lip)?;

    let (mut uy_x, mut uy_y) = (f64::from(p1.x - p0.x), f64::from(p1.y - p0.y));
    let len = uy_x.hypot(uy_y);
    if len <= MIN_AXIS_LENGTH {
        (uy_x, uy_y) = (0.0, 1.0);
    } else {
        uy_x /= len;
        uy_y /= len;
    }
    let (ux_x, ux_y) = (uy_y, -uy_x);

    let mut angle = ux_x.clamp(-1.0, 1.0).acos();
    if ux_y < 0.0 {
        angle = -angle;
    }

    let n = points.len() as f64;
    let cx0 = points.iter().map(|p| f64::from(p.x)).sum::<f64>() / n;
    let cy0 = points.iter().map(|p| f64::from(p.y)).sum::<f64>() / n;

    // Extent of the landmarks in the rotated frame
    let (mut min_x, mut min_y, mut max_x, mut max_y) = (f64::MAX, f64::MAX, f64::MIN, f64::MIN);
    for p in points {
        let dx = f64::from(p.x) - cx0;
        let dy = f64::from(p.y) - cy0;
        let rx = ux_x * dx + ux_y * dy;
        let ry = uy_x * dx + uy_y * dy;
        min_x = min_x.min(rx);
        min_y = min_y.min(ry);
        max_x = max_x.max(rx);
        max_y = max_y.max(ry);
    }
    let c1x = (min_x + max_x) / 2.0;
    let c1y = (min_y + max_y) / 2.0;
    let size = (max_x - min_x).max(max_y - min_y) * f64::from(params.scale);

    let vx = f64::from(params.vx_ratio) * size;
    let vy = f64::from(params.vy_ratio) * size;
    let cx = cx0 + ux_x * (c1x + vx) + uy_x * (c1y + vy);
    let cy = cy0 + ux_y * (c1x + vx) + uy_y * (c1y + vy);

    Ok(LandmarkRect {
        center: (cx, cy),
        size,
        angle,
    })
}

/// Estimate the original→crop similarity and its exact inverse from landmarks
///
/// # Errors
///
/// Returns an error for unsupported layouts or a degenerate (zero-size) fit
pub fn estimate_similarity_transform_with(points: &[Point2f], params: &AlignParams) -> Result<SimilarityTransform> {
    let rect = parse_rect_from_landmark(points, params)?;
    if !(rect.size.is_finite() && rect.size > 0.0) {
        return Err(Error::InvalidInput(format!(
            "Landmarks span a degenerate region (size {})",
            rect.size
        )));
    }

    let dsize = f64::from(params.dsize);
    let s = dsize / rect.size;
    let (tcx, tcy) = (dsize / 2.0, dsize / 2.0);
    let (cx, cy) = rect.center;

    let inverse = if params.rotate {
        let (sin, cos) = rect.angle.sin_cos();
        Affine2::new([
            [s * cos, s * sin, tcx - s * (cos * cx + sin * cy)],
            [-s * sin, s * cos, tcy - s * (-sin * cx + cos * cy)],
        ])
    } else {
        Affine2::scale_translate(s, tcx - s * cx, tcy - s * cy)
    };

    SimilarityTransform::from_inverse(inverse)
}

/// Positional form of [`estimate_similarity_transform_with`] using the lip axis
///
/// # Errors
///
/// Returns an error for unsupported layouts or a degenerate fit
pub fn estimate_similarity_transform(
    points: &[Point2f],
    target_size: i32,
    scale: f32,
    vx: f32,
    vy: f32,
    rotate: bool,
) -> Result<SimilarityTransform> {
    estimate_similarity_transform_with(
        points,
        &AlignParams {
            dsize: target_size,
            scale,
            vx_ratio: vx,
            vy_ratio: vy,
            rotate,
            use_lip: true,
        },
    )
}

/// Axis-aligned transform that maps `center` to the middle of an
/// `output_size` square with the given scale
///
/// # Errors
///
/// Returns an error if `scale` is zero
pub fn center_scale_transform(center: Point2f, output_size: i32, scale: f32) -> Result<SimilarityTransform> {
    let s = f64::from(scale);
    let half = f64::from(output_size) / 2.0;
    SimilarityTransform::from_inverse(Affine2::scale_translate(
        s,
        half - f64::from(center.x) * s,
        half - f64::from(center.y) * s,
    ))
}
