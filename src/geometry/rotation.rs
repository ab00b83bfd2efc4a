//! Head rotation matrices.
//!
//! Angles are in degrees: pitch about x, yaw about y, roll about z. The
//! matrix is `(Rz·Ry·Rx)ᵀ` so that keypoints stored as row vectors rotate
//! with `kp · R`.

use nalgebra::Matrix3;

/// Row-vector rotation for the given Euler angles in degrees
#[must_use]
pub fn rotation_matrix(pitch: f32, yaw: f32, roll: f32) -> Matrix3<f32> {
    let (sx, cx) = pitch.to_radians().sin_cos();
    let (sy, cy) = yaw.to_radians().sin_cos();
    let (sz, cz) = roll.to_radians().sin_cos();

    let rx = Matrix3::new(1.0, 0.0, 0.0, 0.0, cx, -sx, 0.0, sx, cx);
    let ry = Matrix3::new(cy, 0.0, sy, 0.0, 1.0, 0.0, -sy, 0.0, cy);
    let rz = Matrix3::new(cz, -sz, 0.0, sz, cz, 0.0, 0.0, 0.0, 1.0);

    (rz * ry * rx).transpose()
}

/// Rotation of the current driving frame relative to the first one, applied
/// on top of the source rotation: `rd · rd0ᵀ · rs`
#[must_use]
pub fn compose_relative_rotation(rd: &Matrix3<f32>, rd0: &Matrix3<f32>, rs: &Matrix3<f32>) -> Matrix3<f32> {
    rd * rd0.transpose() * rs
}

/// Recover `(pitch, yaw, roll)` in degrees from a matrix built by [`rotation_matrix`]
#[must_use]
pub fn rotation_to_euler(r: &Matrix3<f32>) -> (f32, f32, f32) {
    // Undo the transpose to get Rz·Ry·Rx
    let m = r.transpose();
    let sin_yaw = (-m[(2, 0)]).clamp(-1.0, 1.0);
    let yaw = sin_yaw.asin();

    let (pitch, roll) = if sin_yaw.abs() < 0.999_999 {
        (m[(2, 1)].atan2(m[(2, 2)]), m[(1, 0)].atan2(m[(0, 0)]))
    } else {
        // Gimbal lock: fold all remaining rotation into pitch
        ((-m[(1, 2)]).atan2(m[(1, 1)]), 0.0)
    };

    (pitch.to_degrees(), yaw.to_degrees(), roll.to_degrees())
}
