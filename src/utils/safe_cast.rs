//! Checked numeric conversions between OpenCV's `i32` geometry and tensor indices

use crate::{Error, Result};

/// Convert a tensor dimension to an OpenCV size component
///
/// # Errors
///
/// Returns an error if the value exceeds `i32::MAX`
pub fn usize_to_i32(value: usize) -> Result<i32> {
    value
        .try_into()
        .map_err(|_| Error::InvalidInput(format!("Value {value} too large to fit in i32")))
}

/// Convert an OpenCV size component to a tensor dimension
///
/// # Errors
///
/// Returns an error for negative values
pub fn i32_to_usize(value: i32) -> Result<usize> {
    value
        .try_into()
        .map_err(|_| Error::InvalidInput(format!("Negative dimension {value}")))
}

/// Truncate a coordinate towards zero, as integer pixel boxes are formed
///
/// # Errors
///
/// Returns an error if the value is not finite or outside i32 range
#[allow(clippy::cast_precision_loss)] // MIN/MAX bounds checking is approximate
#[allow(clippy::cast_possible_truncation)] // Truncation after bounds check is intended
pub fn f32_to_i32(value: f32) -> Result<i32> {
    if value.is_finite() && value >= i32::MIN as f32 && value <= i32::MAX as f32 {
        Ok(value as i32)
    } else {
        Err(Error::InvalidInput(format!(
            "Value {value} cannot be safely converted to i32"
        )))
    }
}

/// Clamp and truncate a coordinate into `[min, max]`; non-finite values map to `min`
#[must_use]
#[allow(clippy::cast_precision_loss)]
#[allow(clippy::cast_possible_truncation)]
pub fn f32_to_i32_clamp(value: f32, min: i32, max: i32) -> i32 {
    let (min, max) = if min <= max { (min, max) } else { (max, min) };
    if !value.is_finite() {
        return min;
    }
    (value.clamp(min as f32, max as f32) as i32).clamp(min, max)
}

/// Round a blended channel value to a byte
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn f32_to_u8(value: f32) -> u8 {
    if value.is_nan() {
        0
    } else {
        value.round().clamp(0.0, 255.0) as u8
    }
}
