//! Utility functions for numeric conversion and frame/tensor interchange.

pub mod image_conversion;
pub mod safe_cast;
