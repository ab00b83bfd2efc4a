//! Motion transfer: keypoint transformation, stitching and rendering.

/// Keypoint stitching refinement
pub mod stitching;

/// Relative motion and keypoint transformation
pub mod transfer;

/// Appearance features and the warping/render network
pub mod warping;

pub use stitching::{apply_stitching, StitchingRefiner};
pub use transfer::{transform_keypoints, MotionTarget, PredictionState};
pub use warping::{AppearanceExtractor, Warper};
