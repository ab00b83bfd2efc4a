//! Constants used throughout the pipelines

/// Face detector canvas size (longer image side is resized to this)
pub const DETECTOR_INPUT_SIZE: i32 = 512;

/// Default detector confidence threshold
pub const DEFAULT_DETECTION_THRESHOLD: f32 = 0.5;

/// Default IoU threshold for non-maximum suppression
pub const DEFAULT_NMS_THRESHOLD: f32 = 0.4;

/// Image normalization constants for face detection
pub const IMAGE_NORMALIZATION_OFFSET: f32 = 127.5;
pub const IMAGE_NORMALIZATION_SCALE: f32 = 128.0;

/// Number of keypoints emitted by the detector per face
pub const NUM_DETECTOR_KEYPOINTS: usize = 5;

/// Number of points produced by the dense landmark model
pub const NUM_FACIAL_LANDMARKS: usize = 106;

/// Number of points produced by the landmark refiner
pub const NUM_REFINED_LANDMARKS: usize = 203;

/// Landmark model input size
pub const LANDMARK_INPUT_SIZE: i32 = 192;

/// Box enlargement used when aligning the landmark crop
pub const LANDMARK_CROP_EXPAND: f32 = 1.5;

/// Landmark refiner input size
pub const REFINER_INPUT_SIZE: i32 = 224;

/// Face parsing model input size and class count
pub const PARSING_INPUT_SIZE: i32 = 512;
pub const PARSING_NUM_CLASSES: usize = 19;

/// ImageNet normalization used by the parsing model
pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Size of the portrait crop that generated faces are pasted back from
pub const CROP_SIZE: i32 = 512;

/// Input size of the motion, appearance and warping models
pub const MOTION_INPUT_SIZE: i32 = 256;

/// Number of implicit 3-D keypoints
pub const NUM_IMPLICIT_KEYPOINTS: usize = 21;

/// Head-pose classification bins and their degree mapping
pub const HEAD_POSE_BINS: usize = 66;
pub const HEAD_POSE_BIN_DEGREES: f32 = 3.0;
pub const HEAD_POSE_OFFSET_DEGREES: f32 = 97.5;

/// Stitching model output: per-keypoint deltas followed by a (dx, dy) shift
pub const STITCHING_OUTPUT_LEN: usize = NUM_IMPLICIT_KEYPOINTS * 3 + 2;

/// Lip-sync face size fed to the latent encoder
pub const LIPSYNC_FACE_SIZE: i32 = 256;

/// Side of the latent grid produced by the VAE encoder for a 256 face
pub const LIPSYNC_LATENT_SIZE: usize = 32;

/// Latent scaling applied after encoding and undone before decoding
pub const VAE_SCALING_FACTOR: f32 = 0.18215;

/// Expansion of the face box into the face-large blending region
pub const FACE_LARGE_EXPAND: f32 = 1.5;

/// Rows above this fraction of the face-large height keep the original pixels
pub const UPPER_BOUNDARY_RATIO: f32 = 0.5;

/// Audio sample rate expected by the feature encoder
pub const AUDIO_SAMPLE_RATE: u32 = 16_000;

/// Audio encoder feature frames per second
pub const AUDIO_FEATURE_RATE: f32 = 50.0;

/// Default output frames per second for lip sync
pub const DEFAULT_FPS: f32 = 25.0;

/// Numeric precision epsilon
pub const EPSILON: f32 = 1e-6;
