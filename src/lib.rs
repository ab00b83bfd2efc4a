//! Portrait animation and audio-driven lip sync.
//!
//! This library animates a still portrait so that it follows the head pose and
//! expression of driving frames, and re-renders the mouth region of an avatar
//! clip to match speech audio. It is built on:
//! - ONNX Runtime for neural network inference
//! - `OpenCV` for image warping, resizing and filtering
//! - `ndarray` and `nalgebra` for tensors and rotation math
//!
//! The animation pipeline consists of:
//! 1. Face detection (SCRFD) and 106-point landmarks on the source portrait
//! 2. Landmark refinement and a similarity-aligned crop
//! 3. Motion extraction (pose, expression, scale, translation, keypoints)
//! 4. Relative motion transfer, stitching and rendering of the driving keypoints
//! 5. Paste-back of the rendered crop into the source image
//!
//! The lip-sync pipeline prepares every avatar frame once (face box, blend
//! masks, latents) and then generates one output frame per audio feature
//! chunk, cycling through the avatar forwards and backwards.
//!
//! # Examples
//!
//! ## Portrait Animation
//!
//! ```no_run
//! use portrait_sync::{
//!     config::Config,
//!     face_analysis::FaceAnalysis,
//!     runtime::{ModelStore, OrtBackend},
//!     stream::{spawn_animation, PortraitAnimator},
//!     utils::image_conversion::solid_frame,
//! };
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::default();
//! let backend = Arc::new(OrtBackend::new(ModelStore::new(&config.models.root), 4)?);
//! let factory = config.model_factory(backend);
//! let analysis = Arc::new(FaceAnalysis::from_factory(&factory, &config.detection_settings())?);
//!
//! let mut animator = PortraitAnimator::from_factory(&factory, analysis, config.animation_settings())?;
//! let source = solid_frame(512, 512, [128, 128, 128])?;
//! animator.setup(&source)?;
//!
//! let driving = (0..10).map(|_| source.try_clone()).collect::<Result<Vec<_>, _>>()?;
//! let (queue, worker) = spawn_animation(animator, driving)?;
//! let frames: Vec<_> = queue.iter().collect();
//! println!("Animated {} frames", frames.len());
//! let _ = worker.join();
//! if let Some(e) = queue.take_error() {
//!     return Err(e.into());
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Lip Sync
//!
//! ```no_run
//! use portrait_sync::{
//!     audio::{read_wav, AudioFeatureExtractor},
//!     config::Config,
//!     face_analysis::FaceAnalysis,
//!     runtime::{ModelKind, ModelStore, OrtBackend},
//!     stream::{spawn_lipsync, LipSyncGenerator},
//! };
//! use opencv::core::Mat;
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! # let avatar_frames: Vec<Mat> = Vec::new();
//! let config = Config::default();
//! let backend = Arc::new(OrtBackend::new(ModelStore::new(&config.models.root), 4)?);
//! let factory = config.model_factory(backend);
//! let analysis = Arc::new(FaceAnalysis::from_factory(&factory, &config.detection_settings())?);
//!
//! let (samples, rate) = read_wav("speech.wav")?;
//! let mut extractor = AudioFeatureExtractor::new(factory.create(ModelKind::AudioEncoder)?, config.chunk_layout());
//! let features = extractor.extract(&samples, rate)?;
//!
//! let mut generator = LipSyncGenerator::from_factory(&factory, analysis, config.lipsync_settings())?;
//! generator.prepare_avatar(&avatar_frames)?;
//! let (queue, _worker) = spawn_lipsync(generator, features)?;
//! println!("Generating {} frames", queue.total_expected());
//! let frames: Vec<Mat> = queue.iter().collect();
//! println!("Generated {} frames", frames.len());
//! # Ok(())
//! # }
//! ```

/// Speech feature extraction and per-frame chunking
pub mod audio;

/// Configuration management
pub mod config;

/// Constants used throughout the library
pub mod constants;

/// Landmark-aligned face crops
pub mod cropping;

/// Error types and result handling
pub mod error;

/// Shared detection, landmark, refinement and parsing service
pub mod face_analysis;

/// SCRFD face detection
pub mod face_detection;

/// Face parsing into blend masks
pub mod face_parsing;

/// Similarity transforms, warps, rotations and blending
pub mod geometry;

/// 106-point landmarks and landmark refinement
pub mod mark_detection;

/// Keypoint transformation, stitching and rendering
pub mod motion;

/// Head pose, expression and keypoint extraction
pub mod pose_estimation;

/// Model descriptors, loading policies and inference sessions
pub mod runtime;

/// Lip-sync face boxes, blend masks and compositing
pub mod segmentation;

/// Animation and lip-sync pipelines and their output queue
pub mod stream;

/// Utility functions for image conversion and numeric casts
pub mod utils;

pub use error::{Error, Result};
