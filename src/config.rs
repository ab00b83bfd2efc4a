//! Configuration management for the portrait animation and lip-sync pipelines

use crate::audio::ChunkLayout;
use crate::face_analysis::DetectionSettings;
use crate::face_parsing::MaskMode;
use crate::geometry::AlignParams;
use crate::runtime::{Accelerator, InferenceBackend, MemoryMode, ModelClass, ModelFactory, Precision};
use crate::segmentation::MarginVersion;
use crate::stream::{AnimationSettings, LipSyncSettings};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Model storage and precision
    pub models: ModelConfig,

    /// Runtime resource usage
    pub runtime: RuntimeConfig,

    /// Face detection parameters
    pub detection: DetectionConfig,

    /// Portrait animation parameters
    pub animation: AnimationConfig,

    /// Lip-sync parameters
    pub lipsync: LipSyncConfig,
}

/// Model storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Directory holding the `face`, `animation` and `lipsync` model folders
    pub root: PathBuf,

    /// Preferred execution device
    pub accelerator: Accelerator,

    /// Precision of the detection, landmark and parsing models
    pub detection_precision: Precision,

    /// Precision of the motion and rendering models
    pub animation_precision: Precision,

    /// Precision of the audio, VAE and generator models
    pub lipsync_precision: Precision,

    /// Optional grayscale paste-back mask in crop space
    pub mask_template: Option<PathBuf>,
}

/// Runtime resource configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// When models are loaded and released
    pub memory_mode: MemoryMode,

    /// Intra-op threads per ONNX session
    pub intra_threads: i16,
}

/// Face detection parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    /// Confidence threshold for face detection (0.0-1.0)
    pub score_threshold: f32,

    /// IOU threshold for non-maximum suppression (0.0-1.0)
    pub nms_threshold: f32,

    /// Square detector input size
    pub input_size: i32,
}

/// Portrait animation parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnimationConfig {
    /// Enlargement of the landmark square
    pub crop_scale: f32,

    /// Horizontal crop offset as a fraction of the square
    pub crop_vx_ratio: f32,

    /// Vertical crop offset as a fraction of the square
    pub crop_vy_ratio: f32,

    /// Refine driving keypoints with the stitching model
    pub use_stitching: bool,

    /// Apply motion relative to the first driving frame
    pub relative_motion: bool,

    /// Composite the result into the source image
    pub paste_back: bool,
}

/// Lip-sync parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LipSyncConfig {
    /// Crop geometry revision
    pub margin_version: MarginVersion,

    /// Output frames per second
    pub fps: f32,

    /// Audio context frames before each output frame
    pub padding_left: usize,

    /// Audio context frames after each output frame
    pub padding_right: usize,

    /// Top fraction of the blend region kept from the avatar
    pub upper_boundary_ratio: f32,

    /// Parsing classes blended back
    pub mask_mode: MaskMode,

    /// Vertical shift of the half-face landmark in pixels
    pub bbox_shift: i32,

    /// Expansion of the face box into the blend region
    pub face_expand: f32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("models"),
            accelerator: Accelerator::Cpu,
            detection_precision: Precision::Full,
            animation_precision: Precision::Half,
            lipsync_precision: Precision::Half,
            mask_template: None,
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            memory_mode: MemoryMode::Balanced,
            intra_threads: 4,
        }
    }
}

impl Default for DetectionConfig {
    fn default() -> Self {
        let settings = DetectionSettings::default();
        Self {
            score_threshold: settings.score_threshold,
            nms_threshold: settings.nms_threshold,
            input_size: settings.input_size,
        }
    }
}

impl Default for AnimationConfig {
    fn default() -> Self {
        Self {
            crop_scale: AlignParams::PORTRAIT.scale,
            crop_vx_ratio: AlignParams::PORTRAIT.vx_ratio,
            crop_vy_ratio: AlignParams::PORTRAIT.vy_ratio,
            use_stitching: true,
            relative_motion: true,
            paste_back: true,
        }
    }
}

impl Default for LipSyncConfig {
    fn default() -> Self {
        let layout = ChunkLayout::default();
        let settings = LipSyncSettings::default();
        Self {
            margin_version: settings.margin_version,
            fps: layout.fps,
            padding_left: layout.padding_left,
            padding_right: layout.padding_right,
            upper_boundary_ratio: settings.upper_boundary_ratio,
            mask_mode: settings.mask_mode,
            bbox_shift: settings.bbox_shift,
            face_expand: settings.face_expand,
        }
    }
}

impl Config {
    /// Load configuration from a YAML file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;

        serde_yaml::from_str(&content).map_err(|e| Error::ConfigError(format!("Failed to parse config: {e}")))
    }

    /// Save configuration to a YAML file
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or writing fails
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content =
            serde_yaml::to_string(self).map_err(|e| Error::ConfigError(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path, content)?;

        Ok(())
    }

    /// Model factory over `backend` with the configured policy, device and precisions
    #[must_use]
    pub fn model_factory(&self, backend: Arc<dyn InferenceBackend>) -> ModelFactory {
        ModelFactory::new(backend, self.runtime.memory_mode.into())
            .with_accelerator(self.models.accelerator)
            .with_precision(ModelClass::Detection, self.models.detection_precision)
            .with_precision(ModelClass::Animation, self.models.animation_precision)
            .with_precision(ModelClass::LipSync, self.models.lipsync_precision)
    }

    /// Detector thresholds
    #[must_use]
    pub fn detection_settings(&self) -> DetectionSettings {
        DetectionSettings {
            score_threshold: self.detection.score_threshold,
            nms_threshold: self.detection.nms_threshold,
            input_size: self.detection.input_size,
        }
    }

    /// Animation pipeline switches and crop
    #[must_use]
    pub fn animation_settings(&self) -> AnimationSettings {
        AnimationSettings {
            crop: AlignParams {
                scale: self.animation.crop_scale,
                vx_ratio: self.animation.crop_vx_ratio,
                vy_ratio: self.animation.crop_vy_ratio,
                ..AlignParams::PORTRAIT
            },
            use_stitching: self.animation.use_stitching,
            relative_motion: self.animation.relative_motion,
            paste_back: self.animation.paste_back,
        }
    }

    /// Lip-sync compositing settings
    #[must_use]
    pub fn lipsync_settings(&self) -> LipSyncSettings {
        LipSyncSettings {
            margin_version: self.lipsync.margin_version,
            mask_mode: self.lipsync.mask_mode,
            upper_boundary_ratio: self.lipsync.upper_boundary_ratio,
            bbox_shift: self.lipsync.bbox_shift,
            face_expand: self.lipsync.face_expand,
        }
    }

    /// Audio chunking for the configured frame rate
    #[must_use]
    pub fn chunk_layout(&self) -> ChunkLayout {
        ChunkLayout {
            fps: self.lipsync.fps,
            padding_left: self.lipsync.padding_left,
            padding_right: self.lipsync.padding_right,
        }
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` describing the first invalid value
    pub fn validate(&self) -> Result<()> {
        // Validate thresholds
        if !(0.0..=1.0).contains(&self.detection.score_threshold) {
            return Err(Error::ConfigError(
                "Score threshold must be between 0.0 and 1.0".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.detection.nms_threshold) {
            return Err(Error::ConfigError(
                "NMS threshold must be between 0.0 and 1.0".to_string(),
            ));
        }
        if self.detection.input_size < 32 || self.detection.input_size % 32 != 0 {
            return Err(Error::ConfigError(
                "Detector input size must be a positive multiple of 32".to_string(),
            ));
        }

        // Validate crop
        if self.animation.crop_scale <= 0.0 {
            return Err(Error::ConfigError("Crop scale must be greater than 0".to_string()));
        }

        // Validate lip sync
        if self.lipsync.fps <= 0.0 {
            return Err(Error::ConfigError("FPS must be greater than 0".to_string()));
        }
        if !(0.0..=1.0).contains(&self.lipsync.upper_boundary_ratio) {
            return Err(Error::ConfigError(
                "Upper boundary ratio must be between 0.0 and 1.0".to_string(),
            ));
        }
        if self.lipsync.face_expand < 1.0 {
            return Err(Error::ConfigError("Face expand must be at least 1.0".to_string()));
        }

        if self.runtime.intra_threads < 1 {
            return Err(Error::ConfigError("Intra threads must be at least 1".to_string()));
        }

        // Validate model paths exist
        if !self.models.root.is_dir() {
            return Err(Error::ConfigError(format!(
                "Model directory not found: {}",
                self.models.root.display()
            )));
        }
        if let Some(template) = &self.models.mask_template {
            if !template.exists() {
                return Err(Error::ConfigError(format!(
                    "Mask template not found: {}",
                    template.display()
                )));
            }
        }

        Ok(())
    }
}

/// Example configuration file content
pub const EXAMPLE_CONFIG: &str = r#"# Portrait Sync Configuration

# Model storage
models:
  root: "models"
  accelerator: cpu
  detection_precision: full
  animation_precision: half
  lipsync_precision: half

# Runtime resources
runtime:
  memory_mode: balanced
  intra_threads: 4

# Face detection parameters
detection:
  score_threshold: 0.5
  nms_threshold: 0.4
  input_size: 512

# Portrait animation
animation:
  crop_scale: 2.3
  crop_vx_ratio: 0.0
  crop_vy_ratio: -0.125
  use_stitching: true
  relative_motion: true
  paste_back: true

# Lip sync
lipsync:
  margin_version: v15
  fps: 25.0
  padding_left: 2
  padding_right: 2
  upper_boundary_ratio: 0.5
  mask_mode: jaw
  bbox_shift: 0
  face_expand: 1.5
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_example_config_parses() {
        let config: Config = serde_yaml::from_str(EXAMPLE_CONFIG).unwrap();
        assert_eq!(config.runtime.memory_mode, MemoryMode::Balanced);
        assert_eq!(config.lipsync.mask_mode, MaskMode::Jaw);
        assert_eq!(config.lipsync.margin_version, MarginVersion::V15);
        assert_eq!(config.models.animation_precision, Precision::Half);
        assert_eq!(config.detection.input_size, 512);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: Config = serde_yaml::from_str("lipsync:\n  fps: 30.0\n").unwrap();
        assert!((config.lipsync.fps - 30.0).abs() < f32::EPSILON);
        assert_eq!(config.lipsync.padding_left, 2);
        assert!(config.animation.use_stitching);
        assert_eq!(config.models.root, PathBuf::from("models"));
    }

    #[test]
    fn test_settings_follow_config() {
        let mut config = Config::default();
        config.animation.crop_scale = 2.0;
        config.animation.use_stitching = false;
        config.lipsync.fps = 50.0;

        let animation = config.animation_settings();
        assert!((animation.crop.scale - 2.0).abs() < f32::EPSILON);
        assert_eq!(animation.crop.dsize, AlignParams::PORTRAIT.dsize);
        assert!(!animation.use_stitching);
        assert!((config.chunk_layout().multiplier() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.models.root = dir.path().to_path_buf();
        assert!(config.validate().is_ok());

        config.detection.score_threshold = 1.5;
        assert!(config.validate().is_err());

        config.detection.score_threshold = 0.5;
        config.detection.input_size = 500;
        assert!(config.validate().is_err());

        config.detection.input_size = 512;
        config.lipsync.upper_boundary_ratio = -0.1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_model_root_is_rejected() {
        let mut config = Config::default();
        config.models.root = PathBuf::from("/nonexistent/portrait-sync-models");
        assert!(matches!(config.validate(), Err(Error::ConfigError(_))));
    }

    #[test]
    fn test_round_trip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        let mut config = Config::default();
        config.lipsync.bbox_shift = -5;
        config.to_file(&path).unwrap();

        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded.lipsync.bbox_shift, -5);
    }
}
