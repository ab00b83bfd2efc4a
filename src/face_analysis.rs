//! Shared face analysis service.
//!
//! One [`FaceAnalysis`] instance is built by the caller and handed to every
//! pipeline as `Arc<FaceAnalysis>`. Each model sits behind its own lock so the
//! service can be used through a shared reference.

use crate::face_detection::FaceDetector;
use crate::face_parsing::{FaceParser, MaskMode};
use crate::geometry::FaceBox;
use crate::mark_detection::{LandmarkDetector, LandmarkRefiner};
use crate::runtime::{end_all, start_all, ModelFactory, ModelKind, SharedModel};
use crate::constants::NUM_DETECTOR_KEYPOINTS;
use crate::{Error, Result};
use opencv::core::{Mat, Point2f};
use parking_lot::Mutex;

/// A detected face with its dense landmarks
#[derive(Debug, Clone, PartialEq)]
pub struct FaceDetection {
    /// Bounding box in image coordinates
    pub bbox: FaceBox,
    /// Detector confidence
    pub score: f32,
    /// Detector keypoints, when the model provides them
    pub keypoints: Option<[Point2f; NUM_DETECTOR_KEYPOINTS]>,
    /// 106 landmarks in image coordinates
    pub landmarks: Vec<Point2f>,
}

/// Detection thresholds
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectionSettings {
    /// Minimum detector score
    pub score_threshold: f32,
    /// IoU at which overlapping boxes are suppressed
    pub nms_threshold: f32,
    /// Square canvas fed to the detector
    pub input_size: i32,
}

impl Default for DetectionSettings {
    fn default() -> Self {
        Self {
            score_threshold: crate::constants::DEFAULT_DETECTION_THRESHOLD,
            nms_threshold: crate::constants::DEFAULT_NMS_THRESHOLD,
            input_size: crate::constants::DETECTOR_INPUT_SIZE,
        }
    }
}

/// Detector, landmark model, refiner and parser bundled as one service
pub struct FaceAnalysis {
    detector: Mutex<FaceDetector>,
    landmarks: Mutex<LandmarkDetector>,
    refiner: Mutex<LandmarkRefiner>,
    parser: Mutex<FaceParser>,
    models: Vec<SharedModel>,
}

impl FaceAnalysis {
    /// Assemble the service from already wrapped components
    #[must_use]
    pub fn new(
        detector: FaceDetector,
        landmarks: LandmarkDetector,
        refiner: LandmarkRefiner,
        parser: FaceParser,
    ) -> Self {
        let models = vec![
            detector.model().clone(),
            landmarks.model().clone(),
            refiner.model().clone(),
            parser.model().clone(),
        ];
        Self {
            detector: Mutex::new(detector),
            landmarks: Mutex::new(landmarks),
            refiner: Mutex::new(refiner),
            parser: Mutex::new(parser),
            models,
        }
    }

    /// Create every model through `factory`
    ///
    /// # Errors
    ///
    /// Returns an error if an eagerly loaded model fails to load
    pub fn from_factory(factory: &ModelFactory, settings: &DetectionSettings) -> Result<Self> {
        let detector = FaceDetector::new(
            factory.create(ModelKind::FaceDetector)?,
            settings.score_threshold,
            settings.nms_threshold,
        )
        .with_input_size(settings.input_size);
        Ok(Self::new(
            detector,
            LandmarkDetector::new(factory.create(ModelKind::Landmark106)?),
            LandmarkRefiner::new(factory.create(ModelKind::LandmarkRefiner)?),
            FaceParser::new(factory.create(ModelKind::FaceParsing)?),
        ))
    }

    /// Load every model that is not resident
    ///
    /// # Errors
    ///
    /// Returns the first load failure; models started before it are ended again
    pub fn start_session(&self) -> Result<()> {
        start_all(&self.models.iter().collect::<Vec<_>>())
    }

    /// End the session on every model
    pub fn end_session(&self) {
        end_all(&self.models.iter().collect::<Vec<_>>());
    }

    /// All faces with landmarks, largest box first
    ///
    /// # Errors
    ///
    /// Returns an error for invalid frames, model failures or degenerate boxes
    pub fn detect(&self, frame: &Mat) -> Result<Vec<FaceDetection>> {
        let candidates = self.detector.lock().detect(frame)?;
        let mut landmarks = self.landmarks.lock();
        candidates
            .into_iter()
            .map(|candidate| {
                Ok(FaceDetection {
                    landmarks: landmarks.detect(frame, &candidate.bbox)?,
                    bbox: candidate.bbox,
                    score: candidate.score,
                    keypoints: candidate.keypoints,
                })
            })
            .collect()
    }

    /// The largest face, warning when several are present
    ///
    /// # Errors
    ///
    /// Returns `NoFaceDetected` when nothing passes the threshold
    pub fn detect_primary(&self, frame: &Mat) -> Result<FaceDetection> {
        let faces = self.detect(frame)?;
        if faces.len() > 1 {
            log::warn!("{} faces detected, using the largest", faces.len());
        }
        faces.into_iter().next().ok_or_else(|| Error::NoFaceDetected(String::new()))
    }

    /// Track landmarks from the previous frame's estimate
    ///
    /// # Errors
    ///
    /// Returns an error for invalid input or model failures
    pub fn refine_landmarks(&self, frame: &Mat, landmarks: &[Point2f]) -> Result<Vec<Point2f>> {
        self.refiner.lock().refine(frame, landmarks)
    }

    /// Blend mask of the selected regions at the frame's size
    ///
    /// # Errors
    ///
    /// Returns an error for invalid input or model failures
    pub fn generate_parsing_mask(&self, frame: &Mat, mode: MaskMode) -> Result<Mat> {
        self.parser.lock().parse(frame, mode)
    }
}
