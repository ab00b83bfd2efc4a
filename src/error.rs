//! Error types for the portrait animation and lip-sync library.

use thiserror::Error;

/// Main error type for the library
#[derive(Error, Debug)]
pub enum Error {
    /// `OpenCV` operation failed
    #[error("OpenCV error: {0}")]
    OpenCV(#[from] opencv::Error),

    /// `ONNX` Runtime call failed outside of model execution (environment, session build)
    #[error("ONNX Runtime error: {0}")]
    OnnxRuntime(#[from] ort::OrtError),

    /// File I/O operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Null, empty or wrongly sized input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// No face passed the detection threshold
    #[error("No face detected{0}")]
    NoFaceDetected(String),

    /// Bounding box with zero or negative extent reached a downstream stage
    #[error("Degenerate bounding box ({x1}, {y1}, {x2}, {y2})")]
    DegenerateBox {
        /// Left edge
        x1: f32,
        /// Top edge
        y1: f32,
        /// Right edge
        x2: f32,
        /// Bottom edge
        y2: f32,
    },

    /// Inference threw inside a model
    #[error("Model execution failed for '{model}': {source}")]
    ModelExecution {
        /// Name of the model that failed
        model: String,
        /// Underlying cause
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Inference requested outside of a session on a lazily loaded model
    #[error("Model '{0}' is not loaded; call start_session first")]
    ModelNotLoaded(String),

    /// Model loading error
    #[error("Model error: {0}")]
    ModelError(String),

    /// Model output processing error
    #[error("Model output error: {0}")]
    ModelOutputError(String),

    /// Model data shape or format error
    #[error("Model data format error: {0}")]
    ModelDataFormatError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// The consumer stopped draining the output queue
    #[error("Stream cancelled by consumer")]
    Cancelled,
}

impl Error {
    /// Wrap any failure raised while executing `model`
    pub fn model_execution<E>(model: impl Into<String>, source: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::ModelExecution {
            model: model.into(),
            source: source.into(),
        }
    }

    /// Whether this error ends a session rather than a single call
    #[must_use]
    pub fn is_session_fatal(&self) -> bool {
        matches!(self, Self::ModelExecution { .. } | Self::ModelNotLoaded(_) | Self::Cancelled)
    }
}

/// Convenience type alias for Results with our Error type
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_execution_carries_name_and_cause() {
        let err = Error::model_execution("warping", "shape mismatch");
        let text = err.to_string();
        assert!(text.contains("warping"));
        assert!(text.contains("shape mismatch"));
        assert!(std::error::Error::source(&err).is_some());
        assert!(err.is_session_fatal());
    }

    #[test]
    fn test_no_face_is_not_session_fatal() {
        let err = Error::NoFaceDetected(" in source image".to_string());
        assert_eq!(err.to_string(), "No face detected in source image");
        assert!(!err.is_session_fatal());
    }
}
