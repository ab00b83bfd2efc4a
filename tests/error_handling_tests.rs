//! Error handling across modules

mod test_helpers;

use opencv::core::{Mat, Point2f, Rect, CV_8UC1, CV_8UC3};
use portrait_sync::{
    cropping::crop_image,
    error::{Error, Result},
    geometry::{blend_with_mask, AlignParams, FaceBox},
    mark_detection::LandmarkDetector,
    runtime::{LoadPolicy, ModelKind},
    segmentation::hybrid_face_box,
    stream::{AnimationSettings, PortraitAnimator},
    utils::image_conversion::{solid_frame, solid_mask},
    utils::safe_cast::{f32_to_i32, f32_to_i32_clamp, i32_to_usize, usize_to_i32},
};
use std::sync::Arc;
use test_helpers::{create_test_image, face_image, mock_analysis, mock_factory, MockBackend};

#[test]
fn test_invalid_frames_are_rejected() -> Result<()> {
    let backend = Arc::new(MockBackend::portrait());
    let factory = mock_factory(&backend, LoadPolicy::Eager);
    let analysis = mock_analysis(&factory)?;

    assert!(matches!(analysis.detect(&Mat::default()), Err(Error::InvalidInput(_))));
    let gray = create_test_image(64, 64, CV_8UC1)?;
    assert!(matches!(analysis.detect(&gray), Err(Error::InvalidInput(_))));
    let color = create_test_image(64, 64, CV_8UC3)?;
    assert!(analysis.detect(&color)?.is_empty());
    Ok(())
}

#[test]
fn test_degenerate_boxes() {
    let flat = FaceBox::new(10.0, 10.0, 10.0, 40.0);
    assert!(matches!(flat.validate(), Err(Error::DegenerateBox { .. })));
    assert!(FaceBox::new(0.0, 0.0, f32::NAN, 1.0).validate().is_err());
    assert!(LandmarkDetector::crop_transform(&flat).is_err());

    // every landmark on one spot and an unusable detector box
    let landmarks = vec![Point2f::new(5.0, 5.0); 106];
    assert!(hybrid_face_box(&landmarks, &flat, 0, 100, 100).is_err());
}

#[test]
fn test_crop_needs_a_supported_layout() -> Result<()> {
    let frame = solid_frame(100, 100, [1, 2, 3])?;
    let points = vec![Point2f::new(50.0, 50.0); 68];
    assert!(matches!(
        crop_image(&frame, &points, &AlignParams::PORTRAIT, 256),
        Err(Error::InvalidInput(_))
    ));
    let collapsed = vec![Point2f::new(50.0, 50.0); 5];
    assert!(crop_image(&frame, &collapsed, &AlignParams::PORTRAIT, 256).is_err());
    Ok(())
}

#[test]
fn test_blend_inputs_must_agree() -> Result<()> {
    let frame = solid_frame(8, 8, [0, 0, 0])?;
    let mask = solid_mask(8, 8, 255)?;
    assert!(blend_with_mask(&frame, &frame, &frame).is_err());
    assert!(blend_with_mask(&frame, &solid_frame(4, 8, [0, 0, 0])?, &mask).is_err());
    assert!(blend_with_mask(&frame, &frame, &mask).is_ok());
    Ok(())
}

#[test]
fn test_model_failure_names_the_model() -> Result<()> {
    let backend = Arc::new(MockBackend::portrait().with_model(ModelKind::Warping.name(), |_| {
        Err(Error::ModelOutputError("tensor shape mismatch".to_string()))
    }));
    let factory = mock_factory(&backend, LoadPolicy::Eager);
    let analysis = mock_analysis(&factory)?;
    let mut animator = PortraitAnimator::from_factory(&factory, analysis, AnimationSettings::default())?;

    let source = face_image(512, 512, Rect::new(176, 160, 160, 160))?;
    animator.setup(&source)?;
    let err = animator.process(&source).unwrap_err();
    assert!(err.is_session_fatal());
    let text = err.to_string();
    assert!(text.contains("warping_spade"), "{text}");
    assert!(text.contains("tensor shape mismatch"), "{text}");
    Ok(())
}

#[test]
fn test_wrong_output_count_is_reported() -> Result<()> {
    let backend = Arc::new(MockBackend::portrait().with_model(ModelKind::FaceDetector.name(), |_| {
        Ok(vec![ndarray::ArrayD::zeros(ndarray::IxDyn(&[1, 4])); 7])
    }));
    let factory = mock_factory(&backend, LoadPolicy::Eager);
    let analysis = mock_analysis(&factory)?;
    let frame = solid_frame(64, 64, [0, 0, 0])?;
    assert!(matches!(analysis.detect(&frame), Err(Error::ModelOutputError(_))));
    Ok(())
}

#[test]
fn test_safe_cast_errors() {
    assert!(usize_to_i32(usize::MAX).is_err());
    assert!(i32_to_usize(-1).is_err());
    assert!(f32_to_i32(f32::INFINITY).is_err());
    assert!(f32_to_i32(f32::NAN).is_err());
    assert_eq!(f32_to_i32(-3.7).unwrap(), -3);
    assert_eq!(f32_to_i32_clamp(f32::NAN, 0, 10), 0);
    assert_eq!(f32_to_i32_clamp(99.0, 0, 10), 10);
}

#[test]
fn test_error_messages() {
    assert_eq!(
        Error::NoFaceDetected(" in driving frame 3".to_string()).to_string(),
        "No face detected in driving frame 3"
    );
    assert_eq!(Error::Cancelled.to_string(), "Stream cancelled by consumer");
    let io: Error = std::io::Error::new(std::io::ErrorKind::NotFound, "missing").into();
    assert!(matches!(io, Error::Io(_)));
    assert!(!io.is_session_fatal());
}
