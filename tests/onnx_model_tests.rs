//! Tests against the real ONNX models under `models/`

use opencv::core::Mat;
use opencv::prelude::*;
use portrait_sync::{
    audio::{AudioFeatureExtractor, ChunkLayout},
    config::Config,
    face_analysis::FaceAnalysis,
    runtime::{ModelFactory, ModelKind, ModelStore, OrtBackend},
    stream::{LipSyncGenerator, OutputQueue, PortraitAnimator},
    utils::image_conversion::solid_frame,
    Result,
};
use std::sync::Arc;

fn factory() -> Result<(Config, ModelFactory)> {
    let config = Config::default();
    let backend = Arc::new(OrtBackend::new(ModelStore::new(&config.models.root), 2)?);
    let factory = config.model_factory(backend);
    Ok((config, factory))
}

fn test_portrait() -> Result<Mat> {
    let path = "tests/data/portrait.jpg";
    let bgr = opencv::imgcodecs::imread(path, opencv::imgcodecs::IMREAD_COLOR)?;
    assert!(!bgr.empty(), "Test portrait not found at {path}");
    let mut rgb = Mat::default();
    opencv::imgproc::cvt_color_def(&bgr, &mut rgb, opencv::imgproc::COLOR_BGR2RGB)?;
    Ok(rgb)
}

#[test]
#[ignore = "Requires ONNX models"]
fn test_load_every_model() -> Result<()> {
    let (_, factory) = factory()?;
    for kind in [
        ModelKind::FaceDetector,
        ModelKind::Landmark106,
        ModelKind::LandmarkRefiner,
        ModelKind::FaceParsing,
        ModelKind::MotionExtractor,
        ModelKind::AppearanceExtractor,
        ModelKind::Stitching,
        ModelKind::Warping,
        ModelKind::AudioEncoder,
        ModelKind::VaeEncoder,
        ModelKind::VaeDecoder,
        ModelKind::LipSyncGenerator,
    ] {
        let model = factory.create(kind)?;
        let mut model = model.lock();
        model.start_session()?;
        assert!(!model.input_names()?.is_empty(), "{} has no inputs", kind.name());
        model.end_session();
    }
    Ok(())
}

#[test]
#[ignore = "Requires ONNX models"]
fn test_no_face_on_blank_frame() -> Result<()> {
    let (config, factory) = factory()?;
    let analysis = FaceAnalysis::from_factory(&factory, &config.detection_settings())?;
    analysis.start_session()?;
    let blank = solid_frame(640, 480, [128, 128, 128])?;
    let faces = analysis.detect(&blank)?;
    analysis.end_session();
    assert!(faces.is_empty());
    Ok(())
}

#[test]
#[ignore = "Requires ONNX models and test image"]
fn test_animate_portrait_with_itself() -> Result<()> {
    let (config, factory) = factory()?;
    let analysis = Arc::new(FaceAnalysis::from_factory(&factory, &config.detection_settings())?);
    let mut animator = PortraitAnimator::from_factory(&factory, analysis, config.animation_settings())?;

    let source = test_portrait()?;
    animator.setup(&source)?;
    let queue = OutputQueue::new();
    let driving = vec![source.try_clone()?, source.try_clone()?];
    assert_eq!(animator.run(driving, &queue)?, 2);

    for frame in queue.iter() {
        assert_eq!((frame.cols(), frame.rows()), (source.cols(), source.rows()));
    }
    Ok(())
}

#[test]
#[ignore = "Requires ONNX models and test image"]
fn test_lipsync_one_second_of_silence() -> Result<()> {
    let (config, factory) = factory()?;
    let analysis = Arc::new(FaceAnalysis::from_factory(&factory, &config.detection_settings())?);

    let mut extractor = AudioFeatureExtractor::new(factory.create(ModelKind::AudioEncoder)?, ChunkLayout::default());
    let features = extractor.extract(&vec![0.0; 16_000], 16_000)?;
    assert_eq!(features.len(), 25);

    let mut generator = LipSyncGenerator::from_factory(&factory, analysis, config.lipsync_settings())?;
    generator.prepare_avatar(&[test_portrait()?])?;
    let queue = OutputQueue::new();
    assert_eq!(generator.run(&features, &queue)?, 25);
    assert_eq!(queue.iter().count(), 25);
    Ok(())
}
