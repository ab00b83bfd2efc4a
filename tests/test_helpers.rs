//! Helper functions and in-memory models for tests
//!
//! `MockBackend::portrait()` serves every model the pipelines use with small,
//! deterministic stand-ins: the detector finds bright rectangles, the landmark
//! models return fixed face templates and the generative models pass their
//! inputs through.

#![allow(dead_code)]

use ndarray::{s, Array2, Array4, ArrayD, ArrayViewD, Axis, Ix4};
use opencv::core::{Mat, Rect, Scalar, Vec3b, CV_8UC3};
use opencv::prelude::*;
use parking_lot::Mutex;
use portrait_sync::face_analysis::{DetectionSettings, FaceAnalysis};
use portrait_sync::runtime::{
    store_output, InferenceBackend, LoadPolicy, LoadedModel, ModelDescriptor, ModelFactory, ModelKind,
};
use portrait_sync::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;

type Forward = dyn Fn(&[ArrayViewD<'_, f32>]) -> Result<Vec<ArrayD<f32>>> + Send + Sync;

/// Detector strides of the 3-stride SCRFD layout
pub const DETECTOR_STRIDES: [usize; 3] = [8, 16, 32];

/// Score the mock detector assigns to a bright region
pub const MOCK_SCORE: f32 = 0.9;

/// Latent channels per image in the lip-sync mocks
const LATENT_CHANNELS: usize = 4;

/// Pixels per latent cell
const LATENT_STRIDE: usize = 8;

/// Feature width of the mock audio encoder
pub const AUDIO_FEATURE_DIM: usize = 8;

struct MockModel {
    inputs: Vec<String>,
    outputs: Vec<String>,
    forward: Arc<Forward>,
}

impl LoadedModel for MockModel {
    fn input_names(&self) -> &[String] {
        &self.inputs
    }

    fn output_names(&self) -> &[String] {
        &self.outputs
    }

    fn run(&mut self, inputs: &[ArrayViewD<'_, f32>], outputs: &mut Vec<ArrayD<f32>>) -> Result<()> {
        let produced = (self.forward)(inputs)?;
        for (index, value) in produced.iter().enumerate() {
            store_output(outputs, index, value.view());
        }
        outputs.truncate(produced.len());
        Ok(())
    }
}

/// Backend serving registered closures by model name and counting loads
#[derive(Default)]
pub struct MockBackend {
    models: HashMap<String, Arc<Forward>>,
    loads: Mutex<HashMap<String, usize>>,
}

impl MockBackend {
    /// Backend without any model
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `forward` under `name`
    pub fn with_model<F>(mut self, name: &str, forward: F) -> Self
    where
        F: Fn(&[ArrayViewD<'_, f32>]) -> Result<Vec<ArrayD<f32>>> + Send + Sync + 'static,
    {
        self.models.insert(name.to_string(), Arc::new(forward));
        self
    }

    /// Drop the model registered under `name`, so loading it fails
    pub fn without_model(mut self, name: &str) -> Self {
        self.models.remove(name);
        self
    }

    /// Every model used by the animation and lip-sync pipelines
    pub fn portrait() -> Self {
        Self::new()
            .with_model(ModelKind::FaceDetector.name(), detector_forward)
            .with_model(ModelKind::Landmark106.name(), landmark_forward)
            .with_model(ModelKind::LandmarkRefiner.name(), refiner_forward)
            .with_model(ModelKind::FaceParsing.name(), parsing_forward)
            .with_model(ModelKind::MotionExtractor.name(), motion_forward)
            .with_model(ModelKind::AppearanceExtractor.name(), passthrough_forward)
            .with_model(ModelKind::Warping.name(), passthrough_forward)
            .with_model(ModelKind::Stitching.name(), stitching_forward)
            .with_model(ModelKind::AudioEncoder.name(), audio_forward)
            .with_model(ModelKind::VaeEncoder.name(), vae_encoder_forward)
            .with_model(ModelKind::VaeDecoder.name(), vae_decoder_forward)
            .with_model(ModelKind::LipSyncGenerator.name(), unet_forward)
    }

    /// How often `name` was loaded
    pub fn loads(&self, name: &str) -> usize {
        self.loads.lock().get(name).copied().unwrap_or(0)
    }
}

impl InferenceBackend for MockBackend {
    fn load(&self, descriptor: &ModelDescriptor) -> Result<Box<dyn LoadedModel>> {
        let forward = self
            .models
            .get(&descriptor.name)
            .cloned()
            .ok_or_else(|| Error::ModelError(format!("No mock registered for '{}'", descriptor.name)))?;
        *self.loads.lock().entry(descriptor.name.clone()).or_insert(0) += 1;
        Ok(Box::new(MockModel {
            inputs: vec!["input".to_string()],
            outputs: vec!["output".to_string()],
            forward,
        }))
    }
}

fn first_nchw<'a>(inputs: &'a [ArrayViewD<'_, f32>]) -> Result<ndarray::ArrayView4<'a, f32>> {
    inputs
        .first()
        .ok_or_else(|| Error::InvalidInput("missing input".to_string()))?
        .view()
        .into_dimensionality::<Ix4>()
        .map_err(|e| Error::InvalidInput(format!("expected NCHW input: {e}")))
}

/// Canvas-space extent of pixels bright in every channel
fn bright_region(image: &ndarray::ArrayView4<'_, f32>) -> Option<(f32, f32, f32, f32)> {
    let (_, _, height, width) = image.dim();
    let mut bounds: Option<(usize, usize, usize, usize)> = None;
    for y in 0..height {
        for x in 0..width {
            if (0..3).all(|c| image[[0, c, y, x]] > 0.5) {
                bounds = Some(match bounds {
                    None => (x, y, x, y),
                    Some((x1, y1, x2, y2)) => (x1.min(x), y1.min(y), x2.max(x), y2.max(y)),
                });
            }
        }
    }
    bounds.map(|(x1, y1, x2, y2)| (x1 as f32, y1 as f32, (x2 + 1) as f32, (y2 + 1) as f32))
}

/// Emits one stride-32 anchor covering the bright region, with keypoints
pub fn detector_forward(inputs: &[ArrayViewD<'_, f32>]) -> Result<Vec<ArrayD<f32>>> {
    let image = first_nchw(inputs)?;
    let canvas = image.dim().2;

    let mut scores = Vec::new();
    let mut boxes = Vec::new();
    let mut kps = Vec::new();
    for stride in DETECTOR_STRIDES {
        let cells = canvas / stride;
        let count = cells * cells * 2;
        scores.push(Array2::<f32>::zeros((count, 1)));
        boxes.push(Array2::<f32>::zeros((count, 4)));
        kps.push(Array2::<f32>::zeros((count, 10)));
    }

    if let Some((x1, y1, x2, y2)) = bright_region(&image) {
        let level = DETECTOR_STRIDES.len() - 1;
        let stride = DETECTOR_STRIDES[level];
        let cells = canvas / stride;
        let s = stride as f32;
        let gx = (((x1 + x2) / 2.0 / s) as usize).min(cells - 1);
        let gy = (((y1 + y2) / 2.0 / s) as usize).min(cells - 1);
        let anchor = (gy * cells + gx) * 2;
        let (ax, ay) = (gx as f32 * s, gy as f32 * s);

        scores[level][[anchor, 0]] = MOCK_SCORE;
        let d = [(ax - x1) / s, (ay - y1) / s, (x2 - ax) / s, (y2 - ay) / s];
        for (k, v) in d.iter().enumerate() {
            boxes[level][[anchor, k]] = *v;
        }
        let (w, h) = (x2 - x1, y2 - y1);
        let points = [(0.3, 0.35), (0.7, 0.35), (0.5, 0.55), (0.35, 0.75), (0.65, 0.75)];
        for (k, (px, py)) in points.iter().enumerate() {
            kps[level][[anchor, k * 2]] = (x1 + px * w - ax) / s;
            kps[level][[anchor, k * 2 + 1]] = (y1 + py * h - ay) / s;
        }
    }

    Ok(scores
        .into_iter()
        .chain(boxes)
        .chain(kps)
        .map(Array2::into_dyn)
        .collect())
}

/// Points on a circle with eyes and lips moved to fixed spots
fn face_template(
    count: usize,
    center: (f32, f32),
    radius: f32,
    eyes: (&[usize], &[usize]),
    lips: &[usize],
    extra: &[(usize, (f32, f32))],
) -> Vec<(f32, f32)> {
    let mut points: Vec<(f32, f32)> = (0..count)
        .map(|i| {
            let a = i as f32 / count as f32 * std::f32::consts::TAU;
            (center.0 + radius * a.cos(), center.1 + radius * a.sin())
        })
        .collect();
    let eye_dx = radius * 0.4;
    let eye_dy = radius * 0.3;
    for &i in eyes.0 {
        points[i] = (center.0 - eye_dx, center.1 - eye_dy);
    }
    for &i in eyes.1 {
        points[i] = (center.0 + eye_dx, center.1 - eye_dy);
    }
    for &i in lips {
        points[i] = (center.0, center.1 + radius * 0.5);
    }
    for &(i, p) in extra {
        points[i] = p;
    }
    points
}

/// 106-point template in the detector model's `[-1, 1]` crop space
pub fn landmark_template_106() -> Vec<(f32, f32)> {
    face_template(
        106,
        (0.0, 0.0),
        0.5,
        (&[33, 35, 40, 39], &[87, 89, 94, 93]),
        &[52, 61],
        &[(66, (0.0, 0.0))],
    )
}

/// 203-point template in the refiner's `[0, 1]` crop space, placed so that
/// refining its own output is stable
pub fn landmark_template_203() -> Vec<(f32, f32)> {
    face_template(
        203,
        (0.5, 0.6),
        1.0 / 3.0,
        (&[0, 6, 12, 18], &[24, 30, 36, 42]),
        &[48, 66],
        &[],
    )
}

fn flatten(points: &[(f32, f32)]) -> ArrayD<f32> {
    let values: Vec<f32> = points.iter().flat_map(|&(x, y)| [x, y]).collect();
    Array2::from_shape_vec((1, values.len()), values)
        .expect("template shape")
        .into_dyn()
}

fn landmark_forward(inputs: &[ArrayViewD<'_, f32>]) -> Result<Vec<ArrayD<f32>>> {
    first_nchw(inputs)?;
    Ok(vec![flatten(&landmark_template_106())])
}

/// A confidence output followed by the landmarks, which come last
fn refiner_forward(inputs: &[ArrayViewD<'_, f32>]) -> Result<Vec<ArrayD<f32>>> {
    first_nchw(inputs)?;
    Ok(vec![
        Array2::from_elem((1, 1), 1.0f32).into_dyn(),
        flatten(&landmark_template_203()),
    ])
}

/// Skin everywhere on a coarse grid
fn parsing_forward(inputs: &[ArrayViewD<'_, f32>]) -> Result<Vec<ArrayD<f32>>> {
    first_nchw(inputs)?;
    let mut scores = Array4::<f32>::zeros((1, 19, 32, 32));
    scores.slice_mut(s![0, 1, .., ..]).fill(1.0);
    Ok(vec![scores.into_dyn()])
}

/// Canonical keypoints of the mock motion extractor
pub fn mock_keypoints() -> Array2<f32> {
    Array2::from_shape_fn((21, 3), |(i, c)| (i as f32 - 10.0) * 0.02 + c as f32 * 0.01)
}

/// Neutral pose, unit scale and fixed keypoints for every crop
pub fn motion_forward(inputs: &[ArrayViewD<'_, f32>]) -> Result<Vec<ArrayD<f32>>> {
    first_nchw(inputs)?;
    let kp: Vec<f32> = mock_keypoints().iter().copied().collect();
    Ok(vec![
        Array2::<f32>::zeros((1, 66)).into_dyn(),
        Array2::<f32>::zeros((1, 66)).into_dyn(),
        Array2::<f32>::zeros((1, 66)).into_dyn(),
        Array2::<f32>::zeros((1, 3)).into_dyn(),
        Array2::<f32>::zeros((1, 63)).into_dyn(),
        Array2::from_elem((1, 1), 1.0f32).into_dyn(),
        Array2::from_shape_vec((1, 63), kp).expect("keypoint shape").into_dyn(),
    ])
}

fn passthrough_forward(inputs: &[ArrayViewD<'_, f32>]) -> Result<Vec<ArrayD<f32>>> {
    let first = inputs
        .first()
        .ok_or_else(|| Error::InvalidInput("missing input".to_string()))?;
    Ok(vec![first.to_owned()])
}

fn stitching_forward(inputs: &[ArrayViewD<'_, f32>]) -> Result<Vec<ArrayD<f32>>> {
    let first = inputs
        .first()
        .ok_or_else(|| Error::InvalidInput("missing input".to_string()))?;
    if first.len() != 126 {
        return Err(Error::InvalidInput(format!("stitching input has {} values", first.len())));
    }
    Ok(vec![Array2::<f32>::zeros((1, 65)).into_dyn()])
}

/// One feature row per 20 ms of 16 kHz audio
fn audio_forward(inputs: &[ArrayViewD<'_, f32>]) -> Result<Vec<ArrayD<f32>>> {
    let samples: Vec<f32> = inputs
        .first()
        .ok_or_else(|| Error::InvalidInput("missing input".to_string()))?
        .iter()
        .copied()
        .collect();
    let rows = (samples.len() / 320).max(1);
    let mut features = ndarray::Array3::<f32>::zeros((1, rows, AUDIO_FEATURE_DIM));
    for (row, chunk) in samples.chunks(320).take(rows).enumerate() {
        let mean = chunk.iter().sum::<f32>() / chunk.len() as f32;
        features.slice_mut(s![0, row, ..]).fill(mean);
    }
    Ok(vec![features.into_dyn()])
}

/// 8×8 average pooling into four latent channels
fn vae_encoder_forward(inputs: &[ArrayViewD<'_, f32>]) -> Result<Vec<ArrayD<f32>>> {
    let image = first_nchw(inputs)?;
    let (_, _, height, width) = image.dim();
    let (lh, lw) = (height / LATENT_STRIDE, width / LATENT_STRIDE);
    let mut latent = Array4::<f32>::zeros((1, LATENT_CHANNELS, lh, lw));
    let area = (LATENT_STRIDE * LATENT_STRIDE) as f32;
    for y in 0..lh {
        for x in 0..lw {
            let block = image.slice(s![
                0,
                ..,
                y * LATENT_STRIDE..(y + 1) * LATENT_STRIDE,
                x * LATENT_STRIDE..(x + 1) * LATENT_STRIDE
            ]);
            let mut total = 0.0;
            for c in 0..3 {
                let mean = block.index_axis(Axis(0), c).sum() / area;
                latent[[0, c, y, x]] = mean;
                total += mean;
            }
            latent[[0, 3, y, x]] = total / 3.0;
        }
    }
    Ok(vec![latent.into_dyn()])
}

/// Nearest-neighbour upsampling of the first three latent channels
fn vae_decoder_forward(inputs: &[ArrayViewD<'_, f32>]) -> Result<Vec<ArrayD<f32>>> {
    let latent = first_nchw(inputs)?;
    let (_, _, lh, lw) = latent.dim();
    let image = Array4::from_shape_fn((1, 3, lh * LATENT_STRIDE, lw * LATENT_STRIDE), |(_, c, y, x)| {
        latent[[0, c, y / LATENT_STRIDE, x / LATENT_STRIDE]]
    });
    Ok(vec![image.into_dyn()])
}

/// Returns the reference half of the stacked latent after checking the wiring
fn unet_forward(inputs: &[ArrayViewD<'_, f32>]) -> Result<Vec<ArrayD<f32>>> {
    if inputs.len() != 3 {
        return Err(Error::InvalidInput(format!("generator got {} inputs", inputs.len())));
    }
    if inputs[1].len() != 1 || inputs[2].ndim() != 3 {
        return Err(Error::InvalidInput("generator expects a timestep and a 3-D audio chunk".to_string()));
    }
    let latent = first_nchw(inputs)?;
    if latent.dim().1 != LATENT_CHANNELS * 2 {
        return Err(Error::InvalidInput(format!("generator latent has {} channels", latent.dim().1)));
    }
    Ok(vec![latent.slice(s![.., LATENT_CHANNELS.., .., ..]).to_owned().into_dyn()])
}

/// Model factory over a mock backend
pub fn mock_factory(backend: &Arc<MockBackend>, policy: LoadPolicy) -> ModelFactory {
    ModelFactory::new(backend.clone(), policy)
}

/// Face analysis service over a mock backend
pub fn mock_analysis(factory: &ModelFactory) -> Result<Arc<FaceAnalysis>> {
    Ok(Arc::new(FaceAnalysis::from_factory(factory, &DetectionSettings::default())?))
}

/// Create a test image with specified dimensions and type
pub fn create_test_image(height: i32, width: i32, cv_type: i32) -> Result<Mat> {
    Ok(Mat::new_rows_cols_with_default(height, width, cv_type, Scalar::all(0.0))?)
}

/// Dark gradient background with one bright rectangle standing in for a face
pub fn face_image(width: i32, height: i32, face: Rect) -> Result<Mat> {
    let mut image = create_test_image(height, width, CV_8UC3)?;
    let cols = width as usize;
    for (index, pixel) in image.data_typed_mut::<Vec3b>()?.iter_mut().enumerate() {
        let (x, y) = ((index % cols) as i32, (index / cols) as i32);
        *pixel = if face.contains(opencv::core::Point::new(x, y)) {
            Vec3b::from([235, 225, 215])
        } else {
            Vec3b::from([
                (40 + 60 * x / width) as u8,
                (50 + 50 * y / height) as u8,
                80,
            ])
        };
    }
    Ok(image)
}

/// Mean absolute difference over all channels
pub fn mean_abs_diff(a: &Mat, b: &Mat) -> Result<f64> {
    let (a, b) = (a.data_bytes()?, b.data_bytes()?);
    if a.len() != b.len() {
        return Err(Error::InvalidInput("images differ in size".to_string()));
    }
    let total: u64 = a.iter().zip(b).map(|(x, y)| u64::from(x.abs_diff(*y))).sum();
    Ok(total as f64 / a.len() as f64)
}
