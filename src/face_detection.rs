use crate::constants::{
    DETECTOR_INPUT_SIZE, IMAGE_NORMALIZATION_OFFSET, IMAGE_NORMALIZATION_SCALE, NUM_DETECTOR_KEYPOINTS,
};
use crate::geometry::{pad_to_canvas, resize_frame, FaceBox, Interpolation};
use crate::runtime::{BufferPool, SharedModel};
use crate::utils::image_conversion::{frame_to_nchw_into, validate_frame, Normalization};
use crate::utils::safe_cast::i32_to_usize;
use crate::{Error, Result};
use ndarray::{Array2, ArrayD};
use opencv::core::{Mat, Point2f};
use opencv::prelude::*;
use std::collections::HashMap;

/// A decoded detector output that survived the score threshold
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionCandidate {
    /// Bounding box in original image coordinates
    pub bbox: FaceBox,
    /// Confidence score
    pub score: f32,
    /// Eyes, nose tip and mouth corners, when the model predicts them
    pub keypoints: Option<[Point2f; NUM_DETECTOR_KEYPOINTS]>,
}

/// Where each output group starts, derived from the model's output count
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLayout {
    /// Feature strides, one output per stride per group
    pub strides: Vec<usize>,
    /// Anchors per feature-map cell
    pub num_anchors: usize,
    /// Distance between the score, box and keypoint groups
    pub offset: usize,
    /// Whether keypoint outputs are present
    pub with_kps: bool,
}

impl OutputLayout {
    /// Layout for a model with `count` outputs
    ///
    /// # Errors
    ///
    /// Returns `ModelOutputError` for counts other than 6, 9, 10 or 15
    pub fn from_output_count(count: usize) -> Result<Self> {
        let (offset, strides, num_anchors, with_kps) = match count {
            6 => (3, vec![8, 16, 32], 2, false),
            9 => (3, vec![8, 16, 32], 2, true),
            10 => (5, vec![8, 16, 32, 64, 128], 1, false),
            15 => (5, vec![8, 16, 32, 64, 128], 1, true),
            n => {
                return Err(Error::ModelOutputError(format!(
                    "Unsupported detector layout with {n} outputs"
                )))
            }
        };
        Ok(Self {
            strides,
            num_anchors,
            offset,
            with_kps,
        })
    }
}

type AnchorCache = HashMap<(usize, usize, usize), Array2<f32>>;

/// SCRFD face detector
pub struct FaceDetector {
    model: SharedModel,
    input_size: i32,
    score_threshold: f32,
    nms_threshold: f32,
    pool: BufferPool,
    anchor_cache: AnchorCache,
}

impl FaceDetector {
    /// Wrap a detector model with the given thresholds
    #[must_use]
    pub fn new(model: SharedModel, score_threshold: f32, nms_threshold: f32) -> Self {
        log::info!(
            "Initializing FaceDetector with model '{}' (score >= {score_threshold}, nms {nms_threshold})",
            model.lock().name()
        );
        Self {
            model,
            input_size: DETECTOR_INPUT_SIZE,
            score_threshold,
            nms_threshold,
            pool: BufferPool::new(),
            anchor_cache: HashMap::new(),
        }
    }

    /// Override the square canvas size fed to the model
    #[must_use]
    pub fn with_input_size(mut self, input_size: i32) -> Self {
        self.input_size = input_size;
        self
    }

    /// The wrapped model
    #[must_use]
    pub fn model(&self) -> &SharedModel {
        &self.model
    }

    /// Detect faces, sorted by box area with the largest first.
    ///
    /// # Errors
    ///
    /// Returns an error for invalid frames, model failures, unexpected output
    /// shapes or a kept box with non-positive extent
    pub fn detect(&mut self, frame: &Mat) -> Result<Vec<DetectionCandidate>> {
        validate_frame(frame)?;
        let (canvas, det_scale) = self.letterbox(frame)?;

        let side = i32_to_usize(self.input_size)?;
        let tensor = self.pool.nchw(0, [1, 3, side, side]);
        frame_to_nchw_into(
            &canvas,
            &Normalization::centered(IMAGE_NORMALIZATION_OFFSET, IMAGE_NORMALIZATION_SCALE),
            tensor,
        )?;

        let candidates = {
            let mut model = self.model.lock();
            let outputs = model.run(&[tensor.view().into_dyn()])?;
            let layout = OutputLayout::from_output_count(outputs.len())?;
            let decoded = decode_outputs(
                &layout,
                outputs,
                side,
                det_scale,
                self.score_threshold,
                &mut self.anchor_cache,
            );
            self.anchor_cache.clear();
            decoded?
        };

        let mut kept = non_max_suppression(candidates, self.nms_threshold);
        for candidate in &kept {
            candidate.bbox.validate()?;
        }
        kept.sort_by(|a, b| b.bbox.area().total_cmp(&a.bbox.area()));

        log::debug!("Detected {} face(s)", kept.len());
        Ok(kept)
    }

    /// Resize so the longer side matches the canvas and pad bottom/right with black
    fn letterbox(&self, frame: &Mat) -> Result<(Mat, f32)> {
        let (new_width, new_height, det_scale) = letterbox_size(frame.cols(), frame.rows(), self.input_size);
        let resized = resize_frame(frame, new_width, new_height, Interpolation::Bilinear)?;
        Ok((pad_to_canvas(&resized, self.input_size)?, det_scale))
    }
}

/// Resized width and height for a `size` canvas, plus the resize ratio
/// applied to the longer side
#[allow(clippy::cast_possible_truncation)]
fn letterbox_size(width: i32, height: i32, size: i32) -> (i32, i32, f32) {
    let det_scale = size as f32 / width.max(height) as f32;
    if height > width {
        (((width as f32 * det_scale) as i32).max(1), size, det_scale)
    } else {
        (size, ((height as f32 * det_scale) as i32).max(1), det_scale)
    }
}

/// Anchor centres for one stride, `num_anchors` consecutive copies per cell
fn anchor_centers(height: usize, width: usize, stride: usize, num_anchors: usize) -> Array2<f32> {
    let mut centers = Array2::zeros((height * width * num_anchors, 2));
    let mut row = 0;
    for y in 0..height {
        for x in 0..width {
            for _ in 0..num_anchors {
                centers[[row, 0]] = (x * stride) as f32;
                centers[[row, 1]] = (y * stride) as f32;
                row += 1;
            }
        }
    }
    centers
}

fn flat_output<'a>(outputs: &'a [ArrayD<f32>], index: usize, expected: usize, what: &str) -> Result<&'a [f32]> {
    let output = outputs
        .get(index)
        .ok_or_else(|| Error::ModelOutputError(format!("Missing {what} output {index}")))?;
    let data = output
        .as_slice()
        .ok_or_else(|| Error::ModelDataFormatError(format!("{what} output {index} is not contiguous")))?;
    if data.len() != expected {
        return Err(Error::ModelOutputError(format!(
            "{what} output {index} has {} values, expected {expected}",
            data.len()
        )));
    }
    Ok(data)
}

/// Decode every stride into candidates in original image coordinates
fn decode_outputs(
    layout: &OutputLayout,
    outputs: &[ArrayD<f32>],
    canvas: usize,
    det_scale: f32,
    threshold: f32,
    cache: &mut AnchorCache,
) -> Result<Vec<DetectionCandidate>> {
    let mut candidates = Vec::new();

    for (idx, &stride) in layout.strides.iter().enumerate() {
        // the grid covers the padded canvas, matching the model's output length
        let height = canvas / stride;
        let width = canvas / stride;
        let count = height * width * layout.num_anchors;

        let scores = flat_output(outputs, idx, count, "score")?;
        let boxes = flat_output(outputs, idx + layout.offset, count * 4, "box")?;
        let kps = if layout.with_kps {
            Some(flat_output(
                outputs,
                idx + layout.offset * 2,
                count * NUM_DETECTOR_KEYPOINTS * 2,
                "keypoint",
            )?)
        } else {
            None
        };

        let centers = cache
            .entry((height, width, stride))
            .or_insert_with(|| anchor_centers(height, width, stride, layout.num_anchors));

        let s = stride as f32;
        for (i, &score) in scores.iter().enumerate() {
            if score < threshold {
                continue;
            }
            let (cx, cy) = (centers[[i, 0]], centers[[i, 1]]);
            let d = &boxes[i * 4..i * 4 + 4];
            let bbox = FaceBox::new(cx - d[0] * s, cy - d[1] * s, cx + d[2] * s, cy + d[3] * s).scaled(1.0 / det_scale);

            let keypoints = kps.map(|kps| {
                let base = i * NUM_DETECTOR_KEYPOINTS * 2;
                std::array::from_fn(|k| {
                    Point2f::new(
                        (cx + kps[base + k * 2] * s) / det_scale,
                        (cy + kps[base + k * 2 + 1] * s) / det_scale,
                    )
                })
            });

            candidates.push(DetectionCandidate { bbox, score, keypoints });
        }
    }

    Ok(candidates)
}

/// Greedy NMS: highest score first, dropping any later candidate whose IoU
/// with an already kept one reaches `threshold`
#[must_use]
pub fn non_max_suppression(mut candidates: Vec<DetectionCandidate>, threshold: f32) -> Vec<DetectionCandidate> {
    candidates.sort_by(|a, b| b.score.total_cmp(&a.score));
    let mut kept: Vec<DetectionCandidate> = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        if kept.iter().all(|k| k.bbox.iou(&candidate.bbox) < threshold) {
            kept.push(candidate);
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(x1: f32, y1: f32, x2: f32, y2: f32, score: f32) -> DetectionCandidate {
        DetectionCandidate {
            bbox: FaceBox::new(x1, y1, x2, y2),
            score,
            keypoints: None,
        }
    }

    #[test]
    fn test_layout_from_output_count() {
        let layout = OutputLayout::from_output_count(9).unwrap();
        assert_eq!(layout.strides, vec![8, 16, 32]);
        assert_eq!(layout.num_anchors, 2);
        assert!(layout.with_kps);
        let layout = OutputLayout::from_output_count(10).unwrap();
        assert_eq!(layout.offset, 5);
        assert!(!layout.with_kps);
        assert!(OutputLayout::from_output_count(7).is_err());
    }

    #[test]
    fn test_anchor_centers_repeat_per_cell() {
        let centers = anchor_centers(2, 3, 8, 2);
        assert_eq!(centers.shape(), &[12, 2]);
        assert_eq!(centers.row(0).to_vec(), vec![0.0, 0.0]);
        assert_eq!(centers.row(1).to_vec(), vec![0.0, 0.0]);
        assert_eq!(centers.row(2).to_vec(), vec![8.0, 0.0]);
        assert_eq!(centers.row(6).to_vec(), vec![0.0, 8.0]);
    }

    #[test]
    fn test_letterbox_scale_follows_longer_side() {
        assert_eq!(letterbox_size(640, 480, 512), (512, 384, 0.8));
        assert_eq!(letterbox_size(480, 640, 512), (384, 512, 0.8));

        // the clamped side must not leak into the rescale factor
        let (w, h, scale) = letterbox_size(2000, 1, 512);
        assert_eq!((w, h), (512, 1));
        assert!((scale - 512.0 / 2000.0).abs() < 1e-7);
        let (w, h, scale) = letterbox_size(1, 2000, 512);
        assert_eq!((w, h), (1, 512));
        assert!((scale - 512.0 / 2000.0).abs() < 1e-7);
    }

    #[test]
    fn test_nms_keeps_highest_of_overlapping() {
        let kept = non_max_suppression(
            vec![
                candidate(0.0, 0.0, 10.0, 10.0, 0.7),
                candidate(1.0, 1.0, 11.0, 11.0, 0.9),
                candidate(50.0, 50.0, 60.0, 60.0, 0.6),
            ],
            0.4,
        );
        assert_eq!(kept.len(), 2);
        assert!((kept[0].score - 0.9).abs() < 1e-6);
        assert!((kept[1].score - 0.6).abs() < 1e-6);
    }

    #[test]
    fn test_nms_threshold_matters() {
        let overlapping = vec![
            candidate(0.0, 0.0, 10.0, 10.0, 0.9),
            candidate(2.0, 0.0, 12.0, 10.0, 0.8),
            candidate(4.0, 0.0, 14.0, 10.0, 0.7),
        ];
        let strict = non_max_suppression(overlapping.clone(), 0.4);
        let unbounded = non_max_suppression(overlapping, f32::INFINITY);
        assert!(unbounded.len() > strict.len());
        for (i, a) in strict.iter().enumerate() {
            for b in &strict[i + 1..] {
                assert!(a.bbox.iou(&b.bbox) < 0.4);
            }
        }
    }

    #[test]
    fn test_decode_single_anchor() {
        let layout = OutputLayout::from_output_count(9).unwrap();
        let canvas = 64;
        let mut outputs = Vec::new();
        for &stride in &layout.strides {
            let n = (canvas / stride) * (canvas / stride) * 2;
            outputs.push(ArrayD::zeros(ndarray::IxDyn(&[n, 1])));
        }
        for &stride in &layout.strides {
            let n = (canvas / stride) * (canvas / stride) * 2;
            outputs.push(ArrayD::zeros(ndarray::IxDyn(&[n, 4])));
        }
        for &stride in &layout.strides {
            let n = (canvas / stride) * (canvas / stride) * 2;
            outputs.push(ArrayD::zeros(ndarray::IxDyn(&[n, 10])));
        }
        // Cell (x=2, y=1) at stride 8 is anchor row (1 * 8 + 2) * 2
        let row = (8 + 2) * 2;
        outputs[0][[row, 0]] = 0.95;
        for (k, v) in [1.0f32, 1.0, 2.0, 2.0].iter().enumerate() {
            outputs[3][[row, k]] = *v;
        }
        outputs[6][[row, 0]] = 0.5;

        let mut cache = AnchorCache::new();
        let found = decode_outputs(&layout, &outputs, canvas, 0.5, 0.5, &mut cache).unwrap();
        assert_eq!(found.len(), 1);
        // Centre (16, 8), box (8, 0)..(32, 24) on the canvas, doubled back to the image
        assert_eq!(found[0].bbox, FaceBox::new(16.0, 0.0, 64.0, 48.0));
        let kps = found[0].keypoints.unwrap();
        assert!((kps[0].x - 40.0).abs() < 1e-5 && (kps[0].y - 16.0).abs() < 1e-5);
        assert_eq!(cache.len(), 3);
    }
}
