//! Speech features for lip sync.
//!
//! PCM is resampled to 16 kHz, normalised, encoded to 50 Hz feature rows and
//! cut into one overlapping window per output video frame.

use crate::constants::{AUDIO_FEATURE_RATE, AUDIO_SAMPLE_RATE};
use crate::runtime::{ModelRuntime, SharedModel};
use crate::{Error, Result};
use ndarray::{s, Array1, Array2, ArrayView2, Axis, Ix2, Ix3};
use std::path::Path;

/// Linear-interpolation resampling
#[must_use]
pub fn resample_linear(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || samples.is_empty() {
        return samples.to_vec();
    }
    let ratio = f64::from(from_rate) / f64::from(to_rate);
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let out_len = ((samples.len() as f64) / ratio).floor().max(1.0) as usize;
    let last = samples.len() - 1;
    (0..out_len)
        .map(|i| {
            let pos = i as f64 * ratio;
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let idx = (pos.floor() as usize).min(last);
            let next = (idx + 1).min(last);
            let frac = (pos - idx as f64) as f32;
            samples[idx] * (1.0 - frac) + samples[next] * frac
        })
        .collect()
}

/// Zero mean, unit variance
pub fn normalize(samples: &mut [f32]) {
    if samples.is_empty() {
        return;
    }
    let n = samples.len() as f32;
    let mean = samples.iter().sum::<f32>() / n;
    let variance = samples.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / n;
    let std = (variance + 1e-7).sqrt();
    for v in samples.iter_mut() {
        *v = (*v - mean) / std;
    }
}

/// Mono samples and sample rate of a RIFF/WAVE file
///
/// # Errors
///
/// Returns an error if the file cannot be read or is not 16-bit PCM or 32-bit float
pub fn read_wav<P: AsRef<Path>>(path: P) -> Result<(Vec<f32>, u32)> {
    parse_wav(&std::fs::read(path)?)
}

fn le_u16(bytes: &[u8], at: usize) -> Option<u16> {
    bytes.get(at..at + 2).map(|b| u16::from_le_bytes([b[0], b[1]]))
}

fn le_u32(bytes: &[u8], at: usize) -> Option<u32> {
    bytes.get(at..at + 4).map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

/// Decode an in-memory WAVE file, averaging channels to mono
///
/// # Errors
///
/// Returns `InvalidInput` for malformed or unsupported data
pub fn parse_wav(bytes: &[u8]) -> Result<(Vec<f32>, u32)> {
    let malformed = |what: &str| Error::InvalidInput(format!("Invalid WAVE data: {what}"));
    if bytes.get(0..4) != Some(b"RIFF".as_slice()) || bytes.get(8..12) != Some(b"WAVE".as_slice()) {
        return Err(malformed("missing RIFF/WAVE header"));
    }

    let mut format = None;
    let mut data = None;
    let mut offset = 12;
    while offset + 8 <= bytes.len() {
        let id = &bytes[offset..offset + 4];
        let size = le_u32(bytes, offset + 4).ok_or_else(|| malformed("truncated chunk"))? as usize;
        let body = offset + 8;
        let end = body.saturating_add(size).min(bytes.len());
        match id {
            b"fmt " => {
                let tag = le_u16(bytes, body).ok_or_else(|| malformed("short fmt chunk"))?;
                let channels = le_u16(bytes, body + 2).ok_or_else(|| malformed("short fmt chunk"))?;
                let rate = le_u32(bytes, body + 4).ok_or_else(|| malformed("short fmt chunk"))?;
                let bits = le_u16(bytes, body + 14).ok_or_else(|| malformed("short fmt chunk"))?;
                format = Some((tag, channels, rate, bits));
            }
            b"data" => data = Some(&bytes[body..end]),
            _ => {}
        }
        offset = body.saturating_add(size).saturating_add(size & 1);
    }

    let (tag, channels, rate, bits) = format.ok_or_else(|| malformed("no fmt chunk"))?;
    let data = data.ok_or_else(|| malformed("no data chunk"))?;
    if channels == 0 || rate == 0 {
        return Err(malformed("zero channels or sample rate"));
    }

    let interleaved: Vec<f32> = match (tag, bits) {
        (1, 16) => data
            .chunks_exact(2)
            .map(|b| f32::from(i16::from_le_bytes([b[0], b[1]])) / 32768.0)
            .collect(),
        (3, 32) => data
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect(),
        _ => {
            return Err(Error::InvalidInput(format!(
                "Unsupported WAVE encoding: format {tag}, {bits} bits"
            )))
        }
    };

    let channels = usize::from(channels);
    let mono = interleaved
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect();
    Ok((mono, rate))
}

/// Windowing of 50 Hz feature rows into per-frame chunks
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChunkLayout {
    /// Output video frame rate
    pub fps: f32,
    /// Video frames of context before the current one
    pub padding_left: usize,
    /// Video frames of context after the current one
    pub padding_right: usize,
}

impl Default for ChunkLayout {
    fn default() -> Self {
        Self {
            fps: crate::constants::DEFAULT_FPS,
            padding_left: 2,
            padding_right: 2,
        }
    }
}

impl ChunkLayout {
    /// Feature rows per video frame
    #[must_use]
    pub fn multiplier(&self) -> f32 {
        AUDIO_FEATURE_RATE / self.fps
    }

    /// Feature rows in one chunk
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn window(&self) -> usize {
        (self.multiplier() * (self.padding_left + self.padding_right + 1) as f32).round() as usize
    }

    /// Output frames covering `duration` seconds
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn frame_count(&self, duration: f32) -> usize {
        (duration * self.fps).floor().max(0.0) as usize
    }

    /// Cut `features` (`[T, D]`) into `num_frames` windows.
    ///
    /// Rows are zero-padded by `padding_left` frames before and
    /// `padding_right + 1` frames after; chunk `i` starts at `floor(i × multiplier)`.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn chunk(&self, features: ArrayView2<'_, f32>, num_frames: usize) -> Vec<Array2<f32>> {
        let mult = self.multiplier();
        let left = (mult * self.padding_left as f32).round() as usize;
        let right = (mult * (self.padding_right + 1) as f32).round() as usize;
        let (rows, dim) = features.dim();
        let window = self.window();

        let mut padded = Array2::zeros((left + rows + right, dim));
        padded.slice_mut(s![left..left + rows, ..]).assign(&features);

        (0..num_frames)
            .map(|i| {
                let start = (i as f32 * mult).floor() as usize;
                let mut chunk = Array2::zeros((window, dim));
                let end = (start + window).min(padded.nrows());
                if start < end {
                    chunk.slice_mut(s![..end - start, ..]).assign(&padded.slice(s![start..end, ..]));
                }
                chunk
            })
            .collect()
    }
}

/// Per-frame audio feature windows of one utterance
#[derive(Debug, Clone)]
pub struct AudioFeatures {
    /// One `[window, D]` chunk per output frame
    pub chunks: Vec<Array2<f32>>,
    /// Rate the features were computed at
    pub sample_rate: u32,
    /// Length of the input audio in seconds
    pub duration: f32,
}

impl AudioFeatures {
    /// Number of output frames
    #[must_use]
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    /// Whether there are no frames
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}

/// Encoder output as `[T, D]`, accepting a leading batch axis
fn encode(model: &mut ModelRuntime, input: &Array2<f32>) -> Result<Array2<f32>> {
    let outputs = model.run(&[input.view().into_dyn()])?;
    let output = outputs
        .first()
        .ok_or_else(|| Error::ModelOutputError("Audio encoder produced no outputs".to_string()))?;
    let shaped = match output.ndim() {
        2 => output.view().into_dimensionality::<Ix2>().map(|v| v.to_owned()),
        3 => output
            .view()
            .into_dimensionality::<Ix3>()
            .map(|v| v.index_axis(Axis(0), 0).to_owned()),
        _ => {
            return Err(Error::ModelOutputError(format!(
                "Audio encoder output has shape {:?}, expected [T, D]",
                output.shape()
            )))
        }
    };
    shaped.map_err(|e| Error::ModelDataFormatError(format!("Audio encoder output: {e}")))
}

/// Runs the speech encoder and chunks its output
pub struct AudioFeatureExtractor {
    model: SharedModel,
    layout: ChunkLayout,
}

impl AudioFeatureExtractor {
    /// Wrap an audio encoder
    #[must_use]
    pub fn new(model: SharedModel, layout: ChunkLayout) -> Self {
        Self { model, layout }
    }

    /// The wrapped model
    #[must_use]
    pub fn model(&self) -> &SharedModel {
        &self.model
    }

    /// Chunk layout in use
    #[must_use]
    pub fn layout(&self) -> &ChunkLayout {
        &self.layout
    }

    /// Features for mono PCM at `sample_rate`; the encoder runs in its own session
    ///
    /// # Errors
    ///
    /// Returns an error for empty audio, a zero rate or model failures
    pub fn extract(&mut self, samples: &[f32], sample_rate: u32) -> Result<AudioFeatures> {
        if samples.is_empty() || sample_rate == 0 {
            return Err(Error::InvalidInput("Audio is empty".to_string()));
        }
        let duration = samples.len() as f32 / sample_rate as f32;
        let mut resampled = resample_linear(samples, sample_rate, AUDIO_SAMPLE_RATE);
        normalize(&mut resampled);
        let n = resampled.len();
        let input = Array1::from(resampled)
            .into_shape((1, n))
            .map_err(|e| Error::ModelDataFormatError(format!("Failed to shape audio: {e}")))?;

        let features = {
            let mut model = self.model.lock();
            model.start_session()?;
            let features = encode(&mut model, &input);
            model.end_session();
            features?
        };

        let num_frames = self.layout.frame_count(duration);
        log::info!(
            "Audio: {duration:.2}s, {} feature rows, {num_frames} frames",
            features.nrows()
        );
        Ok(AudioFeatures {
            chunks: self.layout.chunk(features.view(), num_frames),
            sample_rate: AUDIO_SAMPLE_RATE,
            duration,
        })
    }
}
