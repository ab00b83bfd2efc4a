//! Streaming orchestration: per-frame pipelines feeding an output queue.
//!
//! Each pipeline has a one-time setup (`setup` / `prepare_avatar`), a
//! per-frame step (`process` / `generate_frame`) and a `run` loop that pushes
//! results in input order. The `spawn_*` helpers move a prepared pipeline to a
//! named worker thread and hand back the queue the consumer drains.

/// Portrait animation pipeline
pub mod animation;

/// Audio-driven lip-sync pipeline
pub mod lipsync;

/// Output frame queue
pub mod queue;

pub use animation::{face_mask_template, AnimationSettings, PortraitAnimator, SourceState};
pub use lipsync::{cycle_index, AvatarData, AvatarFrame, LipSyncGenerator, LipSyncSettings};
pub use queue::OutputQueue;

use crate::audio::AudioFeatures;
use crate::{Error, Result};
use opencv::core::Mat;
use std::thread::{self, JoinHandle};

/// Run `job` on a named thread, failing the queue with any error it returns
fn spawn_worker<P, F>(name: &str, pipeline: P, total: Option<usize>, job: F) -> Result<(OutputQueue, JoinHandle<P>)>
where
    P: Send + 'static,
    F: FnOnce(&mut P, &OutputQueue) -> Result<usize> + Send + 'static,
{
    let queue = OutputQueue::new();
    if let Some(total) = total {
        queue.set_total_expected(total);
    }
    let producer = queue.clone();
    let handle = thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            let mut pipeline = pipeline;
            if let Err(e) = job(&mut pipeline, &producer) {
                producer.fail(e);
            }
            pipeline
        })
        .map_err(Error::Io)?;
    Ok((queue, handle))
}

/// Length of `iter` when its size hint is exact
pub(crate) fn exact_len<I: Iterator>(iter: &I) -> Option<usize> {
    match iter.size_hint() {
        (lower, Some(upper)) if lower == upper => Some(lower),
        _ => None,
    }
}

/// Animate `driving` frames on a worker thread.
///
/// The animator must already be set up with a source. The join handle returns
/// it so another sequence can be driven afterwards. When `driving` knows its
/// length, the queue reports it as the expected total before this returns.
///
/// # Errors
///
/// Returns an error if the thread cannot be spawned
pub fn spawn_animation<I>(animator: PortraitAnimator, driving: I) -> Result<(OutputQueue, JoinHandle<PortraitAnimator>)>
where
    I: IntoIterator<Item = Mat>,
    I::IntoIter: Send + 'static,
{
    let driving = driving.into_iter();
    let total = exact_len(&driving);
    spawn_worker("animation", animator, total, move |animator, queue| animator.run(driving, queue))
}

/// Generate lip-synced frames for `features` on a worker thread.
///
/// The generator must already hold a prepared avatar. The queue reports one
/// expected frame per feature chunk before this returns.
///
/// # Errors
///
/// Returns an error if the thread cannot be spawned
pub fn spawn_lipsync(
    generator: LipSyncGenerator,
    features: AudioFeatures,
) -> Result<(OutputQueue, JoinHandle<LipSyncGenerator>)> {
    let total = Some(features.len());
    spawn_worker("lipsync", generator, total, move |generator, queue| generator.run(&features, queue))
}
