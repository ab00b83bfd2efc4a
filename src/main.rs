//! Portrait animation and lip-sync command line tool.

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use log::info;
use opencv::{
    core::{Mat, Size},
    imgcodecs, imgproc,
    prelude::*,
    videoio::{self, VideoCapture, VideoWriter, CAP_PROP_FPS},
};
use portrait_sync::{
    audio::{read_wav, AudioFeatureExtractor},
    config::{Config, EXAMPLE_CONFIG},
    face_analysis::FaceAnalysis,
    runtime::{ModelKind, ModelStore, OrtBackend},
    stream::{spawn_animation, spawn_lipsync, LipSyncGenerator, OutputQueue, PortraitAnimator},
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (YAML format)
    #[arg(short = 'C', long, global = true)]
    config: Option<PathBuf>,

    /// Model directory, overriding the configuration
    #[arg(short, long, global = true)]
    models: Option<PathBuf>,

    /// Enable debug output
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Animate a portrait with the motion of a driving video
    Animate {
        /// Source portrait image
        #[arg(short, long)]
        source: PathBuf,

        /// Driving video or image
        #[arg(short = 'i', long)]
        driving: PathBuf,

        /// Output video file
        #[arg(short, long, default_value = "animation.mp4")]
        output: PathBuf,
    },

    /// Re-render an avatar's mouth to match speech audio
    Lipsync {
        /// Avatar video or image
        #[arg(short = 'i', long)]
        avatar: PathBuf,

        /// Speech audio (WAVE, 16-bit PCM or 32-bit float)
        #[arg(short, long)]
        audio: PathBuf,

        /// Output video file
        #[arg(short, long, default_value = "lipsync.mp4")]
        output: PathBuf,
    },

    /// Write an example configuration file
    InitConfig {
        /// Destination path
        #[arg(default_value = "portrait-sync.yaml")]
        path: PathBuf,
    },
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| matches!(e.to_ascii_lowercase().as_str(), "png" | "jpg" | "jpeg" | "bmp" | "webp"))
}

fn bgr_to_rgb(bgr: &Mat) -> Result<Mat> {
    let mut rgb = Mat::default();
    imgproc::cvt_color_def(bgr, &mut rgb, imgproc::COLOR_BGR2RGB)?;
    Ok(rgb)
}

fn read_image(path: &Path) -> Result<Mat> {
    let name = path.to_str().context("Non UTF-8 path")?;
    let bgr = imgcodecs::imread(name, imgcodecs::IMREAD_COLOR)?;
    if bgr.empty() {
        bail!("Failed to read image {}", path.display());
    }
    bgr_to_rgb(&bgr)
}

fn open_video(path: &Path) -> Result<(VideoCapture, f64)> {
    let name = path.to_str().context("Non UTF-8 path")?;
    let cap = VideoCapture::from_file(name, videoio::CAP_ANY)?;
    if !cap.is_opened()? {
        bail!("Failed to open video {}", path.display());
    }
    let fps = cap.get(CAP_PROP_FPS)?;
    Ok((cap, fps))
}

/// Decoded RGB frames of a video, read lazily
struct VideoFrames {
    cap: VideoCapture,
    read: usize,
}

impl Iterator for VideoFrames {
    type Item = Mat;

    fn next(&mut self) -> Option<Mat> {
        let mut frame = Mat::default();
        match self.cap.read(&mut frame) {
            Ok(true) if !frame.empty() => match bgr_to_rgb(&frame) {
                Ok(rgb) => {
                    self.read += 1;
                    Some(rgb)
                }
                Err(e) => {
                    log::warn!("Stopping after {} frames: {e:#}", self.read);
                    None
                }
            },
            Ok(_) => None,
            Err(e) => {
                log::warn!("Stopping after {} frames: {e}", self.read);
                None
            }
        }
    }
}

/// All frames of a video (or the single frame of an image) and its frame rate
fn read_frames(path: &Path) -> Result<(Vec<Mat>, f64)> {
    if is_image(path) {
        return Ok((vec![read_image(path)?], 0.0));
    }
    let (cap, fps) = open_video(path)?;
    let frames: Vec<Mat> = VideoFrames { cap, read: 0 }.collect();
    info!("Read {} frames from {} ({fps:.1} fps)", frames.len(), path.display());
    Ok((frames, fps))
}

/// Hand every queued frame to `sink`, cancelling the producer if the sink fails
fn drain_frames<F>(queue: &OutputQueue, mut sink: F) -> Result<usize>
where
    F: FnMut(&Mat) -> Result<()>,
{
    let mut written = 0;
    for frame in queue.iter() {
        if let Err(e) = sink(&frame) {
            queue.cancel();
            return Err(e);
        }
        written += 1;
        let total = queue.total_expected();
        if total > 0 && written % 25 == 0 {
            info!("{written}/{total} frames written");
        }
    }
    Ok(written)
}

/// Drain `queue` into a video file, then surface any worker failure
fn write_video<T>(queue: &OutputQueue, worker: JoinHandle<T>, output: &Path, fps: f64) -> Result<usize> {
    let name = output.to_str().context("Non UTF-8 path")?;
    let fourcc = VideoWriter::fourcc('m', 'p', '4', 'v')?;
    let mut writer: Option<VideoWriter> = None;

    let written = drain_frames(queue, |frame| {
        if writer.is_none() {
            let size = Size::new(frame.cols(), frame.rows());
            let opened = VideoWriter::new(name, fourcc, fps, size, true)?;
            if !opened.is_opened()? {
                bail!("Failed to open {} for writing", output.display());
            }
            writer = Some(opened);
        }
        let mut bgr = Mat::default();
        imgproc::cvt_color_def(frame, &mut bgr, imgproc::COLOR_RGB2BGR)?;
        if let Some(w) = writer.as_mut() {
            w.write(&bgr)?;
        }
        Ok(())
    });
    worker.join().map_err(|_| anyhow!("Worker thread panicked"))?;
    let written = written?;

    if let Some(e) = queue.take_error() {
        return Err(e.into());
    }
    if let Some(mut w) = writer {
        w.release()?;
    }
    Ok(written)
}

fn load_config(args: &Args) -> Result<Config> {
    let mut config = match &args.config {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            Config::from_file(path).with_context(|| format!("Failed to load {}", path.display()))?
        }
        None => Config::default(),
    };
    if let Some(models) = &args.models {
        config.models.root.clone_from(models);
    }
    config.validate()?;
    Ok(config)
}

fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Initialize logger
    if args.debug {
        env_logger::init_from_env(env_logger::Env::new().default_filter_or("debug"));
    } else {
        env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));
    }
    log::debug!("portrait-sync {} ({})", env!("CARGO_PKG_VERSION"), env!("BUILD_TARGET"));

    if let Command::InitConfig { path } = &args.command {
        std::fs::write(path, EXAMPLE_CONFIG)?;
        info!("Example configuration written to {}", path.display());
        return Ok(());
    }

    let config = load_config(&args)?;
    let backend = Arc::new(OrtBackend::new(
        ModelStore::new(&config.models.root),
        config.runtime.intra_threads,
    )?);
    let factory = config.model_factory(backend);
    let analysis = Arc::new(FaceAnalysis::from_factory(&factory, &config.detection_settings())?);

    match args.command {
        Command::Animate { source, driving, output } => {
            let source = read_image(&source)?;

            let mut animator = PortraitAnimator::from_factory(&factory, analysis, config.animation_settings())?;
            if let Some(template) = &config.models.mask_template {
                let name = template.to_str().context("Non UTF-8 path")?;
                let mask = imgcodecs::imread(name, imgcodecs::IMREAD_GRAYSCALE)?;
                animator = animator.with_mask_template(mask)?;
            }
            animator.setup(&source)?;

            let (queue, worker, fps) = if is_image(&driving) {
                let (queue, worker) = spawn_animation(animator, vec![read_image(&driving)?])?;
                (queue, worker, f64::from(config.lipsync.fps))
            } else {
                let (cap, fps) = open_video(&driving)?;
                let fps = if fps > 0.0 { fps } else { f64::from(config.lipsync.fps) };
                let (queue, worker) = spawn_animation(animator, VideoFrames { cap, read: 0 })?;
                (queue, worker, fps)
            };
            let written = write_video(&queue, worker, &output, fps)?;
            if written == 0 {
                bail!("Driving input {} has no frames", driving.display());
            }
            info!("Wrote {written} frames to {}", output.display());
        }
        Command::Lipsync { avatar, audio, output } => {
            let (frames, _) = read_frames(&avatar)?;
            let (samples, rate) = read_wav(&audio)?;

            let mut extractor =
                AudioFeatureExtractor::new(factory.create(ModelKind::AudioEncoder)?, config.chunk_layout());
            let features = extractor.extract(&samples, rate)?;

            let mut generator = LipSyncGenerator::from_factory(&factory, analysis, config.lipsync_settings())?;
            generator.prepare_avatar(&frames)?;

            let (queue, worker) = spawn_lipsync(generator, features)?;
            let written = write_video(&queue, worker, &output, f64::from(config.lipsync.fps))?;
            info!("Wrote {written} frames to {}", output.display());
        }
        Command::InitConfig { .. } => {}
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use portrait_sync::utils::image_conversion::solid_frame;

    #[test]
    fn test_failed_sink_cancels_the_producer() {
        let queue = OutputQueue::new();
        for _ in 0..3 {
            queue.push(solid_frame(4, 4, [1, 2, 3]).unwrap()).unwrap();
        }
        let result = drain_frames(&queue, |_| bail!("disk full"));
        assert!(result.is_err());
        assert!(queue.is_cancelled());
    }

    #[test]
    fn test_drain_counts_every_frame() {
        let queue = OutputQueue::new();
        queue.set_total_expected(2);
        queue.push(solid_frame(4, 4, [0, 0, 0]).unwrap()).unwrap();
        queue.push(solid_frame(4, 4, [0, 0, 0]).unwrap()).unwrap();
        queue.finish();
        let mut seen = 0;
        assert_eq!(drain_frames(&queue, |_| {
            seen += 1;
            Ok(())
        })
        .unwrap(), 2);
        assert_eq!(seen, 2);
        assert!(!queue.is_cancelled());
    }
}
