//! Frame sampling.
//!
//! A video is decoded front to back and every `interval`-th source frame is
//! kept, where `interval` is the source frame rate divided by the target
//! sampling rate (2 Hz by default). Kept frames carry a millisecond timestamp
//! which also names them, so names are unique and sort by time.

mod ffmpeg;

use anyhow::Result;
use image::RgbImage;
use std::path::Path;

use crate::embedding::Embedding;

pub use ffmpeg::FfmpegSampler;

/// Default sampling rate in frames per second
pub const DEFAULT_TARGET_RATE_HZ: f64 = 2.0;

/// A decoded frame that survived sampling
#[derive(Debug, Clone)]
pub struct SampledFrame {
    /// Index of the frame in the source stream
    pub index: u64,
    pub timestamp_ms: u64,
    pub image: RgbImage,
}

impl SampledFrame {
    pub fn new(index: u64, source_fps: f64, image: RgbImage) -> Self {
        Self {
            index,
            timestamp_ms: timestamp_ms(index, source_fps),
            image,
        }
    }

    pub fn timestamp_sec(&self) -> f64 {
        self.timestamp_ms as f64 / 1000.0
    }

    pub fn filename(&self) -> String {
        frame_filename(self.timestamp_ms)
    }
}

/// A sampled frame after embedding; what gets written to a collection
#[derive(Debug, Clone)]
pub struct Frame {
    pub timestamp_ms: u64,
    pub embedding: Embedding,
    pub source_filename: String,
}

impl Frame {
    pub fn timestamp_sec(&self) -> f64 {
        self.timestamp_ms as f64 / 1000.0
    }
}

/// Finite, single-pass stream of sampled frames
pub type FrameStream<'a> = Box<dyn Iterator<Item = Result<SampledFrame>> + Send + 'a>;

/// Decodes a video and yields timestamped frames at a target rate
pub trait FrameSampler: Send + Sync {
    fn sample<'a>(&'a self, video: &Path, target_rate_hz: f64) -> Result<FrameStream<'a>>;
}

/// Number of source frames between kept frames: `max(1, round(fps / rate))`.
///
/// Ties round to even. A non-positive or non-finite ratio keeps every frame.
pub fn sampling_interval(source_fps: f64, target_rate_hz: f64) -> u64 {
    let ratio = source_fps / target_rate_hz;
    if !ratio.is_finite() || ratio <= 0.0 {
        return 1;
    }
    (ratio.round_ties_even() as u64).max(1)
}

pub fn keep_frame(index: u64, interval: u64) -> bool {
    index % interval.max(1) == 0
}

/// Timestamp of source frame `index` in whole milliseconds
pub fn timestamp_ms(index: u64, source_fps: f64) -> u64 {
    if !source_fps.is_finite() || source_fps <= 0.0 {
        return 0;
    }
    (index as f64 / source_fps * 1000.0).round() as u64
}

pub fn frame_filename(timestamp_ms: u64) -> String {
    format!("frame_{:08}ms.jpg", timestamp_ms)
}
