//! Frame sampler backed by the `ffmpeg` and `ffprobe` executables.

use anyhow::{anyhow, Context, Result};
use image::RgbImage;
use serde::Deserialize;
use std::io::{BufReader, Read};
use std::path::Path;
use std::process::{Child, ChildStderr, ChildStdout, Command, Stdio};
use std::thread::JoinHandle;

use super::{keep_frame, sampling_interval, FrameSampler, FrameStream, SampledFrame};
use crate::config::SamplerConfig;

/// Bytes of ffmpeg's stderr kept for error reports
const STDERR_TAIL_BYTES: usize = 16 * 1024;

pub struct FfmpegSampler {
    ffmpeg_path: String,
    ffprobe_path: String,
    frame_size: u32,
}

impl FfmpegSampler {
    pub fn new(config: &SamplerConfig) -> Self {
        Self {
            ffmpeg_path: config.ffmpeg_path.clone(),
            ffprobe_path: config.ffprobe_path.clone(),
            frame_size: config.frame_size.max(1),
        }
    }

    /// Average frame rate of the first video stream
    fn probe_frame_rate(&self, video: &Path) -> Result<f64> {
        let output = Command::new(&self.ffprobe_path)
            .args(["-v", "error", "-select_streams", "v:0"])
            .args(["-show_entries", "stream=avg_frame_rate,r_frame_rate"])
            .args(["-of", "json"])
            .arg(video)
            .output()
            .with_context(|| format!("Failed to run {}", self.ffprobe_path))?;

        if !output.status.success() {
            return Err(anyhow!(
                "ffprobe failed on {}: {}",
                video.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }

        let probe: ProbeOutput =
            serde_json::from_slice(&output.stdout).context("Failed to parse ffprobe output")?;
        probe_fps(&probe).ok_or_else(|| anyhow!("No video stream with a frame rate in {}", video.display()))
    }
}

impl FrameSampler for FfmpegSampler {
    fn sample<'a>(&'a self, video: &Path, target_rate_hz: f64) -> Result<FrameStream<'a>> {
        let source_fps = self.probe_frame_rate(video)?;
        let interval = sampling_interval(source_fps, target_rate_hz);
        let scale = format!("scale={0}:{0}", self.frame_size);

        tracing::debug!(
            video = %video.display(),
            source_fps,
            interval,
            "Starting frame extraction"
        );

        // Decode every frame; selection happens on source indices below
        let mut child = Command::new(&self.ffmpeg_path)
            .args(["-v", "error", "-nostdin", "-i"])
            .arg(video)
            .args(["-map", "0:v:0", "-an", "-sn", "-vsync", "0"])
            .args(["-vf", &scale])
            .args(["-pix_fmt", "rgb24", "-f", "rawvideo", "pipe:1"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("Failed to run {}", self.ffmpeg_path))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("ffmpeg stdout unavailable"))?;
        // A full stderr pipe would stall the decoder, so read it from the start
        let stderr = child.stderr.take().map(drain_stderr);

        let side = self.frame_size as usize;
        Ok(Box::new(RawFrameStream {
            child,
            stdout: BufReader::new(stdout),
            stderr,
            buffer: vec![0u8; side * side * 3],
            frame_size: self.frame_size,
            source_fps,
            interval,
            index: 0,
            finished: false,
        }))
    }
}

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    avg_frame_rate: Option<String>,
    r_frame_rate: Option<String>,
}

fn probe_fps(probe: &ProbeOutput) -> Option<f64> {
    let stream = probe.streams.first()?;
    stream
        .avg_frame_rate
        .as_deref()
        .and_then(parse_frame_rate)
        .or_else(|| stream.r_frame_rate.as_deref().and_then(parse_frame_rate))
}

/// Parse an ffprobe rate such as `30000/1001` or `25`
fn parse_frame_rate(rate: &str) -> Option<f64> {
    let fps = match rate.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.trim().parse().ok()?;
            let den: f64 = den.trim().parse().ok()?;
            if den == 0.0 {
                return None;
            }
            num / den
        }
        None => rate.trim().parse().ok()?,
    };

    (fps.is_finite() && fps > 0.0).then_some(fps)
}

/// Read `stderr` to EOF on its own thread, keeping only the tail
fn drain_stderr(mut stderr: ChildStderr) -> JoinHandle<String> {
    std::thread::spawn(move || {
        let mut tail: Vec<u8> = Vec::new();
        let mut chunk = [0u8; 8192];
        loop {
            match stderr.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => {
                    tail.extend_from_slice(&chunk[..n]);
                    if tail.len() > STDERR_TAIL_BYTES {
                        let excess = tail.len() - STDERR_TAIL_BYTES;
                        tail.drain(..excess);
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
        String::from_utf8_lossy(&tail).into_owned()
    })
}

/// Raw rgb24 frames read from ffmpeg's stdout, filtered by source index
struct RawFrameStream {
    child: Child,
    stdout: BufReader<ChildStdout>,
    stderr: Option<JoinHandle<String>>,
    buffer: Vec<u8>,
    frame_size: u32,
    source_fps: f64,
    interval: u64,
    index: u64,
    finished: bool,
}

impl RawFrameStream {
    /// Fill the buffer with one frame. Returns false at end of stream.
    fn read_frame(&mut self) -> std::io::Result<bool> {
        let mut filled = 0;
        while filled < self.buffer.len() {
            let n = self.stdout.read(&mut self.buffer[filled..])?;
            if n == 0 {
                if filled > 0 {
                    tracing::debug!(bytes = filled, "Dropping truncated trailing frame");
                }
                return Ok(false);
            }
            filled += n;
        }
        Ok(true)
    }

    /// Collected stderr; the pipe closes once ffmpeg has exited
    fn stderr_tail(&mut self) -> String {
        self.stderr
            .take()
            .and_then(|handle| handle.join().ok())
            .unwrap_or_default()
    }

    fn finish(&mut self) -> Result<()> {
        self.finished = true;
        let status = self.child.wait().context("Failed to wait for ffmpeg")?;
        let stderr = self.stderr_tail();
        if status.success() {
            return Ok(());
        }
        Err(anyhow!("ffmpeg exited with {}: {}", status, stderr.trim()))
    }

    fn abort(&mut self) {
        self.finished = true;
        let _ = self.child.kill();
        let _ = self.child.wait();
        let _ = self.stderr_tail();
    }
}

impl Iterator for RawFrameStream {
    type Item = Result<SampledFrame>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        loop {
            match self.read_frame() {
                Ok(true) => {}
                Ok(false) => return self.finish().err().map(Err),
                Err(e) => {
                    self.abort();
                    return Some(Err(anyhow!("Failed to read decoded frame: {}", e)));
                }
            }

            let index = self.index;
            self.index += 1;
            if !keep_frame(index, self.interval) {
                continue;
            }

            let image = RgbImage::from_raw(self.frame_size, self.frame_size, self.buffer.clone())
                .ok_or_else(|| anyhow!("Decoded frame {} has the wrong size", index));
            return Some(image.map(|img| SampledFrame::new(index, self.source_fps, img)));
        }
    }
}

impl Drop for RawFrameStream {
    fn drop(&mut self) {
        // Stream abandoned early (cancelled or failed build)
        if !self.finished {
            self.abort();
        }
    }
}
