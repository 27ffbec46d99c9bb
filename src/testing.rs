//! Deterministic stand-ins for the sampler and embedding model.

use anyhow::{anyhow, Result};
use image::{Rgb, RgbImage};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};

use crate::db::{SqliteStore, VectorStore};
use crate::embedding::{Embedding, EmbeddingProvider};
use crate::frames::{keep_frame, sampling_interval, FrameSampler, FrameStream, SampledFrame};

pub const RED: [u8; 3] = [255, 0, 0];
pub const GREEN: [u8; 3] = [0, 255, 0];
pub const BLUE: [u8; 3] = [0, 0, 255];

/// Yields one solid-colour frame per source frame, sampled like a real decoder
pub struct FakeSampler {
    pub source_fps: f64,
    pub colors: Vec<[u8; 3]>,
}

impl FakeSampler {
    pub fn new(source_fps: f64, colors: Vec<[u8; 3]>) -> Self {
        Self { source_fps, colors }
    }

    /// `seconds` of video at `source_fps` cycling through `palette`
    pub fn cycling(source_fps: f64, seconds: usize, palette: &[[u8; 3]]) -> Self {
        let total = (source_fps as usize) * seconds;
        let colors = (0..total).map(|i| palette[i % palette.len()]).collect();
        Self::new(source_fps, colors)
    }
}

impl FrameSampler for FakeSampler {
    fn sample<'a>(&'a self, _video: &Path, target_rate_hz: f64) -> Result<FrameStream<'a>> {
        let interval = sampling_interval(self.source_fps, target_rate_hz);
        let fps = self.source_fps;
        Ok(Box::new(
            self.colors
                .iter()
                .enumerate()
                .filter(move |(i, _)| keep_frame(*i as u64, interval))
                .map(move |(i, color)| {
                    Ok(SampledFrame::new(i as u64, fps, RgbImage::from_pixel(2, 2, Rgb(*color))))
                }),
        ))
    }
}

/// Holds every `sample` call until the paired sender fires or is dropped
pub struct GatedSampler {
    inner: FakeSampler,
    gate: Mutex<mpsc::Receiver<()>>,
}

impl GatedSampler {
    pub fn new(inner: FakeSampler) -> (Self, mpsc::Sender<()>) {
        let (tx, rx) = mpsc::channel();
        (
            Self {
                inner,
                gate: Mutex::new(rx),
            },
            tx,
        )
    }
}

impl FrameSampler for GatedSampler {
    fn sample<'a>(&'a self, video: &Path, target_rate_hz: f64) -> Result<FrameStream<'a>> {
        if let Ok(gate) = self.gate.lock() {
            let _ = gate.recv();
        }
        self.inner.sample(video, target_rate_hz)
    }
}

/// Embeds images by mean colour and text by colour words.
///
/// Optionally fails on the n-th image call to simulate a provider outage.
#[derive(Default)]
pub struct FakeEmbedder {
    pub fail_on_image: Option<usize>,
    image_calls: AtomicUsize,
}

impl FakeEmbedder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_on(call: usize) -> Self {
        Self {
            fail_on_image: Some(call),
            image_calls: AtomicUsize::new(0),
        }
    }

    pub fn image_calls(&self) -> usize {
        self.image_calls.load(Ordering::SeqCst)
    }
}

impl EmbeddingProvider for FakeEmbedder {
    fn embed_text(&self, text: &str) -> Result<Embedding> {
        let text = text.to_lowercase();
        let vector = if text.contains("red") {
            vec![1.0, 0.05, 0.05]
        } else if text.contains("green") {
            vec![0.05, 1.0, 0.05]
        } else if text.contains("blue") {
            vec![0.05, 0.05, 1.0]
        } else {
            vec![-1.0, -1.0, -1.0]
        };
        // Deliberately unnormalized: callers normalize
        Ok(vector.into_iter().map(|v| v * 3.0).collect())
    }

    fn embed_image(&self, image: &RgbImage) -> Result<Embedding> {
        let call = self.image_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_on_image == Some(call) {
            return Err(anyhow!("embedding service unavailable"));
        }

        let mut sums = [0.0f32; 3];
        for pixel in image.pixels() {
            for (channel, sum) in sums.iter_mut().enumerate() {
                *sum += pixel[channel] as f32;
            }
        }
        Ok(sums.to_vec())
    }

    fn model_name(&self) -> &str {
        "fake-colour"
    }
}

pub fn memory_store() -> Arc<SqliteStore> {
    let store = SqliteStore::open_in_memory().expect("in-memory store");
    store.initialize().expect("schema");
    Arc::new(store)
}

pub fn as_vector_store(store: &Arc<SqliteStore>) -> Arc<dyn VectorStore> {
    store.clone()
}
