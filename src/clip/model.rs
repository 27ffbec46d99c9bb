//! CLIP model implementation using ONNX Runtime

use anyhow::{anyhow, Result};
use image::imageops::FilterType;
use image::RgbImage;
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Tensor;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};
use tokenizers::Tokenizer;

use crate::config::ModelConfig;
use crate::embedding::{Embedding, EmbeddingProvider};

/// CLIP input resolution
const INPUT_SIZE: u32 = 224;

/// CLIP text context length
const CONTEXT_LENGTH: usize = 77;

/// `<|endoftext|>`, also used for padding
const EOT_TOKEN: i64 = 49407;

// CLIP normalization constants
const CLIP_MEAN: [f32; 3] = [0.48145466, 0.4578275, 0.40821073];
const CLIP_STD: [f32; 3] = [0.26862954, 0.26130258, 0.27577711];

/// CLIP ViT-B/32 visual and text encoders.
///
/// Encoders and tokenizer are loaded on first use and owned by the instance;
/// share one `ClipModel` behind an `Arc` instead of loading it twice.
pub struct ClipModel {
    config: ModelConfig,
    visual: OnceLock<Mutex<Session>>,
    text: OnceLock<Mutex<Session>>,
    tokenizer: OnceLock<Tokenizer>,
}

impl ClipModel {
    pub fn new(config: ModelConfig) -> Self {
        Self {
            config,
            visual: OnceLock::new(),
            text: OnceLock::new(),
            tokenizer: OnceLock::new(),
        }
    }

    /// Load the text encoder and tokenizer up front (downloads if needed),
    /// so the first query is not charged for it
    pub fn init_text(&self) -> Result<()> {
        self.text_session()?;
        self.tokenizer()?;
        Ok(())
    }

    fn visual_session(&self) -> Result<&Mutex<Session>> {
        if let Some(session) = self.visual.get() {
            return Ok(session);
        }
        let path = self.ensure_model("clip-vit-b32-vision.onnx", &self.config.visual_url)?;
        let session = self.load_session(&path)?;
        Ok(self.visual.get_or_init(|| Mutex::new(session)))
    }

    fn text_session(&self) -> Result<&Mutex<Session>> {
        if let Some(session) = self.text.get() {
            return Ok(session);
        }
        let path = self.ensure_model("clip-vit-b32-text.onnx", &self.config.text_url)?;
        let session = self.load_session(&path)?;
        Ok(self.text.get_or_init(|| Mutex::new(session)))
    }

    fn tokenizer(&self) -> Result<&Tokenizer> {
        if let Some(tokenizer) = self.tokenizer.get() {
            return Ok(tokenizer);
        }
        let path = self.ensure_model("clip-tokenizer.json", &self.config.tokenizer_url)?;
        let tokenizer = Tokenizer::from_file(&path)
            .map_err(|e| anyhow!("Failed to load tokenizer {}: {}", path.display(), e))?;
        Ok(self.tokenizer.get_or_init(|| tokenizer))
    }

    fn load_session(&self, path: &Path) -> Result<Session> {
        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(self.config.intra_threads)?
            .commit_from_file(path)?;
        Ok(session)
    }

    /// Download a model file if it doesn't exist
    fn ensure_model(&self, filename: &str, url: &str) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.config.dir)?;
        let model_path = self.config.dir.join(filename);

        if !model_path.exists() {
            tracing::info!(model = %filename, "Downloading CLIP model...");
            let response = ureq::get(url)
                .call()
                .map_err(|e| anyhow!("Failed to download model: {}", e))?;

            // Write to a side file so an interrupted download is never mistaken for a model
            let partial = model_path.with_extension("part");
            let mut file = std::fs::File::create(&partial)?;
            std::io::copy(&mut response.into_reader(), &mut file)?;
            std::fs::rename(&partial, &model_path)?;
            tracing::info!(model = %filename, path = ?model_path, "CLIP model downloaded");
        }

        Ok(model_path)
    }
}

impl EmbeddingProvider for ClipModel {
    fn embed_text(&self, text: &str) -> Result<Embedding> {
        let (input_ids, attention_mask) = tokenize(self.tokenizer()?, text)?;

        let ids_tensor = Tensor::from_array(([1usize, CONTEXT_LENGTH], input_ids.into_boxed_slice()))?;
        let mask_tensor =
            Tensor::from_array(([1usize, CONTEXT_LENGTH], attention_mask.into_boxed_slice()))?;

        let mut session = self
            .text_session()?
            .lock()
            .map_err(|e| anyhow!("Failed to lock text model: {}", e))?;

        let outputs = session.run(ort::inputs![
            "input_ids" => ids_tensor,
            "attention_mask" => mask_tensor
        ])?;
        // First 2-D output is the projected [1, d] embedding; skip per-token states
        for (_name, value) in outputs.iter() {
            let (shape, data) = value.try_extract_tensor::<f32>()?;
            if shape.len() == 2 {
                return Ok(data.to_vec());
            }
        }
        Err(anyhow!("No embedding output"))
    }

    fn embed_image(&self, image: &RgbImage) -> Result<Embedding> {
        let input_data = preprocess(image);
        let input_tensor = Tensor::from_array((
            [1usize, 3, INPUT_SIZE as usize, INPUT_SIZE as usize],
            input_data.into_boxed_slice(),
        ))?;

        let mut session = self
            .visual_session()?
            .lock()
            .map_err(|e| anyhow!("Failed to lock visual model: {}", e))?;

        let outputs = session.run(ort::inputs!["pixel_values" => input_tensor])?;
        // First 2-D output is the projected [1, d] embedding; skip per-token states
        for (_name, value) in outputs.iter() {
            let (shape, data) = value.try_extract_tensor::<f32>()?;
            if shape.len() == 2 {
                return Ok(data.to_vec());
            }
        }
        Err(anyhow!("No embedding output"))
    }

    fn model_name(&self) -> &str {
        super::MODEL_NAME
    }
}

/// Resize to 224x224 and normalize into an NCHW buffer
fn preprocess(image: &RgbImage) -> Vec<f32> {
    let resized = image::imageops::resize(image, INPUT_SIZE, INPUT_SIZE, FilterType::Triangle);
    let plane = (INPUT_SIZE * INPUT_SIZE) as usize;
    let mut input_data = vec![0.0f32; 3 * plane];

    for (idx, pixel) in resized.pixels().enumerate() {
        for channel in 0..3 {
            input_data[channel * plane + idx] =
                ((pixel[channel] as f32 / 255.0) - CLIP_MEAN[channel]) / CLIP_STD[channel];
        }
    }

    input_data
}

/// BPE-encode `text` into fixed-length ids and attention mask
fn tokenize(tokenizer: &Tokenizer, text: &str) -> Result<(Vec<i64>, Vec<i64>)> {
    let encoding = tokenizer
        .encode(text, true)
        .map_err(|e| anyhow!("Failed to tokenize query: {}", e))?;

    let mut ids: Vec<i64> = encoding.get_ids().iter().map(|&id| id as i64).collect();
    if ids.len() > CONTEXT_LENGTH {
        ids.truncate(CONTEXT_LENGTH);
        ids[CONTEXT_LENGTH - 1] = EOT_TOKEN;
    }

    Ok(pad_tokens(ids))
}

fn pad_tokens(mut ids: Vec<i64>) -> (Vec<i64>, Vec<i64>) {
    let mut mask = vec![1i64; ids.len()];
    ids.resize(CONTEXT_LENGTH, EOT_TOKEN);
    mask.resize(CONTEXT_LENGTH, 0);
    (ids, mask)
}
