use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    #[serde(default)]
    pub sampler: SamplerConfig,

    #[serde(default)]
    pub search: SearchConfig,

    #[serde(default)]
    pub playback: PlaybackConfig,

    #[serde(default)]
    pub models: ModelConfig,

    #[serde(default)]
    pub timeouts: TimeoutConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplerConfig {
    /// Frames kept per second of video
    #[serde(default = "default_target_rate_hz")]
    pub target_rate_hz: f64,

    /// Decoded frames are scaled to a square of this size
    #[serde(default = "default_frame_size")]
    pub frame_size: u32,

    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: String,

    #[serde(default = "default_ffprobe_path")]
    pub ffprobe_path: String,
}

fn default_target_rate_hz() -> f64 {
    crate::frames::DEFAULT_TARGET_RATE_HZ
}

fn default_frame_size() -> u32 {
    224 // CLIP input resolution
}

fn default_ffmpeg_path() -> String {
    "ffmpeg".to_string()
}

fn default_ffprobe_path() -> String {
    "ffprobe".to_string()
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            target_rate_hz: default_target_rate_hz(),
            frame_size: default_frame_size(),
            ffmpeg_path: default_ffmpeg_path(),
            ffprobe_path: default_ffprobe_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,

    /// Matches below this cosine similarity are treated as noise
    #[serde(default = "default_min_similarity")]
    pub min_similarity: f32,
}

fn default_top_k() -> usize {
    crate::search::DEFAULT_TOP_K
}

fn default_min_similarity() -> f32 {
    crate::search::DEFAULT_MIN_SIMILARITY
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            min_similarity: default_min_similarity(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybackConfig {
    /// How far before a match playback starts
    #[serde(default = "default_seek_margin_secs")]
    pub seek_margin_secs: f64,
}

fn default_seek_margin_secs() -> f64 {
    crate::playback::DEFAULT_SEEK_MARGIN_SECS
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            seek_margin_secs: default_seek_margin_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_models_dir")]
    pub dir: PathBuf,

    #[serde(default = "default_visual_url")]
    pub visual_url: String,

    #[serde(default = "default_text_url")]
    pub text_url: String,

    #[serde(default = "default_tokenizer_url")]
    pub tokenizer_url: String,

    #[serde(default = "default_intra_threads")]
    pub intra_threads: usize,
}

fn default_models_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from(".local/share"))
        .join("vidquery")
        .join("models")
}

fn default_visual_url() -> String {
    "https://huggingface.co/Qdrant/clip-ViT-B-32-vision/resolve/main/model.onnx".to_string()
}

fn default_text_url() -> String {
    "https://huggingface.co/Qdrant/clip-ViT-B-32-text/resolve/main/model.onnx".to_string()
}

fn default_tokenizer_url() -> String {
    "https://huggingface.co/openai/clip-vit-base-patch32/resolve/main/tokenizer.json".to_string()
}

fn default_intra_threads() -> usize {
    4
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            dir: default_models_dir(),
            visual_url: default_visual_url(),
            text_url: default_text_url(),
            tokenizer_url: default_tokenizer_url(),
            intra_threads: default_intra_threads(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Upper bound for a whole indexing run
    #[serde(default = "default_build_secs")]
    pub build_secs: u64,

    #[serde(default = "default_query_secs")]
    pub query_secs: u64,
}

fn default_build_secs() -> u64 {
    30 * 60
}

fn default_query_secs() -> u64 {
    30
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            build_secs: default_build_secs(),
            query_secs: default_query_secs(),
        }
    }
}

fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("vidquery")
        .join("vidquery.db")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            sampler: SamplerConfig::default(),
            search: SearchConfig::default(),
            playback: PlaybackConfig::default(),
            models: ModelConfig::default(),
            timeouts: TimeoutConfig::default(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            // Create default config
            let config = Config::default();
            config.save_to(&config_path)?;
            Ok(config)
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        Ok(())
    }

    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("vidquery")
    }

    fn config_path() -> PathBuf {
        // Check environment variable
        if let Ok(path) = std::env::var("VIDQUERY_CONFIG") {
            return PathBuf::from(path);
        }

        Self::config_dir().join("config.toml")
    }
}
