//! Shared text/image embedding space.
//!
//! Frames and queries are embedded by the same provider so that a text query
//! and a matching frame end up close together. Everything stored or compared
//! by the pipeline is unit-normalized first, which makes cosine similarity a
//! plain dot product.

use anyhow::{anyhow, Result};
use image::RgbImage;

/// A d-dimensional embedding vector (512 for CLIP ViT-B/32)
pub type Embedding = Vec<f32>;

/// Maps text or images into one shared vector space.
///
/// Implementations are not required to normalize; callers run [`normalize`]
/// on every vector before storing or querying with it.
pub trait EmbeddingProvider: Send + Sync {
    /// Embed a free-text query
    fn embed_text(&self, text: &str) -> Result<Embedding>;

    /// Embed a single RGB frame
    fn embed_image(&self, image: &RgbImage) -> Result<Embedding>;

    /// Name recorded alongside indexed vectors
    fn model_name(&self) -> &str;
}

/// L2-normalize an embedding.
///
/// A zero-norm or non-finite vector has no direction and is rejected.
pub fn normalize(mut embedding: Embedding) -> Result<Embedding> {
    if embedding.is_empty() {
        return Err(anyhow!("Embedding is empty"));
    }

    let norm: f32 = embedding.iter().map(|x| x * x).sum::<f32>().sqrt();
    if !norm.is_finite() || norm == 0.0 {
        return Err(anyhow!("Embedding has invalid norm {}", norm));
    }

    for value in embedding.iter_mut() {
        *value /= norm;
    }
    Ok(embedding)
}

/// Calculate cosine similarity between two vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    (dot_product / (norm_a * norm_b)).clamp(-1.0, 1.0)
}

/// Cosine distance as reported by the vector store: `1 - cosine_similarity`
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    1.0 - cosine_similarity(a, b)
}
