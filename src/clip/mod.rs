//! CLIP (Contrastive Language-Image Pre-training) embeddings module
//!
//! Frames and search text are embedded into CLIP's shared space, so a text
//! query can be compared directly against indexed frames.

mod model;

pub use model::ClipModel;

/// Name recorded for vectors produced by [`ClipModel`]
pub const MODEL_NAME: &str = "clip-vit-base-patch32";
