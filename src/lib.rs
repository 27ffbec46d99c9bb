//! Semantic frame search over a single video.
//!
//! A video is identified by its content, sampled into frames, embedded with
//! CLIP and indexed into a per-video vector collection that text queries are
//! ranked against.

pub mod clip;
pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod frames;
pub mod identity;
pub mod index;
pub mod logging;
pub mod playback;
pub mod search;
pub mod session;
pub mod tasks;

#[cfg(test)]
mod testing;

pub use error::{ErrorKind, PipelineError};
