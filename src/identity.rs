//! Content-addressed video identity.
//!
//! A video is identified by the SHA-256 of its bytes, never by its filename
//! or upload time. The collection holding its frames is named after that hash.

use anyhow::{anyhow, Result};
use sha2::digest::Output;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

/// Prefix shared by every frame collection
pub const COLLECTION_PREFIX: &str = "video_";

type ContentHash = Output<Sha256>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VideoIdentity {
    content_hash: ContentHash,
    collection_id: String,
}

impl VideoIdentity {
    fn from_hash(content_hash: ContentHash) -> Self {
        let collection_id = format!("{}{:x}", COLLECTION_PREFIX, content_hash);
        Self {
            content_hash,
            collection_id,
        }
    }

    /// Rebuild an identity from its hex digest (as persisted in the session record)
    pub fn from_hex(digest: &str) -> Result<Self> {
        if digest.len() != 64 || !digest.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(anyhow!("Invalid content hash: {}", digest));
        }

        let mut content_hash = ContentHash::default();
        for (i, byte) in content_hash.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&digest[i * 2..i * 2 + 2], 16)
                .map_err(|e| anyhow!("Invalid content hash {}: {}", digest, e))?;
        }
        Ok(Self::from_hash(content_hash))
    }

    pub fn content_hash_hex(&self) -> String {
        format!("{:x}", self.content_hash)
    }

    pub fn collection_id(&self) -> &str {
        &self.collection_id
    }
}

impl std::fmt::Display for VideoIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.collection_id)
    }
}

/// Identify in-memory video bytes
pub fn identify(video_bytes: &[u8]) -> VideoIdentity {
    VideoIdentity::from_hash(Sha256::digest(video_bytes))
}

/// Identify a video by streaming its bytes through the hasher
pub fn identify_reader<R: Read>(mut reader: R) -> std::io::Result<VideoIdentity> {
    let mut hasher = Sha256::new();

    let mut buffer = [0u8; 8192];
    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(VideoIdentity::from_hash(hasher.finalize()))
}

pub fn identify_file(path: &Path) -> std::io::Result<VideoIdentity> {
    let file = File::open(path)?;
    identify_reader(BufReader::new(file))
}

/// True iff there is no previous identity or the content changed.
pub fn should_rebuild(previous: Option<&VideoIdentity>, current: &VideoIdentity) -> bool {
    match previous {
        None => true,
        Some(prev) => prev.collection_id != current.collection_id,
    }
}
