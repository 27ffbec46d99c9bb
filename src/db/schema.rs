pub const SCHEMA: &str = r#"
-- Collections: one per indexed video
CREATE TABLE IF NOT EXISTS collections (
    name TEXT PRIMARY KEY,
    distance TEXT NOT NULL,         -- 'cosine'
    dimension INTEGER,              -- set by the first inserted vector
    created_at TEXT NOT NULL
);

-- Frame vectors, scoped by collection
CREATE TABLE IF NOT EXISTS vectors (
    collection TEXT NOT NULL,
    id TEXT NOT NULL,
    embedding BLOB NOT NULL,        -- little-endian f32
    metadata TEXT NOT NULL,         -- JSON: {"timestamp": .., "frame": ..}
    PRIMARY KEY (collection, id)
);

CREATE INDEX IF NOT EXISTS idx_vectors_collection ON vectors(collection);

-- The collection that is live for the session (at most one row)
CREATE TABLE IF NOT EXISTS active_video (
    slot INTEGER PRIMARY KEY CHECK (slot = 1),
    collection_id TEXT NOT NULL,
    content_hash TEXT NOT NULL,
    source_path TEXT NOT NULL,
    indexed INTEGER NOT NULL DEFAULT 0,
    frame_count INTEGER,
    updated_at TEXT NOT NULL
);
"#;
