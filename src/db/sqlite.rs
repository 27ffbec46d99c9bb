//! SQLite backend implementation.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use super::embeddings::{bytes_to_embedding, embedding_to_bytes, nearest};
use super::schema::SCHEMA;
use super::session::{ActiveRecord, SessionRecordStore};
use super::{DistanceMetric, FrameMetadata, Neighbor, StoreError, VectorStore};
use crate::identity::VideoIdentity;

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            // Connection::open reports the missing directory anyway
            let _ = std::fs::create_dir_all(parent);
        }
        let conn = Connection::open(path)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn initialize(&self) -> Result<(), StoreError> {
        self.conn()?.execute_batch(SCHEMA)?;
        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }
}

/// Distance metric and dimension of a collection, if it exists
fn collection_info(
    conn: &Connection,
    id: &str,
) -> Result<Option<(DistanceMetric, Option<usize>)>, StoreError> {
    let row = conn
        .query_row(
            "SELECT distance, dimension FROM collections WHERE name = ?",
            [id],
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, Option<i64>>(1)?)),
        )
        .optional()?;

    match row {
        Some((distance, dimension)) => {
            let metric =
                DistanceMetric::parse(&distance).ok_or(StoreError::UnknownMetric(distance))?;
            Ok(Some((metric, dimension.map(|d| d as usize))))
        }
        None => Ok(None),
    }
}

impl VectorStore for SqliteStore {
    fn create_collection(&self, id: &str, metric: DistanceMetric) -> Result<(), StoreError> {
        let conn = self.conn()?;
        if collection_info(&conn, id)?.is_some() {
            return Err(StoreError::CollectionExists(id.to_string()));
        }

        conn.execute(
            "INSERT INTO collections (name, distance, created_at) VALUES (?, ?, ?)",
            params![id, metric.as_str(), Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    fn delete_collection(&self, id: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM vectors WHERE collection = ?", [id])?;
        let removed = tx.execute("DELETE FROM collections WHERE name = ?", [id])?;
        tx.commit()?;
        Ok(removed > 0)
    }

    fn insert(
        &self,
        collection_id: &str,
        id: &str,
        vector: &[f32],
        metadata: &FrameMetadata,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        let (_, dimension) = collection_info(&conn, collection_id)?
            .ok_or_else(|| StoreError::CollectionNotFound(collection_id.to_string()))?;

        if let Some(expected) = dimension {
            if expected != vector.len() {
                return Err(StoreError::DimensionMismatch {
                    collection: collection_id.to_string(),
                    expected,
                    actual: vector.len(),
                });
            }
        }

        let metadata_json = serde_json::to_string(metadata)?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO vectors (collection, id, embedding, metadata) VALUES (?, ?, ?, ?)",
            params![collection_id, id, embedding_to_bytes(vector), metadata_json],
        )?;
        if dimension.is_none() {
            tx.execute(
                "UPDATE collections SET dimension = ? WHERE name = ?",
                params![vector.len() as i64, collection_id],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn query(
        &self,
        collection_id: &str,
        vector: &[f32],
        k: usize,
    ) -> Result<Vec<Neighbor>, StoreError> {
        let conn = self.conn()?;
        let (metric, dimension) = collection_info(&conn, collection_id)?
            .ok_or_else(|| StoreError::CollectionNotFound(collection_id.to_string()))?;

        // Vectors of another dimension are not comparable; never score them as misses
        if let Some(expected) = dimension {
            if expected != vector.len() {
                return Err(StoreError::DimensionMismatch {
                    collection: collection_id.to_string(),
                    expected,
                    actual: vector.len(),
                });
            }
        }

        let mut stmt =
            conn.prepare("SELECT id, embedding, metadata FROM vectors WHERE collection = ?")?;
        let rows: Vec<(String, Vec<u8>, String)> = stmt
            .query_map([collection_id], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
            .collect::<Result<_, _>>()?;

        let embeddings: Vec<Vec<f32>> = rows
            .iter()
            .map(|(_, bytes, _)| bytes_to_embedding(bytes))
            .collect();

        let hits = match metric {
            DistanceMetric::Cosine => nearest(vector, &embeddings, k),
        };

        hits.into_iter()
            .map(|(idx, distance)| -> Result<Neighbor, StoreError> {
                let (id, _, metadata_json) = &rows[idx];
                Ok(Neighbor {
                    id: id.clone(),
                    metadata: serde_json::from_str(metadata_json)?,
                    distance,
                })
            })
            .collect()
    }

    fn count(&self, collection_id: &str) -> Result<usize, StoreError> {
        let conn = self.conn()?;
        if collection_info(&conn, collection_id)?.is_none() {
            return Err(StoreError::CollectionNotFound(collection_id.to_string()));
        }

        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM vectors WHERE collection = ?",
            [collection_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    fn collection_exists(&self, id: &str) -> Result<bool, StoreError> {
        let conn = self.conn()?;
        Ok(collection_info(&conn, id)?.is_some())
    }

    fn list_collections(&self) -> Result<Vec<String>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT name FROM collections ORDER BY name")?;
        let names = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(names)
    }

    fn rename_collection(&self, from: &str, to: &str) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        if collection_info(&conn, from)?.is_none() {
            return Err(StoreError::CollectionNotFound(from.to_string()));
        }
        if from == to {
            return Ok(());
        }

        let tx = conn.transaction()?;
        tx.execute("DELETE FROM vectors WHERE collection = ?", [to])?;
        tx.execute("DELETE FROM collections WHERE name = ?", [to])?;
        tx.execute(
            "UPDATE collections SET name = ? WHERE name = ?",
            params![to, from],
        )?;
        tx.execute(
            "UPDATE vectors SET collection = ? WHERE collection = ?",
            params![to, from],
        )?;
        tx.commit()?;
        Ok(())
    }
}

impl SessionRecordStore for SqliteStore {
    fn load_active(&self) -> Result<Option<ActiveRecord>, StoreError> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                r#"
                SELECT content_hash, source_path, indexed, frame_count, updated_at
                FROM active_video
                WHERE slot = 1
                "#,
                [],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, bool>(2)?,
                        row.get::<_, Option<i64>>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()?;

        let Some((hash, source_path, indexed, frame_count, updated_at)) = row else {
            return Ok(None);
        };

        // A corrupt row is treated as no session rather than a fatal error
        let identity = match VideoIdentity::from_hex(&hash) {
            Ok(identity) => identity,
            Err(e) => {
                tracing::warn!(error = %e, "Ignoring unreadable active video record");
                return Ok(None);
            }
        };
        let updated_at = DateTime::parse_from_rfc3339(&updated_at)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now());

        Ok(Some(ActiveRecord {
            identity,
            source_path: PathBuf::from(source_path),
            indexed,
            frame_count: frame_count.map(|n| n as usize),
            updated_at,
        }))
    }

    fn save_active(&self, record: &ActiveRecord) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT OR REPLACE INTO active_video
                (slot, collection_id, content_hash, source_path, indexed, frame_count, updated_at)
            VALUES (1, ?, ?, ?, ?, ?, ?)
            "#,
            params![
                record.identity.collection_id(),
                record.identity.content_hash_hex(),
                record.source_path.to_string_lossy(),
                record.indexed,
                record.frame_count.map(|n| n as i64),
                record.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn clear_active(&self) -> Result<(), StoreError> {
        self.conn()?.execute("DELETE FROM active_video", [])?;
        Ok(())
    }
}
