//! juvrec-store: SQLite persistence for enrolled facial data.
//!
//! One `facial_data` row per identity holds the capture JPEG and the
//! embedding text side by side. Every write is a single transaction, so a
//! failed enrollment leaves nothing behind.

use chrono::{DateTime, Utc};
use juvrec_core::store::{EmbeddingStore, EnrollmentRecord, StoreError};
use juvrec_core::types::IdentityId;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use std::path::Path;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS facial_data (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    identity    TEXT NOT NULL UNIQUE,
    image       BLOB NOT NULL,
    embedding   TEXT NOT NULL,
    enrolled_by TEXT NOT NULL,
    created_at  TEXT NOT NULL
);
";

/// Listing row without the image or embedding payloads.
#[derive(Debug, Clone)]
pub struct RecordSummary {
    pub identity: IdentityId,
    pub enrolled_by: String,
    pub created_at: Option<DateTime<Utc>>,
    pub image_bytes: usize,
}

pub struct SqliteStore {
    conn: Connection,
}

fn backend(e: rusqlite::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Backend(format!("create {}: {e}", parent.display())))?;
        }
        let conn = Connection::open(path).map_err(backend)?;
        tracing::info!(path = %path.display(), "opened facial data store");
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory().map_err(backend)?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA).map_err(backend)?;
        Ok(Self { conn })
    }

    /// JPEG stored with `identity`'s enrollment.
    pub fn fetch_image(&self, identity: &IdentityId) -> Result<Option<Vec<u8>>, StoreError> {
        self.conn
            .query_row(
                "SELECT image FROM facial_data WHERE identity = ?1",
                params![identity.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(backend)
    }

    pub fn list_records(&self) -> Result<Vec<RecordSummary>, StoreError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT identity, enrolled_by, created_at, length(image)
                 FROM facial_data ORDER BY id",
            )
            .map_err(backend)?;

        let rows = stmt
            .query_map([], |row| {
                let created: String = row.get(2)?;
                let image_bytes: i64 = row.get(3)?;
                Ok(RecordSummary {
                    identity: IdentityId(row.get(0)?),
                    enrolled_by: row.get(1)?,
                    created_at: DateTime::parse_from_rfc3339(&created)
                        .ok()
                        .map(|t| t.with_timezone(&Utc)),
                    image_bytes: image_bytes.max(0) as usize,
                })
            })
            .map_err(backend)?;

        rows.collect::<Result<Vec<_>, _>>().map_err(backend)
    }
}

impl EmbeddingStore for SqliteStore {
    fn fetch_all_embeddings(&self) -> Result<Vec<(IdentityId, String)>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT identity, embedding FROM facial_data ORDER BY id")
            .map_err(backend)?;

        let rows = stmt
            .query_map([], |row| Ok((IdentityId(row.get(0)?), row.get::<_, String>(1)?)))
            .map_err(backend)?;

        rows.collect::<Result<Vec<_>, _>>().map_err(backend)
    }

    fn fetch_embedding(&self, identity: &IdentityId) -> Result<Option<String>, StoreError> {
        self.conn
            .query_row(
                "SELECT embedding FROM facial_data WHERE identity = ?1",
                params![identity.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(backend)
    }

    fn store_embedding(&mut self, record: &EnrollmentRecord) -> Result<(), StoreError> {
        let tx = self.conn.transaction().map_err(backend)?;

        let inserted = tx.execute(
            "INSERT INTO facial_data (identity, image, embedding, enrolled_by, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                record.identity.as_str(),
                record.image,
                record.embedding,
                record.enrolled_by,
                Utc::now().to_rfc3339(),
            ],
        );

        match inserted {
            Ok(_) => {}
            Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
                return Err(StoreError::AlreadyEnrolled(record.identity.clone()));
            }
            Err(e) => return Err(backend(e)),
        }

        tx.commit().map_err(backend)?;
        tracing::debug!(identity = %record.identity, "facial data committed");
        Ok(())
    }

    fn list_identities(&self) -> Result<Vec<IdentityId>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT identity FROM facial_data ORDER BY id")
            .map_err(backend)?;

        let rows = stmt
            .query_map([], |row| Ok(IdentityId(row.get(0)?)))
            .map_err(backend)?;

        rows.collect::<Result<Vec<_>, _>>().map_err(backend)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use juvrec_core::codec;
    use juvrec_core::store::load_gallery;
    use juvrec_core::types::{Embedding, EMBEDDING_DIM};

    fn record(id: &str, first: f32) -> EnrollmentRecord {
        let mut values = vec![0.0f32; EMBEDDING_DIM];
        values[0] = first;
        EnrollmentRecord {
            identity: IdentityId::from(id),
            image: vec![0xFF, 0xD8, 0xFF, 0xD9],
            embedding: codec::encode(&Embedding::new(values)).unwrap(),
            enrolled_by: "officer.reyes".into(),
        }
    }

    #[test]
    fn test_empty_store() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert!(store.fetch_all_embeddings().unwrap().is_empty());
        assert!(store.list_identities().unwrap().is_empty());
        assert_eq!(store.fetch_embedding(&IdentityId::from("J-1")).unwrap(), None);
    }

    #[test]
    fn test_store_and_fetch() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        let rec = record("J-1", 0.25);
        store.store_embedding(&rec).unwrap();

        let text = store.fetch_embedding(&rec.identity).unwrap().unwrap();
        assert_eq!(text, rec.embedding);
        assert_eq!(store.fetch_image(&rec.identity).unwrap(), Some(rec.image.clone()));

        let gallery = load_gallery(&store).unwrap();
        assert_eq!(gallery.len(), 1);
        assert!((gallery[0].embedding.values[0] - 0.25).abs() < 1e-6);
    }

    #[test]
    fn test_insertion_order_preserved() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        for id in ["J-3", "J-1", "J-2"] {
            store.store_embedding(&record(id, 0.0)).unwrap();
        }
        let ids: Vec<String> = store
            .list_identities()
            .unwrap()
            .into_iter()
            .map(|i| i.0)
            .collect();
        assert_eq!(ids, vec!["J-3", "J-1", "J-2"]);
    }

    #[test]
    fn test_duplicate_identity_rejected_without_partial_write() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        store.store_embedding(&record("J-1", 0.1)).unwrap();

        let err = store.store_embedding(&record("J-1", 0.9)).unwrap_err();
        assert!(matches!(err, StoreError::AlreadyEnrolled(ref id) if id.as_str() == "J-1"));

        let rows = store.fetch_all_embeddings().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].1, record("J-1", 0.1).embedding);
    }

    #[test]
    fn test_list_records_has_timestamps() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        let before = Utc::now();
        store.store_embedding(&record("J-1", 0.1)).unwrap();

        let records = store.list_records().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].enrolled_by, "officer.reyes");
        assert_eq!(records[0].image_bytes, 4);
        let created = records[0].created_at.unwrap();
        assert!(created >= before - chrono::Duration::seconds(1));
    }

    #[test]
    fn test_open_creates_file() {
        let dir = std::env::temp_dir().join(format!("juvrec-store-test-{}", std::process::id()));
        let path = dir.join("nested").join("juvrec.db");
        {
            let mut store = SqliteStore::open(&path).unwrap();
            store.store_embedding(&record("J-1", 0.1)).unwrap();
        }
        let reopened = SqliteStore::open(&path).unwrap();
        assert_eq!(reopened.list_identities().unwrap().len(), 1);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
