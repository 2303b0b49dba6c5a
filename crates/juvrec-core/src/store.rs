//! Persistence collaborator contract and gallery loading.

use crate::codec;
use crate::matcher::GalleryEntry;
use crate::types::IdentityId;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("identity {0} already has facial data")]
    AlreadyEnrolled(IdentityId),
    #[error("storage backend: {0}")]
    Backend(String),
}

/// One enrollment: the capture image and its embedding, stored together.
#[derive(Debug, Clone)]
pub struct EnrollmentRecord {
    pub identity: IdentityId,
    /// JPEG bytes of the captured frame.
    pub image: Vec<u8>,
    /// Embedding in [`codec`] text form.
    pub embedding: String,
    pub enrolled_by: String,
}

/// Storage of (identity, image, embedding) records.
///
/// `store_embedding` must write image and embedding atomically: either the
/// whole record is visible afterwards or none of it is.
pub trait EmbeddingStore {
    fn fetch_all_embeddings(&self) -> Result<Vec<(IdentityId, String)>, StoreError>;
    fn fetch_embedding(&self, identity: &IdentityId) -> Result<Option<String>, StoreError>;
    fn store_embedding(&mut self, record: &EnrollmentRecord) -> Result<(), StoreError>;
    fn list_identities(&self) -> Result<Vec<IdentityId>, StoreError>;
}

/// Fetch and decode every stored embedding.
///
/// Rows that fail to decode are logged and left out; the rest of the gallery
/// is still usable.
pub fn load_gallery<S: EmbeddingStore + ?Sized>(store: &S) -> Result<Vec<GalleryEntry>, StoreError> {
    let rows = store.fetch_all_embeddings()?;
    let total = rows.len();

    let gallery: Vec<GalleryEntry> = rows
        .into_iter()
        .filter_map(|(identity, text)| match codec::decode(&text) {
            Ok(embedding) => Some(GalleryEntry { identity, embedding }),
            Err(e) => {
                tracing::warn!(%identity, error = %e, "skipping undecodable stored embedding");
                None
            }
        })
        .collect();

    tracing::debug!(total, usable = gallery.len(), "gallery loaded");
    Ok(gallery)
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// In-memory store used by unit tests across the crate.
    #[derive(Default)]
    pub struct MemoryStore {
        pub records: Vec<EnrollmentRecord>,
        pub fail_reads: bool,
        pub fail_writes: bool,
    }

    impl MemoryStore {
        pub fn with_embeddings(rows: Vec<(&str, String)>) -> Self {
            Self {
                records: rows
                    .into_iter()
                    .map(|(id, embedding)| EnrollmentRecord {
                        identity: IdentityId::from(id),
                        image: Vec::new(),
                        embedding,
                        enrolled_by: "seed".into(),
                    })
                    .collect(),
                ..Default::default()
            }
        }
    }

    impl EmbeddingStore for MemoryStore {
        fn fetch_all_embeddings(&self) -> Result<Vec<(IdentityId, String)>, StoreError> {
            if self.fail_reads {
                return Err(StoreError::Backend("read failed".into()));
            }
            Ok(self
                .records
                .iter()
                .map(|r| (r.identity.clone(), r.embedding.clone()))
                .collect())
        }

        fn fetch_embedding(&self, identity: &IdentityId) -> Result<Option<String>, StoreError> {
            Ok(self
                .records
                .iter()
                .find(|r| &r.identity == identity)
                .map(|r| r.embedding.clone()))
        }

        fn store_embedding(&mut self, record: &EnrollmentRecord) -> Result<(), StoreError> {
            if self.fail_writes {
                return Err(StoreError::Backend("write failed".into()));
            }
            if self.records.iter().any(|r| r.identity == record.identity) {
                return Err(StoreError::AlreadyEnrolled(record.identity.clone()));
            }
            self.records.push(record.clone());
            Ok(())
        }

        fn list_identities(&self) -> Result<Vec<IdentityId>, StoreError> {
            Ok(self.records.iter().map(|r| r.identity.clone()).collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::MemoryStore;
    use super::*;
    use crate::types::{Embedding, EMBEDDING_DIM};

    #[test]
    fn test_load_gallery_skips_bad_rows() {
        let good = codec::encode(&Embedding::new(vec![0.1; EMBEDDING_DIM])).unwrap();
        let store = MemoryStore::with_embeddings(vec![
            ("J-1", good.clone()),
            ("J-2", "[0.1, 0.2]".into()),
            ("J-3", "garbage".into()),
            ("J-4", good),
        ]);
        let gallery = load_gallery(&store).unwrap();
        let ids: Vec<&str> = gallery.iter().map(|e| e.identity.as_str()).collect();
        assert_eq!(ids, vec!["J-1", "J-4"]);
    }

    #[test]
    fn test_load_gallery_propagates_read_failure() {
        let store = MemoryStore {
            fail_reads: true,
            ..Default::default()
        };
        assert!(matches!(load_gallery(&store), Err(StoreError::Backend(_))));
    }
}
