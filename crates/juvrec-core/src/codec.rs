//! Textual embedding encoding used by the persistence layer.
//!
//! Embeddings are stored as a bracketed list of numbers, e.g.
//! `[-0.0912, 0.1134, ...]`. Whitespace after separators is accepted so
//! vectors written by other tools decode unchanged.

use crate::types::{Embedding, EMBEDDING_DIM};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("malformed embedding text: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("expected {expected}-dim embedding, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("embedding contains a non-finite value at index {0}")]
    NonFinite(usize),
}

/// Serialize an embedding to its stored text form.
pub fn encode(embedding: &Embedding) -> Result<String, CodecError> {
    check(&embedding.values)?;
    Ok(serde_json::to_string(&embedding.values)?)
}

/// Parse stored text back into an embedding of exactly [`EMBEDDING_DIM`] values.
pub fn decode(text: &str) -> Result<Embedding, CodecError> {
    let values: Vec<f32> = serde_json::from_str(text.trim())?;
    check(&values)?;
    Ok(Embedding::new(values))
}

fn check(values: &[f32]) -> Result<(), CodecError> {
    if values.len() != EMBEDDING_DIM {
        return Err(CodecError::DimensionMismatch {
            expected: EMBEDDING_DIM,
            actual: values.len(),
        });
    }
    if let Some(idx) = values.iter().position(|v| !v.is_finite()) {
        return Err(CodecError::NonFinite(idx));
    }
    Ok(())
}
