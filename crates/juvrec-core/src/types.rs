use serde::{Deserialize, Serialize};

/// Dimension of the face embeddings produced and compared by this crate.
pub const EMBEDDING_DIM: usize = 128;

/// Opaque key of an enrolled subject (the juvenile's record id).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdentityId(pub String);

impl IdentityId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for IdentityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for IdentityId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for IdentityId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Bounding box for a detected face, with optional facial landmarks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaceBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl FaceBox {
    pub fn center(&self) -> (f32, f32) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }
}

/// Face embedding vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding, when known.
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Two embeddings are comparable when they share a dimension and do not
    /// name different models.
    pub fn is_comparable(&self, other: &Embedding) -> bool {
        if self.values.len() != other.values.len() {
            return false;
        }
        match (&self.model_version, &other.model_version) {
            (Some(a), Some(b)) => a == b,
            _ => true,
        }
    }

    /// Euclidean distance, or `None` when the embeddings are not comparable.
    pub fn distance(&self, other: &Embedding) -> Option<f32> {
        if !self.is_comparable(other) {
            return None;
        }
        Some(
            self.values
                .iter()
                .zip(other.values.iter())
                .map(|(a, b)| (a - b).powi(2))
                .sum::<f32>()
                .sqrt(),
        )
    }
}

/// Operator on whose behalf a scan runs, recorded with every enrollment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionContext {
    pub operator: String,
}

impl SessionContext {
    pub fn new(operator: impl Into<String>) -> Self {
        Self {
            operator: operator.into(),
        }
    }
}
