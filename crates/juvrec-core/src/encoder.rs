//! 128-dimensional face encoder via ONNX Runtime.
//!
//! Detects the face again on the captured frame (the subject may have moved
//! since the locator saw it), aligns it to a 150×150 RGB crop and runs a
//! ResNet face-encoding model whose embeddings are compared by Euclidean
//! distance.

use crate::alignment;
use crate::detector::{DetectorError, FaceDetector};
use crate::frame::Frame;
use crate::types::{Embedding, EMBEDDING_DIM};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const ENCODER_INPUT_SIZE: usize = 150;
const ENCODER_MEAN: f32 = 127.5;
const ENCODER_STD: f32 = 128.0;
const ENCODER_MODEL_VERSION: &str = "resnet_v1_128";

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("invalid frame: {0}")]
    InvalidFrame(String),
    #[error("no face found in captured frame")]
    NoFaceFound,
    #[error("face has no landmarks; alignment needs detector landmarks")]
    NoLandmarks,
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Converts a captured frame into a face embedding.
pub trait EmbeddingExtractor {
    fn extract(&mut self, frame: &Frame) -> Result<Embedding, ExtractError>;
}

/// Reject frames the encoder cannot use: empty or not 3-channel.
pub fn validate_frame(frame: &Frame) -> Result<(), ExtractError> {
    if frame.is_empty() {
        return Err(ExtractError::InvalidFrame("empty frame".into()));
    }
    if frame.channels() != 3 {
        return Err(ExtractError::InvalidFrame(format!(
            "expected 3-channel frame, got {:?}",
            frame.order
        )));
    }
    let expected = frame.width as usize * frame.height as usize * 3;
    if frame.data.len() != expected {
        return Err(ExtractError::InvalidFrame(format!(
            "buffer holds {} bytes, {}x{} needs {expected}",
            frame.data.len(),
            frame.width,
            frame.height
        )));
    }
    Ok(())
}

/// SCRFD detection + alignment + 128-d encoding.
pub struct FaceEncoder {
    detector: FaceDetector,
    session: Session,
}

impl FaceEncoder {
    /// Load the encoder model; `detector` supplies landmarks for alignment.
    pub fn load(model_path: &str, detector: FaceDetector) -> Result<Self, ExtractError> {
        if !Path::new(model_path).exists() {
            return Err(ExtractError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = model_path,
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded face encoder model"
        );

        Ok(Self { detector, session })
    }

    /// Preprocess a 150x150 RGB aligned crop into a NCHW float tensor.
    fn preprocess(aligned_rgb: &[u8]) -> Array4<f32> {
        let size = ENCODER_INPUT_SIZE;
        let mut tensor = Array4::<f32>::zeros((1, 3, size, size));

        for y in 0..size {
            for x in 0..size {
                for c in 0..3 {
                    let pixel = aligned_rgb
                        .get((y * size + x) * 3 + c)
                        .copied()
                        .unwrap_or(0) as f32;
                    tensor[[0, c, y, x]] = (pixel - ENCODER_MEAN) / ENCODER_STD;
                }
            }
        }

        tensor
    }
}

impl EmbeddingExtractor for FaceEncoder {
    fn extract(&mut self, frame: &Frame) -> Result<Embedding, ExtractError> {
        validate_frame(frame)?;
        let rgb = frame
            .to_rgb()
            .ok_or_else(|| ExtractError::InvalidFrame("not a color frame".into()))?;

        let faces = self.detector.detect(&rgb)?;
        let Some(face) = faces.first() else {
            tracing::debug!(seq = frame.sequence, "encoder: no face in captured frame");
            return Err(ExtractError::NoFaceFound);
        };
        let landmarks = face.landmarks.as_ref().ok_or(ExtractError::NoLandmarks)?;

        let aligned = alignment::align_face(&rgb.data, rgb.width, rgb.height, landmarks, ENCODER_INPUT_SIZE);
        let input = Self::preprocess(&aligned);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| ExtractError::InferenceFailed(format!("embedding extraction: {e}")))?;

        if raw.len() != EMBEDDING_DIM {
            return Err(ExtractError::InferenceFailed(format!(
                "expected {EMBEDDING_DIM}-dim embedding, got {}",
                raw.len()
            )));
        }

        tracing::debug!(confidence = face.confidence, faces = faces.len(), "encoder: embedding extracted");

        Ok(Embedding {
            values: raw.to_vec(),
            model_version: Some(ENCODER_MODEL_VERSION.to_string()),
        })
    }
}
