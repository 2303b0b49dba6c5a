//! SCRFD face detector via ONNX Runtime.
//!
//! Implements the SCRFD (Sample and Computation Redistribution for Efficient Face
//! Detection) model with 3-stride anchor-free decoding and NMS post-processing.
//! The same detector backs the per-tick face locator (on a grayscale
//! derivation of the frame) and the embedding extractor (on the RGB frame).

use crate::frame::{Frame, PixelOrder};
use crate::types::FaceBox;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const SCRFD_INPUT_SIZE: usize = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_CONFIDENCE_THRESHOLD: f32 = 0.5;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

pub const DEFAULT_MIN_FACE_SIZE: f32 = 30.0;
pub const DEFAULT_MIN_NEIGHBORS: usize = 5;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0} (place the SCRFD model in the configured model directory)")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("empty frame")]
    EmptyFrame,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Post-processing knobs applied after NMS.
#[derive(Debug, Clone, Copy)]
pub struct LocatorConfig {
    /// Boxes narrower or shorter than this (in frame pixels) are dropped.
    pub min_size: f32,
    /// Overlapping raw candidates a kept box must have absorbed during NMS.
    pub min_neighbors: usize,
}

impl Default for LocatorConfig {
    fn default() -> Self {
        Self {
            min_size: DEFAULT_MIN_FACE_SIZE,
            min_neighbors: DEFAULT_MIN_NEIGHBORS,
        }
    }
}

/// Finds candidate faces in a frame.
///
/// Boxes are returned in detector-native order (descending confidence);
/// downstream logic only looks at the first one.
pub trait FaceLocator {
    fn locate(&mut self, frame: &Frame) -> Result<Vec<FaceBox>, DetectorError>;
}

/// Aspect-preserving fit of a frame into the square model input.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
    /// Scaled content size inside the padded input.
    content_w: usize,
    content_h: usize,
}

impl Letterbox {
    fn fit(src_w: usize, src_h: usize, side: usize) -> Self {
        let scale = (side as f32 / src_w as f32).min(side as f32 / src_h as f32);
        let content_w = ((src_w as f32 * scale).round() as usize).min(side);
        let content_h = ((src_h as f32 * scale).round() as usize).min(side);
        Self {
            scale,
            pad_x: (side - content_w) as f32 / 2.0,
            pad_y: (side - content_h) as f32 / 2.0,
            content_w,
            content_h,
        }
    }

    /// Model-input coordinates back to frame coordinates.
    fn unmap(&self, (x, y): (f32, f32)) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// Output tensor indices for one stride: (score_idx, bbox_idx, kps_idx).
type StrideOutputIndices = (usize, usize, usize);

/// Raw head outputs of one stride level.
struct StrideTensors<'a> {
    stride: usize,
    scores: &'a [f32],
    bboxes: &'a [f32],
    kps: &'a [f32],
}

/// A kept detection and how many suppressed candidates overlapped it.
struct Cluster {
    face: FaceBox,
    neighbors: usize,
}

/// SCRFD-based face detector.
pub struct FaceDetector {
    session: Session,
    input_side: usize,
    /// Per-stride output indices [(score, bbox, kps)] for strides [8, 16, 32].
    /// Discovered by name at load time; falls back to positional ordering.
    stride_indices: [StrideOutputIndices; 3],
    config: LocatorConfig,
}

impl FaceDetector {
    /// Load the SCRFD ONNX model from the given path.
    pub fn load(model_path: &str, config: LocatorConfig) -> Result<Self, DetectorError> {
        if !Path::new(model_path).exists() {
            return Err(DetectorError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        let num_outputs = output_names.len();

        tracing::info!(
            path = model_path,
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?output_names,
            min_size = config.min_size,
            min_neighbors = config.min_neighbors,
            "loaded SCRFD model"
        );

        if num_outputs < 9 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD model requires 9 outputs (3 strides × score/bbox/kps), got {num_outputs}"
            )));
        }

        let stride_indices = discover_output_indices(&output_names);
        tracing::debug!(?stride_indices, "SCRFD output tensor mapping");

        Ok(Self {
            session,
            input_side: SCRFD_INPUT_SIZE,
            stride_indices,
            config,
        })
    }

    /// Detect faces in a grayscale or 3-channel frame, sorted by confidence.
    pub fn detect(&mut self, frame: &Frame) -> Result<Vec<FaceBox>, DetectorError> {
        if frame.is_empty() {
            return Err(DetectorError::EmptyFrame);
        }

        let (input, letterbox) = self.preprocess(frame);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();

        for (slot, &stride) in SCRFD_STRIDES.iter().enumerate() {
            let (score_idx, bbox_idx, kps_idx) = self.stride_indices[slot];
            let extract = |idx: usize, what: &str| {
                outputs[idx]
                    .try_extract_tensor::<f32>()
                    .map(|(_, data)| data)
                    .map_err(|e| DetectorError::InferenceFailed(format!("{what} stride {stride}: {e}")))
            };

            let tensors = StrideTensors {
                stride,
                scores: extract(score_idx, "scores")?,
                bboxes: extract(bbox_idx, "bboxes")?,
                kps: extract(kps_idx, "kps")?,
            };
            candidates.extend(decode_stride(&tensors, self.input_side, &letterbox, SCRFD_CONFIDENCE_THRESHOLD));
        }

        tracing::trace!(candidates = candidates.len(), "SCRFD raw candidates");
        Ok(filter_clusters(nms(candidates, SCRFD_NMS_THRESHOLD), &self.config))
    }

    /// Preprocess a frame into a NCHW float tensor with letterbox padding.
    ///
    /// Grayscale input is replicated across the three channels; 3-channel
    /// input is fed in RGB order.
    fn preprocess(&self, frame: &Frame) -> (Array4<f32>, Letterbox) {
        let width = frame.width as usize;
        let height = frame.height as usize;
        let side = self.input_side;
        let letterbox = Letterbox::fit(width, height, side);

        let channels = frame.channels();
        let rgb_index: [usize; 3] = match frame.order {
            PixelOrder::Rgb8 => [0, 1, 2],
            PixelOrder::Bgr8 => [2, 1, 0],
            PixelOrder::Gray8 => [0, 0, 0],
        };

        let off_x = letterbox.pad_x.floor() as usize;
        let off_y = letterbox.pad_y.floor() as usize;
        let inv_scale = 1.0 / letterbox.scale;

        // Padding stays 0.0, i.e. SCRFD_MEAN after normalization.
        let mut tensor = Array4::<f32>::zeros((1, 3, side, side));

        for y in 0..letterbox.content_h {
            let src_y = (y as f32 + 0.5) * inv_scale - 0.5;
            for x in 0..letterbox.content_w {
                let src_x = (x as f32 + 0.5) * inv_scale - 0.5;
                for (c, &src_c) in rgb_index.iter().enumerate() {
                    let pixel = bilinear_sample(&frame.data, width, height, channels, src_c, src_x, src_y);
                    tensor[[0, c, y + off_y, x + off_x]] = (pixel - SCRFD_MEAN) / SCRFD_STD;
                }
            }
        }

        (tensor, letterbox)
    }
}

impl FaceLocator for FaceDetector {
    /// Run detection on the grayscale derivation of the frame.
    fn locate(&mut self, frame: &Frame) -> Result<Vec<FaceBox>, DetectorError> {
        let gray = frame.to_grayscale();
        self.detect(&gray)
    }
}

/// Bilinear sample of channel `c` at a fractional source position.
fn bilinear_sample(
    data: &[u8],
    width: usize,
    height: usize,
    channels: usize,
    c: usize,
    src_x: f32,
    src_y: f32,
) -> f32 {
    let y0 = (src_y.floor() as i32).clamp(0, height as i32 - 1) as usize;
    let y1 = (y0 + 1).min(height - 1);
    let fy = (src_y - src_y.floor()).clamp(0.0, 1.0);
    let x0 = (src_x.floor() as i32).clamp(0, width as i32 - 1) as usize;
    let x1 = (x0 + 1).min(width - 1);
    let fx = (src_x - src_x.floor()).clamp(0.0, 1.0);

    let at = |x: usize, y: usize| data[(y * width + x) * channels + c] as f32;

    at(x0, y0) * (1.0 - fx) * (1.0 - fy)
        + at(x1, y0) * fx * (1.0 - fy)
        + at(x0, y1) * (1.0 - fx) * fy
        + at(x1, y1) * fx * fy
}

/// Discover output tensor ordering by name.
///
/// SCRFD models may export tensors with named outputs ("score_8", "bbox_16", ...) or
/// generic numeric names. Falls back to the standard positional ordering:
///   [0-2] = scores (strides 8, 16, 32)
///   [3-5] = bboxes (strides 8, 16, 32)
///   [6-8] = kps    (strides 8, 16, 32)
fn discover_output_indices(names: &[String]) -> [StrideOutputIndices; 3] {
    let find = |prefix: &str, stride: usize| -> Option<usize> {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| n == &target)
    };

    let mut named = [(0usize, 0usize, 0usize); 3];
    for (slot, &stride) in SCRFD_STRIDES.iter().enumerate() {
        match (find("score", stride), find("bbox", stride), find("kps", stride)) {
            (Some(s), Some(b), Some(k)) => named[slot] = (s, b, k),
            _ => {
                tracing::info!(
                    ?names,
                    "SCRFD: output names not recognized, using positional mapping [0-2]=scores, [3-5]=bboxes, [6-8]=kps"
                );
                return [(0, 3, 6), (1, 4, 7), (2, 5, 8)];
            }
        }
    }

    tracing::info!("SCRFD: using name-based output tensor mapping");
    named
}

/// Decode one stride level into frame-space boxes above `threshold`.
///
/// Anchors sit on a `side / stride` grid, two per cell; box and keypoint
/// regressions are distances from the anchor in stride units.
fn decode_stride(t: &StrideTensors<'_>, side: usize, letterbox: &Letterbox, threshold: f32) -> Vec<FaceBox> {
    let cells = side / t.stride;
    let step = t.stride as f32;
    let anchors = cells * cells * SCRFD_ANCHORS_PER_CELL;

    (0..anchors.min(t.scores.len()))
        .filter(|&i| t.scores[i] > threshold)
        .filter_map(|i| {
            let cell = i / SCRFD_ANCHORS_PER_CELL;
            let anchor = ((cell % cells) as f32 * step, (cell / cells) as f32 * step);

            let d = t.bboxes.get(i * 4..i * 4 + 4)?;
            let (x1, y1) = letterbox.unmap((anchor.0 - d[0] * step, anchor.1 - d[1] * step));
            let (x2, y2) = letterbox.unmap((anchor.0 + d[2] * step, anchor.1 + d[3] * step));

            let landmarks = t.kps.get(i * 10..i * 10 + 10).map(|k| {
                std::array::from_fn(|p| {
                    letterbox.unmap((anchor.0 + k[p * 2] * step, anchor.1 + k[p * 2 + 1] * step))
                })
            });

            Some(FaceBox {
                x: x1,
                y: y1,
                width: x2 - x1,
                height: y2 - y1,
                confidence: t.scores[i],
                landmarks,
            })
        })
        .collect()
}

/// Non-Maximum Suppression, recording how many candidates each kept box absorbed.
fn nms(mut detections: Vec<FaceBox>, iou_threshold: f32) -> Vec<Cluster> {
    detections.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut keep = Vec::new();
    let mut suppressed = vec![false; detections.len()];

    for i in 0..detections.len() {
        if suppressed[i] {
            continue;
        }
        let mut neighbors = 0usize;

        for j in (i + 1)..detections.len() {
            if suppressed[j] {
                continue;
            }
            if iou(&detections[i], &detections[j]) > iou_threshold {
                suppressed[j] = true;
                neighbors += 1;
            }
        }

        keep.push(Cluster {
            face: detections[i].clone(),
            neighbors,
        });
    }

    keep
}

/// Drop clusters that are too small or too weakly supported; keep confidence order.
fn filter_clusters(clusters: Vec<Cluster>, config: &LocatorConfig) -> Vec<FaceBox> {
    clusters
        .into_iter()
        .filter(|c| c.neighbors >= config.min_neighbors)
        .map(|c| c.face)
        .filter(|f| f.width >= config.min_size && f.height >= config.min_size)
        .collect()
}

/// Compute Intersection-over-Union between two bounding boxes.
fn iou(a: &FaceBox, b: &FaceBox) -> f32 {
    let x1 = a.x.max(b.x);
    let y1 = a.y.max(b.y);
    let x2 = (a.x + a.width).min(b.x + b.width);
    let y2 = (a.y + a.height).min(b.y + b.height);

    let inter_area = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let union_area = a.width * a.height + b.width * b.height - inter_area;

    if union_area > 0.0 {
        inter_area / union_area
    } else {
        0.0
    }
}
