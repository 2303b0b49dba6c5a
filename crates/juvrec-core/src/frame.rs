//! Frame type and pixel-layout helpers: grayscale derivation, channel
//! reordering, JPEG encoding.

use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;
use thiserror::Error;

const JPEG_QUALITY: u8 = 90;

/// Channel order of an 8-bit frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelOrder {
    Rgb8,
    Bgr8,
    Gray8,
}

impl PixelOrder {
    pub fn channels(self) -> usize {
        match self {
            PixelOrder::Rgb8 | PixelOrder::Bgr8 => 3,
            PixelOrder::Gray8 => 1,
        }
    }
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("invalid buffer length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("empty frame")]
    Empty,
    #[error("JPEG encoding failed: {0}")]
    Encode(#[from] image::ImageError),
}

/// A captured camera frame, row-major and tightly packed.
#[derive(Clone)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub order: PixelOrder,
    pub timestamp: std::time::Instant,
    pub sequence: u32,
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("order", &self.order)
            .field("sequence", &self.sequence)
            .finish()
    }
}

impl Frame {
    /// Wrap a pixel buffer, checking that its length matches the dimensions.
    pub fn new(
        data: Vec<u8>,
        width: u32,
        height: u32,
        order: PixelOrder,
        sequence: u32,
    ) -> Result<Self, FrameError> {
        let expected = width as usize * height as usize * order.channels();
        if data.len() != expected {
            return Err(FrameError::InvalidLength {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            data,
            width,
            height,
            order,
            timestamp: std::time::Instant::now(),
            sequence,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty() || self.width == 0 || self.height == 0
    }

    pub fn channels(&self) -> usize {
        self.order.channels()
    }

    /// Grayscale derivation using BT.601 luma weights.
    pub fn to_grayscale(&self) -> Frame {
        let data = match self.order {
            PixelOrder::Gray8 => self.data.clone(),
            PixelOrder::Rgb8 => self
                .data
                .chunks_exact(3)
                .map(|px| luma(px[0], px[1], px[2]))
                .collect(),
            PixelOrder::Bgr8 => self
                .data
                .chunks_exact(3)
                .map(|px| luma(px[2], px[1], px[0]))
                .collect(),
        };
        Frame {
            data,
            width: self.width,
            height: self.height,
            order: PixelOrder::Gray8,
            timestamp: self.timestamp,
            sequence: self.sequence,
        }
    }

    /// Reorder a 3-channel frame to RGB. Returns `None` for grayscale input.
    pub fn to_rgb(&self) -> Option<Frame> {
        let data = match self.order {
            PixelOrder::Rgb8 => self.data.clone(),
            PixelOrder::Bgr8 => self
                .data
                .chunks_exact(3)
                .flat_map(|px| [px[2], px[1], px[0]])
                .collect(),
            PixelOrder::Gray8 => return None,
        };
        Some(Frame {
            data,
            width: self.width,
            height: self.height,
            order: PixelOrder::Rgb8,
            timestamp: self.timestamp,
            sequence: self.sequence,
        })
    }

    /// Encode the frame as JPEG for storage alongside its embedding.
    pub fn encode_jpeg(&self) -> Result<Vec<u8>, FrameError> {
        if self.is_empty() {
            return Err(FrameError::Empty);
        }
        let (pixels, color) = match self.order {
            PixelOrder::Gray8 => (self.data.clone(), ExtendedColorType::L8),
            PixelOrder::Rgb8 | PixelOrder::Bgr8 => {
                // to_rgb only declines grayscale, handled above.
                let rgb = self.to_rgb().map(|f| f.data).unwrap_or_default();
                (rgb, ExtendedColorType::Rgb8)
            }
        };
        let mut out = Vec::new();
        JpegEncoder::new_with_quality(&mut out, JPEG_QUALITY).encode(
            &pixels,
            self.width,
            self.height,
            color,
        )?;
        Ok(out)
    }
}

fn luma(r: u8, g: u8, b: u8) -> u8 {
    (0.299 * r as f32 + 0.587 * g as f32 + 0.114 * b as f32)
        .round()
        .clamp(0.0, 255.0) as u8
}
