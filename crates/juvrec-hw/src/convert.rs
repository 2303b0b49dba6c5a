//! Raw capture buffer to [`Frame`] conversion.

use crate::camera::PixelFormat;
use juvrec_core::frame::{Frame, FrameError, PixelOrder};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConvertError {
    #[error("buffer too short: expected {expected} bytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("MJPG decode failed: {0}")]
    Decode(#[from] image::ImageError),
    #[error("frame: {0}")]
    Frame(#[from] FrameError),
}

/// Convert one dequeued buffer in `format` to a color frame.
///
/// MJPG frames take their dimensions from the decoded image; the other
/// formats use the negotiated `width`×`height`.
pub fn buffer_to_frame(
    buf: &[u8],
    format: PixelFormat,
    width: u32,
    height: u32,
    sequence: u32,
) -> Result<Frame, ConvertError> {
    let pixels = width as usize * height as usize;

    match format {
        PixelFormat::Yuyv => {
            let rgb = yuyv_to_rgb(buf, width, height)?;
            Ok(Frame::new(rgb, width, height, PixelOrder::Rgb8, sequence)?)
        }
        PixelFormat::Mjpg => {
            let decoded = image::load_from_memory_with_format(buf, image::ImageFormat::Jpeg)?.to_rgb8();
            let (w, h) = decoded.dimensions();
            Ok(Frame::new(decoded.into_raw(), w, h, PixelOrder::Rgb8, sequence)?)
        }
        PixelFormat::Rgb3 | PixelFormat::Bgr3 => {
            let expected = pixels * 3;
            if buf.len() < expected {
                return Err(ConvertError::InvalidLength {
                    expected,
                    actual: buf.len(),
                });
            }
            let order = if format == PixelFormat::Rgb3 {
                PixelOrder::Rgb8
            } else {
                PixelOrder::Bgr8
            };
            Ok(Frame::new(buf[..expected].to_vec(), width, height, order, sequence)?)
        }
    }
}

/// Convert packed YUYV (4:2:2) to interleaved RGB using BT.601 integer math.
///
/// YUYV packs two pixels per 4 bytes: [Y0, U, Y1, V]; both pixels share
/// the chroma pair.
pub fn yuyv_to_rgb(yuyv: &[u8], width: u32, height: u32) -> Result<Vec<u8>, ConvertError> {
    let expected = width as usize * height as usize * 2;
    if yuyv.len() < expected {
        return Err(ConvertError::InvalidLength {
            expected,
            actual: yuyv.len(),
        });
    }

    let mut rgb = Vec::with_capacity(expected / 2 * 3);
    for chunk in yuyv[..expected].chunks_exact(4) {
        let (y0, u, y1, v) = (chunk[0], chunk[1], chunk[2], chunk[3]);
        rgb.extend_from_slice(&ycbcr_to_rgb(y0, u, v));
        rgb.extend_from_slice(&ycbcr_to_rgb(y1, u, v));
    }
    Ok(rgb)
}

fn ycbcr_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = y as i32 - 16;
    let d = u as i32 - 128;
    let e = v as i32 - 128;
    let clamp = |x: i32| ((x + 128) >> 8).clamp(0, 255) as u8;
    [
        clamp(298 * c + 409 * e),
        clamp(298 * c - 100 * d - 208 * e),
        clamp(298 * c + 516 * d),
    ]
}
