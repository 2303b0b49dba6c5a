use crate::frame::Frame;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("no working camera among indices {tried:?}")]
    NoCameraAvailable { tried: Vec<usize> },
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("device busy")]
    DeviceBusy,
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("camera is not open")]
    NotOpen,
}

/// A camera producing frames for one scan session at a time.
///
/// `read_frame` errors are transient: the caller skips the tick and tries
/// again on the next one. `close` must be safe to call repeatedly.
pub trait FrameSource {
    fn open(&mut self) -> Result<(), CameraError>;
    fn read_frame(&mut self) -> Result<Frame, CameraError>;
    fn close(&mut self);
    fn is_open(&self) -> bool;
}
