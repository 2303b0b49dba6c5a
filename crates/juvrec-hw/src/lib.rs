//! juvrec-hw: V4L2 camera access behind the core frame source contract.
//!
//! Probes a preference-ordered list of device indices, negotiates a capture
//! format and converts raw buffers into core [`juvrec_core::Frame`]s.

pub mod camera;
pub mod convert;

pub use camera::{Camera, CameraConfig, DeviceInfo, PixelFormat};
pub use convert::ConvertError;
