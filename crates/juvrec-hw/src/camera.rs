//! V4L2 camera capture via the `v4l` crate.

use crate::convert;
use juvrec_core::frame::Frame;
use juvrec_core::source::{CameraError, FrameSource};
use std::path::Path;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::FourCC;

const STREAM_BUFFERS: u32 = 4;

/// Which devices to try and what to ask them for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraConfig {
    /// `/dev/videoN` indices, tried in order until one delivers a frame.
    pub indices: Vec<usize>,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            indices: vec![1, 2, 0],
            width: 640,
            height: 480,
            fps: 30,
        }
    }
}

/// Info about a discovered V4L2 device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub index: usize,
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

/// Negotiated pixel format for the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUYV 4:2:2 packed, converted to RGB.
    Yuyv,
    /// Motion JPEG, decoded per frame.
    Mjpg,
    /// Packed 24-bit RGB.
    Rgb3,
    /// Packed 24-bit BGR.
    Bgr3,
}

impl PixelFormat {
    fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        match &fourcc.repr {
            b"YUYV" => Some(PixelFormat::Yuyv),
            b"MJPG" => Some(PixelFormat::Mjpg),
            b"RGB3" => Some(PixelFormat::Rgb3),
            b"BGR3" => Some(PixelFormat::Bgr3),
            _ => None,
        }
    }
}

struct OpenDevice {
    // Dropped before `device` so buffers are unmapped first.
    stream: MmapStream<'static>,
    device: Device,
    index: usize,
    width: u32,
    height: u32,
    format: PixelFormat,
}

/// A V4L2 camera that opens lazily on [`FrameSource::open`] and releases
/// the device on [`FrameSource::close`].
pub struct Camera {
    config: CameraConfig,
    open: Option<OpenDevice>,
}

impl Camera {
    pub fn new(config: CameraConfig) -> Self {
        Self { config, open: None }
    }

    pub fn config(&self) -> &CameraConfig {
        &self.config
    }

    /// Index of the device currently streaming, if any.
    pub fn active_index(&self) -> Option<usize> {
        self.open.as_ref().map(|d| d.index)
    }

    pub fn pixel_format(&self) -> Option<PixelFormat> {
        self.open.as_ref().map(|d| d.format)
    }

    fn open_index(&self, index: usize) -> Result<OpenDevice, CameraError> {
        let device_path = format!("/dev/video{index}");
        if !Path::new(&device_path).exists() {
            return Err(CameraError::DeviceNotFound(device_path));
        }

        let device = Device::new(index).map_err(|e| {
            if e.to_string().contains("busy") || e.to_string().contains("EBUSY") {
                CameraError::DeviceBusy
            } else {
                CameraError::DeviceNotFound(format!("{device_path}: {e}"))
            }
        })?;

        let caps = device.query_caps().map_err(|e| {
            CameraError::CaptureFailed(format!("failed to query capabilities: {e}"))
        })?;
        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Err(CameraError::FormatNegotiationFailed(format!(
                "{device_path} is not a video capture device"
            )));
        }

        let mut fmt = device.format().map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to get format: {e}"))
        })?;
        fmt.fourcc = FourCC::new(b"YUYV");
        fmt.width = self.config.width;
        fmt.height = self.config.height;

        let negotiated = device.set_format(&fmt).map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to set format: {e}"))
        })?;

        let format = PixelFormat::from_fourcc(negotiated.fourcc).ok_or_else(|| {
            CameraError::FormatNegotiationFailed(format!(
                "unsupported pixel format: {:?} (need YUYV, MJPG, RGB3 or BGR3)",
                negotiated.fourcc
            ))
        })?;

        // Frame rate is a request; drivers may round or ignore it.
        if let Err(e) = device.set_params(&Parameters::with_fps(self.config.fps)) {
            tracing::warn!(device = %device_path, fps = self.config.fps, error = %e, "could not set frame rate");
        }

        let stream = MmapStream::with_buffers(&device, BufType::VideoCapture, STREAM_BUFFERS)
            .map_err(|e| CameraError::CaptureFailed(format!("failed to create mmap stream: {e}")))?;

        tracing::info!(
            device = %device_path,
            driver = %caps.driver,
            card = %caps.card,
            width = negotiated.width,
            height = negotiated.height,
            format = ?format,
            "opened camera"
        );

        Ok(OpenDevice {
            stream,
            device,
            index,
            width: negotiated.width,
            height: negotiated.height,
            format,
        })
    }

    /// List available V4L2 video capture devices.
    pub fn list_devices() -> Vec<DeviceInfo> {
        let mut devices = Vec::new();

        for index in 0..16 {
            let path = format!("/dev/video{index}");
            if !Path::new(&path).exists() {
                continue;
            }
            let Ok(dev) = Device::new(index) else {
                continue;
            };
            let Ok(caps) = dev.query_caps() else {
                continue;
            };
            if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
                continue;
            }
            devices.push(DeviceInfo {
                index,
                path,
                name: caps.card.clone(),
                driver: caps.driver.clone(),
                bus: caps.bus.clone(),
            });
        }

        devices
    }
}

fn read_from(dev: &mut OpenDevice) -> Result<Frame, CameraError> {
    let (buf, meta) = dev
        .stream
        .next()
        .map_err(|e| CameraError::CaptureFailed(format!("failed to dequeue buffer: {e}")))?;

    convert::buffer_to_frame(buf, dev.format, dev.width, dev.height, meta.sequence)
        .map_err(|e| CameraError::CaptureFailed(e.to_string()))
}

impl FrameSource for Camera {
    /// Try each configured index in order; the first device that opens and
    /// delivers a trial frame wins.
    fn open(&mut self) -> Result<(), CameraError> {
        if self.open.is_some() {
            return Ok(());
        }

        for &index in &self.config.indices {
            let mut dev = match self.open_index(index) {
                Ok(dev) => dev,
                Err(e) => {
                    tracing::debug!(index, error = %e, "camera index unusable");
                    continue;
                }
            };

            match read_from(&mut dev) {
                Ok(_) => {
                    tracing::info!(index, "camera ready");
                    self.open = Some(dev);
                    return Ok(());
                }
                Err(e) => tracing::warn!(index, error = %e, "camera opened but trial read failed"),
            }
        }

        Err(CameraError::NoCameraAvailable {
            tried: self.config.indices.clone(),
        })
    }

    fn read_frame(&mut self) -> Result<Frame, CameraError> {
        let dev = self.open.as_mut().ok_or(CameraError::NotOpen)?;
        read_from(dev)
    }

    fn close(&mut self) {
        if let Some(dev) = self.open.take() {
            tracing::info!(index = dev.index, "released camera");
            drop(dev.stream);
            drop(dev.device);
        }
    }

    fn is_open(&self) -> bool {
        self.open.is_some()
    }
}

impl Drop for Camera {
    fn drop(&mut self) {
        self.close();
    }
}
