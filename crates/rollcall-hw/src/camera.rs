//! V4L2 classroom camera capture via the `v4l` crate.

use crate::frame::{self, Frame};
use rollcall_core::FrameSource;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

/// Fraction of near-black pixels above which a frame counts as dark.
const DARK_FRAME_THRESHOLD: f32 = 0.95;

const STREAM_BUFFERS: u32 = 4;

/// A dequeue that takes longer than this counts as a failed read.
const CAPTURE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("device busy")]
    DeviceBusy,
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("video capture not supported")]
    CaptureNotSupported,
}

/// Info about a discovered V4L2 device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

/// Negotiated pixel format for the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUYV 4:2:2 packed (most USB webcams).
    Yuyv,
    /// 8-bit grayscale.
    Grey,
    /// 16-bit little-endian grayscale.
    Y16,
}

impl PixelFormat {
    fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        if fourcc == FourCC::new(b"YUYV") {
            Some(Self::Yuyv)
        } else if fourcc == FourCC::new(b"GREY") {
            Some(Self::Grey)
        } else if fourcc == FourCC::new(b"Y16 ") {
            Some(Self::Y16)
        } else {
            None
        }
    }

    /// Convert one raw buffer in this format to 8-bit grayscale.
    pub fn to_grayscale(self, buf: &[u8], width: u32, height: u32) -> Result<Vec<u8>, CameraError> {
        let pixels = (width * height) as usize;
        let converted = match self {
            PixelFormat::Grey => {
                if buf.len() < pixels {
                    return Err(CameraError::CaptureFailed(format!(
                        "GREY buffer too short: expected {pixels}, got {}",
                        buf.len()
                    )));
                }
                return Ok(buf[..pixels].to_vec());
            }
            PixelFormat::Y16 => frame::y16_to_grayscale(buf, width, height),
            PixelFormat::Yuyv => frame::yuyv_to_grayscale(buf, width, height),
        };
        converted.map_err(|e| CameraError::CaptureFailed(e.to_string()))
    }
}

/// A capture stream kept open across frames.
///
/// Started on first use. A failed read drops it, so the next read starts
/// a fresh one.
struct LiveStream<S> {
    current: Option<S>,
    starts: u64,
}

impl<S> LiveStream<S> {
    fn new() -> Self {
        Self {
            current: None,
            starts: 0,
        }
    }

    fn read<T, E>(
        &mut self,
        start: impl FnOnce() -> Result<S, E>,
        read: impl FnOnce(&mut S) -> Result<T, E>,
    ) -> Result<T, E> {
        let mut stream = match self.current.take() {
            Some(stream) => stream,
            None => {
                let stream = start()?;
                self.starts += 1;
                stream
            }
        };
        let result = read(&mut stream);
        if result.is_ok() {
            self.current = Some(stream);
        }
        result
    }
}

/// V4L2 camera handle. The device is closed when the value is dropped.
pub struct Camera {
    // Declared before `device` so streaming stops before the fd closes.
    stream: LiveStream<MmapStream<'static>>,
    device: Device,
    pub width: u32,
    pub height: u32,
    pub device_path: String,
    pub fourcc: FourCC,
    pixel_format: PixelFormat,
}

impl Camera {
    /// Open a V4L2 device (e.g. "/dev/video0") and request `width`x`height` YUYV.
    pub fn open(device_path: &str, width: u32, height: u32) -> Result<Self, CameraError> {
        if !Path::new(device_path).exists() {
            return Err(CameraError::DeviceNotFound(device_path.to_string()));
        }

        let device = Device::with_path(device_path).map_err(|e| {
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
            return Err(CameraError::CaptureNotSupported);
        }

        let mut fmt = device.format().map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to get format: {e}"))
        })?;
        fmt.fourcc = FourCC::new(b"YUYV");
        fmt.width = width;
        fmt.height = height;

        let negotiated = device.set_format(&fmt).map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to set format: {e}"))
        })?;

        let fourcc = negotiated.fourcc;
        let pixel_format = PixelFormat::from_fourcc(fourcc).ok_or_else(|| {
            CameraError::FormatNegotiationFailed(format!(
                "unsupported pixel format: {fourcc:?} (need YUYV, GREY, or Y16)"
            ))
        })?;

        tracing::info!(
            device = device_path,
            card = %caps.card,
            width = negotiated.width,
            height = negotiated.height,
            fourcc = ?fourcc,
            "camera opened"
        );

        Ok(Self {
            stream: LiveStream::new(),
            device,
            width: negotiated.width,
            height: negotiated.height,
            device_path: device_path.to_string(),
            fourcc,
            pixel_format,
        })
    }

    /// Capture the next grayscale frame.
    ///
    /// The mmap stream stays open between calls; it is only re-created
    /// after a failed read.
    pub fn capture_frame(&mut self) -> Result<Frame, CameraError> {
        let (format, width, height) = (self.pixel_format, self.width, self.height);
        let device = &self.device;
        let device_path = &self.device_path;

        self.stream.read(
            || -> Result<MmapStream<'static>, CameraError> {
                let mut stream =
                    MmapStream::with_buffers(device, BufType::VideoCapture, STREAM_BUFFERS)
                        .map_err(|e| {
                            CameraError::CaptureFailed(format!("failed to create mmap stream: {e}"))
                        })?;
                stream.set_timeout(CAPTURE_TIMEOUT);
                tracing::debug!(device = %device_path, buffers = STREAM_BUFFERS, "capture stream started");
                Ok(stream)
            },
            |stream| -> Result<Frame, CameraError> {
                let (buf, meta) = stream.next().map_err(|e| {
                    CameraError::CaptureFailed(format!("failed to dequeue buffer: {e}"))
                })?;
                let gray = format.to_grayscale(buf, width, height)?;
                let is_dark = frame::is_dark_frame(&gray, DARK_FRAME_THRESHOLD);
                Ok(Frame {
                    data: gray,
                    width,
                    height,
                    timestamp: std::time::Instant::now(),
                    sequence: meta.sequence,
                    is_dark,
                })
            },
        )
    }

    /// Discard `count` frames while auto-exposure settles.
    pub fn warmup(&mut self, count: usize) {
        if count == 0 {
            return;
        }
        tracing::info!(count, "discarding warmup frames");
        for _ in 0..count {
            if let Err(e) = self.capture_frame() {
                tracing::debug!(error = %e, "warmup capture failed");
            }
        }
    }

    /// List available V4L2 video capture devices.
    pub fn list_devices() -> Vec<DeviceInfo> {
        let mut devices = Vec::new();

        for i in 0..16 {
            let path = format!("/dev/video{i}");
            if !Path::new(&path).exists() {
                continue;
            }
            let Ok(dev) = Device::with_path(&path) else {
                continue;
            };
            let Ok(caps) = dev.query_caps() else {
                continue;
            };
            if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
                continue;
            }
            devices.push(DeviceInfo {
                path,
                name: caps.card.clone(),
                driver: caps.driver.clone(),
                bus: caps.bus.clone(),
            });
        }

        devices
    }
}

impl FrameSource for Camera {
    type Frame = Frame;
    type Error = CameraError;

    fn acquire_frame(&mut self) -> Result<Frame, CameraError> {
        self.capture_frame()
    }
}

impl Drop for Camera {
    fn drop(&mut self) {
        tracing::info!(
            device = %self.device_path,
            streams = self.stream.starts,
            "camera released"
        );
    }
}
