//! rollcall-hw — Camera capture for the attendance monitor.
//!
//! Provides V4L2-based frame acquisition and grayscale conversion.

pub mod camera;
pub mod frame;

pub use camera::{Camera, CameraError, DeviceInfo, PixelFormat};
pub use frame::Frame;
