//! rollcall-hw — V4L2 camera capture for rollcall.
//!
//! Opens a capture device, negotiates a grayscale-convertible format and
//! streams frames as 8-bit grayscale.

pub mod camera;
pub mod frame;

pub use camera::{Camera, CameraError, DeviceInfo, FrameStream, PixelFormat};
pub use frame::{Frame, FrameError};
