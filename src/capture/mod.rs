pub mod decoder;
pub mod device;
pub mod frame;
pub mod source;
pub mod v4l2;

pub use device::{CaptureDevice, CaptureError, CaptureRequest, DeviceProperties, Property};
pub use frame::{Frame, PixelFormat, CHANNELS};
pub use source::{CaptureSource, CaptureStats, LatestFrame, SourceOptions};
pub use v4l2::V4l2Device;
