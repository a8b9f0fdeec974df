use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::frame::Frame;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("capture device {device} unavailable: {reason}")]
    DeviceUnavailable { device: String, reason: String },

    #[error("frame read failed: {0}")]
    ReadFailure(String),

    #[error("device rejected {property:?}: {reason}")]
    PropertyRejected { property: Property, reason: String },

    #[error("failed to spawn capture thread: {0}")]
    Spawn(#[from] std::io::Error),
}

impl CaptureError {
    pub fn unavailable(device: impl Into<String>, reason: impl ToString) -> Self {
        Self::DeviceUnavailable {
            device: device.into(),
            reason: reason.to_string(),
        }
    }
}

/// A single configurable stream property.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Property {
    Width(u32),
    Height(u32),
    Fps(u32),
}

/// Requested stream properties. Every field is advisory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureRequest {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub fps: Option<u32>,
}

impl CaptureRequest {
    pub fn properties(&self) -> impl Iterator<Item = Property> {
        [
            self.width.map(Property::Width),
            self.height.map(Property::Height),
            self.fps.map(Property::Fps),
        ]
        .into_iter()
        .flatten()
    }
}

/// Stream properties as negotiated with the driver.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceProperties {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

/// A frame producer the capture thread can own.
pub trait CaptureDevice: Send + 'static {
    /// Human-readable identifier used in logs and errors.
    fn name(&self) -> &str;

    /// Apply one property. Rejection is reported, never fatal to the caller.
    fn apply(&mut self, property: Property) -> Result<(), CaptureError>;

    /// Read back what the driver actually settled on.
    fn properties(&self) -> DeviceProperties;

    /// Block until the next frame is available.
    fn read_frame(&mut self) -> Result<Frame, CaptureError>;
}
