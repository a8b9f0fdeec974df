use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use v4l::{capability::Flags, video::Capture, Device};

use crate::capture::frame::PixelFormat;
use crate::capture::v4l2;

// Detected capture device info
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FoundDevice {
    pub path: String,
    pub format: PixelFormat,
}

/// Auto-detect the first usable capture device, preferring MJPEG over raw formats.
pub fn auto_detect_device() -> Option<FoundDevice> {
    info!("Auto-detecting capture devices...");

    (0..10)
        .map(|i| format!("/dev/video{}", i))
        .filter(|path| Path::new(path).exists())
        .find_map(|path| probe(&path).map(|format| FoundDevice { path, format }))
}

fn probe(path: &str) -> Option<PixelFormat> {
    let dev = Device::with_path(path).ok()?;
    let caps = dev.query_caps().ok()?;
    if !caps.capabilities.contains(Flags::VIDEO_CAPTURE) {
        debug!("{} is not a capture node", path);
        return None;
    }

    let formats: Vec<PixelFormat> = dev
        .enum_formats()
        .ok()?
        .into_iter()
        .filter_map(|fmt| v4l2::pixel_format(fmt.fourcc))
        .collect();

    let best = preferred(&formats)?;
    info!("Found {:?} device: {} - {}", best, path, caps.card);
    Some(best)
}

fn preferred(formats: &[PixelFormat]) -> Option<PixelFormat> {
    [
        PixelFormat::Mjpeg,
        PixelFormat::Yuyv4,
        PixelFormat::Bgr24,
        PixelFormat::Rgb24,
    ]
    .into_iter()
    .find(|f| formats.contains(f))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mjpeg_wins_over_raw() {
        assert_eq!(
            preferred(&[PixelFormat::Yuyv4, PixelFormat::Mjpeg]),
            Some(PixelFormat::Mjpeg)
        );
        assert_eq!(preferred(&[PixelFormat::Rgb24]), Some(PixelFormat::Rgb24));
        assert_eq!(preferred(&[]), None);
    }
}
