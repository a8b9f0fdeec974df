//! V4L2 capture device with memory-mapped driver buffers

use tracing::{debug, info, instrument};
use v4l::buffer::Type;
use v4l::capability::Flags as CapFlags;
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::{Device, FourCC, Fraction};

use crate::capture::decoder;
use crate::capture::device::{CaptureDevice, CaptureError, DeviceProperties, Property};
use crate::capture::frame::{Frame, PixelFormat};

/// A V4L2 node streaming through mmap'd driver buffers.
///
/// The stream is created lazily on the first read and torn down whenever a
/// property change requires the driver to reallocate its buffers.
pub struct V4l2Device {
    name: String,
    device: Device,
    stream: Option<MmapStream<'static>>,
    format: PixelFormat,
    buffer_count: u32,
    width: u32,
    height: u32,
    fps: u32,
}

impl V4l2Device {
    /// Open a device by index (`"0"`) or path (`"/dev/video0"`) and negotiate
    /// the preferred pixel format.
    pub fn open(
        device_id: &str,
        format: PixelFormat,
        buffer_count: u32,
    ) -> Result<Self, CaptureError> {
        info!("Opening V4L2 device {}", device_id);

        let device = match device_id.parse::<usize>() {
            Ok(index) => Device::new(index),
            Err(_) => Device::with_path(device_id),
        }
        .map_err(|e| CaptureError::unavailable(device_id, e))?;

        let caps = device
            .query_caps()
            .map_err(|e| CaptureError::unavailable(device_id, e))?;
        info!("Device: {} ({})", caps.card, caps.driver);

        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            return Err(CaptureError::unavailable(
                device_id,
                "device doesn't support video capture",
            ));
        }

        let mut fmt = device
            .format()
            .map_err(|e| CaptureError::unavailable(device_id, e))?;
        fmt.fourcc = fourcc(format);
        let actual = device
            .set_format(&fmt)
            .map_err(|e| CaptureError::unavailable(device_id, e))?;
        let negotiated = pixel_format(actual.fourcc).ok_or_else(|| {
            CaptureError::unavailable(
                device_id,
                format!("driver settled on unsupported fourcc {}", actual.fourcc),
            )
        })?;
        if negotiated != format {
            info!("Requested {:?}, driver chose {:?}", format, negotiated);
        }

        let fps = device
            .params()
            .map(|p| fps_of(p.interval))
            .unwrap_or_default();

        Ok(Self {
            name: device_id.to_string(),
            device,
            stream: None,
            format: negotiated,
            buffer_count: buffer_count.max(1),
            width: actual.width,
            height: actual.height,
            fps,
        })
    }

    fn set_size(
        &mut self,
        property: Property,
        width: Option<u32>,
        height: Option<u32>,
    ) -> Result<(), CaptureError> {
        // Buffers are sized at allocation time; drop them before renegotiating
        self.stream = None;

        let rejected = |reason: String| CaptureError::PropertyRejected { property, reason };

        let mut fmt = self.device.format().map_err(|e| rejected(e.to_string()))?;
        if let Some(w) = width {
            fmt.width = w;
        }
        if let Some(h) = height {
            fmt.height = h;
        }

        let actual = self
            .device
            .set_format(&fmt)
            .map_err(|e| rejected(e.to_string()))?;
        self.width = actual.width;
        self.height = actual.height;

        if width.is_some_and(|w| w != actual.width) || height.is_some_and(|h| h != actual.height) {
            return Err(rejected(format!(
                "driver chose {}x{}",
                actual.width, actual.height
            )));
        }
        Ok(())
    }
}

impl CaptureDevice for V4l2Device {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip(self), fields(device = %self.name))]
    fn apply(&mut self, property: Property) -> Result<(), CaptureError> {
        match property {
            Property::Width(w) => self.set_size(property, Some(w), None),
            Property::Height(h) => self.set_size(property, None, Some(h)),
            Property::Fps(fps) => {
                let params = self
                    .device
                    .set_params(&Parameters::with_fps(fps))
                    .map_err(|e| CaptureError::PropertyRejected {
                        property,
                        reason: e.to_string(),
                    })?;
                self.fps = fps_of(params.interval);
                if self.fps != fps {
                    return Err(CaptureError::PropertyRejected {
                        property,
                        reason: format!("driver chose {} fps", self.fps),
                    });
                }
                Ok(())
            }
        }
    }

    fn properties(&self) -> DeviceProperties {
        DeviceProperties {
            width: self.width,
            height: self.height,
            fps: self.fps,
        }
    }

    fn read_frame(&mut self) -> Result<Frame, CaptureError> {
        if self.stream.is_none() {
            let stream =
                MmapStream::with_buffers(&self.device, Type::VideoCapture, self.buffer_count)
                    .map_err(|e| CaptureError::ReadFailure(e.to_string()))?;
            debug!(
                "Capture stream started with {} buffers",
                self.buffer_count
            );
            self.stream = Some(stream);
        }

        let (format, width, height) = (self.format, self.width, self.height);
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| CaptureError::ReadFailure("stream not started".into()))?;

        let (buf, meta) = stream
            .next()
            .map_err(|e| CaptureError::ReadFailure(e.to_string()))?;

        let used = match meta.bytesused as usize {
            0 => buf.len(),
            n => n.min(buf.len()),
        };

        decoder::decode_frame(&buf[..used], format, width, height)
            .map_err(|e| CaptureError::ReadFailure(e.to_string()))
    }
}

fn fourcc(format: PixelFormat) -> FourCC {
    match format {
        PixelFormat::Mjpeg => FourCC::new(b"MJPG"),
        PixelFormat::Yuyv4 => FourCC::new(b"YUYV"),
        PixelFormat::Bgr24 => FourCC::new(b"BGR3"),
        PixelFormat::Rgb24 => FourCC::new(b"RGB3"),
    }
}

pub(crate) fn pixel_format(fourcc: FourCC) -> Option<PixelFormat> {
    match &fourcc.repr {
        b"MJPG" => Some(PixelFormat::Mjpeg),
        b"YUYV" => Some(PixelFormat::Yuyv4),
        b"BGR3" => Some(PixelFormat::Bgr24),
        b"RGB3" => Some(PixelFormat::Rgb24),
        _ => None,
    }
}

fn fps_of(interval: Fraction) -> u32 {
    if interval.numerator == 0 {
        return 0;
    }
    interval.denominator / interval.numerator
}
