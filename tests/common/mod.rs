#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use framebridge::capture::{CaptureDevice, CaptureError, DeviceProperties, Frame, Property};

/// Knobs a test flips while the capture thread owns the device.
#[derive(Clone, Default)]
pub struct Script {
    pub reads: Arc<AtomicU64>,
    /// Every read fails while set
    pub failing: Arc<AtomicBool>,
    /// Set when the device is dropped by the capture thread
    pub released: Arc<AtomicBool>,
}

/// Test double producing small frames whose first byte is the read count.
pub struct ScriptedDevice {
    script: Script,
    width: u32,
    height: u32,
    frame_delay: Duration,
    fail_priming: bool,
}

impl ScriptedDevice {
    pub fn new(script: &Script) -> Self {
        Self {
            script: script.clone(),
            width: 32,
            height: 24,
            frame_delay: Duration::from_millis(2),
            fail_priming: false,
        }
    }

    /// Every read, including the priming one, takes `frame_delay`.
    pub fn slow(script: &Script, frame_delay: Duration) -> Self {
        let mut device = Self::new(script);
        device.frame_delay = frame_delay;
        device
    }

    pub fn dead(script: &Script) -> Self {
        let mut device = Self::new(script);
        device.fail_priming = true;
        device
    }
}

impl CaptureDevice for ScriptedDevice {
    fn name(&self) -> &str {
        "scripted"
    }

    fn apply(&mut self, property: Property) -> Result<(), CaptureError> {
        match property {
            Property::Width(w) if w <= 64 => {
                self.width = w;
                Ok(())
            }
            Property::Height(h) if h <= 64 => {
                self.height = h;
                Ok(())
            }
            _ => Err(CaptureError::PropertyRejected {
                property,
                reason: "unsupported".into(),
            }),
        }
    }

    fn properties(&self) -> DeviceProperties {
        DeviceProperties {
            width: self.width,
            height: self.height,
            fps: 30,
        }
    }

    fn read_frame(&mut self) -> Result<Frame, CaptureError> {
        let n = self.script.reads.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_priming || self.script.failing.load(Ordering::SeqCst) {
            thread::sleep(self.frame_delay);
            return Err(CaptureError::ReadFailure("scripted failure".into()));
        }
        thread::sleep(self.frame_delay);
        Ok(Frame::filled(self.width, self.height, [n as u8, 64, 128]))
    }
}

impl Drop for ScriptedDevice {
    fn drop(&mut self) {
        self.script.released.store(true, Ordering::SeqCst);
    }
}

/// Gradient raster with enough structure to be a realistic encode.
pub fn gradient(width: u32, height: u32) -> Frame {
    let mut data = Vec::with_capacity((width * height * 3) as usize);
    for y in 0..height {
        for x in 0..width {
            data.push((x % 256) as u8);
            data.push((y % 256) as u8);
            data.push(((x + y) % 256) as u8);
        }
    }
    Frame::from_bgr(width, height, data).unwrap()
}

/// Pseudo-random raster that JPEG cannot compress well.
pub fn noise(width: u32, height: u32) -> Frame {
    let mut state: u32 = 0x1234_5678;
    let data = (0..width * height * 3)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            state as u8
        })
        .collect();
    Frame::from_bgr(width, height, data).unwrap()
}
