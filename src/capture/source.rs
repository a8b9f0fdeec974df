//! Threaded capture source publishing the newest frame into a swap slot.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use crossbeam::utils::CachePadded;
use tracing::{debug, error, info, warn};

use crate::capture::device::{CaptureDevice, CaptureError, CaptureRequest, DeviceProperties};
use crate::capture::frame::{Frame, PixelFormat};
use crate::capture::v4l2::V4l2Device;
use crate::CaptureConfig;

const DEFAULT_BUFFER_COUNT: u32 = 4;

/// Tuning for the background capture loop.
#[derive(Debug, Clone)]
pub struct SourceOptions {
    /// Pause after a failed read before trying again
    pub retry_delay: Duration,
    /// Upper bound on how long `close` waits for the thread
    pub join_timeout: Duration,
    /// Consecutive failed reads treated as a disconnect
    pub disconnect_after: u32,
    pub cpu_affinity: Option<usize>,
}

impl Default for SourceOptions {
    fn default() -> Self {
        Self {
            retry_delay: Duration::from_millis(10),
            join_timeout: Duration::from_secs(1),
            disconnect_after: 100,
            cpu_affinity: None,
        }
    }
}

impl From<&CaptureConfig> for SourceOptions {
    fn from(config: &CaptureConfig) -> Self {
        Self {
            retry_delay: Duration::from_millis(config.retry_delay_ms),
            join_timeout: Duration::from_millis(config.join_timeout_ms),
            disconnect_after: config.disconnect_after.max(1),
            cpu_affinity: config.cpu_affinity,
        }
    }
}

/// Counters shared with the capture thread.
#[derive(Default)]
struct Counters {
    frames: AtomicU64,
    read_failures: AtomicU64,
    disconnected: AtomicBool,
}

/// Point-in-time view of the capture counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureStats {
    pub frames: u64,
    pub read_failures: u64,
    pub disconnected: bool,
}

/// Cloneable, copy-on-read handle to the latest-frame slot.
#[derive(Clone)]
pub struct LatestFrame {
    slot: Arc<ArcSwapOption<Frame>>,
    closed: Arc<AtomicBool>,
}

impl LatestFrame {
    fn new() -> Self {
        Self {
            slot: Arc::new(ArcSwapOption::empty()),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Copy of the newest frame, or `None` before the first grab or after close.
    pub fn read(&self) -> Option<Frame> {
        if self.closed.load(Ordering::Acquire) {
            return None;
        }
        self.slot.load().as_deref().cloned()
    }

    /// Sequence number of the newest frame without copying its pixels.
    pub fn sequence(&self) -> Option<u64> {
        if self.closed.load(Ordering::Acquire) {
            return None;
        }
        self.slot.load().as_ref().map(|f| f.sequence)
    }

    fn publish(&self, frame: Frame) {
        self.slot.store(Some(Arc::new(frame)));
    }

    fn shut(&self) {
        self.closed.store(true, Ordering::Release);
        self.slot.store(None);
    }
}

struct Worker {
    handle: JoinHandle<()>,
    exited: flume::Receiver<()>,
}

/// Cleared by the capture thread itself, after the device has been dropped.
struct Alive(Arc<AtomicBool>);

impl Drop for Alive {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// A camera with one background thread continuously grabbing frames.
///
/// The thread is the only writer of the latest-frame slot; everyone else
/// reads through [`CaptureSource::read_latest`] or a [`LatestFrame`] handle,
/// both of which return an independent copy.
pub struct CaptureSource {
    name: String,
    latest: LatestFrame,
    stop: Arc<AtomicBool>,
    counters: Arc<CachePadded<Counters>>,
    properties: DeviceProperties,
    join_timeout: Duration,
    alive: Arc<AtomicBool>,
    worker: Option<Worker>,
}

impl CaptureSource {
    /// Open a V4L2 device by index or path with default tuning.
    pub fn open(device_id: &str, request: CaptureRequest) -> Result<Self, CaptureError> {
        let device = V4l2Device::open(device_id, PixelFormat::Mjpeg, DEFAULT_BUFFER_COUNT)?;
        Self::start(device, request, SourceOptions::default())
    }

    /// Open the V4L2 device described by `config` and start capturing from it.
    pub fn from_config(config: &CaptureConfig) -> Result<Self, CaptureError> {
        let device = V4l2Device::open(&config.device, config.format, config.buffer_count)?;
        let request = CaptureRequest {
            width: config.width,
            height: config.height,
            fps: config.fps,
        };
        Self::start(device, request, SourceOptions::from(config))
    }

    /// Configure `device`, prime it with one synchronous read, then hand it
    /// to a dedicated capture thread.
    pub fn start<D: CaptureDevice>(
        mut device: D,
        request: CaptureRequest,
        options: SourceOptions,
    ) -> Result<Self, CaptureError> {
        let name = device.name().to_string();

        for property in request.properties() {
            if let Err(e) = device.apply(property) {
                warn!("Ignoring property on {}: {}", name, e);
            }
        }

        let first = device
            .read_frame()
            .map_err(|e| CaptureError::unavailable(&name, format!("priming read failed: {e}")))?;

        let properties = device.properties();
        info!(
            "Camera {} resolution: {}x{} @ {}fps",
            name, properties.width, properties.height, properties.fps
        );

        let latest = LatestFrame::new();
        latest.publish(first.with_sequence(1));

        let stop = Arc::new(AtomicBool::new(false));
        let counters = Arc::new(CachePadded::new(Counters::default()));
        counters.frames.store(1, Ordering::Relaxed);

        let alive = Arc::new(AtomicBool::new(true));
        let (exit_tx, exited) = flume::bounded(1);
        let handle = {
            let latest = latest.clone();
            let stop = Arc::clone(&stop);
            let counters = Arc::clone(&counters);
            let options = options.clone();
            let guard = Alive(Arc::clone(&alive));
            thread::Builder::new()
                .name(format!("capture-{name}"))
                .spawn(move || {
                    capture_loop(device, &latest, &stop, &counters, &options);
                    drop(guard);
                    let _ = exit_tx.send(());
                })?
        };

        info!("Camera {} started (threaded)", name);

        Ok(Self {
            name,
            latest,
            stop,
            counters,
            properties,
            join_timeout: options.join_timeout,
            alive,
            worker: Some(Worker { handle, exited }),
        })
    }

    /// Independent copy of the most recently captured frame.
    pub fn read_latest(&self) -> Option<Frame> {
        self.latest.read()
    }

    /// A handle other tasks can poll without borrowing the source.
    pub fn latest(&self) -> LatestFrame {
        self.latest.clone()
    }

    /// Properties the driver negotiated at open time.
    pub fn properties(&self) -> DeviceProperties {
        self.properties
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the capture thread is still alive, including one that was
    /// detached because it outlived the close timeout.
    pub fn is_running(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> CaptureStats {
        CaptureStats {
            frames: self.counters.frames.load(Ordering::Relaxed),
            read_failures: self.counters.read_failures.load(Ordering::Relaxed),
            disconnected: self.counters.disconnected.load(Ordering::Relaxed),
        }
    }

    /// Stop the capture thread and release the device. Idempotent.
    pub fn close(&mut self) {
        self.stop.store(true, Ordering::Release);
        self.latest.shut();

        let Some(worker) = self.worker.take() else {
            return;
        };

        match worker.exited.recv_timeout(self.join_timeout) {
            Ok(()) | Err(flume::RecvTimeoutError::Disconnected) => {
                if worker.handle.join().is_err() {
                    error!("Capture thread for {} panicked", self.name);
                }
            }
            Err(flume::RecvTimeoutError::Timeout) => {
                warn!(
                    "Capture thread for {} did not stop within {:?}, detaching",
                    self.name, self.join_timeout
                );
                return;
            }
        }

        info!("Camera {} stopped and resources released", self.name);
    }
}

impl Drop for CaptureSource {
    fn drop(&mut self) {
        self.close();
    }
}

fn capture_loop<D: CaptureDevice>(
    mut device: D,
    latest: &LatestFrame,
    stop: &AtomicBool,
    counters: &Counters,
    options: &SourceOptions,
) {
    if let Some(core) = options.cpu_affinity {
        let pinned = core_affinity::get_core_ids()
            .and_then(|ids| ids.into_iter().find(|id| id.id == core))
            .map(core_affinity::set_for_current)
            .unwrap_or(false);
        if !pinned {
            warn!("Could not pin capture thread to core {}", core);
        }
    }

    let mut sequence = 1;
    let mut consecutive_failures = 0u32;

    while !stop.load(Ordering::Acquire) {
        match device.read_frame() {
            Ok(frame) => {
                sequence += 1;
                latest.publish(frame.with_sequence(sequence));
                counters.frames.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("capture_frames_total").increment(1);

                if consecutive_failures >= options.disconnect_after {
                    info!("Camera {} recovered", device.name());
                    counters.disconnected.store(false, Ordering::Relaxed);
                }
                consecutive_failures = 0;
            }
            Err(e) => {
                counters.read_failures.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("capture_read_failures_total").increment(1);
                consecutive_failures = consecutive_failures.saturating_add(1);

                if consecutive_failures == options.disconnect_after {
                    error!(
                        "Camera {} produced no frame in {} attempts: {}",
                        device.name(),
                        consecutive_failures,
                        e
                    );
                    counters.disconnected.store(true, Ordering::Relaxed);
                } else {
                    debug!("Frame grab failed on {}: {}", device.name(), e);
                }

                thread::sleep(options.retry_delay);
            }
        }
    }

    debug!("Capture loop for {} exiting", device.name());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::device::Property;

    /// Produces solid frames forever, failing on every `fail_every`-th read.
    struct Counting {
        reads: u64,
        fail_every: Option<u64>,
    }

    impl CaptureDevice for Counting {
        fn name(&self) -> &str {
            "counting"
        }

        fn apply(&mut self, property: Property) -> Result<(), CaptureError> {
            Err(CaptureError::PropertyRejected {
                property,
                reason: "fixed mode".into(),
            })
        }

        fn properties(&self) -> DeviceProperties {
            DeviceProperties {
                width: 4,
                height: 2,
                fps: 30,
            }
        }

        fn read_frame(&mut self) -> Result<Frame, CaptureError> {
            self.reads += 1;
            if self.fail_every.is_some_and(|n| self.reads % n == 0) {
                return Err(CaptureError::ReadFailure("scripted".into()));
            }
            thread::sleep(Duration::from_millis(1));
            Ok(Frame::filled(4, 2, [self.reads as u8, 0, 0]))
        }
    }

    #[test]
    fn rejected_properties_do_not_fail_open() {
        let request = CaptureRequest {
            width: Some(1920),
            height: Some(1080),
            fps: Some(60),
        };
        let mut source = CaptureSource::start(
            Counting {
                reads: 0,
                fail_every: None,
            },
            request,
            SourceOptions::default(),
        )
        .unwrap();

        assert_eq!(source.properties().width, 4);
        assert!(source.read_latest().is_some());
        source.close();
    }

    #[test]
    fn transient_failures_keep_the_loop_alive() {
        let mut source = CaptureSource::start(
            Counting {
                reads: 0,
                fail_every: Some(3),
            },
            CaptureRequest::default(),
            SourceOptions {
                retry_delay: Duration::from_millis(1),
                ..SourceOptions::default()
            },
        )
        .unwrap();

        thread::sleep(Duration::from_millis(100));
        let stats = source.stats();
        assert!(source.is_running());
        assert!(stats.read_failures > 0);
        assert!(stats.frames > 1);
        assert!(!stats.disconnected);

        source.close();
        assert!(!source.is_running());
    }

    #[test]
    fn close_twice_is_harmless() {
        let mut source = CaptureSource::start(
            Counting {
                reads: 0,
                fail_every: None,
            },
            CaptureRequest::default(),
            SourceOptions::default(),
        )
        .unwrap();

        source.close();
        source.close();
        assert!(source.read_latest().is_none());
        assert!(source.latest().sequence().is_none());
    }
}
