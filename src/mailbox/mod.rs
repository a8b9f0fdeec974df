//! Single-slot frame mailbox backed by a memory-mapped file.
//!
//! Layout of the data file:
//!
//! ```text
//! [MailboxHeader; 24 bytes][JPEG payload; payload_size bytes][zero padding to capacity]
//! ```
//!
//! A sibling flag file (see [`flag::flag_path`]) carries the preview switch.
//!
//! The producer writes the header and then the payload in one forward pass.
//! There is no lock between processes, so a reader racing a write can still
//! observe a torn frame. Readers re-check the header after copying the
//! payload and retry when it moved, which catches a write that started
//! during the copy but not one already past the header when the read began.

pub mod codec;
pub mod flag;
pub mod header;

use std::fs::{self, File, OpenOptions};
use std::io;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::time::Instant;

use memmap2::{Mmap, MmapMut, MmapOptions};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::capture::decoder::DecodeError;
use crate::capture::frame::{Frame, CHANNELS};

pub use flag::{flag_path, ControlFlag};
pub use header::{FrameInfo, MailboxHeader, Timestamp, HEADER_SIZE};

/// Large enough for a raw 1080p BGR frame, which bounds any sane JPEG of it.
pub const DEFAULT_CAPACITY: usize = 1920 * 1080 * 3;

/// How many times `read` retries when the header moves during a copy.
const READ_ATTEMPTS: usize = 3;

#[derive(Debug, Error)]
pub enum MailboxError {
    #[error("encoded frame is {size} bytes, mailbox holds {capacity}")]
    PayloadTooLarge { size: usize, capacity: usize },

    #[error("no frame has been published yet")]
    NoFrameYet,

    #[error("mailbox is closed")]
    Closed,

    #[error("frame encode failed: {0}")]
    Encode(String),

    #[error("frame decode failed: {0}")]
    Decode(#[from] DecodeError),

    #[error("header claims {claimed} payload bytes, mailbox holds {capacity}")]
    Corrupt { claimed: usize, capacity: usize },

    #[error("frame changed during {attempts} consecutive reads")]
    Unstable { attempts: usize },

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Data file plus its mapping. `M` is `MmapMut` for the owner, `Mmap` for openers.
struct Region<M> {
    path: PathBuf,
    capacity: usize,
    file: Option<File>,
    map: Option<M>,
}

impl<M: Deref<Target = [u8]>> Region<M> {
    fn bytes(&self) -> Result<&[u8], MailboxError> {
        let (file, map) = match (&self.file, &self.map) {
            (Some(file), Some(map)) => (file, map),
            _ => return Err(MailboxError::Closed),
        };

        let expected = (HEADER_SIZE + self.capacity) as u64;
        let len = file.metadata()?.len();
        if len < expected {
            // Touching pages past EOF would fault. A truncation landing after
            // this check still can; only the owner ever resizes the file.
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("{} shrank to {len} bytes", self.path.display()),
            )
            .into());
        }
        Ok(&map[..])
    }

    fn header(&self) -> Result<MailboxHeader, MailboxError> {
        let bytes = self.bytes()?;
        MailboxHeader::decode(bytes).ok_or(MailboxError::Closed)
    }

    fn read_header_only(&self) -> Option<FrameInfo> {
        match self.header() {
            Ok(header) if header.has_frame() => Some(header.info()),
            Ok(_) => None,
            Err(e) => {
                debug!("Header read failed: {}", e);
                None
            }
        }
    }

    fn read(&self) -> Result<(Frame, Timestamp), MailboxError> {
        for attempt in 1..=READ_ATTEMPTS {
            let bytes = self.bytes()?;
            let header = MailboxHeader::decode(bytes).ok_or(MailboxError::Closed)?;
            if !header.has_frame() {
                return Err(MailboxError::NoFrameYet);
            }

            let size = header.payload_size as usize;
            if size > self.capacity {
                return Err(MailboxError::Corrupt {
                    claimed: size,
                    capacity: self.capacity,
                });
            }
            let payload = bytes[HEADER_SIZE..HEADER_SIZE + size].to_vec();

            if MailboxHeader::decode(bytes) != Some(header) {
                debug!("Header changed during read (attempt {})", attempt);
                continue;
            }

            return decode_payload(&header, &payload).map(|frame| (frame, header.timestamp()));
        }

        Err(MailboxError::Unstable {
            attempts: READ_ATTEMPTS,
        })
    }

    fn close(&mut self) -> bool {
        let was_open = self.map.is_some();
        self.map = None;
        self.file = None;
        was_open
    }
}

fn decode_payload(header: &MailboxHeader, payload: &[u8]) -> Result<Frame, MailboxError> {
    let (width, height, bgr) = codec::decode(payload)?;
    if (width, height) != (header.width, header.height) || header.channels != CHANNELS {
        return Err(MailboxError::Decode(DecodeError::Jpeg(format!(
            "payload is {width}x{height}, header says {}x{}x{}",
            header.width, header.height, header.channels
        ))));
    }
    Frame::from_bgr(width, height, bgr).map_err(|e| MailboxError::Decode(e.into()))
}

/// The producer's mailbox. Only this side may write frames or delete the files.
pub struct OwnedMailbox {
    region: Region<MmapMut>,
    flag: ControlFlag,
    /// End of the previous payload, so stale bytes can be zeroed
    written: usize,
}

impl OwnedMailbox {
    /// Create zero-filled data and flag files at `path` and map both writable.
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub fn create(path: impl AsRef<Path>, capacity: usize) -> Result<Self, MailboxError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.set_len((HEADER_SIZE + capacity) as u64)?;

        // SAFETY: the file was just sized to exactly the mapped length.
        let map = unsafe {
            MmapOptions::new()
                .len(HEADER_SIZE + capacity)
                .map_mut(&file)?
        };

        let flag = ControlFlag::create(flag_path(&path))?;
        info!("Created shared buffer at: {}", path.display());

        Ok(Self {
            region: Region {
                path,
                capacity,
                file: Some(file),
                map: Some(map),
            },
            flag,
            written: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.region.path
    }

    pub fn capacity(&self) -> usize {
        self.region.capacity
    }

    /// Compress `frame` and publish it.
    ///
    /// An oversized payload is dropped and leaves the previous frame intact.
    pub fn write(&mut self, frame: &Frame, quality: u8) -> Result<(), MailboxError> {
        if self.region.map.is_none() {
            return Err(MailboxError::Closed);
        }

        let started = Instant::now();
        let payload = codec::encode(frame, quality)?;
        metrics::histogram!("mailbox_encode_time_us").record(started.elapsed().as_micros() as f64);

        let capacity = self.region.capacity;
        if payload.len() > capacity {
            warn!("JPEG frame too large: {} > {}", payload.len(), capacity);
            metrics::counter!("mailbox_frames_dropped_total").increment(1);
            return Err(MailboxError::PayloadTooLarge {
                size: payload.len(),
                capacity,
            });
        }

        let ts = Timestamp::now();
        let header = MailboxHeader {
            width: frame.width,
            height: frame.height,
            channels: frame.channels,
            timestamp_sec: ts.secs,
            timestamp_usec: ts.micros,
            payload_size: payload.len() as u32,
        };

        let map = self.region.map.as_mut().ok_or(MailboxError::Closed)?;
        let end = HEADER_SIZE + payload.len();
        map[..HEADER_SIZE].copy_from_slice(&header.encode());
        map[HEADER_SIZE..end].copy_from_slice(&payload);
        if self.written > end {
            map[end..self.written].fill(0);
        }
        map.flush()?;

        self.written = end;
        metrics::counter!("mailbox_frames_written_total").increment(1);
        Ok(())
    }

    pub fn read(&self) -> Result<(Frame, Timestamp), MailboxError> {
        self.region.read()
    }

    pub fn read_header_only(&self) -> Option<FrameInfo> {
        self.region.read_header_only()
    }

    /// Raw header, including the all-zero "nothing yet" state.
    pub fn header(&self) -> Result<MailboxHeader, MailboxError> {
        self.region.header()
    }

    pub fn is_preview_enabled(&self) -> bool {
        self.flag.is_enabled()
    }

    /// Unmap both regions. Idempotent.
    pub fn close(&mut self) {
        if self.region.close() {
            info!("Closed shared buffer {}", self.region.path.display());
        }
        self.flag.close();
    }

    /// Close, then delete the data and flag files.
    pub fn destroy(mut self) -> io::Result<()> {
        self.close();
        for path in [self.region.path.clone(), self.flag.path().to_path_buf()] {
            match fs::remove_file(&path) {
                Ok(()) => info!("Deleted buffer file: {}", path.display()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

impl Drop for OwnedMailbox {
    fn drop(&mut self) {
        self.close();
    }
}

/// A consumer's read-only view of someone else's mailbox.
pub struct SharedMailbox {
    region: Region<Mmap>,
    flag: ControlFlag,
}

impl SharedMailbox {
    /// Map an existing data file; recreates the flag file if it is missing.
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub fn open(path: impl AsRef<Path>, capacity: usize) -> Result<Self, MailboxError> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;

        let expected = (HEADER_SIZE + capacity) as u64;
        let len = file.metadata()?.len();
        if len < expected {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "{} is {len} bytes, a {capacity}-byte mailbox needs {expected}",
                    path.display()
                ),
            )
            .into());
        }

        // SAFETY: length checked above; reads re-check before every access.
        let map = unsafe { MmapOptions::new().len(HEADER_SIZE + capacity).map(&file)? };
        let flag = ControlFlag::open_or_create(flag_path(&path))?;
        info!("Opened shared buffer at: {}", path.display());

        Ok(Self {
            region: Region {
                path,
                capacity,
                file: Some(file),
                map: Some(map),
            },
            flag,
        })
    }

    pub fn path(&self) -> &Path {
        &self.region.path
    }

    pub fn capacity(&self) -> usize {
        self.region.capacity
    }

    pub fn read(&self) -> Result<(Frame, Timestamp), MailboxError> {
        self.region.read()
    }

    pub fn read_header_only(&self) -> Option<FrameInfo> {
        self.region.read_header_only()
    }

    pub fn header(&self) -> Result<MailboxHeader, MailboxError> {
        self.region.header()
    }

    pub fn is_preview_enabled(&self) -> bool {
        self.flag.is_enabled()
    }

    pub fn close(&mut self) {
        if self.region.close() {
            info!("Closed shared buffer {}", self.region.path.display());
        }
        self.flag.close();
    }
}

impl Drop for SharedMailbox {
    fn drop(&mut self) {
        self.close();
    }
}
