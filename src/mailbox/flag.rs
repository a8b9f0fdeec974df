//! Out-of-band preview switch: a 4-byte file mapped independently of the frame data.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use memmap2::{MmapMut, MmapOptions};
use tracing::{info, warn};

pub const FLAG_SIZE: usize = 4;

/// Replaces the data file's extension to name the flag file.
pub const FLAG_SUFFIX: &str = "_flag.mmap";

pub const PREVIEW_ON: u32 = 1;
pub const PREVIEW_OFF: u32 = 0;

/// `frames.mmap` -> `frames_flag.mmap`
pub fn flag_path(data_path: &Path) -> PathBuf {
    let stem = data_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    data_path.with_file_name(format!("{stem}{FLAG_SUFFIX}"))
}

/// Shared-memory boolean.
pub struct ControlFlag {
    path: PathBuf,
    file: Option<File>,
    map: Option<MmapMut>,
}

impl ControlFlag {
    /// Create (or reset) the flag file with preview enabled.
    pub fn create(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.set_len(FLAG_SIZE as u64)?;

        let mut flag = Self::map(path, file)?;
        flag.store(PREVIEW_ON)?;
        info!("Preview flag file created: {}", flag.path.display());
        Ok(flag)
    }

    /// Map an existing flag file.
    pub fn open(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        if file.metadata()?.len() < FLAG_SIZE as u64 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("flag file {} is shorter than {FLAG_SIZE} bytes", path.display()),
            ));
        }

        let flag = Self::map(path, file)?;
        info!("Preview flag file opened: {}", flag.path.display());
        Ok(flag)
    }

    /// Map an existing flag file, or create a fresh one if that fails.
    pub fn open_or_create(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        match Self::open(&path) {
            Ok(flag) => Ok(flag),
            Err(e) => {
                warn!("Failed to open preview flag file, creating new: {}", e);
                Self::create(path)
            }
        }
    }

    fn map(path: PathBuf, file: File) -> io::Result<Self> {
        // SAFETY: the file is at least FLAG_SIZE bytes; the mapping is only
        // written through, reads go through the file.
        let map = unsafe { MmapOptions::new().len(FLAG_SIZE).map_mut(&file)? };
        Ok(Self {
            path,
            file: Some(file),
            map: Some(map),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Raw flag value, or `None` if the region is closed or the file has
    /// been truncated underneath us.
    ///
    /// Read through the file rather than the mapping: a truncation then
    /// surfaces as a short read instead of a fault.
    pub fn value(&self) -> Option<u32> {
        self.map.as_ref()?;
        let file = self.file.as_ref()?;
        let mut raw = [0u8; FLAG_SIZE];
        file.read_exact_at(&mut raw, 0).ok()?;
        Some(u32::from_le_bytes(raw))
    }

    /// `true` only for an exact `1`; anything else, including errors, is off.
    pub fn is_enabled(&self) -> bool {
        self.value() == Some(PREVIEW_ON)
    }

    /// Controller-side write.
    pub fn set(&mut self, enabled: bool) -> io::Result<()> {
        self.store(if enabled { PREVIEW_ON } else { PREVIEW_OFF })
    }

    fn store(&mut self, value: u32) -> io::Result<()> {
        let map = self
            .map
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "flag region closed"))?;
        map[..FLAG_SIZE].copy_from_slice(&value.to_le_bytes());
        map.flush()
    }

    /// Unmap and close. Idempotent.
    pub fn close(&mut self) {
        self.map = None;
        self.file = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_name_replaces_extension() {
        assert_eq!(
            flag_path(Path::new("/tmp/shm/frames.mmap")),
            PathBuf::from("/tmp/shm/frames_flag.mmap")
        );
        assert_eq!(
            flag_path(Path::new("frames")),
            PathBuf::from("frames_flag.mmap")
        );
    }

    #[test]
    fn created_flag_defaults_on() {
        let dir = tempfile::tempdir().unwrap();
        let flag = ControlFlag::create(dir.path().join("f_flag.mmap")).unwrap();
        assert_eq!(flag.value(), Some(PREVIEW_ON));
        assert!(flag.is_enabled());
        assert_eq!(std::fs::read(flag.path()).unwrap(), vec![1, 0, 0, 0]);
    }

    #[test]
    fn set_is_visible_to_other_mappings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f_flag.mmap");
        let mut writer = ControlFlag::create(&path).unwrap();
        let reader = ControlFlag::open(&path).unwrap();

        writer.set(false).unwrap();
        assert!(!reader.is_enabled());
        writer.set(true).unwrap();
        assert!(reader.is_enabled());
    }

    #[test]
    fn unexpected_values_read_as_off() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f_flag.mmap");
        let flag = ControlFlag::create(&path).unwrap();
        std::fs::write(&path, 7u32.to_le_bytes()).unwrap();
        assert_eq!(flag.value(), Some(7));
        assert!(!flag.is_enabled());
    }

    #[test]
    fn short_file_is_replaced_by_open_or_create() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f_flag.mmap");
        std::fs::write(&path, [0u8; 2]).unwrap();

        assert!(ControlFlag::open(&path).is_err());
        let flag = ControlFlag::open_or_create(&path).unwrap();
        assert!(flag.is_enabled());
    }

    #[test]
    fn truncation_while_mapped_reads_as_off() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f_flag.mmap");
        let flag = ControlFlag::create(&path).unwrap();

        let external = OpenOptions::new().write(true).open(&path).unwrap();
        external.set_len(2).unwrap();
        assert_eq!(flag.value(), None);
        assert!(!flag.is_enabled());

        external.set_len(FLAG_SIZE as u64).unwrap();
        external.write_all_at(&PREVIEW_ON.to_le_bytes(), 0).unwrap();
        assert!(flag.is_enabled());
    }

    #[test]
    fn closed_flag_is_off() {
        let dir = tempfile::tempdir().unwrap();
        let mut flag = ControlFlag::create(dir.path().join("f_flag.mmap")).unwrap();
        flag.close();
        flag.close();
        assert!(!flag.is_enabled());
        assert!(flag.set(true).is_err());
    }
}
