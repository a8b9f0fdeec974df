pub mod capture;
pub mod mailbox;
pub mod pipeline;
pub mod utils;

use std::path::{Path, PathBuf};

use capture::frame::PixelFormat;
use serde::{Deserialize, Serialize};

pub use capture::{CaptureError, CaptureSource, Frame};
pub use mailbox::{MailboxError, OwnedMailbox, SharedMailbox};

/// Environment variables override file settings, e.g. `FRAMEBRIDGE__MAILBOX__PATH`.
pub const ENV_PREFIX: &str = "FRAMEBRIDGE";

/// System configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub capture: CaptureConfig,
    pub mailbox: MailboxConfig,
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Index (`"0"`) or path (`"/dev/video0"`); empty means auto-detect
    pub device: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub fps: Option<u32>,
    pub format: PixelFormat,
    pub buffer_count: u32,
    pub retry_delay_ms: u64,
    pub join_timeout_ms: u64,
    pub disconnect_after: u32,
    pub cpu_affinity: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MailboxConfig {
    pub path: PathBuf,
    /// Payload bytes after the 24-byte header
    pub capacity: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub publish_interval_ms: u64,
    pub jpeg_quality: u8,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            capture: CaptureConfig {
                device: "/dev/video0".into(),
                width: Some(640),
                height: Some(480),
                fps: Some(30),
                format: PixelFormat::Mjpeg,
                buffer_count: 4,
                retry_delay_ms: 10,
                join_timeout_ms: 1000,
                disconnect_after: 100,
                cpu_affinity: None,
            },
            mailbox: MailboxConfig {
                path: std::env::temp_dir().join("framebridge").join("frames.mmap"),
                capacity: mailbox::DEFAULT_CAPACITY,
            },
            pipeline: PipelineConfig {
                publish_interval_ms: 33, // ~30fps
                jpeg_quality: 70,
            },
        }
    }
}

impl Config {
    /// Defaults, then the optional TOML file, then `FRAMEBRIDGE__*` variables.
    pub fn load(file: Option<&Path>) -> Result<Self, config::ConfigError> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Config::default())?);

        if let Some(file) = file {
            builder = builder.add_source(config::File::from(file).required(true));
        }

        builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }
}
