//! framebridge: camera capture into a shared-memory frame mailbox

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use color_eyre::eyre::{eyre, WrapErr};
use color_eyre::Result;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use framebridge::capture::CaptureSource;
use framebridge::mailbox::{flag_path, ControlFlag, MailboxError, OwnedMailbox, SharedMailbox};
use framebridge::pipeline::Publisher;
use framebridge::{utils, Config};

#[derive(Parser)]
#[command(version, about)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Capture from the camera and publish frames into the mailbox
    Capture,
    /// Follow an existing mailbox and log each new frame
    Watch {
        /// Poll interval in milliseconds
        #[arg(long, default_value_t = 100)]
        poll_ms: u64,
    },
    /// Turn the consumer preview on or off
    Flag { state: FlagState },
}

#[derive(Clone, Copy, ValueEnum)]
enum FlagState {
    On,
    Off,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    init_tracing();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref()).wrap_err("failed to load configuration")?;

    match cli.command {
        Command::Capture => capture(config).await,
        Command::Watch { poll_ms } => watch_mailbox(&config, Duration::from_millis(poll_ms)).await,
        Command::Flag { state } => set_flag(&config, state),
    }
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("framebridge=debug"));

    #[cfg(feature = "profiling")]
    {
        use tracing_subscriber::prelude::*;
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_timer(tracing_subscriber::fmt::time::uptime()))
            .with(tracing_tracy::TracyLayer::default())
            .init();
    }

    #[cfg(not(feature = "profiling"))]
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();
}

async fn capture(mut config: Config) -> Result<()> {
    info!("framebridge capture launching...");

    // Auto-detect capture device if needed
    if config.capture.device.is_empty() {
        let found = utils::auto_detect_device().ok_or_else(|| eyre!("No suitable capture device found"))?;
        config.capture.device = found.path;
        config.capture.format = found.format;
    }
    info!("Using capture device: {}", config.capture.device);

    // A mailbox we cannot create means nobody can consume frames; don't start
    let mailbox = OwnedMailbox::create(&config.mailbox.path, config.mailbox.capacity)
        .wrap_err_with(|| format!("failed to create mailbox at {}", config.mailbox.path.display()))?;

    let mut source = match CaptureSource::from_config(&config.capture) {
        Ok(source) => source,
        Err(e) => {
            if let Err(cleanup) = mailbox.destroy() {
                warn!("Failed to remove mailbox files: {}", cleanup);
            }
            return Err(e).wrap_err("failed to open camera");
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let publisher = Publisher::new(source.latest(), mailbox, &config.pipeline);
    let task = tokio::spawn(publisher.run(shutdown_rx));

    // Cleanup below runs even if the signal handler could not be installed
    let interrupted = tokio::signal::ctrl_c().await;
    match &interrupted {
        Ok(()) => info!("Shutdown requested"),
        Err(e) => error!("Failed to listen for ctrl-c, shutting down: {}", e),
    }

    let _ = shutdown_tx.send(true);
    let mailbox = task.await.wrap_err("publisher task failed")?;

    let stats = source.stats();
    // Joining the capture thread can block for the whole join timeout
    tokio::task::spawn_blocking(move || source.close())
        .await
        .wrap_err("capture shutdown task failed")?;
    info!(
        "Captured {} frames ({} failed reads)",
        stats.frames, stats.read_failures
    );

    mailbox.destroy().wrap_err("failed to remove mailbox files")?;
    interrupted.wrap_err("failed to listen for ctrl-c")?;
    info!("framebridge shutting down");
    Ok(())
}

async fn watch_mailbox(config: &Config, poll: Duration) -> Result<()> {
    let mut mailbox = SharedMailbox::open(&config.mailbox.path, config.mailbox.capacity)
        .wrap_err_with(|| format!("failed to open mailbox at {}", config.mailbox.path.display()))?;

    let mut ticker = tokio::time::interval(poll);
    let mut last = None;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = tokio::signal::ctrl_c() => break,
        }

        if !mailbox.is_preview_enabled() {
            continue;
        }

        let Some(info) = mailbox.read_header_only() else {
            continue;
        };
        if last == Some(info.timestamp) {
            continue;
        }
        last = Some(info.timestamp);

        match mailbox.read() {
            Ok((frame, ts)) => info!(
                "frame {}x{}x{} at {:.6} ({} payload bytes)",
                frame.width,
                frame.height,
                frame.channels,
                ts.as_secs_f64(),
                info.payload_size
            ),
            Err(MailboxError::NoFrameYet) => {}
            Err(e) => warn!("Read failed: {}", e),
        }
    }

    mailbox.close();
    Ok(())
}

fn set_flag(config: &Config, state: FlagState) -> Result<()> {
    let path = flag_path(&config.mailbox.path);
    let mut flag =
        ControlFlag::open(&path).wrap_err_with(|| format!("failed to open {}", path.display()))?;
    flag.set(matches!(state, FlagState::On))?;
    info!("Preview flag at {} set {}", path.display(), if flag.is_enabled() { "on" } else { "off" });
    Ok(())
}
