//! Pipeline step moving the newest captured frame into the mailbox.

use std::panic;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::capture::LatestFrame;
use crate::mailbox::{MailboxError, OwnedMailbox};
use crate::PipelineConfig;

/// What a single publish attempt did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Published,
    /// Nothing captured yet
    Empty,
    /// Newest frame was already published
    Unchanged,
    /// Consumer asked for no preview; nothing encoded
    Paused,
    /// Encoded frame exceeded the mailbox capacity
    Dropped,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishStats {
    pub published: u64,
    pub dropped: u64,
}

pub struct Publisher {
    frames: LatestFrame,
    mailbox: OwnedMailbox,
    quality: u8,
    period: Duration,
    last_sequence: Option<u64>,
    stats: PublishStats,
}

impl Publisher {
    pub fn new(frames: LatestFrame, mailbox: OwnedMailbox, config: &PipelineConfig) -> Self {
        Self {
            frames,
            mailbox,
            quality: config.jpeg_quality,
            period: Duration::from_millis(config.publish_interval_ms.max(1)),
            last_sequence: None,
            stats: PublishStats::default(),
        }
    }

    pub fn mailbox(&self) -> &OwnedMailbox {
        &self.mailbox
    }

    pub fn stats(&self) -> PublishStats {
        self.stats
    }

    /// Publish the newest frame if there is one worth publishing.
    pub fn publish_once(&mut self) -> Result<PublishOutcome, MailboxError> {
        let Some(sequence) = self.frames.sequence() else {
            return Ok(PublishOutcome::Empty);
        };
        if self.last_sequence == Some(sequence) {
            return Ok(PublishOutcome::Unchanged);
        }
        if !self.mailbox.is_preview_enabled() {
            return Ok(PublishOutcome::Paused);
        }

        // The slot may have advanced since `sequence()`; publish whatever is newest now
        let Some(frame) = self.frames.read() else {
            return Ok(PublishOutcome::Empty);
        };

        match self.mailbox.write(&frame, self.quality) {
            Ok(()) => {
                self.last_sequence = Some(frame.sequence);
                self.stats.published += 1;
                Ok(PublishOutcome::Published)
            }
            Err(MailboxError::PayloadTooLarge { size, capacity }) => {
                // Never retry the same oversized frame
                self.last_sequence = Some(frame.sequence);
                self.stats.dropped += 1;
                debug!("Dropped frame {}: {} > {}", frame.sequence, size, capacity);
                Ok(PublishOutcome::Dropped)
            }
            Err(e) => Err(e),
        }
    }

    /// Publish on every tick until `shutdown` flips to `true` or its sender
    /// goes away. Hands the mailbox back so the owner can destroy it.
    ///
    /// Encoding and flushing block, so each attempt runs on the blocking pool.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> OwnedMailbox {
        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            "Publishing to {} every {:?} at quality {}",
            self.mailbox.path().display(),
            self.period,
            self.quality
        );

        let mut publisher = self;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let attempt = task::spawn_blocking(move || {
                        let result = publisher.publish_once();
                        (publisher, result)
                    });
                    let (back, result) = match attempt.await {
                        Ok(done) => done,
                        Err(e) => panic::resume_unwind(e.into_panic()),
                    };
                    publisher = back;
                    if let Err(e) = result {
                        warn!("Publish failed: {}", e);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!(
            "Publisher stopped: {} published, {} dropped",
            publisher.stats.published, publisher.stats.dropped
        );
        publisher.mailbox
    }
}
