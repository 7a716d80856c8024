// SPDX-License-Identifier: MPL-2.0

//! Source checks and asynchronous media probing.
//!
//! A play attempt is validated in two steps. [`check_source`] runs
//! synchronously on the control thread and rejects missing or truncated
//! files. The media itself is then probed off-thread by a [`MediaProbe`];
//! its [`ProbeReport`] comes back over a calloop channel tagged with the
//! [`Ticket`] it was issued for, so a report for a superseded attempt can be
//! told apart from the current one. A stream the probe cannot connect to is
//! reported as unreachable rather than unplayable.

use std::{thread, time::Duration};

use calloop::channel::Sender;

use crate::{
    catalog::{Asset, AssetId, Locator},
    error::PlaybackError,
    surface::SurfaceId,
};

/// Identifies the play attempt a probe was requested for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ticket {
    pub surface: SurfaceId,
    pub generation: u64,
}

/// What a probe learned about an asset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaInfo {
    pub playable: bool,
    pub duration: Option<Duration>,
    /// Error reported while prerolling, if any.
    pub reason: Option<String>,
}

impl MediaInfo {
    /// The duration of playable media with a known, positive length.
    pub fn check(&self) -> Result<Duration, PlaybackError> {
        if !self.playable {
            return Err(PlaybackError::Unplayable(
                self.reason
                    .clone()
                    .unwrap_or_else(|| "media did not preroll".to_owned()),
            ));
        }

        match self.duration {
            Some(duration) if !duration.is_zero() => Ok(duration),
            other => Err(PlaybackError::InvalidDuration(other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeReport {
    pub ticket: Ticket,
    pub asset: AssetId,
    pub outcome: Result<MediaInfo, PlaybackError>,
}

/// Reject sources that are missing or too small to be complete.
pub fn check_source(asset: &Asset, min_bytes: u64) -> Result<(), PlaybackError> {
    match &asset.locator {
        Locator::Path(path) => {
            let metadata = std::fs::metadata(path)
                .map_err(|why| PlaybackError::Unreachable(format!("{}: {why}", path.display())))?;

            if !metadata.is_file() {
                return Err(PlaybackError::Unreachable(format!(
                    "{} is not a file",
                    path.display()
                )));
            }

            if metadata.len() < min_bytes {
                return Err(PlaybackError::Truncated {
                    size: metadata.len(),
                    minimum: min_bytes,
                });
            }

            Ok(())
        }

        Locator::Url(url) => {
            let valid = url.split_once("://").is_some_and(|(scheme, rest)| {
                !rest.is_empty()
                    && scheme.starts_with(|c: char| c.is_ascii_alphabetic())
                    && scheme
                        .chars()
                        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
            });

            if valid {
                Ok(())
            } else {
                Err(PlaybackError::Unreachable(format!("malformed url: {url}")))
            }
        }
    }
}

/// Asynchronous metadata validation.
pub trait MediaProbe {
    /// Start probing `asset`. The result is delivered later on the control
    /// thread as a [`ProbeReport`] carrying `ticket`.
    fn request(&mut self, ticket: Ticket, asset: &Asset);
}

/// Probes media with a short-lived GStreamer pipeline on a worker thread.
pub struct GstProbe {
    sender: Sender<ProbeReport>,
    timeout: Duration,
}

impl GstProbe {
    pub fn new(sender: Sender<ProbeReport>, timeout: Duration) -> Self {
        Self { sender, timeout }
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }
}

impl MediaProbe for GstProbe {
    fn request(&mut self, ticket: Ticket, asset: &Asset) {
        let sender = self.sender.clone();
        let timeout = self.timeout;
        let probed = asset.clone();

        let spawned = thread::Builder::new()
            .name("media-probe".to_owned())
            .spawn(move || {
                let outcome = crate::engine::gst::probe_media(&probed, timeout);
                // The receiver is gone only when the event loop exits.
                let _ = sender.send(ProbeReport {
                    ticket,
                    asset: probed.id,
                    outcome,
                });
            });

        if let Err(why) = spawned {
            tracing::error!(?why, asset = %asset.id, "failed to spawn media probe");
            let _ = self.sender.send(ProbeReport {
                ticket,
                asset: asset.id.clone(),
                outcome: Err(PlaybackError::Engine(format!("probe thread: {why}"))),
            });
        }
    }
}
