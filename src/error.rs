// SPDX-License-Identifier: MPL-2.0

//! Playback failure taxonomy.
//!
//! None of these reach a caller of `play`: every variant is recovered locally
//! by the dispatcher's fallback selection. They travel in failure signals and
//! logs so the control surface can show why an asset was skipped.

use std::time::Duration;

/// Why a play attempt on a surface was abandoned.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlaybackError {
    #[error("source is unreachable: {0}")]
    Unreachable(String),
    #[error("source is {size} bytes, likely an incomplete download (minimum {minimum})")]
    Truncated { size: u64, minimum: u64 },
    #[error("media is not playable: {0}")]
    Unplayable(String),
    #[error("media reports an invalid duration: {0:?}")]
    InvalidDuration(Option<Duration>),
    #[error("engine failure: {0}")]
    Engine(String),
    #[error("engine stalled for longer than {0:?}")]
    Stalled(Duration),
    #[error("frozen playback recovery failed: {0}")]
    Frozen(String),
}

impl PlaybackError {
    /// Failures found before the engine was started.
    #[must_use]
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::Unreachable(_) | Self::Truncated { .. } | Self::Unplayable(_) | Self::InvalidDuration(_)
        )
    }
}
