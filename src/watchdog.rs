// SPDX-License-Identifier: MPL-2.0

//! Per-surface playback health decisions.
//!
//! The watchdog holds no engine and arms no timers. It interprets engine
//! signals and health samples and tells its [`Surface`](crate::surface::Surface)
//! what to do, which keeps every decision testable without a decoder.
//!
//! ```text
//! Idle -> Validating -> Playing -> Failed -> Idle
//!              \____________________^
//! ```

use std::time::Duration;

use crate::{catalog::AssetId, engine::EngineEvent, error::PlaybackError, scheduler::TimerId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    #[default]
    Idle,
    /// Waiting for the asynchronous media probe.
    Validating,
    Playing,
    /// A failure was reported; teardown is in progress.
    Failed,
}

/// Reaction to an engine signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Continue,
    /// A stall began; arm the grace timer and hand it back with [`Watchdog::stall_armed`].
    ArmStallGrace,
    /// The stall resolved itself; cancel its grace timer.
    CancelStallGrace(TimerId),
    Fail(PlaybackError),
}

/// Result of a periodic health check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    /// Nothing is running, or a stall is already being tracked.
    Idle,
    Healthy,
    /// Position did not move since the previous check while running.
    Frozen { position: Duration },
    /// Still frozen at the first comparison after a recovery attempt.
    Unrecovered { position: Duration },
}

#[derive(Debug, Default)]
pub struct Watchdog {
    phase: Phase,
    generation: u64,
    expected: Option<AssetId>,
    last_position: Option<Duration>,
    failure_reported: bool,
    stall: Option<TimerId>,
    /// A freeze was reported and no movement has been seen since.
    nudged: bool,
}

impl Watchdog {
    /// Start watching a new play attempt.
    ///
    /// Returns the grace timer of the previous attempt, which must be cancelled.
    pub fn begin(&mut self, generation: u64, asset: AssetId) -> Option<TimerId> {
        self.phase = Phase::Validating;
        self.generation = generation;
        self.expected = Some(asset);
        self.last_position = None;
        self.failure_reported = false;
        self.nudged = false;
        self.stall.take()
    }

    /// Whether a probe result for `generation` and `asset` belongs to the
    /// attempt being validated.
    #[must_use]
    pub fn accepts(&self, generation: u64, asset: &AssetId) -> bool {
        self.phase == Phase::Validating
            && self.generation == generation
            && self.expected.as_ref() == Some(asset)
    }

    pub fn validated(&mut self) {
        if self.phase == Phase::Validating {
            self.phase = Phase::Playing;
        }
    }

    pub fn observe(&mut self, event: &EngineEvent) -> Verdict {
        if self.phase != Phase::Playing {
            return Verdict::Continue;
        }

        match event {
            EngineEvent::Error(reason) | EngineEvent::Failed(reason) => {
                Verdict::Fail(PlaybackError::Engine(reason.clone()))
            }
            EngineEvent::Stalled if self.stall.is_none() => Verdict::ArmStallGrace,
            EngineEvent::Recovered => match self.stall.take() {
                Some(timer) => Verdict::CancelStallGrace(timer),
                None => Verdict::Continue,
            },
            EngineEvent::Stalled | EngineEvent::Started => Verdict::Continue,
        }
    }

    pub fn stall_armed(&mut self, timer: TimerId) {
        self.stall = Some(timer);
    }

    /// The grace timer `timer` fired. Yields the failure if it is still the
    /// timer of an unresolved stall.
    pub fn stall_expired(&mut self, timer: TimerId, grace: Duration) -> Option<PlaybackError> {
        if self.stall != Some(timer) {
            return None;
        }

        self.stall = None;
        (self.phase == Phase::Playing).then_some(PlaybackError::Stalled(grace))
    }

    /// Compare a position sample with the previous one.
    ///
    /// After a freeze is reported the baseline is dropped, so the next check
    /// only records a fresh sample. If the comparison after that is still
    /// stationary the recovery did not take and the freeze is unrecovered.
    pub fn health_check(&mut self, rate: f64, position: Option<Duration>) -> Health {
        if self.phase != Phase::Playing || self.stall.is_some() || rate <= 0.0 {
            self.last_position = None;
            return Health::Idle;
        }

        let Some(position) = position else {
            self.last_position = None;
            return Health::Healthy;
        };

        match self.last_position.replace(position) {
            Some(previous) if previous == position => {
                self.last_position = None;
                if std::mem::replace(&mut self.nudged, true) {
                    self.nudged = false;
                    Health::Unrecovered { position }
                } else {
                    Health::Frozen { position }
                }
            }
            Some(_) => {
                self.nudged = false;
                Health::Healthy
            }
            None => Health::Healthy,
        }
    }

    /// Mark the current attempt as failed.
    ///
    /// Returns `false` if a failure was already reported for this attempt.
    pub fn report_failure(&mut self) -> bool {
        if self.failure_reported || self.phase == Phase::Idle {
            return false;
        }

        self.failure_reported = true;
        self.phase = Phase::Failed;
        true
    }

    /// Return to idle. Returns the stall timer to cancel, if any.
    pub fn reset(&mut self) -> Option<TimerId> {
        self.phase = Phase::Idle;
        self.expected = None;
        self.last_position = None;
        self.nudged = false;
        self.stall.take()
    }

    #[must_use]
    pub fn phase(&self) -> Phase {
        self.phase
    }

    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }
}
