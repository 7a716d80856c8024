// SPDX-License-Identifier: MPL-2.0

//! One output-bound playback target.
//!
//! A [`Surface`] pairs a playback engine with the rendering layer on one
//! output and applies its [`Watchdog`]'s decisions to them. Surfaces are
//! released in one of two ways:
//!
//! - emergency: the session drops its reference without calling into the
//!   engine or the layer, because the output may already be gone;
//! - graceful: [`Surface::graceful_teardown`] stops the engine and detaches
//!   the layer once the topology is known to be stable.

use std::{fmt, time::Duration};

use crate::{
    catalog::Asset,
    engine::{PlaybackEngine, VideoFrame},
    error::PlaybackError,
    scheduler::{Job, Scheduler, TimerId},
    topology::OutputInfo,
    validate::{self, MediaProbe, ProbeReport, Ticket},
    watchdog::{Health, Phase, Verdict, Watchdog},
};

/// Identifies a surface for the lifetime of the process. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SurfaceId(pub u64);

impl fmt::Display for SurfaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where decoded frames are shown.
pub trait RenderLayer {
    /// Show `frame`. Returns `false` when the layer could not take it yet.
    fn present(&mut self, frame: &VideoFrame) -> bool;

    /// Remove the layer from its output.
    fn detach(&mut self);
}

/// A play attempt that a surface abandoned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub surface: SurfaceId,
    pub generation: u64,
    pub asset: Asset,
    pub error: PlaybackError,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The report belongs to a superseded attempt and was discarded.
    Stale,
    Started,
    Failed(Failure),
}

pub struct Surface<O, E, L> {
    id: SurfaceId,
    output: OutputInfo<O>,
    engine: E,
    layer: L,
    watchdog: Watchdog,
    asset: Option<Asset>,
    /// Newest frame the layer could not take yet.
    unpresented: Option<VideoFrame>,
}

impl<O, E: PlaybackEngine, L: RenderLayer> Surface<O, E, L> {
    pub fn new(id: SurfaceId, output: OutputInfo<O>, layer: L, engine: E) -> Self {
        Self {
            id,
            output,
            engine,
            layer,
            watchdog: Watchdog::default(),
            asset: None,
            unpresented: None,
        }
    }

    /// Begin a play attempt of `asset`: check the source, then request the
    /// asynchronous probe. The engine is started by [`Surface::probe_finished`].
    pub fn play(
        &mut self,
        asset: &Asset,
        generation: u64,
        min_source_bytes: u64,
        probe: &mut impl MediaProbe,
        scheduler: &mut impl Scheduler,
    ) -> Option<Failure> {
        self.engine.stop();
        if let Some(timer) = self.watchdog.begin(generation, asset.id.clone()) {
            scheduler.cancel(timer);
        }
        self.asset = Some(asset.clone());

        if let Err(error) = validate::check_source(asset, min_source_bytes) {
            return self.fail(error, scheduler);
        }

        tracing::debug!(surface = %self.id, asset = %asset.id, generation, "validating");
        probe.request(
            Ticket {
                surface: self.id,
                generation,
            },
            asset,
        );
        None
    }

    /// Apply a probe report. Starts the engine if the media checks out; it is
    /// left paused when `running` is false.
    pub fn probe_finished(
        &mut self,
        report: ProbeReport,
        running: bool,
        scheduler: &mut impl Scheduler,
    ) -> ProbeOutcome {
        if report.ticket.surface != self.id
            || !self.watchdog.accepts(report.ticket.generation, &report.asset)
        {
            tracing::debug!(surface = %self.id, asset = %report.asset, "discarding stale probe result");
            return ProbeOutcome::Stale;
        }

        let duration = match report.outcome.and_then(|info| info.check()) {
            Ok(duration) => duration,
            Err(error) => return self.fail(error, scheduler).map_or(ProbeOutcome::Stale, ProbeOutcome::Failed),
        };

        let Some(asset) = self.asset.as_ref() else {
            return ProbeOutcome::Stale;
        };

        let started = self.engine.load(asset).and_then(|()| {
            if running {
                self.engine.play()
            } else {
                self.engine.pause()
            }
        });

        match started {
            Ok(()) => {
                tracing::info!(
                    surface = %self.id,
                    output = self.output.name,
                    asset = %asset.id,
                    ?duration,
                    running,
                    "playback started"
                );
                self.watchdog.validated();
                ProbeOutcome::Started
            }
            Err(why) => self
                .fail(PlaybackError::Engine(format!("{why:#}")), scheduler)
                .map_or(ProbeOutcome::Stale, ProbeOutcome::Failed),
        }
    }

    pub fn pause(&mut self, scheduler: &mut impl Scheduler) -> Option<Failure> {
        if self.watchdog.phase() != Phase::Playing {
            return None;
        }

        match self.engine.pause() {
            Ok(()) => None,
            Err(why) => self.fail(PlaybackError::Engine(format!("{why:#}")), scheduler),
        }
    }

    pub fn resume(&mut self, scheduler: &mut impl Scheduler) -> Option<Failure> {
        if self.watchdog.phase() != Phase::Playing {
            return None;
        }

        match self.engine.play() {
            Ok(()) => None,
            Err(why) => self.fail(PlaybackError::Engine(format!("{why:#}")), scheduler),
        }
    }

    /// Drain engine signals through the watchdog.
    pub fn pump(&mut self, stall_grace: Duration, scheduler: &mut impl Scheduler) -> Option<Failure> {
        for event in self.engine.poll_events() {
            match self.watchdog.observe(&event) {
                Verdict::Continue => {}
                Verdict::ArmStallGrace => {
                    tracing::debug!(surface = %self.id, "engine stalled");
                    let timer = scheduler.arm(stall_grace, Job::StallGrace(self.id));
                    self.watchdog.stall_armed(timer);
                }
                Verdict::CancelStallGrace(timer) => {
                    tracing::debug!(surface = %self.id, "engine recovered from stall");
                    scheduler.cancel(timer);
                }
                Verdict::Fail(error) => return self.fail(error, scheduler),
            }
        }

        None
    }

    /// Present the newest decoded frame. A frame the layer is not ready for
    /// is kept and offered again on the next call unless a newer one arrives.
    pub fn render(&mut self) {
        if let Some(frame) = self.engine.take_frame() {
            self.unpresented = Some(frame);
        }

        if self
            .unpresented
            .as_ref()
            .is_some_and(|frame| self.layer.present(frame))
        {
            self.unpresented = None;
        }
    }

    pub fn stall_expired(
        &mut self,
        timer: TimerId,
        grace: Duration,
        scheduler: &mut impl Scheduler,
    ) -> Option<Failure> {
        let error = self.watchdog.stall_expired(timer, grace)?;
        self.fail(error, scheduler)
    }

    /// Periodic frozen playback check. A freeze is recovered in place by
    /// seeking `nudge` past the stuck position; the attempt is abandoned when
    /// the seek fails or playback is still frozen afterwards.
    pub fn health_check(&mut self, nudge: Duration, scheduler: &mut impl Scheduler) -> Option<Failure> {
        let position = match self
            .watchdog
            .health_check(self.engine.rate(), self.engine.position())
        {
            Health::Frozen { position } => position,
            Health::Unrecovered { position } => {
                return self.fail(
                    PlaybackError::Frozen(format!("still stuck at {position:?} after recovery")),
                    scheduler,
                );
            }
            Health::Idle | Health::Healthy => return None,
        };

        tracing::warn!(surface = %self.id, ?position, "playback frozen, nudging forward");

        match self
            .engine
            .seek(position + nudge)
            .and_then(|()| self.engine.play())
        {
            Ok(()) => None,
            Err(why) => self.fail(PlaybackError::Frozen(format!("{why:#}")), scheduler),
        }
    }

    /// Stop the engine and detach the layer.
    pub fn graceful_teardown(mut self, scheduler: &mut impl Scheduler) {
        tracing::debug!(surface = %self.id, output = self.output.name, "tearing down surface");
        self.halt(scheduler);
        self.layer.detach();
    }

    fn fail(&mut self, error: PlaybackError, scheduler: &mut impl Scheduler) -> Option<Failure> {
        if !self.watchdog.report_failure() {
            return None;
        }

        let generation = self.watchdog.generation();
        let asset = self.asset.take();
        self.halt(scheduler);

        let asset = asset?;
        tracing::warn!(surface = %self.id, asset = %asset.id, %error, "playback failed");
        Some(Failure {
            surface: self.id,
            generation,
            asset,
            error,
        })
    }

    /// Abandon the current attempt without reporting a failure.
    pub fn stop(&mut self, scheduler: &mut impl Scheduler) {
        self.asset = None;
        self.halt(scheduler);
    }

    /// Release the engine and forget the current attempt.
    fn halt(&mut self, scheduler: &mut impl Scheduler) {
        if let Some(timer) = self.watchdog.reset() {
            scheduler.cancel(timer);
        }
        self.engine.stop();
        self.unpresented = None;
    }

    #[must_use]
    pub fn id(&self) -> SurfaceId {
        self.id
    }

    /// The asset this surface is validating or playing.
    #[must_use]
    pub fn asset(&self) -> Option<&Asset> {
        self.asset.as_ref()
    }

    #[must_use]
    pub fn phase(&self) -> Phase {
        self.watchdog.phase()
    }

    #[must_use]
    pub fn layer(&self) -> &L {
        &self.layer
    }

    pub fn layer_mut(&mut self) -> &mut L {
        &mut self.layer
    }
}
