// SPDX-License-Identifier: MPL-2.0

//! Session state machine and surface recreation.
//!
//! [`Session`] is the single owner of everything playback related: the
//! session state, the surfaces, the pending and current assets, and the
//! timers. It lives on the control thread and every notification, timer and
//! probe result is handed to it by `&mut` reference.
//!
//! ```text
//!            topology_changing / power_suspending
//!   Ready ----------------------------------------> Paused
//!     ^                                               |
//!     +---- recreate_surfaces (debounced) <-----------+
//! ```
//!
//! Leaving `Ready` releases every surface by reference only: the outputs they
//! were bound to may already be gone, so their engines and layers are parked
//! untouched and only shut down gracefully once the debounced recreation runs
//! against a stable topology.

use std::{collections::VecDeque, time::Duration};

use cosmic_bg_video_config::Config;

use crate::{
    catalog::{Asset, Catalog},
    error::PlaybackError,
    scheduler::{Job, Scheduler, TimerId, TimerSlot},
    surface::{Failure, ProbeOutcome, Surface, SurfaceId},
    topology::Topology,
    validate::{MediaProbe, ProbeReport},
};

pub type SurfaceOf<T> =
    Surface<<T as Topology>::Output, <T as Topology>::Engine, <T as Topology>::Layer>;

/// Whether playback operations may run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Ready,
    /// The topology is changing or the system is unstable.
    Paused,
}

/// Requested transport, independent of the session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Transport {
    #[default]
    Running,
    Paused,
}

/// Observable changes reported to the control surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    NowPlaying(Option<Asset>),
    PlaybackFailed { asset: Asset, error: PlaybackError },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOutcome {
    /// Applied to every surface.
    Executed,
    /// Recorded, and applied by the next successful recreation.
    Deferred,
}

/// Timing and threshold settings of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timings {
    pub debounce: Duration,
    pub stall_grace: Duration,
    pub health_check_interval: Duration,
    pub freeze_nudge: Duration,
    pub min_source_bytes: u64,
    pub max_consecutive_failures: u32,
}

impl Default for Timings {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for Timings {
    fn from(config: &Config) -> Self {
        Self {
            debounce: config.debounce(),
            stall_grace: config.stall_grace(),
            health_check_interval: config.health_check_interval().max(Duration::from_millis(1)),
            freeze_nudge: config.freeze_nudge(),
            min_source_bytes: config.min_source_bytes,
            max_consecutive_failures: config.max_consecutive_failures.max(1),
        }
    }
}

pub struct Session<T: Topology, S, C, P> {
    pub(crate) state: SessionState,
    /// Set between a system suspend and the matching resume.
    pub(crate) suspended: bool,
    pub(crate) transport: Transport,
    pub(crate) topology: T,
    pub(crate) scheduler: S,
    pub(crate) catalog: C,
    pub(crate) probe: P,
    pub(crate) timings: Timings,
    pub(crate) surfaces: Vec<SurfaceOf<T>>,
    /// Surfaces released by an emergency teardown, awaiting graceful teardown.
    pub(crate) retired: Vec<SurfaceOf<T>>,
    next_surface: u64,
    recreation: TimerSlot,
    health: TimerSlot,
    pub(crate) pending: Option<Asset>,
    pub(crate) current: Option<Asset>,
    /// Incremented for every play attempt.
    pub(crate) generation: u64,
    /// The last generation whose failure was handled.
    pub(crate) handled: Option<u64>,
    pub(crate) consecutive_failures: u32,
    pub(crate) failures: VecDeque<Failure>,
    pub(crate) draining: bool,
    events: Vec<SessionEvent>,
}

impl<T, S, C, P> Session<T, S, C, P>
where
    T: Topology,
    S: Scheduler,
    C: Catalog,
    P: MediaProbe,
{
    pub fn new(topology: T, scheduler: S, catalog: C, probe: P, timings: Timings) -> Self {
        let current = catalog.last_played_asset();
        if let Some(asset) = current.as_ref() {
            tracing::info!(asset = %asset.id, "restoring last played asset");
        }

        Self {
            state: SessionState::Ready,
            suspended: false,
            transport: Transport::Running,
            topology,
            scheduler,
            catalog,
            probe,
            timings,
            surfaces: Vec::new(),
            retired: Vec::new(),
            next_surface: 0,
            recreation: TimerSlot::default(),
            health: TimerSlot::default(),
            pending: None,
            current,
            generation: 0,
            handled: None,
            consecutive_failures: 0,
            failures: VecDeque::new(),
            draining: false,
            events: Vec::new(),
        }
    }

    /// Arm the initial recreation and the periodic health check.
    pub fn start(&mut self) {
        self.recreation
            .arm(&mut self.scheduler, Duration::ZERO, Job::Recreate);
        self.arm_health_check();
    }

    /// Outputs are about to change.
    pub fn topology_changing(&mut self) {
        self.emergency_teardown();
    }

    /// Outputs finished changing.
    pub fn topology_settled(&mut self) {
        if self.suspended {
            tracing::debug!("topology settled while suspended, waiting for resume");
            return;
        }

        self.schedule_recreation();
    }

    pub fn power_suspending(&mut self) {
        tracing::info!("system suspending");
        self.suspended = true;
        self.emergency_teardown();
        self.recreation.cancel(&mut self.scheduler);
    }

    pub fn power_resumed(&mut self) {
        tracing::info!("system resumed");
        self.suspended = false;
        self.emergency_teardown();
        self.schedule_recreation();
    }

    /// Release every surface without calling into its engine or layer.
    ///
    /// Returns `false` if the session was already paused.
    pub fn emergency_teardown(&mut self) -> bool {
        if self.state == SessionState::Paused {
            return false;
        }

        self.state = SessionState::Paused;
        let released = self.surfaces.len();
        self.retired.append(&mut self.surfaces);
        tracing::info!(released, "session paused, surfaces released");
        true
    }

    /// (Re)start the debounce window for surface recreation.
    pub fn schedule_recreation(&mut self) {
        let delay = self.timings.debounce;
        tracing::debug!(?delay, "scheduling surface recreation");
        self.recreation
            .arm(&mut self.scheduler, delay, Job::Recreate);
    }

    /// Dispatch a fired timer.
    pub fn run_job(&mut self, timer: TimerId, job: Job) {
        self.scheduler.fired(timer);

        match job {
            Job::Recreate => {
                if self.recreation.take_if(timer) {
                    self.recreate_surfaces();
                }
            }
            Job::StallGrace(surface) => self.stall_expired(surface, timer),
            Job::HealthCheck => {
                if self.health.take_if(timer) {
                    self.health_check();
                    self.arm_health_check();
                }
            }
        }
    }

    /// Rebuild one surface per output, then resume playback.
    pub fn recreate_surfaces(&mut self) {
        let span = tracing::debug_span!("Session::recreate");
        let _handle = span.enter();

        self.recreation.cancel(&mut self.scheduler);
        self.state = SessionState::Ready;

        for surface in self.retired.drain(..).chain(self.surfaces.drain(..)) {
            surface.graceful_teardown(&mut self.scheduler);
        }

        for output in self.topology.current_outputs() {
            match self.topology.create_surface(&output) {
                Ok((layer, engine)) => {
                    self.next_surface += 1;
                    let id = SurfaceId(self.next_surface);
                    tracing::info!(
                        surface = %id,
                        output = output.name,
                        width = output.width,
                        height = output.height,
                        "surface created"
                    );
                    self.surfaces.push(Surface::new(id, output, layer, engine));
                }
                Err(why) => {
                    tracing::error!(?why, output = output.name, "failed to create surface");
                }
            }
        }

        if self.surfaces.is_empty() {
            tracing::warn!("no outputs available, session is ready without surfaces");
            return;
        }

        self.consecutive_failures = 0;
        self.resume_after_recreation();
    }

    /// Apply an asynchronous probe result.
    pub fn probe_finished(&mut self, report: ProbeReport) {
        let running = self.transport == Transport::Running;

        let Some(surface) = self
            .surfaces
            .iter_mut()
            .find(|surface| surface.id() == report.ticket.surface)
        else {
            tracing::debug!(surface = %report.ticket.surface, asset = %report.asset, "probe result for a released surface");
            return;
        };

        match surface.probe_finished(report, running, &mut self.scheduler) {
            ProbeOutcome::Stale => {}
            ProbeOutcome::Started => self.consecutive_failures = 0,
            ProbeOutcome::Failed(failure) => {
                self.failures.push_back(failure);
                self.drain_failures();
            }
        }
    }

    /// Pump engine signals and present new frames.
    pub fn tick(&mut self) {
        for surface in &mut self.surfaces {
            if let Some(failure) = surface.pump(self.timings.stall_grace, &mut self.scheduler) {
                self.failures.push_back(failure);
            }
            surface.render();
        }

        self.drain_failures();
    }

    pub fn health_check(&mut self) {
        for surface in &mut self.surfaces {
            if let Some(failure) = surface.health_check(self.timings.freeze_nudge, &mut self.scheduler) {
                self.failures.push_back(failure);
            }
        }

        self.drain_failures();
    }

    fn stall_expired(&mut self, id: SurfaceId, timer: TimerId) {
        let Some(surface) = self.surfaces.iter_mut().find(|surface| surface.id() == id) else {
            return;
        };

        if let Some(failure) = surface.stall_expired(timer, self.timings.stall_grace, &mut self.scheduler) {
            self.failures.push_back(failure);
            self.drain_failures();
        }
    }

    fn arm_health_check(&mut self) {
        let interval = self.timings.health_check_interval;
        self.health
            .arm(&mut self.scheduler, interval, Job::HealthCheck);
    }

    /// Tear down every surface gracefully and stop all timers.
    pub fn shutdown(&mut self) {
        tracing::info!("shutting down session");
        self.recreation.cancel(&mut self.scheduler);
        self.health.cancel(&mut self.scheduler);

        for surface in self.retired.drain(..).chain(self.surfaces.drain(..)) {
            surface.graceful_teardown(&mut self.scheduler);
        }
    }

    pub fn set_timings(&mut self, timings: Timings) {
        self.timings = timings;
    }

    pub(crate) fn emit(&mut self, event: SessionEvent) {
        self.events.push(event);
    }

    /// Events produced since the previous call.
    pub fn drain_events(&mut self) -> Vec<SessionEvent> {
        std::mem::take(&mut self.events)
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.state == SessionState::Ready
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    #[must_use]
    pub fn currently_playing_asset(&self) -> Option<&Asset> {
        self.current.as_ref()
    }

    #[must_use]
    pub fn pending_asset(&self) -> Option<&Asset> {
        self.pending.as_ref()
    }

    #[must_use]
    pub fn surfaces(&self) -> &[SurfaceOf<T>] {
        &self.surfaces
    }

    pub fn surfaces_mut(&mut self) -> &mut [SurfaceOf<T>] {
        &mut self.surfaces
    }

    pub fn topology_mut(&mut self) -> &mut T {
        &mut self.topology
    }

    pub fn catalog_mut(&mut self) -> &mut C {
        &mut self.catalog
    }

    pub fn probe_mut(&mut self) -> &mut P {
        &mut self.probe
    }
}
