// SPDX-License-Identifier: MPL-2.0

//! Control-surface commands and playback failure handling.
//!
//! Commands fan out to every surface, but only while the session is ready and
//! has surfaces; otherwise they are recorded and picked up by the next
//! recreation. Failures reported by surfaces are queued and drained in a loop
//! rather than handled recursively: handling one may start a fallback attempt
//! whose own synchronous failures land back in the same queue.

use crate::{
    catalog::{Asset, Catalog},
    scheduler::Scheduler,
    session::{CommandOutcome, Session, SessionEvent, SessionState, Transport},
    surface::Failure,
    topology::Topology,
    validate::MediaProbe,
};

impl<T, S, C, P> Session<T, S, C, P>
where
    T: Topology,
    S: Scheduler,
    C: Catalog,
    P: MediaProbe,
{
    fn accepts_commands(&self) -> bool {
        self.state == SessionState::Ready && !self.surfaces.is_empty()
    }

    pub fn play(&mut self, asset: Asset) -> CommandOutcome {
        self.transport = Transport::Running;

        if !self.accepts_commands() {
            tracing::info!(asset = %asset.id, "session not ready, deferring play request");
            self.current = Some(asset.clone());
            self.pending = Some(asset);
            return CommandOutcome::Deferred;
        }

        self.consecutive_failures = 0;
        self.start_playback(asset);
        CommandOutcome::Executed
    }

    /// Remember `asset` as the user's choice and play it.
    pub fn select_and_play(&mut self, asset: Asset) -> CommandOutcome {
        self.catalog.record_played(&asset);
        self.play(asset)
    }

    pub fn pause(&mut self) -> CommandOutcome {
        self.transport = Transport::Paused;

        if !self.accepts_commands() {
            return CommandOutcome::Deferred;
        }

        for surface in &mut self.surfaces {
            if let Some(failure) = surface.pause(&mut self.scheduler) {
                self.failures.push_back(failure);
            }
        }

        self.drain_failures();
        CommandOutcome::Executed
    }

    pub fn resume(&mut self) -> CommandOutcome {
        self.transport = Transport::Running;

        if !self.accepts_commands() {
            return CommandOutcome::Deferred;
        }

        for surface in &mut self.surfaces {
            if let Some(failure) = surface.resume(&mut self.scheduler) {
                self.failures.push_back(failure);
            }
        }

        self.drain_failures();
        CommandOutcome::Executed
    }

    /// Start a new play attempt of `asset` on every surface.
    pub(crate) fn start_playback(&mut self, asset: Asset) {
        self.generation += 1;
        let generation = self.generation;

        tracing::info!(
            asset = %asset.id,
            locator = %asset.locator,
            name = asset.name,
            generation,
            surfaces = self.surfaces.len(),
            "playing"
        );

        self.current = Some(asset.clone());
        self.emit(SessionEvent::NowPlaying(Some(asset.clone())));

        for surface in &mut self.surfaces {
            if let Some(failure) = surface.play(
                &asset,
                generation,
                self.timings.min_source_bytes,
                &mut self.probe,
                &mut self.scheduler,
            ) {
                self.failures.push_back(failure);
            }
        }

        self.drain_failures();
    }

    /// Handle queued failures until the queue is empty.
    pub(crate) fn drain_failures(&mut self) {
        if self.draining {
            return;
        }

        self.draining = true;
        while let Some(failure) = self.failures.pop_front() {
            self.playback_failed(failure);
        }
        self.draining = false;
    }

    fn playback_failed(&mut self, failure: Failure) {
        if failure.generation != self.generation || self.handled == Some(failure.generation) {
            tracing::debug!(
                surface = %failure.surface,
                generation = failure.generation,
                "failure already handled"
            );
            return;
        }

        self.handled = Some(failure.generation);
        self.consecutive_failures += 1;

        let Failure { asset, error, .. } = failure;
        tracing::warn!(
            asset = %asset.id,
            %error,
            validation = error.is_validation(),
            failures = self.consecutive_failures,
            "play attempt abandoned"
        );
        self.emit(SessionEvent::PlaybackFailed {
            asset: asset.clone(),
            error,
        });

        if self.consecutive_failures >= self.timings.max_consecutive_failures {
            tracing::error!(
                failures = self.consecutive_failures,
                "too many consecutive playback failures, going idle"
            );
            self.go_idle();
            return;
        }

        if !self.accepts_commands() {
            return;
        }

        match crate::resume::fallback(&mut self.catalog, &asset) {
            Some(next) => {
                tracing::info!(failed = %asset.id, next = %next.id, "falling back to another asset");
                self.catalog.record_played(&next);
                self.start_playback(next);
            }
            None => {
                tracing::warn!("no asset to fall back to, going idle");
                self.go_idle();
            }
        }
    }

    /// Stop every surface and forget the current asset.
    fn go_idle(&mut self) {
        for surface in &mut self.surfaces {
            surface.stop(&mut self.scheduler);
        }

        self.current = None;
        self.emit(SessionEvent::NowPlaying(None));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        engine::EngineEvent,
        error::PlaybackError,
        scheduler::Job,
        testing::{
            EngineCall, complete_probes, fire, playable, remote, session_with, session_with_catalog,
            unplayable,
        },
        watchdog::Phase,
    };

    #[test]
    fn commands_while_paused_only_record_intent() {
        let (a, b) = (remote("a"), remote("b"));
        let mut session = session_with_catalog(2, vec![a.clone(), b.clone()], Some(a.clone()));
        session.recreate_surfaces();
        complete_probes(&mut session, playable);
        session.topology_changing();

        let journals: Vec<_> = session.topology.engines.iter().map(|e| e.journal()).collect();
        let requests = session.probe.requests.len();
        let generation = session.generation;

        assert_eq!(session.play(b.clone()), CommandOutcome::Deferred);
        assert_eq!(session.pause(), CommandOutcome::Deferred);
        assert_eq!(session.resume(), CommandOutcome::Deferred);
        assert_eq!(session.select_and_play(a.clone()), CommandOutcome::Deferred);

        assert_eq!(session.state(), SessionState::Paused);
        assert!(session.surfaces().is_empty());
        assert_eq!(session.generation, generation);
        assert_eq!(session.probe.requests.len(), requests);
        let after: Vec<_> = session.topology.engines.iter().map(|e| e.journal()).collect();
        assert_eq!(journals, after);

        assert_eq!(session.pending_asset(), Some(&a));
        assert_eq!(session.currently_playing_asset(), Some(&a));
    }

    #[test]
    fn play_without_surfaces_is_deferred() {
        let a = remote("a");
        let mut session = session_with_catalog(0, vec![a.clone()], None);
        session.recreate_surfaces();

        assert!(session.is_ready());
        assert_eq!(session.play(a.clone()), CommandOutcome::Deferred);
        assert_eq!(session.pending_asset(), Some(&a));

        session.topology.add_output();
        session.topology_settled();
        fire(&mut session, Job::Recreate);
        assert_eq!(session.pending_asset(), None);
        assert_eq!(session.surfaces()[0].asset(), Some(&a));
    }

    #[test]
    fn pause_and_resume_fan_out() {
        let mut session = session_with(2, 1);
        session.recreate_surfaces();
        complete_probes(&mut session, playable);

        assert_eq!(session.pause(), CommandOutcome::Executed);
        assert_eq!(session.resume(), CommandOutcome::Executed);

        for engine in &session.topology.engines {
            let journal = engine.journal();
            assert_eq!(&journal[journal.len() - 2..], &[EngineCall::Pause, EngineCall::Play]);
        }
    }

    #[test]
    fn paused_transport_survives_recreation() {
        let mut session = session_with(1, 1);
        session.recreate_surfaces();
        complete_probes(&mut session, playable);
        session.pause();

        session.topology_changing();
        session.topology_settled();
        fire(&mut session, Job::Recreate);
        complete_probes(&mut session, playable);

        let journal = session.topology.engines[1].journal();
        assert_eq!(journal.last(), Some(&EngineCall::Pause));
        assert_eq!(session.surfaces()[0].phase(), Phase::Playing);
    }

    #[test]
    fn runtime_failure_signals_once_and_falls_back() {
        let (a, b) = (remote("a"), remote("b"));
        let mut session = session_with_catalog(3, vec![a.clone(), b.clone()], Some(a.clone()));
        session.recreate_surfaces();
        complete_probes(&mut session, playable);
        session.drain_events();

        for engine in &session.topology.engines {
            engine.emit(EngineEvent::Error("decode".into()));
        }
        session.tick();

        assert_eq!(
            session.drain_events(),
            vec![
                SessionEvent::PlaybackFailed {
                    asset: a.clone(),
                    error: PlaybackError::Engine("decode".into()),
                },
                SessionEvent::NowPlaying(Some(b.clone())),
            ]
        );
        assert_eq!(session.currently_playing_asset(), Some(&b));
        assert!(session.surfaces().iter().all(|s| s.asset() == Some(&b)));
        assert_eq!(session.catalog.recorded, vec![b]);
    }

    #[test]
    fn validation_failures_are_bounded() {
        let assets: Vec<_> = (0..3).map(|i| remote(&format!("broken-{i}"))).collect();
        let mut session = session_with_catalog(2, assets, None);
        session.timings.max_consecutive_failures = 4;
        session.recreate_surfaces();

        for _ in 0..10 {
            complete_probes(&mut session, unplayable);
        }

        let failures = session
            .drain_events()
            .into_iter()
            .filter(|event| matches!(event, SessionEvent::PlaybackFailed { .. }))
            .count();
        assert_eq!(failures, 4);
        assert_eq!(session.currently_playing_asset(), None);
        assert!(session.probe.requests.is_empty());
        assert!(session.surfaces().iter().all(|s| s.phase() == Phase::Idle));
    }

    #[test]
    fn successful_start_resets_failure_count() {
        let (a, b) = (remote("a"), remote("b"));
        let mut session = session_with_catalog(1, vec![a.clone(), b], Some(a));
        session.timings.max_consecutive_failures = 2;
        session.recreate_surfaces();

        complete_probes(&mut session, unplayable);
        assert_eq!(session.consecutive_failures, 1);
        complete_probes(&mut session, playable);
        assert_eq!(session.consecutive_failures, 0);
    }

    #[test]
    fn truncated_local_file_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.mp4");
        std::fs::write(&path, [0u8; 8]).unwrap();
        let partial = Asset::local(path);
        let good = remote("good");

        let mut session = session_with_catalog(1, vec![partial.clone(), good.clone()], None);
        session.timings.min_source_bytes = 1024;
        session.recreate_surfaces();
        complete_probes(&mut session, playable);

        assert_eq!(session.play(partial.clone()), CommandOutcome::Executed);
        assert_eq!(session.currently_playing_asset(), Some(&good));
        assert!(session.drain_events().contains(&SessionEvent::PlaybackFailed {
            asset: partial,
            error: PlaybackError::Truncated { size: 8, minimum: 1024 },
        }));
    }
}
