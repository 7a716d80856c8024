// SPDX-License-Identifier: MPL-2.0

//! Deterministic stand-ins for the scheduler, outputs, engines and catalog.

use std::{
    cell::RefCell,
    collections::VecDeque,
    rc::Rc,
    time::Duration,
};

use rand::seq::IndexedRandom;

use crate::{
    catalog::{Asset, Catalog},
    engine::{EngineEvent, PlaybackEngine, VideoFrame},
    scheduler::{Job, Scheduler, TimerId},
    session::{Session, Timings},
    surface::RenderLayer,
    topology::{OutputInfo, Topology},
    validate::{MediaInfo, MediaProbe, ProbeReport, Ticket},
};

pub type TestSession = Session<FakeTopology, ManualScheduler, MemoryCatalog, RecordingProbe>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerState {
    Armed,
    Cancelled,
    Fired,
}

#[derive(Debug)]
struct ManualTimer {
    id: TimerId,
    delay: Duration,
    job: Job,
    state: TimerState,
}

/// Scheduler whose timers only fire when a test says so.
#[derive(Debug, Default)]
pub struct ManualScheduler {
    next: u64,
    timers: Vec<ManualTimer>,
}

impl ManualScheduler {
    /// Timers for `job` that are still armed.
    pub fn armed(&self, job: Job) -> Vec<TimerId> {
        self.timers
            .iter()
            .filter(|t| t.job == job && t.state == TimerState::Armed)
            .map(|t| t.id)
            .collect()
    }

    /// Every timer ever armed for `job`.
    pub fn armed_ever(&self, job: Job) -> Vec<TimerId> {
        self.timers
            .iter()
            .filter(|t| t.job == job)
            .map(|t| t.id)
            .collect()
    }

    pub fn is_cancelled(&self, id: TimerId) -> bool {
        self.timers
            .iter()
            .any(|t| t.id == id && t.state == TimerState::Cancelled)
    }

    pub fn delay_of(&self, id: TimerId) -> Option<Duration> {
        self.timers.iter().find(|t| t.id == id).map(|t| t.delay)
    }

    fn set_state(&mut self, id: TimerId, state: TimerState) {
        if let Some(timer) = self
            .timers
            .iter_mut()
            .find(|t| t.id == id && t.state == TimerState::Armed)
        {
            timer.state = state;
        }
    }
}

impl Scheduler for ManualScheduler {
    fn arm(&mut self, delay: Duration, job: Job) -> TimerId {
        self.next += 1;
        let id = TimerId(self.next);
        self.timers.push(ManualTimer {
            id,
            delay,
            job,
            state: TimerState::Armed,
        });
        id
    }

    fn cancel(&mut self, timer: TimerId) {
        self.set_state(timer, TimerState::Cancelled);
    }

    fn fired(&mut self, timer: TimerId) {
        self.set_state(timer, TimerState::Fired);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCall {
    Load(String),
    Play,
    Pause,
    Stop,
    Seek(Duration),
}

#[derive(Debug, Default)]
struct EngineState {
    journal: Vec<EngineCall>,
    events: VecDeque<EngineEvent>,
    frames: VecDeque<VideoFrame>,
    position: Option<Duration>,
    running: bool,
    fail_seeks: bool,
}

/// Engine that records calls. Clones share state, so a test can keep a
/// handle after the engine moved into a surface.
#[derive(Debug, Clone, Default)]
pub struct FakeEngine(Rc<RefCell<EngineState>>);

impl FakeEngine {
    pub fn journal(&self) -> Vec<EngineCall> {
        self.0.borrow().journal.clone()
    }

    pub fn emit(&self, event: EngineEvent) {
        self.0.borrow_mut().events.push_back(event);
    }

    pub fn push_frame(&self, frame: VideoFrame) {
        self.0.borrow_mut().frames.push_back(frame);
    }

    pub fn set_position(&self, position: Option<Duration>) {
        self.0.borrow_mut().position = position;
    }

    pub fn fail_seeks(&self) {
        self.0.borrow_mut().fail_seeks = true;
    }

    fn record(&self, call: EngineCall) {
        self.0.borrow_mut().journal.push(call);
    }
}

impl PlaybackEngine for FakeEngine {
    fn load(&mut self, asset: &Asset) -> eyre::Result<()> {
        self.record(EngineCall::Load(asset.id.to_string()));
        Ok(())
    }

    fn play(&mut self) -> eyre::Result<()> {
        self.record(EngineCall::Play);
        self.0.borrow_mut().running = true;
        Ok(())
    }

    fn pause(&mut self) -> eyre::Result<()> {
        self.record(EngineCall::Pause);
        self.0.borrow_mut().running = false;
        Ok(())
    }

    fn stop(&mut self) {
        self.record(EngineCall::Stop);
        let mut state = self.0.borrow_mut();
        state.running = false;
        state.events.clear();
    }

    fn seek(&mut self, position: Duration) -> eyre::Result<()> {
        self.record(EngineCall::Seek(position));
        if self.0.borrow().fail_seeks {
            eyre::bail!("seek rejected");
        }
        Ok(())
    }

    fn position(&self) -> Option<Duration> {
        self.0.borrow().position
    }

    fn rate(&self) -> f64 {
        if self.0.borrow().running { 1.0 } else { 0.0 }
    }

    fn poll_events(&mut self) -> Vec<EngineEvent> {
        self.0.borrow_mut().events.drain(..).collect()
    }

    fn take_frame(&mut self) -> Option<VideoFrame> {
        self.0.borrow_mut().frames.pop_front()
    }
}

#[derive(Debug, Default)]
struct LayerState {
    shown: Vec<VideoFrame>,
    /// Number of upcoming `present` calls to turn down.
    rejecting: usize,
    detached: bool,
}

#[derive(Debug, Clone, Default)]
pub struct FakeLayer(Rc<RefCell<LayerState>>);

impl FakeLayer {
    pub fn presented(&self) -> usize {
        self.0.borrow().shown.len()
    }

    pub fn shown(&self) -> Vec<VideoFrame> {
        self.0.borrow().shown.clone()
    }

    /// Make the next `count` presents fail, like a layer awaiting configure.
    pub fn reject(&self, count: usize) {
        self.0.borrow_mut().rejecting = count;
    }

    pub fn detached(&self) -> bool {
        self.0.borrow().detached
    }
}

impl RenderLayer for FakeLayer {
    fn present(&mut self, frame: &VideoFrame) -> bool {
        let mut state = self.0.borrow_mut();
        if state.rejecting > 0 {
            state.rejecting -= 1;
            return false;
        }
        state.shown.push(frame.clone());
        true
    }

    fn detach(&mut self) {
        self.0.borrow_mut().detached = true;
    }
}

/// Outputs numbered from zero. Keeps a handle to every engine and layer it built.
#[derive(Debug, Default)]
pub struct FakeTopology {
    pub outputs: Vec<OutputInfo<u32>>,
    pub created: usize,
    pub engines: Vec<FakeEngine>,
    pub layers: Vec<FakeLayer>,
}

impl FakeTopology {
    pub fn with_outputs(count: usize) -> Self {
        let mut topology = Self::default();
        for _ in 0..count {
            topology.add_output();
        }
        topology
    }

    pub fn add_output(&mut self) {
        let index = self.outputs.len() as u32;
        self.outputs.push(OutputInfo {
            output: index,
            name: format!("HDMI-{index}"),
            width: 1920,
            height: 1080,
            scale: 1,
        });
    }
}

impl Topology for FakeTopology {
    type Output = u32;
    type Engine = FakeEngine;
    type Layer = FakeLayer;

    fn current_outputs(&self) -> Vec<OutputInfo<u32>> {
        self.outputs.clone()
    }

    fn create_surface(&mut self, _output: &OutputInfo<u32>) -> eyre::Result<(FakeLayer, FakeEngine)> {
        self.created += 1;
        let (layer, engine) = (FakeLayer::default(), FakeEngine::default());
        self.layers.push(layer.clone());
        self.engines.push(engine.clone());
        Ok((layer, engine))
    }
}

#[derive(Debug, Default)]
pub struct MemoryCatalog {
    pub assets: Vec<Asset>,
    pub last_played: Option<Asset>,
    /// Every asset passed to `record_played`, in order.
    pub recorded: Vec<Asset>,
}

impl MemoryCatalog {
    pub fn new(assets: Vec<Asset>) -> Self {
        Self {
            assets,
            ..Self::default()
        }
    }
}

impl Catalog for MemoryCatalog {
    fn list_assets(&self) -> Vec<Asset> {
        self.assets.clone()
    }

    fn random_asset(&mut self) -> Option<Asset> {
        self.assets.choose(&mut rand::rng()).cloned()
    }

    fn last_played_asset(&self) -> Option<Asset> {
        self.last_played.clone()
    }

    fn record_played(&mut self, asset: &Asset) {
        self.last_played = Some(asset.clone());
        self.recorded.push(asset.clone());
    }
}

#[derive(Debug, Default)]
pub struct RecordingProbe {
    pub requests: Vec<(Ticket, Asset)>,
}

impl MediaProbe for RecordingProbe {
    fn request(&mut self, ticket: Ticket, asset: &Asset) {
        self.requests.push((ticket, asset.clone()));
    }
}

/// A stream asset that passes source checks.
pub fn remote(name: &str) -> Asset {
    Asset::remote(name, format!("https://example.org/{name}.mp4"))
}

pub fn playable(ticket: Ticket, asset: &Asset) -> ProbeReport {
    ProbeReport {
        ticket,
        asset: asset.id.clone(),
        outcome: Ok(MediaInfo {
            playable: true,
            duration: Some(Duration::from_secs(30)),
            reason: None,
        }),
    }
}

pub fn unplayable(ticket: Ticket, asset: &Asset) -> ProbeReport {
    ProbeReport {
        ticket,
        asset: asset.id.clone(),
        outcome: Ok(MediaInfo {
            playable: false,
            duration: None,
            reason: Some("no suitable decoder".to_owned()),
        }),
    }
}

pub fn session_with_catalog(outputs: usize, assets: Vec<Asset>, last_played: Option<Asset>) -> TestSession {
    let catalog = MemoryCatalog {
        last_played,
        ..MemoryCatalog::new(assets)
    };

    Session::new(
        FakeTopology::with_outputs(outputs),
        ManualScheduler::default(),
        catalog,
        RecordingProbe::default(),
        Timings::default(),
    )
}

/// A session over `outputs` outputs and a catalog of `assets` streams.
pub fn session_with(outputs: usize, assets: usize) -> TestSession {
    let assets = (0..assets).map(|i| remote(&format!("asset-{i}"))).collect();
    session_with_catalog(outputs, assets, None)
}

/// Fire every armed timer for `job`. Returns how many fired.
pub fn fire(session: &mut TestSession, job: Job) -> usize {
    let timers = session.scheduler.armed(job);
    for timer in &timers {
        session.run_job(*timer, job);
    }
    timers.len()
}

/// Answer every outstanding probe request with `report`.
pub fn complete_probes(session: &mut TestSession, report: fn(Ticket, &Asset) -> ProbeReport) {
    let requests = std::mem::take(&mut session.probe.requests);
    for (ticket, asset) in requests {
        session.probe_finished(report(ticket, &asset));
    }
}
