// SPDX-License-Identifier: MPL-2.0

//! Playback engines.
//!
//! A [`PlaybackEngine`] decodes one looping asset for one surface. Engines are
//! driven from the control thread only: asynchronous engine signals are queued
//! by the engine and drained with [`PlaybackEngine::poll_events`] on each tick.
//!
//! - [`gst`]: GStreamer-based engine decoding to BGRx frames sized to the output

pub mod gst;

use std::time::Duration;

use crate::catalog::Asset;

/// Asynchronous signal reported by an engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// Decoding or streaming error.
    Error(String),
    /// The engine entered a failed status and will not make progress.
    Failed(String),
    /// Playback is waiting for data.
    Stalled,
    /// Playback has data again after a stall.
    Recovered,
    /// Playback reached the running state.
    Started,
}

/// A decoded frame in BGRx layout with a tight stride.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoFrame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

pub trait PlaybackEngine {
    /// Prepare `asset` for playback without starting it.
    fn load(&mut self, asset: &Asset) -> eyre::Result<()>;

    fn play(&mut self) -> eyre::Result<()>;

    fn pause(&mut self) -> eyre::Result<()>;

    /// Release decoding resources and return to the unloaded state.
    fn stop(&mut self);

    fn seek(&mut self, position: Duration) -> eyre::Result<()>;

    /// Current playback position, if known.
    fn position(&self) -> Option<Duration>;

    /// Current playback rate; zero when not running.
    fn rate(&self) -> f64;

    /// Drain signals reported since the previous call.
    fn poll_events(&mut self) -> Vec<EngineEvent>;

    /// The newest decoded frame, if one arrived since the previous call.
    fn take_frame(&mut self) -> Option<VideoFrame>;
}
