// SPDX-License-Identifier: MPL-2.0

//! Output topology.
//!
//! [`Topology`] answers "which outputs exist right now" and builds the
//! per-output playback pieces. [`WaylandTopology`] implements it on top of
//! sctk's output tracking and additionally follows display sleep through
//! `zwlr_output_power_management_v1` when the compositor offers it.

use eyre::WrapErr;
use sctk::{
    compositor::CompositorState,
    output::OutputState,
    reexports::client::{
        Connection, Dispatch, QueueHandle, WEnum, globals::GlobalList, protocol::wl_output::WlOutput,
    },
    shell::wlr_layer::LayerShell,
};
use wayland_protocols_wlr::output_power_management::v1::client::{
    zwlr_output_power_manager_v1::{self, ZwlrOutputPowerManagerV1},
    zwlr_output_power_v1::{self, ZwlrOutputPowerV1},
};

use crate::{
    CosmicBgVideo,
    engine::{PlaybackEngine, gst::GstEngine},
    layer::VideoLayer,
    surface::RenderLayer,
};

/// One output and its size in buffer pixels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputInfo<O> {
    pub output: O,
    pub name: String,
    pub width: u32,
    pub height: u32,
    /// Integer scale between logical and buffer pixels.
    pub scale: u32,
}

pub trait Topology {
    type Output: Clone;
    type Engine: PlaybackEngine;
    type Layer: RenderLayer;

    /// The outputs present right now.
    fn current_outputs(&self) -> Vec<OutputInfo<Self::Output>>;

    /// Build a rendering layer and a fresh engine sized to `output`.
    fn create_surface(
        &mut self,
        output: &OutputInfo<Self::Output>,
    ) -> eyre::Result<(Self::Layer, Self::Engine)>;
}

/// A display power transition worth reacting to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerChange {
    Sleep,
    Wake,
}

#[derive(Debug)]
struct OutputPower {
    output: WlOutput,
    power: ZwlrOutputPowerV1,
    asleep: bool,
}

#[derive(Debug)]
pub struct WaylandTopology {
    pub output_state: OutputState,
    pub compositor_state: CompositorState,
    pub layer_shell: LayerShell,
    qh: QueueHandle<CosmicBgVideo>,
    power_manager: Option<ZwlrOutputPowerManagerV1>,
    power: Vec<OutputPower>,
}

impl WaylandTopology {
    pub fn bind(globals: &GlobalList, qh: &QueueHandle<CosmicBgVideo>) -> eyre::Result<Self> {
        let power_manager = match globals.bind::<ZwlrOutputPowerManagerV1, _, _>(qh, 1..=1, ()) {
            Ok(manager) => Some(manager),
            Err(why) => {
                tracing::info!(%why, "output power management unavailable, display sleep is not tracked");
                None
            }
        };

        Ok(Self {
            output_state: OutputState::new(globals, qh),
            compositor_state: CompositorState::bind(globals, qh)
                .wrap_err("wl_compositor not available")?,
            layer_shell: LayerShell::bind(globals, qh).wrap_err("layer shell not available")?,
            qh: qh.clone(),
            power_manager,
            power: Vec::new(),
        })
    }

    /// Follow the power mode of a newly announced output.
    pub fn track_power(&mut self, output: &WlOutput) {
        let Some(manager) = self.power_manager.as_ref() else {
            return;
        };

        if self.power.iter().any(|p| &p.output == output) {
            return;
        }

        let power = manager.get_output_power(output, &self.qh, output.clone());
        self.power.push(OutputPower {
            output: output.clone(),
            power,
            asleep: false,
        });
    }

    pub fn forget_power(&mut self, output: &WlOutput) {
        self.power.retain(|p| {
            if &p.output == output {
                p.power.destroy();
                false
            } else {
                true
            }
        });
    }

    /// Record a power mode event and report whether it changed anything.
    pub fn power_mode(&mut self, output: &WlOutput, on: bool) -> Option<PowerChange> {
        let entry = self.power.iter_mut().find(|p| &p.output == output)?;
        power_transition(&mut entry.asleep, on)
    }
}

/// Apply a power mode to the `asleep` flag of one output. Repeated modes are
/// not transitions.
fn power_transition(asleep: &mut bool, on: bool) -> Option<PowerChange> {
    match (*asleep, on) {
        (false, false) => {
            *asleep = true;
            Some(PowerChange::Sleep)
        }
        (true, true) => {
            *asleep = false;
            Some(PowerChange::Wake)
        }
        _ => None,
    }
}

impl Topology for WaylandTopology {
    type Output = WlOutput;
    type Engine = GstEngine;
    type Layer = VideoLayer;

    fn current_outputs(&self) -> Vec<OutputInfo<WlOutput>> {
        self.output_state
            .outputs()
            .filter_map(|output| {
                let info = self.output_state.info(&output)?;
                let (width, height) = info.logical_size?;
                let scale = info.scale_factor.max(1) as u32;

                Some(OutputInfo {
                    name: info.name.clone().unwrap_or_else(|| format!("output-{}", info.id)),
                    width: width.max(0) as u32 * scale,
                    height: height.max(0) as u32 * scale,
                    scale,
                    output,
                })
            })
            .collect()
    }

    fn create_surface(
        &mut self,
        output: &OutputInfo<WlOutput>,
    ) -> eyre::Result<(VideoLayer, GstEngine)> {
        let engine = GstEngine::new(output.width, output.height)
            .wrap_err_with(|| format!("failed to create video engine for {}", output.name))?;

        let layer = VideoLayer::new(
            &self.compositor_state,
            &self.layer_shell,
            &self.qh,
            &output.output,
            output.scale,
        );

        Ok((layer, engine))
    }
}

impl Dispatch<ZwlrOutputPowerManagerV1, ()> for CosmicBgVideo {
    fn event(
        _state: &mut Self,
        _manager: &ZwlrOutputPowerManagerV1,
        _event: zwlr_output_power_manager_v1::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
    }
}

impl Dispatch<ZwlrOutputPowerV1, WlOutput> for CosmicBgVideo {
    fn event(
        state: &mut Self,
        _power: &ZwlrOutputPowerV1,
        event: zwlr_output_power_v1::Event,
        output: &WlOutput,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        match event {
            zwlr_output_power_v1::Event::Mode { mode } => {
                let on = matches!(mode, WEnum::Value(zwlr_output_power_v1::Mode::On));
                match state.session.topology_mut().power_mode(output, on) {
                    Some(PowerChange::Sleep) => {
                        tracing::info!("display went to sleep");
                        state.session.topology_changing();
                    }
                    Some(PowerChange::Wake) => {
                        tracing::info!("display woke up");
                        state.session.topology_settled();
                    }
                    None => {}
                }
                state.publish();
            }
            zwlr_output_power_v1::Event::Failed => {
                tracing::debug!("output power control is no longer valid");
                state.session.topology_mut().forget_power(output);
            }
            _ => {}
        }
    }
}
