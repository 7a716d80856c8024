// SPDX-License-Identifier: MPL-2.0

mod catalog;
mod catalog_watch;
mod dispatch;
mod engine;
mod error;
mod layer;
mod resume;
mod scheduler;
mod session;
mod surface;
#[cfg(test)]
mod testing;
mod topology;
mod validate;
mod watchdog;

use calloop::{
    LoopHandle,
    signals::{Signal, Signals},
    timer::{TimeoutAction, Timer},
};
use catalog::{Catalog, DirectoryCatalog};
use catalog_watch::CatalogWatch;
use cosmic_bg_video_config::{Config, state::State};
use cosmic_config::calloop::ConfigWatchSource;
use eyre::{WrapErr, eyre};
use scheduler::CalloopScheduler;
use sctk::{
    compositor::CompositorHandler,
    delegate_compositor, delegate_layer, delegate_output, delegate_registry, delegate_shm,
    output::{OutputHandler, OutputState},
    reexports::{
        calloop_wayland_source::WaylandSource,
        client::{
            Connection, QueueHandle,
            globals::registry_queue_init,
            protocol::{wl_output, wl_surface},
        },
    },
    registry::{ProvidesRegistryState, RegistryState},
    registry_handlers,
    shell::wlr_layer::{LayerShellHandler, LayerSurface, LayerSurfaceConfigure},
    shm::{Shm, ShmHandler},
};
use session::{Session, SessionEvent, Timings};
use topology::WaylandTopology;
use tracing_subscriber::prelude::*;
use validate::GstProbe;

type VideoSession = Session<WaylandTopology, CalloopScheduler<CosmicBgVideo>, DirectoryCatalog, GstProbe>;

fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    init_logger();

    let conn = Connection::connect_to_env().wrap_err("failed to connect to the wayland display")?;

    let mut event_loop: calloop::EventLoop<'static, CosmicBgVideo> = calloop::EventLoop::try_new()?;

    let (globals, mut event_queue) = registry_queue_init(&conn)?;
    let qh = event_queue.handle();

    let config_context = Config::helper();

    let config = match config_context.as_ref() {
        Ok(context) => Config::load(context),
        Err(why) => {
            tracing::error!(?why, "Config helper unavailable, falling back to defaults");
            Config::default()
        }
    };

    if let Ok(context) = config_context.as_ref() {
        match ConfigWatchSource::new(context) {
            Ok(source) => {
                event_loop
                    .handle()
                    .insert_source(source, |(config, keys), (), state| {
                        state.config_changed(Config::load(&config), &keys);
                    })
                    .map_err(|err| eyre!("{}", err))?;
            }
            Err(why) => tracing::error!(?why, "failed to watch config"),
        }
    }

    let (probe_tx, probe_rx) = calloop::channel::channel();
    event_loop
        .handle()
        .insert_source(probe_rx, |event, (), state: &mut CosmicBgVideo| {
            if let calloop::channel::Event::Msg(report) = event {
                state.session.probe_finished(report);
                state.publish();
            }
        })
        .map_err(|err| eyre!("{}", err))?;

    let scheduler = CalloopScheduler::new(event_loop.handle(), |state: &mut CosmicBgVideo, timer, job| {
        state.session.run_job(timer, job);
        state.publish();
    });

    let catalog_watch = match CatalogWatch::new(&event_loop.handle(), &config.source) {
        Ok(watch) => Some(watch),
        Err(why) => {
            tracing::warn!(?why, "catalog changes will not be picked up");
            None
        }
    };

    let mut session = Session::new(
        WaylandTopology::bind(&globals, &qh)?,
        scheduler,
        DirectoryCatalog::open(config.source.clone()),
        GstProbe::new(probe_tx, config.probe_timeout()),
        Timings::from(&config),
    );

    if config.paused {
        session.pause();
    }

    let mut bg_state = CosmicBgVideo {
        registry_state: RegistryState::new(&globals),
        shm: Shm::bind(&globals, &qh).wrap_err("wl_shm not available")?,
        session,
        config,
        loop_handle: event_loop.handle(),
        catalog_watch,
        exit: false,
    };

    // Learn the outputs before the first recreation runs.
    event_queue.roundtrip(&mut bg_state)?;
    event_queue.roundtrip(&mut bg_state)?;

    WaylandSource::new(conn, event_queue)
        .insert(event_loop.handle())
        .map_err(|err| eyre!("failed to insert wayland source: {}", err.error))?;

    let signals = Signals::new(&[Signal::SIGINT, Signal::SIGTERM, Signal::SIGUSR1, Signal::SIGUSR2])?;
    event_loop
        .handle()
        .insert_source(signals, |event, (), state| {
            match event.signal() {
                Signal::SIGUSR1 => state.session.power_suspending(),
                Signal::SIGUSR2 => state.session.power_resumed(),
                signal => {
                    tracing::info!(?signal, "exiting");
                    state.exit = true;
                }
            }
            state.publish();
        })
        .map_err(|err| eyre!("{}", err))?;

    event_loop
        .handle()
        .insert_source(
            Timer::from_duration(bg_state.config.tick_interval()),
            |_, _, state: &mut CosmicBgVideo| {
                state.session.tick();
                state.publish();
                TimeoutAction::ToDuration(state.config.tick_interval())
            },
        )
        .map_err(|err| eyre!("{}", err))?;

    bg_state.session.start();

    loop {
        event_loop.dispatch(None, &mut bg_state)?;

        if bg_state.exit {
            break;
        }
    }

    bg_state.session.shutdown();
    bg_state.publish();
    Ok(())
}

fn init_logger() {
    let log_level = std::env::var("RUST_LOG")
        .ok()
        .and_then(|level| level.parse::<tracing::Level>().ok())
        .unwrap_or(tracing::Level::INFO);

    let log_format = tracing_subscriber::fmt::format()
        .pretty()
        .without_time()
        .with_line_number(true)
        .with_file(true)
        .with_target(false)
        .with_thread_names(true);

    let log_filter = tracing_subscriber::fmt::Layer::default()
        .with_writer(std::io::stderr)
        .event_format(log_format)
        .with_filter(tracing_subscriber::filter::filter_fn(move |metadata| {
            metadata.level() == &tracing::Level::ERROR
                || (metadata.target().starts_with("cosmic_bg_video") && metadata.level() <= &log_level)
        }));

    tracing_subscriber::registry().with(log_filter).init();
}

pub struct CosmicBgVideo {
    registry_state: RegistryState,
    shm: Shm,
    pub(crate) session: VideoSession,
    config: Config,
    loop_handle: LoopHandle<'static, CosmicBgVideo>,
    catalog_watch: Option<CatalogWatch>,
    exit: bool,
}

impl CosmicBgVideo {
    /// Outputs changed; rebuild once they settle.
    fn outputs_changed(&mut self) {
        self.session.topology_changing();
        self.session.topology_settled();
        self.publish();
    }

    fn config_changed(&mut self, config: Config, keys: &[String]) {
        for key in keys {
            match key.as_str() {
                "paused" => {
                    if config.paused {
                        self.session.pause();
                    } else {
                        self.session.resume();
                    }
                }

                "selection" => {
                    let Some(id) = config.selection.as_deref() else {
                        continue;
                    };

                    match self.session.catalog_mut().find(id) {
                        Some(asset) => {
                            self.session.select_and_play(asset);
                        }
                        None => tracing::warn!(id, "selected asset is not in the catalog"),
                    }
                }

                "source" if self.session.catalog_mut().root() != config.source => {
                    tracing::info!(source = %config.source.display(), "catalog source changed");
                    *self.session.catalog_mut() = DirectoryCatalog::open(config.source.clone());
                    self.catalog_watch = match CatalogWatch::new(&self.loop_handle, &config.source) {
                        Ok(watch) => Some(watch),
                        Err(why) => {
                            tracing::warn!(?why, "catalog changes will not be picked up");
                            None
                        }
                    };
                }

                "probe_timeout_ms" => self.session.probe_mut().set_timeout(config.probe_timeout()),

                _ => {}
            }
        }

        self.session.set_timings(Timings::from(&config));
        self.config = config;
        self.publish();
    }

    /// Mirror session events into the state entry read by the control surface.
    pub(crate) fn publish(&mut self) {
        let events = self.session.drain_events();
        if events.is_empty() {
            return;
        }

        let mut current = None;
        let mut failure = None;

        for event in events {
            match event {
                SessionEvent::NowPlaying(asset) => {
                    current = Some(asset.map(|asset| asset.id.to_string()));
                }
                SessionEvent::PlaybackFailed { asset, error } => {
                    failure = Some(format!("{}: {error}", asset.id));
                }
            }
        }

        let result = State::modify(|state| {
            if let Some(current) = current {
                state.current = current;
            }
            if let Some(failure) = failure {
                state.last_failure = Some(failure);
            }
        });

        if let Err(why) = result {
            tracing::error!(?why, "failed to publish playback state");
        }
    }
}

impl CompositorHandler for CosmicBgVideo {
    fn scale_factor_changed(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        _surface: &wl_surface::WlSurface,
        _new_factor: i32,
    ) {
    }

    fn transform_changed(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        _surface: &wl_surface::WlSurface,
        _new_transform: wl_output::Transform,
    ) {
    }

    fn frame(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        surface: &wl_surface::WlSurface,
        _time: u32,
    ) {
        if let Some(surface) = self
            .session
            .surfaces_mut()
            .iter_mut()
            .find(|s| s.layer().wl_surface() == surface)
        {
            surface.layer_mut().frame_done();
        }
    }

    fn surface_enter(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        _surface: &wl_surface::WlSurface,
        _output: &wl_output::WlOutput,
    ) {
    }

    fn surface_leave(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        _surface: &wl_surface::WlSurface,
        _output: &wl_output::WlOutput,
    ) {
    }
}

impl OutputHandler for CosmicBgVideo {
    fn output_state(&mut self) -> &mut OutputState {
        &mut self.session.topology_mut().output_state
    }

    fn new_output(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        wl_output: wl_output::WlOutput,
    ) {
        tracing::debug!(?wl_output, "output added");
        self.session.topology_mut().track_power(&wl_output);
        self.outputs_changed();
    }

    fn update_output(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        wl_output: wl_output::WlOutput,
    ) {
        tracing::debug!(?wl_output, "output updated");
        self.outputs_changed();
    }

    fn output_destroyed(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        wl_output: wl_output::WlOutput,
    ) {
        tracing::debug!(?wl_output, "output removed");
        self.session.topology_mut().forget_power(&wl_output);
        self.outputs_changed();
    }
}

impl LayerShellHandler for CosmicBgVideo {
    fn closed(&mut self, _conn: &Connection, _qh: &QueueHandle<Self>, _layer: &LayerSurface) {
        tracing::debug!("layer surface closed by the compositor");
        self.outputs_changed();
    }

    fn configure(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        layer: &LayerSurface,
        configure: LayerSurfaceConfigure,
        _serial: u32,
    ) {
        if let Some(surface) = self
            .session
            .surfaces_mut()
            .iter_mut()
            .find(|s| s.layer().is(layer))
        {
            surface.layer_mut().configure(&self.shm, &configure);
        }
    }
}

impl ShmHandler for CosmicBgVideo {
    fn shm_state(&mut self) -> &mut Shm {
        &mut self.shm
    }
}

delegate_compositor!(CosmicBgVideo);
delegate_output!(CosmicBgVideo);
delegate_shm!(CosmicBgVideo);

delegate_layer!(CosmicBgVideo);

delegate_registry!(CosmicBgVideo);

impl ProvidesRegistryState for CosmicBgVideo {
    fn registry(&mut self) -> &mut RegistryState {
        &mut self.registry_state
    }
    registry_handlers![OutputState];
}
