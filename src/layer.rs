// SPDX-License-Identifier: MPL-2.0

use sctk::{
    compositor::CompositorState,
    reexports::client::{
        QueueHandle,
        protocol::{wl_output::WlOutput, wl_shm, wl_surface::WlSurface},
    },
    shell::{
        WaylandSurface,
        wlr_layer::{Anchor, KeyboardInteractivity, Layer, LayerShell, LayerSurface, LayerSurfaceConfigure},
    },
    shm::{Shm, slot::SlotPool},
};

use crate::{CosmicBgVideo, engine::VideoFrame, surface::RenderLayer};

/// A background layer surface on one output, fed with shm buffers.
#[derive(Debug)]
pub struct VideoLayer {
    layer: LayerSurface,
    qh: QueueHandle<CosmicBgVideo>,
    pool: Option<SlotPool>,
    /// Logical size from the last configure.
    size: Option<(u32, u32)>,
    scale: u32,
    frame_pending: bool,
    detached: bool,
}

impl VideoLayer {
    pub fn new(
        compositor: &CompositorState,
        layer_shell: &LayerShell,
        qh: &QueueHandle<CosmicBgVideo>,
        output: &WlOutput,
        scale: u32,
    ) -> Self {
        let surface = compositor.create_surface(qh);
        let layer = layer_shell.create_layer_surface(
            qh,
            surface,
            Layer::Background,
            Some("wallpaper"),
            Some(output),
        );

        layer.set_anchor(Anchor::all());
        layer.set_exclusive_zone(-1);
        layer.set_keyboard_interactivity(KeyboardInteractivity::None);
        layer.set_size(0, 0);
        layer.wl_surface().set_buffer_scale(scale as i32);
        layer.commit();

        Self {
            layer,
            qh: qh.clone(),
            pool: None,
            size: None,
            scale,
            frame_pending: false,
            detached: false,
        }
    }

    #[must_use]
    pub fn is(&self, layer: &LayerSurface) -> bool {
        &self.layer == layer
    }

    #[must_use]
    pub fn wl_surface(&self) -> &WlSurface {
        self.layer.wl_surface()
    }

    /// Size the shm pool for the configured size.
    pub fn configure(&mut self, shm: &Shm, configure: &LayerSurfaceConfigure) {
        let (width, height) = configure.new_size;
        self.size = Some((width, height));

        let len = (width * self.scale) as usize * (height * self.scale) as usize * 4;
        if let Some(pool) = self.pool.as_mut() {
            if let Err(why) = pool.resize(len) {
                tracing::error!(?why, "failed to resize the shm pool");
            }
        } else {
            match SlotPool::new(len.max(4), shm) {
                Ok(pool) => self.pool = Some(pool),
                Err(why) => tracing::error!(?why, "failed to create shm pool"),
            }
        }

        tracing::debug!(width, height, scale = self.scale, "layer configured");
    }

    /// The compositor is ready for the next frame.
    pub fn frame_done(&mut self) {
        self.frame_pending = false;
    }
}

impl RenderLayer for VideoLayer {
    fn present(&mut self, frame: &VideoFrame) -> bool {
        if self.detached || self.frame_pending || self.size.is_none() {
            return false;
        }

        let Some(pool) = self.pool.as_mut() else {
            return false;
        };

        let (width, height) = (frame.width as i32, frame.height as i32);
        let stride = width * 4;

        let (buffer, canvas) =
            match pool.create_buffer(width, height, stride, wl_shm::Format::Xrgb8888) {
                Ok(created) => created,
                Err(why) => {
                    tracing::error!(?why, "failed to create shm buffer");
                    return false;
                }
            };

        // BGRx in memory is Xrgb8888 on little endian.
        let len = canvas.len().min(frame.data.len());
        canvas[..len].copy_from_slice(&frame.data[..len]);

        let wl_surface = self.layer.wl_surface();

        // Damage the entire window
        wl_surface.damage_buffer(0, 0, width, height);

        // Request our next frame
        wl_surface.frame(&self.qh, wl_surface.clone());

        // Attach and commit to present.
        if let Err(why) = buffer.attach_to(wl_surface) {
            tracing::error!(?why, "buffer attachment failed");
            return false;
        }

        wl_surface.commit();
        self.frame_pending = true;
        true
    }

    fn detach(&mut self) {
        if self.detached {
            return;
        }

        self.detached = true;
        let wl_surface = self.layer.wl_surface();
        wl_surface.attach(None, 0, 0);
        wl_surface.commit();
        self.pool = None;
    }
}
