// SPDX-License-Identifier: MPL-2.0

//! GStreamer-based looping video engine.
//!
//! Each [`GstEngine`] owns one pipeline at a time:
//!
//! ```text
//! uridecodebin ! videoconvert ! videoscale ! BGRx@output size ! appsink
//! ```
//!
//! `decodebin` picks hardware decoders (VAAPI, NVDEC, V4L2) when their rank
//! allows it. The appsink callback runs on a streaming thread and only stores
//! the newest frame; everything else happens on the control thread:
//! - bus messages are drained by [`PlaybackEngine::poll_events`]
//! - end-of-stream seeks back to zero for seamless looping

use std::{
    sync::{Arc, Mutex, Once},
    time::Duration,
};

use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use tracing::{debug, error, info, warn};

use super::{EngineEvent, PlaybackEngine, VideoFrame};
use crate::{
    catalog::{Asset, Locator},
    error::PlaybackError,
    validate::MediaInfo,
};

/// NVIDIA decoders that register even when CUDA is unusable.
const NVIDIA_DECODERS: &[&str] = &[
    "nvh264dec",
    "nvh265dec",
    "nvvp9dec",
    "nvav1dec",
    "nvmpegvideodec",
    "nvmpeg4videodec",
];

/// Hardware decoders worth reporting at startup.
const HW_DECODERS: &[(&str, &str)] = &[
    ("nvh264dec", "NVDEC H.264 (NVIDIA)"),
    ("nvh265dec", "NVDEC H.265/HEVC (NVIDIA)"),
    ("nvvp9dec", "NVDEC VP9 (NVIDIA)"),
    ("nvav1dec", "NVDEC AV1 (NVIDIA)"),
    ("vah264dec", "VA H.264 (AMD/Intel)"),
    ("vah265dec", "VA H.265/HEVC (AMD/Intel)"),
    ("vavp9dec", "VA VP9 (AMD/Intel)"),
    ("vaav1dec", "VA AV1 (AMD/Intel)"),
    ("v4l2h264dec", "V4L2 H.264 (ARM)"),
    ("v4l2h265dec", "V4L2 H.265/HEVC (ARM)"),
];

/// Initialize GStreamer and fix up decoder ranks once per process.
pub fn init() -> eyre::Result<()> {
    gst::init()?;

    static SETUP: Once = Once::new();
    SETUP.call_once(|| {
        demote_broken_nvidia_decoders();
        log_available_decoders();
    });

    Ok(())
}

/// Demote NVIDIA decoders that fail to instantiate so `decodebin` falls back
/// to a working decoder instead of erroring out.
fn demote_broken_nvidia_decoders() {
    for name in NVIDIA_DECODERS {
        let Some(factory) = gst::ElementFactory::find(name) else {
            continue;
        };

        if factory.create().build().is_err() {
            warn!(
                decoder = name,
                "NVIDIA decoder failed to instantiate (CUDA unavailable?), demoting"
            );
            factory.set_rank(gst::Rank::NONE);
        }
    }
}

fn log_available_decoders() {
    let available: Vec<&str> = HW_DECODERS
        .iter()
        .filter(|(name, _)| {
            gst::ElementFactory::find(name).is_some_and(|factory| factory.rank() > gst::Rank::NONE)
        })
        .map(|(_, description)| *description)
        .collect();

    if available.is_empty() {
        warn!("No hardware video decoders found. Video will use software decoding.");
    } else {
        info!(decoders = ?available, "Available hardware video decoders");
    }
}

/// URI understood by `uridecodebin` for an asset.
pub fn asset_uri(asset: &Asset) -> eyre::Result<String> {
    match &asset.locator {
        Locator::Path(path) => Ok(gst::glib::filename_to_uri(path, None)?.to_string()),
        Locator::Url(url) => Ok(url.clone()),
    }
}

fn escape(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

fn pipeline_description(uri: &str, width: u32, height: u32) -> String {
    let caps = if width > 0 && height > 0 {
        format!("video/x-raw,format=BGRx,width={width},height={height},pixel-aspect-ratio=1/1")
    } else {
        "video/x-raw,format=BGRx".to_owned()
    };

    format!(
        concat!(
            "uridecodebin uri=\"{uri}\" ! ",
            "videoconvert ! videoscale ! ",
            "{caps} ! ",
            "appsink name=sink sync=true max-buffers=4 drop=true"
        ),
        uri = escape(uri),
        caps = caps,
    )
}

/// Newest frame delivered by the appsink.
#[derive(Default)]
struct FrameSlot {
    frame: Option<VideoFrame>,
    sequence: u64,
}

pub struct GstEngine {
    width: u32,
    height: u32,
    pipeline: Option<gst::Pipeline>,
    frames: Arc<Mutex<FrameSlot>>,
    /// Sequence of the last frame handed out by `take_frame`.
    taken: u64,
    uri: Option<String>,
    loops: u32,
}

impl GstEngine {
    /// Create an unloaded engine producing frames of `width`x`height`.
    pub fn new(width: u32, height: u32) -> eyre::Result<Self> {
        init()?;

        Ok(Self {
            width,
            height,
            pipeline: None,
            frames: Arc::default(),
            taken: 0,
            uri: None,
            loops: 0,
        })
    }

    fn seek_to_start(pipeline: &gst::Pipeline) -> eyre::Result<()> {
        let flags = gst::SeekFlags::FLUSH | gst::SeekFlags::KEY_UNIT | gst::SeekFlags::SNAP_BEFORE;
        pipeline.seek_simple(flags, gst::ClockTime::ZERO)?;
        Ok(())
    }
}

impl PlaybackEngine for GstEngine {
    fn load(&mut self, asset: &Asset) -> eyre::Result<()> {
        self.stop();

        let uri = asset_uri(asset)?;
        let description = pipeline_description(&uri, self.width, self.height);
        debug!(pipeline = %description, "Creating GStreamer pipeline");

        let pipeline = gst::parse::launch(&description)?
            .downcast::<gst::Pipeline>()
            .map_err(|_| eyre::eyre!("Failed to create pipeline"))?;

        let appsink = pipeline
            .by_name("sink")
            .ok_or_else(|| eyre::eyre!("Failed to get appsink from pipeline"))?
            .downcast::<gst_app::AppSink>()
            .map_err(|_| eyre::eyre!("Element 'sink' is not an AppSink"))?;

        // The preroll frame is all a paused surface ever shows.
        let preroll_frames = Arc::clone(&self.frames);
        let frames = Arc::clone(&self.frames);
        appsink.set_callbacks(
            gst_app::AppSinkCallbacks::builder()
                .new_preroll(move |appsink| store_sample(appsink.pull_preroll(), &preroll_frames))
                .new_sample(move |appsink| store_sample(appsink.pull_sample(), &frames))
                .build(),
        );

        pipeline
            .set_state(gst::State::Paused)
            .map_err(|e| eyre::eyre!("Failed to preroll pipeline: {:?}", e))?;

        self.pipeline = Some(pipeline);
        self.uri = Some(uri);
        self.loops = 0;
        Ok(())
    }

    fn play(&mut self) -> eyre::Result<()> {
        let pipeline = self
            .pipeline
            .as_ref()
            .ok_or_else(|| eyre::eyre!("No media loaded"))?;
        pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| eyre::eyre!("Failed to start pipeline: {:?}", e))?;
        Ok(())
    }

    fn pause(&mut self) -> eyre::Result<()> {
        let pipeline = self
            .pipeline
            .as_ref()
            .ok_or_else(|| eyre::eyre!("No media loaded"))?;
        pipeline
            .set_state(gst::State::Paused)
            .map_err(|e| eyre::eyre!("Failed to pause pipeline: {:?}", e))?;
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(pipeline) = self.pipeline.take() {
            if let Err(why) = pipeline.set_state(gst::State::Null) {
                error!(?why, uri = ?self.uri, "Failed to stop video pipeline");
            }
        }

        self.frames = Arc::default();
        self.taken = 0;
        self.uri = None;
    }

    fn seek(&mut self, position: Duration) -> eyre::Result<()> {
        let pipeline = self
            .pipeline
            .as_ref()
            .ok_or_else(|| eyre::eyre!("No media loaded"))?;
        let nanos = u64::try_from(position.as_nanos()).unwrap_or(u64::MAX);
        pipeline.seek_simple(
            gst::SeekFlags::FLUSH | gst::SeekFlags::ACCURATE,
            gst::ClockTime::from_nseconds(nanos),
        )?;
        Ok(())
    }

    fn position(&self) -> Option<Duration> {
        self.pipeline
            .as_ref()?
            .query_position::<gst::ClockTime>()
            .map(|position| Duration::from_nanos(position.nseconds()))
    }

    fn rate(&self) -> f64 {
        match &self.pipeline {
            Some(pipeline) if pipeline.current_state() == gst::State::Playing => 1.0,
            _ => 0.0,
        }
    }

    fn poll_events(&mut self) -> Vec<EngineEvent> {
        use gst::MessageView;

        let Some(pipeline) = self.pipeline.clone() else {
            return Vec::new();
        };
        let Some(bus) = pipeline.bus() else {
            return Vec::new();
        };

        let mut events = Vec::new();
        while let Some(msg) = bus.pop() {
            match msg.view() {
                MessageView::Eos(_) => {
                    self.loops += 1;
                    debug!(loops = self.loops, uri = ?self.uri, "Video EOS, seeking to start");
                    if let Err(why) = Self::seek_to_start(&pipeline) {
                        events.push(EngineEvent::Error(format!("loop seek failed: {why}")));
                    }
                }
                MessageView::Error(err) => {
                    error!(
                        src = ?err.src().map(|s| s.path_string()),
                        error = %err.error(),
                        "GStreamer pipeline error"
                    );
                    events.push(EngineEvent::Error(err.error().to_string()));
                }
                MessageView::Warning(warning) => {
                    warn!(
                        src = ?warning.src().map(|s| s.path_string()),
                        error = %warning.error(),
                        "GStreamer pipeline warning"
                    );
                }
                MessageView::Buffering(buffering) => {
                    if buffering.percent() < 100 {
                        events.push(EngineEvent::Stalled);
                    } else {
                        events.push(EngineEvent::Recovered);
                    }
                }
                MessageView::StateChanged(state) => {
                    if state.src().is_some_and(|s| s == &pipeline) {
                        debug!(old = ?state.old(), new = ?state.current(), "Pipeline state changed");
                        if state.current() == gst::State::Playing {
                            events.push(EngineEvent::Started);
                        }
                    }
                }
                _ => {}
            }
        }

        let (result, _, _) = pipeline.state(gst::ClockTime::ZERO);
        if let Err(why) = result {
            events.push(EngineEvent::Failed(format!("{why:?}")));
        }

        events
    }

    fn take_frame(&mut self) -> Option<VideoFrame> {
        let slot = self.frames.lock().ok()?;
        if slot.sequence == self.taken {
            return None;
        }
        self.taken = slot.sequence;
        slot.frame.clone()
    }
}

impl Drop for GstEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

fn store_sample(
    sample: Result<gst::Sample, gst::glib::BoolError>,
    frames: &Arc<Mutex<FrameSlot>>,
) -> Result<gst::FlowSuccess, gst::FlowError> {
    let sample = match sample {
        Ok(s) => s,
        Err(e) => {
            warn!("Callback failed to pull sample: {:?}", e);
            return Ok(gst::FlowSuccess::Ok);
        }
    };

    let (Some(buffer), Some(caps)) = (sample.buffer(), sample.caps()) else {
        return Ok(gst::FlowSuccess::Ok);
    };

    let Ok(info) = gst_video::VideoInfo::from_caps(caps) else {
        return Ok(gst::FlowSuccess::Ok);
    };

    let Ok(map) = buffer.map_readable() else {
        tracing::trace!("Skipped frame: buffer map blocked");
        return Ok(gst::FlowSuccess::Ok);
    };

    let stride = info.stride().first().map_or(0, |s| *s as usize);
    let Some(data) = tight_rows(map.as_slice(), info.width(), info.height(), stride) else {
        error!(
            data_len = map.size(),
            width = info.width(),
            height = info.height(),
            stride,
            "Buffer size mismatch"
        );
        return Ok(gst::FlowSuccess::Ok);
    };

    if let Ok(mut slot) = frames.lock() {
        slot.sequence += 1;
        slot.frame = Some(VideoFrame {
            data,
            width: info.width(),
            height: info.height(),
        });
    }

    Ok(gst::FlowSuccess::Ok)
}

/// Copy a BGRx image into a buffer without row padding.
fn tight_rows(data: &[u8], width: u32, height: u32, stride: usize) -> Option<Vec<u8>> {
    let row = width as usize * 4;
    let height = height as usize;

    if stride == row {
        return data.get(..row * height).map(<[u8]>::to_vec);
    }

    if stride < row {
        return None;
    }

    let mut out = Vec::with_capacity(row * height);
    for y in 0..height {
        out.extend_from_slice(data.get(y * stride..y * stride + row)?);
    }
    Some(out)
}

/// Errors in the resource domain come from the source element: missing files,
/// refused connections, HTTP errors. Everything else is about the media.
fn source_unreachable(error: &gst::glib::Error) -> bool {
    error.kind::<gst::ResourceError>().is_some()
}

/// Preroll `asset` in a throwaway pipeline and report what it says about itself.
///
/// Blocks for at most `timeout`; run it off the control thread.
pub fn probe_media(asset: &Asset, timeout: Duration) -> Result<MediaInfo, PlaybackError> {
    init().map_err(|why| PlaybackError::Engine(why.to_string()))?;

    let uri = asset_uri(asset).map_err(|why| PlaybackError::Unreachable(why.to_string()))?;
    let description = format!("uridecodebin uri=\"{}\" ! fakesink", escape(&uri));
    let pipeline = gst::parse::launch(&description)
        .map_err(|why| PlaybackError::Unplayable(why.to_string()))?;

    let timeout = gst::ClockTime::from_nseconds(u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX));
    let prerolled = pipeline.set_state(gst::State::Paused).is_ok() && {
        let (result, state, _) = pipeline.state(timeout);
        result.is_ok() && state == gst::State::Paused
    };

    let duration = pipeline
        .query_duration::<gst::ClockTime>()
        .map(|duration| Duration::from_nanos(duration.nseconds()));

    let error = pipeline
        .bus()
        .and_then(|bus| bus.pop_filtered(&[gst::MessageType::Error]))
        .and_then(|msg| match msg.view() {
            gst::MessageView::Error(err) => Some(err.error()),
            _ => None,
        });

    let _ = pipeline.set_state(gst::State::Null);

    if let Some(error) = error.as_ref().filter(|error| source_unreachable(error)) {
        debug!(uri, %error, "Media source unreachable");
        return Err(PlaybackError::Unreachable(error.to_string()));
    }

    let reason = error.map(|error| error.to_string());
    debug!(uri, prerolled, ?duration, ?reason, "Probed media");

    Ok(MediaInfo {
        playable: prerolled && reason.is_none(),
        duration,
        reason,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tight_rows_strips_padding() {
        // 1x2 image with 4 bytes of padding per row
        let data = [1, 2, 3, 4, 0, 0, 0, 0, 5, 6, 7, 8, 0, 0, 0, 0];
        assert_eq!(tight_rows(&data, 1, 2, 8), Some(vec![1, 2, 3, 4, 5, 6, 7, 8]));
        assert_eq!(tight_rows(&data[..8], 2, 1, 8), Some(data[..8].to_vec()));
        assert_eq!(tight_rows(&data[..10], 1, 2, 8), None);
        assert_eq!(tight_rows(&data, 2, 2, 4), None);
    }

    #[test]
    fn resource_errors_mean_unreachable_source() {
        let refused = gst::glib::Error::new(gst::ResourceError::OpenRead, "connection refused");
        let missing = gst::glib::Error::new(gst::ResourceError::NotFound, "404 Not Found");
        let codec = gst::glib::Error::new(gst::StreamError::CodecNotFound, "no decoder for h266");

        assert!(source_unreachable(&refused));
        assert!(source_unreachable(&missing));
        assert!(!source_unreachable(&codec));
    }

    #[test]
    fn pipeline_scales_to_output() {
        let description = pipeline_description("file:///tmp/a \"b\".mp4", 1920, 1080);
        assert!(description.starts_with("uridecodebin uri=\"file:///tmp/a \\\"b\\\".mp4\" ! "));
        assert!(description.contains("width=1920,height=1080"));
        assert!(description.ends_with("appsink name=sink sync=true max-buffers=4 drop=true"));

        let unsized_desc = pipeline_description("file:///tmp/a.mp4", 0, 1080);
        assert!(unsized_desc.contains("video/x-raw,format=BGRx ! appsink"));
    }
}
