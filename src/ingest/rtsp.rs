//! RTSP/RTMP frame source.
//!
//! This module provides `RtspSource` for ingesting frames from IP cameras and
//! media servers.
//!
//! The source is responsible for:
//! - Opening the stream (GStreamer pipeline, or the synthetic scene for `stub://`)
//! - Decoding video frames into RGB images
//! - Releasing the pipeline when asked
//!
//! It does not retry and does not screen frames; a failed read is returned to the
//! caller as-is.

#[cfg(feature = "rtsp-gstreamer")]
use anyhow::Context;
use anyhow::{anyhow, Result};
use image::{Rgb, RgbImage};
#[cfg(feature = "rtsp-gstreamer")]
use std::time::Duration;

use super::{FrameSource, SourceDescriptor, SourceOptions, SourceScheme};

/// RTSP frame source.
///
/// Uses GStreamer for real decode, with a synthetic fallback for `stub://` URLs.
pub struct RtspSource {
    backend: RtspBackend,
}

enum RtspBackend {
    Synthetic(SyntheticSource),
    #[cfg(feature = "rtsp-gstreamer")]
    Gstreamer(GstreamerSource),
}

impl RtspSource {
    pub fn new(descriptor: &SourceDescriptor, options: &SourceOptions) -> Result<Self> {
        if descriptor.scheme() == SourceScheme::Stub {
            return Ok(Self {
                backend: RtspBackend::Synthetic(SyntheticSource::new(descriptor, options)),
            });
        }
        #[cfg(feature = "rtsp-gstreamer")]
        {
            Ok(Self {
                backend: RtspBackend::Gstreamer(GstreamerSource::new(descriptor, options)?),
            })
        }
        #[cfg(not(feature = "rtsp-gstreamer"))]
        {
            anyhow::bail!(
                "{} requires the rtsp-gstreamer feature",
                descriptor.redacted()
            )
        }
    }

    /// Start the stream.
    pub fn connect(&mut self) -> Result<()> {
        match &mut self.backend {
            RtspBackend::Synthetic(source) => source.connect(),
            #[cfg(feature = "rtsp-gstreamer")]
            RtspBackend::Gstreamer(source) => source.connect(),
        }
    }
}

impl FrameSource for RtspSource {
    fn read_frame(&mut self) -> Result<RgbImage> {
        match &mut self.backend {
            RtspBackend::Synthetic(source) => source.next_frame(),
            #[cfg(feature = "rtsp-gstreamer")]
            RtspBackend::Gstreamer(source) => source.next_frame(),
        }
    }

    fn release(&mut self) {
        match &mut self.backend {
            RtspBackend::Synthetic(source) => source.release(),
            #[cfg(feature = "rtsp-gstreamer")]
            RtspBackend::Gstreamer(source) => source.release(),
        }
    }
}

// ----------------------------------------------------------------------------
// Synthetic source (stub://) for demos and tests
// ----------------------------------------------------------------------------

/// Frames per "visit" cycle: the scene is static for most of the cycle and a
/// bright block crosses it for `VISIT_FRAMES` frames.
const SCENE_CYCLE: u64 = 90;
const VISIT_FRAMES: u64 = 30;
const BACKGROUND_LEVEL: u8 = 96;

struct SyntheticSource {
    label: String,
    width: u32,
    height: u32,
    frame_count: u64,
    open: bool,
}

impl SyntheticSource {
    fn new(descriptor: &SourceDescriptor, options: &SourceOptions) -> Self {
        Self {
            label: descriptor.redacted(),
            width: options.width.max(1),
            height: options.height.max(1),
            frame_count: 0,
            open: false,
        }
    }

    fn connect(&mut self) -> Result<()> {
        self.open = true;
        log::info!("RtspSource: connected to {} (synthetic)", self.label);
        Ok(())
    }

    fn next_frame(&mut self) -> Result<RgbImage> {
        if !self.open {
            return Err(anyhow!("synthetic source {} is not open", self.label));
        }
        self.frame_count += 1;
        Ok(self.render())
    }

    /// Static textured background; a block walks across during each visit.
    fn render(&self) -> RgbImage {
        let mut image = RgbImage::from_fn(self.width, self.height, |x, y| {
            let texture = ((x / 16 + y / 16) % 2) as u8 * 12;
            let jitter = rand::random::<u8>() % 3;
            let v = BACKGROUND_LEVEL + texture + jitter;
            Rgb([v, v, v.saturating_add(4)])
        });

        let phase = self.frame_count % SCENE_CYCLE;
        if phase < VISIT_FRAMES {
            let block_w = (self.width / 5).max(1);
            let block_h = (self.height / 3).max(1);
            let travel = self.width.saturating_sub(block_w) as u64;
            let x0 = (travel * phase / VISIT_FRAMES.max(1)) as u32;
            let y0 = self.height.saturating_sub(block_h) / 2;
            for y in y0..(y0 + block_h).min(self.height) {
                for x in x0..(x0 + block_w).min(self.width) {
                    image.put_pixel(x, y, Rgb([220, 180, 150]));
                }
            }
        }
        image
    }

    fn release(&mut self) {
        if self.open {
            log::debug!("RtspSource: released {} (synthetic)", self.label);
        }
        self.open = false;
    }
}

// ----------------------------------------------------------------------------
// Production source using GStreamer
// ----------------------------------------------------------------------------

#[cfg(feature = "rtsp-gstreamer")]
struct GstreamerSource {
    label: String,
    read_timeout: Duration,
    pipeline: gstreamer::Pipeline,
    appsink: gstreamer_app::AppSink,
    last_error: Option<String>,
    released: bool,
}

#[cfg(feature = "rtsp-gstreamer")]
impl GstreamerSource {
    /// Build the pipeline: <src> ! decodebin ! videoconvert ! appsink (RGB).
    fn new(descriptor: &SourceDescriptor, options: &SourceOptions) -> Result<Self> {
        gstreamer::init().context("initialize gstreamer")?;

        let src = match descriptor.scheme() {
            SourceScheme::Rtmp => format!("rtmpsrc location=\"{}\"", descriptor.as_url()),
            _ => format!(
                "rtspsrc location=\"{}\" latency=0 protocols=tcp tcp-timeout={}",
                descriptor.as_url(),
                options.connect_timeout.as_micros()
            ),
        };
        let pipeline_description = format!(
            "{} ! decodebin ! videoconvert ! video/x-raw,format=RGB ! \
             appsink name=appsink sync=false max-buffers=1 drop=true",
            src
        );
        let pipeline = gstreamer::parse::launch(&pipeline_description)
            .context("build stream pipeline")?
            .downcast::<gstreamer::Pipeline>()
            .map_err(|_| anyhow!("stream pipeline is not a Pipeline"))?;

        let appsink = pipeline
            .by_name("appsink")
            .context("appsink element missing from pipeline")?
            .downcast::<gstreamer_app::AppSink>()
            .map_err(|_| anyhow!("appsink element has unexpected type"))?;

        let caps = gstreamer::Caps::builder("video/x-raw")
            .field("format", "RGB")
            .build();
        appsink.set_caps(Some(&caps));
        appsink.set_max_buffers(1);
        appsink.set_drop(true);
        appsink.set_sync(false);

        Ok(Self {
            label: descriptor.redacted(),
            read_timeout: options.read_timeout,
            pipeline,
            appsink,
            last_error: None,
            released: false,
        })
    }

    fn connect(&mut self) -> Result<()> {
        self.pipeline
            .set_state(gstreamer::State::Playing)
            .context("set stream pipeline to Playing")?;
        self.released = false;
        log::info!("RtspSource: connected to {}", self.label);
        Ok(())
    }

    fn next_frame(&mut self) -> Result<RgbImage> {
        if self.released {
            return Err(anyhow!("stream {} was released", self.label));
        }
        self.poll_bus();
        if let Some(err) = &self.last_error {
            return Err(anyhow!("{}", err));
        }

        let timeout = gstreamer::ClockTime::from_mseconds(self.read_timeout.as_millis() as u64);
        let sample = self
            .appsink
            .try_pull_sample(timeout)
            .ok_or_else(|| anyhow!("stream stalled"))?;

        sample_to_image(&sample)
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        if let Err(err) = self.pipeline.set_state(gstreamer::State::Null) {
            log::warn!("RtspSource: failed to stop pipeline for {}: {}", self.label, err);
        }
        self.released = true;
    }

    fn poll_bus(&mut self) {
        let Some(bus) = self.pipeline.bus() else {
            return;
        };
        while let Some(message) = bus.pop() {
            use gstreamer::MessageView;
            match message.view() {
                MessageView::Error(err) => {
                    self.last_error = Some(format!(
                        "gstreamer error from {:?}: {}",
                        err.src().map(|s| s.path_string()),
                        err.error()
                    ));
                }
                MessageView::Eos(..) => {
                    self.last_error = Some("gstreamer reached EOS".to_string());
                }
                _ => {}
            }
        }
    }
}

#[cfg(feature = "rtsp-gstreamer")]
impl Drop for GstreamerSource {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(feature = "rtsp-gstreamer")]
fn sample_to_image(sample: &gstreamer::Sample) -> Result<RgbImage> {
    let buffer = sample.buffer().context("sample missing buffer")?;
    let caps = sample.caps().context("sample missing caps")?;
    let info = gstreamer_video::VideoInfo::from_caps(caps).context("parse caps as video info")?;

    let width = info.width();
    let height = info.height();
    let row_bytes = (width as usize) * 3;
    let stride = info.stride()[0] as usize;

    let map = buffer.map_readable().context("map sample buffer")?;
    let data = map.as_slice();

    let pixels = if stride == row_bytes {
        data.get(..row_bytes * height as usize)
            .context("sample buffer is shorter than the frame")?
            .to_vec()
    } else {
        let mut pixels = Vec::with_capacity(row_bytes * height as usize);
        for row in 0..height as usize {
            let start = row * stride;
            let end = start + row_bytes;
            pixels.extend_from_slice(
                data.get(start..end)
                    .context("sample buffer row is out of bounds")?,
            );
        }
        pixels
    };

    RgbImage::from_raw(width, height, pixels).context("sample does not match its caps")
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
