//! Motion gate.
//!
//! `MotionGate` turns a stream of frames into motion triggers:
//! 1. grayscale, downscale to the processing width, Gaussian blur
//! 2. foreground mask from the running background model
//! 3. morphological open + close with a 5x5 ellipse
//! 4. 8-connected regions; motion if any region exceeds the area threshold
//!
//! A trigger additionally requires the cooldown since the previous trigger to
//! have elapsed. Triggers are delivered to registered handlers, each isolated
//! from the others' failures.

mod background;
mod regions;

use image::{imageops, GrayImage, Rgb, RgbImage};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::frame::Frame;
use crate::hooks::{DispatchReport, HandlerSet};

pub use background::BackgroundModel;
pub use regions::{connected_regions, denoise, MotionRegion};

const BLUR_SIGMA: f32 = 3.5;
const BOX_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const BOX_THICKNESS: u32 = 2;

#[derive(Clone, Debug)]
pub struct MotionConfig {
    /// Minimum region area, in full-resolution pixels.
    pub area_threshold: u32,
    pub var_threshold: f32,
    pub history: u32,
    pub cooldown: Duration,
    /// Frames wider than this are downscaled before analysis. 0 disables scaling.
    pub processing_width: u32,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            area_threshold: 500,
            var_threshold: 50.0,
            history: 500,
            cooldown: Duration::from_secs(3),
            processing_width: 320,
        }
    }
}

/// Result of analysing one frame.
#[derive(Debug)]
pub struct MotionDetection {
    pub motion: bool,
    /// Regions over the area threshold, in frame coordinates.
    pub regions: Vec<MotionRegion>,
    /// Annotated copy when motion was found, otherwise the input frame.
    pub frame: Arc<Frame>,
}

/// Delivered to motion handlers when the gate fires.
#[derive(Clone, Debug)]
pub struct MotionTrigger {
    pub frame: Arc<Frame>,
    pub regions: Vec<MotionRegion>,
    pub sequence: u64,
}

pub struct MotionGate {
    config: MotionConfig,
    model: BackgroundModel,
    last_trigger: Option<Instant>,
    handlers: HandlerSet<MotionTrigger>,
}

impl MotionGate {
    pub fn new(config: MotionConfig) -> Self {
        let model = BackgroundModel::new(config.history, config.var_threshold);
        Self {
            config,
            model,
            last_trigger: None,
            handlers: HandlerSet::new("motion"),
        }
    }

    pub fn config(&self) -> &MotionConfig {
        &self.config
    }

    pub fn handlers(&self) -> &HandlerSet<MotionTrigger> {
        &self.handlers
    }

    pub fn on_motion<F>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(&MotionTrigger) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.handlers.register(name, handler);
    }

    /// Forget the learned background and the cooldown.
    pub fn reset(&mut self) {
        self.model.reset();
        self.last_trigger = None;
    }

    /// Update the model with `frame` and report motion. Never triggers handlers.
    pub fn detect_motion(&mut self, frame: &Arc<Frame>) -> MotionDetection {
        let (width, height) = (frame.width(), frame.height());
        let scale = self.scale_for(width);
        let gray = self.prepare(frame.image(), scale);

        let mask = denoise(&self.model.apply(&gray));
        let min_area = (self.config.area_threshold as f64 * scale * scale).max(1.0);
        let regions: Vec<MotionRegion> = connected_regions(&mask)
            .into_iter()
            .filter(|region| region.area as f64 > min_area)
            .map(|region| region.rescale(scale, width, height))
            .collect();

        if regions.is_empty() {
            return MotionDetection {
                motion: false,
                regions,
                frame: frame.clone(),
            };
        }

        let annotated = Arc::new(frame.derive(annotate(frame.image(), &regions)));
        MotionDetection {
            motion: true,
            regions,
            frame: annotated,
        }
    }

    /// Detect motion; if found and the cooldown has elapsed, fire the handlers.
    /// Always returns the frame to display.
    pub fn process_motion_detection(&mut self, frame: &Arc<Frame>) -> Arc<Frame> {
        self.process_at(frame, Instant::now()).0
    }

    /// `process_motion_detection` with an explicit clock. Returns the display
    /// frame and, when the gate fired, the dispatch report.
    pub fn process_at(
        &mut self,
        frame: &Arc<Frame>,
        now: Instant,
    ) -> (Arc<Frame>, Option<DispatchReport>) {
        let detection = self.detect_motion(frame);
        if !detection.motion || !self.cooldown_elapsed(now) {
            return (detection.frame, None);
        }
        self.last_trigger = Some(now);
        log::info!(
            "motion on frame #{} ({} region(s))",
            frame.sequence(),
            detection.regions.len()
        );
        let trigger = MotionTrigger {
            frame: frame.clone(),
            regions: detection.regions,
            sequence: frame.sequence(),
        };
        let report = self.handlers.dispatch(&trigger);
        (detection.frame, Some(report))
    }

    pub fn cooldown_elapsed(&self, now: Instant) -> bool {
        self.last_trigger
            .map_or(true, |last| now.saturating_duration_since(last) >= self.config.cooldown)
    }

    fn scale_for(&self, width: u32) -> f64 {
        if self.config.processing_width == 0 || width <= self.config.processing_width {
            1.0
        } else {
            self.config.processing_width as f64 / width as f64
        }
    }

    fn prepare(&self, image: &RgbImage, scale: f64) -> GrayImage {
        let gray = imageops::grayscale(image);
        let gray = if scale < 1.0 {
            let w = ((image.width() as f64 * scale).round() as u32).max(1);
            let h = ((image.height() as f64 * scale).round() as u32).max(1);
            imageops::resize(&gray, w, h, imageops::FilterType::Triangle)
        } else {
            gray
        };
        imageops::blur(&gray, (BLUR_SIGMA * scale as f32).max(0.8))
    }
}

/// Copy of `image` with each region outlined.
pub fn annotate(image: &RgbImage, regions: &[MotionRegion]) -> RgbImage {
    let mut out = image.clone();
    let (width, height) = out.dimensions();
    if width == 0 || height == 0 {
        return out;
    }
    for region in regions {
        if region.x1 >= width || region.y1 >= height {
            continue;
        }
        let x2 = region.x2.min(width - 1);
        let y2 = region.y2.min(height - 1);
        for t in 0..BOX_THICKNESS {
            let top = (region.y1 + t).min(y2);
            let bottom = y2.saturating_sub(t).max(region.y1);
            for x in region.x1..=x2 {
                out.put_pixel(x, top, BOX_COLOR);
                out.put_pixel(x, bottom, BOX_COLOR);
            }
            let left = (region.x1 + t).min(x2);
            let right = x2.saturating_sub(t).max(region.x1);
            for y in region.y1..=y2 {
                out.put_pixel(left, y, BOX_COLOR);
                out.put_pixel(right, y, BOX_COLOR);
            }
        }
    }
    out
}
