//! Per-pixel running Gaussian background model.
//!
//! Each pixel keeps a mean and a variance. A pixel is foreground when its squared
//! distance from the mean exceeds `var_threshold * variance`. Background pixels
//! update both statistics; foreground pixels only drift the mean, so a
//! stationary object is absorbed over roughly `history` frames.

use image::{GrayImage, Luma};

const INITIAL_VARIANCE: f32 = 15.0 * 15.0;
const MIN_VARIANCE: f32 = 4.0;
const MAX_VARIANCE: f32 = 5.0 * INITIAL_VARIANCE;

pub const FOREGROUND: u8 = 255;

pub struct BackgroundModel {
    history: u32,
    var_threshold: f32,
    width: u32,
    height: u32,
    mean: Vec<f32>,
    variance: Vec<f32>,
    frames_seen: u32,
}

impl BackgroundModel {
    pub fn new(history: u32, var_threshold: f32) -> Self {
        Self {
            history: history.max(1),
            var_threshold: var_threshold.max(f32::EPSILON),
            width: 0,
            height: 0,
            mean: Vec::new(),
            variance: Vec::new(),
            frames_seen: 0,
        }
    }

    pub fn frames_seen(&self) -> u32 {
        self.frames_seen
    }

    pub fn reset(&mut self) {
        self.width = 0;
        self.height = 0;
        self.mean.clear();
        self.variance.clear();
        self.frames_seen = 0;
    }

    /// Classify `gray` against the model, then learn from it.
    ///
    /// The first frame (or the first after a size change) seeds the model and
    /// yields an empty mask.
    pub fn apply(&mut self, gray: &GrayImage) -> GrayImage {
        let (width, height) = gray.dimensions();
        let mut mask = GrayImage::new(width, height);

        if width != self.width || height != self.height || self.mean.is_empty() {
            self.width = width;
            self.height = height;
            self.mean = gray.as_raw().iter().map(|&v| v as f32).collect();
            self.variance = vec![INITIAL_VARIANCE; self.mean.len()];
            self.frames_seen = 1;
            return mask;
        }

        self.frames_seen = self.frames_seen.saturating_add(1);
        let alpha = 1.0 / self.frames_seen.min(self.history) as f32;

        for (i, &value) in gray.as_raw().iter().enumerate() {
            let mean = &mut self.mean[i];
            let variance = &mut self.variance[i];
            let diff = value as f32 - *mean;
            let dist2 = diff * diff;

            if dist2 > self.var_threshold * *variance {
                mask.put_pixel(i as u32 % width, i as u32 / width, Luma([FOREGROUND]));
                *mean += alpha * diff;
            } else {
                *mean += alpha * diff;
                *variance = (*variance + alpha * (dist2 - *variance)).clamp(MIN_VARIANCE, MAX_VARIANCE);
            }
        }
        mask
    }
}
