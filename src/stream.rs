//! Viewer stream encoding.
//!
//! Frames are JPEG-encoded and framed as `multipart/x-mixed-replace` parts with
//! the boundary `frame`. When no source frame is available the viewer gets a
//! placeholder image instead of a broken stream.

use anyhow::{Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::{imageops, Rgb, RgbImage};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use crate::frame::{Frame, FrameSubscription, RecvOutcome};

pub const BOUNDARY: &str = "frame";
pub const CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";

const PLACEHOLDER_WIDTH: u32 = 640;
const PLACEHOLDER_HEIGHT: u32 = 480;

#[derive(Clone, Debug)]
pub struct StreamConfig {
    /// Wider frames are downscaled, keeping the aspect ratio.
    pub max_width: u32,
    pub jpeg_quality: u8,
    /// Consecutive empty polls before the viewer stream ends.
    pub max_empty_polls: u32,
    pub poll_timeout: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            max_width: 800,
            jpeg_quality: 70,
            max_empty_polls: 10,
            poll_timeout: Duration::from_secs(2),
        }
    }
}

/// JPEG-encode `image` at `quality` (1..=100).
pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100))
        .encode_image(image)
        .context("jpeg encode")?;
    Ok(out)
}

/// Wrap one JPEG in multipart part framing.
pub fn multipart_part(jpeg: &[u8]) -> Vec<u8> {
    let mut part = Vec::with_capacity(jpeg.len() + 64);
    part.extend_from_slice(b"--");
    part.extend_from_slice(BOUNDARY.as_bytes());
    part.extend_from_slice(b"\r\nContent-Type: image/jpeg\r\n\r\n");
    part.extend_from_slice(jpeg);
    part.extend_from_slice(b"\r\n");
    part
}

#[derive(Clone, Debug)]
pub struct StreamEncoder {
    config: StreamConfig,
    placeholder: Arc<OnceLock<Vec<u8>>>,
}

impl StreamEncoder {
    pub fn new(config: StreamConfig) -> Self {
        Self {
            config,
            placeholder: Arc::new(OnceLock::new()),
        }
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// Viewer-sized JPEG of `frame`.
    pub fn encode(&self, frame: &Frame) -> Result<Vec<u8>> {
        let image = frame.image();
        if self.config.max_width > 0 && image.width() > self.config.max_width {
            let scale = self.config.max_width as f64 / image.width() as f64;
            let height = ((image.height() as f64 * scale) as u32).max(1);
            let resized = imageops::resize(
                image,
                self.config.max_width,
                height,
                imageops::FilterType::Triangle,
            );
            encode_jpeg(&resized, self.config.jpeg_quality)
        } else {
            encode_jpeg(image, self.config.jpeg_quality)
        }
    }

    pub fn encode_part(&self, frame: &Frame) -> Result<Vec<u8>> {
        Ok(multipart_part(&self.encode(frame)?))
    }

    /// Placeholder JPEG shown while no source frame is available.
    pub fn placeholder(&self) -> &[u8] {
        self.placeholder.get_or_init(|| {
            encode_jpeg(&placeholder_image(), self.config.jpeg_quality).unwrap_or_else(|err| {
                log::error!("placeholder encode failed: {:#}", err);
                Vec::new()
            })
        })
    }

    pub fn placeholder_part(&self) -> Vec<u8> {
        multipart_part(self.placeholder())
    }

    /// Parts for one viewer, starting from `current` (or a placeholder).
    pub fn viewer_stream(
        &self,
        subscription: FrameSubscription,
        current: Option<Arc<Frame>>,
    ) -> ViewerStream {
        ViewerStream {
            encoder: self.clone(),
            subscription,
            pending: Some(current),
            empty_polls: 0,
        }
    }
}

impl Default for StreamEncoder {
    fn default() -> Self {
        Self::new(StreamConfig::default())
    }
}

/// Dark frame with a striped border.
fn placeholder_image() -> RgbImage {
    RgbImage::from_fn(PLACEHOLDER_WIDTH, PLACEHOLDER_HEIGHT, |x, y| {
        let edge = x < 8 || y < 8 || x >= PLACEHOLDER_WIDTH - 8 || y >= PLACEHOLDER_HEIGHT - 8;
        if edge && (x + y) / 16 % 2 == 0 {
            Rgb([200, 160, 0])
        } else {
            Rgb([24, 24, 24])
        }
    })
}

/// Iterator of multipart parts for one viewer.
///
/// Ends when the distributor closes or after `max_empty_polls` consecutive
/// empty polls; each empty poll yields a placeholder part.
pub struct ViewerStream {
    encoder: StreamEncoder,
    subscription: FrameSubscription,
    pending: Option<Option<Arc<Frame>>>,
    empty_polls: u32,
}

impl ViewerStream {
    pub fn empty_polls(&self) -> u32 {
        self.empty_polls
    }

    fn frame_part(&self, frame: &Frame) -> Vec<u8> {
        match self.encoder.encode_part(frame) {
            Ok(part) => part,
            Err(err) => {
                log::warn!("viewer frame #{} not encodable: {:#}", frame.sequence(), err);
                self.encoder.placeholder_part()
            }
        }
    }
}

impl Iterator for ViewerStream {
    type Item = Vec<u8>;

    fn next(&mut self) -> Option<Vec<u8>> {
        if let Some(initial) = self.pending.take() {
            return Some(match initial {
                Some(frame) => self.frame_part(&frame),
                None => self.encoder.placeholder_part(),
            });
        }
        let max_empty = self.encoder.config.max_empty_polls;
        if self.empty_polls >= max_empty {
            return None;
        }
        match self.subscription.recv_timeout(self.encoder.config.poll_timeout) {
            RecvOutcome::Frame(frame) => {
                self.empty_polls = 0;
                Some(self.frame_part(&frame))
            }
            RecvOutcome::Empty => {
                self.empty_polls += 1;
                log::warn!("viewer queue empty ({}/{})", self.empty_polls, max_empty);
                if self.empty_polls >= max_empty {
                    log::error!("viewer stream ended: no frames");
                }
                Some(self.encoder.placeholder_part())
            }
            RecvOutcome::Closed => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameDistributor;

    fn fast_encoder() -> StreamEncoder {
        StreamEncoder::new(StreamConfig {
            max_empty_polls: 2,
            poll_timeout: Duration::from_millis(5),
            ..StreamConfig::default()
        })
    }

    #[test]
    fn part_framing() {
        let part = multipart_part(b"JPEG");
        assert_eq!(part, b"--frame\r\nContent-Type: image/jpeg\r\n\r\nJPEG\r\n".to_vec());
    }

    #[test]
    fn wide_frames_are_downscaled() -> Result<()> {
        let encoder = StreamEncoder::default();
        let frame = Frame::new(RgbImage::from_pixel(1600, 900, Rgb([90, 90, 90])), 1);
        let jpeg = encoder.encode(&frame)?;
        let decoded = image::load_from_memory(&jpeg)?;
        assert_eq!((decoded.width(), decoded.height()), (800, 450));
        Ok(())
    }

    #[test]
    fn placeholder_is_a_jpeg() -> Result<()> {
        let encoder = StreamEncoder::default();
        let decoded = image::load_from_memory(encoder.placeholder())?;
        assert_eq!((decoded.width(), decoded.height()), (640, 480));
        Ok(())
    }

    #[test]
    fn viewer_stream_starts_with_placeholder_and_ends_after_empty_polls() {
        let distributor = FrameDistributor::new(3);
        let encoder = fast_encoder();
        let mut stream = encoder.viewer_stream(distributor.subscribe(), None);
        let placeholder = encoder.placeholder_part();

        assert_eq!(stream.next(), Some(placeholder.clone()));
        distributor.publish(Arc::new(Frame::new(RgbImage::new(4, 4), 1)));
        let part = stream.next().expect("frame part");
        assert_ne!(part, placeholder);

        assert_eq!(stream.next(), Some(placeholder.clone()));
        assert_eq!(stream.next(), Some(placeholder));
        assert_eq!(stream.empty_polls(), 2);
        assert!(stream.next().is_none());
    }

    #[test]
    fn viewer_stream_ends_when_distributor_closes() {
        let distributor = FrameDistributor::new(3);
        let current = Arc::new(Frame::new(RgbImage::new(4, 4), 7));
        let mut stream = fast_encoder().viewer_stream(distributor.subscribe(), Some(current));
        assert!(stream.next().is_some());
        distributor.close();
        assert!(stream.next().is_none());
    }
}
