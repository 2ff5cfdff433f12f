//! HTTP MJPEG frame source.
//!
//! Cameras that expose `multipart/x-mixed-replace` MJPEG over HTTP(S) are read as a
//! continuous stream; endpoints that answer with a single JPEG are polled.

use anyhow::{anyhow, Context, Result};
use image::RgbImage;
use std::io::Read;
use std::time::{Duration, Instant};

use super::{FrameSource, SourceDescriptor, SourceOptions};

const MAX_JPEG_BYTES: usize = 5 * 1024 * 1024;

pub struct HttpMjpegSource {
    url: String,
    label: String,
    target_fps: u32,
    agent: ureq::Agent,
    stream: Option<HttpStream>,
    last_frame_at: Option<Instant>,
}

enum HttpStream {
    Mjpeg(MjpegStream),
    SingleJpeg,
}

impl HttpMjpegSource {
    pub fn new(descriptor: &SourceDescriptor, options: &SourceOptions) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(options.connect_timeout)
            .timeout_read(options.read_timeout)
            .build();
        Self {
            url: descriptor.as_url().to_string(),
            label: descriptor.redacted(),
            target_fps: options.target_fps,
            agent,
            stream: None,
            last_frame_at: None,
        }
    }

    pub fn connect(&mut self) -> Result<()> {
        let response = self
            .agent
            .get(&self.url)
            .call()
            .with_context(|| format!("connect to http stream {}", self.label))?;
        let content_type = response.header("Content-Type").unwrap_or("");
        if content_type.to_lowercase().contains("multipart") {
            let reader = response.into_reader();
            self.stream = Some(HttpStream::Mjpeg(MjpegStream::new(reader)));
        } else {
            self.stream = Some(HttpStream::SingleJpeg);
        }
        log::info!("HttpMjpegSource: connected to {}", self.label);
        Ok(())
    }

    fn fetch_single_jpeg(&self) -> Result<Vec<u8>> {
        let response = self
            .agent
            .get(&self.url)
            .call()
            .with_context(|| format!("fetch jpeg snapshot from {}", self.label))?;
        let mut bytes = Vec::new();
        response
            .into_reader()
            .take(MAX_JPEG_BYTES as u64)
            .read_to_end(&mut bytes)
            .context("read jpeg snapshot")?;
        if bytes.is_empty() {
            return Err(anyhow!("empty jpeg snapshot"));
        }
        Ok(bytes)
    }
}

impl FrameSource for HttpMjpegSource {
    fn read_frame(&mut self) -> Result<RgbImage> {
        let min_interval = frame_interval(self.target_fps);
        loop {
            let jpeg_bytes = match self.stream.as_mut() {
                Some(HttpStream::Mjpeg(stream)) => stream.read_next_jpeg()?,
                Some(HttpStream::SingleJpeg) => self.fetch_single_jpeg()?,
                None => return Err(anyhow!("http source {} is not connected", self.label)),
            };

            let now = Instant::now();
            if let Some(last) = self.last_frame_at {
                // Polled snapshots sleep; streamed parts are skipped.
                if now.duration_since(last) < min_interval {
                    if matches!(self.stream, Some(HttpStream::SingleJpeg)) {
                        std::thread::sleep(min_interval - now.duration_since(last));
                    } else {
                        continue;
                    }
                }
            }

            let image = decode_jpeg(&jpeg_bytes)?;
            self.last_frame_at = Some(Instant::now());
            return Ok(image);
        }
    }

    fn release(&mut self) {
        if self.stream.take().is_some() {
            log::debug!("HttpMjpegSource: released {}", self.label);
        }
        self.last_frame_at = None;
    }
}

struct MjpegStream {
    reader: Box<dyn Read + Send>,
    buffer: Vec<u8>,
}

impl MjpegStream {
    fn new(reader: Box<dyn Read + Send>) -> Self {
        Self {
            reader,
            buffer: Vec::with_capacity(64 * 1024),
        }
    }

    fn read_next_jpeg(&mut self) -> Result<Vec<u8>> {
        let mut chunk = vec![0u8; 8192];
        loop {
            if let Some((start, end)) = find_jpeg_bounds(&self.buffer) {
                let frame = self.buffer[start..end].to_vec();
                self.buffer.drain(..end);
                return Ok(frame);
            }

            let read = self.reader.read(&mut chunk).context("read mjpeg chunk")?;
            if read == 0 {
                return Err(anyhow!("mjpeg stream ended"));
            }
            self.buffer.extend_from_slice(&chunk[..read]);

            if self.buffer.len() > MAX_JPEG_BYTES * 2 {
                let keep = 2.min(self.buffer.len());
                let drain_len = self.buffer.len() - keep;
                self.buffer.drain(..drain_len);
            }
        }
    }
}

fn decode_jpeg(bytes: &[u8]) -> Result<RgbImage> {
    let image = image::load_from_memory_with_format(bytes, image::ImageFormat::Jpeg)
        .context("decode jpeg")?;
    Ok(image.into_rgb8())
}

fn find_jpeg_bounds(buffer: &[u8]) -> Option<(usize, usize)> {
    let start = buffer.windows(2).position(|w| w == [0xFF, 0xD8])?;
    let end = buffer[start + 2..]
        .windows(2)
        .position(|w| w == [0xFF, 0xD9])?;
    Some((start, start + 2 + end + 2))
}

fn frame_interval(target_fps: u32) -> Duration {
    if target_fps == 0 {
        Duration::from_millis(0)
    } else {
        Duration::from_millis((1000 / target_fps).max(1) as u64)
    }
}
