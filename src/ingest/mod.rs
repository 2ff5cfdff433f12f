//! Frame ingestion sources.
//!
//! This module provides:
//! - `SourceDescriptor`: validated stream location (rtsp, rtmp, http(s), stub)
//! - `FrameSource`: an open stream that yields decoded RGB frames
//! - `SourceConnector`: probes and opens sources; `NetworkConnector` is the
//!   production implementation, tests substitute their own
//!
//! Sources:
//! - RTSP/RTMP streams via GStreamer (feature: rtsp-gstreamer)
//! - HTTP MJPEG / JPEG snapshot endpoints (feature: ingest-http, default)
//! - `stub://` synthetic scene (always available, never touches the network)
//!
//! The ingestion layer only decodes. Retry, corruption screening and
//! reconnection belong to `connection::ConnectionManager`.

pub mod descriptor;
#[cfg(feature = "ingest-http")]
pub mod http;
pub mod rtsp;

use anyhow::Result;
use image::RgbImage;
use std::time::Duration;

use crate::error::ConnectError;

pub use descriptor::{probe_reachability, SourceDescriptor, SourceScheme};
#[cfg(feature = "ingest-http")]
pub use http::HttpMjpegSource;
pub use rtsp::RtspSource;

/// Knobs passed to a connector when opening a source.
#[derive(Clone, Debug)]
pub struct SourceOptions {
    /// Handshake budget for network sources.
    pub connect_timeout: Duration,
    /// Upper bound on a single blocking read.
    pub read_timeout: Duration,
    /// Frame geometry for synthetic sources; a hint for decoders.
    pub width: u32,
    pub height: u32,
    /// Target frame rate. Sources decimate to this rate where they can.
    pub target_fps: u32,
}

impl Default for SourceOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(5),
            width: 640,
            height: 480,
            target_fps: 15,
        }
    }
}

/// An open stream handle.
///
/// `read_frame` blocks for at most the configured read timeout. `release` must be
/// idempotent; the connection manager may call it more than once.
pub trait FrameSource: Send {
    fn read_frame(&mut self) -> Result<RgbImage>;

    fn release(&mut self);
}

/// Probe + open, separated so the manager can reject unreachable hosts before
/// a full handshake.
pub trait SourceConnector: Send + Sync {
    fn probe(&self, descriptor: &SourceDescriptor, timeout: Duration) -> Result<(), ConnectError>;

    fn open(
        &self,
        descriptor: &SourceDescriptor,
        options: &SourceOptions,
    ) -> Result<Box<dyn FrameSource>, ConnectError>;
}

/// Production connector: TCP probe, then the decoder matching the scheme.
#[derive(Clone, Copy, Debug, Default)]
pub struct NetworkConnector;

impl SourceConnector for NetworkConnector {
    fn probe(&self, descriptor: &SourceDescriptor, timeout: Duration) -> Result<(), ConnectError> {
        probe_reachability(descriptor, timeout)
    }

    fn open(
        &self,
        descriptor: &SourceDescriptor,
        options: &SourceOptions,
    ) -> Result<Box<dyn FrameSource>, ConnectError> {
        let open_err = |err: anyhow::Error| ConnectError::Open {
            target: descriptor.redacted(),
            reason: format!("{:#}", err),
        };
        match descriptor.scheme() {
            SourceScheme::Stub | SourceScheme::Rtsp | SourceScheme::Rtmp => {
                let mut source = RtspSource::new(descriptor, options).map_err(open_err)?;
                source.connect().map_err(open_err)?;
                Ok(Box::new(source))
            }
            SourceScheme::Http | SourceScheme::Https => {
                #[cfg(feature = "ingest-http")]
                {
                    let mut source = HttpMjpegSource::new(descriptor, options);
                    source.connect().map_err(open_err)?;
                    Ok(Box::new(source))
                }
                #[cfg(not(feature = "ingest-http"))]
                {
                    Err(open_err(anyhow::anyhow!(
                        "http sources require the ingest-http feature"
                    )))
                }
            }
        }
    }
}
