//! Per-source shared state.
//!
//! One mutex guards everything the capture worker, the recognition worker and the
//! status readers share: connection state, last frame time, the current frame,
//! the recent-detection history and the counters. Writers hold the lock only for
//! the update itself; no I/O happens under it.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::connection::ConnectionState;
use crate::frame::Frame;
use crate::pipeline::DetectionEvent;

/// Default number of detection events kept for status queries.
pub const DEFAULT_HISTORY_CAPACITY: usize = 20;

/// Capture and detection counters.
#[derive(Clone, Debug, Default, Serialize)]
pub struct CaptureStats {
    pub frames_captured: u64,
    pub decode_errors: u64,
    pub corrupt_frames: u64,
    pub consecutive_failures: u32,
    pub reconnect_attempts: u64,
    pub frames_published: u64,
    pub motion_triggers: u64,
    pub recognitions_skipped: u64,
    pub recognitions_failed: u64,
    pub detections: u64,
    pub last_error: Option<String>,
}

pub struct SourceState {
    connection: ConnectionState,
    source: Option<String>,
    last_frame_time: Option<DateTime<Utc>>,
    current_frame: Option<Arc<Frame>>,
    history: VecDeque<Arc<DetectionEvent>>,
    history_capacity: usize,
    detection_enabled: bool,
    pub stats: CaptureStats,
}

impl SourceState {
    pub fn connection(&self) -> ConnectionState {
        self.connection
    }

    /// Move along a legal edge, logging the change.
    pub fn transition(&mut self, to: ConnectionState) -> Result<()> {
        let from = self.connection;
        self.connection = from.transition(to)?;
        if from != to {
            log::info!(
                "source {}: {} -> {}",
                self.source.as_deref().unwrap_or("<none>"),
                from,
                to
            );
        }
        Ok(())
    }

    pub fn set_source(&mut self, source: Option<String>) {
        self.source = source;
    }

    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    pub fn record_frame(&mut self, frame: Arc<Frame>) {
        self.last_frame_time = Some(frame.captured_at());
        self.current_frame = Some(frame);
    }

    /// Stamp a successful read without keeping the frame.
    pub fn mark_frame_time(&mut self, at: DateTime<Utc>) {
        self.last_frame_time = Some(at);
    }

    pub fn clear_frame(&mut self) {
        self.current_frame = None;
    }

    pub fn current_frame(&self) -> Option<Arc<Frame>> {
        self.current_frame.clone()
    }

    pub fn last_frame_time(&self) -> Option<DateTime<Utc>> {
        self.last_frame_time
    }

    /// Append, evicting the oldest event beyond capacity.
    pub fn push_detection(&mut self, event: Arc<DetectionEvent>) {
        self.history.push_back(event);
        while self.history.len() > self.history_capacity {
            self.history.pop_front();
        }
        self.stats.detections += 1;
    }

    /// Most recent first.
    pub fn recent_detections(&self, limit: usize) -> Vec<Arc<DetectionEvent>> {
        self.history.iter().rev().take(limit).cloned().collect()
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    pub fn detection_enabled(&self) -> bool {
        self.detection_enabled
    }

    pub fn set_detection_enabled(&mut self, enabled: bool) {
        self.detection_enabled = enabled;
    }
}

/// Point-in-time copy of the shared state for status readers.
#[derive(Clone, Debug, Serialize)]
pub struct StatusSnapshot {
    pub state: ConnectionState,
    pub source: Option<String>,
    pub last_frame_time: Option<DateTime<Utc>>,
    pub has_frame: bool,
    pub detection_enabled: bool,
    pub history_len: usize,
    pub stats: CaptureStats,
}

/// Cloneable handle to one source's guarded state.
#[derive(Clone)]
pub struct SharedState {
    inner: Arc<Mutex<SourceState>>,
}

impl SharedState {
    pub fn new(history_capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SourceState {
                connection: ConnectionState::Disconnected,
                source: None,
                last_frame_time: None,
                current_frame: None,
                history: VecDeque::with_capacity(history_capacity.max(1)),
                history_capacity: history_capacity.max(1),
                detection_enabled: true,
                stats: CaptureStats::default(),
            })),
        }
    }

    /// Lock for a write. Poisoning is reported, not recovered.
    pub fn lock(&self) -> Result<MutexGuard<'_, SourceState>> {
        self.inner
            .lock()
            .map_err(|_| anyhow!("source state lock poisoned"))
    }

    /// Run `f` under the lock; poisoned state is still readable.
    pub fn read<T>(&self, f: impl FnOnce(&SourceState) -> T) -> T {
        let guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        f(&guard)
    }

    pub fn update<T>(&self, f: impl FnOnce(&mut SourceState) -> T) -> Result<T> {
        let mut guard = self.lock()?;
        Ok(f(&mut guard))
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.read(SourceState::connection)
    }

    pub fn transition(&self, to: ConnectionState) -> Result<()> {
        self.lock()?.transition(to)
    }

    pub fn current_frame(&self) -> Option<Arc<Frame>> {
        self.read(SourceState::current_frame)
    }

    pub fn detection_enabled(&self) -> bool {
        self.read(SourceState::detection_enabled)
    }

    pub fn recent_detections(&self, limit: usize) -> Vec<Arc<DetectionEvent>> {
        self.read(|state| state.recent_detections(limit))
    }

    pub fn stats(&self) -> CaptureStats {
        self.read(|state| state.stats.clone())
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        self.read(|state| StatusSnapshot {
            state: state.connection,
            source: state.source.clone(),
            last_frame_time: state.last_frame_time,
            has_frame: state.current_frame.is_some(),
            detection_enabled: state.detection_enabled,
            history_len: state.history.len(),
            stats: state.stats.clone(),
        })
    }
}

impl Default for SharedState {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}
