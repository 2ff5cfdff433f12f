//! Motion-gated detection cycle.
//!
//! Frames run through the [`MotionGate`] on the capture worker. A motion trigger
//! is handed to one long-lived recognition worker; only one recognition can be
//! in flight, and triggers that arrive meanwhile are counted and skipped. The
//! worker prepares the frame, runs the [`RecognitionMatcher`], records a
//! [`DetectionEvent`] in the shared history, publishes it and notifies the
//! detection handlers.

mod enhance;

pub use enhance::{clahe, enhance_contrast};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::connection::FrameProcessor;
use crate::frame::Frame;
use crate::hooks::HandlerSet;
use crate::motion::{MotionGate, MotionTrigger};
use crate::recognize::{RecognitionMatcher, RecognitionResult};
use crate::state::SharedState;
use crate::stream::encode_jpeg;
use crate::transport::EventPublisher;

/// Quality used when re-encoding a triggered frame for recognition.
pub const RECOGNITION_JPEG_QUALITY: u8 = 85;

/// Outcome of one detection cycle.
#[derive(Clone, Debug, Serialize)]
pub struct DetectionEvent {
    pub timestamp: DateTime<Utc>,
    pub frame_sequence: u64,
    pub results: Vec<RecognitionResult>,
    pub motion: bool,
    /// Size of the re-encoded frame.
    pub frame_bytes: usize,
}

impl DetectionEvent {
    /// True when any face matched an enrolled identity.
    pub fn person_detected(&self) -> bool {
        self.results.iter().any(|r| r.is_known)
    }

    /// Highest result confidence, 0 without results.
    pub fn max_confidence(&self) -> f32 {
        self.results
            .iter()
            .map(|r| r.confidence)
            .fold(None, |acc: Option<f32>, c| Some(acc.map_or(c, |a| a.max(c))))
            .unwrap_or(0.0)
    }
}

#[derive(Clone, Debug)]
pub struct PipelineConfig {
    /// When false, frames are relayed without motion analysis.
    pub motion_enabled: bool,
    pub enhance_contrast: bool,
    pub jpeg_quality: u8,
    pub shutdown_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            motion_enabled: true,
            enhance_contrast: true,
            jpeg_quality: RECOGNITION_JPEG_QUALITY,
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

/// Everything the recognition worker needs for a cycle.
struct CycleContext {
    matcher: Arc<RecognitionMatcher>,
    publisher: Arc<dyn EventPublisher>,
    state: SharedState,
    handlers: Arc<HandlerSet<DetectionEvent>>,
    enhance_contrast: bool,
    jpeg_quality: u8,
}

impl CycleContext {
    fn run(&self, trigger: &MotionTrigger) -> Arc<DetectionEvent> {
        let frame = &trigger.frame;
        let prepared = if self.enhance_contrast {
            Arc::new(frame.derive(enhance_contrast(frame.image())))
        } else {
            frame.clone()
        };

        let frame_bytes = match encode_jpeg(prepared.image(), self.jpeg_quality) {
            Ok(bytes) => bytes.len(),
            Err(err) => {
                log::error!("frame #{} encode failed: {:#}", frame.sequence(), err);
                0
            }
        };

        let results = match self.matcher.recognize_frame(&prepared) {
            Ok(results) => results,
            Err(err) => {
                log::warn!("recognition failed on frame #{}: {:#}", frame.sequence(), err);
                Vec::new()
            }
        };
        if results.is_empty() {
            log::info!("no face found on frame #{}", frame.sequence());
        }
        for result in &results {
            log::info!(
                "face on frame #{}: {} (confidence {:.3})",
                frame.sequence(),
                result.name,
                result.confidence
            );
        }

        let event = Arc::new(DetectionEvent {
            timestamp: frame.captured_at(),
            frame_sequence: frame.sequence(),
            results,
            motion: true,
            frame_bytes,
        });

        if let Err(err) = self.state.update(|s| s.push_detection(event.clone())) {
            log::error!("{:#}", err);
        }
        if let Err(err) = self.publisher.publish(&event) {
            log::warn!("{} publish failed: {:#}", self.publisher.name(), err);
        }
        self.handlers.dispatch(&event);
        event
    }
}

/// Single-slot handoff from the motion handler to the recognition worker.
struct RecognitionSlot {
    sender: Mutex<Option<SyncSender<MotionTrigger>>>,
    busy: Arc<AtomicBool>,
    state: SharedState,
}

/// Holds the slot for one cycle and frees it on drop, including on unwind.
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl RecognitionSlot {
    fn try_claim(&self) -> bool {
        self.busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn skip(&self, sequence: u64) -> Result<()> {
        log::debug!("recognition in flight; skipping frame #{}", sequence);
        self.state
            .update(|s| s.stats.recognitions_skipped += 1)
            .context("count skipped recognition")
    }

    fn offer(&self, trigger: &MotionTrigger) -> Result<()> {
        self.state
            .update(|s| s.stats.motion_triggers += 1)
            .context("count motion trigger")?;

        if !self.try_claim() {
            return self.skip(trigger.sequence);
        }

        let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(sender) = sender.as_ref() else {
            self.busy.store(false, Ordering::SeqCst);
            anyhow::bail!("recognition worker is shut down");
        };
        match sender.try_send(trigger.clone()) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.busy.store(false, Ordering::SeqCst);
                self.skip(trigger.sequence)
            }
            Err(TrySendError::Disconnected(_)) => {
                self.busy.store(false, Ordering::SeqCst);
                anyhow::bail!("recognition worker exited")
            }
        }
    }

    fn close(&self) {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

/// Motion gate plus the recognition worker for one source.
pub struct DetectionPipeline {
    gate: Mutex<MotionGate>,
    config: PipelineConfig,
    slot: Arc<RecognitionSlot>,
    handlers: Arc<HandlerSet<DetectionEvent>>,
    context: Arc<CycleContext>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl DetectionPipeline {
    pub fn new(
        gate: MotionGate,
        matcher: Arc<RecognitionMatcher>,
        publisher: Arc<dyn EventPublisher>,
        state: SharedState,
        config: PipelineConfig,
    ) -> Result<Self> {
        if !matcher.has_extractor() {
            log::warn!("no embedding extractor: detection cycles will carry no recognition results");
        }
        let handlers = Arc::new(HandlerSet::new("detection"));
        let context = Arc::new(CycleContext {
            matcher,
            publisher,
            state: state.clone(),
            handlers: handlers.clone(),
            enhance_contrast: config.enhance_contrast,
            jpeg_quality: config.jpeg_quality,
        });

        let (sender, receiver) = mpsc::sync_channel(1);
        let busy = Arc::new(AtomicBool::new(false));
        let worker = spawn_worker(receiver, context.clone(), busy.clone())?;
        let slot = Arc::new(RecognitionSlot {
            sender: Mutex::new(Some(sender)),
            busy,
            state,
        });

        let handoff = slot.clone();
        gate.on_motion("recognition", move |trigger| handoff.offer(trigger));

        Ok(Self {
            gate: Mutex::new(gate),
            config,
            slot,
            handlers,
            context,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Subscribe to completed detection cycles.
    pub fn on_detection<F>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(&DetectionEvent) -> Result<()> + Send + Sync + 'static,
    {
        self.handlers.register(name, handler);
    }

    /// Subscribe to raw motion triggers.
    pub fn on_motion<F>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(&MotionTrigger) -> Result<()> + Send + Sync + 'static,
    {
        self.gate
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .on_motion(name, handler);
    }

    pub fn matcher(&self) -> &Arc<RecognitionMatcher> {
        &self.context.matcher
    }

    pub fn recognition_in_flight(&self) -> bool {
        self.slot.busy.load(Ordering::SeqCst)
    }

    /// Run a detection cycle for `trigger` on the calling thread.
    ///
    /// Takes the same single slot as motion triggers. Returns `None`, and
    /// counts a skipped recognition, when a cycle is already in flight.
    pub fn run_cycle(&self, trigger: &MotionTrigger) -> Option<Arc<DetectionEvent>> {
        if !self.slot.try_claim() {
            if let Err(err) = self.slot.skip(trigger.sequence) {
                log::error!("{:#}", err);
            }
            return None;
        }
        let _in_flight = InFlight(&self.slot.busy);
        Some(self.context.run(trigger))
    }

    /// Gate `frame` with an explicit clock. Returns the frame to display.
    pub fn process_at(&self, frame: Arc<Frame>, now: Instant) -> Arc<Frame> {
        if !self.config.motion_enabled {
            return frame;
        }
        let mut gate = self.gate.lock().unwrap_or_else(PoisonError::into_inner);
        gate.process_at(&frame, now).0
    }

    /// Wait up to `timeout` for the in-flight recognition to finish.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.recognition_in_flight() {
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        true
    }

    /// Stop accepting triggers and join the worker (bounded).
    pub fn shutdown(&self) {
        self.slot.close();
        let Some(handle) = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return;
        };
        let deadline = Instant::now() + self.config.shutdown_timeout;
        while !handle.is_finished() {
            if Instant::now() >= deadline {
                log::warn!("recognition worker still busy at shutdown; detaching");
                return;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        if handle.join().is_err() {
            log::error!("recognition worker panicked");
        }
    }
}

impl FrameProcessor for DetectionPipeline {
    fn process(&self, frame: Arc<Frame>) -> Arc<Frame> {
        self.process_at(frame, Instant::now())
    }
}

impl Drop for DetectionPipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn spawn_worker(
    receiver: Receiver<MotionTrigger>,
    context: Arc<CycleContext>,
    busy: Arc<AtomicBool>,
) -> Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("facewatch-recognition".into())
        .spawn(move || {
            for trigger in receiver {
                let _in_flight = InFlight(&busy);
                let started = Instant::now();
                match panic::catch_unwind(AssertUnwindSafe(|| context.run(&trigger))) {
                    Ok(event) => log::debug!(
                        "detection cycle for frame #{} took {:?} ({} result(s))",
                        event.frame_sequence,
                        started.elapsed(),
                        event.results.len()
                    ),
                    Err(_) => {
                        log::error!(
                            "detection cycle for frame #{} panicked; dropping it",
                            trigger.sequence
                        );
                        if let Err(err) =
                            context.state.update(|s| s.stats.recognitions_failed += 1)
                        {
                            log::error!("{:#}", err);
                        }
                    }
                }
            }
            log::info!("recognition worker stopped");
        })
        .context("spawn recognition worker")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recognize::BoundingBox;

    fn result(confidence: f32, is_known: bool) -> RecognitionResult {
        RecognitionResult {
            name: if is_known { "alice".into() } else { "unknown".into() },
            confidence,
            bbox: BoundingBox::default(),
            detector_score: 0.9,
            is_known,
        }
    }

    #[test]
    fn event_summary_fields() {
        let mut event = DetectionEvent {
            timestamp: Utc::now(),
            frame_sequence: 1,
            results: Vec::new(),
            motion: true,
            frame_bytes: 0,
        };
        assert!(!event.person_detected());
        assert_eq!(event.max_confidence(), 0.0);

        event.results = vec![result(0.4, false), result(0.8, true)];
        assert!(event.person_detected());
        assert!((event.max_confidence() - 0.8).abs() < 1e-6);

        event.results = vec![result(0.4, false)];
        assert!(!event.person_detected());
    }
}
