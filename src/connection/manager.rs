use anyhow::{bail, Context, Result};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use super::{ConnectionState, RetryPolicy};
use crate::error::ConnectError;
use crate::frame::{Frame, FrameDistributor};
use crate::ingest::{FrameSource, SourceConnector, SourceDescriptor, SourceOptions};
use crate::state::{SharedState, StatusSnapshot};
use crate::stream::encode_jpeg;

/// Hook run on the capture worker for every accepted frame while detection is
/// enabled. Returns the frame to relay to viewers.
pub trait FrameProcessor: Send + Sync {
    fn process(&self, frame: Arc<Frame>) -> Arc<Frame>;
}

/// Status view: shared state plus relay and worker details.
#[derive(Clone, Debug, Serialize)]
pub struct ManagerStatus {
    #[serde(flatten)]
    pub snapshot: StatusSnapshot,
    pub capture_running: bool,
    pub queue_len: usize,
    pub viewers: usize,
}

struct Inner {
    connector: Arc<dyn SourceConnector>,
    options: SourceOptions,
    policy: RetryPolicy,
    state: SharedState,
    distributor: FrameDistributor,
    processor: RwLock<Option<Arc<dyn FrameProcessor>>>,
    /// Held by the capture worker for the length of each read, so taking it
    /// elsewhere waits at most one read timeout.
    source: Mutex<Option<Box<dyn FrameSource>>>,
    descriptor: Mutex<Option<SourceDescriptor>>,
    /// Mirrors `source.is_some()` without waiting on a read in progress.
    connected: AtomicBool,
    running: AtomicBool,
    /// Bumped by every `start`; a capture loop only runs while it owns the
    /// current generation.
    generation: AtomicU64,
    sequence: AtomicU64,
}

/// Owns one source: connect/disconnect, the capture worker, and reconnection.
pub struct ConnectionManager {
    inner: Arc<Inner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    pub fn new(
        connector: Arc<dyn SourceConnector>,
        options: SourceOptions,
        policy: RetryPolicy,
        state: SharedState,
        distributor: FrameDistributor,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                connector,
                options,
                policy,
                state,
                distributor,
                processor: RwLock::new(None),
                source: Mutex::new(None),
                descriptor: Mutex::new(None),
                connected: AtomicBool::new(false),
                running: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                sequence: AtomicU64::new(0),
            }),
            worker: Mutex::new(None),
        }
    }

    pub fn state(&self) -> &SharedState {
        &self.inner.state
    }

    pub fn distributor(&self) -> &FrameDistributor {
        &self.inner.distributor
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.inner.policy
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.state.connection_state()
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    pub fn set_processor(&self, processor: Arc<dyn FrameProcessor>) {
        *self
            .inner
            .processor
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(processor);
    }

    /// Validate, probe and open `raw`, then read a first frame.
    ///
    /// Any previous connection is torn down first. A malformed descriptor is
    /// rejected before any network activity.
    pub fn connect(&self, raw: &str) -> Result<(), ConnectError> {
        let descriptor = SourceDescriptor::parse(raw)?;
        self.disconnect();

        self.inner.state.update(|s| s.set_source(Some(descriptor.redacted()))).ok();
        self.inner.enter(ConnectionState::Connecting);

        match self.inner.open_source(&descriptor) {
            Ok(source) => {
                self.inner.store_source(source);
                *self.inner.descriptor() = Some(descriptor);
                self.inner
                    .state
                    .update(|s| {
                        s.stats.consecutive_failures = 0;
                        s.stats.last_error = None;
                    })
                    .ok();
                self.inner.enter(ConnectionState::Connected);
                Ok(())
            }
            Err(err) => {
                log::warn!("connect to {} failed: {}", descriptor, err);
                self.inner
                    .state
                    .update(|s| s.stats.last_error = Some(err.to_string()))
                    .ok();
                self.inner.enter(ConnectionState::Disconnected);
                Err(err)
            }
        }
    }

    /// `connect` up to `max_attempts` times with the policy's fixed delay between
    /// attempts. Descriptor errors are returned immediately.
    pub fn connect_with_retry(&self, raw: &str, max_attempts: u32) -> Result<(), ConnectError> {
        let attempts = max_attempts.max(1);
        let mut last_err = None;
        for attempt in 1..=attempts {
            match self.connect(raw) {
                Ok(()) => return Ok(()),
                Err(err) if !err.is_retryable() => return Err(err),
                Err(err) => {
                    log::warn!("connect attempt {}/{} failed: {}", attempt, attempts, err);
                    last_err = Some(err);
                    if attempt < attempts {
                        thread::sleep(self.inner.policy.connect_retry_delay);
                    }
                }
            }
        }
        Err(last_err.unwrap_or(ConnectError::Cancelled))
    }

    /// Spawn the capture worker. Requires an open source; a no-op if already running.
    pub fn start(&self) -> Result<()> {
        let mut worker = self.worker();
        if self.inner.running.load(Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(previous) = worker.take() {
            join_bounded(previous, self.inner.policy.join_timeout);
        }
        if !self.is_connected() {
            bail!("no source connected; connect before starting capture");
        }

        self.inner.state.transition(ConnectionState::Streaming)?;
        // A worker detached by an earlier timed-out join sees the new
        // generation and exits without touching the source.
        let run = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.running.store(true, Ordering::SeqCst);
        let inner = self.inner.clone();
        let spawned = thread::Builder::new()
            .name("facewatch-capture".to_string())
            .spawn(move || inner.run_capture_loop(run))
            .context("spawn capture worker");
        match spawned {
            Ok(handle) => {
                *worker = Some(handle);
                Ok(())
            }
            Err(err) => {
                self.inner.running.store(false, Ordering::SeqCst);
                self.inner.enter(ConnectionState::Disconnected);
                Err(err)
            }
        }
    }

    /// Explicit stop: halt the capture worker (bounded join), release the source
    /// and return to `Disconnected`.
    ///
    /// Returns false if the worker did not finish within the join timeout.
    pub fn stop(&self) -> bool {
        let joined = self.halt_worker();
        self.inner.teardown();
        joined
    }

    /// Idempotent: flush and release the source, forget it, clear relay queues.
    pub fn disconnect(&self) {
        self.halt_worker();
        self.inner.teardown();
        *self.inner.descriptor() = None;
        self.inner.distributor.clear();
    }

    pub fn set_detection_enabled(&self, enabled: bool) -> Result<()> {
        self.inner.state.update(|s| s.set_detection_enabled(enabled))
    }

    /// Flip detection and return the new setting.
    pub fn toggle_detection(&self) -> Result<bool> {
        self.inner.state.update(|s| {
            let enabled = !s.detection_enabled();
            s.set_detection_enabled(enabled);
            enabled
        })
    }

    pub fn status(&self) -> ManagerStatus {
        ManagerStatus {
            snapshot: self.inner.state.snapshot(),
            capture_running: self.is_running(),
            queue_len: self.inner.distributor.max_queue_len(),
            viewers: self.inner.distributor.subscriber_count(),
        }
    }

    /// JPEG of the current frame, or `None` before the first accepted frame.
    pub fn snapshot(&self, quality: u8) -> Result<Option<Vec<u8>>> {
        match self.inner.state.current_frame() {
            Some(frame) => Ok(Some(encode_jpeg(frame.image(), quality)?)),
            None => Ok(None),
        }
    }

    fn halt_worker(&self) -> bool {
        self.inner.running.store(false, Ordering::SeqCst);
        let handle = self.worker().take();
        match handle {
            Some(handle) => join_bounded(handle, self.inner.policy.join_timeout),
            None => true,
        }
    }

    fn worker(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.worker.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.inner.running.store(false, Ordering::SeqCst);
    }
}

impl Inner {
    fn source(&self) -> MutexGuard<'_, Option<Box<dyn FrameSource>>> {
        self.source.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn descriptor(&self) -> MutexGuard<'_, Option<SourceDescriptor>> {
        self.descriptor.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn store_source(&self, source: Box<dyn FrameSource>) {
        *self.source() = Some(source);
        self.connected.store(true, Ordering::SeqCst);
    }

    /// True while the loop started as `run` should keep going.
    fn is_current(&self, run: u64) -> bool {
        self.running.load(Ordering::SeqCst) && self.generation.load(Ordering::SeqCst) == run
    }

    /// Transition, logging instead of failing; used on paths that must finish.
    fn enter(&self, to: ConnectionState) {
        if let Err(err) = self.state.transition(to) {
            log::error!("{:#}", err);
        }
    }

    /// Probe, open, and acquire a first frame. On failure nothing stays open.
    fn open_source(&self, descriptor: &SourceDescriptor) -> Result<Box<dyn FrameSource>, ConnectError> {
        self.connector.probe(descriptor, self.policy.probe_timeout)?;
        let mut source = self.connector.open(descriptor, &self.options)?;

        let attempts = self.policy.frame_attempts.max(1);
        for attempt in 1..=attempts {
            match source.read_frame() {
                Ok(image) => {
                    let frame = Arc::new(self.next_frame(image));
                    if !self.policy.is_corrupt(frame.mean_brightness()) {
                        self.state.update(|s| s.record_frame(frame)).ok();
                    }
                    log::info!("connected to {} (first frame after {} attempt(s))", descriptor, attempt);
                    return Ok(source);
                }
                Err(err) => {
                    log::debug!("first frame attempt {}/{} failed: {:#}", attempt, attempts, err);
                    if attempt < attempts {
                        thread::sleep(self.policy.frame_retry_delay);
                    }
                }
            }
        }
        source.release();
        Err(ConnectError::NoFrames {
            target: descriptor.redacted(),
            attempts,
        })
    }

    /// Reopen the remembered descriptor from inside the capture loop.
    fn reopen(&self) -> Result<(), ConnectError> {
        let descriptor = self.descriptor().clone().ok_or(ConnectError::Cancelled)?;
        let source = self.open_source(&descriptor)?;
        self.store_source(source);
        Ok(())
    }

    fn next_frame(&self, image: image::RgbImage) -> Frame {
        Frame::new(image, self.sequence.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// Drain a few reads to flush decoder buffers, then release the handle.
    ///
    /// Waits for a read in progress on the capture worker, which the source
    /// bounds by its read timeout.
    fn release_source(&self) {
        let taken = self.source().take();
        self.connected.store(false, Ordering::SeqCst);
        let Some(mut source) = taken else {
            return;
        };
        for _ in 0..self.policy.drain_reads {
            if source.read_frame().is_err() {
                break;
            }
        }
        source.release();
    }

    fn teardown(&self) {
        self.release_source();
        self.state
            .update(|s| {
                s.clear_frame();
                s.stats.consecutive_failures = 0;
            })
            .ok();
        self.enter(ConnectionState::Disconnected);
    }

    fn run_capture_loop(&self, run: u64) {
        let policy = &self.policy;
        let mut failures: u32 = 0;
        let mut reconnects: u32 = 0;
        log::info!("capture loop {} started", run);

        while self.is_current(run) && !policy.should_give_up(failures) {
            if !self.connected.load(Ordering::SeqCst) {
                if reconnects >= policy.max_reconnect_attempts {
                    log::error!(
                        "giving up after {} reconnect attempts",
                        reconnects
                    );
                    break;
                }
                reconnects += 1;
                self.state
                    .update(|s| s.stats.reconnect_attempts += 1)
                    .ok();
                match self.reopen() {
                    Ok(()) => {
                        log::info!("reconnected after {} attempt(s)", reconnects);
                        failures = 0;
                        reconnects = 0;
                        self.enter(ConnectionState::Streaming);
                    }
                    Err(err) => {
                        failures += 1;
                        self.record_failure(failures, &err.to_string());
                        log::warn!("reconnect attempt {} failed: {}", reconnects, err);
                        if !err.is_retryable() {
                            break;
                        }
                        self.sleep_while_current(run, policy.reconnect_delay);
                    }
                }
                continue;
            }

            let read = match self.source().as_mut() {
                Some(source) => source.read_frame(),
                None => continue,
            };

            if !self.is_current(run) {
                break;
            }
            match read {
                Ok(image) => {
                    failures = 0;
                    reconnects = 0;
                    self.accept(image);
                }
                Err(err) => {
                    failures += 1;
                    self.record_failure(failures, &format!("{:#}", err));
                    self.state.update(|s| s.stats.decode_errors += 1).ok();
                    if failures % 10 == 0 {
                        log::warn!("frame read failing ({} consecutive): {:#}", failures, err);
                    }
                    if policy.should_reconnect(failures) {
                        log::warn!("{} consecutive read failures, reopening stream", failures);
                        self.release_source();
                        self.enter(ConnectionState::Reconnecting);
                        self.sleep_while_current(run, policy.reconnect_delay);
                        continue;
                    }
                    self.sleep_while_current(run, policy.failure_pause_for(failures));
                }
            }
        }

        if self.generation.load(Ordering::SeqCst) != run {
            log::info!("capture loop {} superseded; leaving the source to its successor", run);
            return;
        }
        let gave_up = self.running.swap(false, Ordering::SeqCst);
        self.release_source();
        self.state.update(|s| s.clear_frame()).ok();
        if gave_up {
            self.enter(ConnectionState::Reconnecting);
            self.enter(ConnectionState::Failed);
            log::error!("capture loop failed after {} consecutive failures", failures);
        }
        let frames = self.state.stats().frames_captured;
        log::info!(
            "capture loop finished (frames: {}, consecutive failures: {})",
            frames,
            failures
        );
    }

    fn record_failure(&self, failures: u32, reason: &str) {
        self.state
            .update(|s| {
                s.stats.consecutive_failures = failures;
                s.stats.last_error = Some(reason.to_string());
            })
            .ok();
    }

    fn accept(&self, image: image::RgbImage) {
        let frame = Arc::new(self.next_frame(image));
        let corrupt = self.policy.is_corrupt(frame.mean_brightness());

        let detection_enabled = self.state.update(|s| {
            s.stats.frames_captured += 1;
            s.stats.consecutive_failures = 0;
            if corrupt {
                s.stats.corrupt_frames += 1;
                s.mark_frame_time(frame.captured_at());
            } else {
                s.record_frame(frame.clone());
            }
            s.detection_enabled()
        });
        let detection_enabled = match detection_enabled {
            Ok(enabled) => enabled,
            Err(err) => {
                log::error!("{:#}", err);
                return;
            }
        };
        if corrupt {
            log::debug!("discarding corrupt frame #{}", frame.sequence());
            return;
        }

        let processor = self
            .processor
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let relay = match processor {
            Some(processor) if detection_enabled => processor.process(frame),
            _ => frame,
        };
        self.distributor.publish(relay);
        self.state.update(|s| s.stats.frames_published += 1).ok();
    }

    fn sleep_while_current(&self, run: u64, duration: Duration) {
        let deadline = Instant::now() + duration;
        while self.is_current(run) {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep((deadline - now).min(Duration::from_millis(20)));
        }
    }
}

/// Wait up to `timeout` for `handle` to finish; detach it otherwise.
fn join_bounded(handle: JoinHandle<()>, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            log::warn!("capture worker did not stop within {:?}; detaching", timeout);
            return false;
        }
        thread::sleep(Duration::from_millis(10));
    }
    if handle.join().is_err() {
        log::error!("capture worker panicked");
    }
    true
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("state", &self.connection_state())
            .field("running", &self.is_running())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::NetworkConnector;

    fn stub_manager() -> ConnectionManager {
        ConnectionManager::new(
            Arc::new(NetworkConnector),
            SourceOptions {
                width: 32,
                height: 24,
                ..SourceOptions::default()
            },
            RetryPolicy::default(),
            SharedState::new(4),
            FrameDistributor::new(2),
        )
    }

    #[test]
    fn superseded_capture_loop_leaves_the_source_alone() -> Result<()> {
        let manager = stub_manager();
        manager.connect("stub://lobby")?;

        // A newer start owns generation 2; loop 1 wakes up late.
        manager.inner.running.store(true, Ordering::SeqCst);
        manager.inner.generation.store(2, Ordering::SeqCst);
        manager.inner.run_capture_loop(1);

        assert!(manager.is_connected());
        assert!(manager.is_running());
        assert_eq!(manager.state().stats().frames_published, 0);
        assert_eq!(manager.connection_state(), ConnectionState::Connected);

        manager.inner.running.store(false, Ordering::SeqCst);
        manager.disconnect();
        assert!(!manager.is_connected());
        Ok(())
    }
}
