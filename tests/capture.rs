use anyhow::{anyhow, Result};
use image::{Rgb, RgbImage};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use facewatch::{
    ConnectError, ConnectionManager, ConnectionState, FrameDistributor, FrameSource, RecvOutcome,
    RetryPolicy, SharedState, SourceConnector, SourceDescriptor, SourceOptions,
};

/// Connector whose sources serve `good_reads` gray frames, then fail forever.
struct MockConnector {
    probes: AtomicU32,
    opens: AtomicU32,
    /// Opens numbered below this fail.
    fail_opens_before: u32,
    /// Opens numbered at or above this fail.
    fail_opens_from: u32,
    /// Sources from opens numbered at or above this never run dry.
    healthy_from: u32,
    probe_fails: bool,
    good_reads: u32,
    /// Gray level of every served frame.
    pixel: u8,
    read_delay: Duration,
    released: Arc<AtomicUsize>,
}

impl MockConnector {
    fn new(good_reads: u32) -> Self {
        Self {
            probes: AtomicU32::new(0),
            opens: AtomicU32::new(0),
            fail_opens_before: 0,
            fail_opens_from: u32::MAX,
            healthy_from: u32::MAX,
            probe_fails: false,
            good_reads,
            pixel: 128,
            read_delay: Duration::from_millis(2),
            released: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn network_calls(&self) -> u32 {
        self.probes.load(Ordering::SeqCst) + self.opens.load(Ordering::SeqCst)
    }
}

impl SourceConnector for MockConnector {
    fn probe(&self, descriptor: &SourceDescriptor, _timeout: Duration) -> Result<(), ConnectError> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        if self.probe_fails {
            return Err(ConnectError::Unreachable {
                target: descriptor.redacted(),
                reason: "connection refused".into(),
            });
        }
        Ok(())
    }

    fn open(
        &self,
        descriptor: &SourceDescriptor,
        _options: &SourceOptions,
    ) -> Result<Box<dyn FrameSource>, ConnectError> {
        let n = self.opens.fetch_add(1, Ordering::SeqCst);
        if n < self.fail_opens_before || n >= self.fail_opens_from {
            return Err(ConnectError::Open {
                target: descriptor.redacted(),
                reason: "handshake failed".into(),
            });
        }
        Ok(Box::new(MockSource {
            remaining: if n >= self.healthy_from {
                u32::MAX
            } else {
                self.good_reads
            },
            pixel: self.pixel,
            read_delay: self.read_delay,
            released: self.released.clone(),
            is_released: false,
        }))
    }
}

struct MockSource {
    remaining: u32,
    pixel: u8,
    read_delay: Duration,
    released: Arc<AtomicUsize>,
    is_released: bool,
}

impl FrameSource for MockSource {
    fn read_frame(&mut self) -> Result<RgbImage> {
        std::thread::sleep(self.read_delay);
        if self.is_released {
            return Err(anyhow!("source released"));
        }
        if self.remaining == 0 {
            return Err(anyhow!("no signal"));
        }
        if self.remaining != u32::MAX {
            self.remaining -= 1;
        }
        Ok(RgbImage::from_pixel(32, 24, Rgb([self.pixel; 3])))
    }

    fn release(&mut self) {
        if !self.is_released {
            self.is_released = true;
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }
}

fn fast_policy() -> RetryPolicy {
    RetryPolicy {
        probe_timeout: Duration::from_millis(50),
        frame_attempts: 1,
        frame_retry_delay: Duration::from_millis(1),
        connect_attempts: 3,
        connect_retry_delay: Duration::from_millis(1),
        soft_failure_threshold: 2,
        hard_failure_threshold: 4,
        max_reconnect_attempts: 2,
        failure_pause: Duration::from_millis(1),
        max_failure_pause: Duration::from_millis(2),
        reconnect_delay: Duration::from_millis(1),
        drain_reads: 0,
        min_brightness: 5.0,
        max_brightness: 250.0,
        join_timeout: Duration::from_secs(2),
    }
}

fn manager_with(connector: Arc<MockConnector>) -> (ConnectionManager, FrameDistributor) {
    let distributor = FrameDistributor::new(3);
    let manager = ConnectionManager::new(
        connector,
        SourceOptions::default(),
        fast_policy(),
        SharedState::new(10),
        distributor.clone(),
    );
    (manager, distributor)
}

fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    done()
}

fn wait_for_state(manager: &ConnectionManager, want: ConnectionState, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if manager.connection_state() == want {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    manager.connection_state() == want
}

#[test]
fn malformed_descriptors_never_touch_the_network() {
    let connector = Arc::new(MockConnector::new(u32::MAX));
    let (manager, _distributor) = manager_with(connector.clone());

    for raw in ["ftp://x", "camera", "", "rtsp://"] {
        let err = manager.connect(raw).unwrap_err();
        assert!(
            matches!(err, ConnectError::InvalidDescriptor { .. }),
            "{raw:?} gave {err:?}"
        );
        assert!(!err.is_retryable());
    }
    let err = manager.connect_with_retry("camera", 5).unwrap_err();
    assert!(matches!(err, ConnectError::InvalidDescriptor { .. }));

    assert_eq!(connector.network_calls(), 0);
    assert_eq!(manager.connection_state(), ConnectionState::Disconnected);
}

#[test]
fn unreachable_host_is_retried_then_reported() {
    let mut connector = MockConnector::new(u32::MAX);
    connector.probe_fails = true;
    let connector = Arc::new(connector);
    let (manager, _distributor) = manager_with(connector.clone());

    let err = manager
        .connect_with_retry("rtsp://10.0.0.9:554/stream", 3)
        .unwrap_err();
    assert!(matches!(err, ConnectError::Unreachable { .. }));
    assert_eq!(connector.probes.load(Ordering::SeqCst), 3);
    assert_eq!(connector.opens.load(Ordering::SeqCst), 0);
    assert_eq!(manager.connection_state(), ConnectionState::Disconnected);
}

#[test]
fn connect_with_retry_succeeds_after_transient_failures() {
    let mut connector = MockConnector::new(u32::MAX);
    connector.fail_opens_before = 2;
    let connector = Arc::new(connector);
    let (manager, _distributor) = manager_with(connector.clone());

    manager
        .connect_with_retry("rtsp://cam.local/live", 3)
        .expect("third attempt succeeds");
    assert_eq!(connector.opens.load(Ordering::SeqCst), 3);
    assert_eq!(manager.connection_state(), ConnectionState::Connected);
    assert!(manager.state().current_frame().is_some());
    manager.disconnect();
}

#[test]
fn streaming_frames_reach_subscribers_and_stop_releases() {
    let connector = Arc::new(MockConnector::new(u32::MAX));
    let (manager, distributor) = manager_with(connector.clone());
    let subscription = distributor.subscribe();

    manager.connect("rtsp://cam.local/live").expect("connect");
    manager.start().expect("start");
    assert_eq!(manager.connection_state(), ConnectionState::Streaming);

    let mut sequences = Vec::new();
    while sequences.len() < 3 {
        match subscription.recv_timeout(Duration::from_secs(2)) {
            RecvOutcome::Frame(frame) => sequences.push(frame.sequence()),
            other => panic!("expected a frame, got {other:?}"),
        }
    }
    assert!(sequences.windows(2).all(|w| w[0] < w[1]));
    assert!(subscription.len() <= distributor.capacity());

    assert!(manager.stop());
    assert_eq!(manager.connection_state(), ConnectionState::Disconnected);
    assert_eq!(connector.released.load(Ordering::SeqCst), 1);
    assert!(manager.state().current_frame().is_none());
    assert!(!manager.is_running());
}

#[test]
fn start_without_source_is_rejected() {
    let connector = Arc::new(MockConnector::new(u32::MAX));
    let (manager, _distributor) = manager_with(connector);
    assert!(manager.start().is_err());
    assert!(!manager.is_running());
}

#[test]
fn persistent_read_failures_end_in_failed_with_handle_released() {
    let mut connector = MockConnector::new(1);
    // The initial connect succeeds; every reopen fails.
    connector.fail_opens_from = 1;
    let connector = Arc::new(connector);
    let (manager, _distributor) = manager_with(connector.clone());

    manager.connect("rtsp://cam.local/live").expect("connect");
    manager.start().expect("start");

    assert!(wait_for_state(
        &manager,
        ConnectionState::Failed,
        Duration::from_secs(5)
    ));
    let deadline = Instant::now() + Duration::from_secs(2);
    while manager.is_running() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    assert!(!manager.is_running());
    assert_eq!(connector.released.load(Ordering::SeqCst), 1);
    assert!(manager.state().stats().reconnect_attempts >= 1);
    assert!(manager.state().stats().last_error.is_some());

    // Failed is recoverable through an explicit disconnect.
    manager.disconnect();
    assert_eq!(manager.connection_state(), ConnectionState::Disconnected);
}

#[test]
fn soft_threshold_reopens_and_resumes_streaming() {
    // Three good reads (one used by connect), then the first handle runs dry;
    // the reopened handle is healthy.
    let mut connector = MockConnector::new(3);
    connector.healthy_from = 1;
    let connector = Arc::new(connector);
    let (manager, distributor) = manager_with(connector.clone());

    manager.connect("rtsp://cam.local/live").expect("connect");
    manager.start().expect("start");

    assert!(wait_until(Duration::from_secs(5), || {
        connector.opens.load(Ordering::SeqCst) == 2
            && manager.connection_state() == ConnectionState::Streaming
            && manager.state().stats().frames_published >= 5
    }));
    let stats = manager.state().stats();
    assert_eq!(stats.reconnect_attempts, 1);
    assert_eq!(stats.consecutive_failures, 0);
    assert_eq!(stats.decode_errors, 3);
    assert_eq!(connector.released.load(Ordering::SeqCst), 1);
    assert!(manager.is_running());

    // Frames flow again after the reopen.
    let subscription = distributor.subscribe();
    assert!(matches!(
        subscription.recv_timeout(Duration::from_secs(2)),
        RecvOutcome::Frame(_)
    ));
    assert!(manager.stop());
}

#[test]
fn corrupt_frames_are_dropped_without_counting_as_failures() {
    let mut connector = MockConnector::new(u32::MAX);
    connector.pixel = 0;
    let connector = Arc::new(connector);
    let (manager, distributor) = manager_with(connector.clone());
    let subscription = distributor.subscribe();

    manager.connect("rtsp://cam.local/live").expect("connect");
    manager.start().expect("start");
    assert!(wait_until(Duration::from_secs(5), || {
        manager.state().stats().corrupt_frames >= 5
    }));

    let stats = manager.state().stats();
    assert_eq!(stats.frames_published, 0);
    assert_eq!(stats.consecutive_failures, 0);
    assert_eq!(stats.reconnect_attempts, 0);
    assert_eq!(manager.connection_state(), ConnectionState::Streaming);
    assert!(manager.state().current_frame().is_none());
    assert!(matches!(
        subscription.recv_timeout(Duration::from_millis(50)),
        RecvOutcome::Empty
    ));
    assert!(manager.stop());
}

#[test]
fn connection_queries_do_not_wait_on_a_slow_read() {
    let mut connector = MockConnector::new(u32::MAX);
    connector.read_delay = Duration::from_millis(400);
    let connector = Arc::new(connector);
    let (manager, _distributor) = manager_with(connector.clone());

    manager.connect("rtsp://cam.local/live").expect("connect");
    manager.start().expect("start");
    // Let the worker enter its first read.
    std::thread::sleep(Duration::from_millis(50));

    let asked = Instant::now();
    assert!(manager.is_connected());
    let _ = manager.status();
    assert!(asked.elapsed() < Duration::from_millis(200));

    manager.stop();
    assert!(!manager.is_connected());
}

#[test]
fn disconnect_is_idempotent() {
    let connector = Arc::new(MockConnector::new(u32::MAX));
    let (manager, _distributor) = manager_with(connector.clone());

    manager.disconnect();
    manager.connect("rtsp://cam.local/live").expect("connect");
    manager.disconnect();
    manager.disconnect();

    assert_eq!(manager.connection_state(), ConnectionState::Disconnected);
    assert_eq!(connector.released.load(Ordering::SeqCst), 1);
}

#[test]
fn stub_source_streams_without_network() {
    let distributor = FrameDistributor::new(3);
    let manager = ConnectionManager::new(
        Arc::new(facewatch::NetworkConnector),
        SourceOptions {
            width: 64,
            height: 48,
            ..SourceOptions::default()
        },
        fast_policy(),
        SharedState::new(10),
        distributor.clone(),
    );
    let subscription = distributor.subscribe();

    manager.connect("stub://front_camera").expect("stub connect");
    manager.start().expect("start");
    match subscription.recv_timeout(Duration::from_secs(2)) {
        RecvOutcome::Frame(frame) => {
            assert_eq!((frame.width(), frame.height()), (64, 48));
        }
        other => panic!("expected a frame, got {other:?}"),
    }
    assert!(manager.stop());
}
