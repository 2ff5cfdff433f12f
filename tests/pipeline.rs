use anyhow::{anyhow, Result};
use image::{Rgb, RgbImage};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use facewatch::recognize::backends::StubExtractor;
use facewatch::recognize::{BoundingBox, DetectedFace, Embedding, EmbeddingExtractor};
use facewatch::{
    DetectionEvent, DetectionPipeline, EventPublisher, Frame, InMemoryIdentityStore, MotionConfig,
    MotionGate, PipelineConfig, RecognitionMatcher, SharedState,
};

const W: u32 = 160;
const H: u32 = 120;

fn static_frame(seq: u64) -> Arc<Frame> {
    Arc::new(Frame::new(RgbImage::from_pixel(W, H, Rgb([70, 70, 70])), seq))
}

fn motion_frame(seq: u64) -> Arc<Frame> {
    let mut image = RgbImage::from_pixel(W, H, Rgb([70, 70, 70]));
    for y in 30..90 {
        for x in 50..110 {
            image.put_pixel(x, y, Rgb([240, 240, 240]));
        }
    }
    Arc::new(Frame::new(image, seq))
}

fn alice_face() -> DetectedFace {
    DetectedFace {
        bbox: BoundingBox::new(50.0, 30.0, 110.0, 90.0),
        embedding: Embedding::new(vec![0.6, 0.8, 0.0]),
        score: 0.95,
    }
}

#[derive(Default)]
struct FailingPublisher {
    calls: AtomicUsize,
}

impl EventPublisher for FailingPublisher {
    fn name(&self) -> &'static str {
        "failing"
    }

    fn publish(&self, _event: &DetectionEvent) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(anyhow!("broker offline"))
    }
}

/// Holds every extraction until the test releases it.
struct BlockingExtractor {
    release: Receiver<()>,
}

impl EmbeddingExtractor for BlockingExtractor {
    fn name(&self) -> &'static str {
        "blocking"
    }

    fn extract(&mut self, _image: &RgbImage) -> Vec<DetectedFace> {
        let _ = self.release.recv_timeout(Duration::from_secs(5));
        vec![alice_face()]
    }
}

/// Panics on its first extraction, then finds alice.
#[derive(Default)]
struct PanicOnceExtractor {
    calls: usize,
}

impl EmbeddingExtractor for PanicOnceExtractor {
    fn name(&self) -> &'static str {
        "panic-once"
    }

    fn extract(&mut self, _image: &RgbImage) -> Vec<DetectedFace> {
        self.calls += 1;
        if self.calls == 1 {
            panic!("model runtime crashed");
        }
        vec![alice_face()]
    }
}

struct Harness {
    pipeline: DetectionPipeline,
    state: SharedState,
    publisher: Arc<FailingPublisher>,
}

fn harness(extractor: Option<Box<dyn EmbeddingExtractor>>, config: PipelineConfig) -> Result<Harness> {
    let store = Arc::new(InMemoryIdentityStore::new(3));
    store.enroll("alice", vec![0.6, 0.8, 0.0])?;
    let matcher = Arc::new(RecognitionMatcher::new(extractor, store, 0.6));
    let publisher = Arc::new(FailingPublisher::default());
    let state = SharedState::new(10);
    let gate = MotionGate::new(MotionConfig {
        cooldown: Duration::ZERO,
        ..MotionConfig::default()
    });
    let pipeline = DetectionPipeline::new(gate, matcher, publisher.clone(), state.clone(), config)?;
    Ok(Harness {
        pipeline,
        state,
        publisher,
    })
}

fn warm_up(pipeline: &DetectionPipeline, at: Instant) {
    for seq in 0..15 {
        let frame = static_frame(seq);
        let shown = pipeline.process_at(frame.clone(), at);
        assert!(Arc::ptr_eq(&shown, &frame));
    }
}

#[test]
fn motion_cycle_records_history_even_when_publish_fails() -> Result<()> {
    let h = harness(
        Some(Box::new(StubExtractor::with_faces(vec![alice_face()]))),
        PipelineConfig::default(),
    )?;
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    h.pipeline.on_detection("collect", move |event| {
        sink.lock().map_err(|_| anyhow!("poisoned"))?.push(event.frame_sequence);
        Ok(())
    });

    let t0 = Instant::now();
    warm_up(&h.pipeline, t0);
    let frame = motion_frame(100);
    let shown = h.pipeline.process_at(frame.clone(), t0);
    assert!(!Arc::ptr_eq(&shown, &frame), "motion frames are annotated");
    assert!(h.pipeline.wait_idle(Duration::from_secs(5)));

    let history = h.state.recent_detections(10);
    assert_eq!(history.len(), 1);
    let event = &history[0];
    assert_eq!(event.frame_sequence, 100);
    assert!(event.motion);
    assert!(event.frame_bytes > 0);
    assert_eq!(event.results.len(), 1);
    assert_eq!(event.results[0].name, "alice");
    assert!(event.person_detected());

    assert_eq!(h.publisher.calls.load(Ordering::SeqCst), 1);
    assert_eq!(*seen.lock().map_err(|_| anyhow!("poisoned"))?, vec![100]);
    assert_eq!(h.state.stats().motion_triggers, 1);
    Ok(())
}

#[test]
fn triggers_during_recognition_are_skipped() -> Result<()> {
    let (release, gate) = mpsc::channel();
    let h = harness(
        Some(Box::new(BlockingExtractor { release: gate })),
        PipelineConfig::default(),
    )?;

    let t0 = Instant::now();
    warm_up(&h.pipeline, t0);
    h.pipeline.process_at(motion_frame(100), t0);
    assert!(h.pipeline.recognition_in_flight());

    h.pipeline.process_at(static_frame(101), t0 + Duration::from_secs(1));
    h.pipeline.process_at(motion_frame(102), t0 + Duration::from_secs(1));

    let stats = h.state.stats();
    assert_eq!(stats.motion_triggers, 2);
    assert_eq!(stats.recognitions_skipped, 1);

    release.send(())?;
    assert!(h.pipeline.wait_idle(Duration::from_secs(5)));
    let history = h.state.recent_detections(10);
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].frame_sequence, 100);
    Ok(())
}

#[test]
fn panicking_cycle_frees_the_slot_for_later_triggers() -> Result<()> {
    let h = harness(
        Some(Box::new(PanicOnceExtractor::default())),
        PipelineConfig::default(),
    )?;

    let t0 = Instant::now();
    warm_up(&h.pipeline, t0);
    h.pipeline.process_at(motion_frame(100), t0);
    assert!(h.pipeline.wait_idle(Duration::from_secs(5)));
    assert_eq!(h.state.stats().recognitions_failed, 1);
    assert!(h.state.recent_detections(10).is_empty());

    h.pipeline.process_at(motion_frame(101), t0 + Duration::from_secs(1));
    assert!(h.pipeline.wait_idle(Duration::from_secs(5)));

    let stats = h.state.stats();
    assert_eq!(stats.motion_triggers, 2);
    assert_eq!(stats.recognitions_skipped, 0);
    let history = h.state.recent_detections(10);
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].frame_sequence, 101);
    assert_eq!(history[0].results[0].name, "alice");
    Ok(())
}

#[test]
fn manual_cycle_waits_for_the_recognition_slot() -> Result<()> {
    let (release, gate) = mpsc::channel();
    let h = harness(
        Some(Box::new(BlockingExtractor { release: gate })),
        PipelineConfig::default(),
    )?;
    let trigger = facewatch::MotionTrigger {
        frame: static_frame(200),
        regions: Vec::new(),
        sequence: 200,
    };

    let t0 = Instant::now();
    warm_up(&h.pipeline, t0);
    h.pipeline.process_at(motion_frame(100), t0);
    assert!(h.pipeline.recognition_in_flight());

    assert!(h.pipeline.run_cycle(&trigger).is_none());
    assert_eq!(h.state.stats().recognitions_skipped, 1);

    release.send(())?;
    assert!(h.pipeline.wait_idle(Duration::from_secs(5)));
    assert_eq!(h.state.recent_detections(10).len(), 1);

    release.send(())?;
    let event = h.pipeline.run_cycle(&trigger).expect("slot is free");
    assert_eq!(event.frame_sequence, 200);
    assert!(!h.pipeline.recognition_in_flight());
    assert_eq!(h.state.recent_detections(10).len(), 2);
    Ok(())
}

#[test]
fn disabled_motion_relays_frames_untouched() -> Result<()> {
    let h = harness(
        Some(Box::new(StubExtractor::with_faces(vec![alice_face()]))),
        PipelineConfig {
            motion_enabled: false,
            ..PipelineConfig::default()
        },
    )?;
    let t0 = Instant::now();
    warm_up(&h.pipeline, t0);
    let frame = motion_frame(100);
    assert!(Arc::ptr_eq(&h.pipeline.process_at(frame.clone(), t0), &frame));
    assert!(!h.pipeline.recognition_in_flight());
    assert_eq!(h.state.stats().motion_triggers, 0);
    assert!(h.state.recent_detections(10).is_empty());
    Ok(())
}

#[test]
fn manual_cycle_without_extractor_yields_empty_results() -> Result<()> {
    let h = harness(None, PipelineConfig::default())?;
    let trigger = facewatch::MotionTrigger {
        frame: static_frame(7),
        regions: Vec::new(),
        sequence: 7,
    };

    let event = h.pipeline.run_cycle(&trigger).expect("slot is free");
    assert!(event.results.is_empty());
    assert!(!event.person_detected());
    assert_eq!(event.max_confidence(), 0.0);
    assert_eq!(h.state.recent_detections(10).len(), 1);
    assert_eq!(h.publisher.calls.load(Ordering::SeqCst), 1);
    Ok(())
}

#[test]
fn shutdown_rejects_further_triggers() -> Result<()> {
    let h = harness(
        Some(Box::new(StubExtractor::with_faces(vec![alice_face()]))),
        PipelineConfig::default(),
    )?;
    h.pipeline.shutdown();

    let t0 = Instant::now();
    warm_up(&h.pipeline, t0);
    h.pipeline.process_at(motion_frame(100), t0);
    assert!(!h.pipeline.recognition_in_flight());
    assert!(h.state.recent_detections(10).is_empty());
    // Shutdown twice is harmless.
    h.pipeline.shutdown();
    Ok(())
}
