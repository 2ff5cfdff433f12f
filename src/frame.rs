//! Frames and the bounded frame relay.
//!
//! - `Frame`: immutable decoded image + capture timestamp + sequence number.
//! - `FrameDistributor`: single-producer / multi-consumer relay. Each subscriber
//!   owns a bounded queue with drop-oldest semantics, so the producer never blocks
//!   and a slow viewer never holds back the capture loop or other viewers.
//!
//! Frames are shared as `Arc<Frame>` once published. Nothing mutates a frame after
//! creation; stages that change pixels (annotation, enhancement) build a new frame.

use chrono::{DateTime, Utc};
use image::RgbImage;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

/// Default relay depth per subscriber.
pub const DEFAULT_DISTRIBUTOR_CAPACITY: usize = 3;

// ----------------------------------------------------------------------------
// Frame
// ----------------------------------------------------------------------------

/// Decoded RGB frame.
///
/// There is no `Clone`: a frame is moved between stages or shared behind an `Arc`.
pub struct Frame {
    image: RgbImage,
    captured_at: DateTime<Utc>,
    sequence: u64,
}

impl Frame {
    /// Create a frame stamped with the current wall-clock time.
    pub fn new(image: RgbImage, sequence: u64) -> Self {
        Self::with_timestamp(image, sequence, Utc::now())
    }

    pub fn with_timestamp(image: RgbImage, sequence: u64, captured_at: DateTime<Utc>) -> Self {
        Self {
            image,
            captured_at,
            sequence,
        }
    }

    /// Build a new frame from processed pixels, keeping capture metadata.
    pub fn derive(&self, image: RgbImage) -> Frame {
        Frame {
            image,
            captured_at: self.captured_at,
            sequence: self.sequence,
        }
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Raw pixel byte length.
    pub fn byte_len(&self) -> usize {
        self.image.as_raw().len()
    }

    /// Mean intensity over all channels (0..=255). Empty frames report 0.
    pub fn mean_brightness(&self) -> f64 {
        let raw = self.image.as_raw();
        if raw.is_empty() {
            return 0.0;
        }
        let sum: u64 = raw.iter().map(|&v| v as u64).sum();
        sum as f64 / raw.len() as f64
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width())
            .field("height", &self.height())
            .field("sequence", &self.sequence)
            .field("captured_at", &self.captured_at)
            .finish()
    }
}

// ----------------------------------------------------------------------------
// FrameDistributor
// ----------------------------------------------------------------------------

/// Outcome of waiting on a subscription.
#[derive(Debug)]
pub enum RecvOutcome {
    Frame(Arc<Frame>),
    /// Nothing arrived within the timeout. Not an error; the source may be stalled.
    Empty,
    /// The distributor was closed and the queue is drained.
    Closed,
}

struct SlotQueue {
    frames: VecDeque<Arc<Frame>>,
    dropped: u64,
    closed: bool,
}

struct Slot {
    capacity: usize,
    queue: Mutex<SlotQueue>,
    ready: Condvar,
}

impl Slot {
    fn new(capacity: usize, closed: bool) -> Self {
        Self {
            capacity,
            queue: Mutex::new(SlotQueue {
                frames: VecDeque::with_capacity(capacity),
                dropped: 0,
                closed,
            }),
            ready: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SlotQueue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push(&self, frame: Arc<Frame>) {
        let mut queue = self.lock();
        if queue.closed {
            return;
        }
        while queue.frames.len() >= self.capacity {
            queue.frames.pop_front();
            queue.dropped += 1;
        }
        queue.frames.push_back(frame);
        drop(queue);
        self.ready.notify_one();
    }
}

struct DistributorShared {
    capacity: usize,
    subscribers: Mutex<Vec<Weak<Slot>>>,
    closed: Mutex<bool>,
}

/// Bounded, non-blocking fan-out of frames to independent consumers.
///
/// Cloning the distributor yields another handle to the same relay.
#[derive(Clone)]
pub struct FrameDistributor {
    shared: Arc<DistributorShared>,
}

impl FrameDistributor {
    pub fn new(capacity: usize) -> Self {
        Self {
            shared: Arc::new(DistributorShared {
                capacity: capacity.max(1),
                subscribers: Mutex::new(Vec::new()),
                closed: Mutex::new(false),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Register a new consumer. It only sees frames published after this call.
    pub fn subscribe(&self) -> FrameSubscription {
        let closed = *self
            .shared
            .closed
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let slot = Arc::new(Slot::new(self.shared.capacity, closed));
        self.subscribers().push(Arc::downgrade(&slot));
        FrameSubscription { slot }
    }

    /// Hand a frame to every live subscriber. Never blocks on a consumer.
    ///
    /// Returns the number of subscribers that received the frame.
    pub fn publish(&self, frame: Arc<Frame>) -> usize {
        let mut subscribers = self.subscribers();
        subscribers.retain(|slot| slot.strong_count() > 0);
        let mut delivered = 0;
        for slot in subscribers.iter().filter_map(Weak::upgrade) {
            slot.push(frame.clone());
            delivered += 1;
        }
        delivered
    }

    /// Discard everything currently buffered for every subscriber.
    pub fn clear(&self) {
        for slot in self.subscribers().iter().filter_map(Weak::upgrade) {
            slot.lock().frames.clear();
        }
    }

    /// Stop relaying. Waiting consumers wake up and observe `RecvOutcome::Closed`
    /// once their queue is drained.
    pub fn close(&self) {
        *self
            .shared
            .closed
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = true;
        for slot in self.subscribers().iter().filter_map(Weak::upgrade) {
            slot.lock().closed = true;
            slot.ready.notify_all();
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers()
            .iter()
            .filter(|slot| slot.strong_count() > 0)
            .count()
    }

    /// Deepest subscriber queue (never above `capacity()`).
    pub fn max_queue_len(&self) -> usize {
        self.subscribers()
            .iter()
            .filter_map(Weak::upgrade)
            .map(|slot| slot.lock().frames.len())
            .max()
            .unwrap_or(0)
    }

    fn subscribers(&self) -> MutexGuard<'_, Vec<Weak<Slot>>> {
        self.shared
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for FrameDistributor {
    fn default() -> Self {
        Self::new(DEFAULT_DISTRIBUTOR_CAPACITY)
    }
}

/// Consumer side of the relay. Dropping it unsubscribes.
pub struct FrameSubscription {
    slot: Arc<Slot>,
}

impl FrameSubscription {
    /// Wait up to `timeout` for the oldest buffered frame.
    pub fn recv_timeout(&self, timeout: Duration) -> RecvOutcome {
        let queue = self.slot.lock();
        let (mut queue, _) = self
            .slot
            .ready
            .wait_timeout_while(queue, timeout, |q| q.frames.is_empty() && !q.closed)
            .unwrap_or_else(PoisonError::into_inner);
        match queue.frames.pop_front() {
            Some(frame) => RecvOutcome::Frame(frame),
            None if queue.closed => RecvOutcome::Closed,
            None => RecvOutcome::Empty,
        }
    }

    pub fn try_recv(&self) -> Option<Arc<Frame>> {
        self.slot.lock().frames.pop_front()
    }

    pub fn len(&self) -> usize {
        self.slot.lock().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Frames evicted from this subscriber's queue because it was full.
    pub fn dropped(&self) -> u64 {
        self.slot.lock().dropped
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn make_frame(sequence: u64) -> Arc<Frame> {
        Arc::new(Frame::new(RgbImage::new(4, 4), sequence))
    }

    #[test]
    fn burst_keeps_three_most_recent_in_order() {
        let distributor = FrameDistributor::new(3);
        let sub = distributor.subscribe();

        for seq in 1..=5 {
            distributor.publish(make_frame(seq));
        }

        assert_eq!(sub.len(), 3);
        assert_eq!(sub.dropped(), 2);
        let seqs: Vec<u64> = std::iter::from_fn(|| sub.try_recv())
            .map(|f| f.sequence())
            .collect();
        assert_eq!(seqs, vec![3, 4, 5]);
    }

    #[test]
    fn queue_never_exceeds_capacity() {
        let distributor = FrameDistributor::new(2);
        let sub = distributor.subscribe();
        for seq in 0..100 {
            distributor.publish(make_frame(seq));
            assert!(sub.len() <= 2);
            assert!(distributor.max_queue_len() <= 2);
        }
        // The newest frame is always still there.
        let last = std::iter::from_fn(|| sub.try_recv()).last().unwrap();
        assert_eq!(last.sequence(), 99);
    }

    #[test]
    fn empty_queue_times_out_without_error() {
        let distributor = FrameDistributor::new(3);
        let sub = distributor.subscribe();
        assert!(matches!(
            sub.recv_timeout(Duration::from_millis(10)),
            RecvOutcome::Empty
        ));
    }

    #[test]
    fn subscribers_are_independent() {
        let distributor = FrameDistributor::new(3);
        let fast = distributor.subscribe();
        let slow = distributor.subscribe();

        distributor.publish(make_frame(1));
        assert_eq!(fast.try_recv().map(|f| f.sequence()), Some(1));
        assert_eq!(slow.len(), 1);

        drop(slow);
        assert_eq!(distributor.publish(make_frame(2)), 1);
        assert_eq!(distributor.subscriber_count(), 1);
    }

    #[test]
    fn close_wakes_waiting_consumer() {
        let distributor = FrameDistributor::new(3);
        let sub = distributor.subscribe();
        let closer = distributor.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            closer.close();
        });
        assert!(matches!(
            sub.recv_timeout(Duration::from_secs(5)),
            RecvOutcome::Closed
        ));
        handle.join().unwrap();
    }

    #[test]
    fn derived_frame_keeps_metadata() {
        let frame = Frame::new(RgbImage::new(2, 2), 7);
        let derived = frame.derive(RgbImage::from_pixel(2, 2, image::Rgb([255, 255, 255])));
        assert_eq!(derived.sequence(), 7);
        assert_eq!(derived.captured_at(), frame.captured_at());
        assert_eq!(frame.mean_brightness(), 0.0);
        assert_eq!(derived.mean_brightness(), 255.0);
    }
}
