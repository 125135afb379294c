//! Bounded, lossy frame handoff between acquisition and processing

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam::utils::CachePadded;
use flume::{Receiver, RecvTimeoutError, Sender, TrySendError};

use crate::capture::Frame;

/// Frames waiting for inference
pub const FRAME_QUEUE_CAPACITY: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PopError {
    #[error("no frame arrived in time")]
    Empty,
    #[error("frame queue closed")]
    Closed,
}

/// Lossy bounded queue: when full, the incoming frame is dropped so the
/// producer never waits on the consumer.
#[derive(Clone)]
pub struct FrameQueue {
    tx: Sender<Frame>,
    rx: Receiver<Frame>,
    stats: Arc<CachePadded<Stats>>,
}

#[derive(Default)]
struct Stats {
    frames_pushed: AtomicUsize,
    frames_popped: AtomicUsize,
    frames_dropped: AtomicUsize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pushed: usize,
    pub popped: usize,
    pub dropped: usize,
}

impl FrameQueue {
    pub fn new() -> Self {
        let (tx, rx) = flume::bounded(FRAME_QUEUE_CAPACITY);
        Self {
            tx,
            rx,
            stats: Arc::new(CachePadded::new(Stats::default())),
        }
    }

    /// Producer: enqueue unless full. Returns whether the frame was kept.
    pub fn push(&self, frame: Frame) -> bool {
        match self.tx.try_send(frame) {
            Ok(()) => {
                self.stats.frames_pushed.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("frames_dropped_total").increment(1);
                false
            }
        }
    }

    /// Consumer: wait up to `timeout` for the oldest frame
    pub fn pop(&self, timeout: Duration) -> Result<Frame, PopError> {
        match self.rx.recv_timeout(timeout) {
            Ok(frame) => {
                self.stats.frames_popped.fetch_add(1, Ordering::Relaxed);
                Ok(frame)
            }
            Err(RecvTimeoutError::Timeout) => Err(PopError::Empty),
            Err(RecvTimeoutError::Disconnected) => Err(PopError::Closed),
        }
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn capacity(&self) -> usize {
        FRAME_QUEUE_CAPACITY
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            pushed: self.stats.frames_pushed.load(Ordering::Relaxed),
            popped: self.stats.frames_popped.load(Ordering::Relaxed),
            dropped: self.stats.frames_dropped.load(Ordering::Relaxed),
        }
    }
}

impl Default for FrameQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::PixelFormat;
    use std::time::Instant;

    fn frame(seq: u64) -> Frame {
        Frame::new(vec![0u8; 3], seq, 1, 1, PixelFormat::Rgb24, Instant::now())
    }

    #[test]
    fn never_holds_more_than_capacity() {
        let queue = FrameQueue::default();
        let kept: Vec<bool> = (1..=50).map(|seq| queue.push(frame(seq))).collect();

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.capacity(), FRAME_QUEUE_CAPACITY);
        assert_eq!(&kept[..3], &[true, true, false]);
        assert!(kept[2..].iter().all(|k| !k));
        assert_eq!(
            queue.stats(),
            QueueStats {
                pushed: 2,
                popped: 0,
                dropped: 48
            }
        );
    }

    #[test]
    fn survivors_come_out_in_capture_order() {
        let queue = FrameQueue::default();
        for seq in 1..=5 {
            queue.push(frame(seq));
        }
        let timeout = Duration::from_millis(10);
        assert_eq!(queue.pop(timeout).unwrap().sequence(), 1);
        queue.push(frame(6));
        assert_eq!(queue.pop(timeout).unwrap().sequence(), 2);
        assert_eq!(queue.pop(timeout).unwrap().sequence(), 6);
        assert_eq!(queue.pop(timeout).unwrap_err(), PopError::Empty);
    }

    #[test]
    fn pop_times_out_without_producer_activity() {
        let queue = FrameQueue::default();
        let start = Instant::now();
        assert_eq!(queue.pop(Duration::from_millis(20)).unwrap_err(), PopError::Empty);
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn pop_wakes_for_frames_from_another_thread() {
        let queue = FrameQueue::default();
        let producer = queue.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            producer.push(frame(9))
        });
        let popped = queue.pop(Duration::from_secs(5)).unwrap();
        assert_eq!(popped.sequence(), 9);
        assert!(handle.join().unwrap());
    }
}
