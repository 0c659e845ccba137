// src/pipeline/queue.rs
//
// Bounded fan-out queues between the single capture/engine thread and the
// sink consumer threads. Queues are the only shared mutable structure on
// that boundary; all waits are short timed polls so a stop request is
// observed promptly even mid-wait.

use crate::types::Frame;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Poll slice for both producer and consumer waits.
pub const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Backpressure behavior when a consumer's queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueuePolicy {
    /// `offer` waits for space. For consumers that must not drop frames
    /// (durable recording, best-effort local display).
    Blocking,
    /// `offer` returns immediately; a full queue discards the frame. For
    /// live egress where staying current beats completeness.
    Dropping,
}

/// Producer side of one consumer's bounded queue.
#[derive(Clone)]
pub struct FrameQueue {
    tx: Sender<Frame>,
    policy: QueuePolicy,
    stop: Arc<AtomicBool>,
}

impl FrameQueue {
    pub fn new(capacity: usize, policy: QueuePolicy) -> (Self, FrameReceiver) {
        let (tx, rx) = bounded(capacity.max(1));
        let stop = Arc::new(AtomicBool::new(false));
        (
            Self {
                tx,
                policy,
                stop: stop.clone(),
            },
            FrameReceiver { rx, stop },
        )
    }

    /// Offer a frame under this queue's policy. Returns whether the frame
    /// was accepted; non-acceptance is not an error.
    pub fn offer(&self, frame: Frame) -> bool {
        match self.policy {
            QueuePolicy::Dropping => self.tx.try_send(frame).is_ok(),
            QueuePolicy::Blocking => {
                let mut frame = frame;
                loop {
                    if self.stop.load(Ordering::Relaxed) {
                        return false;
                    }
                    match self.tx.send_timeout(frame, POLL_INTERVAL) {
                        Ok(()) => return true,
                        Err(SendTimeoutError::Timeout(f)) => frame = f,
                        Err(SendTimeoutError::Disconnected(_)) => return false,
                    }
                }
            }
        }
    }

    pub fn policy(&self) -> QueuePolicy {
        self.policy
    }
}

/// Outcome of one timed receive on the consumer side.
pub enum Poll {
    Frame(Frame),
    Timeout,
    /// Producer dropped its half; no more frames will arrive.
    Closed,
}

/// Consumer side; owned by exactly one sink worker.
pub struct FrameReceiver {
    rx: Receiver<Frame>,
    stop: Arc<AtomicBool>,
}

impl FrameReceiver {
    /// Wait up to one poll slice for the next frame.
    pub fn poll(&self) -> Poll {
        match self.rx.recv_timeout(POLL_INTERVAL) {
            Ok(frame) => Poll::Frame(frame),
            Err(RecvTimeoutError::Timeout) => Poll::Timeout,
            Err(RecvTimeoutError::Disconnected) => Poll::Closed,
        }
    }

    /// Convenience for tests and drains: next frame or `None`.
    pub fn poll_frame(&self) -> Option<Frame> {
        match self.poll() {
            Poll::Frame(frame) => Some(frame),
            _ => None,
        }
    }

    /// Discard everything currently buffered, returning how many frames
    /// were thrown away.
    pub fn clear(&self) -> usize {
        let mut dropped = 0;
        while self.rx.try_recv().is_ok() {
            dropped += 1;
        }
        dropped
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Signal the producer that this consumer is going away, unblocking any
    /// Blocking `offer` in progress.
    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    fn frame(n: usize) -> Frame {
        Frame {
            data: vec![n as u8; 4],
            width: 2,
            height: 1,
            timestamp_ms: n as f64,
        }
    }

    #[test]
    fn test_dropping_queue_never_exceeds_capacity() {
        let (q, rx) = FrameQueue::new(3, QueuePolicy::Dropping);

        for i in 0..3 {
            assert!(q.offer(frame(i)), "frame {i} should fit");
        }
        // Full queue: immediate non-acceptance
        let started = Instant::now();
        assert!(!q.offer(frame(99)));
        assert!(started.elapsed() < Duration::from_millis(5));
        assert_eq!(rx.len(), 3);

        // Draining one makes room for exactly one
        assert!(rx.poll_frame().is_some());
        assert!(q.offer(frame(4)));
        assert!(!q.offer(frame(5)));
    }

    #[test]
    fn test_blocking_queue_stalls_producer_until_space() {
        let (q, rx) = FrameQueue::new(1, QueuePolicy::Blocking);
        assert!(q.offer(frame(0)));

        // Slow consumer: frees space after 60ms
        let consumer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(60));
            let f = rx.poll_frame().expect("first frame");
            (f, rx)
        });

        let started = Instant::now();
        assert!(q.offer(frame(1)), "offer must succeed once space frees");
        assert!(
            started.elapsed() >= Duration::from_millis(40),
            "producer returned without waiting ({:?})",
            started.elapsed()
        );

        let (first, rx) = consumer.join().unwrap();
        assert_eq!(first.data[0], 0);
        assert_eq!(rx.poll_frame().unwrap().data[0], 1, "nothing was dropped");
    }

    #[test]
    fn test_blocking_offer_released_by_shutdown() {
        let (q, rx) = FrameQueue::new(1, QueuePolicy::Blocking);
        assert!(q.offer(frame(0)));

        thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            rx.shutdown();
            rx // keep the receiver alive past shutdown
        });

        // Queue stays full, but shutdown unblocks the producer promptly
        let started = Instant::now();
        assert!(!q.offer(frame(1)));
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[test]
    fn test_clear_empties_buffered_frames() {
        let (q, rx) = FrameQueue::new(5, QueuePolicy::Dropping);
        for i in 0..4 {
            q.offer(frame(i));
        }
        assert_eq!(rx.clear(), 4);
        assert!(rx.is_empty());
    }
}
