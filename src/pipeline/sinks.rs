// src/pipeline/sinks.rs
//
// Frame consumers. Each sink runs on its own worker thread behind its own
// bounded queue; the worker never holds a lock across sink I/O.

use crate::pipeline::queue::{FrameQueue, FrameReceiver, Poll, QueuePolicy};
use crate::types::Frame;
use anyhow::Result;
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::thread::JoinHandle;
use tracing::{debug, error, info, warn};

/// A frame consumer. `accept` reports whether the frame was handled;
/// sinks never propagate per-frame errors to the producer.
pub trait FrameSink: Send {
    fn name(&self) -> &str;

    fn accept(&mut self, frame: &Frame) -> bool;

    /// Called once when the worker stops, before thread join.
    fn close(&mut self) {}
}

/// One consumer thread draining one bounded queue into one sink.
pub struct SinkWorker {
    queue: FrameQueue,
    handle: Option<JoinHandle<()>>,
}

impl SinkWorker {
    pub fn spawn(name: &str, capacity: usize, policy: QueuePolicy, sink: Box<dyn FrameSink>) -> Self {
        let (queue, rx) = FrameQueue::new(capacity, policy);
        let thread_name = format!("sink-{}", name);

        let handle = std::thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || run_sink(rx, sink))
            .unwrap_or_else(|e| panic!("failed to spawn {}: {}", thread_name, e));

        Self {
            queue,
            handle: Some(handle),
        }
    }

    /// Offer a frame under the worker's queue policy.
    pub fn offer(&self, frame: Frame) -> bool {
        self.queue.offer(frame)
    }

    pub fn policy(&self) -> QueuePolicy {
        self.queue.policy()
    }

    /// Stop the consumer and wait for it to release its resources. At most
    /// the single in-flight frame is lost.
    pub fn stop(&mut self) {
        // Dropping our producer half disconnects the channel; the worker
        // notices within one poll interval.
        let (orphan, rx) = FrameQueue::new(1, self.queue.policy());
        rx.shutdown();
        let _ = std::mem::replace(&mut self.queue, orphan);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for SinkWorker {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.stop();
        }
    }
}

fn run_sink(rx: FrameReceiver, mut sink: Box<dyn FrameSink>) {
    info!("sink '{}' started", sink.name());
    loop {
        match rx.poll() {
            Poll::Frame(frame) => {
                if !sink.accept(&frame) {
                    debug!("sink '{}' did not accept frame", sink.name());
                }
            }
            Poll::Timeout => continue,
            Poll::Closed => break,
        }
    }
    sink.close();
    info!("sink '{}' stopped", sink.name());
}

/// Headless display: keeps the newest frame on disk as a JPEG so an
/// operator (or a web UI) can watch the channel without a window.
pub struct PreviewSink {
    name: String,
    path: PathBuf,
    written: u64,
}

impl PreviewSink {
    pub fn new(name: &str, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.to_string(),
            path: path.into(),
            written: 0,
        }
    }
}

impl FrameSink for PreviewSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn accept(&mut self, frame: &Frame) -> bool {
        match encode_jpeg(frame, 85) {
            Some(jpeg) => {
                let tmp = self.path.with_extension("jpg.tmp");
                let ok = std::fs::write(&tmp, &jpeg)
                    .and_then(|_| std::fs::rename(&tmp, &self.path))
                    .is_ok();
                if ok {
                    self.written += 1;
                } else {
                    warn!("preview write failed: {}", self.path.display());
                }
                ok
            }
            None => {
                debug!("preview: frame geometry mismatch, skipped");
                false
            }
        }
    }
}

/// Durable recording: raw frame bytes appended to a file. Runs behind a
/// Blocking queue because dropped frames here mean lost footage.
pub struct RecordSink {
    name: String,
    path: PathBuf,
    file: Option<File>,
    frames: u64,
}

impl RecordSink {
    pub fn create(name: &str, path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = File::create(&path)?;
        Ok(Self {
            name: name.to_string(),
            path,
            file: Some(file),
            frames: 0,
        })
    }

    pub fn frames_written(&self) -> u64 {
        self.frames
    }
}

impl FrameSink for RecordSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn accept(&mut self, frame: &Frame) -> bool {
        let Some(file) = self.file.as_mut() else {
            return false;
        };
        match file.write_all(&frame.data) {
            Ok(()) => {
                self.frames += 1;
                true
            }
            Err(e) => {
                error!("record '{}' write failed: {}", self.path.display(), e);
                // A dead file stays dead; keep draining so the producer
                // is not stalled forever on a Blocking queue.
                self.file = None;
                false
            }
        }
    }

    fn close(&mut self) {
        if let Some(file) = self.file.take() {
            let _ = file.sync_all();
        }
    }
}

/// bgr24 frame to JPEG via the `image` crate; `None` when the byte length
/// does not match the stated geometry.
fn encode_jpeg(frame: &Frame, quality: u8) -> Option<Vec<u8>> {
    use image::{ImageBuffer, RgbImage};
    use std::io::Cursor;

    let expected = frame.width * frame.height * 3;
    if frame.data.len() < expected {
        return None;
    }

    // Frames arrive bgr24; the encoder wants RGB.
    let mut rgb = frame.data[..expected].to_vec();
    for px in rgb.chunks_exact_mut(3) {
        px.swap(0, 2);
    }

    let img: RgbImage =
        ImageBuffer::from_raw(frame.width as u32, frame.height as u32, rgb)?;

    let mut buf = Cursor::new(Vec::new());
    let encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut buf, quality);
    img.write_with_encoder(encoder).ok()?;
    Some(buf.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::tempdir;

    fn frame(w: usize, h: usize) -> Frame {
        Frame {
            data: vec![128; w * h * 3],
            width: w,
            height: h,
            timestamp_ms: 0.0,
        }
    }

    struct CountingSink(Arc<AtomicUsize>);

    impl FrameSink for CountingSink {
        fn name(&self) -> &str {
            "counting"
        }
        fn accept(&mut self, _frame: &Frame) -> bool {
            self.0.fetch_add(1, Ordering::SeqCst);
            true
        }
    }

    #[test]
    fn test_worker_drains_and_stops() {
        let seen = Arc::new(AtomicUsize::new(0));
        let mut worker = SinkWorker::spawn(
            "test",
            4,
            QueuePolicy::Blocking,
            Box::new(CountingSink(seen.clone())),
        );

        for _ in 0..10 {
            assert!(worker.offer(frame(2, 2)));
        }
        // Blocking policy: all 10 were accepted by the producer side, so
        // all 10 must reach the sink.
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while seen.load(Ordering::SeqCst) < 10 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(seen.load(Ordering::SeqCst), 10);

        worker.stop();
        assert!(!worker.offer(frame(2, 2)), "stopped worker rejects frames");
    }

    #[test]
    fn test_record_sink_appends_raw_bytes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.raw");
        let mut sink = RecordSink::create("rec", &path).unwrap();

        assert!(sink.accept(&frame(2, 2)));
        assert!(sink.accept(&frame(2, 2)));
        sink.close();

        assert_eq!(sink.frames_written(), 2);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 2 * 2 * 2 * 3);
    }

    #[test]
    fn test_preview_sink_writes_latest_jpeg() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("preview.jpg");
        let mut sink = PreviewSink::new("preview", &path);

        assert!(sink.accept(&frame(8, 8)));
        let first_len = std::fs::metadata(&path).unwrap().len();
        assert!(first_len > 0);

        // Overwrites in place, never accumulates
        assert!(sink.accept(&frame(8, 8)));
        assert!(path.exists());
        assert!(!path.with_extension("jpg.tmp").exists());
    }

    #[test]
    fn test_preview_rejects_short_buffer() {
        let dir = tempdir().unwrap();
        let mut sink = PreviewSink::new("preview", dir.path().join("p.jpg"));
        let bad = Frame {
            data: vec![0; 10],
            width: 100,
            height: 100,
            timestamp_ms: 0.0,
        };
        assert!(!sink.accept(&bad));
    }
}
