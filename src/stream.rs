// src/stream.rs
//
// Live egress. Frames are piped as raw bytes into an external encoder
// process (normally ffmpeg reading rawvideo on stdin). The encoder is a
// separate OS process so a codec crash never takes the worker down; when a
// write fails the manager discards everything stale in its queue, reaps the
// dead child and launches a fresh one.

use crate::pipeline::queue::{FrameQueue, FrameReceiver, Poll, QueuePolicy};
use crate::types::{Frame, StreamConfig};
use anyhow::{Context, Result};
use std::io::Write;
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{info, warn};

/// Pause between killing a failed encoder and accepting the frame that will
/// trigger the next launch.
const RELAUNCH_DELAY: Duration = Duration::from_millis(200);

/// Owns the dropping queue and the consumer thread that feeds the encoder.
///
/// `offer` never blocks: live egress prefers staying current over
/// completeness, so a full queue simply discards the frame.
pub struct StreamSinkManager {
    queue: FrameQueue,
    restarts: Arc<AtomicU64>,
    handle: Option<JoinHandle<()>>,
}

impl StreamSinkManager {
    pub fn start(name: &str, config: &StreamConfig, capacity: usize) -> Self {
        let (queue, rx) = FrameQueue::new(capacity, QueuePolicy::Dropping);
        let restarts = Arc::new(AtomicU64::new(0));

        let channel = name.to_string();
        let program = config.program.clone();
        let args = config.args.clone();
        let counter = restarts.clone();
        let thread_name = format!("stream-{}", name);

        let handle = std::thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || run_stream(&channel, &program, &args, rx, counter))
            .unwrap_or_else(|e| panic!("failed to spawn {}: {}", thread_name, e));

        Self {
            queue,
            restarts,
            handle: Some(handle),
        }
    }

    /// Offer a frame for streaming. Returns whether it was queued.
    pub fn offer(&self, frame: Frame) -> bool {
        self.queue.offer(frame)
    }

    /// How many times the encoder has been relaunched after a failure.
    pub fn restarts(&self) -> u64 {
        self.restarts.load(Ordering::Relaxed)
    }

    /// Stop the consumer thread and the encoder process.
    pub fn stop(&mut self) {
        let (orphan, _rx) = FrameQueue::new(1, QueuePolicy::Dropping);
        let _ = std::mem::replace(&mut self.queue, orphan);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for StreamSinkManager {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.stop();
        }
    }
}

fn run_stream(
    channel: &str,
    program: &str,
    args: &[String],
    rx: FrameReceiver,
    restarts: Arc<AtomicU64>,
) {
    info!("stream '{}' started ({})", channel, program);
    let mut encoder: Option<Encoder> = None;

    loop {
        match rx.poll() {
            Poll::Frame(frame) => {
                if encoder.is_none() {
                    match Encoder::launch(program, args) {
                        Ok(enc) => encoder = Some(enc),
                        Err(err) => {
                            warn!("stream '{}': encoder launch failed: {:#}", channel, err);
                            std::thread::sleep(RELAUNCH_DELAY);
                            continue;
                        }
                    }
                }

                // The encoder was just ensured above.
                let enc = encoder.as_mut().unwrap();
                if let Err(err) = enc.write_frame(&frame) {
                    let stale = rx.clear();
                    warn!(
                        "stream '{}': encoder write failed ({}), dropped {} stale frames, relaunching",
                        channel, err, stale
                    );
                    if let Some(enc) = encoder.take() {
                        enc.shutdown();
                    }
                    restarts.fetch_add(1, Ordering::Relaxed);
                    std::thread::sleep(RELAUNCH_DELAY);
                }
            }
            Poll::Timeout => continue,
            Poll::Closed => break,
        }
    }

    if let Some(enc) = encoder.take() {
        enc.shutdown();
    }
    info!("stream '{}' stopped", channel);
}

/// One running encoder process with its stdin pipe.
struct Encoder {
    child: Child,
    stdin: ChildStdin,
}

impl Encoder {
    fn launch(program: &str, args: &[String]) -> Result<Self> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("failed to spawn encoder '{}'", program))?;

        let stdin = child
            .stdin
            .take()
            .context("encoder has no stdin pipe")?;

        Ok(Self { child, stdin })
    }

    fn write_frame(&mut self, frame: &Frame) -> std::io::Result<()> {
        self.stdin.write_all(&frame.data)?;
        self.stdin.flush()
    }

    fn shutdown(mut self) {
        // Closing stdin lets a healthy encoder flush and exit on its own.
        drop(self.stdin);
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}
