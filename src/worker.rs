// src/worker.rs
//
// Slave mode: one channel end to end. Opens the capture source, samples
// frames, runs the tracker and the crossing engine on the engine thread,
// and fans every frame out to the preview/record/stream consumers. The
// capture session is wrapped in a retry loop so a dropped source comes
// back on its own; gate counters survive the reconnect.

use crate::engine::GateCrossingEngine;
use crate::metrics::{DataLog, MetricsSink, NullSink};
use crate::pipeline::{FrameSink, PreviewSink, QueuePolicy, RecordSink, SinkWorker};
use crate::source::{EmptyTracker, FfmpegSource, FrameSource, JsonlTracker, Tracker};
use crate::stream::StreamSinkManager;
use crate::types::{Config, Frame, TrackedObject};
use anyhow::Result;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Pause before reopening a capture source that ended or failed.
const REOPEN_DELAY: Duration = Duration::from_secs(3);

/// Run one channel until `stop` is raised.
pub fn run(config: &Config, stop: &AtomicBool) -> Result<()> {
    info!("📹 worker '{}' starting ({})", config.name, config.source);

    let metrics: Box<dyn MetricsSink> = match &config.datalog {
        Some(dl) => Box::new(DataLog::open(Path::new(&dl.path), &dl.measurement)?),
        None => Box::new(NullSink),
    };

    let sample_fps = (config.fps / config.frame_skip.max(1) as f64).round().max(1.0) as u32;
    let mut engine = GateCrossingEngine::new(
        &config.gates,
        sample_fps,
        config.counting_scope,
        metrics,
    )?;

    let mut fanout = Fanout::build(config);

    loop {
        match open_session(config) {
            Ok((mut source, mut tracker)) => {
                let result = run_session(
                    &mut engine,
                    source.as_mut(),
                    tracker.as_mut(),
                    &fanout,
                    config,
                    stop,
                );
                match result {
                    Ok(frames) => info!(
                        "worker '{}': capture session ended after {} frames",
                        config.name, frames
                    ),
                    Err(e) => warn!("worker '{}': session failed: {:#}", config.name, e),
                }
            }
            Err(e) => warn!("worker '{}': cannot open source: {:#}", config.name, e),
        }

        if stop.load(Ordering::Relaxed) {
            break;
        }
        info!("worker '{}': reopening source in {:?}", config.name, REOPEN_DELAY);
        sleep_unless(REOPEN_DELAY, stop);
        if stop.load(Ordering::Relaxed) {
            break;
        }
    }

    fanout.stop();
    let snapshot = engine.snapshot();
    info!(
        "worker '{}' stopped (in: {}, out: {})",
        config.name,
        snapshot.total_in(),
        snapshot.total_out()
    );
    Ok(())
}

fn open_session(config: &Config) -> Result<(Box<dyn FrameSource>, Box<dyn Tracker>)> {
    let source = FfmpegSource::open(&config.source, config.width, config.height)?;
    let tracker: Box<dyn Tracker> = match &config.tracks {
        Some(path) => Box::new(JsonlTracker::open(path)?),
        None => Box::new(EmptyTracker),
    };
    Ok((Box::new(source), tracker))
}

/// One capture session: read frames until the source ends, `stop` is raised
/// or a read fails. Returns how many frames were read.
fn run_session(
    engine: &mut GateCrossingEngine,
    source: &mut dyn FrameSource,
    tracker: &mut dyn Tracker,
    fanout: &Fanout,
    config: &Config,
    stop: &AtomicBool,
) -> Result<u64> {
    let sample_interval = config.frame_skip.max(1) as u64;
    let mut frames: u64 = 0;
    let mut last_report = Instant::now();

    while !stop.load(Ordering::Relaxed) {
        let Some(frame) = source.read_frame()? else {
            break;
        };

        if frames % sample_interval == 0 {
            let region = crop_region(&frame, config.target);
            let sampled = match region {
                Some((x1, y1, x2, y2)) => crop(&frame, x1, y1, x2, y2),
                None => frame.clone(),
            };

            match tracker.track(&sampled) {
                Ok(mut detections) => {
                    if let Some((x1, y1, _, _)) = region {
                        offset_detections(&mut detections, x1 as f32, y1 as f32);
                    }
                    engine.process_frame(&detections);
                }
                // One bad tracker result never ends the session.
                Err(e) => warn!("worker '{}': tracker failed: {:#}", config.name, e),
            }

            if config.debug && last_report.elapsed() >= Duration::from_secs(10) {
                let s = engine.snapshot();
                debug!(
                    "worker '{}': in {} out {} pending {}/{} tracks {}",
                    config.name, s.total_in(), s.total_out(), s.pending_in, s.pending_out, s.active_tracks
                );
                last_report = Instant::now();
            }

            // Consumers run at the sampled rate: recordings keep real-time
            // pacing and stream bandwidth is not inflated by skipped frames.
            fanout.offer(frame);
        }
        frames += 1;
    }

    Ok(frames)
}

/// Clamped crop region, or `None` when no target is configured or the
/// region is empty after clamping.
fn crop_region(frame: &Frame, target: Option<[i32; 4]>) -> Option<(usize, usize, usize, usize)> {
    let [x1, y1, x2, y2] = target?;
    let x1 = x1.clamp(0, frame.width as i32) as usize;
    let y1 = y1.clamp(0, frame.height as i32) as usize;
    let x2 = x2.clamp(0, frame.width as i32) as usize;
    let y2 = y2.clamp(0, frame.height as i32) as usize;
    if x2 <= x1 || y2 <= y1 {
        return None;
    }
    Some((x1, y1, x2, y2))
}

/// Copy a bgr24 sub-rectangle out of a frame.
fn crop(frame: &Frame, x1: usize, y1: usize, x2: usize, y2: usize) -> Frame {
    let width = x2 - x1;
    let height = y2 - y1;
    let mut data = Vec::with_capacity(width * height * 3);
    for row in y1..y2 {
        let start = (row * frame.width + x1) * 3;
        data.extend_from_slice(&frame.data[start..start + width * 3]);
    }
    Frame {
        data,
        width,
        height,
        timestamp_ms: frame.timestamp_ms,
    }
}

/// Detections from a cropped region back into full-frame coordinates.
fn offset_detections(detections: &mut [TrackedObject], dx: f32, dy: f32) {
    for det in detections {
        let (x1, y1, x2, y2) = det.bbox;
        det.bbox = (x1 + dx, y1 + dy, x2 + dx, y2 + dy);
    }
}

/// The per-channel frame consumers. Preview and record ride Blocking
/// queues; the stream manager drops when behind.
struct Fanout {
    workers: Vec<SinkWorker>,
    stream: Option<StreamSinkManager>,
}

impl Fanout {
    fn build(config: &Config) -> Self {
        let mut workers = Vec::new();

        if let Some(path) = &config.preview_path {
            let sink: Box<dyn FrameSink> = Box::new(PreviewSink::new(&config.name, path));
            workers.push(SinkWorker::spawn(
                "preview",
                config.queue_capacity,
                QueuePolicy::Blocking,
                sink,
            ));
        }

        if let Some(path) = &config.record_path {
            match RecordSink::create(&config.name, path) {
                Ok(sink) => workers.push(SinkWorker::spawn(
                    "record",
                    config.queue_capacity,
                    QueuePolicy::Blocking,
                    Box::new(sink),
                )),
                Err(e) => warn!("worker '{}': cannot open recording: {:#}", config.name, e),
            }
        }

        let stream = config
            .stream
            .as_ref()
            .map(|sc| StreamSinkManager::start(&config.name, sc, config.queue_capacity));

        Self { workers, stream }
    }

    fn offer(&self, frame: Frame) {
        for (i, worker) in self.workers.iter().enumerate() {
            // Last consumer takes the frame by value.
            if i + 1 == self.workers.len() && self.stream.is_none() {
                worker.offer(frame);
                return;
            }
            worker.offer(frame.clone());
        }
        if let Some(stream) = &self.stream {
            stream.offer(frame);
        }
    }

    fn stop(&mut self) {
        for worker in &mut self.workers {
            worker.stop();
        }
        if let Some(stream) = &mut self.stream {
            stream.stop();
        }
    }
}

fn sleep_unless(total: Duration, stop: &AtomicBool) {
    let deadline = Instant::now() + total;
    while Instant::now() < deadline && !stop.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_millis(10));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CountingScope, GateConfig};
    use std::collections::HashMap;
    use std::io::Write;
    use std::process::Command;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    struct CountingSink(Arc<AtomicUsize>);

    impl FrameSink for CountingSink {
        fn name(&self) -> &str {
            "count"
        }
        fn accept(&mut self, _frame: &Frame) -> bool {
            self.0.fetch_add(1, Ordering::SeqCst);
            true
        }
    }

    fn frame(width: usize, height: usize) -> Frame {
        Frame {
            data: vec![0; width * height * 3],
            width,
            height,
            timestamp_ms: 0.0,
        }
    }

    fn test_config(tracks: Option<String>) -> Config {
        Config {
            name: "test".to_string(),
            source: "unused".to_string(),
            width: 4,
            height: 4,
            fps: 2.0,
            frame_skip: 1,
            tracks,
            target: None,
            gates: vec![GateConfig {
                name: "door".to_string(),
                tags: HashMap::new(),
                lines: vec![5.0, 0.0, 5.0, 10.0],
            }],
            queue_capacity: 10,
            counting_scope: CountingScope::Shared,
            preview_path: None,
            record_path: None,
            stream: None,
            datalog: None,
            debug: false,
        }
    }

    fn engine_for(config: &Config) -> GateCrossingEngine {
        let sample_fps = (config.fps / config.frame_skip as f64).round() as u32;
        GateCrossingEngine::new(
            &config.gates,
            sample_fps,
            config.counting_scope,
            Box::new(NullSink),
        )
        .unwrap()
    }

    /// A shell source emitting `frames` zero-filled 4x4 bgr24 frames.
    fn zero_source(frames: usize) -> Box<dyn FrameSource> {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(format!("head -c {} /dev/zero", frames * 48));
        Box::new(FfmpegSource::from_command(cmd, 4, 4).unwrap())
    }

    #[test]
    fn test_session_counts_replayed_crossing() {
        let dir = tempfile::tempdir().unwrap();
        let tracks = dir.path().join("tracks.jsonl");
        let mut f = std::fs::File::create(&tracks).unwrap();
        // Anchor moves 3 -> 7 across the vertical line at x=5, then the
        // track goes missing long enough to finalize (threshold 4*2 frames).
        writeln!(f, r#"[{{"id": 9, "bbox": [2.0, 1.0, 4.0, 3.0]}}]"#).unwrap();
        writeln!(f, r#"[{{"id": 9, "bbox": [6.0, 1.0, 8.0, 3.0]}}]"#).unwrap();
        drop(f);

        let config = test_config(Some(tracks.display().to_string()));
        let mut engine = engine_for(&config);
        let mut tracker = JsonlTracker::open(&tracks).unwrap();
        let fanout = Fanout {
            workers: Vec::new(),
            stream: None,
        };
        let stop = AtomicBool::new(false);

        let mut source = zero_source(12);
        let frames = run_session(
            &mut engine,
            source.as_mut(),
            &mut tracker,
            &fanout,
            &config,
            &stop,
        )
        .unwrap();

        assert_eq!(frames, 12);
        let snapshot = engine.snapshot();
        assert_eq!(snapshot.total_in(), 1);
        assert_eq!(snapshot.total_out(), 0);
        assert_eq!(snapshot.active_tracks, 0, "stale track finalized");
    }

    #[test]
    fn test_frame_skip_decimates_sampling() {
        // Detections on replay lines 1 and 2; with frame_skip 3 only frames
        // 0, 3, 6, 9 are sampled, so both lines are consumed anyway and the
        // crossing still lands.
        let dir = tempfile::tempdir().unwrap();
        let tracks = dir.path().join("tracks.jsonl");
        let mut f = std::fs::File::create(&tracks).unwrap();
        writeln!(f, r#"[{{"id": 3, "bbox": [2.0, 1.0, 4.0, 3.0]}}]"#).unwrap();
        writeln!(f, r#"[{{"id": 3, "bbox": [6.0, 1.0, 8.0, 3.0]}}]"#).unwrap();
        drop(f);

        let mut config = test_config(Some(tracks.display().to_string()));
        config.frame_skip = 3;
        let mut engine = engine_for(&config);
        let mut tracker = JsonlTracker::open(&tracks).unwrap();
        let fanout = Fanout {
            workers: Vec::new(),
            stream: None,
        };
        let stop = AtomicBool::new(false);

        // 30 frames -> 10 sampled; sample fps 1 makes the stale threshold 4.
        let mut source = zero_source(30);
        run_session(
            &mut engine,
            source.as_mut(),
            &mut tracker,
            &fanout,
            &config,
            &stop,
        )
        .unwrap();

        assert_eq!(engine.snapshot().total_in(), 1);
    }

    #[test]
    fn test_fanout_receives_frames_at_sampled_rate() {
        let mut config = test_config(None);
        config.frame_skip = 3;
        let mut engine = engine_for(&config);
        let mut tracker = EmptyTracker;

        let seen = Arc::new(AtomicUsize::new(0));
        let mut fanout = Fanout {
            workers: vec![SinkWorker::spawn(
                "count",
                config.queue_capacity,
                QueuePolicy::Blocking,
                Box::new(CountingSink(seen.clone())),
            )],
            stream: None,
        };
        let stop = AtomicBool::new(false);

        // 30 source frames with frame_skip 3: frames 0, 3, ..., 27 sampled.
        let mut source = zero_source(30);
        let frames = run_session(
            &mut engine,
            source.as_mut(),
            &mut tracker,
            &fanout,
            &config,
            &stop,
        )
        .unwrap();
        fanout.stop(); // drains the queue and joins the consumer

        assert_eq!(frames, 30);
        assert_eq!(
            seen.load(Ordering::SeqCst),
            10,
            "sinks must see frames at the sampled rate"
        );
    }

    #[test]
    fn test_crop_region_clamps_and_rejects_empty() {
        let f = frame(10, 10);
        assert_eq!(crop_region(&f, None), None);
        assert_eq!(crop_region(&f, Some([-5, 2, 50, 8])), Some((0, 2, 10, 8)));
        assert_eq!(crop_region(&f, Some([6, 2, 6, 8])), None, "zero width");
    }

    #[test]
    fn test_crop_extracts_subrectangle() {
        let mut f = frame(4, 2);
        // Mark pixel (2, 1)
        let idx = (1 * 4 + 2) * 3;
        f.data[idx] = 0xAB;

        let cropped = crop(&f, 2, 1, 4, 2);
        assert_eq!(cropped.width, 2);
        assert_eq!(cropped.height, 1);
        assert_eq!(cropped.data.len(), 6);
        assert_eq!(cropped.data[0], 0xAB);
    }

    #[test]
    fn test_offset_detections_restores_frame_coordinates() {
        let mut dets = vec![TrackedObject {
            id: 1,
            bbox: (10.0, 20.0, 30.0, 40.0),
        }];
        offset_detections(&mut dets, 100.0, 200.0);
        assert_eq!(dets[0].bbox, (110.0, 220.0, 130.0, 240.0));
    }
}
