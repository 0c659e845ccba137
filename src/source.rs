// src/source.rs
//
// Seams to the two upstream collaborators the engine does not own: the
// capture source producing raw frames and the tracker producing identified
// detections. Production capture rides an external ffmpeg decoding any URL
// to rawvideo on stdout; offline runs and tests replay detections from a
// JSONL file.

use crate::types::{Frame, TrackedObject};
use anyhow::Result;
use chrono::Utc;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use std::process::{Child, ChildStdout, Command, Stdio};
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
    #[error("capture process has no stdout pipe")]
    MissingPipe,
    #[error("capture read failed: {0}")]
    Io(#[from] std::io::Error),
}

/// A capture source. `read_frame` returns `Ok(None)` when the stream ends
/// cleanly; the caller decides whether to reopen.
pub trait FrameSource: Send {
    fn read_frame(&mut self) -> Result<Option<Frame>, SourceError>;
}

/// Decodes any ffmpeg-readable URL (rtsp, http, file) to fixed-geometry
/// bgr24 frames on a child process stdout.
pub struct FfmpegSource {
    child: Child,
    stdout: ChildStdout,
    width: usize,
    height: usize,
}

impl FfmpegSource {
    pub fn open(url: &str, width: usize, height: usize) -> Result<Self, SourceError> {
        let scale_arg = format!("scale={}:{}", width, height);
        let mut cmd = Command::new("ffmpeg");
        cmd.arg("-hide_banner")
            .arg("-loglevel")
            .arg("error")
            .arg("-i")
            .arg(url)
            .arg("-vf")
            .arg(&scale_arg)
            .arg("-pix_fmt")
            .arg("bgr24")
            .arg("-f")
            .arg("rawvideo")
            .arg("-");

        info!("opening capture source: {}", url);
        Self::from_command(cmd, width, height)
    }

    /// Spawn an arbitrary command emitting raw bgr24 frames on stdout.
    pub fn from_command(mut cmd: Command, width: usize, height: usize) -> Result<Self, SourceError> {
        let program = cmd.get_program().to_string_lossy().into_owned();
        let mut child = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|source| SourceError::Spawn { program, source })?;

        let stdout = child.stdout.take().ok_or(SourceError::MissingPipe)?;

        Ok(Self {
            child,
            stdout,
            width,
            height,
        })
    }
}

impl FrameSource for FfmpegSource {
    fn read_frame(&mut self) -> Result<Option<Frame>, SourceError> {
        let mut data = vec![0u8; self.width * self.height * 3];
        match self.stdout.read_exact(&mut data) {
            Ok(()) => Ok(Some(Frame {
                data,
                width: self.width,
                height: self.height,
                timestamp_ms: Utc::now().timestamp_millis() as f64,
            })),
            // A clean stream end surfaces as a short read at a frame edge.
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(None),
            Err(e) => Err(SourceError::Io(e)),
        }
    }
}

impl Drop for FfmpegSource {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Produces identified detections for one frame. Track ids must be stable
/// while the object stays visible; that contract is the upstream model's.
pub trait Tracker: Send {
    fn track(&mut self, frame: &Frame) -> Result<Vec<TrackedObject>>;
}

/// Tracker for channels that only capture, preview, record or stream.
pub struct EmptyTracker;

impl Tracker for EmptyTracker {
    fn track(&mut self, _frame: &Frame) -> Result<Vec<TrackedObject>> {
        Ok(Vec::new())
    }
}

/// Replays recorded detections, one JSON array per sampled frame. Used for
/// offline runs and tests; returns empty sets once the file is exhausted.
pub struct JsonlTracker {
    lines: std::io::Lines<BufReader<File>>,
}

impl JsonlTracker {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        Ok(Self {
            lines: BufReader::new(file).lines(),
        })
    }
}

impl Tracker for JsonlTracker {
    fn track(&mut self, _frame: &Frame) -> Result<Vec<TrackedObject>> {
        match self.lines.next() {
            Some(line) => Ok(serde_json::from_str(&line?)?),
            None => Ok(Vec::new()),
        }
    }
}
