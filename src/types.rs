use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Per-worker configuration, one JSON file per video channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Channel name, used as the `ch` tag on every crossing event.
    pub name: String,
    /// Capture source URL (rtsp/http/file path), handed to the frame source.
    pub source: String,
    /// Capture geometry; the decoder scales every source to this size.
    #[serde(default = "default_width")]
    pub width: usize,
    #[serde(default = "default_height")]
    pub height: usize,
    /// Native read rate of the source.
    #[serde(default = "default_fps")]
    pub fps: f64,
    #[serde(default = "default_frame_skip")]
    pub frame_skip: u32,
    /// Recorded detections to replay instead of a live tracker (one JSON
    /// array per sampled frame). Without it the worker counts nothing but
    /// still captures, previews, records and streams.
    #[serde(default)]
    pub tracks: Option<String>,
    /// Optional crop region `[x1, y1, x2, y2]` the tracker runs on.
    /// Detection boxes are translated back into full-frame coordinates.
    #[serde(default)]
    pub target: Option<[i32; 4]>,
    pub gates: Vec<GateConfig>,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default)]
    pub counting_scope: CountingScope,
    /// Where the display consumer writes its latest-frame JPEG preview.
    #[serde(default)]
    pub preview_path: Option<String>,
    /// Where the record consumer appends raw frame bytes.
    #[serde(default)]
    pub record_path: Option<String>,
    #[serde(default)]
    pub stream: Option<StreamConfig>,
    #[serde(default)]
    pub datalog: Option<DataLogConfig>,
    #[serde(default)]
    pub debug: bool,
}

fn default_width() -> usize {
    1280
}

fn default_height() -> usize {
    720
}

fn default_fps() -> f64 {
    25.0
}

fn default_frame_skip() -> u32 {
    1
}

fn default_queue_capacity() -> usize {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateConfig {
    pub name: String,
    #[serde(default)]
    pub tags: HashMap<String, String>,
    /// Flattened segment endpoints `[x1,y1,x2,y2, x1,y1,x2,y2, ...]`.
    pub lines: Vec<f32>,
}

/// How hysteresis state is attributed when a track touches several gates.
///
/// `Shared` keeps one pending slot per track (a second
/// gate's touch can cancel the first gate's pending crossing). `PerGate`
/// keeps an independent slot per (track, gate).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CountingScope {
    #[default]
    Shared,
    PerGate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Encoder executable, e.g. "ffmpeg".
    pub program: String,
    /// Arguments; frame geometry is known at config time, so the full
    /// command line is spelled out here.
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataLogConfig {
    /// JSONL output path for crossing events.
    pub path: String,
    #[serde(default = "default_measurement")]
    pub measurement: String,
}

fn default_measurement() -> String {
    "flow".to_string()
}

/// A raw video frame as produced by the capture source.
#[derive(Debug, Clone)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: usize,
    pub height: usize,
    pub timestamp_ms: f64,
}

/// One tracked detection from the upstream tracker: a stable identity plus
/// its bounding box in full-frame pixel coordinates.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TrackedObject {
    pub id: i64,
    /// `(x1, y1, x2, y2)`
    pub bbox: (f32, f32, f32, f32),
}

impl TrackedObject {
    /// Counting anchor: top-center of the box, so near-ground objects cross
    /// a tripwire at a visually intuitive point.
    pub fn anchor(&self) -> (f32, f32) {
        let (x1, y1, x2, _y2) = self.bbox;
        ((x1 + x2) / 2.0, y1)
    }

    /// Zero-width or zero-height boxes carry no usable geometry.
    pub fn is_degenerate(&self) -> bool {
        let (x1, y1, x2, y2) = self.bbox;
        x1 == x2 || y1 == y2
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    In,
    Out,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::In => "in",
            Self::Out => "out",
        }
    }
}
