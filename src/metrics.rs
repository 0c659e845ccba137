// src/metrics.rs
//
// Count-increment event sink. The engine pushes one event per finalized
// crossing and never waits for delivery; a writer thread drains an
// unbounded channel and appends time-series shaped JSONL records.

use crate::types::Direction;
use anyhow::Result;
use chrono::{DateTime, Utc};
use crossbeam_channel::{unbounded, Sender};
use serde::Serialize;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::thread::JoinHandle;
use tracing::{debug, warn};

/// One finalized crossing. Ephemeral: produced at track finalization,
/// consumed immediately by the sink.
#[derive(Debug, Clone, Serialize)]
pub struct CrossingEvent {
    pub gate: String,
    pub direction: Direction,
    /// Always 1; each event is a single count increment.
    pub count: u32,
    pub timestamp: DateTime<Utc>,
}

impl CrossingEvent {
    pub fn new(gate: &str, direction: Direction) -> Self {
        Self {
            gate: gate.to_string(),
            direction,
            count: 1,
            timestamp: Utc::now(),
        }
    }
}

/// Fire-and-forget delivery of crossing events.
pub trait MetricsSink: Send {
    fn push(&self, event: CrossingEvent);
}

/// Sink for disabled telemetry and tests.
pub struct NullSink;

impl MetricsSink for NullSink {
    fn push(&self, _event: CrossingEvent) {}
}

/// JSONL record mirroring the time-series point layout the backend expects:
/// a measurement, a count field, and channel/direction tags.
#[derive(Debug, Serialize)]
struct FlowRecord<'a> {
    measurement: &'a str,
    fields: FlowFields,
    tags: FlowTags<'a>,
    time: String,
}

#[derive(Debug, Serialize)]
struct FlowFields {
    count: u32,
}

#[derive(Debug, Serialize)]
struct FlowTags<'a> {
    ch: &'a str,
    direct: &'a str,
}

/// Appends crossing events to a JSONL file from a background thread.
pub struct DataLog {
    tx: Sender<CrossingEvent>,
    handle: Option<JoinHandle<()>>,
}

impl DataLog {
    pub fn open(path: &Path, measurement: &str) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;

        let (tx, rx) = unbounded::<CrossingEvent>();
        let measurement = measurement.to_string();

        let handle = std::thread::spawn(move || {
            for event in rx.iter() {
                let record = FlowRecord {
                    measurement: &measurement,
                    fields: FlowFields { count: event.count },
                    tags: FlowTags {
                        ch: &event.gate,
                        direct: event.direction.as_str(),
                    },
                    time: event.timestamp.to_rfc3339(),
                };
                match serde_json::to_string(&record) {
                    Ok(line) => {
                        if let Err(e) = writeln!(file, "{}", line).and_then(|_| file.flush()) {
                            warn!("datalog write failed: {}", e);
                        }
                    }
                    Err(e) => warn!("datalog serialize failed: {}", e),
                }
            }
            debug!("datalog writer exiting");
        });

        Ok(Self {
            tx,
            handle: Some(handle),
        })
    }
}

impl MetricsSink for DataLog {
    fn push(&self, event: CrossingEvent) {
        // Unbounded channel: never blocks the engine thread.
        let _ = self.tx.send(event);
    }
}

impl Drop for DataLog {
    fn drop(&mut self) {
        // Closing the sender lets the writer drain what is queued and exit.
        let (closed, _) = unbounded();
        self.tx = closed;
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
