// src/engine.rs
//
// Consumes one frame's worth of tracker output, drives the track store,
// and finalizes crossings into gate counts when tracks go stale.
//
// The engine is single-threaded by design: track state must be updated in
// strict per-frame order, so the hot path is never parallelized. Gate
// counters are owned here and exposed to other threads only as snapshots.

use crate::gate::{Gate, GateSnapshot};
use crate::geometry::{self, Point};
use crate::metrics::{CrossingEvent, MetricsSink};
use crate::track::{PendingDirection, TrackStore};
use crate::types::{CountingScope, Direction, GateConfig, TrackedObject};
use anyhow::Result;
use tracing::{debug, info};

/// Tracks unseen for longer than this many seconds (at the sampling rate)
/// are finalized.
const STALE_SECONDS: u32 = 4;

pub struct GateCrossingEngine {
    gates: Vec<Gate>,
    store: TrackStore,
    /// Sampling frame rate after frame-skip decimation, in frames/second.
    sample_fps: u32,
    metrics: Box<dyn MetricsSink>,
}

/// Counts and pending totals for overlays and progress logs.
#[derive(Debug, Clone)]
pub struct EngineSnapshot {
    pub gates: Vec<GateSnapshot>,
    pub pending_in: usize,
    pub pending_out: usize,
    pub active_tracks: usize,
}

impl EngineSnapshot {
    pub fn total_in(&self) -> u64 {
        self.gates.iter().map(|g| g.in_count).sum()
    }

    pub fn total_out(&self) -> u64 {
        self.gates.iter().map(|g| g.out_count).sum()
    }
}

impl GateCrossingEngine {
    pub fn new(
        gate_configs: &[GateConfig],
        sample_fps: u32,
        scope: CountingScope,
        metrics: Box<dyn MetricsSink>,
    ) -> Result<Self> {
        let gates = gate_configs
            .iter()
            .map(Gate::from_config)
            .collect::<Result<Vec<_>>>()?;
        let sample_fps = sample_fps.max(1);

        Ok(Self {
            gates,
            store: TrackStore::new(sample_fps as usize, scope),
            sample_fps,
            metrics,
        })
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        let (pending_in, pending_out) = self.store.pending_totals();
        EngineSnapshot {
            gates: self.gates.iter().map(Gate::snapshot).collect(),
            pending_in,
            pending_out,
            active_tracks: self.store.len(),
        }
    }

    /// Process one sampled frame of tracker output.
    ///
    /// A malformed detection never blocks the rest of the frame: degenerate
    /// boxes still refresh their track's staleness counter and are skipped
    /// only for geometry.
    pub fn process_frame(&mut self, detections: &[TrackedObject]) {
        self.store.age_all();

        for det in detections {
            self.process_detection(det);
        }

        self.finalize_stale();
    }

    fn process_detection(&mut self, det: &TrackedObject) {
        let degenerate = det.is_degenerate();
        let (cx, cy) = det.anchor();
        let center = Point::new(cx, cy);

        let track = self.store.touch(det.id);
        if degenerate {
            debug!("track {}: degenerate box, geometry skipped", det.id);
            return;
        }
        let last = track.last_point();

        // Equal-point guard: no movement means no crossing test, but the
        // sample still lands in the history below.
        if let Some(last) = last {
            if last != center {
                self.test_crossings(det.id, last, center);
            }
        }

        self.store.record_position(det.id, center);
    }

    /// Test one movement step against every line of every gate. No early
    /// exit: a single step can legitimately cross several tripwires.
    fn test_crossings(&mut self, id: i64, last: Point, center: Point) {
        let scope = self.store.scope();
        for (gate_idx, gate) in self.gates.iter().enumerate() {
            for line in gate.segments() {
                let (angle, intersected) = geometry::crossing_angle(last, center, *line);
                if !intersected {
                    continue;
                }
                let Some(angle) = angle else {
                    // Degenerate geometry: no angle, no crossing.
                    continue;
                };
                let forward = angle < 180.0;

                let track = self.store.touch(id);
                match scope {
                    CountingScope::Shared => {
                        track.pending = track.pending.apply_touch(forward);
                        track.last_gate = Some(gate_idx);
                    }
                    CountingScope::PerGate => {
                        let slot = track.pending_by_gate.entry(gate_idx).or_default();
                        *slot = slot.apply_touch(forward);
                    }
                }

                debug!(
                    "track {} touched '{}' at {:.1} deg ({})",
                    id,
                    gate.name,
                    angle,
                    if forward { "forward" } else { "reverse" }
                );
            }
        }
    }

    /// Evict tracks past the staleness threshold and convert any undecided
    /// direction into a permanent count. Tracks with nothing pending leave
    /// silently.
    fn finalize_stale(&mut self) {
        let threshold = self.sample_fps * STALE_SECONDS;

        for (id, track) in self.store.evict_stale(threshold) {
            let resolved: Vec<(usize, PendingDirection)> = match self.store.scope() {
                CountingScope::Shared => match (track.last_gate, track.pending) {
                    (Some(gate_idx), pending) if pending != PendingDirection::None => {
                        vec![(gate_idx, pending)]
                    }
                    _ => Vec::new(),
                },
                CountingScope::PerGate => track
                    .pending_by_gate
                    .iter()
                    .filter(|(_, p)| **p != PendingDirection::None)
                    .map(|(g, p)| (*g, *p))
                    .collect(),
            };

            for (gate_idx, pending) in resolved {
                let Some(gate) = self.gates.get_mut(gate_idx) else {
                    continue;
                };
                let direction = match pending {
                    PendingDirection::InPending => {
                        gate.count_in();
                        Direction::In
                    }
                    PendingDirection::OutPending => {
                        gate.count_out();
                        Direction::Out
                    }
                    PendingDirection::None => continue,
                };

                info!(
                    "track {} finalized: {} {} (in={} out={})",
                    id,
                    gate.name,
                    direction.as_str(),
                    gate.in_count(),
                    gate.out_count()
                );
                self.metrics.push(CrossingEvent::new(&gate.name, direction));
            }
        }
    }
}
