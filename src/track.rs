// src/track.rs
//
// Per-identity trajectory history and crossing hysteresis. Identities come
// from the upstream tracker and are only reused while it considers the
// object continuously present, so the store never tries to re-associate.

use crate::geometry::Point;
use crate::types::CountingScope;
use std::collections::{HashMap, VecDeque};

/// Net undecided crossing direction since the last transition. Repeated
/// same-direction touches collapse; an opposite-direction touch cancels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PendingDirection {
    #[default]
    None,
    InPending,
    OutPending,
}

impl PendingDirection {
    /// Transition on a tripwire touch. `forward` is the angle class:
    /// `true` for < 180 degrees.
    pub fn apply_touch(self, forward: bool) -> PendingDirection {
        match (self, forward) {
            (PendingDirection::None, true) => PendingDirection::InPending,
            (PendingDirection::None, false) => PendingDirection::OutPending,
            (PendingDirection::OutPending, true) => PendingDirection::None,
            (PendingDirection::InPending, true) => PendingDirection::InPending,
            (PendingDirection::InPending, false) => PendingDirection::None,
            (PendingDirection::OutPending, false) => PendingDirection::OutPending,
        }
    }
}

#[derive(Debug, Default)]
pub struct Track {
    /// Recent anchor points, most-recent-last, at most ~1s of samples.
    history: VecDeque<Point>,
    /// Frames since this identity last appeared.
    pub frames_since_seen: u32,
    /// Shared hysteresis slot (CountingScope::Shared).
    pub pending: PendingDirection,
    /// Index of the gate whose line most recently toggled the shared slot.
    /// Attribution only; the gate itself lives in the engine.
    pub last_gate: Option<usize>,
    /// Per-gate hysteresis slots (CountingScope::PerGate).
    pub pending_by_gate: HashMap<usize, PendingDirection>,
}

impl Track {
    pub fn last_point(&self) -> Option<Point> {
        self.history.back().copied()
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }
}

pub struct TrackStore {
    tracks: HashMap<i64, Track>,
    /// History capacity = sampling frame rate, about one second of samples.
    history_capacity: usize,
    scope: CountingScope,
}

impl TrackStore {
    pub fn new(history_capacity: usize, scope: CountingScope) -> Self {
        Self {
            tracks: HashMap::new(),
            history_capacity: history_capacity.max(1),
            scope,
        }
    }

    pub fn scope(&self) -> CountingScope {
        self.scope
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn get(&self, id: i64) -> Option<&Track> {
        self.tracks.get(&id)
    }

    /// Fetch or create the track for `id` and reset its staleness counter.
    pub fn touch(&mut self, id: i64) -> &mut Track {
        let track = self.tracks.entry(id).or_default();
        track.frames_since_seen = 0;
        track
    }

    /// Called once per processed frame, before positions are updated.
    pub fn age_all(&mut self) {
        for track in self.tracks.values_mut() {
            track.frames_since_seen += 1;
        }
    }

    /// Append `point` to the track's history, evicting the oldest sample
    /// once the window is full. The equal-point guard lives in the engine:
    /// a stationary anchor skips the crossing test but is still appended.
    pub fn record_position(&mut self, id: i64, point: Point) {
        if let Some(track) = self.tracks.get_mut(&id) {
            if track.history.len() >= self.history_capacity {
                track.history.pop_front();
            }
            track.history.push_back(point);
        }
    }

    /// Remove and return every track unseen for more than `threshold`
    /// frames. Each stale track is reported exactly once.
    pub fn evict_stale(&mut self, threshold: u32) -> Vec<(i64, Track)> {
        let stale: Vec<i64> = self
            .tracks
            .iter()
            .filter(|(_, t)| t.frames_since_seen > threshold)
            .map(|(id, _)| *id)
            .collect();

        stale
            .into_iter()
            .filter_map(|id| self.tracks.remove(&id).map(|t| (id, t)))
            .collect()
    }

    /// Tracks currently holding an undecided crossing, by direction.
    /// Feeds the "+N" pending overlay next to the committed counts.
    pub fn pending_totals(&self) -> (usize, usize) {
        let mut pending_in = 0;
        let mut pending_out = 0;
        for track in self.tracks.values() {
            let slots: Vec<PendingDirection> = match self.scope {
                CountingScope::Shared => vec![track.pending],
                CountingScope::PerGate => track.pending_by_gate.values().copied().collect(),
            };
            for slot in slots {
                match slot {
                    PendingDirection::InPending => pending_in += 1,
                    PendingDirection::OutPending => pending_out += 1,
                    PendingDirection::None => {}
                }
            }
        }
        (pending_in, pending_out)
    }
}
