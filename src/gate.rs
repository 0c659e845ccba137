// src/gate.rs

use crate::geometry::{Point, Segment};
use crate::types::GateConfig;
use anyhow::{bail, Result};
use serde::Serialize;
use std::collections::HashMap;

/// A named set of tripwire segments with running directional counts.
///
/// Geometry is fixed at construction; counts only ever go up and are
/// mutated exclusively by the crossing engine.
#[derive(Debug, Clone)]
pub struct Gate {
    pub name: String,
    pub tags: HashMap<String, String>,
    segments: Vec<Segment>,
    in_count: u64,
    out_count: u64,
}

impl Gate {
    pub fn from_config(config: &GateConfig) -> Result<Self> {
        if config.lines.is_empty() {
            bail!("gate '{}' has no tripwire lines", config.name);
        }
        if config.lines.len() % 4 != 0 {
            bail!(
                "gate '{}': lines length {} is not a multiple of 4",
                config.name,
                config.lines.len()
            );
        }

        let segments = config
            .lines
            .chunks_exact(4)
            .map(|c| Segment::new(Point::new(c[0], c[1]), Point::new(c[2], c[3])))
            .collect();

        Ok(Self {
            name: config.name.clone(),
            tags: config.tags.clone(),
            segments,
            in_count: 0,
            out_count: 0,
        })
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn in_count(&self) -> u64 {
        self.in_count
    }

    pub fn out_count(&self) -> u64 {
        self.out_count
    }

    pub(crate) fn count_in(&mut self) {
        self.in_count += 1;
    }

    pub(crate) fn count_out(&mut self) {
        self.out_count += 1;
    }

    pub fn snapshot(&self) -> GateSnapshot {
        GateSnapshot {
            name: self.name.clone(),
            segments: self.segments.clone(),
            in_count: self.in_count,
            out_count: self.out_count,
        }
    }
}

/// Read-only view of a gate for rendering and telemetry. The engine thread
/// owns the live counters; everyone else sees copies.
#[derive(Debug, Clone, Serialize)]
pub struct GateSnapshot {
    pub name: String,
    pub segments: Vec<Segment>,
    pub in_count: u64,
    pub out_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate_config(lines: Vec<f32>) -> GateConfig {
        GateConfig {
            name: "door".to_string(),
            tags: HashMap::new(),
            lines,
        }
    }

    #[test]
    fn test_lines_parsed_as_four_tuples() {
        let gate =
            Gate::from_config(&gate_config(vec![0.0, 0.0, 0.0, 100.0, 50.0, 0.0, 50.0, 100.0]))
                .unwrap();
        assert_eq!(gate.segments().len(), 2);
        assert_eq!(gate.segments()[1].a, Point::new(50.0, 0.0));
    }

    #[test]
    fn test_partial_tuple_rejected() {
        assert!(Gate::from_config(&gate_config(vec![0.0, 0.0, 0.0])).is_err());
        assert!(Gate::from_config(&gate_config(vec![])).is_err());
    }

    #[test]
    fn test_counts_start_at_zero() {
        let mut gate = Gate::from_config(&gate_config(vec![0.0, 0.0, 0.0, 100.0])).unwrap();
        assert_eq!((gate.in_count(), gate.out_count()), (0, 0));
        gate.count_in();
        gate.count_in();
        gate.count_out();
        let snap = gate.snapshot();
        assert_eq!((snap.in_count, snap.out_count), (2, 1));
    }
}
