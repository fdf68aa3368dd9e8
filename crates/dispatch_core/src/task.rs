//! Task: a pickup -> dropoff delivery job.
//!
//! Immutable once announced, with one exception: `winner` starts `None` and
//! is set exactly once, when the Dispatcher awards the auction (`spec.md` §3).

use serde::{Deserialize, Serialize};

/// Opaque road-graph node identifier.
pub type NodeId = i64;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub task_id: String,
    pub release_ts: f64,
    pub deadline_ts: f64,
    pub pickup_node: NodeId,
    pub dropoff_node: NodeId,
    pub pickup_latlon: (f64, f64),
    pub dropoff_latlon: (f64, f64),
    pub route_latlon: Vec<(f64, f64)>,
    pub distance_m: f64,
    pub size: u32,
    pub winner: Option<String>,
}

impl Task {
    /// The invariant every announced task must satisfy: a route with at least two
    /// waypoints and a finite, strictly positive distance. A task that cannot
    /// satisfy this is never announced (`spec.md` §3 invariant, §7 routing-infeasibility).
    pub fn has_usable_route(&self) -> bool {
        self.route_latlon.len() >= 2 && self.distance_m.is_finite() && self.distance_m > 0.0
    }
}
