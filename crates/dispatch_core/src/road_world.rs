//! RoadWorld: routable road-graph geometry for task generation and execution replay.
//!
//! Ground truth is a node/edge graph (`x`=lon, `y`=lat per node; `length` in
//! meters per directed edge), matching the OSMnx-derived graphml the original
//! loads. Rather than parsing graphml directly, [`RoadWorld::from_graph`]
//! takes the already-decoded node/edge lists — a graphml/osmnx reader is
//! outside this crate's concern (`spec.md` §1 scopes out map acquisition).

use std::collections::HashMap;
#[cfg(test)]
use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::Mutex;

use bevy_ecs::prelude::Resource;
use lru::LruCache;
use pathfinding::directed::dijkstra::dijkstra;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;
use thiserror::Error;

use crate::task::NodeId;

#[derive(Debug, Clone, Copy)]
pub struct NodePos {
    pub lat: f64,
    pub lon: f64,
}

#[derive(Debug, Clone)]
pub struct GraphNode {
    pub id: NodeId,
    pub pos: NodePos,
}

#[derive(Debug, Clone)]
pub struct GraphEdge {
    pub u: NodeId,
    pub v: NodeId,
    /// Edge length in meters. `None` means "missing" — substituted with the
    /// haversine distance between endpoints at load time.
    pub length_m: Option<f64>,
}

#[derive(Debug, Error)]
pub enum RoadWorldError {
    #[error("road graph has no nodes")]
    EmptyGraph,
    #[error("edge references unknown node {0}")]
    UnknownNode(NodeId),
    #[error("could not find a routable (pickup, dropoff) pair after exhausting sample retries")]
    NoRoutablePair,
    #[error("failed to read road graph file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse road graph file: {0}")]
    Parse(#[from] serde_json::Error),
}

/// On-disk road graph format: a plain JSON document of decoded nodes/edges,
/// the loadable shape a graphml/osmnx export would be converted into upstream
/// of this crate (`spec.md` §1 scopes the conversion itself out).
#[derive(Debug, Deserialize)]
struct GraphFile {
    nodes: Vec<RawNode>,
    edges: Vec<RawEdge>,
}

#[derive(Debug, Deserialize)]
struct RawNode {
    id: NodeId,
    lat: f64,
    lon: f64,
}

#[derive(Debug, Deserialize)]
struct RawEdge {
    u: NodeId,
    v: NodeId,
    #[serde(default)]
    length_m: Option<f64>,
}

const EARTH_RADIUS_M: f64 = 6_371_000.0;

fn haversine_m(a: NodePos, b: NodePos) -> f64 {
    let (lat1, lat2) = (a.lat.to_radians(), b.lat.to_radians());
    let dlat = lat2 - lat1;
    let dlon = (b.lon - a.lon).to_radians();
    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * h.sqrt().min(1.0).asin()
}

/// A directed adjacency edge with integer-millimeter weight (pathfinding's
/// dijkstra requires an integer `Weight`); meters are scaled by 1000 and
/// rounded, which is far below any GPS/graph precision we'd lose to.
#[derive(Debug, Clone, Copy)]
struct Adj {
    to: NodeId,
    weight_mm: u64,
}

fn to_weight(meters: f64) -> u64 {
    (meters.max(0.0) * 1000.0).round() as u64
}

fn from_weight(mm: u64) -> f64 {
    mm as f64 / 1000.0
}

type PathCache = Mutex<LruCache<(NodeId, NodeId), Option<Vec<NodeId>>>>;

/// Routable road graph plus the undirected fallback view.
#[derive(Resource)]
pub struct RoadWorld {
    nodes: HashMap<NodeId, NodePos>,
    node_ids: Vec<NodeId>,
    directed: HashMap<NodeId, Vec<Adj>>,
    undirected: HashMap<NodeId, Vec<Adj>>,
    seed: u64,
    rng: Mutex<StdRng>,
    max_sample_tries: usize,
    path_cache: PathCache,
}

impl RoadWorld {
    /// Builds a RoadWorld from decoded nodes/edges. Missing/non-finite edge
    /// lengths are replaced by the haversine distance between endpoints
    /// (`spec.md` §4.1 Construction).
    pub fn from_graph(
        nodes: Vec<GraphNode>,
        edges: Vec<GraphEdge>,
        seed: u64,
    ) -> Result<Self, RoadWorldError> {
        if nodes.is_empty() {
            return Err(RoadWorldError::EmptyGraph);
        }

        let mut node_map = HashMap::with_capacity(nodes.len());
        let mut node_ids = Vec::with_capacity(nodes.len());
        for n in &nodes {
            node_map.insert(n.id, n.pos);
            node_ids.push(n.id);
        }

        let mut directed: HashMap<NodeId, Vec<Adj>> = HashMap::new();
        let mut undirected: HashMap<NodeId, Vec<Adj>> = HashMap::new();

        for e in &edges {
            let pu = *node_map
                .get(&e.u)
                .ok_or(RoadWorldError::UnknownNode(e.u))?;
            let pv = *node_map
                .get(&e.v)
                .ok_or(RoadWorldError::UnknownNode(e.v))?;

            let length_m = match e.length_m {
                Some(l) if l.is_finite() && l > 0.0 => l,
                _ => haversine_m(pu, pv),
            };
            let weight = to_weight(length_m);

            directed.entry(e.u).or_default().push(Adj { to: e.v, weight_mm: weight });
            undirected.entry(e.u).or_default().push(Adj { to: e.v, weight_mm: weight });
            undirected.entry(e.v).or_default().push(Adj { to: e.u, weight_mm: weight });
        }

        Ok(Self {
            nodes: node_map,
            node_ids,
            directed,
            undirected,
            seed,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            max_sample_tries: 80,
            path_cache: Mutex::new(LruCache::new(NonZeroUsize::new(4096).unwrap())),
        })
    }

    /// Loads a road graph from a JSON file of decoded nodes/edges (see
    /// [`GraphFile`]). This is the CLI-facing counterpart to
    /// [`RoadWorld::from_graph`] for callers driving a run from disk.
    pub fn load(path: impl AsRef<Path>, seed: u64) -> Result<Self, RoadWorldError> {
        let contents = std::fs::read_to_string(path)?;
        let file: GraphFile = serde_json::from_str(&contents)?;

        let nodes = file
            .nodes
            .into_iter()
            .map(|n| GraphNode { id: n.id, pos: NodePos { lat: n.lat, lon: n.lon } })
            .collect();
        let edges = file
            .edges
            .into_iter()
            .map(|e| GraphEdge { u: e.u, v: e.v, length_m: e.length_m })
            .collect();

        Self::from_graph(nodes, edges, seed)
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn node_latlon(&self, node: NodeId) -> Option<(f64, f64)> {
        self.nodes.get(&node).map(|p| (p.lat, p.lon))
    }

    /// Nearest node by planar distance in (lon, lat), matching the original's
    /// `ox.distance.nearest_nodes` behavior at city scale.
    pub fn nearest_node(&self, lat: f64, lon: f64) -> Option<NodeId> {
        self.node_ids
            .iter()
            .copied()
            .min_by(|&a, &b| {
                let pa = self.nodes[&a];
                let pb = self.nodes[&b];
                let da = (pa.lon - lon).powi(2) + (pa.lat - lat).powi(2);
                let db = (pb.lon - lon).powi(2) + (pb.lat - lat).powi(2);
                da.partial_cmp(&db).unwrap()
            })
    }

    fn shortest_path(&self, adj: &HashMap<NodeId, Vec<Adj>>, u: NodeId, v: NodeId) -> Option<(Vec<NodeId>, u64)> {
        if u == v {
            return Some((vec![u], 0));
        }
        dijkstra(
            &u,
            |n| {
                adj.get(n)
                    .into_iter()
                    .flatten()
                    .map(|e| (e.to, e.weight_mm))
                    .collect::<Vec<_>>()
            },
            |n| *n == v,
        )
    }

    fn shortest_path_nodes(&self, u: NodeId, v: NodeId, fallback_undirected: bool) -> Option<Vec<NodeId>> {
        if let Some(cached) = self.path_cache.lock().unwrap().get(&(u, v)) {
            return cached.clone();
        }

        let result = self
            .shortest_path(&self.directed, u, v)
            .or_else(|| fallback_undirected.then(|| self.shortest_path(&self.undirected, u, v)).flatten())
            .map(|(nodes, _)| nodes);

        self.path_cache.lock().unwrap().put((u, v), result.clone());
        result
    }

    /// Shortest-path length in meters: directed first, then undirected fallback, else +inf.
    pub fn dist_m(&self, u: NodeId, v: NodeId) -> f64 {
        if u == v {
            return 0.0;
        }
        self.shortest_path(&self.directed, u, v)
            .or_else(|| self.shortest_path(&self.undirected, u, v))
            .map(|(_, w)| from_weight(w))
            .unwrap_or(f64::INFINITY)
    }

    fn dist_m_directed_only(&self, u: NodeId, v: NodeId) -> f64 {
        if u == v {
            return 0.0;
        }
        self.shortest_path(&self.directed, u, v)
            .map(|(_, w)| from_weight(w))
            .unwrap_or(f64::INFINITY)
    }

    /// Shortest path mapped to lat/lon. If no path exists, degenerates to the
    /// two endpoints' coordinates (`spec.md` §4.1); callers that also check
    /// `dist_m` will have already filtered this case out.
    pub fn path_latlon(&self, u: NodeId, v: NodeId) -> Vec<(f64, f64)> {
        if let Some(nodes) = self.shortest_path_nodes(u, v, true) {
            if !nodes.is_empty() {
                return nodes
                    .into_iter()
                    .filter_map(|n| self.node_latlon(n))
                    .collect();
            }
        }
        match (self.node_latlon(u), self.node_latlon(v)) {
            (Some(a), Some(b)) => vec![a, b],
            _ => Vec::new(),
        }
    }

    /// Pick two distinct routable nodes. Tries `max_sample_tries` directed
    /// attempts, then falls back to `max_sample_tries` undirected-connectivity
    /// attempts before giving up (`spec.md` §4.1).
    pub fn sample_task_nodes(&self) -> Result<(NodeId, NodeId), RoadWorldError> {
        if self.node_ids.is_empty() {
            return Err(RoadWorldError::EmptyGraph);
        }

        for _ in 0..self.max_sample_tries {
            let (pu, dv) = self.random_pair();
            if pu == dv {
                continue;
            }
            let d = self.dist_m_directed_only(pu, dv);
            if d.is_finite() && d > 0.0 {
                return Ok((pu, dv));
            }
        }

        for _ in 0..self.max_sample_tries {
            let (pu, dv) = self.random_pair();
            if pu == dv {
                continue;
            }
            let d = self.dist_m(pu, dv);
            if d.is_finite() && d > 0.0 {
                return Ok((pu, dv));
            }
        }

        Err(RoadWorldError::NoRoutablePair)
    }

    fn random_pair(&self) -> (NodeId, NodeId) {
        let mut rng = self.rng.lock().unwrap();
        let i = rng.gen_range(0..self.node_ids.len());
        let j = rng.gen_range(0..self.node_ids.len());
        (self.node_ids[i], self.node_ids[j])
    }

    pub fn node_count(&self) -> usize {
        self.node_ids.len()
    }

    /// All nodes reachable from `u` (directed), used only by tests to sanity
    /// check generated fixtures.
    #[cfg(test)]
    fn reachable(&self, u: NodeId) -> HashSet<NodeId> {
        let mut seen = HashSet::new();
        let mut stack = vec![u];
        while let Some(n) = stack.pop() {
            if !seen.insert(n) {
                continue;
            }
            for e in self.directed.get(&n).into_iter().flatten() {
                stack.push(e.to);
            }
        }
        seen
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line_graph(n: i64, seed: u64) -> RoadWorld {
        let nodes = (0..n)
            .map(|i| GraphNode { id: i, pos: NodePos { lat: i as f64 * 0.001, lon: 0.0 } })
            .collect();
        let edges = (0..n - 1)
            .map(|i| GraphEdge { u: i, v: i + 1, length_m: Some(100.0) })
            .collect();
        RoadWorld::from_graph(nodes, edges, seed).unwrap()
    }

    #[test]
    fn dist_m_sums_edge_lengths_along_shortest_path() {
        let world = line_graph(5, 1);
        assert!((world.dist_m(0, 4) - 400.0).abs() < 1e-6);
    }

    #[test]
    fn nearest_node_picks_planar_closest_by_lon_lat() {
        let world = line_graph(5, 1);
        assert_eq!(world.nearest_node(0.0021, 0.0), Some(2));
        assert_eq!(world.nearest_node(-5.0, 0.0), Some(0));
        assert_eq!(world.nearest_node(5.0, 0.0), Some(4));
    }

    #[test]
    fn dist_m_is_infinite_when_unreachable_directed_and_undirected() {
        let nodes = vec![
            GraphNode { id: 0, pos: NodePos { lat: 0.0, lon: 0.0 } },
            GraphNode { id: 1, pos: NodePos { lat: 1.0, lon: 1.0 } },
        ];
        let world = RoadWorld::from_graph(nodes, vec![], 1).unwrap();
        assert!(world.dist_m(0, 1).is_infinite());
    }

    #[test]
    fn missing_edge_length_falls_back_to_haversine() {
        let nodes = vec![
            GraphNode { id: 0, pos: NodePos { lat: 0.0, lon: 0.0 } },
            GraphNode { id: 1, pos: NodePos { lat: 0.01, lon: 0.0 } },
        ];
        let edges = vec![GraphEdge { u: 0, v: 1, length_m: None }];
        let world = RoadWorld::from_graph(nodes, edges, 1).unwrap();
        let expected = haversine_m(NodePos { lat: 0.0, lon: 0.0 }, NodePos { lat: 0.01, lon: 0.0 });
        assert!((world.dist_m(0, 1) - expected).abs() < 1e-3);
    }

    #[test]
    fn undirected_fallback_routes_against_one_way_edges() {
        let nodes = vec![
            GraphNode { id: 0, pos: NodePos { lat: 0.0, lon: 0.0 } },
            GraphNode { id: 1, pos: NodePos { lat: 0.001, lon: 0.0 } },
        ];
        // Only 1 -> 0 exists directed; dist_m(0, 1) must fall back to undirected.
        let edges = vec![GraphEdge { u: 1, v: 0, length_m: Some(50.0) }];
        let world = RoadWorld::from_graph(nodes, edges, 1).unwrap();
        assert!(world.dist_m_directed_only(0, 1).is_infinite());
        assert!((world.dist_m(0, 1) - 50.0).abs() < 1e-6);
    }

    #[test]
    fn sample_task_nodes_is_deterministic_for_same_seed() {
        let a = line_graph(50, 7);
        let b = line_graph(50, 7);
        for _ in 0..10 {
            assert_eq!(a.sample_task_nodes().unwrap(), b.sample_task_nodes().unwrap());
        }
    }

    #[test]
    fn sample_task_nodes_fails_cleanly_on_single_node_graph() {
        let nodes = vec![GraphNode { id: 0, pos: NodePos { lat: 0.0, lon: 0.0 } }];
        let world = RoadWorld::from_graph(nodes, vec![], 1).unwrap();
        assert!(matches!(world.sample_task_nodes(), Err(RoadWorldError::NoRoutablePair)));
    }

    #[test]
    fn path_latlon_degenerates_to_endpoints_when_unreachable() {
        let nodes = vec![
            GraphNode { id: 0, pos: NodePos { lat: 0.0, lon: 0.0 } },
            GraphNode { id: 1, pos: NodePos { lat: 1.0, lon: 1.0 } },
        ];
        let world = RoadWorld::from_graph(nodes, vec![], 1).unwrap();
        let path = world.path_latlon(0, 1);
        assert_eq!(path, vec![(0.0, 0.0), (1.0, 1.0)]);
    }

    #[test]
    fn reachable_set_respects_edge_direction() {
        let world = line_graph(4, 1);
        assert_eq!(world.reachable(0).len(), 4);
        assert_eq!(world.reachable(3).len(), 1);
    }

    #[test]
    fn load_parses_a_graph_file_and_routes_it() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("graph.json");
        std::fs::write(
            &path,
            r#"{
                "nodes": [
                    {"id": 0, "lat": 0.0, "lon": 0.0},
                    {"id": 1, "lat": 0.001, "lon": 0.0}
                ],
                "edges": [
                    {"u": 0, "v": 1, "length_m": 100.0},
                    {"u": 1, "v": 0, "length_m": 100.0}
                ]
            }"#,
        )
        .unwrap();

        let world = RoadWorld::load(&path, 1).unwrap();
        assert!((world.dist_m(0, 1) - 100.0).abs() < 1e-6);
    }

    #[test]
    fn load_fails_cleanly_when_file_is_missing() {
        let result = RoadWorld::load("/nonexistent/path/graph.json", 1);
        assert!(matches!(result, Err(RoadWorldError::Io(_))));
    }
}
