//! One sweep case is one (scenario, strategy, seed) combination, run to
//! completion in its own `World`. Mirrors `run_batch.py`'s triple-nested loop,
//! but fanned out across threads instead of sequential `await`s.

use std::path::{Path, PathBuf};

use dispatch_core::dispatcher::{DispatcherConfig, DispatcherState, Scenario};
use dispatch_core::road_world::RoadWorld;
use dispatch_core::runner::run_until_empty;
use dispatch_core::scenario::build_scenario;
use dispatch_core::vehicle::{Strategy, VehicleConfig};
use rayon::prelude::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepCase {
    pub scenario: Scenario,
    pub strategy: Strategy,
    pub seed: u64,
}

#[derive(Debug, Clone)]
pub struct SweepResult {
    pub case: SweepCase,
    pub config: DispatcherConfig,
    pub stats: dispatch_core::dispatcher::Stats,
}

/// The full cross product of scenarios, strategies, and seeds.
pub fn all_cases(scenarios: &[Scenario], strategies: &[Strategy], seeds: &[u64]) -> Vec<SweepCase> {
    let mut cases = Vec::with_capacity(scenarios.len() * strategies.len() * seeds.len());
    for &scenario in scenarios {
        for &strategy in strategies {
            for &seed in seeds {
                cases.push(SweepCase { scenario, strategy, seed });
            }
        }
    }
    cases
}

/// Runs one sweep case to completion against a freshly-loaded road graph.
pub fn run_case(case: SweepCase, road_graph: &Path, vehicles: u32, max_tasks: Option<u32>, bid_wait_sec: f64, max_steps: usize) -> Result<SweepResult, String> {
    let road_world = RoadWorld::load(road_graph, case.seed)
        .map_err(|e| format!("failed to load road graph for {case:?}: {e}"))?;

    let vehicle_jids: Vec<String> = (1..=vehicles).map(|i| format!("vehicle{i}@localhost")).collect();

    let config = DispatcherConfig {
        vehicles: vehicle_jids.clone(),
        seed: case.seed,
        bid_wait_sec,
        max_tasks,
        run_id: case.seed,
        ..Default::default()
    }
    .with_scenario(case.scenario);

    let vehicle_configs: Vec<VehicleConfig> = vehicle_jids
        .iter()
        .map(|jid| VehicleConfig { jid: jid.clone(), strategy: case.strategy, seed: case.seed, ..Default::default() })
        .collect();

    let mut scenario = build_scenario(config.clone(), vehicle_configs, Some(road_world), 0);
    run_until_empty(&mut scenario.world, &mut scenario.schedule, max_steps);

    let stats = scenario.world.resource::<DispatcherState>().stats.clone();
    Ok(SweepResult { case, config, stats })
}

/// Runs every case in parallel, reporting progress via an indicatif bar
/// (mirrors the teacher's `run_parallel_experiments_with_progress`).
pub fn run_sweep_parallel(
    cases: Vec<SweepCase>,
    road_graph: PathBuf,
    vehicles: u32,
    max_tasks: Option<u32>,
    bid_wait_sec: f64,
    max_steps: usize,
    show_progress: bool,
) -> Vec<SweepResult> {
    let total = cases.len();
    let pb = if show_progress && total > 0 {
        let bar = indicatif::ProgressBar::new(total as u64);
        bar.set_style(
            indicatif::ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})")
                .unwrap()
                .progress_chars("#>-"),
        );
        Some(bar)
    } else {
        None
    };

    let results: Vec<SweepResult> = cases
        .par_iter()
        .filter_map(|&case| {
            let result = run_case(case, &road_graph, vehicles, max_tasks, bid_wait_sec, max_steps);
            if let Some(bar) = &pb {
                bar.inc(1);
            }
            match result {
                Ok(r) => Some(r),
                Err(e) => {
                    log::warn!("sweep case failed: {e}");
                    None
                }
            }
        })
        .collect();

    if let Some(bar) = pb {
        bar.finish_with_message("done");
    }
    results
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_cases_is_the_full_cross_product() {
        let cases = all_cases(
            &[Scenario::Low, Scenario::Medium],
            &[Strategy::Nearest, Strategy::Marginal],
            &[1, 2],
        );
        assert_eq!(cases.len(), 8);
    }

    #[test]
    fn run_case_completes_against_a_small_synthetic_graph() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("graph.json");
        std::fs::write(
            &path,
            r#"{
                "nodes": [
                    {"id": 0, "lat": 0.0, "lon": 0.0},
                    {"id": 1, "lat": 0.01, "lon": 0.0},
                    {"id": 2, "lat": 0.02, "lon": 0.0}
                ],
                "edges": [
                    {"u": 0, "v": 1, "length_m": 1000.0},
                    {"u": 1, "v": 0, "length_m": 1000.0},
                    {"u": 1, "v": 2, "length_m": 1000.0},
                    {"u": 2, "v": 1, "length_m": 1000.0}
                ]
            }"#,
        )
        .unwrap();

        let case = SweepCase { scenario: Scenario::Custom, strategy: Strategy::Nearest, seed: 1 };
        let result = run_case(case, &path, 1, Some(1), 1.0, 10_000).unwrap();
        assert_eq!(result.stats.tasks_announced, 1);
    }
}
