//! `dispatch-run`: drives one end-to-end contract-net auction simulation from
//! the command line. The idiomatic replacement for `run_all.py` — builds a
//! [`dispatch_core`] scenario from CLI flags/env vars, steps it to completion,
//! and writes the event log, results row, and observable state document.

use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use clap::{Parser, ValueEnum};

use dispatch_core::dispatcher::{DispatcherConfig, Scenario as DispatchScenario};
use dispatch_core::road_world::RoadWorld;
use dispatch_core::runner::run_until_empty;
use dispatch_core::scenario::build_scenario;
use dispatch_core::sinks::{EventLogger, ResultsWriter, StateSink};
use dispatch_core::sinks::event_log::EventRow;
use dispatch_core::vehicle::{Strategy, VehicleConfig};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ScenarioArg {
    Low,
    Medium,
    High,
    Custom,
}

impl From<ScenarioArg> for DispatchScenario {
    fn from(s: ScenarioArg) -> Self {
        match s {
            ScenarioArg::Low => DispatchScenario::Low,
            ScenarioArg::Medium => DispatchScenario::Medium,
            ScenarioArg::High => DispatchScenario::High,
            ScenarioArg::Custom => DispatchScenario::Custom,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum StrategyArg {
    Nearest,
    Marginal,
}

impl From<StrategyArg> for Strategy {
    fn from(s: StrategyArg) -> Self {
        match s {
            StrategyArg::Nearest => Strategy::Nearest,
            StrategyArg::Marginal => Strategy::Marginal,
        }
    }
}

/// Run a single contract-net auction simulation end to end.
#[derive(Parser, Debug)]
#[command(name = "dispatch-run", about = "Run a single dispatch auction simulation")]
struct Cli {
    /// Bidding strategy every vehicle uses.
    #[arg(long, value_enum, default_value_t = StrategyArg::Nearest)]
    strategy: StrategyArg,

    /// Named task-arrival/deadline-slack preset.
    #[arg(long, value_enum, default_value_t = ScenarioArg::Low)]
    scenario: ScenarioArg,

    /// Run seed; also the base for each vehicle's derived RNG seed.
    #[arg(long, default_value_t = 1)]
    seed: u64,

    /// Number of vehicles to spawn (named `vehicle1@localhost`, `vehicle2@localhost`, ...).
    #[arg(long, default_value_t = 4)]
    vehicles: u32,

    /// Stop after this many tasks are announced. Unbounded if omitted.
    #[arg(long)]
    max_tasks: Option<u32>,

    /// Seconds the dispatcher waits for bids before deciding an auction.
    #[arg(long, default_value_t = 2.0)]
    bid_wait_sec: f64,

    /// Path to a road graph JSON file (see `RoadWorld::load`). Without one,
    /// the run has no task source and stops immediately.
    #[arg(long)]
    road_graph: Option<PathBuf>,

    /// Optional starting position per vehicle, as `lat,lon` (repeatable,
    /// in vehicle order). Snapped to the nearest graph node on load; vehicles
    /// without an explicit start default to `(0.0, 0.0)`
    /// (`spec.md` §4.2 Configuration "optional vehicle start positions").
    #[arg(long = "vehicle-start", value_parser = parse_latlon)]
    vehicle_starts: Vec<(f64, f64)>,

    /// Dispatcher JID, also settable via `DISPATCHER_JID`.
    #[arg(long, env = "DISPATCHER_JID", default_value = "dispatcher@localhost")]
    dispatcher_jid: String,

    /// Where to write the observable state JSON document.
    #[arg(long, env = "STATE_PATH", default_value = "state.json")]
    state_path: PathBuf,

    /// Ring-buffer size for `deliveries` in the state document.
    #[arg(long, env = "MAX_DELIVERIES_KEEP", default_value_t = 500)]
    max_deliveries_keep: usize,

    /// Publish a vehicle's live position to the state document only every
    /// Nth `VehiclePoll` tick, throttling writes for an external viewer.
    #[arg(long, env = "VIEWER_EVERY_N", default_value_t = 1)]
    viewer_every_n: u32,

    /// Path to append the per-run results summary row.
    #[arg(long, default_value = "results.csv")]
    results_csv: PathBuf,

    /// Path to append structured lifecycle events.
    #[arg(long, default_value = "events.csv")]
    event_log: PathBuf,

    /// Safety cap on simulation steps, in case `auto_stop` never triggers.
    #[arg(long, default_value_t = 200_000)]
    max_steps: usize,
}

fn unix_now() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

fn parse_latlon(raw: &str) -> Result<(f64, f64), String> {
    let (lat, lon) = raw.split_once(',').ok_or_else(|| format!("expected `lat,lon`, got {raw:?}"))?;
    let lat: f64 = lat.trim().parse().map_err(|_| format!("invalid latitude in {raw:?}"))?;
    let lon: f64 = lon.trim().parse().map_err(|_| format!("invalid longitude in {raw:?}"))?;
    Ok((lat, lon))
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let run_id = unix_now();
    let vehicle_jids: Vec<String> = (1..=cli.vehicles).map(|i| format!("vehicle{i}@localhost")).collect();

    let dispatcher_config = DispatcherConfig {
        vehicles: vehicle_jids.clone(),
        seed: cli.seed,
        bid_wait_sec: cli.bid_wait_sec,
        max_tasks: cli.max_tasks,
        run_id,
        ..Default::default()
    }
    .with_scenario(cli.scenario.into());

    let road_world = match &cli.road_graph {
        Some(path) => match RoadWorld::load(path, cli.seed) {
            Ok(world) => Some(world),
            Err(err) => {
                log::error!("failed to load road graph {}: {err}", path.display());
                std::process::exit(1);
            }
        },
        None => {
            log::warn!("no --road-graph given; dispatcher will have no routable tasks to announce");
            None
        }
    };

    let vehicle_configs: Vec<VehicleConfig> = vehicle_jids
        .iter()
        .enumerate()
        .map(|(i, jid)| {
            let start_pos = cli.vehicle_starts.get(i).map(|&(lat, lon)| {
                road_world
                    .as_ref()
                    .and_then(|w| w.nearest_node(lat, lon).and_then(|n| w.node_latlon(n)))
                    .unwrap_or((lat, lon))
            });
            VehicleConfig {
                jid: jid.clone(),
                strategy: cli.strategy.into(),
                seed: cli.seed,
                start_pos: start_pos.unwrap_or((0.0, 0.0)),
                viewer_every_n: cli.viewer_every_n,
                ..Default::default()
            }
        })
        .collect();

    let event_logger = EventLogger::new(&cli.event_log);
    let state_sink = StateSink::new(&cli.state_path, cli.max_deliveries_keep);

    event_logger
        .log_event(EventRow::new("SPAWN", 0.0).with("vehicle", vehicle_jids.join(";")))
        .unwrap_or_else(|e| log::warn!("event log write failed: {e}"));

    let mut scenario = build_scenario(dispatcher_config.clone(), vehicle_configs, road_world, 0);
    scenario.world.insert_resource(EventLogger::new(&cli.event_log));
    scenario.world.insert_resource(StateSink::new(&cli.state_path, cli.max_deliveries_keep));
    let steps = run_until_empty(&mut scenario.world, &mut scenario.schedule, cli.max_steps);
    log::info!("ran {steps} simulation steps");

    let stats = scenario.world.resource::<dispatch_core::dispatcher::DispatcherState>().stats.clone();

    event_logger
        .log_event(EventRow::new("DONE", steps as f64).with("vehicle", cli.dispatcher_jid.clone()))
        .unwrap_or_else(|e| log::warn!("event log write failed: {e}"));

    state_sink.clear_task(steps as f64).unwrap_or_else(|e| log::warn!("state sink write failed: {e}"));

    ResultsWriter::new(&cli.results_csv)
        .append(&dispatcher_config, &stats)
        .unwrap_or_else(|e| log::error!("failed to export results: {e}"));

    println!(
        "announced={} awarded={} completed={} pending={}",
        stats.tasks_announced,
        stats.tasks_awarded,
        stats.tasks_completed,
        stats.pending()
    );
}
