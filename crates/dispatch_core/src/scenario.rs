//! Scenario assembly: builds the ECS [`World`] and [`Schedule`] for a run.

use bevy_ecs::prelude::{Schedule, World};
use bevy_ecs::schedule::IntoSystemConfigs;

use crate::clock::{EventKind, SimulationClock, ONE_SEC_MS};
use crate::dispatcher::{
    announce_system, award_check_system, dispatcher_inbox_system, dispatcher_poll_system,
    is_announce_tick, is_dispatcher_poll, DispatcherConfig, DispatcherState,
};
use crate::road_world::RoadWorld;
use crate::transport::InMemoryTransport;
use crate::vehicle::{
    is_vehicle_poll, vehicle_inbox_system, vehicle_poll_reschedule_system, vehicle_worker_system,
    VehicleAgent, VehicleConfig,
};

/// Everything needed to run a simulation: the ECS world plus its schedule.
pub struct SimulationScenario {
    pub world: World,
    pub schedule: Schedule,
}

/// Assembles a world with a Dispatcher, N vehicles, and (optionally) a RoadWorld,
/// then schedules the first `AnnounceTick`/`DispatcherPoll`/`VehiclePoll` events.
pub fn build_scenario(
    dispatcher_config: DispatcherConfig,
    vehicle_configs: Vec<VehicleConfig>,
    road_world: Option<RoadWorld>,
    epoch_ms: i64,
) -> SimulationScenario {
    let mut world = World::new();

    world.insert_resource(DispatcherState::new(dispatcher_config));
    world.insert_resource(InMemoryTransport::new());

    if let Some(road_world) = road_world {
        world.insert_resource(road_world);
    }

    for config in &vehicle_configs {
        world.spawn(VehicleAgent::new(config));
    }

    let mut clock = SimulationClock::with_epoch(epoch_ms);
    clock.schedule_at(0, EventKind::AnnounceTick);
    clock.schedule_at(500, EventKind::DispatcherPoll);
    clock.schedule_at(200, EventKind::VehiclePoll);
    world.insert_resource(clock);

    SimulationScenario { world, schedule: simulation_schedule() }
}

/// The schedule run once per popped event. `transport.advance()` runs
/// unconditionally first so messages sent during the previous tick become
/// deliverable exactly one tick later (see [`crate::transport::InMemoryTransport`]).
/// Dispatcher inbox/award-check run every tick too, since a bid or status
/// update can arrive on any tick, not only `DispatcherPoll`.
pub fn simulation_schedule() -> Schedule {
    let mut schedule = Schedule::default();

    schedule.add_systems(transport_advance_system);
    schedule.add_systems(dispatcher_inbox_system);
    schedule.add_systems(announce_system.run_if(is_announce_tick));
    schedule.add_systems(dispatcher_poll_system.run_if(is_dispatcher_poll));
    schedule.add_systems(vehicle_poll_reschedule_system.run_if(is_vehicle_poll));
    schedule.add_systems(vehicle_inbox_system.run_if(is_vehicle_poll));
    schedule.add_systems(vehicle_worker_system.run_if(is_vehicle_poll));
    schedule.add_systems(award_check_system);

    schedule
}

fn transport_advance_system(mut transport: bevy_ecs::prelude::ResMut<InMemoryTransport>) {
    transport.advance();
}

/// `ONE_SEC_MS`, re-exported for callers building custom `task_period_sec` schedules.
pub const SECOND_MS: u64 = ONE_SEC_MS;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::Scenario;
    use crate::road_world::{GraphEdge, GraphNode, NodePos};
    use crate::runner::run_until_empty;

    fn small_world(seed: u64) -> RoadWorld {
        let nodes = (0..20)
            .map(|i| GraphNode {
                id: i,
                pos: NodePos { lat: (i as f64) * 0.001, lon: (i as f64) * 0.0005 },
            })
            .collect();
        let edges = (0..19)
            .flat_map(|i| {
                vec![
                    GraphEdge { u: i, v: i + 1, length_m: Some(200.0) },
                    GraphEdge { u: i + 1, v: i, length_m: Some(200.0) },
                ]
            })
            .collect();
        RoadWorld::from_graph(nodes, edges, seed).unwrap()
    }

    #[test]
    fn single_task_single_vehicle_completes_with_roomy_deadline() {
        let dispatcher_config = DispatcherConfig {
            vehicles: vec!["v1".into()],
            max_tasks: Some(1),
            deadline_range_sec: (600, 600),
            task_period_sec: 5,
            bid_wait_sec: 1.0,
            ..Default::default()
        }
        .with_scenario(Scenario::Custom);

        let vehicle_config = VehicleConfig { jid: "v1".into(), ..Default::default() };

        let mut scenario = build_scenario(dispatcher_config, vec![vehicle_config], Some(small_world(1)), 0);
        run_until_empty(&mut scenario.world, &mut scenario.schedule, 10_000);

        let dispatcher = scenario.world.resource::<crate::dispatcher::DispatcherState>();
        assert_eq!(dispatcher.stats.tasks_announced, 1);
        assert_eq!(dispatcher.stats.tasks_awarded, 1);
        assert_eq!(dispatcher.stats.tasks_completed, 1);
        assert!(dispatcher.stopped);
    }

    #[test]
    fn all_vehicles_at_capacity_drops_task_as_no_bids() {
        let dispatcher_config = DispatcherConfig {
            vehicles: vec!["v1".into()],
            max_tasks: Some(1),
            deadline_range_sec: (600, 600),
            task_period_sec: 5,
            bid_wait_sec: 1.0,
            ..Default::default()
        };
        let vehicle_config = VehicleConfig { jid: "v1".into(), capacity: 0, ..Default::default() };
        let mut scenario = build_scenario(dispatcher_config, vec![vehicle_config], Some(small_world(7)), 0);
        run_until_empty(&mut scenario.world, &mut scenario.schedule, 10_000);
        let dispatcher = scenario.world.resource::<crate::dispatcher::DispatcherState>();
        assert_eq!(dispatcher.stats.tasks_announced, 1);
        assert_eq!(dispatcher.stats.tasks_awarded, 0);
        assert!(dispatcher.stopped);
    }

    #[test]
    fn sinks_are_written_live_during_a_run_not_only_at_the_edges() {
        use crate::sinks::{EventLogger, StateSink};

        let dir = tempfile::tempdir().unwrap();
        let dispatcher_config = DispatcherConfig {
            vehicles: vec!["v1".into()],
            max_tasks: Some(1),
            deadline_range_sec: (600, 600),
            task_period_sec: 5,
            bid_wait_sec: 1.0,
            ..Default::default()
        }
        .with_scenario(Scenario::Custom);
        let vehicle_config = VehicleConfig { jid: "v1".into(), ..Default::default() };

        let mut scenario = build_scenario(dispatcher_config, vec![vehicle_config], Some(small_world(3)), 0);
        scenario.world.insert_resource(EventLogger::new(dir.path().join("events.csv")));
        scenario.world.insert_resource(StateSink::new(dir.path().join("state.json"), 10));
        run_until_empty(&mut scenario.world, &mut scenario.schedule, 10_000);

        let events = std::fs::read_to_string(dir.path().join("events.csv")).unwrap();
        for kind in ["ANNOUNCE", "BID", "AWARD", "START", "FINISH"] {
            assert!(events.contains(kind), "expected {kind} row in event log:\n{events}");
        }

        let state: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(dir.path().join("state.json")).unwrap()).unwrap();
        assert_eq!(state["deliveries"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn run_is_deterministic_for_same_seed() {
        let make = || {
            let dispatcher_config = DispatcherConfig {
                vehicles: vec!["v1".into(), "v2".into()],
                max_tasks: Some(3),
                deadline_range_sec: (600, 600),
                task_period_sec: 5,
                bid_wait_sec: 1.0,
                seed: 9,
                ..Default::default()
            };
            let vehicles = vec![
                VehicleConfig { jid: "v1".into(), seed: 9, ..Default::default() },
                VehicleConfig { jid: "v2".into(), seed: 9, ..Default::default() },
            ];
            let mut scenario = build_scenario(dispatcher_config, vehicles, Some(small_world(9)), 0);
            run_until_empty(&mut scenario.world, &mut scenario.schedule, 20_000);
            let dispatcher = scenario.world.resource::<crate::dispatcher::DispatcherState>();
            (dispatcher.stats.tasks_completed, dispatcher.stats.total_distance)
        };
        assert_eq!(make(), make());
    }
}
