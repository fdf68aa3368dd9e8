//! Simulation runner: pops events off the clock and runs the schedule.
//!
//! Mirrors the teacher's clock-driven stepping (pop next event, insert as
//! `CurrentEvent`, run schedule) adapted to this crate's three event kinds and
//! its own auto-stop condition instead of a fixed `SimulationEndTimeMs`.

use bevy_ecs::prelude::{Schedule, World};

use crate::clock::{CurrentEvent, SimulationClock};
use crate::dispatcher::DispatcherState;

/// Runs one simulation step. Returns `false` if the clock is empty or the
/// dispatcher has already auto-stopped.
pub fn run_next_event(world: &mut World, schedule: &mut Schedule) -> bool {
    if world.resource::<DispatcherState>().stopped {
        return false;
    }

    let event = match world.resource_mut::<SimulationClock>().pop_next() {
        Some(e) => e,
        None => return false,
    };
    world.insert_resource(CurrentEvent(event));
    schedule.run(world);
    true
}

/// Runs simulation steps until the clock empties, the dispatcher stops, or
/// `max_steps` is reached. Returns the number of steps executed.
pub fn run_until_empty(world: &mut World, schedule: &mut Schedule, max_steps: usize) -> usize {
    let mut steps = 0;
    while steps < max_steps && run_next_event(world, schedule) {
        steps += 1;
    }
    steps
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::DispatcherConfig;
    use crate::scenario::build_scenario;
    use crate::vehicle::VehicleConfig;

    #[test]
    fn run_until_empty_stops_when_dispatcher_stops() {
        let dispatcher_config = DispatcherConfig {
            vehicles: vec!["v1".into()],
            max_tasks: Some(0),
            ..Default::default()
        };
        let mut scenario =
            build_scenario(dispatcher_config, vec![VehicleConfig { jid: "v1".into(), ..Default::default() }], None, 0);
        let steps = run_until_empty(&mut scenario.world, &mut scenario.schedule, 50);
        assert!(steps > 0);
        assert!(scenario.world.resource::<DispatcherState>().stopped);
    }
}
