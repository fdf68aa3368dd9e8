//! Dispatcher: drives the contract-net auction over N vehicles.

use std::collections::{HashMap, HashSet};

use bevy_ecs::prelude::{Res, ResMut, Resource};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::clock::{CurrentEvent, EventKind, SimulationClock};
use crate::message::{Envelope, Message};
use crate::road_world::RoadWorld;
use crate::sinks::event_log::EventRow;
use crate::sinks::{EventLogger, StateSink};
use crate::task::Task;
use crate::transport::{InMemoryTransport, MessageTransport};

pub const DISPATCHER_JID: &str = "dispatcher@localhost";

/// Epsilon below which lateness counts as on-time (`spec.md` §4.2 Status update intake).
const LATENESS_EPSILON_SEC: f64 = 1e-4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    Low,
    Medium,
    High,
    Custom,
}

impl Scenario {
    /// Canonical presets (`spec.md` §4.2 Configuration).
    pub fn preset(self) -> Option<(u64, (u64, u64))> {
        match self {
            Scenario::Low => Some((15, (60, 120))),
            Scenario::Medium => Some((10, (35, 70))),
            Scenario::High => Some((6, (18, 40))),
            Scenario::Custom => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Scenario::Low => "low",
            Scenario::Medium => "medium",
            Scenario::High => "high",
            Scenario::Custom => "custom",
        }
    }
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub vehicles: Vec<String>,
    pub scenario: Scenario,
    pub task_period_sec: u64,
    pub deadline_range_sec: (u64, u64),
    pub seed: u64,
    pub bid_wait_sec: f64,
    pub max_tasks: Option<u32>,
    pub auto_stop: bool,
    pub max_route_resample: u32,
    pub run_id: u64,
}

impl DispatcherConfig {
    /// Applies a named scenario preset over `task_period_sec`/`deadline_range_sec`,
    /// matching the original's "scenario config overrides explicit args" precedence.
    pub fn with_scenario(mut self, scenario: Scenario) -> Self {
        self.scenario = scenario;
        if let Some((period, slack)) = scenario.preset() {
            self.task_period_sec = period;
            self.deadline_range_sec = slack;
        }
        self
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            vehicles: Vec::new(),
            scenario: Scenario::Custom,
            task_period_sec: 10,
            deadline_range_sec: (40, 90),
            seed: 1,
            bid_wait_sec: 2.0,
            max_tasks: None,
            auto_stop: true,
            max_route_resample: 30,
            run_id: 0,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Stats {
    pub tasks_announced: u64,
    pub tasks_awarded: u64,
    pub tasks_completed: u64,
    pub tasks_on_time: u64,
    pub tasks_late: u64,
    pub total_lateness_sec: f64,
    pub total_lateness_all_sec: f64,
    pub total_distance: f64,
    pub total_assignment_time_sec: f64,
    pub assignment_samples: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
}

impl Stats {
    pub fn pending(&self) -> i64 {
        self.tasks_awarded as i64 - self.tasks_completed as i64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenTaskOutcome {
    Awarded,
    NoBids,
}

/// The Dispatcher's run state. Exactly one instance lives as an ECS resource;
/// it is the single writer for every field here (`spec.md` §3 Dispatcher run state).
#[derive(Resource)]
pub struct DispatcherState {
    pub config: DispatcherConfig,
    pub current_task: Option<Task>,
    pub bids: HashMap<String, f64>,
    pub bid_order: Vec<String>,
    pub no_bids: HashSet<String>,
    pub auction_open_ts: Option<f64>,
    pub awarded_task_id: Option<String>,
    pub task_announce_ts: HashMap<String, f64>,
    pub completed_task_ids: HashSet<String>,
    pub stats: Stats,
    pub stopped: bool,
    rng: StdRng,
}

impl DispatcherState {
    pub fn new(config: DispatcherConfig) -> Self {
        let seed = config.seed;
        Self {
            config,
            current_task: None,
            bids: HashMap::new(),
            bid_order: Vec::new(),
            no_bids: HashSet::new(),
            auction_open_ts: None,
            awarded_task_id: None,
            task_announce_ts: HashMap::new(),
            completed_task_ids: HashSet::new(),
            stats: Stats::default(),
            stopped: false,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    fn can_announce(&self) -> bool {
        if let Some(max_tasks) = self.config.max_tasks {
            if self.stats.tasks_announced >= max_tasks as u64 {
                return false;
            }
        }
        match &self.current_task {
            None => true,
            Some(task) => self.awarded_task_id.as_deref() == Some(task.task_id.as_str()),
        }
    }

    fn fresh_task_id(&mut self, now: f64) -> String {
        let suffix = self.rng.gen_range(100..1000);
        format!("T{}-{}", now as i64, suffix)
    }

    fn sample_deadline_slack(&mut self) -> u64 {
        let (lo, hi) = self.config.deadline_range_sec;
        self.rng.gen_range(lo..=hi)
    }

    /// Periodic announce behavior (`spec.md` §4.2). Returns the announced task
    /// and the sent `announce_task` envelopes, or `None` if preconditions
    /// aren't met / route sampling was exhausted (caller should log `ROUTE_FAIL`
    /// in the latter case, distinguished by the returned `bool`).
    pub fn try_announce(&mut self, now: f64, world: Option<&RoadWorld>) -> AnnounceOutcome {
        if !self.can_announce() {
            return AnnounceOutcome::Skipped;
        }

        let task_id = self.fresh_task_id(now);
        let deadline_slack = self.sample_deadline_slack();
        let deadline_ts = now + deadline_slack as f64;

        let task = match world {
            Some(world) => match self.sample_road_task(world, &task_id, now, deadline_ts) {
                Some(task) => task,
                None => return AnnounceOutcome::RouteFailed { task_id },
            },
            None => return AnnounceOutcome::Skipped,
        };

        self.current_task = Some(task.clone());
        self.bids.clear();
        self.bid_order.clear();
        self.no_bids.clear();
        self.auction_open_ts = Some(now);
        self.awarded_task_id = None;
        self.stats.tasks_announced += 1;
        self.task_announce_ts.insert(task_id.clone(), now);

        let envelopes = self
            .config
            .vehicles
            .iter()
            .map(|v| Envelope::new(DISPATCHER_JID, v, Message::AnnounceTask(task.clone())))
            .collect();

        AnnounceOutcome::Announced { task, envelopes }
    }

    fn sample_road_task(
        &mut self,
        world: &RoadWorld,
        task_id: &str,
        now: f64,
        deadline_ts: f64,
    ) -> Option<Task> {
        for _ in 0..self.config.max_route_resample.max(1) {
            let Ok((pu, dv)) = world.sample_task_nodes() else {
                continue;
            };
            let distance_m = world.dist_m(pu, dv);
            if !distance_m.is_finite() || distance_m <= 0.0 {
                continue;
            }
            let route_latlon = world.path_latlon(pu, dv);
            if route_latlon.len() < 2 {
                continue;
            }
            let Some(pickup_latlon) = world.node_latlon(pu) else { continue };
            let Some(dropoff_latlon) = world.node_latlon(dv) else { continue };

            return Some(Task {
                task_id: task_id.to_string(),
                release_ts: now,
                deadline_ts,
                pickup_node: pu,
                dropoff_node: dv,
                pickup_latlon,
                dropoff_latlon,
                route_latlon,
                distance_m,
                size: 1,
                winner: None,
            });
        }
        None
    }

    /// Processes one inbound `bid` message (`spec.md` §4.2 Bid intake).
    pub fn handle_bid(&mut self, sender: &str, task_id: &str, bid: Option<f64>, no_bid: Option<bool>) {
        let Some(current) = &self.current_task else { return };
        if current.task_id != task_id {
            return; // stale/late arrival, discarded
        }

        let rejected = no_bid == Some(true) || bid.map(|b| !b.is_finite()).unwrap_or(true);
        if rejected {
            self.no_bids.insert(sender.to_string());
            return;
        }

        let value = bid.unwrap();
        if !self.bids.contains_key(sender) {
            self.bid_order.push(sender.to_string());
        }
        self.bids.insert(sender.to_string(), value); // latest-wins
    }

    /// Processes one inbound `status_update` message (`spec.md` §4.2 Status update
    /// intake). Returns `None` if this `task_id` was already completed (duplicate).
    pub fn handle_status_update(
        &mut self,
        task_id: &str,
        finished_ts: f64,
        deadline_ts: f64,
        distance: f64,
    ) -> Option<bool> {
        if self.completed_task_ids.contains(task_id) {
            return None;
        }
        self.completed_task_ids.insert(task_id.to_string());

        let lateness = (finished_ts - deadline_ts).max(0.0);
        self.stats.tasks_completed += 1;
        self.stats.total_distance += distance;
        self.stats.total_lateness_all_sec += lateness;

        let on_time = lateness <= LATENESS_EPSILON_SEC;
        if on_time {
            self.stats.tasks_on_time += 1;
        } else {
            self.stats.tasks_late += 1;
            self.stats.total_lateness_sec += lateness;
        }

        Some(on_time)
    }

    /// Re-evaluates the award trigger (`spec.md` §4.2 Award decision). Returns
    /// envelopes to send (award + rejects), or `None` if the trigger hasn't fired.
    pub fn maybe_award(&mut self, now: f64) -> Option<(OpenTaskOutcome, Vec<Envelope>)> {
        let task = self.current_task.clone()?;
        if self.awarded_task_id.as_deref() == Some(task.task_id.as_str()) {
            return None;
        }

        let all_responded =
            self.bids.len() + self.no_bids.len() >= self.config.vehicles.len();
        let timed_out = self
            .auction_open_ts
            .map(|open| now - open >= self.config.bid_wait_sec)
            .unwrap_or(false);

        if !(all_responded || timed_out) {
            return None;
        }

        if self.bids.is_empty() {
            self.awarded_task_id = Some(task.task_id.clone());
            return Some((OpenTaskOutcome::NoBids, Vec::new()));
        }

        // argmin tie-broken by insertion (first-bid-wins) order.
        let winner = self
            .bid_order
            .iter()
            .min_by(|a, b| self.bids[*a].partial_cmp(&self.bids[*b]).unwrap())
            .cloned()
            .unwrap();
        let win_bid = self.bids[&winner];

        self.stats.tasks_awarded += 1;
        if let Some(announce_ts) = self.task_announce_ts.get(&task.task_id) {
            self.stats.total_assignment_time_sec += now - announce_ts;
            self.stats.assignment_samples += 1;
        }

        let mut awarded_task = task.clone();
        awarded_task.winner = Some(winner.clone());
        self.current_task = Some(awarded_task.clone());
        self.awarded_task_id = Some(task.task_id.clone());

        let mut envelopes = vec![Envelope::new(
            DISPATCHER_JID,
            &winner,
            Message::Award(awarded_task),
        )];
        for v in &self.config.vehicles {
            if *v != winner {
                envelopes.push(Envelope::new(
                    DISPATCHER_JID,
                    v,
                    Message::Reject {
                        task_id: task.task_id.clone(),
                        winner: winner.clone(),
                        bid: win_bid,
                    },
                ));
            }
        }

        Some((OpenTaskOutcome::Awarded, envelopes))
    }

    /// `spec.md` §4.2 Auto-stop.
    pub fn maybe_autostop(&mut self) -> bool {
        if self.stopped || !self.config.auto_stop {
            return false;
        }
        let Some(max_tasks) = self.config.max_tasks else { return false };

        if let Some(task) = &self.current_task {
            if self.awarded_task_id.as_deref() != Some(task.task_id.as_str()) {
                return false;
            }
        }

        if self.stats.tasks_announced >= max_tasks as u64 && self.stats.pending() <= 0 {
            self.stopped = true;
            return true;
        }
        false
    }
}

pub enum AnnounceOutcome {
    Announced { task: Task, envelopes: Vec<Envelope> },
    RouteFailed { task_id: String },
    Skipped,
}

/// ECS condition: true when the current event is an `AnnounceTick`.
pub fn is_announce_tick(event: Option<Res<CurrentEvent>>) -> bool {
    event.map(|e| e.0.kind == EventKind::AnnounceTick).unwrap_or(false)
}

/// ECS condition: true when the current event is a `DispatcherPoll`.
pub fn is_dispatcher_poll(event: Option<Res<CurrentEvent>>) -> bool {
    event.map(|e| e.0.kind == EventKind::DispatcherPoll).unwrap_or(false)
}

/// System: runs the Dispatcher's inbox drain unconditionally every tick, so
/// bids/status-updates are processed the moment they're deliverable (`spec.md`
/// §9's message-driven reevaluation), matching the original's short-timeout
/// receive loop rather than only reacting on `DispatcherPoll`.
pub fn dispatcher_inbox_system(
    mut dispatcher: ResMut<DispatcherState>,
    mut transport: ResMut<InMemoryTransport>,
    clock: Res<SimulationClock>,
    event_logger: Option<Res<EventLogger>>,
    state_sink: Option<Res<StateSink>>,
) {
    let now = clock.now_wall_secs();
    let inbound = transport.drain_for(DISPATCHER_JID);
    for envelope in inbound {
        dispatcher.stats.messages_received += 1;
        match envelope.message {
            Message::Bid { task_id, bid, no_bid } => {
                dispatcher.handle_bid(&envelope.from, &task_id, bid, no_bid);
                if no_bid != Some(true) {
                    if let Some(value) = bid.filter(|b| b.is_finite()) {
                        log_event(
                            &event_logger,
                            EventRow::new("BID", now)
                                .with("task_id", task_id.clone())
                                .with("vehicle", envelope.from.clone())
                                .with("bid", value),
                        );
                    }
                }
            }
            Message::StatusUpdate {
                task_id,
                vehicle,
                finished_ts,
                deadline_ts,
                distance,
                delivered_latlon,
            } => {
                if let Some(on_time) = dispatcher.handle_status_update(&task_id, finished_ts, deadline_ts, distance) {
                    log_event(
                        &event_logger,
                        EventRow::new("FINISH", now)
                            .with("task_id", task_id.clone())
                            .with("vehicle", vehicle.clone())
                            .with("finished_ts", finished_ts)
                            .with("deadline_ts", deadline_ts)
                            .with("distance", distance)
                            .with("status", if on_time { "ON_TIME" } else { "LATE" }),
                    );
                    if let Some(sink) = &state_sink {
                        sink.add_delivery(&task_id, &vehicle, delivered_latlon.0, delivered_latlon.1, finished_ts, deadline_ts, distance)
                            .unwrap_or_else(|e| log::warn!("state sink delivery write failed: {e}"));
                    }
                }
            }
            _ => {}
        }
    }
}

/// Logs a row via the event log sink if one is configured, warning (never
/// panicking) on write failure (`spec.md` §7 "external sink failure").
fn log_event(event_logger: &Option<Res<EventLogger>>, row: EventRow) {
    if let Some(logger) = event_logger {
        logger.log_event(row).unwrap_or_else(|e| log::warn!("event log write failed: {e}"));
    }
}

/// System: reschedules the next `AnnounceTick` and attempts to announce a new task.
pub fn announce_system(
    mut dispatcher: ResMut<DispatcherState>,
    road_world: Option<Res<RoadWorld>>,
    mut clock: ResMut<SimulationClock>,
    mut transport: ResMut<InMemoryTransport>,
    event_logger: Option<Res<EventLogger>>,
    state_sink: Option<Res<StateSink>>,
) {
    if !dispatcher.stopped {
        clock.schedule_in(dispatcher.config.task_period_sec * crate::clock::ONE_SEC_MS, EventKind::AnnounceTick);
    }

    let now = clock.now_wall_secs();
    match dispatcher.try_announce(now, road_world.as_deref()) {
        AnnounceOutcome::Announced { task, envelopes } => {
            for envelope in envelopes {
                dispatcher.stats.messages_sent += 1;
                transport.send(envelope);
            }
            log_event(
                &event_logger,
                EventRow::new("ANNOUNCE", now)
                    .with("task_id", task.task_id.clone())
                    .with("release_ts", task.release_ts)
                    .with("deadline_ts", task.deadline_ts)
                    .with("pickup", format!("{:?}", task.pickup_latlon))
                    .with("dropoff", format!("{:?}", task.dropoff_latlon))
                    .with("distance", task.distance_m),
            );
            if let Some(sink) = &state_sink {
                sink.update_task(&task, now).unwrap_or_else(|e| log::warn!("state sink write failed: {e}"));
            }
        }
        AnnounceOutcome::RouteFailed { task_id } => {
            log::warn!("ROUTE_FAIL: no routable task sampled for {task_id}");
            log_event(&event_logger, EventRow::new("ROUTE_FAIL", now).with("task_id", task_id));
        }
        AnnounceOutcome::Skipped => {}
    }
}

/// System: reevaluates award + auto-stop on the short polling interval.
pub fn dispatcher_poll_system(dispatcher: Res<DispatcherState>, mut clock: ResMut<SimulationClock>) {
    if !dispatcher.stopped {
        clock.schedule_in(500, EventKind::DispatcherPoll);
    }
}

/// System: runs the award check every tick (message arrival or poll), mirroring
/// the original calling `_maybe_award` at the end of every `Inbox.run()`.
pub fn award_check_system(
    mut dispatcher: ResMut<DispatcherState>,
    clock: Res<SimulationClock>,
    mut transport: ResMut<InMemoryTransport>,
    event_logger: Option<Res<EventLogger>>,
    state_sink: Option<Res<StateSink>>,
) {
    let now = clock.now_wall_secs();
    if let Some((outcome, envelopes)) = dispatcher.maybe_award(now) {
        let task_id = dispatcher
            .current_task
            .as_ref()
            .map(|t| t.task_id.clone())
            .unwrap_or_default();
        for envelope in envelopes {
            dispatcher.stats.messages_sent += 1;
            transport.send(envelope);
        }
        match outcome {
            OpenTaskOutcome::Awarded => {
                let winner = dispatcher.current_task.as_ref().and_then(|t| t.winner.clone()).unwrap_or_default();
                log_event(
                    &event_logger,
                    EventRow::new("AWARD", now).with("task_id", task_id.clone()).with("winner", winner.clone()),
                );
                if let Some(sink) = &state_sink {
                    sink.update_award(&task_id, &winner, now).unwrap_or_else(|e| log::warn!("state sink write failed: {e}"));
                }
            }
            OpenTaskOutcome::NoBids => {
                log_event(&event_logger, EventRow::new("NO_BIDS", now).with("task_id", task_id));
                if let Some(sink) = &state_sink {
                    sink.clear_task(now).unwrap_or_else(|e| log::warn!("state sink write failed: {e}"));
                }
            }
        }
    }
    dispatcher.maybe_autostop();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> DispatcherConfig {
        DispatcherConfig {
            vehicles: vec!["v1".into(), "v2".into()],
            ..Default::default()
        }
    }

    #[test]
    fn award_trigger_waits_for_all_responses() {
        let mut d = DispatcherState::new(config());
        d.current_task = Some(Task {
            task_id: "T1".into(),
            release_ts: 0.0,
            deadline_ts: 100.0,
            pickup_node: 0,
            dropoff_node: 1,
            pickup_latlon: (0.0, 0.0),
            dropoff_latlon: (0.0, 0.0),
            route_latlon: vec![(0.0, 0.0), (1.0, 1.0)],
            distance_m: 10.0,
            size: 1,
            winner: None,
        });
        d.auction_open_ts = Some(0.0);
        d.handle_bid("v1", "T1", Some(5.0), None);
        assert!(d.maybe_award(0.1).is_none());

        d.handle_bid("v2", "T1", Some(3.0), None);
        let (outcome, envelopes) = d.maybe_award(0.1).unwrap();
        assert_eq!(outcome, OpenTaskOutcome::Awarded);
        assert_eq!(d.current_task.unwrap().winner, Some("v2".into()));
        assert_eq!(envelopes.len(), 2); // award to v2, reject to v1
    }

    #[test]
    fn award_falls_back_to_timeout_when_vehicle_never_responds() {
        let mut d = DispatcherState::new(config());
        d.current_task = Some(Task {
            task_id: "T1".into(),
            release_ts: 0.0,
            deadline_ts: 100.0,
            pickup_node: 0,
            dropoff_node: 1,
            pickup_latlon: (0.0, 0.0),
            dropoff_latlon: (0.0, 0.0),
            route_latlon: vec![(0.0, 0.0), (1.0, 1.0)],
            distance_m: 10.0,
            size: 1,
            winner: None,
        });
        d.auction_open_ts = Some(0.0);
        d.handle_bid("v1", "T1", Some(5.0), None);
        assert!(d.maybe_award(1.0).is_none()); // bid_wait_sec default is 2.0
        let (outcome, _) = d.maybe_award(2.5).unwrap();
        assert_eq!(outcome, OpenTaskOutcome::Awarded);
    }

    #[test]
    fn all_no_bids_drops_task_without_incrementing_awarded() {
        let mut d = DispatcherState::new(config());
        d.current_task = Some(Task {
            task_id: "T1".into(),
            release_ts: 0.0,
            deadline_ts: 100.0,
            pickup_node: 0,
            dropoff_node: 1,
            pickup_latlon: (0.0, 0.0),
            dropoff_latlon: (0.0, 0.0),
            route_latlon: vec![(0.0, 0.0), (1.0, 1.0)],
            distance_m: 10.0,
            size: 1,
            winner: None,
        });
        d.auction_open_ts = Some(0.0);
        d.handle_bid("v1", "T1", None, Some(true));
        d.handle_bid("v2", "T1", None, Some(true));
        let (outcome, envelopes) = d.maybe_award(0.1).unwrap();
        assert_eq!(outcome, OpenTaskOutcome::NoBids);
        assert!(envelopes.is_empty());
        assert_eq!(d.stats.tasks_awarded, 0);
    }

    #[test]
    fn duplicate_status_update_is_discarded() {
        let mut d = DispatcherState::new(config());
        assert!(d.handle_status_update("T1", 10.0, 5.0, 100.0).is_some());
        assert!(d.handle_status_update("T1", 10.0, 5.0, 100.0).is_none());
        assert_eq!(d.stats.tasks_completed, 1);
    }

    #[test]
    fn lateness_below_epsilon_counts_on_time() {
        let mut d = DispatcherState::new(config());
        let on_time = d.handle_status_update("T1", 10.0, 10.0, 100.0).unwrap();
        assert!(on_time);
        assert_eq!(d.stats.tasks_on_time, 1);
        assert_eq!(d.stats.tasks_late, 0);
    }

    #[test]
    fn autostop_requires_all_announced_and_no_pending() {
        let mut d = DispatcherState::new(DispatcherConfig { max_tasks: Some(1), ..config() });
        d.stats.tasks_announced = 1;
        d.stats.tasks_awarded = 1;
        d.stats.tasks_completed = 0;
        assert!(!d.maybe_autostop());
        d.stats.tasks_completed = 1;
        assert!(d.maybe_autostop());
    }
}
