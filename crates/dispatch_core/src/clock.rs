//! Simulation time: millisecond-scale timeline with a real-world epoch.
//!
//! All timestamps and `clock.now()` are in **simulation milliseconds**. Time 0 is
//! mapped to a real-world datetime via `epoch_ms`. The timeline advances by
//! popping the next scheduled event (same-ms events are ordered by `EventKind`).
//!
//! This is the discrete-event substrate the Dispatcher and every Vehicle run
//! on. Each popped event drives exactly one system step; a system only
//! mutates the resource/component belonging to the actor the event concerns,
//! so the single-writer-per-actor guarantee required by the protocol (see
//! `spec.md` §5) holds without locks.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use bevy_ecs::prelude::Resource;

/// One second in simulation milliseconds.
pub const ONE_SEC_MS: u64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EventKind {
    /// Dispatcher's periodic announce behavior (`task_period_sec`).
    AnnounceTick,
    /// Dispatcher's short poll: re-evaluates the award trigger and auto-stop
    /// even if no message has arrived since the last bid.
    DispatcherPoll,
    /// Vehicles' cooperative worker loop: advances whichever vehicle is
    /// currently executing a leg, and starts the next queued job for any
    /// idle vehicle.
    VehiclePoll,
}

/// Simulation event. `timestamp` is in **milliseconds** (simulation time).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub timestamp: u64,
    pub kind: EventKind,
}

impl Ord for Event {
    fn cmp(&self, other: &Self) -> Ordering {
        // Min-heap by timestamp; same timestamp ordered by kind for determinism.
        other
            .timestamp
            .cmp(&self.timestamp)
            .then_with(|| self.kind.cmp(&other.kind))
    }
}

impl PartialOrd for Event {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Clone, Copy, Resource)]
pub struct CurrentEvent(pub Event);

/// Simulation clock: time in **milliseconds**, advances to the next scheduled event.
/// Time 0 maps to a real-world datetime via `epoch_ms` (e.g. Unix epoch offset).
#[derive(Debug, Clone, Default, Resource)]
pub struct SimulationClock {
    now: u64,
    epoch_ms: i64,
    events: BinaryHeap<Event>,
}

impl SimulationClock {
    /// Clock with time 0 mapped to the given real-world ms (e.g. Unix epoch at run start).
    pub fn with_epoch(epoch_ms: i64) -> Self {
        Self {
            now: 0,
            epoch_ms,
            events: BinaryHeap::new(),
        }
    }

    /// Current simulation time in milliseconds.
    pub fn now(&self) -> u64 {
        self.now
    }

    /// Current simulation time in seconds, as a wall-clock-style float timestamp
    /// (`epoch_ms/1000 + now/1000`), matching the `time.time()` timestamps the
    /// Task/Bid/StatusUpdate fields in `spec.md` §3 are defined against.
    pub fn now_wall_secs(&self) -> f64 {
        (self.epoch_ms as f64 + self.now as f64) / 1000.0
    }

    pub fn epoch_ms(&self) -> i64 {
        self.epoch_ms
    }

    /// Schedule an event at a specific simulation timestamp (ms).
    pub fn schedule_at(&mut self, at_ms: u64, kind: EventKind) {
        self.schedule(Event {
            timestamp: at_ms,
            kind,
        });
    }

    /// Schedule an event at `now + delta_ms` (relative, in ms).
    pub fn schedule_in(&mut self, delta_ms: u64, kind: EventKind) {
        self.schedule_at(self.now.saturating_add(delta_ms), kind);
    }

    /// Schedule a full event (timestamp must be in ms, >= now).
    pub fn schedule(&mut self, event: Event) {
        debug_assert!(
            event.timestamp >= self.now,
            "event timestamp must be >= current time"
        );
        self.events.push(event);
    }

    /// Pop the next event (earliest timestamp; same-ms order by kind). Advances `now`.
    pub fn pop_next(&mut self) -> Option<Event> {
        let event = self.events.pop()?;
        self.now = event.timestamp;
        Some(event)
    }

    pub fn next_event_time(&self) -> Option<u64> {
        self.events.peek().map(|event| event.timestamp)
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn pending_event_count(&self) -> usize {
        self.events.len()
    }
}
