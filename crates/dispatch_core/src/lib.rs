//! Core simulation for a contract-net auction dispatcher coordinating
//! delivery vehicles over a road network.
//!
//! The simulation runs as a discrete-event schedule over a [`bevy_ecs::world::World`]:
//! the [`clock::SimulationClock`] holds a priority queue of [`clock::Event`]s, and
//! [`runner`] pops one at a time, advancing the clock and running exactly the
//! systems relevant to that event's kind. The Dispatcher and every Vehicle are
//! each a single-writer resource/component, so the auction protocol's
//! exactly-once-award and FIFO-queue invariants hold without locking.

pub mod clock;
pub mod dispatcher;
pub mod message;
pub mod road_world;
pub mod runner;
pub mod scenario;
pub mod sinks;
pub mod task;
pub mod transport;
pub mod vehicle;
