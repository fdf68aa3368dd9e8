//! External observability sinks: event log, results CSV, and the map-viewer state file.
//!
//! These are concrete implementations, not abstractions behind a trait
//! (mirrors the teacher's `telemetry_export` living directly in `sim_core`
//! rather than behind a pluggable interface). `EventLogger` and `StateSink`
//! double as ECS resources: the dispatcher/vehicle systems write through them
//! live, tick by tick, whenever a run has them inserted; a run with neither
//! inserted (e.g. a batch sweep case) still produces identical simulation
//! results, since the sinks are write-only observers of state the ECS systems
//! already own. `ResultsWriter` stays runner-only (one row per completed run).

pub mod event_log;
pub mod results;
pub mod state_sink;

pub use event_log::EventLogger;
pub use results::ResultsWriter;
pub use state_sink::StateSink;
