//! Parameter sweep runner: scenario × strategy × seed cross product over
//! `dispatch_core`, descended from the teacher's `sim_experiments` crate.
//!
//! Each combination runs as an independent simulation (own `World`, own
//! `RoadWorld` load, no shared state), mirroring the teacher's
//! `run_parallel_experiments` rayon fan-out.

pub mod sweep;
