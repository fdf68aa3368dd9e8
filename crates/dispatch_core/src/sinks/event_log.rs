//! Event log: an append-only CSV of every notable thing that happened during a run.
//!
//! Grounded on the original's `logger.py`: the header is written once, on
//! first use, from a fixed base column set; if the file already exists with a
//! different header (e.g. from a previous run with extra columns), new rows
//! are written against *that* header instead, dropping fields it has no
//! column for. This crate also emits the row via the `log` crate, since structured
//! logging is part of the ambient stack every module here carries.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};

use bevy_ecs::prelude::Resource;

/// Canonical column order for a freshly created log file.
const BASE_FIELDS: &[&str] = &[
    "ts",
    "event",
    "task_id",
    "vehicle",
    "winner",
    "bid",
    "status",
    "release_ts",
    "deadline_ts",
    "finished_ts",
    "pickup",
    "dropoff",
    "distance",
];

/// One row to append. Unset fields serialize as an empty string, matching the
/// original's `row.get(k, "")` behavior.
#[derive(Debug, Clone, Default)]
pub struct EventRow {
    pub ts: f64,
    pub event: String,
    pub fields: HashMap<&'static str, String>,
}

impl EventRow {
    pub fn new(event: impl Into<String>, ts: f64) -> Self {
        Self { ts, event: event.into(), fields: HashMap::new() }
    }

    pub fn with(mut self, key: &'static str, value: impl ToString) -> Self {
        self.fields.insert(key, value.to_string());
        self
    }

    fn get(&self, key: &str) -> String {
        match key {
            "ts" => self.ts.to_string(),
            "event" => self.event.clone(),
            other => self.fields.get(other).cloned().unwrap_or_default(),
        }
    }
}

/// Also usable as an ECS resource so the dispatcher/vehicle systems can log
/// lifecycle events (ANNOUNCE, BID, NO_BID, AWARD, NO_BIDS, ASSIGNED, START,
/// FINISH, ROUTE_FAIL) the moment they happen, not just at the run's edges.
#[derive(Resource)]
pub struct EventLogger {
    path: PathBuf,
}

impl EventLogger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn existing_header(&self) -> Option<Vec<String>> {
        let mut reader = csv::ReaderBuilder::new().has_headers(false).from_path(&self.path).ok()?;
        let mut records = reader.records();
        let header = records.next()?.ok()?;
        Some(header.iter().map(str::to_string).collect())
    }

    /// Appends one row, logging it via `log::info!` as well. Creates the file
    /// (and its header) on first use; tolerates files with a wider header from
    /// a previous run by writing only the columns that header has.
    pub fn log_event(&self, row: EventRow) -> io::Result<()> {
        log::info!(target: "dispatch_core::event_log", "{} ts={:.3}", row.event, row.ts);

        let header = self.existing_header().unwrap_or_else(|| {
            let mut fields: Vec<String> = BASE_FIELDS.iter().map(|s| s.to_string()).collect();
            let mut extras: Vec<&'static str> = row.fields.keys().copied().collect();
            extras.sort_unstable();
            for extra in &extras {
                if !fields.iter().any(|f| f == extra) {
                    fields.push(extra.to_string());
                }
            }
            fields
        });

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let write_header = !self.path.exists();
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(file);
        if write_header {
            writer.write_record(&header)?;
        }
        let values: Vec<String> = header.iter().map(|col| row.get(col)).collect();
        writer.write_record(&values)?;
        writer.flush()
    }
}

pub fn ensure_parent_dir(path: &Path) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn first_write_creates_base_header() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("events.csv");
        let logger = EventLogger::new(&path);
        logger.log_event(EventRow::new("SPAWN", 1.0).with("vehicle", "v1")).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let header = content.lines().next().unwrap();
        assert_eq!(header, BASE_FIELDS.join(","));
    }

    #[test]
    fn respects_pre_existing_wider_header() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("events.csv");
        std::fs::write(&path, "ts,event,task_id,extra_col\n").unwrap();

        let logger = EventLogger::new(&path);
        logger.log_event(EventRow::new("ANNOUNCE", 2.0).with("task_id", "T1")).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let mut lines = content.lines();
        lines.next();
        let row = lines.next().unwrap();
        assert_eq!(row, "2,ANNOUNCE,T1,");
    }
}
