//! Results CSV: one summary row per completed run.
//!
//! Grounded on the original's `Dispatcher.export_csv`: same column order, same
//! defensive zero-division handling, and the same append-with-header-once-then-append
//! behavior (a file already on disk keeps its header; a run only ever adds rows).

use std::fs::OpenOptions;
use std::io;
use std::path::PathBuf;

use crate::dispatcher::{DispatcherConfig, Stats};

const FIELDS: &[&str] = &[
    "run_id",
    "scenario",
    "seed",
    "vehicles",
    "task_period_sec",
    "deadline_min_sec",
    "deadline_max_sec",
    "bid_wait_sec",
    "max_tasks",
    "tasks_announced",
    "tasks_awarded",
    "tasks_completed",
    "pending",
    "on_time_pct",
    "late_pct",
    "avg_lateness_sec",
    "avg_lateness_all_sec",
    "avg_assignment_time_sec",
    "messages_sent",
    "messages_received",
    "messages_per_task",
    "total_distance",
];

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// Builds the summary row for one finished run, mirroring `export_csv`'s row dict.
fn summary_row(config: &DispatcherConfig, stats: &Stats) -> Vec<String> {
    let on_time_pct = if stats.tasks_completed > 0 {
        stats.tasks_on_time as f64 / stats.tasks_completed as f64 * 100.0
    } else {
        0.0
    };
    let late_pct = if stats.tasks_completed > 0 {
        stats.tasks_late as f64 / stats.tasks_completed as f64 * 100.0
    } else {
        0.0
    };
    let avg_lateness = if stats.tasks_late > 0 {
        stats.total_lateness_sec / stats.tasks_late as f64
    } else {
        0.0
    };
    let avg_lateness_all = if stats.tasks_completed > 0 {
        stats.total_lateness_all_sec / stats.tasks_completed as f64
    } else {
        0.0
    };
    let pending = stats.tasks_awarded as i64 - stats.tasks_completed as i64;
    let avg_assignment_time = if stats.assignment_samples > 0 {
        stats.total_assignment_time_sec / stats.assignment_samples as f64
    } else {
        0.0
    };
    let messages_per_task = if stats.tasks_announced > 0 {
        (stats.messages_sent + stats.messages_received) as f64 / stats.tasks_announced as f64
    } else {
        0.0
    };

    vec![
        config.run_id.to_string(),
        config.scenario.name().to_string(),
        config.seed.to_string(),
        config.vehicles.len().to_string(),
        config.task_period_sec.to_string(),
        config.deadline_range_sec.0.to_string(),
        config.deadline_range_sec.1.to_string(),
        format!("{:.2}", round2(config.bid_wait_sec)),
        config.max_tasks.map(|m| m.to_string()).unwrap_or_default(),
        stats.tasks_announced.to_string(),
        stats.tasks_awarded.to_string(),
        stats.tasks_completed.to_string(),
        pending.to_string(),
        format!("{:.2}", round2(on_time_pct)),
        format!("{:.2}", round2(late_pct)),
        format!("{:.2}", round2(avg_lateness)),
        format!("{:.2}", round2(avg_lateness_all)),
        format!("{:.2}", round2(avg_assignment_time)),
        stats.messages_sent.to_string(),
        stats.messages_received.to_string(),
        format!("{:.2}", round2(messages_per_task)),
        format!("{:.2}", round2(stats.total_distance)),
    ]
}

pub struct ResultsWriter {
    path: PathBuf,
}

impl ResultsWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn append(&self, config: &DispatcherConfig, stats: &Stats) -> io::Result<()> {
        super::event_log::ensure_parent_dir(&self.path)?;
        let write_header = !self.path.exists();

        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(file);
        if write_header {
            writer.write_record(FIELDS)?;
        }
        writer.write_record(summary_row(config, stats))?;
        writer.flush()?;

        log::info!(target: "dispatch_core::results", "exported results to {}", self.path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::Scenario;
    use tempfile::tempdir;

    fn stats() -> Stats {
        Stats {
            tasks_announced: 4,
            tasks_awarded: 3,
            tasks_completed: 2,
            tasks_on_time: 1,
            tasks_late: 1,
            total_lateness_sec: 5.0,
            total_lateness_all_sec: 5.0,
            total_distance: 1234.5,
            total_assignment_time_sec: 4.0,
            assignment_samples: 2,
            messages_sent: 10,
            messages_received: 8,
        }
    }

    #[test]
    fn first_write_creates_header_then_appends_rows() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("results.csv");
        let writer = ResultsWriter::new(&path);
        let config = DispatcherConfig { vehicles: vec!["v1".into()], ..Default::default() }
            .with_scenario(Scenario::Low);

        writer.append(&config, &stats()).unwrap();
        writer.append(&config, &stats()).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let mut lines = content.lines();
        assert_eq!(lines.next().unwrap(), FIELDS.join(","));
        assert_eq!(lines.clone().count(), 2);
        let row: Vec<&str> = lines.next().unwrap().split(',').collect();
        assert_eq!(row[0], "0");
        assert_eq!(row[1], "low");
        assert_eq!(row[12], "1");
    }

    #[test]
    fn pending_and_percentages_handle_zero_completions_without_panicking() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("results.csv");
        let writer = ResultsWriter::new(&path);
        let config = DispatcherConfig::default();

        writer.append(&config, &Stats::default()).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let row = content.lines().nth(1).unwrap();
        let cols: Vec<&str> = row.split(',').collect();
        assert_eq!(cols[12], "0");
        assert_eq!(cols[13], "0.00");
    }
}
