//! Observable state sink: the JSON document a live map viewer would poll.
//!
//! Grounded on the original's `state_store.py`. Writes are atomic (write to a
//! temp file in the same directory, then rename) and guarded by a mutex so
//! concurrent updates from multiple vehicles never interleave a partial write.
//! This crate's own runner is the only consumer that matters; the real viewer
//! is out of scope (`spec.md` §1), but the file format it would read is not.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use bevy_ecs::prelude::Resource;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::task::Task;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct VehicleView {
    pub jid: String,
    pub pos: [f64; 2],
    pub lat: f64,
    pub lon: f64,
    pub busy: bool,
    pub task_id: String,
    pub queue: Vec<String>,
    pub queue_len: usize,
    pub updated_ts: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryView {
    pub task_id: String,
    pub vehicle: String,
    pub lat: f64,
    pub lon: f64,
    pub pos: [f64; 2],
    pub finished_ts: f64,
    pub deadline_ts: f64,
    pub lateness_sec: f64,
    pub on_time: bool,
    pub distance_m: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StateDocument {
    pub updated_ts: f64,
    pub task: Option<Value>,
    pub vehicles: Vec<VehicleView>,
    pub vehicles_by_jid: HashMap<String, VehicleView>,
    pub deliveries: Vec<DeliveryView>,
}

/// Alias fields (`pickup`/`dropoff`/`route`/`distance`) the viewer reads in
/// addition to the canonical `*_latlon`/`distance_m` names, matching
/// `_task_add_alias_fields` in the original.
fn task_with_aliases(task: &Task) -> Value {
    let mut value = serde_json::to_value(task).expect("Task always serializes");
    if let Value::Object(map) = &mut value {
        map.insert("pickup".into(), serde_json::json!([task.pickup_latlon.0, task.pickup_latlon.1]));
        map.insert("dropoff".into(), serde_json::json!([task.dropoff_latlon.0, task.dropoff_latlon.1]));
        map.insert("route".into(), serde_json::to_value(&task.route_latlon).unwrap());
        map.insert("distance".into(), serde_json::json!(task.distance_m));
    }
    value
}

/// Also usable as an ECS resource so the dispatcher/vehicle systems publish
/// task/vehicle/delivery updates live, not only once at the end of a run.
#[derive(Resource)]
pub struct StateSink {
    path: PathBuf,
    max_deliveries_keep: usize,
    lock: Mutex<()>,
}

impl StateSink {
    pub fn new(path: impl Into<PathBuf>, max_deliveries_keep: usize) -> Self {
        Self { path: path.into(), max_deliveries_keep, lock: Mutex::new(()) }
    }

    fn read(&self) -> StateDocument {
        std::fs::read_to_string(&self.path)
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default()
    }

    fn write_atomic(&self, doc: &StateDocument) -> io::Result<()> {
        super::event_log::ensure_parent_dir(&self.path)?;
        let dir = self.path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or_else(|| Path::new("."));
        let tmp = tempfile::NamedTempFile::new_in(dir)?;
        serde_json::to_writer_pretty(&tmp, doc)?;
        tmp.persist(&self.path).map_err(|e| e.error)?;
        Ok(())
    }

    pub fn update_task(&self, task: &Task, now: f64) -> io::Result<()> {
        let _guard = self.lock.lock().unwrap();
        let mut doc = self.read();
        doc.task = Some(task_with_aliases(task));
        doc.updated_ts = now;
        self.write_atomic(&doc)
    }

    pub fn update_award(&self, task_id: &str, winner: &str, now: f64) -> io::Result<()> {
        let _guard = self.lock.lock().unwrap();
        let mut doc = self.read();
        if let Some(Value::Object(task)) = doc.task.as_mut() {
            if task.get("task_id").and_then(Value::as_str) == Some(task_id) {
                task.insert("winner".into(), Value::String(winner.to_string()));
                doc.updated_ts = now;
                self.write_atomic(&doc)?;
            }
        }
        Ok(())
    }

    pub fn clear_task(&self, now: f64) -> io::Result<()> {
        let _guard = self.lock.lock().unwrap();
        let mut doc = self.read();
        doc.task = None;
        doc.updated_ts = now;
        self.write_atomic(&doc)
    }

    pub fn update_vehicle(
        &self,
        jid: &str,
        pos: (f64, f64),
        busy: bool,
        task_id: &str,
        queue: Vec<String>,
        now: f64,
    ) -> io::Result<()> {
        let _guard = self.lock.lock().unwrap();
        let mut doc = self.read();
        let view = VehicleView {
            jid: jid.to_string(),
            pos: [pos.0, pos.1],
            lat: pos.0,
            lon: pos.1,
            busy,
            task_id: task_id.to_string(),
            queue_len: queue.len(),
            queue,
            updated_ts: now,
        };

        if let Some(existing) = doc.vehicles.iter_mut().find(|v| v.jid == jid) {
            *existing = view.clone();
        } else {
            doc.vehicles.push(view.clone());
        }
        doc.vehicles_by_jid.insert(jid.to_string(), view);
        doc.updated_ts = now;
        self.write_atomic(&doc)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn add_delivery(
        &self,
        task_id: &str,
        vehicle: &str,
        lat: f64,
        lon: f64,
        finished_ts: f64,
        deadline_ts: f64,
        distance: f64,
    ) -> io::Result<()> {
        let _guard = self.lock.lock().unwrap();
        let mut doc = self.read();
        let lateness = (finished_ts - deadline_ts).max(0.0);
        doc.deliveries.push(DeliveryView {
            task_id: task_id.to_string(),
            vehicle: vehicle.to_string(),
            lat,
            lon,
            pos: [lat, lon],
            finished_ts,
            deadline_ts,
            lateness_sec: lateness,
            on_time: lateness <= 1e-4,
            distance_m: distance,
        });
        if self.max_deliveries_keep > 0 && doc.deliveries.len() > self.max_deliveries_keep {
            let excess = doc.deliveries.len() - self.max_deliveries_keep;
            doc.deliveries.drain(0..excess);
        }
        doc.updated_ts = finished_ts;
        self.write_atomic(&doc)
    }
}
