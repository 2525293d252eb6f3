//! Live snapshot for the TUI visualizer.
//!
//! The demo workload writes a JSON snapshot to SNAPSHOT_PATH after every
//! batch of dispatches. The viz binary polls this file and re-renders the
//! dashboard. Writes are atomic (write to .tmp then rename) to avoid torn
//! reads.
use serde::{Deserialize, Serialize};

pub const SNAPSHOT_PATH: &str = "/tmp/bwfq_live.json";

// ---------------------------------------------------------------------------
// Snapshot types
// ---------------------------------------------------------------------------

/// One queue's view in the dashboard.
#[derive(Serialize, Deserialize, Default, Clone, Debug)]
pub struct QueueSnapshot {
    /// Display name, e.g. "A" or "G/L1"
    pub name: String,
    /// Effective scheduling weight
    pub weight: u64,
    /// Cumulative service received, in service units
    pub service_total: u64,
    /// Share of all service received so far, [0, 100]
    pub share_pct: f64,
    /// Share the weights alone would predict, [0, 100]
    pub fair_share_pct: f64,
    /// Whether the queue currently has backlog
    pub busy: bool,
    /// Whether the queue is the one in service
    pub in_service: bool,
    /// Virtual start timestamp
    pub start: u64,
    /// Virtual finish timestamp
    pub finish: u64,
}

#[derive(Serialize, Deserialize, Default, Clone, Debug)]
pub struct LiveSnapshot {
    /// "idle" | "running" | "complete"
    pub status: String,
    /// Name of the workload phase being driven
    pub workload: String,
    /// Monotonic tick fed to the engine
    pub ticks: u64,
    /// Dispatches completed so far
    pub dispatches: u64,
    /// Dispatches planned for this phase
    pub dispatches_total: u64,
    pub busy_queues: u32,
    /// Virtual time of the root node's default class tree
    pub vtime: u64,
    /// Weight sum of the root node's default class tree
    pub wsum: u64,
    pub queues: Vec<QueueSnapshot>,
    /// Unix timestamp in ms when this snapshot was written
    pub timestamp_ms: u64,
}

// ---------------------------------------------------------------------------
// I/O helpers
// ---------------------------------------------------------------------------

/// Atomically write a snapshot to SNAPSHOT_PATH.
/// Uses a .tmp intermediate file + rename to avoid torn reads by the viz.
pub fn write_snapshot(snapshot: &LiveSnapshot) {
    if let Ok(json) = serde_json::to_string(snapshot) {
        let tmp = format!("{}.tmp", SNAPSHOT_PATH);
        if std::fs::write(&tmp, &json).is_ok() {
            let _ = std::fs::rename(&tmp, SNAPSHOT_PATH);
        }
    }
}

/// Read the latest snapshot. Returns None if the file doesn't exist or
/// can't be parsed (e.g. no workload has run yet).
pub fn read_snapshot() -> Option<LiveSnapshot> {
    let data = std::fs::read_to_string(SNAPSHOT_PATH).ok()?;
    serde_json::from_str(&data).ok()
}

/// Returns current Unix time in milliseconds.
pub fn now_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
