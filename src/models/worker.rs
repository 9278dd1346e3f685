//! Worker nodes registered with the store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Liveness state of a worker node. `Stopped` is sticky.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Running,
    Stopped,
}

impl WorkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerStatus::Running => "running",
            WorkerStatus::Stopped => "stopped",
        }
    }
}

/// A process (or logical worker set) participating in the claim queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerNode {
    /// Caller-chosen or generated identifier; doubles as `claimed_by` on
    /// jobs this node holds.
    pub id: String,
    pub hostname: String,
    pub status: WorkerStatus,
    /// Concurrent worker slots inside this process.
    pub worker_count: usize,
    pub started_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub jobs_claimed: i64,
    pub jobs_completed: i64,
    pub jobs_failed: i64,
    pub version: String,
}

impl WorkerNode {
    pub fn new(id: impl Into<String>, worker_count: usize) -> Self {
        let now = Utc::now();
        let host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".to_string());
        Self {
            id: id.into(),
            hostname: host,
            status: WorkerStatus::Running,
            worker_count,
            started_at: now,
            last_seen_at: now,
            jobs_claimed: 0,
            jobs_completed: 0,
            jobs_failed: 0,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    /// Whether this node's last-seen timestamp is older than `threshold`.
    pub fn is_stale(&self, threshold: chrono::Duration, now: DateTime<Utc>) -> bool {
        now - self.last_seen_at > threshold
    }
}
