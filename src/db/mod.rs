//! Scan store abstraction.
//!
//! The scheduler never touches SQL directly; everything goes through this
//! trait. All operations must be race-safe under concurrent workers: claim
//! and transition are serialised per job, and two claim calls can never
//! return the same job.

use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{
    History, Issue, JobFilter, JobOutcome, JobStats, Jwt, OobInteraction, OobTest, Scan,
    ScanJob, ScanOptions, ScanStatus, WebSocketConnection, WebSocketMessage, WorkerNode,
};

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Persistence operations the scan engine relies on.
#[async_trait]
pub trait ScanStore: Send + Sync {
    // --- Scans ---

    /// Persist a scan in `pending` and atomically seed one crawl job per
    /// start URL.
    async fn create_scan(&self, options: ScanOptions) -> Result<Scan, StoreError>;

    async fn get_scan(&self, scan_id: Uuid) -> Result<Option<Scan>, StoreError>;

    /// Advance the scan status. Illegal transitions (out of a terminal
    /// state, or backwards) are rejected.
    async fn update_scan_status(&self, scan_id: Uuid, status: ScanStatus)
        -> Result<(), StoreError>;

    /// Mark the scan cancelled and cancel every pending job. Running jobs
    /// transition themselves on their next cancellation check.
    async fn cancel_scan(&self, scan_id: Uuid) -> Result<(), StoreError>;

    // --- Jobs ---

    /// Insert pending jobs and bump the scan's pending counter.
    async fn enqueue_jobs(&self, jobs: &[ScanJob]) -> Result<usize, StoreError>;

    /// Atomically claim the oldest pending job matching `filter` for
    /// `worker_id`, marking it running. Returns `None` when nothing
    /// matches. Concurrent callers never receive the same job.
    async fn claim_next_job(
        &self,
        worker_id: &str,
        filter: &JobFilter,
    ) -> Result<Option<ScanJob>, StoreError>;

    /// Refresh the job's heartbeat and the worker's last-seen. Fails with
    /// `NotClaimOwner` when the job is claimed by someone else.
    async fn heartbeat(&self, worker_id: &str, job_id: Uuid) -> Result<(), StoreError>;

    /// Transition a running job to completed or failed and advance the
    /// scan counters atomically.
    async fn complete_job(&self, job_id: Uuid, outcome: JobOutcome) -> Result<(), StoreError>;

    /// Put a running job back in the queue (claim cleared) so another
    /// worker can pick it up.
    async fn requeue_job(&self, job_id: Uuid) -> Result<(), StoreError>;

    /// Mark a job cancelled.
    async fn cancel_job(&self, job_id: Uuid) -> Result<(), StoreError>;

    /// Reset every running job held by a worker whose last-seen is older
    /// than `threshold`, and mark those workers stopped. Returns the
    /// number of jobs reset.
    async fn reset_jobs_from_stale_workers(&self, threshold: Duration)
        -> Result<u64, StoreError>;

    async fn scan_job_stats(&self, scan_id: Uuid) -> Result<JobStats, StoreError>;

    // --- Workers ---

    async fn register_worker(&self, node: &WorkerNode) -> Result<(), StoreError>;

    /// Advance the node's last-seen timestamp.
    async fn worker_seen(&self, worker_id: &str) -> Result<(), StoreError>;

    /// Sticky transition to stopped.
    async fn stop_worker(&self, worker_id: &str) -> Result<(), StoreError>;

    // --- Evidence ---

    /// Persist a history record, assigning its id.
    async fn save_history(&self, history: &mut History) -> Result<(), StoreError>;

    async fn count_scan_histories(&self, scan_id: Uuid) -> Result<i64, StoreError>;

    async fn save_issue(&self, issue: &Issue) -> Result<(), StoreError>;

    async fn save_oob_test(&self, test: &OobTest) -> Result<(), StoreError>;

    /// Find the OOB test whose correlation full-id is a prefix of
    /// `full_id`.
    async fn find_oob_test_for_interaction(
        &self,
        full_id: &str,
    ) -> Result<Option<OobTest>, StoreError>;

    async fn save_oob_interaction(
        &self,
        interaction: &OobInteraction,
    ) -> Result<(), StoreError>;

    async fn save_jwt(&self, jwt: &Jwt) -> Result<(), StoreError>;

    async fn save_websocket_connection(
        &self,
        connection: &WebSocketConnection,
    ) -> Result<(), StoreError>;

    async fn save_websocket_message(
        &self,
        message: &WebSocketMessage,
    ) -> Result<(), StoreError>;
}
