//! In-memory scan store.
//!
//! Implements the same contract as the PostgreSQL store behind a single
//! mutex, which makes the claim/transition races trivially serialised. Used
//! by tests and by single-process demo runs without a database.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::db::ScanStore;
use crate::error::StoreError;
use crate::models::{
    History, Issue, JobFilter, JobKind, JobOutcome, JobStats, JobStatus, Jwt, OobInteraction,
    OobTest, Scan, ScanJob, ScanOptions, ScanStatus, TargetDescriptor, WebSocketConnection,
    WebSocketMessage, WorkerNode, WorkerStatus,
};

#[derive(Default)]
struct Inner {
    scans: HashMap<Uuid, Scan>,
    /// Insertion order doubles as claim order.
    jobs: Vec<ScanJob>,
    workers: HashMap<String, WorkerNode>,
    histories: Vec<History>,
    next_history_id: i64,
    issues: Vec<Issue>,
    oob_tests: Vec<OobTest>,
    oob_interactions: Vec<OobInteraction>,
    jwts: Vec<Jwt>,
    websocket_connections: Vec<WebSocketConnection>,
    websocket_messages: Vec<WebSocketMessage>,
}

impl Inner {
    fn job_mut(&mut self, job_id: Uuid) -> Result<&mut ScanJob, StoreError> {
        self.jobs
            .iter_mut()
            .find(|j| j.id == job_id)
            .ok_or(StoreError::NotFound {
                entity: "job",
                id: job_id.to_string(),
            })
    }

    fn adjust_counter(&mut self, scan_id: Uuid, status: JobStatus, delta: i64) {
        if let Some(scan) = self.scans.get_mut(&scan_id) {
            let counter = match status {
                JobStatus::Pending => &mut scan.pending_jobs,
                JobStatus::Running => &mut scan.running_jobs,
                JobStatus::Completed => &mut scan.completed_jobs,
                JobStatus::Failed => &mut scan.failed_jobs,
                JobStatus::Cancelled => return,
            };
            *counter += delta;
            scan.updated_at = Utc::now();
        }
    }
}

/// A `ScanStore` backed by process memory.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All issues recorded so far. Test helper.
    pub async fn issues(&self) -> Vec<Issue> {
        self.inner.lock().await.issues.clone()
    }

    /// All histories recorded so far. Test helper.
    pub async fn histories(&self) -> Vec<History> {
        self.inner.lock().await.histories.clone()
    }

    /// All captured JWTs. Test helper.
    pub async fn jwts(&self) -> Vec<Jwt> {
        self.inner.lock().await.jwts.clone()
    }

    /// All recorded OOB interactions. Test helper.
    pub async fn oob_interactions(&self) -> Vec<OobInteraction> {
        self.inner.lock().await.oob_interactions.clone()
    }

    /// All registered OOB tests. Test helper.
    pub async fn oob_tests(&self) -> Vec<OobTest> {
        self.inner.lock().await.oob_tests.clone()
    }

    /// Snapshot of a job by id. Test helper.
    pub async fn job(&self, job_id: Uuid) -> Option<ScanJob> {
        self.inner
            .lock()
            .await
            .jobs
            .iter()
            .find(|j| j.id == job_id)
            .cloned()
    }

    /// Age a worker's last-seen timestamp. Test helper for staleness
    /// scenarios.
    pub async fn rewind_worker_last_seen(&self, worker_id: &str, by: chrono::Duration) {
        let mut inner = self.inner.lock().await;
        if let Some(worker) = inner.workers.get_mut(worker_id) {
            worker.last_seen_at -= by;
        }
    }

    pub async fn jobs_for_scan(&self, scan_id: Uuid) -> Vec<ScanJob> {
        self.inner
            .lock()
            .await
            .jobs
            .iter()
            .filter(|j| j.scan_id == scan_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl ScanStore for MemoryStore {
    async fn create_scan(&self, options: ScanOptions) -> Result<Scan, StoreError> {
        let mut inner = self.inner.lock().await;
        let mut scan = Scan::new(options);

        let seeds: Vec<ScanJob> = scan
            .options
            .start_urls
            .iter()
            .map(|url| {
                ScanJob::new(scan.id, JobKind::Crawl, TargetDescriptor::get(url.clone()))
                    .with_max_retries(scan.options.max_retries)
            })
            .collect();
        scan.pending_jobs = seeds.len() as i64;

        inner.jobs.extend(seeds);
        inner.scans.insert(scan.id, scan.clone());
        Ok(scan)
    }

    async fn get_scan(&self, scan_id: Uuid) -> Result<Option<Scan>, StoreError> {
        Ok(self.inner.lock().await.scans.get(&scan_id).cloned())
    }

    async fn update_scan_status(
        &self,
        scan_id: Uuid,
        status: ScanStatus,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let scan = inner.scans.get_mut(&scan_id).ok_or(StoreError::NotFound {
            entity: "scan",
            id: scan_id.to_string(),
        })?;
        if !scan.can_transition_to(status) {
            return Err(StoreError::IllegalTransition {
                entity: "scan",
                from: scan.status.to_string(),
                to: status.to_string(),
            });
        }
        scan.status = status;
        scan.updated_at = Utc::now();
        Ok(())
    }

    async fn cancel_scan(&self, scan_id: Uuid) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let scan = inner.scans.get_mut(&scan_id).ok_or(StoreError::NotFound {
            entity: "scan",
            id: scan_id.to_string(),
        })?;
        if scan.status.is_terminal() {
            return Ok(());
        }
        scan.status = ScanStatus::Cancelled;
        scan.updated_at = Utc::now();
        scan.pending_jobs = 0;
        for job in inner
            .jobs
            .iter_mut()
            .filter(|j| j.scan_id == scan_id && j.status == JobStatus::Pending)
        {
            job.status = JobStatus::Cancelled;
        }
        Ok(())
    }

    async fn enqueue_jobs(&self, jobs: &[ScanJob]) -> Result<usize, StoreError> {
        let mut inner = self.inner.lock().await;
        for job in jobs {
            inner.adjust_counter(job.scan_id, JobStatus::Pending, 1);
            inner.jobs.push(job.clone());
        }
        Ok(jobs.len())
    }

    async fn claim_next_job(
        &self,
        worker_id: &str,
        filter: &JobFilter,
    ) -> Result<Option<ScanJob>, StoreError> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();

        let position = inner.jobs.iter().position(|job| {
            job.status == JobStatus::Pending && job.claimed_by.is_none() && filter.matches(job)
        });
        let Some(position) = position else {
            return Ok(None);
        };

        let (scan_id, claimed) = {
            let job = &mut inner.jobs[position];
            job.status = JobStatus::Running;
            job.claimed_by = Some(worker_id.to_string());
            job.claimed_at = Some(now);
            job.last_heartbeat = Some(now);
            job.attempts += 1;
            (job.scan_id, job.clone())
        };

        inner.adjust_counter(scan_id, JobStatus::Pending, -1);
        inner.adjust_counter(scan_id, JobStatus::Running, 1);
        if let Some(scan) = inner.scans.get_mut(&scan_id) {
            if scan.status == ScanStatus::Pending {
                scan.status = ScanStatus::Running;
            }
        }
        if let Some(worker) = inner.workers.get_mut(worker_id) {
            worker.jobs_claimed += 1;
            worker.last_seen_at = now;
        }
        Ok(Some(claimed))
    }

    async fn heartbeat(&self, worker_id: &str, job_id: Uuid) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        let job = inner.job_mut(job_id)?;
        if job.claimed_by.as_deref() != Some(worker_id) {
            return Err(StoreError::NotClaimOwner {
                job_id,
                worker_id: worker_id.to_string(),
            });
        }
        job.last_heartbeat = Some(now);
        if let Some(worker) = inner.workers.get_mut(worker_id) {
            worker.last_seen_at = now;
        }
        Ok(())
    }

    async fn complete_job(&self, job_id: Uuid, outcome: JobOutcome) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let job = inner.job_mut(job_id)?;
        if job.status != JobStatus::Running {
            return Err(StoreError::IllegalTransition {
                entity: "job",
                from: job.status.to_string(),
                to: match outcome {
                    JobOutcome::Completed => JobStatus::Completed.to_string(),
                    JobOutcome::Failed { .. } => JobStatus::Failed.to_string(),
                },
            });
        }
        let scan_id = job.scan_id;
        let worker_id = job.claimed_by.clone();
        let next = match outcome {
            JobOutcome::Completed => JobStatus::Completed,
            JobOutcome::Failed { .. } => JobStatus::Failed,
        };
        job.status = next;

        inner.adjust_counter(scan_id, JobStatus::Running, -1);
        inner.adjust_counter(scan_id, next, 1);
        if let Some(worker_id) = worker_id {
            if let Some(worker) = inner.workers.get_mut(&worker_id) {
                match next {
                    JobStatus::Completed => worker.jobs_completed += 1,
                    JobStatus::Failed => worker.jobs_failed += 1,
                    _ => {}
                }
            }
        }
        Ok(())
    }

    async fn requeue_job(&self, job_id: Uuid) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let job = inner.job_mut(job_id)?;
        if job.status != JobStatus::Running {
            return Err(StoreError::IllegalTransition {
                entity: "job",
                from: job.status.to_string(),
                to: JobStatus::Pending.to_string(),
            });
        }
        let scan_id = job.scan_id;
        job.status = JobStatus::Pending;
        job.claimed_by = None;
        job.claimed_at = None;
        job.last_heartbeat = None;
        inner.adjust_counter(scan_id, JobStatus::Running, -1);
        inner.adjust_counter(scan_id, JobStatus::Pending, 1);
        Ok(())
    }

    async fn cancel_job(&self, job_id: Uuid) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let job = inner.job_mut(job_id)?;
        if job.status.is_terminal() {
            return Ok(());
        }
        let previous = job.status;
        let scan_id = job.scan_id;
        job.status = JobStatus::Cancelled;
        inner.adjust_counter(scan_id, previous, -1);
        Ok(())
    }

    async fn reset_jobs_from_stale_workers(
        &self,
        threshold: Duration,
    ) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        let cutoff = chrono::Duration::from_std(threshold).unwrap_or(chrono::Duration::MAX);

        let stale: Vec<String> = inner
            .workers
            .values()
            .filter(|w| w.status == WorkerStatus::Running && w.is_stale(cutoff, now))
            .map(|w| w.id.clone())
            .collect();

        let mut reset = 0u64;
        for worker_id in &stale {
            if let Some(worker) = inner.workers.get_mut(worker_id) {
                worker.status = WorkerStatus::Stopped;
            }
            let affected: Vec<Uuid> = inner
                .jobs
                .iter()
                .filter(|j| {
                    j.status == JobStatus::Running && j.claimed_by.as_deref() == Some(worker_id)
                })
                .map(|j| j.id)
                .collect();
            for job_id in affected {
                let scan_id = {
                    let job = inner.job_mut(job_id)?;
                    job.status = JobStatus::Pending;
                    job.claimed_by = None;
                    job.claimed_at = None;
                    job.last_heartbeat = None;
                    job.scan_id
                };
                inner.adjust_counter(scan_id, JobStatus::Running, -1);
                inner.adjust_counter(scan_id, JobStatus::Pending, 1);
                reset += 1;
            }
        }
        Ok(reset)
    }

    async fn scan_job_stats(&self, scan_id: Uuid) -> Result<JobStats, StoreError> {
        let inner = self.inner.lock().await;
        let mut stats = JobStats::default();
        for job in inner.jobs.iter().filter(|j| j.scan_id == scan_id) {
            match job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Running => stats.running += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
                JobStatus::Cancelled => stats.cancelled += 1,
            }
        }
        Ok(stats)
    }

    async fn register_worker(&self, node: &WorkerNode) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.workers.insert(node.id.clone(), node.clone());
        Ok(())
    }

    async fn worker_seen(&self, worker_id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let worker = inner
            .workers
            .get_mut(worker_id)
            .ok_or(StoreError::NotFound {
                entity: "worker",
                id: worker_id.to_string(),
            })?;
        worker.last_seen_at = Utc::now();
        Ok(())
    }

    async fn stop_worker(&self, worker_id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if let Some(worker) = inner.workers.get_mut(worker_id) {
            worker.status = WorkerStatus::Stopped;
        }
        Ok(())
    }

    async fn save_history(&self, history: &mut History) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.next_history_id += 1;
        history.id = inner.next_history_id;
        inner.histories.push(history.clone());
        Ok(())
    }

    async fn count_scan_histories(&self, scan_id: Uuid) -> Result<i64, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .histories
            .iter()
            .filter(|h| h.scan_id == Some(scan_id))
            .count() as i64)
    }

    async fn save_issue(&self, issue: &Issue) -> Result<(), StoreError> {
        self.inner.lock().await.issues.push(issue.clone());
        Ok(())
    }

    async fn save_oob_test(&self, test: &OobTest) -> Result<(), StoreError> {
        self.inner.lock().await.oob_tests.push(test.clone());
        Ok(())
    }

    async fn find_oob_test_for_interaction(
        &self,
        full_id: &str,
    ) -> Result<Option<OobTest>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .oob_tests
            .iter()
            .find(|t| full_id.starts_with(&t.correlation_full_id))
            .cloned())
    }

    async fn save_oob_interaction(
        &self,
        interaction: &OobInteraction,
    ) -> Result<(), StoreError> {
        self.inner
            .lock()
            .await
            .oob_interactions
            .push(interaction.clone());
        Ok(())
    }

    async fn save_jwt(&self, jwt: &Jwt) -> Result<(), StoreError> {
        self.inner.lock().await.jwts.push(jwt.clone());
        Ok(())
    }

    async fn save_websocket_connection(
        &self,
        connection: &WebSocketConnection,
    ) -> Result<(), StoreError> {
        self.inner
            .lock()
            .await
            .websocket_connections
            .push(connection.clone());
        Ok(())
    }

    async fn save_websocket_message(
        &self,
        message: &WebSocketMessage,
    ) -> Result<(), StoreError> {
        self.inner
            .lock()
            .await
            .websocket_messages
            .push(message.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use pretty_assertions::assert_eq;

    fn options() -> ScanOptions {
        ScanOptions::new(1, vec!["http://example.test/".to_string()])
    }

    async fn store_with_scan() -> (Arc<MemoryStore>, Scan) {
        let store = Arc::new(MemoryStore::new());
        let scan = store.create_scan(options()).await.unwrap();
        (store, scan)
    }

    #[tokio::test]
    async fn create_scan_seeds_one_job_per_start_url() {
        let store = MemoryStore::new();
        let scan = store
            .create_scan(ScanOptions::new(
                1,
                vec![
                    "http://a.test/".to_string(),
                    "http://b.test/".to_string(),
                ],
            ))
            .await
            .unwrap();
        assert_eq!(scan.status, ScanStatus::Pending);
        assert_eq!(scan.pending_jobs, 2);
        let stats = store.scan_job_stats(scan.id).await.unwrap();
        assert_eq!(stats.pending, 2);
    }

    #[tokio::test]
    async fn claim_is_exclusive_under_concurrency() {
        let (store, _scan) = store_with_scan().await;

        let mut handles = Vec::new();
        for i in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .claim_next_job(&format!("w{i}"), &JobFilter::default())
                    .await
                    .unwrap()
            }));
        }

        let mut claims = 0;
        for handle in handles {
            if handle.await.unwrap().is_some() {
                claims += 1;
            }
        }
        assert_eq!(claims, 1);
    }

    #[tokio::test]
    async fn first_claim_moves_scan_to_running() {
        let (store, scan) = store_with_scan().await;
        store
            .claim_next_job("w1", &JobFilter::default())
            .await
            .unwrap()
            .unwrap();
        let scan = store.get_scan(scan.id).await.unwrap().unwrap();
        assert_eq!(scan.status, ScanStatus::Running);
        assert_eq!(scan.running_jobs, 1);
        assert_eq!(scan.pending_jobs, 0);
    }

    #[tokio::test]
    async fn scan_filter_isolates_claims() {
        let store = MemoryStore::new();
        let scan_a = store.create_scan(options()).await.unwrap();
        let scan_b = store.create_scan(options()).await.unwrap();

        let claimed = store
            .claim_next_job("w1", &JobFilter::for_scan(scan_b.id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.scan_id, scan_b.id);
        assert_ne!(claimed.scan_id, scan_a.id);
    }

    #[tokio::test]
    async fn heartbeat_rejects_foreign_worker() {
        let (store, _scan) = store_with_scan().await;
        let job = store
            .claim_next_job("w1", &JobFilter::default())
            .await
            .unwrap()
            .unwrap();

        assert!(store.heartbeat("w1", job.id).await.is_ok());
        let err = store.heartbeat("w2", job.id).await.unwrap_err();
        assert!(matches!(err, StoreError::NotClaimOwner { .. }));
    }

    #[tokio::test]
    async fn complete_job_advances_counters() {
        let (store, scan) = store_with_scan().await;
        let job = store
            .claim_next_job("w1", &JobFilter::default())
            .await
            .unwrap()
            .unwrap();
        store
            .complete_job(job.id, JobOutcome::Completed)
            .await
            .unwrap();

        let scan = store.get_scan(scan.id).await.unwrap().unwrap();
        assert_eq!(scan.completed_jobs, 1);
        assert_eq!(scan.running_jobs, 0);

        // Terminal jobs cannot transition again.
        let err = store
            .complete_job(job.id, JobOutcome::Failed { reason: "x".into() })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::IllegalTransition { .. }));
    }

    #[tokio::test]
    async fn stale_worker_jobs_are_reset() {
        let (store, _scan) = store_with_scan().await;
        let mut node = WorkerNode::new("w1", 1);
        node.last_seen_at = Utc::now() - chrono::Duration::minutes(10);
        store.register_worker(&node).await.unwrap();

        let job = store
            .claim_next_job("w1", &JobFilter::default())
            .await
            .unwrap()
            .unwrap();
        // The claim refreshed last-seen; age it again.
        {
            let mut inner = store.inner.lock().await;
            inner.workers.get_mut("w1").unwrap().last_seen_at =
                Utc::now() - chrono::Duration::minutes(10);
        }

        let reset = store
            .reset_jobs_from_stale_workers(Duration::from_secs(120))
            .await
            .unwrap();
        assert_eq!(reset, 1);

        let job = store.job(job.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.claimed_by, None);

        // The job is claimable again, by a different node.
        let reclaimed = store
            .claim_next_job("w2", &JobFilter::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reclaimed.id, job.id);
    }

    #[tokio::test]
    async fn fresh_workers_are_untouched_by_reaper() {
        let (store, _scan) = store_with_scan().await;
        store
            .register_worker(&WorkerNode::new("w1", 1))
            .await
            .unwrap();
        store
            .claim_next_job("w1", &JobFilter::default())
            .await
            .unwrap()
            .unwrap();

        let reset = store
            .reset_jobs_from_stale_workers(Duration::from_secs(120))
            .await
            .unwrap();
        assert_eq!(reset, 0);
    }

    #[tokio::test]
    async fn cancel_scan_cancels_pending_and_blocks_claims() {
        let store = MemoryStore::new();
        let scan = store
            .create_scan(ScanOptions::new(
                1,
                vec![
                    "http://a.test/".to_string(),
                    "http://b.test/".to_string(),
                ],
            ))
            .await
            .unwrap();

        store.cancel_scan(scan.id).await.unwrap();

        let scan = store.get_scan(scan.id).await.unwrap().unwrap();
        assert_eq!(scan.status, ScanStatus::Cancelled);
        assert!(
            store
                .claim_next_job("w1", &JobFilter::default())
                .await
                .unwrap()
                .is_none()
        );
        let stats = store.scan_job_stats(scan.id).await.unwrap();
        assert_eq!(stats.cancelled, 2);
    }

    #[tokio::test]
    async fn oob_test_matched_by_full_id_prefix() {
        let store = MemoryStore::new();
        let test = OobTest::new(1, "ssti", "http://a.test/", "abcdef0123456789");
        store.save_oob_test(&test).await.unwrap();

        let hit = store
            .find_oob_test_for_interaction("abcdef0123456789zzzz")
            .await
            .unwrap();
        assert_eq!(hit.unwrap().id, test.id);

        let miss = store
            .find_oob_test_for_interaction("ffffffffffffffffzzzz")
            .await
            .unwrap();
        assert!(miss.is_none());
    }

    #[tokio::test]
    async fn save_history_assigns_ids() {
        let store = MemoryStore::new();
        let mut h1 = History::new(
            1,
            "GET",
            "http://example.test/",
            crate::models::HistorySource::Crawler,
        );
        let mut h2 = h1.clone();
        store.save_history(&mut h1).await.unwrap();
        store.save_history(&mut h2).await.unwrap();
        assert_eq!(h1.id, 1);
        assert_eq!(h2.id, 2);
    }
}
