//! Scan manager lifecycle: registration, worker pool, heartbeat ticker,
//! stale-worker reaper, graceful stop.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::cancel::{CancelFlag, CancelHandle, cancel_pair};
use crate::checks::{CheckHandles, CheckRegistry};
use crate::db::ScanStore;
use crate::error::StoreError;
use crate::models::{JobFilter, JobStats, ScanStatus, WorkerNode};
use crate::scheduler::worker::Worker;

/// Node-level scheduler tuning.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Identifier this node registers (and claims) under.
    pub node_id: String,
    pub worker_count: usize,
    pub heartbeat_interval: Duration,
    pub reaper_interval: Duration,
    /// Base sleep between empty claims; doubles up to the max, with
    /// jitter.
    pub claim_backoff: Duration,
    pub claim_backoff_max: Duration,
    /// How long `stop` waits for workers to finish their current job.
    pub stop_grace: Duration,
    /// Isolated mode: claim only this scan's jobs.
    pub scan_filter: Option<Uuid>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            node_id: format!("node-{}", Uuid::new_v4()),
            worker_count: 4,
            heartbeat_interval: Duration::from_secs(30),
            reaper_interval: Duration::from_secs(120),
            claim_backoff: Duration::from_millis(500),
            claim_backoff_max: Duration::from_secs(5),
            stop_grace: Duration::from_secs(10),
            scan_filter: None,
        }
    }
}

impl SchedulerConfig {
    pub fn isolated(scan_id: Uuid) -> Self {
        Self {
            scan_filter: Some(scan_id),
            ..Default::default()
        }
    }

    pub fn with_workers(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count.max(1);
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_claim_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.claim_backoff = base;
        self.claim_backoff_max = max;
        self
    }

    /// The staleness threshold the reaper applies.
    pub fn stale_threshold(&self) -> Duration {
        self.heartbeat_interval * 2
    }
}

/// Supervises a worker pool over the claim queue.
pub struct ScanManager {
    config: SchedulerConfig,
    store: Arc<dyn ScanStore>,
    registry: Arc<CheckRegistry>,
    handles: CheckHandles,
    cancel_handle: CancelHandle,
    cancel_flag: CancelFlag,
    tasks: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl ScanManager {
    pub fn new(
        config: SchedulerConfig,
        store: Arc<dyn ScanStore>,
        registry: Arc<CheckRegistry>,
        handles: CheckHandles,
    ) -> Self {
        let (cancel_handle, cancel_flag) = cancel_pair();
        Self {
            config,
            store,
            registry,
            handles,
            cancel_handle,
            cancel_flag,
            tasks: tokio::sync::Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    /// Register the node and launch workers, heartbeat ticker and reaper.
    pub async fn start(&self) -> Result<(), StoreError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let node = WorkerNode::new(self.config.node_id.clone(), self.config.worker_count);
        self.store.register_worker(&node).await?;
        tracing::info!(
            node_id = %node.id,
            workers = self.config.worker_count,
            isolated = self.config.scan_filter.is_some(),
            "scan manager starting"
        );

        // Scan-scoped claim bound, when the isolated scan asks for one.
        let concurrency = match self.config.scan_filter {
            Some(scan_id) => match self.store.get_scan(scan_id).await? {
                Some(scan) => scan
                    .options
                    .max_concurrent_jobs
                    .map(|n| Arc::new(Semaphore::new(n))),
                None => None,
            },
            None => None,
        };

        let filter = JobFilter {
            scan_id: self.config.scan_filter,
            kinds: None,
        };

        let mut tasks = self.tasks.lock().await;
        for slot in 0..self.config.worker_count {
            let worker = Worker {
                slot,
                node_id: self.config.node_id.clone(),
                store: self.store.clone(),
                registry: self.registry.clone(),
                handles: self.handles.clone(),
                filter: filter.clone(),
                heartbeat_interval: self.config.heartbeat_interval,
                claim_backoff: self.config.claim_backoff,
                claim_backoff_max: self.config.claim_backoff_max,
                concurrency: concurrency.clone(),
                cancel: self.cancel_flag.clone(),
            };
            tasks.push(tokio::spawn(worker.run()));
        }
        tasks.push(self.spawn_heartbeat());
        tasks.push(self.spawn_reaper());
        Ok(())
    }

    fn spawn_heartbeat(&self) -> JoinHandle<()> {
        let store = self.store.clone();
        let node_id = self.config.node_id.clone();
        let interval = self.config.heartbeat_interval;
        let cancel = self.cancel_flag.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = store.worker_seen(&node_id).await {
                            tracing::warn!("node heartbeat failed: {e}");
                        }
                    }
                }
            }
        })
    }

    fn spawn_reaper(&self) -> JoinHandle<()> {
        let store = self.store.clone();
        let interval = self.config.reaper_interval;
        let threshold = self.config.stale_threshold();
        let cancel = self.cancel_flag.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The immediate first tick would reap nodes that simply have
            // not heartbeat yet.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        match store.reset_jobs_from_stale_workers(threshold).await {
                            Ok(0) => {}
                            Ok(reset) => {
                                tracing::info!(reset, "reclaimed jobs from stale workers");
                            }
                            Err(e) => tracing::warn!("stale-worker sweep failed: {e}"),
                        }
                    }
                }
            }
        })
    }

    /// Poll job stats until every job of `scan_id` is terminal (or this
    /// manager is stopped).
    pub async fn wait_for_scan(
        &self,
        scan_id: Uuid,
        poll: Duration,
    ) -> Result<JobStats, StoreError> {
        loop {
            let stats = self.store.scan_job_stats(scan_id).await?;
            if stats.all_terminal() || self.cancel_flag.is_cancelled() {
                return Ok(stats);
            }
            tokio::select! {
                _ = tokio::time::sleep(poll) => {}
                _ = self.cancel_flag.cancelled() => {}
            }
        }
    }

    /// Move a scan whose jobs are all terminal into its terminal status.
    /// Cancelled scans stay cancelled; everything else completes, with
    /// failed jobs merely counted.
    pub async fn finalize_scan(&self, scan_id: Uuid) -> Result<ScanStatus, StoreError> {
        let scan = self
            .store
            .get_scan(scan_id)
            .await?
            .ok_or(StoreError::NotFound {
                entity: "scan",
                id: scan_id.to_string(),
            })?;
        if scan.status.is_terminal() {
            return Ok(scan.status);
        }

        let stats = self.store.scan_job_stats(scan_id).await?;
        if !stats.all_terminal() {
            return Ok(scan.status);
        }
        self.store
            .update_scan_status(scan_id, ScanStatus::Completed)
            .await?;
        tracing::info!(
            %scan_id,
            completed = stats.completed,
            failed = stats.failed,
            cancelled = stats.cancelled,
            "scan finalized"
        );
        Ok(ScanStatus::Completed)
    }

    /// Signal workers to finish their current job, wait out the grace
    /// window, abort stragglers, and mark the node stopped.
    pub async fn stop(&self) {
        if !self.started.load(Ordering::SeqCst) {
            return;
        }
        self.cancel_handle.cancel();

        let mut tasks = self.tasks.lock().await;
        for mut task in tasks.drain(..) {
            if tokio::time::timeout(self.config.stop_grace, &mut task)
                .await
                .is_err()
            {
                tracing::warn!("worker did not stop within grace window, aborting");
                task.abort();
            }
        }
        drop(tasks);

        if let Err(e) = self.store.stop_worker(&self.config.node_id).await {
            tracing::warn!("failed to mark node stopped: {e}");
        }
        tracing::info!(node_id = %self.config.node_id, "scan manager stopped");
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::browser::{BrowserConfig, BrowserPool};
    use crate::checks::{Check, CheckContext, CheckOutput};
    use crate::db::MemoryStore;
    use crate::error::CheckError;
    use crate::executor::RequestExecutor;
    use crate::interactions::{InteractionsConfig, InteractionsManager};
    use crate::models::{JobKind, JobStatus, Scan, ScanJob, ScanOptions};
    use crate::payloads::PayloadGenerators;

    #[derive(Clone, Copy)]
    enum Behavior {
        Succeed,
        Derive(JobKind),
        Fail,
        Panic,
        WaitForCancel,
    }

    struct StubCheck {
        kind: JobKind,
        behavior: Behavior,
    }

    #[async_trait]
    impl Check for StubCheck {
        fn kind(&self) -> JobKind {
            self.kind
        }

        async fn run(&self, ctx: &CheckContext) -> Result<CheckOutput, CheckError> {
            match self.behavior {
                Behavior::Succeed => Ok(CheckOutput::default()),
                Behavior::Derive(kind) => {
                    let mut output = CheckOutput::default();
                    if ctx.job.kind != kind {
                        output.derived_jobs.push(
                            ScanJob::new(ctx.scan.id, kind, ctx.job.target.clone())
                                .with_max_retries(0),
                        );
                    }
                    Ok(output)
                }
                Behavior::Fail => Err(CheckError::Other("stub failure".to_string())),
                Behavior::Panic => panic!("stub panic"),
                Behavior::WaitForCancel => {
                    ctx.cancel.cancelled().await;
                    Err(CheckError::Cancelled)
                }
            }
        }
    }

    fn registry(entries: &[(JobKind, Behavior)]) -> Arc<CheckRegistry> {
        let mut registry = CheckRegistry::empty();
        for (kind, behavior) in entries {
            registry.register(Arc::new(StubCheck {
                kind: *kind,
                behavior: *behavior,
            }));
        }
        Arc::new(registry)
    }

    fn handles(store: Arc<MemoryStore>) -> CheckHandles {
        let (tx, mut rx) = tokio::sync::mpsc::channel(64);
        tokio::spawn(async move { while rx.recv().await.is_some() {} });
        CheckHandles {
            executor: Arc::new(RequestExecutor::new(reqwest::Client::new(), store.clone())),
            browsers: Arc::new(BrowserPool::http(BrowserConfig::default())),
            interactions: Arc::new(InteractionsManager::http(InteractionsConfig::new(
                "https://oob.invalid",
            ))),
            payloads: Arc::new(PayloadGenerators::new()),
            store,
            hijack_events: tx,
        }
    }

    fn fast_config() -> SchedulerConfig {
        SchedulerConfig::default()
            .with_workers(2)
            .with_heartbeat_interval(Duration::from_millis(50))
            .with_claim_backoff(Duration::from_millis(10), Duration::from_millis(50))
    }

    async fn scan_with_urls(
        store: &MemoryStore,
        urls: &[&str],
        max_retries: u32,
    ) -> Scan {
        let mut options =
            ScanOptions::new(1, urls.iter().map(|u| u.to_string()).collect());
        options.max_retries = max_retries;
        store.create_scan(options).await.unwrap()
    }

    #[tokio::test]
    async fn scan_runs_to_completion() {
        let store = Arc::new(MemoryStore::new());
        let scan =
            scan_with_urls(&store, &["http://a.test/", "http://b.test/"], 0).await;
        let manager = ScanManager::new(
            fast_config(),
            store.clone(),
            registry(&[(JobKind::Crawl, Behavior::Succeed)]),
            handles(store.clone()),
        );

        manager.start().await.unwrap();
        let stats = manager
            .wait_for_scan(scan.id, Duration::from_millis(20))
            .await
            .unwrap();
        assert_eq!(stats.completed, 2);
        assert_eq!(stats.total(), 2);

        let status = manager.finalize_scan(scan.id).await.unwrap();
        assert_eq!(status, ScanStatus::Completed);
        let scan = store.get_scan(scan.id).await.unwrap().unwrap();
        assert_eq!(scan.completed_jobs, 2);
        manager.stop().await;
    }

    #[tokio::test]
    async fn derived_jobs_are_dispatched() {
        let store = Arc::new(MemoryStore::new());
        let scan = scan_with_urls(&store, &["http://a.test/"], 0).await;
        let manager = ScanManager::new(
            fast_config(),
            store.clone(),
            registry(&[
                (JobKind::Crawl, Behavior::Derive(JobKind::PassiveHeaders)),
                (JobKind::PassiveHeaders, Behavior::Succeed),
            ]),
            handles(store.clone()),
        );

        manager.start().await.unwrap();
        let stats = manager
            .wait_for_scan(scan.id, Duration::from_millis(20))
            .await
            .unwrap();
        assert_eq!(stats.completed, 2);

        let kinds: Vec<JobKind> = store
            .jobs_for_scan(scan.id)
            .await
            .iter()
            .map(|j| j.kind)
            .collect();
        assert!(kinds.contains(&JobKind::PassiveHeaders));
        manager.stop().await;
    }

    #[tokio::test]
    async fn exhausted_retries_fail_the_job_not_the_scan() {
        let store = Arc::new(MemoryStore::new());
        let scan = scan_with_urls(&store, &["http://a.test/"], 0).await;
        let manager = ScanManager::new(
            fast_config(),
            store.clone(),
            registry(&[(JobKind::Crawl, Behavior::Fail)]),
            handles(store.clone()),
        );

        manager.start().await.unwrap();
        let stats = manager
            .wait_for_scan(scan.id, Duration::from_millis(20))
            .await
            .unwrap();
        assert_eq!(stats.failed, 1);
        assert_eq!(
            manager.finalize_scan(scan.id).await.unwrap(),
            ScanStatus::Completed
        );
        manager.stop().await;
    }

    #[tokio::test]
    async fn panicking_check_fails_its_job_and_worker_survives() {
        let store = Arc::new(MemoryStore::new());
        let scan =
            scan_with_urls(&store, &["http://a.test/", "http://b.test/"], 0).await;
        let manager = ScanManager::new(
            fast_config().with_workers(1),
            store.clone(),
            registry(&[(JobKind::Crawl, Behavior::Panic)]),
            handles(store.clone()),
        );

        manager.start().await.unwrap();
        let stats = manager
            .wait_for_scan(scan.id, Duration::from_millis(20))
            .await
            .unwrap();
        // Both jobs were processed by the same worker despite the panics.
        assert_eq!(stats.failed, 2);
        manager.stop().await;
    }

    #[tokio::test]
    async fn cancel_scan_cancels_running_jobs() {
        let store = Arc::new(MemoryStore::new());
        let scan =
            scan_with_urls(&store, &["http://a.test/", "http://b.test/"], 0).await;
        let manager = ScanManager::new(
            fast_config(),
            store.clone(),
            registry(&[(JobKind::Crawl, Behavior::WaitForCancel)]),
            handles(store.clone()),
        );
        manager.start().await.unwrap();

        // Wait for both workers to pick their jobs up.
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let stats = store.scan_job_stats(scan.id).await.unwrap();
                if stats.running == 2 {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("jobs should start");

        store.cancel_scan(scan.id).await.unwrap();

        let stats = manager
            .wait_for_scan(scan.id, Duration::from_millis(20))
            .await
            .unwrap();
        assert_eq!(stats.cancelled, 2);
        assert_eq!(stats.completed, 0);
        assert_eq!(stats.failed, 0);

        let scan = store.get_scan(scan.id).await.unwrap().unwrap();
        assert_eq!(scan.status, ScanStatus::Cancelled);
        assert!(
            store
                .claim_next_job("other", &JobFilter::for_scan(scan.id))
                .await
                .unwrap()
                .is_none()
        );
        manager.stop().await;
    }

    #[tokio::test]
    async fn isolated_manager_leaves_other_scans_alone() {
        let store = Arc::new(MemoryStore::new());
        let scan_a = scan_with_urls(&store, &["http://a.test/"], 0).await;
        let scan_b = scan_with_urls(&store, &["http://b.test/"], 0).await;

        let config = SchedulerConfig {
            scan_filter: Some(scan_a.id),
            ..fast_config()
        };
        let manager = ScanManager::new(
            config,
            store.clone(),
            registry(&[(JobKind::Crawl, Behavior::Succeed)]),
            handles(store.clone()),
        );
        manager.start().await.unwrap();

        manager
            .wait_for_scan(scan_a.id, Duration::from_millis(20))
            .await
            .unwrap();
        // Give the isolated workers time to (wrongly) touch the other
        // scan before checking it.
        tokio::time::sleep(Duration::from_millis(100)).await;

        let stats_b = store.scan_job_stats(scan_b.id).await.unwrap();
        assert_eq!(stats_b.pending, 1);
        assert_eq!(stats_b.completed, 0);
        manager.stop().await;
    }

    #[tokio::test]
    async fn reaper_recovers_jobs_from_dead_nodes() {
        let store = Arc::new(MemoryStore::new());
        let scan = scan_with_urls(&store, &["http://a.test/"], 3).await;

        // A node that claimed the job and then died without heartbeats.
        let dead = WorkerNode::new("dead-node", 1);
        store.register_worker(&dead).await.unwrap();
        let claimed = store
            .claim_next_job("dead-node", &JobFilter::default())
            .await
            .unwrap()
            .unwrap();
        store
            .rewind_worker_last_seen("dead-node", chrono::Duration::minutes(10))
            .await;

        let config = SchedulerConfig {
            reaper_interval: Duration::from_millis(50),
            ..fast_config()
        };
        let manager = ScanManager::new(
            config,
            store.clone(),
            registry(&[(JobKind::Crawl, Behavior::Succeed)]),
            handles(store.clone()),
        );
        manager.start().await.unwrap();

        let stats = tokio::time::timeout(
            Duration::from_secs(5),
            manager.wait_for_scan(scan.id, Duration::from_millis(20)),
        )
        .await
        .expect("scan should finish after the reaper frees the job")
        .unwrap();
        assert_eq!(stats.completed, 1);

        let job = store.job(claimed.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.claimed_by.as_deref(), Some(manager.node_id()));
        manager.stop().await;
    }
}
