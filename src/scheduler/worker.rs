//! The worker loop: claim, dispatch, heartbeat, complete.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::Semaphore;

use crate::cancel::CancelFlag;
use crate::checks::{CheckHandles, CheckRegistry};
use crate::db::ScanStore;
use crate::error::{CheckError, StoreError};
use crate::models::{JobFilter, JobOutcome, ScanJob, ScanStatus};

const RETRY_BACKOFF_BASE: Duration = Duration::from_millis(500);
const RETRY_BACKOFF_MAX: Duration = Duration::from_secs(30);

/// One claim-loop slot inside a node.
pub(crate) struct Worker {
    pub slot: usize,
    pub node_id: String,
    pub store: Arc<dyn ScanStore>,
    pub registry: Arc<CheckRegistry>,
    pub handles: CheckHandles,
    pub filter: JobFilter,
    pub heartbeat_interval: Duration,
    pub claim_backoff: Duration,
    pub claim_backoff_max: Duration,
    /// Bounds in-flight claims across the pool when set.
    pub concurrency: Option<Arc<Semaphore>>,
    pub cancel: CancelFlag,
}

impl Worker {
    pub async fn run(self) {
        let mut backoff = self.claim_backoff;
        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            let permit = match &self.concurrency {
                Some(semaphore) => {
                    let semaphore = semaphore.clone();
                    tokio::select! {
                        permit = semaphore.acquire_owned() => match permit {
                            Ok(permit) => Some(permit),
                            Err(_) => break,
                        },
                        _ = self.cancel.cancelled() => break,
                    }
                }
                None => None,
            };

            match self.store.claim_next_job(&self.node_id, &self.filter).await {
                Ok(Some(job)) => {
                    backoff = self.claim_backoff;
                    self.execute(job).await;
                }
                Ok(None) => {
                    drop(permit);
                    self.sleep_with_jitter(backoff).await;
                    backoff = (backoff * 2).min(self.claim_backoff_max);
                }
                Err(e) => {
                    // Store outage: pause claiming until it recovers.
                    drop(permit);
                    tracing::warn!(slot = self.slot, "claim failed, backing off: {e}");
                    self.sleep_with_jitter(backoff).await;
                    backoff = (backoff * 2).min(self.claim_backoff_max);
                }
            }
        }
        tracing::debug!(slot = self.slot, "worker stopped");
    }

    async fn sleep_with_jitter(&self, base: Duration) {
        let jitter = rand::thread_rng().gen_range(0..=base.as_millis() as u64 / 2);
        let nap = base + Duration::from_millis(jitter);
        tokio::select! {
            _ = tokio::time::sleep(nap) => {}
            _ = self.cancel.cancelled() => {}
        }
    }

    async fn execute(&self, job: ScanJob) {
        let scan = match self.store.get_scan(job.scan_id).await {
            Ok(Some(scan)) => scan,
            Ok(None) => {
                self.finish(
                    &job,
                    JobOutcome::Failed {
                        reason: "owning scan disappeared".to_string(),
                    },
                )
                .await;
                return;
            }
            Err(e) => {
                tracing::warn!(job_id = %job.id, "cannot load scan, requeueing: {e}");
                let _ = self.store.requeue_job(job.id).await;
                return;
            }
        };
        if scan.status == ScanStatus::Cancelled {
            let _ = self.store.cancel_job(job.id).await;
            return;
        }

        // Job-level cancellation, tied to the worker's own lifecycle.
        let (job_cancel, job_flag) = self.cancel.child();
        let watchdog = self.spawn_watchdog(job.clone(), job_cancel.clone());

        let ctx = self.handles.context(scan, job.clone(), job_flag);
        let check = self.registry.get(job.kind);
        let outcome = match check {
            Some(check) => {
                // Panics are isolated to the job.
                tokio::spawn(async move { check.run(&ctx).await }).await
            }
            None => Ok(Err(CheckError::UnknownKind(job.kind.to_string()))),
        };
        watchdog.abort();

        match outcome {
            Ok(Ok(output)) => {
                for issue in &output.issues {
                    if let Err(e) = self.store.save_issue(issue).await {
                        tracing::warn!(code = %issue.code, "failed to persist issue: {e}");
                    }
                }
                if !output.derived_jobs.is_empty() {
                    if let Err(e) = self.store.enqueue_jobs(&output.derived_jobs).await {
                        tracing::warn!("failed to enqueue derived jobs: {e}");
                    }
                }
                tracing::debug!(
                    job_id = %job.id,
                    kind = %job.kind,
                    issues = output.issues.len(),
                    "job completed"
                );
                self.finish(&job, JobOutcome::Completed).await;
            }
            Ok(Err(CheckError::Cancelled)) => self.abandon(&job).await,
            Ok(Err(e)) => self.retry_or_fail(&job, e.to_string()).await,
            Err(join_error) => {
                let reason = if join_error.is_panic() {
                    "check panicked".to_string()
                } else {
                    "check task aborted".to_string()
                };
                tracing::warn!(job_id = %job.id, kind = %job.kind, "{reason}");
                self.finish(&job, JobOutcome::Failed { reason }).await;
            }
        }
    }

    /// Heartbeats while the job runs; trips the job flag when the scan is
    /// cancelled or the claim was lost to the reaper.
    fn spawn_watchdog(
        &self,
        job: ScanJob,
        job_cancel: crate::cancel::CancelHandle,
    ) -> tokio::task::JoinHandle<()> {
        let store = self.store.clone();
        let node_id = self.node_id.clone();
        let interval = self.heartbeat_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match store.heartbeat(&node_id, job.id).await {
                    Ok(()) => {}
                    Err(StoreError::NotClaimOwner { .. }) => {
                        tracing::warn!(job_id = %job.id, "claim lost, abandoning job");
                        job_cancel.cancel();
                        return;
                    }
                    Err(e) => tracing::warn!(job_id = %job.id, "heartbeat failed: {e}"),
                }
                match store.get_scan(job.scan_id).await {
                    Ok(Some(scan)) if scan.status == ScanStatus::Cancelled => {
                        job_cancel.cancel();
                        return;
                    }
                    _ => {}
                }
            }
        })
    }

    /// A cancelled check: scan-level cancellation marks the job cancelled,
    /// anything else puts it back for another node.
    async fn abandon(&self, job: &ScanJob) {
        let scan_cancelled = matches!(
            self.store.get_scan(job.scan_id).await,
            Ok(Some(scan)) if scan.status == ScanStatus::Cancelled
        );
        let result = if scan_cancelled {
            self.store.cancel_job(job.id).await
        } else {
            self.store.requeue_job(job.id).await
        };
        if let Err(e) = result {
            tracing::warn!(job_id = %job.id, "failed to hand back cancelled job: {e}");
        }
    }

    async fn retry_or_fail(&self, job: &ScanJob, reason: String) {
        if job.retryable() {
            let exponent = job.attempts.saturating_sub(1).min(6);
            let backoff = (RETRY_BACKOFF_BASE * 2u32.pow(exponent)).min(RETRY_BACKOFF_MAX);
            tracing::debug!(
                job_id = %job.id,
                attempt = job.attempts,
                "job failed, retrying in {backoff:?}: {reason}"
            );
            self.sleep_with_jitter(backoff).await;
            if let Err(e) = self.store.requeue_job(job.id).await {
                tracing::warn!(job_id = %job.id, "failed to requeue job: {e}");
            }
        } else {
            tracing::debug!(job_id = %job.id, "job failed permanently: {reason}");
            self.finish(job, JobOutcome::Failed { reason }).await;
        }
    }

    async fn finish(&self, job: &ScanJob, outcome: JobOutcome) {
        if let Err(e) = self.store.complete_job(job.id, outcome).await {
            tracing::warn!(job_id = %job.id, "failed to record job outcome: {e}");
        }
    }
}
