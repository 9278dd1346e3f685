//! PostgreSQL scan store.
//!
//! Claims use `FOR UPDATE SKIP LOCKED` so competing workers never serialise
//! on the full queue; job transitions and counter updates share one
//! transaction. Migrations live in `migrations/` and are run externally.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use deadpool_postgres::{Config, Pool, Runtime};
use tokio_postgres::types::ToSql;
use tokio_postgres::{NoTls, Row};
use uuid::Uuid;

use crate::config::DatabaseConfig;
use crate::db::ScanStore;
use crate::error::StoreError;
use crate::models::{
    History, Issue, JobFilter, JobOutcome, JobStats, JobStatus, Jwt, OobInteraction, OobTest,
    PayloadContext, Scan, ScanJob, ScanOptions, ScanStatus, TargetDescriptor,
    WebSocketConnection, WebSocketMessage, WorkerNode,
};

/// `ScanStore` backed by PostgreSQL.
pub struct PgStore {
    pool: Pool,
}

impl PgStore {
    /// Create a new store and verify connectivity.
    pub async fn new(config: &DatabaseConfig) -> Result<Self, StoreError> {
        let mut cfg = Config::new();
        cfg.url = Some(config.url().to_string());
        cfg.pool = Some(deadpool_postgres::PoolConfig {
            max_size: config.pool_size,
            ..Default::default()
        });

        let pool = cfg
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| StoreError::Pool(e.to_string()))?;

        // Test connection
        let _ = pool.get().await?;

        Ok(Self { pool })
    }

    /// Migrations are applied out of band.
    pub fn migration_hint() {
        tracing::info!(
            "database migrations are run externally: refinery migrate -p migrations/"
        );
    }

    async fn conn(&self) -> Result<deadpool_postgres::Object, StoreError> {
        Ok(self.pool.get().await?)
    }
}

fn scan_from_row(row: &Row) -> Result<Scan, StoreError> {
    let options: serde_json::Value = row.try_get("options")?;
    let options: ScanOptions = serde_json::from_value(options)?;
    let status: String = row.try_get("status")?;
    Ok(Scan {
        id: row.try_get("id")?,
        workspace_id: row.try_get("workspace_id")?,
        title: row.try_get("title")?,
        status: ScanStatus::from_str(&status).map_err(StoreError::Pool)?,
        options,
        pending_jobs: row.try_get("pending_jobs")?,
        running_jobs: row.try_get("running_jobs")?,
        completed_jobs: row.try_get("completed_jobs")?,
        failed_jobs: row.try_get("failed_jobs")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn job_from_row(row: &Row) -> Result<ScanJob, StoreError> {
    let status: String = row.try_get("status")?;
    let kind: String = row.try_get("kind")?;
    let target: serde_json::Value = row.try_get("target")?;
    let payload: serde_json::Value = row.try_get("payload")?;
    let target: TargetDescriptor = serde_json::from_value(target)?;
    let payload: PayloadContext = serde_json::from_value(payload)?;
    let depth: i32 = row.try_get("depth")?;
    let attempts: i32 = row.try_get("attempts")?;
    let max_retries: i32 = row.try_get("max_retries")?;
    Ok(ScanJob {
        id: row.try_get("id")?,
        scan_id: row.try_get("scan_id")?,
        status: JobStatus::from_str(&status).map_err(StoreError::Pool)?,
        kind: kind.parse().map_err(StoreError::Pool)?,
        target,
        payload,
        depth: depth as usize,
        claimed_by: row.try_get("claimed_by")?,
        claimed_at: row.try_get("claimed_at")?,
        last_heartbeat: row.try_get("last_heartbeat")?,
        attempts: attempts as u32,
        max_retries: max_retries as u32,
        created_at: row.try_get("created_at")?,
    })
}

async fn insert_job(
    tx: &tokio_postgres::Transaction<'_>,
    job: &ScanJob,
) -> Result<(), StoreError> {
    tx.execute(
        "INSERT INTO scan_jobs \
         (id, scan_id, status, kind, target, payload, depth, attempts, max_retries, created_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        &[
            &job.id,
            &job.scan_id,
            &job.status.as_str(),
            &job.kind.as_str(),
            &serde_json::to_value(&job.target)?,
            &serde_json::to_value(&job.payload)?,
            &(job.depth as i32),
            &(job.attempts as i32),
            &(job.max_retries as i32),
            &job.created_at,
        ],
    )
    .await?;
    Ok(())
}

#[async_trait]
impl ScanStore for PgStore {
    async fn create_scan(&self, options: ScanOptions) -> Result<Scan, StoreError> {
        let mut client = self.conn().await?;
        let tx = client.transaction().await?;

        let mut scan = Scan::new(options);
        let seeds: Vec<ScanJob> = scan
            .options
            .start_urls
            .iter()
            .map(|url| {
                ScanJob::new(
                    scan.id,
                    crate::models::JobKind::Crawl,
                    TargetDescriptor::get(url.clone()),
                )
                .with_max_retries(scan.options.max_retries)
            })
            .collect();
        scan.pending_jobs = seeds.len() as i64;

        tx.execute(
            "INSERT INTO scans \
             (id, workspace_id, title, status, options, pending_jobs, running_jobs, \
              completed_jobs, failed_jobs, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, 0, 0, 0, $7, $7)",
            &[
                &scan.id,
                &scan.workspace_id,
                &scan.title,
                &scan.status.as_str(),
                &serde_json::to_value(&scan.options)?,
                &scan.pending_jobs,
                &scan.created_at,
            ],
        )
        .await?;
        for job in &seeds {
            insert_job(&tx, job).await?;
        }

        tx.commit().await?;
        Ok(scan)
    }

    async fn get_scan(&self, scan_id: Uuid) -> Result<Option<Scan>, StoreError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt("SELECT * FROM scans WHERE id = $1", &[&scan_id])
            .await?;
        row.as_ref().map(scan_from_row).transpose()
    }

    async fn update_scan_status(
        &self,
        scan_id: Uuid,
        status: ScanStatus,
    ) -> Result<(), StoreError> {
        let mut client = self.conn().await?;
        let tx = client.transaction().await?;

        let row = tx
            .query_opt("SELECT * FROM scans WHERE id = $1 FOR UPDATE", &[&scan_id])
            .await?
            .ok_or(StoreError::NotFound {
                entity: "scan",
                id: scan_id.to_string(),
            })?;
        let scan = scan_from_row(&row)?;
        if !scan.can_transition_to(status) {
            return Err(StoreError::IllegalTransition {
                entity: "scan",
                from: scan.status.to_string(),
                to: status.to_string(),
            });
        }

        tx.execute(
            "UPDATE scans SET status = $2, updated_at = now() WHERE id = $1",
            &[&scan_id, &status.as_str()],
        )
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn cancel_scan(&self, scan_id: Uuid) -> Result<(), StoreError> {
        let mut client = self.conn().await?;
        let tx = client.transaction().await?;

        let updated = tx
            .execute(
                "UPDATE scans SET status = 'cancelled', pending_jobs = 0, updated_at = now() \
                 WHERE id = $1 AND status NOT IN ('cancelled', 'completed', 'failed')",
                &[&scan_id],
            )
            .await?;
        if updated > 0 {
            tx.execute(
                "UPDATE scan_jobs SET status = 'cancelled' \
                 WHERE scan_id = $1 AND status = 'pending'",
                &[&scan_id],
            )
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn enqueue_jobs(&self, jobs: &[ScanJob]) -> Result<usize, StoreError> {
        if jobs.is_empty() {
            return Ok(0);
        }
        let mut client = self.conn().await?;
        let tx = client.transaction().await?;

        for job in jobs {
            insert_job(&tx, job).await?;
            tx.execute(
                "UPDATE scans SET pending_jobs = pending_jobs + 1, updated_at = now() \
                 WHERE id = $1",
                &[&job.scan_id],
            )
            .await?;
        }

        tx.commit().await?;
        Ok(jobs.len())
    }

    async fn claim_next_job(
        &self,
        worker_id: &str,
        filter: &JobFilter,
    ) -> Result<Option<ScanJob>, StoreError> {
        let mut client = self.conn().await?;
        let tx = client.transaction().await?;

        let kinds: Option<Vec<String>> = filter
            .kinds
            .as_ref()
            .map(|ks| ks.iter().map(|k| k.as_str().to_string()).collect());
        let params: [&(dyn ToSql + Sync); 3] = [&filter.scan_id, &kinds, &worker_id];

        let row = tx
            .query_opt(
                "WITH next AS ( \
                   SELECT id FROM scan_jobs \
                   WHERE status = 'pending' AND claimed_by IS NULL \
                     AND ($1::uuid IS NULL OR scan_id = $1) \
                     AND ($2::text[] IS NULL OR kind = ANY($2)) \
                   ORDER BY created_at \
                   FOR UPDATE SKIP LOCKED \
                   LIMIT 1 \
                 ) \
                 UPDATE scan_jobs j \
                 SET status = 'running', claimed_by = $3, claimed_at = now(), \
                     last_heartbeat = now(), attempts = j.attempts + 1 \
                 FROM next WHERE j.id = next.id \
                 RETURNING j.*",
                &params,
            )
            .await?;

        let Some(row) = row else {
            tx.commit().await?;
            return Ok(None);
        };
        let job = job_from_row(&row)?;

        tx.execute(
            "UPDATE scans SET \
               pending_jobs = pending_jobs - 1, running_jobs = running_jobs + 1, \
               status = CASE WHEN status = 'pending' THEN 'running' ELSE status END, \
               updated_at = now() \
             WHERE id = $1",
            &[&job.scan_id],
        )
        .await?;
        tx.execute(
            "UPDATE worker_nodes SET jobs_claimed = jobs_claimed + 1, last_seen_at = now() \
             WHERE id = $1",
            &[&worker_id],
        )
        .await?;

        tx.commit().await?;
        Ok(Some(job))
    }

    async fn heartbeat(&self, worker_id: &str, job_id: Uuid) -> Result<(), StoreError> {
        let conn = self.conn().await?;
        let updated = conn
            .execute(
                "UPDATE scan_jobs SET last_heartbeat = now() \
                 WHERE id = $1 AND claimed_by = $2",
                &[&job_id, &worker_id],
            )
            .await?;
        if updated == 0 {
            return Err(StoreError::NotClaimOwner {
                job_id,
                worker_id: worker_id.to_string(),
            });
        }
        conn.execute(
            "UPDATE worker_nodes SET last_seen_at = now() WHERE id = $1",
            &[&worker_id],
        )
        .await?;
        Ok(())
    }

    async fn complete_job(&self, job_id: Uuid, outcome: JobOutcome) -> Result<(), StoreError> {
        let mut client = self.conn().await?;
        let tx = client.transaction().await?;

        let next = match &outcome {
            JobOutcome::Completed => JobStatus::Completed,
            JobOutcome::Failed { .. } => JobStatus::Failed,
        };
        let row = tx
            .query_opt(
                "UPDATE scan_jobs SET status = $2 \
                 WHERE id = $1 AND status = 'running' \
                 RETURNING scan_id, claimed_by",
                &[&job_id, &next.as_str()],
            )
            .await?
            .ok_or(StoreError::IllegalTransition {
                entity: "job",
                from: "non-running".to_string(),
                to: next.to_string(),
            })?;
        let scan_id: Uuid = row.try_get("scan_id")?;
        let claimed_by: Option<String> = row.try_get("claimed_by")?;

        let (scan_counter, worker_counter) = match next {
            JobStatus::Completed => ("completed_jobs", "jobs_completed"),
            _ => ("failed_jobs", "jobs_failed"),
        };
        let scan_update = format!(
            "UPDATE scans SET running_jobs = running_jobs - 1, \
             {scan_counter} = {scan_counter} + 1, updated_at = now() WHERE id = $1"
        );
        tx.execute(scan_update.as_str(), &[&scan_id]).await?;
        if let Some(worker_id) = claimed_by {
            let worker_update = format!(
                "UPDATE worker_nodes SET {worker_counter} = {worker_counter} + 1 \
                 WHERE id = $1"
            );
            tx.execute(worker_update.as_str(), &[&worker_id]).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn requeue_job(&self, job_id: Uuid) -> Result<(), StoreError> {
        let mut client = self.conn().await?;
        let tx = client.transaction().await?;

        let row = tx
            .query_opt(
                "UPDATE scan_jobs SET status = 'pending', claimed_by = NULL, \
                 claimed_at = NULL, last_heartbeat = NULL \
                 WHERE id = $1 AND status = 'running' \
                 RETURNING scan_id",
                &[&job_id],
            )
            .await?
            .ok_or(StoreError::IllegalTransition {
                entity: "job",
                from: "non-running".to_string(),
                to: JobStatus::Pending.to_string(),
            })?;
        let scan_id: Uuid = row.try_get("scan_id")?;

        tx.execute(
            "UPDATE scans SET running_jobs = running_jobs - 1, \
             pending_jobs = pending_jobs + 1, updated_at = now() WHERE id = $1",
            &[&scan_id],
        )
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn cancel_job(&self, job_id: Uuid) -> Result<(), StoreError> {
        let mut client = self.conn().await?;
        let tx = client.transaction().await?;

        let row = tx
            .query_opt(
                "WITH old AS ( \
                   SELECT id, status FROM scan_jobs \
                   WHERE id = $1 AND status IN ('pending', 'running') \
                   FOR UPDATE \
                 ) \
                 UPDATE scan_jobs j SET status = 'cancelled' \
                 FROM old WHERE j.id = old.id \
                 RETURNING j.scan_id, old.status AS previous",
                &[&job_id],
            )
            .await?;
        if let Some(row) = row {
            let scan_id: Uuid = row.try_get("scan_id")?;
            let previous: String = row.try_get("previous")?;
            let counter = if previous == "running" {
                "running_jobs"
            } else {
                "pending_jobs"
            };
            let counter_update = format!(
                "UPDATE scans SET {counter} = greatest({counter} - 1, 0), \
                 updated_at = now() WHERE id = $1"
            );
            tx.execute(counter_update.as_str(), &[&scan_id]).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn reset_jobs_from_stale_workers(
        &self,
        threshold: Duration,
    ) -> Result<u64, StoreError> {
        let mut client = self.conn().await?;
        let tx = client.transaction().await?;
        let secs = threshold.as_secs_f64();

        let stale_rows = tx
            .query(
                "UPDATE worker_nodes SET status = 'stopped' \
                 WHERE status = 'running' \
                   AND last_seen_at < now() - make_interval(secs => $1) \
                 RETURNING id",
                &[&secs],
            )
            .await?;
        if stale_rows.is_empty() {
            tx.commit().await?;
            return Ok(0);
        }
        let stale: Vec<String> = stale_rows
            .iter()
            .map(|r| r.try_get::<_, String>("id"))
            .collect::<Result<_, _>>()?;

        let reset_rows = tx
            .query(
                "UPDATE scan_jobs SET status = 'pending', claimed_by = NULL, \
                 claimed_at = NULL, last_heartbeat = NULL \
                 WHERE status = 'running' AND claimed_by = ANY($1) \
                 RETURNING scan_id",
                &[&stale],
            )
            .await?;
        for row in &reset_rows {
            let scan_id: Uuid = row.try_get("scan_id")?;
            tx.execute(
                "UPDATE scans SET running_jobs = running_jobs - 1, \
                 pending_jobs = pending_jobs + 1, updated_at = now() WHERE id = $1",
                &[&scan_id],
            )
            .await?;
        }

        tx.commit().await?;
        Ok(reset_rows.len() as u64)
    }

    async fn scan_job_stats(&self, scan_id: Uuid) -> Result<JobStats, StoreError> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                "SELECT status, count(*) AS n FROM scan_jobs \
                 WHERE scan_id = $1 GROUP BY status",
                &[&scan_id],
            )
            .await?;

        let mut stats = JobStats::default();
        for row in rows {
            let status: String = row.try_get("status")?;
            let n: i64 = row.try_get("n")?;
            match JobStatus::from_str(&status).map_err(StoreError::Pool)? {
                JobStatus::Pending => stats.pending = n,
                JobStatus::Running => stats.running = n,
                JobStatus::Completed => stats.completed = n,
                JobStatus::Failed => stats.failed = n,
                JobStatus::Cancelled => stats.cancelled = n,
            }
        }
        Ok(stats)
    }

    async fn register_worker(&self, node: &WorkerNode) -> Result<(), StoreError> {
        let conn = self.conn().await?;
        conn.execute(
            "INSERT INTO worker_nodes \
             (id, hostname, status, worker_count, started_at, last_seen_at, \
              jobs_claimed, jobs_completed, jobs_failed, version) \
             VALUES ($1, $2, $3, $4, $5, $6, 0, 0, 0, $7) \
             ON CONFLICT (id) DO UPDATE SET \
               hostname = excluded.hostname, status = excluded.status, \
               worker_count = excluded.worker_count, started_at = excluded.started_at, \
               last_seen_at = excluded.last_seen_at, version = excluded.version",
            &[
                &node.id,
                &node.hostname,
                &node.status.as_str(),
                &(node.worker_count as i32),
                &node.started_at,
                &node.last_seen_at,
                &node.version,
            ],
        )
        .await?;
        Ok(())
    }

    async fn worker_seen(&self, worker_id: &str) -> Result<(), StoreError> {
        let conn = self.conn().await?;
        let updated = conn
            .execute(
                "UPDATE worker_nodes SET last_seen_at = now() \
                 WHERE id = $1 AND status = 'running'",
                &[&worker_id],
            )
            .await?;
        if updated == 0 {
            return Err(StoreError::NotFound {
                entity: "worker",
                id: worker_id.to_string(),
            });
        }
        Ok(())
    }

    async fn stop_worker(&self, worker_id: &str) -> Result<(), StoreError> {
        let conn = self.conn().await?;
        conn.execute(
            "UPDATE worker_nodes SET status = 'stopped' WHERE id = $1",
            &[&worker_id],
        )
        .await?;
        Ok(())
    }

    async fn save_history(&self, history: &mut History) -> Result<(), StoreError> {
        let conn = self.conn().await?;
        let row = conn
            .query_one(
                "INSERT INTO histories \
                 (workspace_id, task_id, scan_id, job_id, playground_session_id, method, url, \
                  depth, status_code, request_body_size, request_content_type, \
                  response_content_type, raw_request, raw_response, proto, source, note, \
                  evaluated, duration_ms, created_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, \
                         $16, $17, $18, $19, $20) \
                 RETURNING id",
                &[
                    &history.workspace_id,
                    &history.task_id,
                    &history.scan_id,
                    &history.job_id,
                    &history.playground_session_id,
                    &history.method,
                    &history.url,
                    &history.depth,
                    &(history.status_code as i32),
                    &history.request_body_size,
                    &history.request_content_type,
                    &history.response_content_type,
                    &history.raw_request,
                    &history.raw_response,
                    &history.proto,
                    &history.source.as_str(),
                    &history.note,
                    &history.evaluated,
                    &history.duration_ms,
                    &history.created_at,
                ],
            )
            .await?;
        history.id = row.try_get("id")?;
        Ok(())
    }

    async fn count_scan_histories(&self, scan_id: Uuid) -> Result<i64, StoreError> {
        let conn = self.conn().await?;
        let row = conn
            .query_one(
                "SELECT count(*) AS n FROM histories WHERE scan_id = $1",
                &[&scan_id],
            )
            .await?;
        Ok(row.try_get("n")?)
    }

    async fn save_issue(&self, issue: &Issue) -> Result<(), StoreError> {
        let conn = self.conn().await?;
        conn.execute(
            "INSERT INTO issues \
             (id, code, title, severity, confidence, url, details, history_id, \
              websocket_connection_id, scan_id, job_id, workspace_id, false_positive, \
              created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)",
            &[
                &issue.id,
                &issue.code,
                &issue.title,
                &issue.severity.as_str(),
                &(issue.confidence as i32),
                &issue.url,
                &issue.details,
                &issue.history_id,
                &issue.websocket_connection_id,
                &issue.scan_id,
                &issue.job_id,
                &issue.workspace_id,
                &issue.false_positive,
                &issue.created_at,
            ],
        )
        .await?;
        Ok(())
    }

    async fn save_oob_test(&self, test: &OobTest) -> Result<(), StoreError> {
        let conn = self.conn().await?;
        conn.execute(
            "INSERT INTO oob_tests \
             (id, workspace_id, scan_id, job_id, test_name, target, payload, \
              insertion_point, correlation_full_id, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
            &[
                &test.id,
                &test.workspace_id,
                &test.scan_id,
                &test.job_id,
                &test.test_name,
                &test.target,
                &test.payload,
                &test.insertion_point,
                &test.correlation_full_id,
                &test.created_at,
            ],
        )
        .await?;
        Ok(())
    }

    async fn find_oob_test_for_interaction(
        &self,
        full_id: &str,
    ) -> Result<Option<OobTest>, StoreError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                "SELECT * FROM oob_tests \
                 WHERE $1 LIKE correlation_full_id || '%' \
                 ORDER BY length(correlation_full_id) DESC \
                 LIMIT 1",
                &[&full_id],
            )
            .await?;
        let Some(row) = row else { return Ok(None) };
        Ok(Some(OobTest {
            id: row.try_get("id")?,
            workspace_id: row.try_get("workspace_id")?,
            scan_id: row.try_get("scan_id")?,
            job_id: row.try_get("job_id")?,
            test_name: row.try_get("test_name")?,
            target: row.try_get("target")?,
            payload: row.try_get("payload")?,
            insertion_point: row.try_get("insertion_point")?,
            correlation_full_id: row.try_get("correlation_full_id")?,
            created_at: row.try_get("created_at")?,
        }))
    }

    async fn save_oob_interaction(
        &self,
        interaction: &OobInteraction,
    ) -> Result<(), StoreError> {
        let conn = self.conn().await?;
        conn.execute(
            "INSERT INTO oob_interactions \
             (id, oob_test_id, protocol, full_id, remote_address, timestamp, raw_data) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
            &[
                &interaction.id,
                &interaction.oob_test_id,
                &interaction.protocol,
                &interaction.full_id,
                &interaction.remote_address,
                &interaction.timestamp,
                &interaction.raw_data,
            ],
        )
        .await?;
        Ok(())
    }

    async fn save_jwt(&self, jwt: &Jwt) -> Result<(), StoreError> {
        let conn = self.conn().await?;
        conn.execute(
            "INSERT INTO jwts \
             (id, workspace_id, token, algorithm, issuer, subject, audience, \
              tested_embedded_wordlist, cracked, secret, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11) \
             ON CONFLICT (workspace_id, token) DO NOTHING",
            &[
                &jwt.id,
                &jwt.workspace_id,
                &jwt.token,
                &jwt.algorithm,
                &jwt.issuer,
                &jwt.subject,
                &jwt.audience,
                &jwt.tested_embedded_wordlist,
                &jwt.cracked,
                &jwt.secret,
                &jwt.created_at,
            ],
        )
        .await?;
        Ok(())
    }

    async fn save_websocket_connection(
        &self,
        connection: &WebSocketConnection,
    ) -> Result<(), StoreError> {
        let conn = self.conn().await?;
        conn.execute(
            "INSERT INTO websocket_connections \
             (id, workspace_id, scan_id, url, status_code, opened_at, closed_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             ON CONFLICT (id) DO UPDATE SET closed_at = excluded.closed_at",
            &[
                &connection.id,
                &connection.workspace_id,
                &connection.scan_id,
                &connection.url,
                &(connection.status_code as i32),
                &connection.opened_at,
                &connection.closed_at,
            ],
        )
        .await?;
        Ok(())
    }

    async fn save_websocket_message(
        &self,
        message: &WebSocketMessage,
    ) -> Result<(), StoreError> {
        let conn = self.conn().await?;
        let direction = match message.direction {
            crate::models::MessageDirection::Sent => "sent",
            crate::models::MessageDirection::Received => "received",
        };
        conn.execute(
            "INSERT INTO websocket_messages \
             (id, connection_id, direction, opcode, mask, payload, timestamp) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
            &[
                &message.id,
                &message.connection_id,
                &direction,
                &(message.opcode as i16),
                &message.mask,
                &message.payload,
                &message.timestamp,
            ],
        )
        .await?;
        Ok(())
    }
}
