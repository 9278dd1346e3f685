//! Scan jobs: the atomic unit of work the scheduler dispatches.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::payloads::PayloadFamily;

/// Lifecycle state of a job. Transitions are monotone; terminal states are
/// sticky.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    /// Legal moves in the job state machine. Requeue (running back to
    /// pending) is allowed so abandoned claims can be retried elsewhere.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        match self {
            JobStatus::Pending => matches!(next, JobStatus::Running | JobStatus::Cancelled),
            JobStatus::Running => true,
            _ => false,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// The closed set of check kinds a job can dispatch to. Adding a kind means
/// registering a check for it in `checks::CheckRegistry::builtin`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Crawl,
    PassiveHeaders,
    JwtCapture,
    ActiveTemplate,
    Timing,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Crawl => "crawl",
            JobKind::PassiveHeaders => "passive_headers",
            JobKind::JwtCapture => "jwt_capture",
            JobKind::ActiveTemplate => "active_template",
            JobKind::Timing => "timing",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "crawl" => Ok(JobKind::Crawl),
            "passive_headers" => Ok(JobKind::PassiveHeaders),
            "jwt_capture" => Ok(JobKind::JwtCapture),
            "active_template" => Ok(JobKind::ActiveTemplate),
            "timing" => Ok(JobKind::Timing),
            other => Err(format!("unknown job kind: {other}")),
        }
    }
}

/// A named slot in a request where a check may place a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InsertionPoint {
    UrlParam,
    Header,
    BodyField,
    Cookie,
    PathSegment,
}

impl InsertionPoint {
    pub fn all() -> &'static [InsertionPoint] {
        &[
            InsertionPoint::UrlParam,
            InsertionPoint::Header,
            InsertionPoint::BodyField,
            InsertionPoint::Cookie,
            InsertionPoint::PathSegment,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InsertionPoint::UrlParam => "url_param",
            InsertionPoint::Header => "header",
            InsertionPoint::BodyField => "body_field",
            InsertionPoint::Cookie => "cookie",
            InsertionPoint::PathSegment => "path_segment",
        }
    }
}

impl fmt::Display for InsertionPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a job runs against.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetDescriptor {
    pub url: String,
    pub method: String,
    pub insertion_point: Option<InsertionPoint>,
}

impl TargetDescriptor {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: "GET".to_string(),
            insertion_point: None,
        }
    }

    pub fn with_insertion_point(mut self, point: InsertionPoint) -> Self {
        self.insertion_point = Some(point);
        self
    }
}

/// Payload selection for audit jobs: either a generator family (the check
/// enumerates its payloads) or one concrete payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PayloadContext {
    pub family: Option<PayloadFamily>,
    pub payload: Option<String>,
}

/// One atomic unit of scan work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanJob {
    pub id: Uuid,
    pub scan_id: Uuid,
    pub status: JobStatus,
    pub kind: JobKind,
    pub target: TargetDescriptor,
    pub payload: PayloadContext,
    /// Crawl depth this job was discovered at.
    pub depth: usize,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub attempts: u32,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
}

impl ScanJob {
    pub fn new(scan_id: Uuid, kind: JobKind, target: TargetDescriptor) -> Self {
        Self {
            id: Uuid::new_v4(),
            scan_id,
            status: JobStatus::Pending,
            kind,
            target,
            payload: PayloadContext::default(),
            depth: 0,
            claimed_by: None,
            claimed_at: None,
            last_heartbeat: None,
            attempts: 0,
            max_retries: 3,
            created_at: Utc::now(),
        }
    }

    pub fn with_depth(mut self, depth: usize) -> Self {
        self.depth = depth;
        self
    }

    pub fn with_family(mut self, family: PayloadFamily) -> Self {
        self.payload.family = Some(family);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Whether another attempt is allowed after a failure.
    pub fn retryable(&self) -> bool {
        self.attempts <= self.max_retries
    }
}

/// Outcome a worker reports when a job finishes.
#[derive(Debug, Clone)]
pub enum JobOutcome {
    Completed,
    Failed { reason: String },
}

/// Per-status job counts for one scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStats {
    pub pending: i64,
    pub running: i64,
    pub completed: i64,
    pub failed: i64,
    pub cancelled: i64,
}

impl JobStats {
    pub fn total(&self) -> i64 {
        self.pending + self.running + self.completed + self.failed + self.cancelled
    }

    pub fn non_terminal(&self) -> i64 {
        self.pending + self.running
    }

    /// True once every owned job is in a terminal state.
    pub fn all_terminal(&self) -> bool {
        self.non_terminal() == 0
    }
}

/// What a claim call is allowed to return.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub scan_id: Option<Uuid>,
    pub kinds: Option<Vec<JobKind>>,
}

impl JobFilter {
    pub fn for_scan(scan_id: Uuid) -> Self {
        Self {
            scan_id: Some(scan_id),
            kinds: None,
        }
    }

    pub fn matches(&self, job: &ScanJob) -> bool {
        if let Some(scan_id) = self.scan_id {
            if job.scan_id != scan_id {
                return false;
            }
        }
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&job.kind) {
                return false;
            }
        }
        true
    }
}
