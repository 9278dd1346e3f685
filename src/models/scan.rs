//! Scans and their options.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ConfigError;
use crate::models::job::InsertionPoint;

/// Lifecycle state of a scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanStatus {
    Pending,
    Running,
    Paused,
    Cancelled,
    Completed,
    Failed,
}

impl ScanStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ScanStatus::Cancelled | ScanStatus::Completed | ScanStatus::Failed
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ScanStatus::Pending => "pending",
            ScanStatus::Running => "running",
            ScanStatus::Paused => "paused",
            ScanStatus::Cancelled => "cancelled",
            ScanStatus::Completed => "completed",
            ScanStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for ScanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScanStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ScanStatus::Pending),
            "running" => Ok(ScanStatus::Running),
            "paused" => Ok(ScanStatus::Paused),
            "cancelled" => Ok(ScanStatus::Cancelled),
            "completed" => Ok(ScanStatus::Completed),
            "failed" => Ok(ScanStatus::Failed),
            other => Err(format!("unknown scan status: {other}")),
        }
    }
}

/// How aggressively checks probe the target.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanMode {
    Fast,
    #[default]
    Smart,
    Fuzz,
}

impl FromStr for ScanMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fast" => Ok(ScanMode::Fast),
            "smart" => Ok(ScanMode::Smart),
            "fuzz" => Ok(ScanMode::Fuzz),
            other => Err(format!("unknown scan mode: {other}")),
        }
    }
}

/// Which families of audits to schedule once crawling saturates.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditCategories {
    pub server_side: bool,
    pub client_side: bool,
    pub passive: bool,
    pub discovery: bool,
    pub websocket: bool,
}

impl Default for AuditCategories {
    fn default() -> Self {
        Self {
            server_side: true,
            client_side: true,
            passive: true,
            discovery: true,
            websocket: false,
        }
    }
}

impl AuditCategories {
    pub fn any_enabled(&self) -> bool {
        self.server_side || self.client_side || self.passive || self.discovery || self.websocket
    }
}

/// WebSocket audit tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebSocketOptions {
    pub concurrency: usize,
    pub replay_messages: bool,
    /// How long to observe a connection before moving on, in seconds.
    pub observation_window_secs: u64,
}

impl Default for WebSocketOptions {
    fn default() -> Self {
        Self {
            concurrency: 2,
            replay_messages: false,
            observation_window_secs: 30,
        }
    }
}

impl WebSocketOptions {
    pub fn observation_window(&self) -> Duration {
        Duration::from_secs(self.observation_window_secs)
    }
}

/// API-definition driven scanning.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiScanOptions {
    pub enabled: bool,
    pub run_api_specific_tests: bool,
    pub run_standard_tests: bool,
}

/// Everything an operator can tune about a scan. Opaque to the store
/// (persisted as a JSON blob), interpreted by the driver and scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanOptions {
    pub title: String,
    pub start_urls: Vec<String>,
    /// 0 means unbounded.
    pub max_depth: usize,
    /// 0 means unbounded. Authoritative global page cap.
    pub max_pages_to_crawl: usize,
    pub exclude_patterns: Vec<String>,
    pub workspace_id: i32,
    pub pages_pool_size: usize,
    pub headers: HashMap<String, String>,
    pub insertion_points: Vec<InsertionPoint>,
    pub mode: ScanMode,
    pub experimental_audits: bool,
    pub audit_categories: AuditCategories,
    pub websocket_options: WebSocketOptions,
    pub api_scan_options: ApiScanOptions,
    pub max_retries: u32,
    pub max_concurrent_jobs: Option<usize>,
    pub max_rps: Option<u32>,
    pub use_orchestrator: bool,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            title: String::new(),
            start_urls: Vec::new(),
            max_depth: 0,
            max_pages_to_crawl: 0,
            exclude_patterns: Vec::new(),
            workspace_id: 0,
            pages_pool_size: 4,
            headers: HashMap::new(),
            insertion_points: InsertionPoint::all().to_vec(),
            mode: ScanMode::default(),
            experimental_audits: false,
            audit_categories: AuditCategories::default(),
            websocket_options: WebSocketOptions::default(),
            api_scan_options: ApiScanOptions::default(),
            max_retries: 3,
            max_concurrent_jobs: None,
            max_rps: None,
            use_orchestrator: false,
        }
    }
}

impl ScanOptions {
    pub fn new(workspace_id: i32, start_urls: Vec<String>) -> Self {
        Self {
            workspace_id,
            start_urls,
            ..Default::default()
        }
    }

    /// Validate operator input before anything is persisted.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.start_urls.is_empty() {
            return Err(ConfigError::InvalidOptions {
                reason: "start_urls must not be empty".to_string(),
            });
        }
        for raw in &self.start_urls {
            let url = url::Url::parse(raw).map_err(|e| ConfigError::InvalidOptions {
                reason: format!("start url {raw:?} is not a valid absolute URI: {e}"),
            })?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(ConfigError::InvalidOptions {
                    reason: format!("start url {raw:?} must be http(s)"),
                });
            }
            if url.host_str().is_none() {
                return Err(ConfigError::InvalidOptions {
                    reason: format!("start url {raw:?} has no host"),
                });
            }
        }
        for pattern in &self.exclude_patterns {
            regex::Regex::new(pattern).map_err(|e| ConfigError::InvalidOptions {
                reason: format!("exclude pattern {pattern:?} is not a valid regex: {e}"),
            })?;
        }
        if self.workspace_id <= 0 {
            return Err(ConfigError::InvalidOptions {
                reason: "workspace_id must be set".to_string(),
            });
        }
        if let Some(rps) = self.max_rps {
            if rps == 0 {
                return Err(ConfigError::InvalidOptions {
                    reason: "max_rps must be greater than zero when set".to_string(),
                });
            }
        }
        if self.max_concurrent_jobs == Some(0) {
            return Err(ConfigError::InvalidOptions {
                reason: "max_concurrent_jobs must be greater than zero when set".to_string(),
            });
        }
        Ok(())
    }
}

/// A single orchestrated audit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scan {
    pub id: Uuid,
    pub workspace_id: i32,
    pub title: String,
    pub status: ScanStatus,
    pub options: ScanOptions,
    pub pending_jobs: i64,
    pub running_jobs: i64,
    pub completed_jobs: i64,
    pub failed_jobs: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Scan {
    pub fn new(options: ScanOptions) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            workspace_id: options.workspace_id,
            title: options.title.clone(),
            status: ScanStatus::Pending,
            options,
            pending_jobs: 0,
            running_jobs: 0,
            completed_jobs: 0,
            failed_jobs: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether `next` is a legal transition. Terminal states are sticky.
    pub fn can_transition_to(&self, next: ScanStatus) -> bool {
        if self.status == next {
            return true;
        }
        match self.status {
            ScanStatus::Pending => true,
            ScanStatus::Running | ScanStatus::Paused => {
                !matches!(next, ScanStatus::Pending)
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn valid_options() -> ScanOptions {
        ScanOptions::new(1, vec!["http://example.test/".to_string()])
    }

    #[test]
    fn validate_accepts_good_options() {
        assert!(valid_options().validate().is_ok());
    }

    #[test]
    fn validate_rejects_empty_start_urls() {
        let opts = ScanOptions::new(1, vec![]);
        assert!(opts.validate().is_err());
    }

    #[test]
    fn validate_rejects_non_http_scheme() {
        let opts = ScanOptions::new(1, vec!["ftp://example.test/".to_string()]);
        assert!(opts.validate().is_err());
    }

    #[test]
    fn validate_rejects_relative_url() {
        let opts = ScanOptions::new(1, vec!["/just/a/path".to_string()]);
        assert!(opts.validate().is_err());
    }

    #[test]
    fn validate_rejects_bad_exclude_pattern() {
        let mut opts = valid_options();
        opts.exclude_patterns.push("([".to_string());
        assert!(opts.validate().is_err());
    }

    #[test]
    fn mode_round_trips_through_str() {
        for s in ["fast", "smart", "fuzz"] {
            let mode: ScanMode = s.parse().unwrap();
            let json = serde_json::to_string(&mode).unwrap();
            assert_eq!(json, format!("\"{s}\""));
        }
        assert!("slow".parse::<ScanMode>().is_err());
    }

    #[test]
    fn terminal_states_are_sticky() {
        let mut scan = Scan::new(valid_options());
        scan.status = ScanStatus::Completed;
        assert!(!scan.can_transition_to(ScanStatus::Running));
        assert!(!scan.can_transition_to(ScanStatus::Failed));
        scan.status = ScanStatus::Cancelled;
        assert!(!scan.can_transition_to(ScanStatus::Completed));
    }

    #[test]
    fn running_cannot_return_to_pending() {
        let mut scan = Scan::new(valid_options());
        scan.status = ScanStatus::Running;
        assert!(!scan.can_transition_to(ScanStatus::Pending));
        assert!(scan.can_transition_to(ScanStatus::Cancelled));
        assert!(scan.can_transition_to(ScanStatus::Completed));
    }
}
