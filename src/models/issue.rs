//! Issues: findings produced by checks.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Finding severity, ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The fixed catalogue of issue codes the shipped checks can raise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    MissingContentSecurityPolicy,
    MissingStrictTransportSecurity,
    MissingFrameOptions,
    ServerBannerDisclosure,
    JwtInUrl,
    ExposedJwt,
    ReflectedInput,
    ServerSideTemplateInjection,
    PathTraversal,
    SqlInjectionTimeBased,
    CommandInjectionTimeBased,
    OutOfBandInteraction,
}

impl IssueKind {
    pub fn code(&self) -> &'static str {
        match self {
            IssueKind::MissingContentSecurityPolicy => "missing_content_security_policy",
            IssueKind::MissingStrictTransportSecurity => "missing_strict_transport_security",
            IssueKind::MissingFrameOptions => "missing_frame_options",
            IssueKind::ServerBannerDisclosure => "server_banner_disclosure",
            IssueKind::JwtInUrl => "jwt_in_url",
            IssueKind::ExposedJwt => "exposed_jwt",
            IssueKind::ReflectedInput => "reflected_input",
            IssueKind::ServerSideTemplateInjection => "server_side_template_injection",
            IssueKind::PathTraversal => "path_traversal",
            IssueKind::SqlInjectionTimeBased => "sql_injection_time_based",
            IssueKind::CommandInjectionTimeBased => "command_injection_time_based",
            IssueKind::OutOfBandInteraction => "out_of_band_interaction",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            IssueKind::MissingContentSecurityPolicy => "Missing Content-Security-Policy header",
            IssueKind::MissingStrictTransportSecurity => "Missing Strict-Transport-Security header",
            IssueKind::MissingFrameOptions => "Missing X-Frame-Options header",
            IssueKind::ServerBannerDisclosure => "Server version banner disclosure",
            IssueKind::JwtInUrl => "JSON Web Token transmitted in URL",
            IssueKind::ExposedJwt => "JSON Web Token exposed in response body",
            IssueKind::ReflectedInput => "User input reflected without encoding",
            IssueKind::ServerSideTemplateInjection => "Server-side template injection",
            IssueKind::PathTraversal => "Path traversal",
            IssueKind::SqlInjectionTimeBased => "SQL injection (time-based)",
            IssueKind::CommandInjectionTimeBased => "OS command injection (time-based)",
            IssueKind::OutOfBandInteraction => "Out-of-band interaction received",
        }
    }

    pub fn default_severity(&self) -> Severity {
        match self {
            IssueKind::MissingContentSecurityPolicy
            | IssueKind::MissingStrictTransportSecurity
            | IssueKind::MissingFrameOptions => Severity::Low,
            IssueKind::ServerBannerDisclosure => Severity::Info,
            IssueKind::JwtInUrl | IssueKind::ExposedJwt => Severity::Medium,
            IssueKind::ReflectedInput => Severity::Medium,
            IssueKind::ServerSideTemplateInjection
            | IssueKind::PathTraversal
            | IssueKind::SqlInjectionTimeBased
            | IssueKind::CommandInjectionTimeBased => Severity::High,
            IssueKind::OutOfBandInteraction => Severity::High,
        }
    }
}

/// A persisted finding, linked to the evidence that produced it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issue {
    pub id: Uuid,
    pub code: String,
    pub title: String,
    pub severity: Severity,
    /// 0-100.
    pub confidence: u8,
    pub url: String,
    pub details: String,
    pub history_id: Option<i64>,
    pub websocket_connection_id: Option<Uuid>,
    pub scan_id: Option<Uuid>,
    pub job_id: Option<Uuid>,
    pub workspace_id: i32,
    pub false_positive: bool,
    pub created_at: DateTime<Utc>,
}

impl Issue {
    pub fn from_kind(kind: IssueKind, url: impl Into<String>, workspace_id: i32) -> Self {
        Self {
            id: Uuid::new_v4(),
            code: kind.code().to_string(),
            title: kind.title().to_string(),
            severity: kind.default_severity(),
            confidence: 50,
            url: url.into(),
            details: String::new(),
            history_id: None,
            websocket_connection_id: None,
            scan_id: None,
            job_id: None,
            workspace_id,
            false_positive: false,
            created_at: Utc::now(),
        }
    }

    pub fn with_confidence(mut self, confidence: u8) -> Self {
        self.confidence = confidence.min(100);
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = details.into();
        self
    }

    pub fn with_evidence(mut self, history_id: i64) -> Self {
        self.history_id = Some(history_id);
        self
    }

    pub fn with_owner(mut self, scan_id: Option<Uuid>, job_id: Option<Uuid>) -> Self {
        self.scan_id = scan_id;
        self.job_id = job_id;
        self
    }
}
