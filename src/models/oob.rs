//! Out-of-band tests and the interactions matched back to them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Records the correlation full-id issued for one payload, so a later
/// interaction can be attributed to the check that planted it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OobTest {
    pub id: Uuid,
    pub workspace_id: i32,
    pub scan_id: Option<Uuid>,
    pub job_id: Option<Uuid>,
    pub test_name: String,
    pub target: String,
    pub payload: String,
    pub insertion_point: Option<String>,
    /// The unique identifier embedded in the payload's OOB host.
    pub correlation_full_id: String,
    pub created_at: DateTime<Utc>,
}

impl OobTest {
    pub fn new(
        workspace_id: i32,
        test_name: impl Into<String>,
        target: impl Into<String>,
        correlation_full_id: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            workspace_id,
            scan_id: None,
            job_id: None,
            test_name: test_name.into(),
            target: target.into(),
            payload: String::new(),
            insertion_point: None,
            correlation_full_id: correlation_full_id.into(),
            created_at: Utc::now(),
        }
    }

    pub fn with_owner(mut self, scan_id: Option<Uuid>, job_id: Option<Uuid>) -> Self {
        self.scan_id = scan_id;
        self.job_id = job_id;
        self
    }

    pub fn with_payload(mut self, payload: impl Into<String>) -> Self {
        self.payload = payload.into();
        self
    }
}

/// One event received from the OOB server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OobInteraction {
    pub id: Uuid,
    pub oob_test_id: Option<Uuid>,
    /// "http", "dns", "smtp", ...
    pub protocol: String,
    pub full_id: String,
    pub remote_address: String,
    pub timestamp: DateTime<Utc>,
    pub raw_data: String,
}

impl OobInteraction {
    pub fn new(protocol: impl Into<String>, full_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            oob_test_id: None,
            protocol: protocol.into(),
            full_id: full_id.into(),
            remote_address: String::new(),
            timestamp: Utc::now(),
            raw_data: String::new(),
        }
    }
}
