//! Workspaces: the logical tenant everything else hangs off.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A logical tenant. Owns scans, histories, issues and captured artifacts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workspace {
    /// Small monotonic integer, assigned by the store.
    pub id: i32,
    /// Short unique code, e.g. "acme-prod".
    pub code: String,
    pub title: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

impl Workspace {
    pub fn new(code: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: 0,
            code: code.into(),
            title: title.into(),
            description: String::new(),
            created_at: Utc::now(),
        }
    }
}
