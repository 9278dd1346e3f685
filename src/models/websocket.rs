//! Captured WebSocket upgrades and their message streams.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Direction of a message relative to the scanner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageDirection {
    Sent,
    Received,
}

/// A captured upgrade. Messages must carry timestamps between `opened_at`
/// and `closed_at` (when set); `record_message` enforces this.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebSocketConnection {
    pub id: Uuid,
    pub workspace_id: i32,
    pub scan_id: Option<Uuid>,
    pub url: String,
    pub status_code: u16,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl WebSocketConnection {
    pub fn new(workspace_id: i32, url: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            workspace_id,
            scan_id: None,
            url: url.into(),
            status_code: 101,
            opened_at: Utc::now(),
            closed_at: None,
        }
    }

    pub fn close(&mut self) {
        self.closed_at = Some(Utc::now());
    }

    /// Build a message for this connection. Returns `None` when the
    /// connection is closed or the timestamp falls outside its lifetime.
    pub fn record_message(
        &self,
        direction: MessageDirection,
        opcode: u8,
        payload: Vec<u8>,
    ) -> Option<WebSocketMessage> {
        let now = Utc::now();
        if now < self.opened_at {
            return None;
        }
        if let Some(closed_at) = self.closed_at {
            if now > closed_at {
                return None;
            }
        }
        Some(WebSocketMessage {
            id: Uuid::new_v4(),
            connection_id: self.id,
            direction,
            opcode,
            mask: direction == MessageDirection::Sent,
            payload,
            timestamp: now,
        })
    }
}

/// One frame on a captured connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebSocketMessage {
    pub id: Uuid,
    pub connection_id: Uuid,
    pub direction: MessageDirection,
    pub opcode: u8,
    pub mask: bool,
    pub payload: Vec<u8>,
    pub timestamp: DateTime<Utc>,
}
