//! Persistent entities of the scan engine.

pub mod history;
pub mod issue;
pub mod job;
pub mod jwt;
pub mod oob;
pub mod scan;
pub mod websocket;
pub mod worker;
pub mod workspace;

pub use history::{History, HistorySource};
pub use issue::{Issue, IssueKind, Severity};
pub use job::{
    InsertionPoint, JobFilter, JobKind, JobOutcome, JobStats, JobStatus, PayloadContext, ScanJob,
    TargetDescriptor,
};
pub use jwt::Jwt;
pub use oob::{OobInteraction, OobTest};
pub use scan::{
    ApiScanOptions, AuditCategories, Scan, ScanMode, ScanOptions, ScanStatus, WebSocketOptions,
};
pub use websocket::{MessageDirection, WebSocketConnection, WebSocketMessage};
pub use worker::{WorkerNode, WorkerStatus};
pub use workspace::Workspace;
