//! The check plugin contract.
//!
//! Every vulnerability check implements [`Check`]: a typed input (the
//! context with its injected handles), a typed output (issues plus derived
//! jobs), registered in a static table keyed by the job kind. Checks own no
//! shared mutable state and do all I/O through the handles; a cancelled
//! context means "return promptly, produce nothing partial".

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use url::Url;

use crate::browser::BrowserPool;
use crate::cancel::CancelFlag;
use crate::db::ScanStore;
use crate::error::CheckError;
use crate::executor::{HistoryOptions, PreparedRequest, RequestExecutor};
use crate::hijack::HijackEvent;
use crate::interactions::InteractionsManager;
use crate::models::{
    History, HistorySource, InsertionPoint, Issue, JobKind, Scan, ScanJob, TargetDescriptor,
};
use crate::payloads::PayloadGenerators;

pub mod active;
pub mod crawl;
pub mod passive;
pub mod timing;

pub use active::ActiveTemplateCheck;
pub use crawl::CrawlCheck;
pub use passive::{JwtCaptureCheck, PassiveHeaderCheck};
pub use timing::TimingCheck;

/// The shared handles a worker injects into every check it dispatches.
#[derive(Clone)]
pub struct CheckHandles {
    pub executor: Arc<RequestExecutor>,
    pub browsers: Arc<BrowserPool>,
    pub interactions: Arc<InteractionsManager>,
    pub payloads: Arc<PayloadGenerators>,
    pub store: Arc<dyn ScanStore>,
    pub hijack_events: mpsc::Sender<HijackEvent>,
}

impl CheckHandles {
    pub fn context(&self, scan: Scan, job: ScanJob, cancel: CancelFlag) -> CheckContext {
        CheckContext {
            scan,
            job,
            target_history: None,
            executor: self.executor.clone(),
            browsers: self.browsers.clone(),
            interactions: self.interactions.clone(),
            payloads: self.payloads.clone(),
            store: self.store.clone(),
            hijack_events: self.hijack_events.clone(),
            cancel,
        }
    }
}

/// Everything a check gets to work with.
pub struct CheckContext {
    pub scan: Scan,
    pub job: ScanJob,
    /// The history that evidenced the target, when the dispatcher has one.
    /// Checks without it fetch their own baseline through the executor.
    pub target_history: Option<History>,
    pub executor: Arc<RequestExecutor>,
    pub browsers: Arc<BrowserPool>,
    pub interactions: Arc<InteractionsManager>,
    pub payloads: Arc<PayloadGenerators>,
    pub store: Arc<dyn ScanStore>,
    pub hijack_events: mpsc::Sender<HijackEvent>,
    pub cancel: CancelFlag,
}

impl CheckContext {
    pub fn workspace_id(&self) -> i32 {
        self.scan.workspace_id
    }

    pub fn target_url(&self) -> Result<Url, CheckError> {
        Url::parse(&self.job.target.url)
            .map_err(|e| CheckError::Other(format!("invalid target url: {e}")))
    }

    /// Recording options stamping this job as the owner.
    pub fn record_options(&self) -> HistoryOptions {
        HistoryOptions::new(self.workspace_id(), HistorySource::Scanner)
            .with_owner(Some(self.scan.id), Some(self.job.id))
    }

    /// Bail out with `Cancelled` once the flag has tripped.
    pub fn ensure_active(&self) -> Result<(), CheckError> {
        if self.cancel.is_cancelled() {
            return Err(CheckError::Cancelled);
        }
        Ok(())
    }

    /// The scan's extra headers as request pairs.
    pub fn scan_headers(&self) -> Vec<(String, String)> {
        self.scan
            .options
            .headers
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

/// What one check run produced.
#[derive(Debug, Default)]
pub struct CheckOutput {
    pub issues: Vec<Issue>,
    pub derived_jobs: Vec<ScanJob>,
}

impl CheckOutput {
    pub fn issue(issue: Issue) -> Self {
        Self {
            issues: vec![issue],
            derived_jobs: Vec::new(),
        }
    }

    pub fn merge(&mut self, other: CheckOutput) {
        self.issues.extend(other.issues);
        self.derived_jobs.extend(other.derived_jobs);
    }
}

/// One vulnerability check.
#[async_trait]
pub trait Check: Send + Sync {
    /// The job kind this check handles.
    fn kind(&self) -> JobKind;

    async fn run(&self, ctx: &CheckContext) -> Result<CheckOutput, CheckError>;
}

/// Static dispatch table keyed by job kind.
pub struct CheckRegistry {
    checks: HashMap<JobKind, Arc<dyn Check>>,
}

impl CheckRegistry {
    pub fn empty() -> Self {
        Self {
            checks: HashMap::new(),
        }
    }

    /// The shipped check set.
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(CrawlCheck));
        registry.register(Arc::new(PassiveHeaderCheck));
        registry.register(Arc::new(JwtCaptureCheck));
        registry.register(Arc::new(ActiveTemplateCheck));
        registry.register(Arc::new(TimingCheck));
        registry
    }

    pub fn register(&mut self, check: Arc<dyn Check>) {
        self.checks.insert(check.kind(), check);
    }

    pub fn get(&self, kind: JobKind) -> Option<Arc<dyn Check>> {
        self.checks.get(&kind).cloned()
    }
}

/// The history a check judges: the dispatcher-provided one when present,
/// otherwise a fresh recorded baseline request against the target.
pub(crate) async fn fetch_baseline(ctx: &CheckContext) -> Result<History, CheckError> {
    if let Some(history) = &ctx.target_history {
        return Ok(history.clone());
    }

    let url = ctx.target_url()?;
    let mut request = PreparedRequest::new(ctx.job.target.method.clone(), url);
    for (name, value) in ctx.scan_headers() {
        request = request.with_header(name, value);
    }
    let result = ctx
        .executor
        .send(
            request,
            crate::executor::SendOptions::recorded(ctx.record_options()),
        )
        .await;
    if let Some(error) = result.error {
        return Err(CheckError::Executor(error));
    }
    result
        .history
        .ok_or_else(|| CheckError::Other("baseline request produced no history".to_string()))
}

/// Place `payload` into the target at the given insertion point.
pub fn apply_payload(
    target: &TargetDescriptor,
    point: InsertionPoint,
    payload: &str,
) -> Result<PreparedRequest, CheckError> {
    let mut url = Url::parse(&target.url)
        .map_err(|e| CheckError::Other(format!("invalid target url: {e}")))?;

    match point {
        InsertionPoint::UrlParam => {
            let pairs: Vec<(String, String)> = url
                .query_pairs()
                .map(|(k, _)| (k.into_owned(), payload.to_string()))
                .collect();
            let mut serializer = url.query_pairs_mut();
            serializer.clear();
            if pairs.is_empty() {
                serializer.append_pair("q", payload);
            } else {
                for (k, v) in &pairs {
                    serializer.append_pair(k, v);
                }
            }
            drop(serializer);
            Ok(PreparedRequest::new(target.method.clone(), url))
        }
        InsertionPoint::Header => Ok(PreparedRequest::new(target.method.clone(), url)
            .with_header("User-Agent", payload)
            .with_header("X-Forwarded-For", payload)),
        InsertionPoint::Cookie => Ok(PreparedRequest::new(target.method.clone(), url)
            .with_header("Cookie", format!("session={payload}"))),
        InsertionPoint::BodyField => Ok(PreparedRequest::new("POST", url)
            .with_header("Content-Type", "application/x-www-form-urlencoded")
            .with_body(format!("input={payload}").into_bytes())),
        InsertionPoint::PathSegment => {
            let base = url.path().trim_end_matches('/').to_string();
            url.set_path(&format!("{base}/{payload}"));
            Ok(PreparedRequest::new(target.method.clone(), url))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn builtin_registry_covers_every_kind() {
        let registry = CheckRegistry::builtin();
        for kind in [
            JobKind::Crawl,
            JobKind::PassiveHeaders,
            JobKind::JwtCapture,
            JobKind::ActiveTemplate,
            JobKind::Timing,
        ] {
            let check = registry.get(kind).expect("kind registered");
            assert_eq!(check.kind(), kind);
        }
    }

    #[test]
    fn url_param_injection_replaces_values() {
        let target = TargetDescriptor::get("http://example.test/search?q=books&page=2");
        let request = apply_payload(&target, InsertionPoint::UrlParam, "PAYLOAD").unwrap();
        let query = request.url.query().unwrap();
        assert!(query.contains("q=PAYLOAD"));
        assert!(query.contains("page=PAYLOAD"));
    }

    #[test]
    fn url_param_injection_appends_when_no_query() {
        let target = TargetDescriptor::get("http://example.test/");
        let request = apply_payload(&target, InsertionPoint::UrlParam, "x").unwrap();
        assert_eq!(request.url.query(), Some("q=x"));
    }

    #[test]
    fn body_field_injection_switches_to_post() {
        let target = TargetDescriptor::get("http://example.test/form");
        let request = apply_payload(&target, InsertionPoint::BodyField, "x").unwrap();
        assert_eq!(request.method, "POST");
        assert_eq!(&request.body[..], b"input=x");
    }

    #[test]
    fn path_segment_injection_appends_segment() {
        let target = TargetDescriptor::get("http://example.test/static/");
        let request = apply_payload(&target, InsertionPoint::PathSegment, "probe").unwrap();
        assert_eq!(request.url.path(), "/static/probe");

        // Dot segments collapse during path parsing; encoded traversal
        // payloads survive verbatim.
        let request =
            apply_payload(&target, InsertionPoint::PathSegment, "..%2f..%2fetc%2fpasswd")
                .unwrap();
        assert!(request.url.path().contains("%2f"));
    }

    #[test]
    fn cookie_injection_sets_cookie_header() {
        let target = TargetDescriptor::get("http://example.test/");
        let request = apply_payload(&target, InsertionPoint::Cookie, "x").unwrap();
        assert_eq!(
            request.headers,
            vec![("Cookie".to_string(), "session=x".to_string())]
        );
    }
}
