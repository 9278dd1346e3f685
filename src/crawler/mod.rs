//! The crawl/audit driver.
//!
//! Seeds a scan's initial jobs, consumes the hijackers' discovery events
//! to expand the crawl frontier (same-site, exclude patterns, canonical
//! dedup, depth and page caps), and — once crawling saturates — schedules
//! audit jobs for every crawled endpoint per the enabled categories. The
//! scan is finalized only after the interactions manager has quiesced.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use tokio::sync::mpsc;
use url::Url;

use crate::browser::{BrowserConfig, BrowserPool};
use crate::cancel::CancelFlag;
use crate::checks::{CheckHandles, CheckRegistry};
use crate::db::ScanStore;
use crate::error::{ConfigError, ScanError, StoreError};
use crate::executor::{RateLimiter, RequestExecutor};
use crate::hijack::HijackEvent;
use crate::interactions::InteractionsManager;
use crate::models::{
    HistorySource, InsertionPoint, JobKind, Scan, ScanJob, ScanOptions, TargetDescriptor,
};
use crate::payloads::{PayloadFamily, PayloadGenerators};
use crate::scheduler::{ScanManager, SchedulerConfig};

/// How long the event loop waits before re-checking saturation.
const IDLE_TICK: Duration = Duration::from_millis(400);
/// Ceiling on waiting for out-of-band stragglers at the end of a scan.
const QUIESCE_CEILING: Duration = Duration::from_secs(30);

/// Canonical form for dedup: scheme + host + port + path + sorted query,
/// fragment stripped.
pub fn canonical_key(url: &Url) -> String {
    let scheme = url.scheme();
    let host = url.host_str().unwrap_or("");
    let port = url
        .port_or_known_default()
        .map(|p| p.to_string())
        .unwrap_or_default();

    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    pairs.sort();
    let query = pairs
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&");

    format!("{scheme}://{host}:{port}{}?{query}", url.path())
}

/// Frontier state for one scan.
pub struct CrawlDriver {
    store: Arc<dyn ScanStore>,
    scan: Scan,
    events: mpsc::Receiver<HijackEvent>,
    exclude: Vec<Regex>,
    allowed_hosts: HashSet<String>,
    /// Canonical key -> best known depth.
    seen: HashMap<String, usize>,
    /// Pages that were actually crawled, in first-seen order.
    endpoints: Vec<Url>,
    endpoint_keys: HashSet<String>,
    pages_enqueued: usize,
    cancel: CancelFlag,
}

impl CrawlDriver {
    pub fn new(
        store: Arc<dyn ScanStore>,
        scan: Scan,
        events: mpsc::Receiver<HijackEvent>,
        cancel: CancelFlag,
    ) -> Result<Self, ConfigError> {
        let mut exclude = Vec::new();
        for pattern in &scan.options.exclude_patterns {
            exclude.push(Regex::new(pattern).map_err(|e| ConfigError::InvalidOptions {
                reason: format!("exclude pattern {pattern:?} is not a valid regex: {e}"),
            })?);
        }

        let mut allowed_hosts = HashSet::new();
        let mut seen = HashMap::new();
        for raw in &scan.options.start_urls {
            let url = Url::parse(raw).map_err(|e| ConfigError::InvalidOptions {
                reason: format!("start url {raw:?} is invalid: {e}"),
            })?;
            if let Some(host) = url.host_str() {
                allowed_hosts.insert(host.to_string());
            }
            seen.insert(canonical_key(&url), 0);
        }

        let pages_enqueued = scan.options.start_urls.len();
        Ok(Self {
            store,
            scan,
            events,
            exclude,
            allowed_hosts,
            seen,
            endpoints: Vec::new(),
            endpoint_keys: HashSet::new(),
            pages_enqueued,
            cancel,
        })
    }

    /// Pages crawled so far.
    pub fn endpoints(&self) -> &[Url] {
        &self.endpoints
    }

    /// Consume hijack events until the crawl saturates: no pending or
    /// running jobs remain and the event channel has drained.
    pub async fn run_crawl_phase(&mut self) -> Result<(), StoreError> {
        loop {
            if self.cancel.is_cancelled() {
                return Ok(());
            }
            tokio::select! {
                event = self.events.recv() => {
                    match event {
                        Some(event) => self.consume(event).await?,
                        None => return Ok(()),
                    }
                }
                _ = tokio::time::sleep(IDLE_TICK) => {
                    // Drain anything buffered before judging saturation.
                    let mut drained = false;
                    while let Ok(event) = self.events.try_recv() {
                        drained = true;
                        self.consume(event).await?;
                    }
                    if drained {
                        continue;
                    }
                    let stats = self.store.scan_job_stats(self.scan.id).await?;
                    if stats.all_terminal() {
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn consume(&mut self, event: HijackEvent) -> Result<(), StoreError> {
        let jobs = self.handle_event(&event);
        if !jobs.is_empty() {
            self.store.enqueue_jobs(&jobs).await?;
        }
        Ok(())
    }

    /// Turn one discovery event into the crawl jobs it justifies.
    fn handle_event(&mut self, event: &HijackEvent) -> Vec<ScanJob> {
        if let Ok(page) = Url::parse(&event.history.url) {
            let key = canonical_key(&page);
            if self.is_same_site(&page) && self.endpoint_keys.insert(key) {
                self.endpoints.push(page);
            }
        }

        let child_depth = (event.history.depth.max(0) as usize) + 1;
        let mut jobs = Vec::new();
        for url in &event.discovered_urls {
            let mut url = url.clone();
            url.set_fragment(None);
            if !self.admit(&url, child_depth) {
                continue;
            }
            jobs.push(
                ScanJob::new(
                    self.scan.id,
                    JobKind::Crawl,
                    TargetDescriptor::get(url.to_string()),
                )
                .with_depth(child_depth)
                .with_max_retries(self.scan.options.max_retries),
            );
        }
        jobs
    }

    fn is_same_site(&self, url: &Url) -> bool {
        url.host_str()
            .is_some_and(|host| self.allowed_hosts.contains(host))
    }

    fn admit(&mut self, url: &Url, depth: usize) -> bool {
        if !self.is_same_site(url) {
            return false;
        }
        let text = url.as_str();
        if self.exclude.iter().any(|re| re.is_match(text)) {
            return false;
        }

        let key = canonical_key(url);
        if let Some(known_depth) = self.seen.get_mut(&key) {
            // Already enqueued once; just remember the shallower path.
            if depth < *known_depth {
                *known_depth = depth;
            }
            return false;
        }

        let max_depth = self.scan.options.max_depth;
        if max_depth > 0 && depth > max_depth {
            return false;
        }
        let cap = self.scan.options.max_pages_to_crawl;
        if cap > 0 && self.pages_enqueued >= cap {
            tracing::debug!(url = %url, cap, "page cap reached, not enqueueing");
            return false;
        }

        self.seen.insert(key, depth);
        self.pages_enqueued += 1;
        true
    }

    /// Schedule audit jobs for every crawled endpoint per the enabled
    /// categories. Returns how many jobs were enqueued.
    pub async fn schedule_audits(&mut self) -> Result<usize, StoreError> {
        let categories = self.scan.options.audit_categories.clone();
        if !categories.any_enabled() {
            return Ok(0);
        }
        let points: Vec<InsertionPoint> = if self.scan.options.insertion_points.is_empty() {
            InsertionPoint::all().to_vec()
        } else {
            self.scan.options.insertion_points.clone()
        };

        let mut jobs = Vec::new();
        let job = |kind: JobKind, url: &Url, point: Option<InsertionPoint>| {
            let mut target = TargetDescriptor::get(url.to_string());
            target.insertion_point = point;
            ScanJob::new(self.scan.id, kind, target)
                .with_max_retries(self.scan.options.max_retries)
        };

        for endpoint in &self.endpoints {
            if categories.passive {
                jobs.push(job(JobKind::PassiveHeaders, endpoint, None));
                jobs.push(job(JobKind::JwtCapture, endpoint, None));
            }
            if categories.server_side {
                for point in &points {
                    for family in [
                        PayloadFamily::SstiBasic,
                        PayloadFamily::PathTraversal,
                        PayloadFamily::OobHttp,
                    ] {
                        jobs.push(
                            job(JobKind::ActiveTemplate, endpoint, Some(*point))
                                .with_family(family),
                        );
                    }
                    jobs.push(job(JobKind::Timing, endpoint, Some(*point)));
                }
            }
            if categories.client_side {
                for point in &points {
                    jobs.push(
                        job(JobKind::ActiveTemplate, endpoint, Some(*point))
                            .with_family(PayloadFamily::Xss),
                    );
                }
            }
        }
        if categories.websocket {
            tracing::debug!("websocket audits need a websocket-capable engine; none scheduled");
        }

        let enqueued = self.store.enqueue_jobs(&jobs).await?;
        tracing::info!(
            endpoints = self.endpoints.len(),
            jobs = enqueued,
            "audit phase scheduled"
        );
        Ok(enqueued)
    }
}

/// Run one scan end to end on this node: create it, crawl, audit, wait
/// for out-of-band stragglers, finalize. Shared collaborators (store,
/// registry, interactions) are injected; browsers and the executor are
/// scoped to the run.
pub async fn execute_scan(
    store: Arc<dyn ScanStore>,
    options: ScanOptions,
    registry: Arc<CheckRegistry>,
    interactions: Arc<InteractionsManager>,
    base_config: SchedulerConfig,
) -> Result<Scan, ScanError> {
    options.validate()?;
    let scan = store.create_scan(options).await?;
    tracing::info!(scan_id = %scan.id, "scan created");

    let (events_tx, events_rx) = mpsc::channel(256);

    let browsers = Arc::new(BrowserPool::http(
        BrowserConfig::for_source(HistorySource::Crawler)
            .with_pool_size(scan.options.pages_pool_size.max(1)),
    ));
    let client = reqwest::Client::builder()
        .danger_accept_invalid_certs(true)
        .build()
        .unwrap_or_default();
    let mut executor = RequestExecutor::new(client, store.clone());
    if let Some(rps) = scan.options.max_rps {
        executor = executor.with_limiter(Arc::new(RateLimiter::new(rps)));
    }
    let handles = CheckHandles {
        executor: Arc::new(executor),
        browsers: browsers.clone(),
        interactions: interactions.clone(),
        payloads: Arc::new(PayloadGenerators::with_interactions(interactions.clone())),
        store: store.clone(),
        hijack_events: events_tx,
    };

    // Isolated mode: this node's workers claim only this scan's jobs.
    let config = SchedulerConfig {
        scan_filter: Some(scan.id),
        ..base_config
    };
    let manager = ScanManager::new(config, store.clone(), registry, handles);
    let mut driver = CrawlDriver::new(
        store.clone(),
        scan.clone(),
        events_rx,
        CancelFlag::never(),
    )?;

    let run = async {
        manager.start().await?;
        driver.run_crawl_phase().await?;
        driver.schedule_audits().await?;
        manager
            .wait_for_scan(scan.id, Duration::from_millis(250))
            .await?;

        interactions
            .quiesce(interactions.poll_interval() * 2, QUIESCE_CEILING)
            .await;
        manager.finalize_scan(scan.id).await
    };
    let outcome = run.await;
    manager.stop().await;
    browsers.shutdown().await;

    match outcome {
        Ok(status) => {
            tracing::info!(scan_id = %scan.id, %status, "scan finished");
            Ok(store.get_scan(scan.id).await?.unwrap_or(scan))
        }
        Err(e) => {
            // The scan could not be driven to completion; failed is the
            // ground truth the operator sees.
            if let Err(update) = store
                .update_scan_status(scan.id, crate::models::ScanStatus::Failed)
                .await
            {
                tracing::warn!(scan_id = %scan.id, "could not mark scan failed: {update}");
            }
            Err(e.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;
    use crate::db::MemoryStore;
    use crate::interactions::InteractionsConfig;
    use crate::models::{History, ScanStatus};

    #[test]
    fn canonical_key_sorts_query_and_strips_fragment() {
        let a = Url::parse("http://example.test/path?b=2&a=1#frag").unwrap();
        let b = Url::parse("http://example.test/path?a=1&b=2").unwrap();
        assert_eq!(canonical_key(&a), canonical_key(&b));
    }

    #[test]
    fn canonical_key_distinguishes_port_and_path() {
        let a = Url::parse("http://example.test/path").unwrap();
        let b = Url::parse("http://example.test:8080/path").unwrap();
        let c = Url::parse("http://example.test/other").unwrap();
        assert_ne!(canonical_key(&a), canonical_key(&b));
        assert_ne!(canonical_key(&a), canonical_key(&c));
        // The default port is explicit either way.
        let d = Url::parse("http://example.test:80/path").unwrap();
        assert_eq!(canonical_key(&a), canonical_key(&d));
    }

    async fn driver_for(options: ScanOptions) -> (CrawlDriver, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let scan = store.create_scan(options).await.unwrap();
        let (_tx, rx) = mpsc::channel(8);
        let driver =
            CrawlDriver::new(store.clone(), scan, rx, CancelFlag::never()).unwrap();
        (driver, store)
    }

    fn event_from(page: &str, discovered: &[&str]) -> HijackEvent {
        let history = History::new(1, "GET", page, HistorySource::Crawler);
        HijackEvent {
            history,
            discovered_urls: discovered
                .iter()
                .map(|u| Url::parse(u).unwrap())
                .collect(),
        }
    }

    #[tokio::test]
    async fn frontier_filters_offsite_excluded_and_duplicates() {
        let mut options = ScanOptions::new(1, vec!["http://site.test/".to_string()]);
        options.exclude_patterns = vec!["/logout".to_string()];
        let (mut driver, _store) = driver_for(options).await;

        let jobs = driver.handle_event(&event_from(
            "http://site.test/",
            &[
                "http://site.test/a",
                "http://site.test/a",
                "http://site.test/a?x=1#frag",
                "http://site.test/logout",
                "http://elsewhere.test/b",
                "http://site.test/",
            ],
        ));

        let urls: Vec<&str> = jobs.iter().map(|j| j.target.url.as_str()).collect();
        assert_eq!(urls, vec!["http://site.test/a", "http://site.test/a?x=1"]);
        assert!(jobs.iter().all(|j| j.depth == 1));
    }

    #[tokio::test]
    async fn depth_cap_bounds_the_frontier() {
        let mut options = ScanOptions::new(1, vec!["http://site.test/".to_string()]);
        options.max_depth = 1;
        let (mut driver, _store) = driver_for(options).await;

        // The parent page sits one path segment deep, so children land at
        // depth 2.
        let jobs = driver.handle_event(&event_from(
            "http://site.test/section",
            &["http://site.test/section/deeper"],
        ));
        assert!(jobs.is_empty());
    }

    #[tokio::test]
    async fn page_cap_bounds_the_frontier() {
        let mut options = ScanOptions::new(1, vec!["http://site.test/".to_string()]);
        options.max_pages_to_crawl = 2;
        let (mut driver, _store) = driver_for(options).await;

        let jobs = driver.handle_event(&event_from(
            "http://site.test/",
            &[
                "http://site.test/one",
                "http://site.test/two",
                "http://site.test/three",
            ],
        ));
        // One seed page plus one discovery fills the cap.
        assert_eq!(jobs.len(), 1);
    }

    #[tokio::test]
    async fn audits_cover_crawled_endpoints() {
        let mut options = ScanOptions::new(1, vec!["http://site.test/".to_string()]);
        options.insertion_points = vec![InsertionPoint::UrlParam];
        let (mut driver, store) = driver_for(options).await;

        driver.handle_event(&event_from("http://site.test/", &[]));
        driver.handle_event(&event_from("http://site.test/page", &[]));
        let enqueued = driver.schedule_audits().await.unwrap();

        // Per endpoint: 2 passive + (3 active families + 1 timing) server
        // side + 1 client side.
        assert_eq!(enqueued, 2 * 7);
        let jobs = store.jobs_for_scan(driver.scan.id).await;
        assert!(jobs.iter().any(|j| j.kind == JobKind::PassiveHeaders));
        assert!(jobs.iter().any(|j| j.kind == JobKind::Timing));
        assert!(
            jobs.iter()
                .filter(|j| j.kind == JobKind::ActiveTemplate)
                .all(|j| j.payload.family.is_some())
        );
    }

    async fn serve_site() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = [0u8; 4096];
                let n = socket.read(&mut buf).await.unwrap_or(0);
                let request = String::from_utf8_lossy(&buf[..n]);
                let body = if request.starts_with("GET /next") {
                    "<html>leaf</html>".to_string()
                } else {
                    "<html><a href=\"/next\">n</a>\
                     <a href=\"https://www.google-analytics.com/collect\">t</a></html>"
                        .to_string()
                };
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: {}\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = socket.write_all(response.as_bytes()).await;
            }
        });
        format!("http://{addr}/")
    }

    #[tokio::test]
    async fn single_url_scan_completes_end_to_end() {
        let url = serve_site().await;
        let store = Arc::new(MemoryStore::new());

        let mut options = ScanOptions::new(1, vec![url.clone()]);
        options.max_depth = 2;
        options.audit_categories = crate::models::AuditCategories {
            server_side: false,
            client_side: false,
            passive: true,
            discovery: false,
            websocket: false,
        };
        options.max_retries = 0;

        let interactions = Arc::new(InteractionsManager::http(InteractionsConfig::new(
            "https://oob.invalid",
        )));
        let config = SchedulerConfig::default()
            .with_workers(2)
            .with_heartbeat_interval(Duration::from_millis(100))
            .with_claim_backoff(Duration::from_millis(10), Duration::from_millis(100));

        let scan = execute_scan(
            store.clone(),
            options,
            Arc::new(CheckRegistry::builtin()),
            interactions,
            config,
        )
        .await
        .unwrap();

        assert_eq!(scan.status, ScanStatus::Completed);

        let stats = store.scan_job_stats(scan.id).await.unwrap();
        assert!(stats.all_terminal());
        assert_eq!(stats.failed, 0);
        assert_eq!(scan.completed_jobs, stats.completed);

        let histories = store.histories().await;
        assert!(
            histories
                .iter()
                .any(|h| h.source == HistorySource::Crawler)
        );
        // The analytics link was neither fetched nor enqueued.
        assert!(!histories.iter().any(|h| h.url.contains("google")));
        let jobs = store.jobs_for_scan(scan.id).await;
        assert!(!jobs.iter().any(|j| j.target.url.contains("google")));
        // Both pages were crawled.
        assert!(jobs.iter().any(|j| j.target.url.ends_with("/next")));
    }
}
