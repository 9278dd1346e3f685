//! Request hijacking: every browser navigation is served through the
//! scanner's HTTP client so the exchange can be recorded and mined for new
//! URLs.
//!
//! The router runs a small state machine per request: scheme guard,
//! denylist, redirect-loop suppression, upstream fetch, history
//! materialisation, and finally a `{history, discovered_urls}` event on the
//! channel the leasing component owns.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::Instant;
use url::Url;
use uuid::Uuid;

use crate::browser::ResourceType;
use crate::cancel::CancelFlag;
use crate::db::ScanStore;
use crate::models::history::{build_raw_request, build_raw_response};
use crate::models::{History, HistorySource};

/// Hosts never worth recording: analytics and social beacons, plus local
/// endpoints the browser engine itself talks to.
pub const DENYLIST: &[&str] = &[
    "google-analytics.com",
    "googletagmanager.com",
    "analytics.google.com",
    "doubleclick.net",
    "connect.facebook.net",
    "facebook.com/tr",
    "platform.twitter.com",
    "hotjar.com",
    "mixpanel.com",
    "segment.io",
    "127.0.0.1:9222",
    "localhost:9222",
];

const LOOP_WINDOW: Duration = Duration::from_secs(5);
const LOOP_MAX_HITS: u32 = 3;
const MAX_DISCOVERED_URLS: usize = 256;

/// One intercepted browser request.
#[derive(Debug, Clone)]
pub struct HijackContext {
    pub url: Url,
    pub method: String,
    pub headers: Vec<(String, String)>,
    /// Original body bytes when the caller supplied any, kept so re-reads
    /// after stream consumption stay lossless.
    pub body: Option<Bytes>,
    pub resource_type: ResourceType,
}

impl HijackContext {
    pub fn document(url: Url) -> Self {
        Self {
            url,
            method: "GET".to_string(),
            headers: Vec::new(),
            body: None,
            resource_type: ResourceType::Document,
        }
    }

    pub fn with_headers(mut self, headers: Vec<(String, String)>) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_resource_type(mut self, resource_type: ResourceType) -> Self {
        self.resource_type = resource_type;
        self
    }
}

/// What the browser gets back for an intercepted request.
#[derive(Debug)]
pub enum HijackOutcome {
    /// The upstream exchange completed; here is the full response.
    Served(ServedResponse),
    /// The router refused to load the request (e.g. redirect loop).
    Blocked { reason: &'static str },
    /// The upstream fetch failed.
    Failed { reason: String },
    /// The request was passed over without processing (non-http scheme,
    /// malformed context, denylisted host).
    Skipped,
}

/// Captured upstream response.
#[derive(Debug, Clone)]
pub struct ServedResponse {
    pub status: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl ServedResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Delivered for every recorded exchange that may contain new URLs.
#[derive(Debug)]
pub struct HijackEvent {
    pub history: History,
    pub discovered_urls: Vec<Url>,
}

/// Owner references stamped on every history the hijacker materialises.
#[derive(Debug, Clone)]
pub struct HijackScope {
    pub workspace_id: i32,
    pub scan_id: Option<Uuid>,
    pub job_id: Option<Uuid>,
    pub source: HistorySource,
}

impl HijackScope {
    pub fn new(workspace_id: i32, source: HistorySource) -> Self {
        Self {
            workspace_id,
            scan_id: None,
            job_id: None,
            source,
        }
    }

    pub fn with_owner(mut self, scan_id: Option<Uuid>, job_id: Option<Uuid>) -> Self {
        self.scan_id = scan_id;
        self.job_id = job_id;
        self
    }
}

/// Sliding-window counter keyed by URL, reset every `LOOP_WINDOW`.
struct LoopTracker {
    window_start: Instant,
    hits: HashMap<String, u32>,
}

impl LoopTracker {
    fn new() -> Self {
        Self {
            window_start: Instant::now(),
            hits: HashMap::new(),
        }
    }

    fn register(&mut self, url: &str) -> u32 {
        let now = Instant::now();
        if now.duration_since(self.window_start) >= LOOP_WINDOW {
            self.hits.clear();
            self.window_start = now;
        }
        let count = self.hits.entry(url.to_string()).or_insert(0);
        *count += 1;
        *count
    }
}

/// Per-browser interception router. The loop tracker is per-hijacker, not
/// global.
pub struct Hijacker {
    client: reqwest::Client,
    store: Arc<dyn ScanStore>,
    scope: HijackScope,
    events: mpsc::Sender<HijackEvent>,
    cancel: CancelFlag,
    loop_tracker: Mutex<LoopTracker>,
}

impl Hijacker {
    /// `client` must not follow redirects itself: each hop has to come
    /// back through `intercept` for the loop tracker to see it.
    pub fn new(
        client: reqwest::Client,
        store: Arc<dyn ScanStore>,
        scope: HijackScope,
        events: mpsc::Sender<HijackEvent>,
        cancel: CancelFlag,
    ) -> Self {
        Self {
            client,
            store,
            scope,
            events,
            cancel,
            loop_tracker: Mutex::new(LoopTracker::new()),
        }
    }

    /// An upstream client configured the way the router needs it.
    pub fn upstream_client(timeout: Duration) -> reqwest::Client {
        reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .danger_accept_invalid_certs(true)
            .timeout(timeout)
            .build()
            .unwrap_or_default()
    }

    /// Run the interception state machine for one request.
    pub async fn intercept(&self, ctx: HijackContext) -> HijackOutcome {
        if !matches!(ctx.url.scheme(), "http" | "https") {
            return HijackOutcome::Skipped;
        }
        let Some(host) = ctx.url.host_str() else {
            return HijackOutcome::Skipped;
        };

        let host_port = match ctx.url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };
        let locator = format!("{host_port}{}", ctx.url.path());
        if DENYLIST
            .iter()
            .any(|entry| host_port.contains(entry) || locator.contains(entry))
        {
            tracing::trace!(url = %ctx.url, "dropping denylisted request");
            return HijackOutcome::Skipped;
        }

        let hits = self
            .loop_tracker
            .lock()
            .expect("loop tracker lock")
            .register(ctx.url.as_str());
        if hits > LOOP_MAX_HITS {
            tracing::debug!(url = %ctx.url, hits, "suppressing redirect loop");
            return HijackOutcome::Blocked {
                reason: "blocked by client",
            };
        }

        let start = Instant::now();
        let response = match self.fetch(&ctx).await {
            Ok(response) => response,
            Err(e) => {
                return HijackOutcome::Failed {
                    reason: e.to_string(),
                };
            }
        };
        let duration = start.elapsed();

        let history = self.materialise(&ctx, &response, duration).await;
        self.emit(&ctx, &response, history).await;

        HijackOutcome::Served(response)
    }

    async fn fetch(&self, ctx: &HijackContext) -> Result<ServedResponse, reqwest::Error> {
        let method = reqwest::Method::from_bytes(ctx.method.as_bytes())
            .unwrap_or(reqwest::Method::GET);
        let mut builder = self.client.request(method, ctx.url.clone());
        for (name, value) in &ctx.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = &ctx.body {
            builder = builder.body(body.clone());
        }

        let response = builder.send().await?;
        let status = response.status();
        let headers = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();
        let body = response.bytes().await?;
        Ok(ServedResponse {
            status: status.as_u16(),
            reason: status.canonical_reason().unwrap_or("").to_string(),
            headers,
            body,
        })
    }

    async fn materialise(
        &self,
        ctx: &HijackContext,
        response: &ServedResponse,
        duration: Duration,
    ) -> History {
        let body = ctx.body.as_deref().unwrap_or(&[]);
        let mut history = History::new(
            self.scope.workspace_id,
            &ctx.method,
            ctx.url.as_str(),
            self.scope.source,
        )
        .with_duration(duration);
        history.scan_id = self.scope.scan_id;
        history.job_id = self.scope.job_id;
        history.raw_request = build_raw_request(&ctx.method, &ctx.url, &ctx.headers, body);
        history.request_body_size = body.len() as i64;
        history.request_content_type = ctx
            .headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("content-type"))
            .map(|(_, v)| v.clone());
        history.status_code = response.status;
        history.response_content_type = response.header("content-type").map(|v| v.to_string());
        history.raw_response = build_raw_response(
            response.status,
            &response.reason,
            &response.headers,
            &response.body,
        );

        if let Err(e) = self.store.save_history(&mut history).await {
            tracing::warn!(url = %ctx.url, "failed to persist hijacked exchange: {e}");
        }
        history
    }

    /// Deliver the discovery event. Media-like resource types are recorded
    /// but never mined; a closed channel after shutdown only logs.
    async fn emit(&self, ctx: &HijackContext, response: &ServedResponse, history: History) {
        if ctx.resource_type.skips_discovery() {
            return;
        }
        if self.cancel.is_cancelled() {
            return;
        }

        let discovered_urls = extract_urls(
            &ctx.url,
            response.header("content-type").unwrap_or(""),
            &response.body,
        );
        let event = HijackEvent {
            history,
            discovered_urls,
        };
        if let Err(e) = self.events.send(event).await {
            tracing::debug!(url = %ctx.url, "hijack event dropped: {e}");
        }
    }
}

/// Pull candidate URLs out of a response body: markup attributes for HTML,
/// plus absolute http(s) URLs anywhere in text content.
pub fn extract_urls(base: &Url, content_type: &str, body: &[u8]) -> Vec<Url> {
    use std::sync::OnceLock;

    static ATTR_RE: OnceLock<regex::Regex> = OnceLock::new();
    static ABSOLUTE_RE: OnceLock<regex::Regex> = OnceLock::new();

    let attr_re = ATTR_RE.get_or_init(|| {
        regex::Regex::new(r#"(?i)(?:href|src|action)\s*=\s*["']([^"'#][^"']*)["']"#)
            .expect("static regex")
    });
    let absolute_re = ABSOLUTE_RE.get_or_init(|| {
        regex::Regex::new(r#"https?://[^\s"'<>\\)]+"#).expect("static regex")
    });

    let text = String::from_utf8_lossy(body);
    let mut seen = std::collections::HashSet::new();
    let mut urls = Vec::new();
    let mut push = |candidate: Url| {
        if !matches!(candidate.scheme(), "http" | "https") {
            return;
        }
        let host = candidate.host_str().unwrap_or("");
        if DENYLIST.iter().any(|entry| host.contains(entry)) {
            return;
        }
        let mut candidate = candidate;
        candidate.set_fragment(None);
        if seen.insert(candidate.to_string()) && urls.len() < MAX_DISCOVERED_URLS {
            urls.push(candidate);
        }
    };

    if content_type.contains("html") {
        for capture in attr_re.captures_iter(&text) {
            if let Ok(resolved) = base.join(&capture[1]) {
                push(resolved);
            }
        }
    }
    for found in absolute_re.find_iter(&text) {
        if let Ok(parsed) = Url::parse(found.as_str()) {
            push(parsed);
        }
    }
    urls
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use pretty_assertions::assert_eq;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn serve(response: &'static [u8]) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = [0u8; 4096];
                let _ = socket.read(&mut buf).await;
                let _ = socket.write_all(response).await;
            }
        });
        format!("http://{addr}/")
    }

    fn hijacker(
        store: Arc<MemoryStore>,
    ) -> (Hijacker, mpsc::Receiver<HijackEvent>) {
        let (tx, rx) = mpsc::channel(64);
        let hijacker = Hijacker::new(
            Hijacker::upstream_client(Duration::from_secs(5)),
            store,
            HijackScope::new(1, HistorySource::Crawler),
            tx,
            CancelFlag::never(),
        );
        (hijacker, rx)
    }

    #[tokio::test]
    async fn serves_and_records_and_emits() {
        let store = Arc::new(MemoryStore::new());
        let url = serve(
            b"HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: 44\r\n\r\n<a href=\"/next\">n</a><a href=\"/other\">o</a>x",
        )
        .await;
        let (hijacker, mut rx) = hijacker(store.clone());

        let outcome = hijacker
            .intercept(HijackContext::document(Url::parse(&url).unwrap()))
            .await;
        let HijackOutcome::Served(response) = outcome else {
            panic!("expected served outcome");
        };
        assert_eq!(response.status, 200);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.history.status_code, 200);
        let discovered: Vec<String> = event
            .discovered_urls
            .iter()
            .map(|u| u.path().to_string())
            .collect();
        assert!(discovered.contains(&"/next".to_string()));
        assert!(discovered.contains(&"/other".to_string()));
        assert_eq!(store.histories().await.len(), 1);
    }

    #[tokio::test]
    async fn denylisted_host_produces_nothing() {
        let store = Arc::new(MemoryStore::new());
        let (hijacker, mut rx) = hijacker(store.clone());

        let outcome = hijacker
            .intercept(HijackContext::document(
                Url::parse("https://www.google-analytics.com/collect").unwrap(),
            ))
            .await;
        assert!(matches!(outcome, HijackOutcome::Skipped));
        assert!(store.histories().await.is_empty());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn non_http_scheme_passes_through() {
        let store = Arc::new(MemoryStore::new());
        let (hijacker, _rx) = hijacker(store.clone());

        let outcome = hijacker
            .intercept(HijackContext::document(
                Url::parse("ftp://example.test/file").unwrap(),
            ))
            .await;
        assert!(matches!(outcome, HijackOutcome::Skipped));
        assert!(store.histories().await.is_empty());
    }

    #[tokio::test]
    async fn redirect_loop_is_suppressed_after_three_hits() {
        let store = Arc::new(MemoryStore::new());
        let url = serve(b"HTTP/1.1 302 Found\r\nLocation: /\r\nContent-Length: 0\r\n\r\n").await;
        let (hijacker, _rx) = hijacker(store.clone());
        let target = Url::parse(&url).unwrap();

        for _ in 0..3 {
            let outcome = hijacker
                .intercept(HijackContext::document(target.clone()))
                .await;
            assert!(matches!(outcome, HijackOutcome::Served(_)));
        }
        let outcome = hijacker
            .intercept(HijackContext::document(target.clone()))
            .await;
        assert!(matches!(
            outcome,
            HijackOutcome::Blocked {
                reason: "blocked by client"
            }
        ));
        assert_eq!(store.histories().await.len(), 3);
    }

    #[tokio::test]
    async fn media_types_record_history_without_events() {
        let store = Arc::new(MemoryStore::new());
        let url = serve(
            b"HTTP/1.1 200 OK\r\nContent-Type: image/png\r\nContent-Length: 3\r\n\r\nPNG",
        )
        .await;
        let (hijacker, mut rx) = hijacker(store.clone());

        let ctx = HijackContext::document(Url::parse(&url).unwrap())
            .with_resource_type(ResourceType::Image);
        let outcome = hijacker.intercept(ctx).await;
        assert!(matches!(outcome, HijackOutcome::Served(_)));
        assert_eq!(store.histories().await.len(), 1);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn upstream_failure_is_reported() {
        let store = Arc::new(MemoryStore::new());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let (hijacker, _rx) = hijacker(store.clone());

        let outcome = hijacker
            .intercept(HijackContext::document(
                Url::parse(&format!("http://{addr}/")).unwrap(),
            ))
            .await;
        assert!(matches!(outcome, HijackOutcome::Failed { .. }));
        assert!(store.histories().await.is_empty());
    }

    #[test]
    fn extract_urls_resolves_and_dedupes() {
        let base = Url::parse("http://example.test/dir/page").unwrap();
        let body = br#"<a href="/abs">a</a> <a href="rel">r</a> <a href="rel">dup</a>
            <script src="https://cdn.example.test/app.js"></script>
            plain text http://other.test/x?b=2&a=1 and mailto:x@example.test"#;

        let urls = extract_urls(&base, "text/html", body);
        let rendered: Vec<String> = urls.iter().map(|u| u.to_string()).collect();
        assert!(rendered.contains(&"http://example.test/abs".to_string()));
        assert!(rendered.contains(&"http://example.test/dir/rel".to_string()));
        assert!(rendered.contains(&"https://cdn.example.test/app.js".to_string()));
        assert!(rendered.contains(&"http://other.test/x?b=2&a=1".to_string()));
        assert_eq!(
            rendered
                .iter()
                .filter(|u| u.ends_with("/dir/rel"))
                .count(),
            1
        );
    }

    #[test]
    fn extract_urls_skips_markup_for_non_html() {
        let base = Url::parse("http://example.test/").unwrap();
        let body = br#"{"link": "/not-mined", "abs": "http://api.example.test/v1"}"#;
        let urls = extract_urls(&base, "application/json", body);
        let rendered: Vec<String> = urls.iter().map(|u| u.to_string()).collect();
        assert_eq!(rendered, vec!["http://api.example.test/v1".to_string()]);
    }
}
