//! The crawl check: one browser navigation per job.
//!
//! Discovery does not happen here. The hijacker bound to the navigation
//! records every exchange and emits `{history, discovered_urls}` events;
//! the crawl driver consumes those to expand the frontier.

use async_trait::async_trait;

use crate::checks::{Check, CheckContext, CheckOutput};
use crate::error::{BrowserError, CheckError};
use crate::hijack::{HijackScope, Hijacker};
use crate::models::{HistorySource, JobKind};

pub struct CrawlCheck;

#[async_trait]
impl Check for CrawlCheck {
    fn kind(&self) -> JobKind {
        JobKind::Crawl
    }

    async fn run(&self, ctx: &CheckContext) -> Result<CheckOutput, CheckError> {
        ctx.ensure_active()?;
        let url = ctx.target_url()?;

        let scope = HijackScope::new(ctx.workspace_id(), HistorySource::Crawler)
            .with_owner(Some(ctx.scan.id), Some(ctx.job.id));
        let hijacker = Hijacker::new(
            Hijacker::upstream_client(ctx.browsers.config().navigation_timeout),
            ctx.store.clone(),
            scope,
            ctx.hijack_events.clone(),
            ctx.cancel.clone(),
        );

        // A failed navigation poisons the instance (the pool closes it
        // and launches a replacement) and is retried once on a fresh one.
        let mut retried = false;
        loop {
            ctx.ensure_active()?;
            let lease = ctx.browsers.acquire().await?;
            match lease.navigate(&url, &hijacker).await {
                Ok(result) => {
                    tracing::debug!(
                        url = %url,
                        status = result.status,
                        fetched = result.fetched_resources,
                        "crawled page"
                    );
                    return Ok(CheckOutput::default());
                }
                // A looping page was suppressed by the router; the page
                // is done as far as crawling goes.
                Err(BrowserError::Navigation { reason, .. })
                    if reason == "blocked by client" =>
                {
                    return Ok(CheckOutput::default());
                }
                Err(e) => {
                    lease.poison();
                    if retried {
                        return Err(e.into());
                    }
                    retried = true;
                    tracing::debug!(url = %url, "navigation failed, retrying once: {e}");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    use super::*;
    use crate::browser::{BrowserConfig, BrowserPool};
    use crate::cancel::CancelFlag;
    use crate::checks::CheckHandles;
    use crate::db::{MemoryStore, ScanStore};
    use crate::executor::RequestExecutor;
    use crate::hijack::HijackEvent;
    use crate::interactions::{InteractionsConfig, InteractionsManager};
    use crate::models::{ScanJob, ScanOptions, TargetDescriptor};
    use crate::payloads::PayloadGenerators;

    async fn serve(page: &'static [u8]) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = [0u8; 4096];
                let _ = socket.read(&mut buf).await;
                let _ = socket.write_all(page).await;
            }
        });
        format!("http://{addr}/")
    }

    fn handles(
        store: Arc<MemoryStore>,
    ) -> (CheckHandles, mpsc::Receiver<HijackEvent>) {
        let (tx, rx) = mpsc::channel(64);
        let interactions = Arc::new(InteractionsManager::http(InteractionsConfig::new(
            "https://oob.invalid",
        )));
        let handles = CheckHandles {
            executor: Arc::new(RequestExecutor::new(reqwest::Client::new(), store.clone())),
            browsers: Arc::new(BrowserPool::http(
                BrowserConfig::default().with_pool_size(1),
            )),
            interactions,
            payloads: Arc::new(PayloadGenerators::new()),
            store,
            hijack_events: tx,
        };
        (handles, rx)
    }

    #[tokio::test]
    async fn crawl_records_history_and_emits_discovery() {
        let store = Arc::new(MemoryStore::new());
        let url = serve(
            b"HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: 22\r\n\r\n<a href=\"/found\">f</a>",
        )
        .await;

        let scan = store
            .create_scan(ScanOptions::new(1, vec![url.clone()]))
            .await
            .unwrap();
        let jobs = store.jobs_for_scan(scan.id).await;
        let (handles, mut rx) = handles(store.clone());
        let ctx = handles.context(scan.clone(), jobs[0].clone(), CancelFlag::never());

        let output = CrawlCheck.run(&ctx).await.unwrap();
        assert!(output.issues.is_empty());

        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.history.source, HistorySource::Crawler);
        assert_eq!(event.history.scan_id, Some(scan.id));
        let found: Vec<&str> = event
            .discovered_urls
            .iter()
            .map(|u| u.path())
            .collect();
        assert!(found.contains(&"/found"));

        let histories = store.histories().await;
        assert_eq!(histories.len(), 1);
        assert_eq!(histories[0].source, HistorySource::Crawler);
    }

    /// Kills the first connection before responding, then serves `page`.
    async fn serve_after_one_failure(page: &'static [u8]) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut first = true;
            while let Ok((mut socket, _)) = listener.accept().await {
                if first {
                    first = false;
                    drop(socket);
                    continue;
                }
                let mut buf = [0u8; 4096];
                let _ = socket.read(&mut buf).await;
                let _ = socket.write_all(page).await;
            }
        });
        format!("http://{addr}/")
    }

    #[tokio::test]
    async fn navigation_retries_once_after_browser_error() {
        let store = Arc::new(MemoryStore::new());
        let url = serve_after_one_failure(
            b"HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: 2\r\n\r\nok",
        )
        .await;

        let scan = store
            .create_scan(ScanOptions::new(1, vec![url.clone()]))
            .await
            .unwrap();
        let jobs = store.jobs_for_scan(scan.id).await;
        let (handles, _rx) = handles(store.clone());
        let ctx = handles.context(scan, jobs[0].clone(), CancelFlag::never());

        let output = CrawlCheck.run(&ctx).await.unwrap();
        assert!(output.issues.is_empty());
        // Only the retried, successful exchange was recorded.
        assert_eq!(store.histories().await.len(), 1);
        assert_eq!(store.histories().await[0].status_code, 200);
    }

    #[tokio::test]
    async fn cancelled_context_returns_immediately() {
        let store = Arc::new(MemoryStore::new());
        let scan = store
            .create_scan(ScanOptions::new(
                1,
                vec!["http://unreachable.invalid/".to_string()],
            ))
            .await
            .unwrap();
        let job = ScanJob::new(
            scan.id,
            JobKind::Crawl,
            TargetDescriptor::get("http://unreachable.invalid/"),
        );
        let (handles, _rx) = handles(store);

        let (handle, flag) = crate::cancel::cancel_pair();
        handle.cancel();
        let ctx = handles.context(scan, job, flag);

        let result = CrawlCheck.run(&ctx).await;
        assert!(matches!(result, Err(CheckError::Cancelled)));
    }

    #[tokio::test]
    async fn unreachable_target_is_a_check_error() {
        let store = Arc::new(MemoryStore::new());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let target = format!("http://{addr}/");
        let scan = store
            .create_scan(ScanOptions::new(1, vec![target.clone()]))
            .await
            .unwrap();
        let jobs = store.jobs_for_scan(scan.id).await;
        let (handles, _rx) = handles(store);
        let ctx = handles.context(scan, jobs[0].clone(), CancelFlag::never());

        let result = CrawlCheck.run(&ctx).await;
        assert!(matches!(result, Err(CheckError::Browser(_))));
    }
}
