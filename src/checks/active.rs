//! The active template check: inject payload families into one insertion
//! point and judge the responses.
//!
//! Reflected families (SSTI, XSS, path traversal) are confirmed by an
//! evidence marker in the response that the unpayloaded baseline does not
//! contain. OOB families only register the test; the issue is created
//! later, when the interactions manager delivers a matching event.

use async_trait::async_trait;

use crate::checks::{Check, CheckContext, CheckOutput, apply_payload, fetch_baseline};
use crate::error::CheckError;
use crate::executor::SendOptions;
use crate::models::{InsertionPoint, Issue, IssueKind, JobKind, OobTest};
use crate::payloads::PayloadFamily;

const DEFAULT_FAMILIES: &[PayloadFamily] = &[
    PayloadFamily::SstiBasic,
    PayloadFamily::Xss,
    PayloadFamily::PathTraversal,
    PayloadFamily::OobHttp,
];

pub struct ActiveTemplateCheck;

fn issue_kind(family: PayloadFamily) -> Option<(IssueKind, u8)> {
    match family {
        PayloadFamily::SstiBasic => Some((IssueKind::ServerSideTemplateInjection, 85)),
        PayloadFamily::Xss => Some((IssueKind::ReflectedInput, 60)),
        PayloadFamily::PathTraversal => Some((IssueKind::PathTraversal, 85)),
        _ => None,
    }
}

#[async_trait]
impl Check for ActiveTemplateCheck {
    fn kind(&self) -> JobKind {
        JobKind::ActiveTemplate
    }

    async fn run(&self, ctx: &CheckContext) -> Result<CheckOutput, CheckError> {
        ctx.ensure_active()?;

        let families: Vec<PayloadFamily> = match ctx.job.payload.family {
            Some(family) => vec![family],
            None => DEFAULT_FAMILIES.to_vec(),
        };
        let point = ctx
            .job
            .target
            .insertion_point
            .unwrap_or(InsertionPoint::UrlParam);

        let baseline = fetch_baseline(ctx).await?;
        let baseline_body = String::from_utf8_lossy(baseline.response_body()).into_owned();

        let mut output = CheckOutput::default();
        for family in families {
            for payload in ctx.payloads.generate(family) {
                ctx.ensure_active()?;

                if let Some(oob) = &payload.oob {
                    let mut test = OobTest::new(
                        ctx.workspace_id(),
                        format!("active_template:{family}"),
                        &ctx.job.target.url,
                        &oob.full_id,
                    )
                    .with_owner(Some(ctx.scan.id), Some(ctx.job.id))
                    .with_payload(&payload.value);
                    test.insertion_point = Some(point.to_string());
                    ctx.store.save_oob_test(&test).await?;
                }

                let mut request = apply_payload(&ctx.job.target, point, &payload.value)?;
                for (name, value) in ctx.scan_headers() {
                    request = request.with_header(name, value);
                }
                let result = ctx
                    .executor
                    .send(request, SendOptions::recorded(ctx.record_options()))
                    .await;

                let Some(response) = &result.response else {
                    continue;
                };
                let Some(marker) = &payload.marker else {
                    continue;
                };
                // A marker the page serves anyway proves nothing.
                if baseline_body.contains(marker.as_str()) {
                    continue;
                }
                if response.body_text().contains(marker.as_str()) {
                    let Some((kind, confidence)) = issue_kind(family) else {
                        continue;
                    };
                    let mut issue =
                        Issue::from_kind(kind, &ctx.job.target.url, ctx.workspace_id())
                            .with_confidence(confidence)
                            .with_details(format!(
                                "Payload {:?} at insertion point {point} produced the \
                                 evidence marker {marker:?} in the response.",
                                payload.value
                            ))
                            .with_owner(Some(ctx.scan.id), Some(ctx.job.id));
                    if let Some(history) = &result.history {
                        issue = issue.with_evidence(history.id);
                    }
                    output.issues.push(issue);
                    break;
                }
            }
        }

        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;
    use crate::cancel::CancelFlag;
    use crate::checks::CheckHandles;
    use crate::db::{MemoryStore, ScanStore};
    use crate::error::OobError;
    use crate::executor::RequestExecutor;
    use crate::interactions::{
        InteractionsConfig, InteractionsManager, OobClient, OobSession, RawInteraction,
    };
    use crate::models::{ScanJob, ScanOptions, TargetDescriptor};
    use crate::payloads::PayloadGenerators;

    struct AlwaysOkClient;

    #[async_trait::async_trait]
    impl OobClient for AlwaysOkClient {
        async fn register(&self, _session: &OobSession) -> Result<(), OobError> {
            Ok(())
        }
        async fn poll(&self, _session: &OobSession) -> Result<Vec<RawInteraction>, OobError> {
            Ok(Vec::new())
        }
        async fn keep_alive(&self, _session: &OobSession) -> Result<(), OobError> {
            Ok(())
        }
        async fn deregister(&self, _session: &OobSession) -> Result<(), OobError> {
            Ok(())
        }
    }

    /// Serves the first page to the first request, the second to every
    /// request after it.
    async fn serve_baseline_then(first: &'static [u8], rest: &'static [u8]) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut first = Some(first);
            while let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = [0u8; 4096];
                let _ = socket.read(&mut buf).await;
                let page = first.take().unwrap_or(rest);
                let _ = socket.write_all(page).await;
            }
        });
        format!("http://{addr}/?q=1")
    }

    async fn run_check(
        target_url: &str,
        family: PayloadFamily,
        interactions: Option<Arc<InteractionsManager>>,
    ) -> (CheckOutput, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let scan = store
            .create_scan(ScanOptions::new(1, vec![target_url.to_string()]))
            .await
            .unwrap();
        let job = ScanJob::new(
            scan.id,
            JobKind::ActiveTemplate,
            TargetDescriptor::get(target_url),
        )
        .with_family(family);

        let interactions = match interactions {
            Some(manager) => manager,
            None => Arc::new(InteractionsManager::http(InteractionsConfig::new(
                "https://oob.invalid",
            ))),
        };
        let payloads = Arc::new(PayloadGenerators::with_interactions(interactions.clone()));
        let (tx, _rx) = tokio::sync::mpsc::channel(8);
        let handles = CheckHandles {
            executor: Arc::new(RequestExecutor::new(reqwest::Client::new(), store.clone())),
            browsers: Arc::new(crate::browser::BrowserPool::http(
                crate::browser::BrowserConfig::default(),
            )),
            interactions,
            payloads,
            store: store.clone(),
            hijack_events: tx,
        };
        let ctx = handles.context(scan, job, CancelFlag::never());
        let output = ActiveTemplateCheck.run(&ctx).await.unwrap();
        (output, store)
    }

    #[tokio::test]
    async fn reflected_marker_raises_one_issue() {
        let url = serve_baseline_then(
            b"HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: 5\r\n\r\nplain",
            b"HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: 27\r\n\r\nechoed: q3x8\"'><b>zs</b> ..",
        )
        .await;

        let (output, store) = run_check(&url, PayloadFamily::Xss, None).await;
        assert_eq!(output.issues.len(), 1);
        assert_eq!(output.issues[0].code, "reflected_input");
        // Baseline plus the first payload probe; the check stops on the
        // first confirmation for the family.
        assert_eq!(store.histories().await.len(), 2);
    }

    #[tokio::test]
    async fn marker_present_in_baseline_is_suppressed() {
        let url = serve_baseline_then(
            b"HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: 17\r\n\r\nstatic 6561 here.",
            b"HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: 17\r\n\r\nstatic 6561 here.",
        )
        .await;

        let (output, _store) = run_check(&url, PayloadFamily::SstiBasic, None).await;
        assert!(output.issues.is_empty());
    }

    #[tokio::test]
    async fn oob_payloads_register_tests() {
        let url = serve_baseline_then(
            b"HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: 2\r\n\r\nok",
            b"HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: 2\r\n\r\nok",
        )
        .await;

        let dir = tempfile::tempdir().unwrap();
        let manager = Arc::new(InteractionsManager::new(
            Arc::new(AlwaysOkClient),
            InteractionsConfig::new("https://oob.example.test")
                .with_poll_interval(Duration::from_millis(50))
                .with_session_file(dir.path().join("session.json")),
        ));
        manager.start().await.unwrap();
        let correlation = manager.correlation_id().unwrap();

        let (output, store) = run_check(&url, PayloadFamily::OobHttp, Some(manager.clone())).await;
        assert!(output.issues.is_empty());

        let tests = store.oob_tests().await;
        assert_eq!(tests.len(), 3);
        for test in &tests {
            assert!(test.correlation_full_id.starts_with(&correlation));
            assert!(test.payload.contains(&test.correlation_full_id));
        }

        manager.stop().await;
    }
}
