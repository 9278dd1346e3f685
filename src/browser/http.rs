//! The shipped browser engine: plain HTTP fetching.
//!
//! Loads the document, follows redirects hop by hop (each hop goes back
//! through the hijacker so loop suppression sees it), answers basic-auth
//! challenges when credentials are configured, and fetches the page's
//! sub-resources with their proper resource types.

use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use url::Url;

use crate::browser::{
    Browser, BrowserConfig, BrowserLauncher, NavigationResult, ResourceType,
};
use crate::error::BrowserError;
use crate::hijack::{HijackContext, HijackOutcome, Hijacker};

const MAX_REDIRECT_HOPS: usize = 10;
const MAX_SUB_RESOURCES: usize = 32;

const DEFAULT_USER_AGENT: &str = concat!(
    "Mozilla/5.0 (compatible; lycosa/",
    env!("CARGO_PKG_VERSION"),
    ")"
);

/// Launches `HttpBrowser` instances.
pub struct HttpBrowserLauncher;

#[async_trait]
impl BrowserLauncher for HttpBrowserLauncher {
    async fn launch(&self, config: &BrowserConfig) -> Result<std::sync::Arc<dyn Browser>, BrowserError> {
        Ok(std::sync::Arc::new(HttpBrowser {
            config: config.clone(),
            closed: AtomicBool::new(false),
        }))
    }
}

/// A browser that drives every fetch through the hijacker.
pub struct HttpBrowser {
    config: BrowserConfig,
    closed: AtomicBool,
}

impl HttpBrowser {
    fn base_headers(&self) -> Vec<(String, String)> {
        let user_agent = self
            .config
            .user_agent
            .clone()
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string());
        vec![
            ("User-Agent".to_string(), user_agent),
            ("Accept".to_string(), "*/*".to_string()),
        ]
    }

    fn authorization(&self) -> Option<(String, String)> {
        self.config.basic_auth.as_ref().map(|credentials| {
            let token =
                BASE64.encode(format!("{}:{}", credentials.username, credentials.password));
            ("Authorization".to_string(), format!("Basic {token}"))
        })
    }

    async fn fetch_sub_resources(
        &self,
        page_url: &Url,
        body: &[u8],
        headers: &[(String, String)],
        hijacker: &Hijacker,
    ) -> usize {
        let mut fetched = 0;
        for (url, resource_type) in sub_resources(page_url, body) {
            if fetched >= MAX_SUB_RESOURCES {
                break;
            }
            if self.config.ignore_images && resource_type == ResourceType::Image {
                continue;
            }
            let ctx = HijackContext::document(url)
                .with_headers(headers.to_vec())
                .with_resource_type(resource_type);
            if matches!(hijacker.intercept(ctx).await, HijackOutcome::Served(_)) {
                fetched += 1;
            }
        }
        fetched
    }
}

#[async_trait]
impl Browser for HttpBrowser {
    async fn navigate(
        &self,
        url: &Url,
        hijacker: &Hijacker,
    ) -> Result<NavigationResult, BrowserError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrowserError::Navigation {
                url: url.to_string(),
                reason: "browser is closed".to_string(),
            });
        }

        let mut headers = self.base_headers();
        let mut current = url.clone();
        let mut hops = 0;
        let mut fetched = 0;
        let mut answered_challenge = false;

        let response = loop {
            let ctx = HijackContext::document(current.clone()).with_headers(headers.clone());
            match hijacker.intercept(ctx).await {
                HijackOutcome::Served(response) => {
                    fetched += 1;

                    if response.status == 401 && !answered_challenge {
                        if let Some(auth) = self.authorization() {
                            answered_challenge = true;
                            headers.push(auth);
                            continue;
                        }
                    }

                    if matches!(response.status, 301 | 302 | 303 | 307 | 308) {
                        let Some(location) = response.header("location") else {
                            break response;
                        };
                        let Ok(next) = current.join(location) else {
                            break response;
                        };
                        hops += 1;
                        if hops > MAX_REDIRECT_HOPS {
                            break response;
                        }
                        current = next;
                        continue;
                    }

                    break response;
                }
                HijackOutcome::Blocked { reason } => {
                    return Err(BrowserError::Navigation {
                        url: current.to_string(),
                        reason: reason.to_string(),
                    });
                }
                HijackOutcome::Failed { reason } => {
                    return Err(BrowserError::Navigation {
                        url: current.to_string(),
                        reason,
                    });
                }
                HijackOutcome::Skipped => {
                    // Dropped without processing; nothing was loaded.
                    return Ok(NavigationResult {
                        final_url: current,
                        status: 0,
                        fetched_resources: fetched,
                    });
                }
            }
        };

        let is_html = response
            .header("content-type")
            .is_some_and(|ct| ct.contains("html"));
        if is_html {
            fetched += self
                .fetch_sub_resources(&current, &response.body, &headers, hijacker)
                .await;
        }

        Ok(NavigationResult {
            final_url: current,
            status: response.status,
            fetched_resources: fetched,
        })
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Sub-resource references in an HTML document, with the resource type the
/// tag implies.
fn sub_resources(base: &Url, body: &[u8]) -> Vec<(Url, ResourceType)> {
    static TAG_RE: OnceLock<regex::Regex> = OnceLock::new();
    let tag_re = TAG_RE.get_or_init(|| {
        regex::Regex::new(
            r#"(?i)<(script|img|link|iframe|source|audio|video)\b[^>]*?(?:src|href)\s*=\s*["']([^"']+)["']"#,
        )
        .expect("static regex")
    });

    let text = String::from_utf8_lossy(body);
    let mut seen = std::collections::HashSet::new();
    let mut resources = Vec::new();
    for capture in tag_re.captures_iter(&text) {
        let resource_type = match capture[1].to_ascii_lowercase().as_str() {
            "script" => ResourceType::Script,
            "img" => ResourceType::Image,
            "link" => ResourceType::Stylesheet,
            "iframe" => ResourceType::Document,
            _ => ResourceType::Media,
        };
        let Ok(resolved) = base.join(&capture[2]) else {
            continue;
        };
        if !matches!(resolved.scheme(), "http" | "https") {
            continue;
        }
        if seen.insert(resolved.to_string()) {
            resources.push((resolved, resource_type));
        }
    }
    resources
}
