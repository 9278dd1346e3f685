//! Browser abstraction.
//!
//! The engine behind a browser is deliberately not mandated: anything that
//! can drive its network fetches through a `Hijacker` can implement
//! [`Browser`]. The shipped [`http::HttpBrowser`] fetches documents and
//! their sub-resources over the scanner's HTTP client; a CDP-based engine
//! would slot into the same trait. Tests substitute scripted fakes.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use url::Url;

use crate::error::BrowserError;
use crate::hijack::Hijacker;
use crate::models::HistorySource;

pub mod http;
pub mod pool;

pub use http::{HttpBrowser, HttpBrowserLauncher};
pub use pool::{BrowserLease, BrowserPool};

/// What kind of resource a page request is for. Media-like types are
/// recorded but never mined for new URLs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceType {
    Document,
    Script,
    Stylesheet,
    Image,
    Font,
    Media,
    Fetch,
    Other,
}

impl ResourceType {
    pub fn skips_discovery(&self) -> bool {
        matches!(
            self,
            ResourceType::Image | ResourceType::Font | ResourceType::Media
        )
    }
}

/// Basic-auth credentials offered on HTTP 401 challenges.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Launch-time configuration for a pool and its browsers.
#[derive(Debug, Clone)]
pub struct BrowserConfig {
    /// Fixed pool ceiling.
    pub pool_size: usize,
    /// Which pool this is (scanner, crawler, repeater, hijack); stamped on
    /// the histories its navigations produce.
    pub source: HistorySource,
    pub user_agent: Option<String>,
    /// Upstream proxy for navigations.
    pub proxy: Option<String>,
    /// Skip fetching images entirely.
    pub ignore_images: bool,
    /// Launch hint for engines with GPU rendering.
    pub disable_gpu: bool,
    pub basic_auth: Option<Credentials>,
    pub navigation_timeout: Duration,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            pool_size: 4,
            source: HistorySource::Scanner,
            user_agent: None,
            proxy: None,
            ignore_images: false,
            disable_gpu: true,
            basic_auth: None,
            navigation_timeout: Duration::from_secs(30),
        }
    }
}

impl BrowserConfig {
    pub fn for_source(source: HistorySource) -> Self {
        Self {
            source,
            ..Default::default()
        }
    }

    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size.max(1);
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn with_basic_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.basic_auth = Some(Credentials {
            username: username.into(),
            password: password.into(),
        });
        self
    }
}

/// Result of a completed navigation. Discovery happens on the hijacker's
/// event channel, not here.
#[derive(Debug, Clone)]
pub struct NavigationResult {
    pub final_url: Url,
    pub status: u16,
    /// Number of network fetches the navigation performed.
    pub fetched_resources: usize,
}

/// A browser instance leased from the pool.
#[async_trait]
pub trait Browser: Send + Sync {
    /// Load `url`, routing every network fetch through `hijacker`.
    async fn navigate(
        &self,
        url: &Url,
        hijacker: &Hijacker,
    ) -> Result<NavigationResult, BrowserError>;

    /// Tear the instance down. Idempotent.
    async fn close(&self);
}

/// Launches browser instances for the pool.
#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    async fn launch(&self, config: &BrowserConfig) -> Result<Arc<dyn Browser>, BrowserError>;
}
