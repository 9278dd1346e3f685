//! Fixed-capacity browser pool.
//!
//! Leases are blocking and exclusive: `acquire` waits for a free slot,
//! launches lazily, and the returned lease hands the instance back on
//! drop. `shutdown` closes idle and leased instances alike.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::browser::{Browser, BrowserConfig, BrowserLauncher, HttpBrowserLauncher};
use crate::error::BrowserError;

struct Shared {
    config: BrowserConfig,
    launcher: Arc<dyn BrowserLauncher>,
    idle: Mutex<Vec<Arc<dyn Browser>>>,
    /// Every instance ever launched, for shutdown.
    all: Mutex<Vec<Arc<dyn Browser>>>,
    closed: AtomicBool,
}

/// A pool of browser instances with a fixed ceiling.
pub struct BrowserPool {
    shared: Arc<Shared>,
    permits: Arc<Semaphore>,
}

impl BrowserPool {
    pub fn new(config: BrowserConfig, launcher: Arc<dyn BrowserLauncher>) -> Self {
        let permits = Arc::new(Semaphore::new(config.pool_size));
        Self {
            shared: Arc::new(Shared {
                config,
                launcher,
                idle: Mutex::new(Vec::new()),
                all: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
            }),
            permits,
        }
    }

    /// Pool backed by the shipped HTTP engine.
    pub fn http(config: BrowserConfig) -> Self {
        Self::new(config, Arc::new(HttpBrowserLauncher))
    }

    pub fn config(&self) -> &BrowserConfig {
        &self.shared.config
    }

    /// Lease a browser, blocking until a slot frees up. Instances are
    /// launched on demand, up to the pool ceiling.
    pub async fn acquire(&self) -> Result<BrowserLease, BrowserError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(BrowserError::PoolClosed);
        }
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| BrowserError::PoolClosed)?;
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(BrowserError::PoolClosed);
        }

        let reused = self.shared.idle.lock().expect("pool lock").pop();
        let browser = match reused {
            Some(browser) => browser,
            None => {
                let browser = self.shared.launcher.launch(&self.shared.config).await?;
                self.shared
                    .all
                    .lock()
                    .expect("pool lock")
                    .push(browser.clone());
                browser
            }
        };

        Ok(BrowserLease {
            browser,
            shared: self.shared.clone(),
            poisoned: AtomicBool::new(false),
            _permit: permit,
        })
    }

    /// Close every instance, idle or leased, and fail pending leases.
    pub async fn shutdown(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.permits.close();
        self.shared.idle.lock().expect("pool lock").clear();
        let all: Vec<Arc<dyn Browser>> =
            self.shared.all.lock().expect("pool lock").drain(..).collect();
        for browser in all {
            browser.close().await;
        }
        tracing::debug!(source = %self.shared.config.source, "browser pool shut down");
    }
}

/// An exclusive lease on one browser instance. Dropping it returns the
/// instance to the pool; a poisoned lease closes the instance instead,
/// and the next `acquire` launches a replacement.
pub struct BrowserLease {
    browser: Arc<dyn Browser>,
    shared: Arc<Shared>,
    poisoned: AtomicBool,
    _permit: OwnedSemaphorePermit,
}

impl BrowserLease {
    pub fn browser(&self) -> &dyn Browser {
        self.browser.as_ref()
    }

    /// Mark the instance unhealthy: it will not rejoin the idle stack.
    pub fn poison(&self) {
        self.poisoned.store(true, Ordering::SeqCst);
    }
}

impl std::ops::Deref for BrowserLease {
    type Target = dyn Browser;

    fn deref(&self) -> &Self::Target {
        self.browser.as_ref()
    }
}

impl Drop for BrowserLease {
    fn drop(&mut self) {
        if self.shared.closed.load(Ordering::SeqCst) {
            return;
        }
        if self.poisoned.load(Ordering::SeqCst) {
            self.shared
                .all
                .lock()
                .expect("pool lock")
                .retain(|b| !Arc::ptr_eq(b, &self.browser));
            let browser = self.browser.clone();
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move { browser.close().await });
            }
            tracing::debug!("dropped poisoned browser instance");
            return;
        }
        self.shared
            .idle
            .lock()
            .expect("pool lock")
            .push(self.browser.clone());
    }
}
