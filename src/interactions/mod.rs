//! Out-of-band interactions manager.
//!
//! Checks plant payloads whose side effects (DNS lookups, HTTP callbacks)
//! land on an external OOB server. This manager mints the unique
//! identifiers those payloads carry, polls the server on a single
//! long-lived task, and hands received interactions to the configured
//! callback. Eviction by the server rotates the correlation prefix;
//! the session survives restarts through a persisted session file.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::cancel::{CancelFlag, CancelHandle, cancel_pair};
use crate::error::OobError;
use crate::models::OobInteraction;

pub mod client;
pub mod session;

pub use client::{HttpOobClient, OobClient, RawInteraction};
pub use session::{FULL_ID_SUFFIX_LEN, OobSession, random_id};

/// Invoked once per received interaction, on the polling task. Must not
/// block; heavy work belongs on the caller's own workers.
pub type InteractionCallback = Arc<dyn Fn(OobInteraction) + Send + Sync>;

/// Invoked when the server evicts our correlation prefix. When none is
/// set, the manager restarts itself.
pub type EvictionCallback = Arc<dyn Fn() + Send + Sync>;

/// Manager tuning.
#[derive(Debug, Clone)]
pub struct InteractionsConfig {
    pub server_url: String,
    pub poll_interval: Duration,
    pub keep_alive_interval: Duration,
    /// Single opaque session file.
    pub session_file: PathBuf,
}

impl InteractionsConfig {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            poll_interval: Duration::from_secs(5),
            keep_alive_interval: Duration::from_secs(60),
            session_file: PathBuf::from(".lycosa/oob-session.json"),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_session_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.session_file = path.into();
        self
    }
}

/// A minted OOB identifier: the host to embed in a payload, plus the
/// full-id to record on the test.
#[derive(Debug, Clone)]
pub struct OobUrl {
    pub host: String,
    pub full_id: String,
}

impl OobUrl {
    pub fn http_url(&self) -> String {
        format!("http://{}/", self.host)
    }
}

/// Wire the manager's interaction callback to a store: every delivered
/// interaction is attributed to the OOB test whose full-id prefix matches,
/// persisted, and turned into an issue linked to that test's owners.
/// Unattributable interactions are dropped.
pub fn attach_store(manager: &InteractionsManager, store: Arc<dyn crate::db::ScanStore>) {
    manager.set_on_interaction(Arc::new(move |interaction| {
        let store = store.clone();
        // The callback runs on the polling task and must not block.
        tokio::spawn(async move {
            let test = match store
                .find_oob_test_for_interaction(&interaction.full_id)
                .await
            {
                Ok(Some(test)) => test,
                Ok(None) => {
                    tracing::debug!(
                        full_id = %interaction.full_id,
                        "interaction matches no registered test, dropping"
                    );
                    return;
                }
                Err(e) => {
                    tracing::warn!("failed to look up out-of-band test: {e}");
                    return;
                }
            };

            let mut interaction = interaction;
            interaction.oob_test_id = Some(test.id);
            if let Err(e) = store.save_oob_interaction(&interaction).await {
                tracing::warn!("failed to persist interaction: {e}");
            }

            let issue = crate::models::Issue::from_kind(
                crate::models::IssueKind::OutOfBandInteraction,
                &test.target,
                test.workspace_id,
            )
            .with_confidence(95)
            .with_details(format!(
                "The payload planted by {} triggered a {} interaction from {} \
                 (full id {}).",
                test.test_name, interaction.protocol, interaction.remote_address,
                interaction.full_id
            ))
            .with_owner(test.scan_id, test.job_id);
            if let Err(e) = store.save_issue(&issue).await {
                tracing::warn!("failed to persist out-of-band issue: {e}");
            } else {
                tracing::info!(
                    test = %test.test_name,
                    target = %test.target,
                    "out-of-band interaction confirmed"
                );
            }
        });
    }));
}

/// State shared between the manager handle and its polling task.
struct ManagerState {
    client: Arc<dyn OobClient>,
    config: InteractionsConfig,
    session: RwLock<Option<OobSession>>,
    issued: Mutex<HashSet<String>>,
    on_interaction: RwLock<Option<InteractionCallback>>,
    on_eviction: RwLock<Option<EvictionCallback>>,
    last_delivery: Mutex<Instant>,
    delivered: AtomicU32,
}

impl ManagerState {
    fn current_session(&self) -> Option<OobSession> {
        self.session.read().expect("session lock").clone()
    }

    fn deliver(&self, raw: RawInteraction) {
        let prefix_matches = self
            .session
            .read()
            .expect("session lock")
            .as_ref()
            .is_some_and(|s| raw.full_id.starts_with(&s.correlation_id));
        if !prefix_matches {
            tracing::debug!(full_id = %raw.full_id, "dropping unattributable interaction");
            return;
        }

        *self.last_delivery.lock().expect("delivery lock") = Instant::now();
        self.delivered.fetch_add(1, Ordering::SeqCst);

        let callback = self.on_interaction.read().expect("callback lock").clone();
        if let Some(callback) = callback {
            let mut interaction = OobInteraction::new(raw.protocol, raw.full_id);
            interaction.remote_address = raw.remote_address;
            interaction.timestamp = raw.timestamp;
            interaction.raw_data = raw.raw_data;
            callback(interaction);
        }
    }

    /// Rotate the correlation prefix and purge in-flight registrations.
    async fn restart(&self) -> Result<(), OobError> {
        let old = self.current_session();
        if let Some(old) = &old {
            if let Err(e) = self.client.deregister(old).await {
                tracing::debug!("deregister of evicted session failed: {e}");
            }
        }

        let fresh = OobSession::mint(&self.config.server_url);
        self.client.register(&fresh).await?;
        fresh.persist(&self.config.session_file).await?;
        tracing::info!(correlation_id = %fresh.correlation_id, "rotated out-of-band session");

        *self.session.write().expect("session lock") = Some(fresh);
        self.issued.lock().expect("issued lock").clear();
        Ok(())
    }

    async fn handle_eviction(&self) {
        tracing::warn!("out-of-band correlation prefix was evicted");
        let callback = self.on_eviction.read().expect("callback lock").clone();
        match callback {
            Some(callback) => callback(),
            None => {
                if let Err(e) = self.restart().await {
                    tracing::error!("failed to restart after eviction: {e}");
                }
            }
        }
    }
}

/// Process-wide OOB correlator with a Start/Stop lifecycle.
pub struct InteractionsManager {
    state: Arc<ManagerState>,
    poller: tokio::sync::Mutex<Option<(CancelHandle, JoinHandle<()>)>>,
}

impl InteractionsManager {
    pub fn new(client: Arc<dyn OobClient>, config: InteractionsConfig) -> Self {
        Self {
            state: Arc::new(ManagerState {
                client,
                config,
                session: RwLock::new(None),
                issued: Mutex::new(HashSet::new()),
                on_interaction: RwLock::new(None),
                on_eviction: RwLock::new(None),
                last_delivery: Mutex::new(Instant::now()),
                delivered: AtomicU32::new(0),
            }),
            poller: tokio::sync::Mutex::new(None),
        }
    }

    /// Manager talking to a real server.
    pub fn http(config: InteractionsConfig) -> Self {
        Self::new(Arc::new(HttpOobClient::new()), config)
    }

    pub fn set_on_interaction(&self, callback: InteractionCallback) {
        *self.state.on_interaction.write().expect("callback lock") = Some(callback);
    }

    pub fn set_on_eviction(&self, callback: EvictionCallback) {
        *self.state.on_eviction.write().expect("callback lock") = Some(callback);
    }

    /// Current correlation prefix, once started.
    pub fn correlation_id(&self) -> Option<String> {
        self.state.current_session().map(|s| s.correlation_id)
    }

    /// Number of interactions delivered since start.
    pub fn delivered(&self) -> u32 {
        self.state.delivered.load(Ordering::SeqCst)
    }

    pub fn poll_interval(&self) -> Duration {
        self.state.config.poll_interval
    }

    /// Initialise the session (resuming from the session file when one
    /// exists) and start the polling task. Idempotent.
    pub async fn start(&self) -> Result<(), OobError> {
        let mut poller = self.poller.lock().await;
        if poller.is_some() {
            return Ok(());
        }

        let config = &self.state.config;
        let session = match OobSession::load(&config.session_file).await? {
            Some(session) => {
                tracing::info!(
                    correlation_id = %session.correlation_id,
                    "resuming out-of-band session"
                );
                session
            }
            None => OobSession::mint(&config.server_url),
        };
        // Registration is idempotent server-side; resuming re-asserts the
        // prefix.
        self.state.client.register(&session).await?;
        session.persist(&config.session_file).await?;
        *self.state.session.write().expect("session lock") = Some(session);

        let (handle, flag) = cancel_pair();
        let task = tokio::spawn(run_poller(self.state.clone(), flag));
        *poller = Some((handle, task));
        Ok(())
    }

    /// Mint a per-call full-id under the current correlation prefix.
    /// Interleaved calls are safe.
    pub fn oob_url(&self) -> Result<OobUrl, OobError> {
        let session = self
            .state
            .current_session()
            .ok_or(OobError::NotRegistered)?;
        let full_id = format!(
            "{}{}",
            session.correlation_id,
            random_id(FULL_ID_SUFFIX_LEN)
        );
        self.state
            .issued
            .lock()
            .expect("issued lock")
            .insert(full_id.clone());
        let domain = session.oob_domain()?;
        Ok(OobUrl {
            host: format!("{full_id}.{domain}"),
            full_id,
        })
    }

    /// Rotate the correlation prefix: deregister the old session (best
    /// effort), register a fresh one, purge in-flight registrations.
    /// Identifiers issued before the rotation will never fire.
    pub async fn restart(&self) -> Result<(), OobError> {
        self.state.restart().await
    }

    /// Stop the poller and persist the session for later resumption.
    pub async fn stop(&self) {
        let taken = self.poller.lock().await.take();
        if let Some((handle, task)) = taken {
            handle.cancel();
            let _ = task.await;
        }
        if let Some(session) = self.state.current_session() {
            if let Err(e) = session.persist(&self.state.config.session_file).await {
                tracing::warn!("failed to persist out-of-band session: {e}");
            }
        }
    }

    /// Wait until no interaction has been delivered for `window`, bounded
    /// by `ceiling`.
    pub async fn quiesce(&self, window: Duration, ceiling: Duration) {
        let deadline = Instant::now() + ceiling;
        loop {
            let idle = self
                .state
                .last_delivery
                .lock()
                .expect("delivery lock")
                .elapsed();
            if idle >= window || Instant::now() >= deadline {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50).min(window)).await;
        }
    }
}

async fn run_poller(state: Arc<ManagerState>, cancel: CancelFlag) {
    let mut poll = tokio::time::interval(state.config.poll_interval);
    poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut keep_alive = tokio::time::interval(state.config.keep_alive_interval);
    keep_alive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut failures: u32 = 0;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = poll.tick() => {
                let Some(session) = state.current_session() else { continue };
                match state.client.poll(&session).await {
                    Ok(interactions) => {
                        failures = 0;
                        for raw in interactions {
                            state.deliver(raw);
                        }
                    }
                    Err(OobError::Evicted) => state.handle_eviction().await,
                    Err(e) => {
                        failures += 1;
                        let backoff = state
                            .config
                            .poll_interval
                            .saturating_mul(2u32.saturating_pow(failures.min(5)))
                            .min(Duration::from_secs(60));
                        tracing::warn!(
                            failures,
                            "out-of-band poll failed, backing off {backoff:?}: {e}"
                        );
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(backoff) => {}
                        }
                    }
                }
            }
            _ = keep_alive.tick() => {
                let Some(session) = state.current_session() else { continue };
                if let Err(OobError::Evicted) = state.client.keep_alive(&session).await {
                    state.handle_eviction().await;
                }
            }
        }
    }
}
