//! The thin host CLI.
//!
//! The engine itself has no operator surface; this binary wires
//! configuration into it. `scan` runs one scan in isolated mode on this
//! node, `worker` joins the shared claim queue and serves until
//! interrupted.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};

use crate::checks::CheckRegistry;
use crate::config::DatabaseConfig;
use crate::crawler::execute_scan;
use crate::db::{MemoryStore, PgStore, ScanStore};
use crate::interactions::{InteractionsConfig, InteractionsManager, attach_store};
use crate::models::{ScanMode, ScanOptions};
use crate::scheduler::{ScanManager, SchedulerConfig};

#[derive(Parser, Debug)]
#[command(name = "lycosa", version, about = "Web application security scanner")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run one scan in isolated mode on this node
    Scan(ScanArgs),
    /// Join the shared queue as a worker node
    Worker(WorkerArgs),
}

#[derive(Args, Debug)]
pub struct ScanArgs {
    /// Start URLs (absolute http(s))
    #[arg(required = true)]
    pub urls: Vec<String>,

    /// Scan title
    #[arg(long)]
    pub title: Option<String>,

    /// Crawl depth cap; 0 means unbounded
    #[arg(long, default_value_t = 0)]
    pub max_depth: usize,

    /// Global page cap; 0 means unbounded
    #[arg(long, default_value_t = 0)]
    pub max_pages: usize,

    /// Regexes for URLs to skip
    #[arg(long)]
    pub exclude: Vec<String>,

    /// fast, smart or fuzz
    #[arg(long, default_value = "smart")]
    pub mode: String,

    #[arg(long, default_value_t = 1)]
    pub workspace: i32,

    /// Worker slots for this scan
    #[arg(long, default_value_t = 4)]
    pub workers: usize,

    /// Token-bucket cap on outbound requests per second
    #[arg(long)]
    pub max_rps: Option<u32>,

    #[arg(long)]
    pub max_concurrent_jobs: Option<usize>,

    /// Out-of-band server; OOB payloads are skipped when unset
    #[arg(long, env = "LYCOSA_OOB_SERVER")]
    pub oob_server: Option<String>,

    /// Path of the persisted OOB session
    #[arg(long, env = "LYCOSA_OOB_SESSION")]
    pub oob_session: Option<PathBuf>,

    /// Use the in-memory store instead of PostgreSQL
    #[arg(long)]
    pub memory: bool,
}

#[derive(Args, Debug)]
pub struct WorkerArgs {
    /// Worker slots for this node
    #[arg(long, default_value_t = 4)]
    pub workers: usize,

    /// Node identifier; generated when omitted
    #[arg(long)]
    pub node_id: Option<String>,

    /// Out-of-band server; OOB payloads are skipped when unset
    #[arg(long, env = "LYCOSA_OOB_SERVER")]
    pub oob_server: Option<String>,
}

pub async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Command::Scan(args) => run_scan(args).await,
        Command::Worker(args) => run_worker(args).await,
    }
}

async fn open_store(memory: bool) -> anyhow::Result<Arc<dyn ScanStore>> {
    if memory {
        return Ok(Arc::new(MemoryStore::new()));
    }
    let config = DatabaseConfig::from_env().context("database configuration")?;
    let store = PgStore::new(&config)
        .await
        .context("connecting to the database")?;
    PgStore::migration_hint();
    Ok(Arc::new(store))
}

async fn interactions_for(
    server: Option<&str>,
    session_file: Option<PathBuf>,
    store: &Arc<dyn ScanStore>,
) -> anyhow::Result<(Arc<InteractionsManager>, bool)> {
    let Some(server) = server else {
        // Never started: checks see no session and skip OOB payloads.
        let idle = Arc::new(InteractionsManager::http(InteractionsConfig::new(
            "http://oob.invalid",
        )));
        return Ok((idle, false));
    };

    let mut config = InteractionsConfig::new(server);
    if let Some(path) = session_file {
        config = config.with_session_file(path);
    }
    let manager = Arc::new(InteractionsManager::http(config));
    attach_store(&manager, store.clone());
    manager
        .start()
        .await
        .context("starting the out-of-band session")?;
    Ok((manager, true))
}

async fn run_scan(args: ScanArgs) -> anyhow::Result<()> {
    let store = open_store(args.memory).await?;

    let mut options = ScanOptions::new(args.workspace, args.urls);
    options.title = args.title.unwrap_or_default();
    options.max_depth = args.max_depth;
    options.max_pages_to_crawl = args.max_pages;
    options.exclude_patterns = args.exclude;
    options.mode = args
        .mode
        .parse::<ScanMode>()
        .map_err(|e| anyhow::anyhow!(e))?;
    options.max_rps = args.max_rps;
    options.max_concurrent_jobs = args.max_concurrent_jobs;
    options
        .validate()
        .context("invalid scan options")?;

    let (interactions, oob_started) =
        interactions_for(args.oob_server.as_deref(), args.oob_session, &store).await?;

    let config = SchedulerConfig::default().with_workers(args.workers);
    let scan = execute_scan(
        store.clone(),
        options,
        Arc::new(CheckRegistry::builtin()),
        interactions.clone(),
        config,
    )
    .await?;

    if oob_started {
        interactions.stop().await;
    }

    let stats = store.scan_job_stats(scan.id).await?;
    println!("scan {} finished: {}", scan.id, scan.status);
    println!(
        "jobs: {} completed, {} failed, {} cancelled",
        stats.completed, stats.failed, stats.cancelled
    );
    Ok(())
}

async fn run_worker(args: WorkerArgs) -> anyhow::Result<()> {
    let store = open_store(false).await?;
    let (interactions, oob_started) =
        interactions_for(args.oob_server.as_deref(), None, &store).await?;

    let (events_tx, mut events_rx) = tokio::sync::mpsc::channel(256);
    // Frontier expansion belongs to the node driving the scan; a plain
    // worker records crawled exchanges but enqueues nothing from them.
    tokio::spawn(async move { while events_rx.recv().await.is_some() {} });

    let client = reqwest::Client::builder()
        .danger_accept_invalid_certs(true)
        .build()
        .unwrap_or_default();
    let browsers = Arc::new(crate::browser::BrowserPool::http(
        crate::browser::BrowserConfig::default(),
    ));
    let handles = crate::checks::CheckHandles {
        executor: Arc::new(crate::executor::RequestExecutor::new(client, store.clone())),
        browsers: browsers.clone(),
        interactions: interactions.clone(),
        payloads: Arc::new(crate::payloads::PayloadGenerators::with_interactions(
            interactions.clone(),
        )),
        store: store.clone(),
        hijack_events: events_tx,
    };

    let mut config = SchedulerConfig::default().with_workers(args.workers);
    if let Some(node_id) = args.node_id {
        config.node_id = node_id;
    }
    let manager = ScanManager::new(
        config,
        store.clone(),
        Arc::new(CheckRegistry::builtin()),
        handles,
    );
    manager.start().await.context("starting the worker node")?;
    println!("worker node {} serving; ctrl-c to stop", manager.node_id());

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    tracing::info!("shutdown requested");

    // Workers first, then the browser pool, then the interactions
    // session.
    manager.stop().await;
    browsers.shutdown().await;
    if oob_started {
        interactions.stop().await;
    }
    Ok(())
}
