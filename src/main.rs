//! CLI entry point for the offline cache.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use offline_cache_core::storage::DEFAULT_LOW_STORAGE_THRESHOLD_BYTES;
use offline_cache_core::sync::sync_request;
use offline_cache_core::{
    CatalogRegistry, ContentCatalog, Database, DatabaseOptions, DownloadOrchestrator,
    DownloadPaths, DurableScheduler, FsStorageAdvisor, HostConditions, PoolSettings,
    ReconcilerSettings, RecordStore, RetryPolicy, StaticSession, StorageAdvisor, SyncReconciler,
    SyncWorker, TaskScheduler, TransferWorker, WorkerPool,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

mod app_config;
mod cli;

use app_config::{FileConfig, load_file_config_from, resolve_default_data_dir};
use cli::{Args, Command};

/// Seconds between daemon sync passes when neither flag nor config sets one.
const DEFAULT_SYNC_INTERVAL_SECS: u64 = 3600;

/// Effective settings after merging config file and CLI flags.
#[derive(Debug, Clone)]
struct Settings {
    database_path: PathBuf,
    download_dir: PathBuf,
    catalog_endpoint: Option<String>,
    catalog_token: Option<String>,
    user_id: Option<String>,
    reconciler: ReconcilerSettings,
    low_storage_threshold_bytes: u64,
    worker_concurrency: usize,
    sync_interval: Duration,
    db_options: DatabaseOptions,
}

impl Settings {
    fn resolve(args: &Args, file: FileConfig) -> Self {
        let data_dir = resolve_default_data_dir();
        let mut reconciler = ReconcilerSettings::default();
        if let Some(target) = file.target_duration_secs {
            reconciler.target_duration_secs = target;
        }
        if let Some(max_new) = file.max_new_per_run {
            reconciler.max_new_per_run = max_new as usize;
        }

        let mut db_options = DatabaseOptions::default();
        if let Some(max_connections) = file.db_max_connections {
            db_options.max_connections = max_connections;
        }
        if let Some(busy_timeout_ms) = file.db_busy_timeout_ms {
            db_options.busy_timeout_ms = busy_timeout_ms;
        }

        let cli_interval = match &args.command {
            Command::Daemon { sync_interval } => *sync_interval,
            _ => None,
        };

        Self {
            database_path: args
                .database
                .clone()
                .or(file.database_path)
                .unwrap_or_else(|| data_dir.join("offline-cache.db")),
            download_dir: args
                .download_dir
                .clone()
                .or(file.download_dir)
                .unwrap_or_else(|| data_dir.join("videos")),
            catalog_endpoint: args.catalog.clone().or(file.catalog_endpoint),
            catalog_token: file.catalog_token,
            user_id: args.user.clone().or(file.user_id),
            reconciler,
            low_storage_threshold_bytes: file
                .low_storage_threshold_mb
                .map_or(DEFAULT_LOW_STORAGE_THRESHOLD_BYTES, |mb| {
                    mb.saturating_mul(1024 * 1024)
                }),
            worker_concurrency: args
                .concurrency
                .or(file.worker_concurrency)
                .map_or(PoolSettings::default().max_concurrent, usize::from),
            sync_interval: Duration::from_secs(
                cli_interval
                    .or(file.sync_interval_secs)
                    .unwrap_or(DEFAULT_SYNC_INTERVAL_SECS),
            ),
            db_options,
        }
    }
}

/// Wired components shared by every command.
struct App {
    store: RecordStore,
    scheduler: DurableScheduler,
    storage: Arc<dyn StorageAdvisor>,
    session: Arc<StaticSession>,
    paths: DownloadPaths,
    orchestrator: Arc<DownloadOrchestrator>,
    catalogs: CatalogRegistry,
}

impl App {
    async fn build(settings: &Settings) -> Result<Self> {
        if let Some(parent) = settings.database_path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await.with_context(|| {
                format!("Failed to create database directory '{}'", parent.display())
            })?;
        }

        let paths = DownloadPaths::new(&settings.download_dir);
        paths.ensure_dir().await?;

        let db = Database::with_options(&settings.database_path, settings.db_options).await?;
        debug!(path = %settings.database_path.display(), "database ready");

        let store = RecordStore::new(db.clone());
        let scheduler = DurableScheduler::new(db);
        let storage: Arc<dyn StorageAdvisor> = Arc::new(FsStorageAdvisor::new(
            &settings.download_dir,
            settings.low_storage_threshold_bytes,
        ));
        let session = Arc::new(match &settings.user_id {
            Some(user_id) => StaticSession::signed_in(user_id.clone()),
            None => StaticSession::signed_out(),
        });

        let orchestrator = Arc::new(DownloadOrchestrator::new(
            store.clone(),
            Arc::new(scheduler.clone()),
            Arc::clone(&storage),
            session.clone(),
            paths.clone(),
        ));

        Ok(Self {
            store,
            scheduler,
            storage,
            session,
            paths,
            orchestrator,
            catalogs: CatalogRegistry::new(settings.catalog_token.clone()),
        })
    }

    fn catalog(&self, settings: &Settings) -> Result<Arc<dyn ContentCatalog>> {
        let Some(endpoint) = settings.catalog_endpoint.as_deref() else {
            bail!("No catalog endpoint configured. Set `catalog_endpoint` or pass --catalog");
        };
        let client: Arc<dyn ContentCatalog> = self.catalogs.client_for(endpoint)?;
        Ok(client)
    }

    fn reconciler(&self, settings: &Settings) -> Result<Arc<SyncReconciler>> {
        Ok(Arc::new(SyncReconciler::new(
            self.store.clone(),
            self.catalog(settings)?,
            Arc::clone(&self.orchestrator),
            Arc::clone(&self.storage),
            self.session.clone(),
            settings.reconciler.clone(),
        )))
    }

    fn worker_pool(&self, settings: &Settings) -> Result<WorkerPool> {
        let catalog = self.catalog(settings)?;
        let transfer =
            TransferWorker::new(Arc::new(self.store.clone()), catalog, self.paths.clone())?;
        let sync = SyncWorker::new(self.reconciler(settings)?);
        let conditions = Arc::new(HostConditions::new(Arc::clone(&self.storage)));

        let pool_settings = PoolSettings {
            max_concurrent: settings.worker_concurrency,
            ..PoolSettings::default()
        };
        Ok(WorkerPool::new(
            self.scheduler.clone(),
            conditions,
            RetryPolicy::default(),
            pool_settings,
        )
        .with_worker(Arc::new(transfer))
        .with_worker(Arc::new(sync)))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (info)
    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    debug!(?args, "CLI arguments parsed");

    let loaded = load_file_config_from(args.config.as_deref())?;
    if let Some(path) = loaded.path.as_deref()
        && loaded.config.is_some()
    {
        debug!(path = %path.display(), "loaded config file");
    }
    let settings = Settings::resolve(&args, loaded.config.unwrap_or_default());
    debug!(?settings, "effective settings");

    let app = App::build(&settings).await?;
    run_command(&app, &settings, args.command).await
}

async fn run_command(app: &App, settings: &Settings, command: Command) -> Result<()> {
    let orchestrator = &app.orchestrator;
    match command {
        Command::Start {
            media_item_id,
            any_network,
        } => {
            let id = orchestrator.start(&media_item_id, !any_network).await?;
            println!("{id}");
        }
        Command::Cancel { download_id } => {
            orchestrator.cancel(&download_id).await?;
            info!(download_id = %download_id, "download cancelled");
        }
        Command::CancelItem { media_item_id } => {
            orchestrator.cancel_by_media_item(&media_item_id).await?;
            info!(media_item_id = %media_item_id, "download cancelled");
        }
        Command::CancelAll => {
            let cancelled = orchestrator.cancel_all().await?;
            info!(cancelled, "cancelled all downloads");
        }
        Command::Retry { download_id } => {
            let id = orchestrator.retry(&download_id).await?;
            println!("{id}");
        }
        Command::Delete { download_id } => {
            orchestrator.delete(&download_id).await?;
            info!(download_id = %download_id, "download deleted");
        }
        Command::List => {
            let downloads = orchestrator.list_downloads().await?;
            if downloads.is_empty() {
                println!("No downloads.");
            }
            for record in downloads {
                println!(
                    "{}\t{}\t{}\t{:.0}%\t{}",
                    record.id,
                    record.media_item_id,
                    record.status(),
                    record.progress * 100.0,
                    record.error_message.as_deref().unwrap_or("")
                );
            }
        }
        Command::Stats => {
            let stats = orchestrator.statistics().await?;
            println!("pending      {}", stats.pending);
            println!("downloading  {}", stats.downloading);
            println!("completed    {}", stats.completed);
            println!("failed       {}", stats.failed);
            println!("cancelled    {}", stats.cancelled);
            println!("on disk      {} bytes", stats.completed_bytes);
            println!("duration     {} s", stats.downloaded_duration_secs);
        }
        Command::Sync => {
            let report = app.reconciler(settings)?.run_once().await?;
            for (phase, error) in &report.phase_errors {
                warn!(%phase, error = %error, "sync phase failed");
            }
            info!(
                refreshed = report.refreshed,
                evicted = report.evicted,
                queued = report.queued,
                "sync complete"
            );
        }
        Command::Work => {
            let pool = app.worker_pool(settings)?;
            let recovered = pool.recover().await?;
            if recovered > 0 {
                info!(recovered, "re-enqueued interrupted work");
            }
            let stats = pool.run_until_idle().await?;
            info!(
                succeeded = stats.succeeded,
                failed = stats.failed,
                retried = stats.retried,
                cancelled = stats.cancelled,
                deferred = stats.deferred,
                "work drained"
            );
        }
        Command::Daemon { .. } => run_daemon(app, settings).await?,
    }
    Ok(())
}

async fn run_daemon(app: &App, settings: &Settings) -> Result<()> {
    let pool = app.worker_pool(settings)?;
    let shutdown = CancellationToken::new();
    let pool_shutdown = shutdown.clone();
    let pool_task = tokio::spawn(async move { pool.run(pool_shutdown).await });

    info!(
        interval_secs = settings.sync_interval.as_secs(),
        "daemon started"
    );

    let mut ticker = tokio::time::interval(settings.sync_interval);
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(error) = signal {
                    warn!(error = %error, "failed to listen for interrupt");
                }
                info!("interrupt received, shutting down");
                break;
            }
            _ = ticker.tick() => {
                match app.scheduler.enqueue_unique(sync_request()).await {
                    Ok(handle) => debug!(work_id = %handle, "sync enqueued"),
                    Err(error) => warn!(error = %error, "failed to enqueue sync"),
                }
            }
        }
    }

    shutdown.cancel();
    let stats = pool_task.await.context("worker pool task failed")??;
    info!(executed = stats.executed(), "daemon stopped");
    Ok(())
}
