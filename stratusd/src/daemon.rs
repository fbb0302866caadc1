use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use stratus_core::{AuthClient, DriveClient};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::sync::SyncContext;
use crate::sync::filter::PathFilter;
use crate::sync::hash::HashCache;
use crate::sync::pool::{self, TaskPool};
use crate::sync::remote::Remote;
use crate::sync::store::{self, MetadataStore};
use crate::sync::task::{MergeDirectoryTask, SyncTask};
use crate::sync::transfer::TransferClient;
use crate::sync::watcher::{self, WatchRegistry};

const DEFAULT_SYNC_DIR_NAME: &str = "Stratus";
const DEFAULT_HOST_LABEL: &str = "stratus";
const DEFAULT_WORKERS: usize = 2;
const DEFAULT_SCAN_INTERVAL_SECS: u64 = 21_600;
const IDLE_POLL: Duration = Duration::from_millis(200);

#[derive(Clone, Debug)]
pub struct DaemonConfig {
    pub local_root: PathBuf,
    pub db_path: PathBuf,
    pub ignore_file: Option<PathBuf>,
    pub api_base: Option<String>,
    pub auth_base: Option<String>,
    pub token: String,
    pub refresh_token: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub workers: usize,
    pub scan_interval: Duration,
    pub host_label: String,
    pub enable_watcher: bool,
}

impl DaemonConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let home = dirs::home_dir().context("home directory is unavailable")?;
        let default_root = home.join(DEFAULT_SYNC_DIR_NAME);
        let local_root = std::env::var("STRATUS_LOCAL_DIR")
            .ok()
            .map(|value| expand_with_home(&value, &home))
            .unwrap_or(default_root);
        let db_path = match std::env::var("STRATUS_DB_PATH") {
            Ok(value) => expand_with_home(&value, &home),
            Err(_) => store::default_db_path().context("cannot pick a database location")?,
        };
        let ignore_file = std::env::var("STRATUS_IGNORE_FILE")
            .ok()
            .map(|value| expand_with_home(&value, &home));
        let token = std::env::var("STRATUS_TOKEN").context("STRATUS_TOKEN is not set")?;
        let workers = read_usize_env("STRATUS_WORKERS", DEFAULT_WORKERS);
        let scan_interval = Duration::from_secs(read_u64_env(
            "STRATUS_SCAN_INTERVAL_SECS",
            DEFAULT_SCAN_INTERVAL_SECS,
        ));
        let host_label = std::env::var("STRATUS_HOST_LABEL")
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(default_host_label);
        let enable_watcher = read_bool_env("STRATUS_ENABLE_WATCHER", true);

        Ok(Self {
            local_root,
            db_path,
            ignore_file,
            api_base: std::env::var("STRATUS_API_BASE").ok(),
            auth_base: std::env::var("STRATUS_AUTH_BASE").ok(),
            token,
            refresh_token: std::env::var("STRATUS_REFRESH_TOKEN").ok(),
            client_id: std::env::var("STRATUS_CLIENT_ID").ok(),
            client_secret: std::env::var("STRATUS_CLIENT_SECRET").ok(),
            workers,
            scan_interval,
            host_label,
            enable_watcher,
        })
    }
}

pub struct DaemonRuntime {
    config: DaemonConfig,
    ctx: Arc<SyncContext>,
}

impl std::fmt::Debug for DaemonRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DaemonRuntime")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl DaemonRuntime {
    pub async fn bootstrap(config: DaemonConfig) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(&config.local_root)
            .await
            .with_context(|| format!("failed to create sync root at {:?}", config.local_root))?;

        let client = build_drive_client(&config)?;
        let auth = build_auth_client(&config)?;
        let store = MetadataStore::open(&config.db_path)
            .await
            .context("failed to open the metadata store")?;
        let filter = match &config.ignore_file {
            Some(path) => PathFilter::load(path)
                .await
                .with_context(|| format!("failed to read ignore rules from {path:?}"))?,
            None => PathFilter::with_builtins(),
        };

        let ctx = Arc::new(SyncContext {
            local_root: config.local_root.clone(),
            host_label: config.host_label.clone(),
            store,
            filter,
            pool: TaskPool::new(),
            remote: Remote::new(client, auth, config.refresh_token.clone()),
            transfer: TransferClient::new(),
            hashes: HashCache::new(),
            watches: WatchRegistry::new(),
        });

        let drive = ctx
            .remote
            .drive_info()
            .await
            .context("failed to verify drive credentials")?;
        info!(
            total = drive.total_space,
            used = drive.used_space,
            "drive reachable, credentials accepted"
        );

        Ok(Self { config, ctx })
    }

    pub async fn run(self) -> anyhow::Result<()> {
        info!(
            root = %self.config.local_root.display(),
            workers = self.config.workers,
            host = %self.config.host_label,
            watcher = self.config.enable_watcher,
            "daemon started"
        );
        remove_stale_temp_files(&self.ctx.local_root).await;

        let watch_handle = if self.config.enable_watcher {
            match watcher::create_backend() {
                Ok((backend, rx)) => {
                    self.ctx.watches.install(backend);
                    if let Err(err) = self.ctx.watches.watch(&self.ctx.local_root) {
                        warn!(error = %err, "cannot watch the sync root");
                    }
                    Some(tokio::spawn(watcher::event_loop(
                        Arc::clone(&self.ctx),
                        rx,
                    )))
                }
                Err(err) => {
                    warn!(error = %err, "cannot start the filesystem watcher, running scans only");
                    None
                }
            }
        } else {
            None
        };

        let workers = spawn_workers(&self.ctx, self.config.workers);

        let scan_ctx = Arc::clone(&self.ctx);
        let scan_interval = self.config.scan_interval;
        let scan_handle = tokio::spawn(async move {
            loop {
                schedule_full_scan(&scan_ctx).await;
                tokio::time::sleep(scan_interval).await;
            }
        });

        shutdown_signal()
            .await
            .context("failed waiting for shutdown signal")?;
        info!("shutting down");

        scan_handle.abort();
        if let Some(handle) = watch_handle {
            handle.abort();
        }
        self.ctx.pool.drain(self.config.workers);
        for worker in workers {
            let _ = worker.await;
        }
        Ok(())
    }

    /// Single-shot mode: one full scan, wait for the pool to drain, exit.
    pub async fn run_once(self) -> anyhow::Result<()> {
        info!(root = %self.config.local_root.display(), "running a single full scan");
        remove_stale_temp_files(&self.ctx.local_root).await;
        schedule_full_scan(&self.ctx).await;
        let workers = spawn_workers(&self.ctx, self.config.workers);
        wait_until_idle(&self.ctx.pool).await;
        self.ctx.pool.drain(self.config.workers);
        for worker in workers {
            let _ = worker.await;
        }
        info!("scan finished");
        Ok(())
    }
}

include!("daemon_helpers.rs");

#[cfg(test)]
#[path = "daemon_tests.rs"]
mod tests;
