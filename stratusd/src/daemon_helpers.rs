fn expand_with_home(value: &str, home: &Path) -> PathBuf {
    if value == "~" {
        return home.to_path_buf();
    }
    if let Some(rest) = value.strip_prefix("~/") {
        return home.join(rest);
    }
    PathBuf::from(value)
}

fn default_host_label() -> String {
    std::fs::read_to_string("/etc/hostname")
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| DEFAULT_HOST_LABEL.to_string())
}

fn read_u64_env(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

fn read_usize_env(name: &str, default: usize) -> usize {
    std::env::var(name)
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

fn read_bool_env(name: &str, default: bool) -> bool {
    std::env::var(name)
        .ok()
        .map(|value| {
            matches!(
                value.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            )
        })
        .unwrap_or(default)
}

fn build_drive_client(config: &DaemonConfig) -> anyhow::Result<DriveClient> {
    let client = match config.api_base.as_deref() {
        Some(base) => DriveClient::with_base_url(base, config.token.clone()),
        None => DriveClient::new(config.token.clone()),
    };
    client.context("invalid drive api configuration")
}

fn build_auth_client(config: &DaemonConfig) -> anyhow::Result<Option<AuthClient>> {
    match (config.client_id.as_deref(), config.client_secret.as_deref()) {
        (Some(client_id), Some(client_secret)) => {
            let client = match config.auth_base.as_deref() {
                Some(base) => AuthClient::with_base_url(base, client_id, client_secret),
                None => AuthClient::new(client_id, client_secret),
            };
            Ok(Some(client.context("invalid auth configuration")?))
        }
        _ => Ok(None),
    }
}

fn spawn_workers(ctx: &Arc<SyncContext>, count: usize) -> Vec<JoinHandle<()>> {
    (0..count)
        .map(|_| tokio::spawn(pool::worker_loop(Arc::clone(ctx))))
        .collect()
}

/// One rescan generation: drop records the previous rescan never confirmed,
/// re-mark everything, queue a deep merge of the root. Skipped while sync
/// work is still in flight so scans never stack up.
async fn schedule_full_scan(ctx: &SyncContext) {
    if ctx.pool.outstanding() > 0 || ctx.pool.active_count() > 0 {
        info!("skipping the scheduled rescan, sync work is still in flight");
        return;
    }
    match ctx.store.sweep().await {
        Ok(0) => {}
        Ok(swept) => info!(records = swept, "dropped records the last rescan never confirmed"),
        Err(err) => {
            warn!(error = %err, "sweep failed, skipping this rescan");
            return;
        }
    }
    if let Err(err) = ctx.store.mark_all().await {
        warn!(error = %err, "cannot mark records for the rescan");
        return;
    }
    info!("starting a full rescan");
    queue_root_merge(ctx);
}

fn queue_root_merge(ctx: &SyncContext) {
    let task = SyncTask::MergeDirectory(MergeDirectoryTask {
        rel_path: String::new(),
        local_path: ctx.local_root.clone(),
        deep: true,
        assume_remote_unchanged: false,
        parent_remote_unchanged: false,
    });
    if !ctx.pool.add(task) {
        debug!("root merge not queued, path already occupied");
    }
}

async fn wait_until_idle(pool: &TaskPool) {
    while pool.outstanding() > 0 || pool.active_count() > 0 {
        tokio::time::sleep(IDLE_POLL).await;
    }
}

/// Clears partial-download leftovers from an earlier run.
async fn remove_stale_temp_files(root: &Path) {
    let mut dirs = vec![root.to_path_buf()];
    while let Some(dir) = dirs.pop() {
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) => {
                debug!(path = %dir.display(), error = %err, "cannot scan directory for leftovers");
                continue;
            }
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let Ok(file_type) = entry.file_type().await else {
                continue;
            };
            if file_type.is_dir() {
                dirs.push(entry.path());
            } else if entry
                .file_name()
                .to_str()
                .is_some_and(PathFilter::is_temp_name)
            {
                let path = entry.path();
                match tokio::fs::remove_file(&path).await {
                    Ok(()) => info!(path = %path.display(), "removed stale temporary file"),
                    Err(err) => {
                        warn!(path = %path.display(), error = %err, "cannot remove stale temporary file")
                    }
                }
            }
        }
    }
}

async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res,
            _ = term.recv() => Ok(()),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await
    }
}
