use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use notify::event::{AccessKind, AccessMode, CreateKind, ModifyKind, RemoveKind, RenameMode};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use stratus_core::ResourceKind;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::SyncContext;
use super::filter::PathFilter;
use super::merge::split_name;
use super::paths::{child_rel, drive_path, local_path_for, rel_from_local, split_rel};
use super::task::{
    CreateFolderTask, DeleteTask, MergeDirectoryTask, MoveTask, SyncTask, UpdateTimestampTask,
    UploadTask,
};

/// How long to keep collecting filesystem events after the first one before
/// acting, so rapid bursts are handled as one batch.
pub const BATCH_DELAY: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FsEventKind {
    Created,
    Written,
    Removed,
    MovedFrom,
    MovedTo,
}

/// One filesystem event after translation from the backend's vocabulary.
/// Rename halves carry a cookie; two halves with the same cookie form a move.
#[derive(Debug, Clone)]
struct FsEvent {
    kind: FsEventKind,
    path: PathBuf,
    is_dir: bool,
    cookie: Option<usize>,
}

struct MovePair {
    from: FsEvent,
    to: FsEvent,
}

struct RegistryState {
    backend: Option<RecommendedWatcher>,
    watched: HashSet<PathBuf>,
}

/// Tracks which directories are under watch, one non-recursive watch per
/// directory. Without an installed backend it only does the bookkeeping,
/// which is what the scan-only mode and the tests run with.
pub struct WatchRegistry {
    state: Mutex<RegistryState>,
}

impl WatchRegistry {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RegistryState {
                backend: None,
                watched: HashSet::new(),
            }),
        }
    }

    pub fn install(&self, backend: RecommendedWatcher) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.backend = Some(backend);
    }

    pub fn watch(&self, path: &Path) -> Result<(), notify::Error> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.watched.contains(path) {
            return Ok(());
        }
        if let Some(backend) = state.backend.as_mut() {
            backend.watch(path, RecursiveMode::NonRecursive)?;
        }
        state.watched.insert(path.to_path_buf());
        Ok(())
    }

    pub fn unwatch(&self, path: &Path) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.watched.remove(path)
            && let Some(backend) = state.backend.as_mut()
            && let Err(err) = backend.unwatch(path)
        {
            debug!(path = %path.display(), error = %err, "backend unwatch failed");
        }
    }

    /// Drops the watch on `root` and on everything registered beneath it.
    /// Used when a directory tree is moved or deleted; the backend keys
    /// watches by the paths they were added under.
    pub fn unwatch_subtree(&self, root: &Path) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let doomed: Vec<PathBuf> = state
            .watched
            .iter()
            .filter(|path| path.starts_with(root))
            .cloned()
            .collect();
        for path in doomed {
            state.watched.remove(&path);
            if let Some(backend) = state.backend.as_mut()
                && let Err(err) = backend.unwatch(&path)
            {
                debug!(path = %path.display(), error = %err, "backend unwatch failed");
            }
        }
    }

    pub fn contains(&self, path: &Path) -> bool {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.watched.contains(path)
    }
}

impl Default for WatchRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Starts the platform watch backend. Raw events flow into the returned
/// channel; the handle must be installed into the registry to stay alive.
pub fn create_backend() -> Result<
    (
        RecommendedWatcher,
        mpsc::UnboundedReceiver<notify::Result<notify::Event>>,
    ),
    notify::Error,
> {
    let (tx, rx) = mpsc::unbounded_channel();
    let backend = notify::recommended_watcher(move |result| {
        let _ = tx.send(result);
    })?;
    Ok((backend, rx))
}

/// Drains the event channel in batches: wait for one event, linger for the
/// burst to settle, then reconcile the whole batch at once.
pub async fn event_loop(
    ctx: std::sync::Arc<SyncContext>,
    mut rx: mpsc::UnboundedReceiver<notify::Result<notify::Event>>,
) {
    while let Some(first) = rx.recv().await {
        tokio::time::sleep(BATCH_DELAY).await;
        let mut raw = vec![first];
        while let Ok(more) = rx.try_recv() {
            raw.push(more);
        }
        process_batch(&ctx, raw).await;
    }
    debug!("watch event channel closed");
}

async fn process_batch(ctx: &SyncContext, raw: Vec<notify::Result<notify::Event>>) {
    let events = translate_events(&ctx.watches, raw);
    let pairs = pair_moves(&events);
    let mut batch = EventBatch {
        ctx,
        queue: Vec::new(),
    };
    for event in &events {
        batch.handle_event(event, &pairs).await;
    }
    batch.flush();
}

/// Maps backend events onto the five shapes the sync logic cares about.
/// The inotify backend reports a paired rename three times (from, to, both);
/// only the halves are kept, deduplicated through the both-event's tracker.
fn translate_events(
    watches: &WatchRegistry,
    raw: Vec<notify::Result<notify::Event>>,
) -> Vec<FsEvent> {
    let mut paired = HashSet::new();
    for result in &raw {
        if let Ok(event) = result
            && matches!(
                event.kind,
                EventKind::Modify(ModifyKind::Name(RenameMode::Both))
            )
            && let Some(tracker) = event.tracker()
        {
            paired.insert(tracker);
        }
    }

    let mut out = Vec::new();
    let mut synthetic_cookie = usize::MAX;
    for result in raw {
        let event = match result {
            Ok(event) => event,
            Err(err) => {
                warn!(error = %err, "watch backend error");
                continue;
            }
        };
        match event.kind {
            EventKind::Create(kind) => {
                for path in event.paths {
                    let is_dir = match kind {
                        CreateKind::Folder => true,
                        CreateKind::File => false,
                        _ => std::fs::metadata(&path).is_ok_and(|meta| meta.is_dir()),
                    };
                    out.push(FsEvent {
                        kind: FsEventKind::Created,
                        path,
                        is_dir,
                        cookie: None,
                    });
                }
            }
            EventKind::Access(AccessKind::Close(AccessMode::Write)) => {
                for path in event.paths {
                    out.push(FsEvent {
                        kind: FsEventKind::Written,
                        path,
                        is_dir: false,
                        cookie: None,
                    });
                }
            }
            EventKind::Remove(kind) => {
                for path in event.paths {
                    let is_dir = match kind {
                        RemoveKind::Folder => true,
                        RemoveKind::File => false,
                        // The entry is gone; a watched path was a directory.
                        _ => watches.contains(&path),
                    };
                    out.push(FsEvent {
                        kind: FsEventKind::Removed,
                        path,
                        is_dir,
                        cookie: None,
                    });
                }
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
                let cookie = event.tracker();
                if cookie.is_some_and(|tracker| paired.contains(&tracker)) {
                    continue;
                }
                if let Some(path) = event.paths.into_iter().next() {
                    let is_dir = watches.contains(&path);
                    out.push(FsEvent {
                        kind: FsEventKind::MovedFrom,
                        path,
                        is_dir,
                        cookie,
                    });
                }
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
                let cookie = event.tracker();
                if cookie.is_some_and(|tracker| paired.contains(&tracker)) {
                    continue;
                }
                if let Some(path) = event.paths.into_iter().next() {
                    let is_dir = std::fs::metadata(&path).is_ok_and(|meta| meta.is_dir());
                    out.push(FsEvent {
                        kind: FsEventKind::MovedTo,
                        path,
                        is_dir,
                        cookie,
                    });
                }
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
                let cookie = event.tracker().unwrap_or_else(|| {
                    synthetic_cookie -= 1;
                    synthetic_cookie
                });
                let mut paths = event.paths.into_iter();
                if let (Some(from), Some(to)) = (paths.next(), paths.next()) {
                    let from_is_dir = watches.contains(&from);
                    let to_is_dir = std::fs::metadata(&to)
                        .map(|meta| meta.is_dir())
                        .unwrap_or(from_is_dir);
                    out.push(FsEvent {
                        kind: FsEventKind::MovedFrom,
                        path: from,
                        is_dir: from_is_dir,
                        cookie: Some(cookie),
                    });
                    out.push(FsEvent {
                        kind: FsEventKind::MovedTo,
                        path: to,
                        is_dir: to_is_dir,
                        cookie: Some(cookie),
                    });
                }
            }
            // Content churn surfaces as a write event when the fd closes.
            _ => {}
        }
    }
    out
}

fn pair_moves(events: &[FsEvent]) -> HashMap<usize, MovePair> {
    let mut half: HashMap<usize, &FsEvent> = HashMap::new();
    let mut pairs = HashMap::new();
    for event in events {
        if !matches!(event.kind, FsEventKind::MovedFrom | FsEventKind::MovedTo) {
            continue;
        }
        let Some(cookie) = event.cookie else {
            continue;
        };
        let Some(other) = half.remove(&cookie) else {
            half.insert(cookie, event);
            continue;
        };
        let (from, to) = if event.kind == FsEventKind::MovedTo {
            (other, event)
        } else {
            (event, other)
        };
        if from.kind == FsEventKind::MovedFrom && to.kind == FsEventKind::MovedTo {
            pairs.insert(
                cookie,
                MovePair {
                    from: from.clone(),
                    to: to.clone(),
                },
            );
        }
    }
    pairs
}

/// Accumulates the tasks produced by one event batch, pruning overlap before
/// anything reaches the pool.
struct EventBatch<'a> {
    ctx: &'a SyncContext,
    queue: Vec<SyncTask>,
}

impl EventBatch<'_> {
    async fn handle_event(&mut self, event: &FsEvent, pairs: &HashMap<usize, MovePair>) {
        let Some(item_rel) = rel_from_local(&self.ctx.local_root, &event.path) else {
            debug!(path = %event.path.display(), "event outside the sync root");
            return;
        };
        if self.ctx.filter.should_ignore(&item_rel, event.is_dir) {
            debug!(rel = %item_rel, kind = ?event.kind, "ignored event");
            return;
        }
        if event.is_dir && matches!(event.kind, FsEventKind::MovedFrom | FsEventKind::Removed) {
            self.ctx.watches.unwatch_subtree(&event.path);
        }
        if let Some(cookie) = event.cookie
            && let Some(pair) = pairs.get(&cookie)
        {
            // Both halves are known; act once, when the destination comes up.
            if event.kind == FsEventKind::MovedTo {
                self.handle_move_pair(pair).await;
            }
            return;
        }
        match event.kind {
            FsEventKind::Created => self.handle_created(event, &item_rel).await,
            FsEventKind::Written => self.handle_written(event, &item_rel).await,
            FsEventKind::Removed => {
                info!(rel = %item_rel, "local entry deleted");
                self.handle_departed(event, &item_rel).await;
            }
            FsEventKind::MovedFrom => {
                info!(rel = %item_rel, "local entry moved away to an unknown place");
                self.handle_departed(event, &item_rel).await;
            }
            FsEventKind::MovedTo => {
                info!(rel = %item_rel, "local entry moved in from an unknown place");
                self.handle_arrived(event, &item_rel).await;
            }
        }
    }

    async fn handle_move_pair(&mut self, pair: &MovePair) {
        if pair
            .from
            .path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(PathFilter::is_temp_name)
        {
            debug!(path = %pair.to.path.display(), "rename of a partial download, nothing to sync");
            return;
        }
        self.ctx.hashes.forget(&pair.from.path);
        self.ctx.hashes.forget(&pair.to.path);
        let Some(from_rel) = rel_from_local(&self.ctx.local_root, &pair.from.path) else {
            return;
        };
        let Some(to_rel) = rel_from_local(&self.ctx.local_root, &pair.to.path) else {
            return;
        };
        let (from_parent, from_name) = split_rel(&from_rel);
        let (to_parent, to_name) = split_rel(&to_rel);

        if !self.ensure_remote_dir(to_parent).await {
            warn!(rel = %to_parent, "destination directory cannot be prepared remotely, merging instead");
            if from_parent == to_parent || covered_by(from_parent, to_parent) {
                self.queue_merge(to_parent, true);
            } else if covered_by(to_parent, from_parent) {
                self.queue_merge(from_parent, true);
            } else {
                self.queue_merge(from_parent, true);
                self.queue_merge(to_parent, true);
            }
            return;
        }

        let record = match self.ctx.store.get(from_name, from_parent).await {
            Ok(record) => record,
            Err(err) => {
                warn!(rel = %from_rel, error = %err, "cannot read record for moved entry");
                None
            }
        };
        if let Some(record) = record
            && record.is_folder() == pair.to.is_dir
        {
            info!(from = %from_rel, to = %to_rel, "moving remote item to follow the local rename");
            let moved = SyncTask::Move(MoveTask {
                parent_relpath: from_parent.to_string(),
                name: from_name.to_string(),
                new_parent_relpath: to_parent.to_string(),
                new_name: to_name.to_string(),
                is_folder: pair.from.is_dir,
                local_path: pair.from.path.clone(),
            })
            .execute(self.ctx)
            .await;
            match moved {
                Ok(()) => {
                    if pair.to.is_dir
                        && let Err(err) = self.ctx.watches.watch(&pair.to.path)
                    {
                        warn!(path = %pair.to.path.display(), error = %err, "cannot watch moved directory");
                    }
                }
                Err(err) => {
                    warn!(from = %from_rel, error = %err, "remote move failed, merging the destination parent");
                    self.queue_merge(to_parent, true);
                }
            }
            return;
        }

        // No usable record, or the entry changed type along the way. Treat
        // the two sides independently.
        self.handle_departed(&pair.from, &from_rel).await;
        self.handle_arrived(&pair.to, &to_rel).await;
    }

    /// A local entry disappeared (deleted, or moved somewhere unseen). The
    /// removal propagates only when the remote copy still matches the last
    /// synced state; anything murkier goes through a full parent merge.
    async fn handle_departed(&mut self, event: &FsEvent, item_rel: &str) {
        self.ctx.hashes.forget(&event.path);
        let (parent_rel, name) = split_rel(item_rel);
        let record = match self.ctx.store.get(name, parent_rel).await {
            Ok(record) => record,
            Err(err) => {
                warn!(rel = %item_rel, error = %err, "cannot read record for departed entry");
                None
            }
        };
        let live = match self.ctx.remote.try_get_item(drive_path(item_rel)).await {
            Ok(live) => live,
            Err(err) => {
                debug!(rel = %item_rel, error = %err, "cannot probe remote item");
                None
            }
        };
        if let (Some(item), Some(record)) = (live.as_ref(), record.as_ref())
            && item.id.as_deref() == Some(record.id.as_str())
            && item.etag == record.e_tag
        {
            info!(rel = %item_rel, "propagating local removal to the drive");
            self.queue_squashed(
                item_rel.to_string(),
                SyncTask::Delete(DeleteTask {
                    parent_relpath: parent_rel.to_string(),
                    name: name.to_string(),
                    is_folder: record.is_folder(),
                    local_path: event.path.clone(),
                }),
            );
        } else {
            info!(rel = %item_rel, "remote state is uncertain, merging the parent directory");
            self.queue_merge(parent_rel, true);
        }
    }

    /// A local entry appeared without a known origin. Reconcile it against
    /// whatever holds its remote path, then push it up.
    async fn handle_arrived(&mut self, event: &FsEvent, item_rel: &str) {
        self.ctx.hashes.forget(&event.path);
        let (parent_rel, name) = split_rel(item_rel);
        let meta = match tokio::fs::metadata(&event.path).await {
            Ok(meta) => meta,
            Err(_) => {
                info!(path = %event.path.display(), "local path is gone again, nothing to push");
                return;
            }
        };
        if meta.is_dir() != event.is_dir {
            warn!(path = %event.path.display(), "entry changed type while the event was queued, merging it");
            self.queue_merge(item_rel, true);
            return;
        }

        let live = match self.ctx.remote.try_get_item(drive_path(item_rel)).await {
            Ok(live) => live,
            Err(err) => {
                debug!(rel = %item_rel, error = %err, "cannot probe remote item");
                None
            }
        };
        if let Some(item) = live {
            let remote_is_dir = item.kind == ResourceKind::Dir;
            if remote_is_dir != event.is_dir {
                // Type conflict. Rename the remote entry aside and continue
                // as if the name were free; a merge sorts out the renamed copy.
                let new_name = next_numbered_name(&item.name);
                info!(rel = %item_rel, new_name = %new_name, "remote entry type conflicts with the local one, renaming it aside");
                let moved = SyncTask::Move(MoveTask {
                    parent_relpath: parent_rel.to_string(),
                    name: item.name.clone(),
                    new_parent_relpath: parent_rel.to_string(),
                    new_name,
                    is_folder: remote_is_dir,
                    local_path: event.path.clone(),
                })
                .execute(self.ctx)
                .await;
                if let Err(err) = moved {
                    warn!(rel = %item_rel, error = %err, "could not rename the remote entry, merging the parent");
                    self.queue_merge(parent_rel, true);
                    return;
                }
            } else if remote_is_dir {
                // Same-named folder on both sides with unknown history.
                self.queue_merge(item_rel, true);
                return;
            } else {
                let same = self
                    .ctx
                    .hashes
                    .matches(&event.path, item.sha256.as_deref())
                    .await
                    .unwrap_or(false);
                if same {
                    let updated = SyncTask::UpdateTimestamp(UpdateTimestampTask {
                        parent_relpath: parent_rel.to_string(),
                        name: name.to_string(),
                        local_path: event.path.clone(),
                    })
                    .execute(self.ctx)
                    .await;
                    match updated {
                        Ok(()) => {
                            info!(rel = %item_rel, "local file matches the remote copy, synced in place");
                            return;
                        }
                        Err(err) => {
                            debug!(rel = %item_rel, error = %err, "could not sync in place, uploading instead")
                        }
                    }
                }
            }
        }

        if event.is_dir {
            self.queue.push(SyncTask::CreateFolder(CreateFolderTask {
                parent_relpath: parent_rel.to_string(),
                name: name.to_string(),
                local_path: event.path.clone(),
                upload_if_success: true,
                abort_if_local_gone: true,
            }));
        } else {
            self.queue.push(SyncTask::Upload(UploadTask {
                parent_relpath: parent_rel.to_string(),
                name: name.to_string(),
                local_path: event.path.clone(),
            }));
        }
    }

    async fn handle_created(&mut self, event: &FsEvent, item_rel: &str) {
        let is_dir = event.is_dir
            || tokio::fs::metadata(&event.path)
                .await
                .is_ok_and(|meta| meta.is_dir());
        if is_dir {
            if self.ensure_remote_dir(item_rel).await {
                // A newly created directory is empty; watching it is enough.
                if let Err(err) = self.ctx.watches.watch(&event.path) {
                    warn!(path = %event.path.display(), error = %err, "cannot watch new directory");
                }
            } else {
                let (parent_rel, _) = split_rel(item_rel);
                warn!(rel = %item_rel, "could not create the remote directory, merging the parent");
                self.queue_merge(parent_rel, true);
            }
            return;
        }
        let is_symlink = tokio::fs::symlink_metadata(&event.path)
            .await
            .is_ok_and(|meta| meta.file_type().is_symlink());
        if is_symlink {
            // Symlinks never get a close-write, push them right away.
            self.handle_written(event, item_rel).await;
        }
        // Regular files are handled when their write completes.
    }

    async fn handle_written(&mut self, event: &FsEvent, item_rel: &str) {
        info!(rel = %item_rel, "local file finished writing, refreshing its directory");
        if self.ctx.pool.is_blacklisted(&event.path) {
            // A fresh write lifts a standing refusal, never an active hold.
            self.ctx.pool.release(&event.path);
        }
        let (parent_rel, _) = split_rel(item_rel);
        self.queue_merge(parent_rel, false);
    }

    /// Makes sure `rel` is a directory on the drive: creates it if missing,
    /// renames (or failing that, deletes) a file squatting on the name.
    /// Runs inline because callers branch on the outcome.
    async fn ensure_remote_dir(&self, rel: &str) -> bool {
        if rel.is_empty() {
            return true;
        }
        let (parent_rel, name) = split_rel(rel);
        let local_path = match local_path_for(&self.ctx.local_root, rel) {
            Ok(path) => path,
            Err(err) => {
                warn!(rel = %rel, error = %err, "cannot resolve local path");
                return false;
            }
        };
        match self.ctx.remote.try_get_item(drive_path(rel)).await {
            Ok(Some(item)) => {
                if item.kind == ResourceKind::Dir {
                    return item.name == name;
                }
                let new_name = next_numbered_name(&item.name);
                info!(rel = %rel, new_name = %new_name, "remote file blocks the directory name, renaming it");
                let moved = SyncTask::Move(MoveTask {
                    parent_relpath: parent_rel.to_string(),
                    name: item.name.clone(),
                    new_parent_relpath: parent_rel.to_string(),
                    new_name,
                    is_folder: false,
                    local_path: local_path.clone(),
                })
                .execute(self.ctx)
                .await;
                if moved.is_err() {
                    let deleted = SyncTask::Delete(DeleteTask {
                        parent_relpath: parent_rel.to_string(),
                        name: item.name.clone(),
                        is_folder: false,
                        local_path: local_path.clone(),
                    })
                    .execute(self.ctx)
                    .await;
                    if let Err(err) = deleted {
                        warn!(rel = %rel, error = %err, "could not rename or delete the blocking remote file");
                        return false;
                    }
                }
            }
            Ok(None) => {}
            Err(err) => {
                warn!(rel = %rel, error = %err, "cannot probe remote path");
                return false;
            }
        }
        let created = SyncTask::CreateFolder(CreateFolderTask {
            parent_relpath: parent_rel.to_string(),
            name: name.to_string(),
            local_path,
            upload_if_success: false,
            abort_if_local_gone: true,
        })
        .execute(self.ctx)
        .await;
        match created {
            Ok(()) => true,
            Err(err) => {
                warn!(rel = %rel, error = %err, "could not create remote directory");
                false
            }
        }
    }

    fn queue_merge(&mut self, rel: &str, deep: bool) {
        let local_path = match local_path_for(&self.ctx.local_root, rel) {
            Ok(path) => path,
            Err(err) => {
                warn!(rel = %rel, error = %err, "cannot resolve local path");
                return;
            }
        };
        self.queue_squashed(
            rel.to_string(),
            SyncTask::MergeDirectory(MergeDirectoryTask {
                rel_path: rel.to_string(),
                local_path,
                deep,
                assume_remote_unchanged: false,
                parent_remote_unchanged: false,
            }),
        );
    }

    fn queue_squashed(&mut self, rel: String, task: SyncTask) {
        squash_into(&mut self.queue, &rel, task);
    }

    fn flush(self) {
        for task in self.queue {
            let label = task.to_string();
            if !self.ctx.pool.add(task) {
                debug!(task = %label, "not queued, path already occupied");
            }
        }
    }
}

/// Queues a merge or delete unless something already queued in this batch
/// covers it, and drops queued merges the new task supersedes. Queued deletes
/// are never dropped; a parent merge would restore what they remove.
fn squash_into(queue: &mut Vec<SyncTask>, rel: &str, task: SyncTask) {
    for queued in queue.iter() {
        if covers(queued, &task, rel) {
            debug!(rel = %rel, task = %queued, "not queued, an earlier task covers it");
            return;
        }
    }
    queue.retain(|queued| {
        let superseded = matches!(queued, SyncTask::MergeDirectory(_))
            && covered_rel(queued).is_some_and(|existing| covers(&task, queued, &existing));
        if superseded {
            debug!(task = %queued, "dropped, a broader task supersedes it");
        }
        !superseded
    });
    queue.push(task);
}

fn covered_rel(task: &SyncTask) -> Option<String> {
    match task {
        SyncTask::MergeDirectory(merge) => Some(merge.rel_path.clone()),
        SyncTask::Delete(delete) => Some(child_rel(&delete.parent_relpath, &delete.name)),
        _ => None,
    }
}

/// Whether running `candidate` makes `target` (which points at `target_rel`)
/// redundant.
fn covers(candidate: &SyncTask, target: &SyncTask, target_rel: &str) -> bool {
    match candidate {
        SyncTask::MergeDirectory(existing) => match target {
            SyncTask::MergeDirectory(new) => {
                if existing.deep {
                    covered_by(target_rel, &existing.rel_path)
                } else {
                    !new.deep && existing.rel_path == target_rel
                }
            }
            // A merge never stands in for a pending delete.
            _ => false,
        },
        SyncTask::Delete(existing) => covered_by(
            target_rel,
            &child_rel(&existing.parent_relpath, &existing.name),
        ),
        _ => false,
    }
}

fn covered_by(rel: &str, ancestor: &str) -> bool {
    rel == ancestor
        || rel
            .strip_prefix(ancestor)
            .is_some_and(|rest| rest.starts_with('/'))
}

/// Picks the next free-looking name for a conflicting remote entry:
/// `"a.txt"` becomes `"a 1.txt"`, `"a 1.txt"` becomes `"a 2.txt"`.
fn next_numbered_name(name: &str) -> String {
    let (stem, ext) = split_name(name);
    if let Some((base, count)) = stem.rsplit_once(' ')
        && !count.is_empty()
        && !count.starts_with('0')
        && count.chars().all(|c| c.is_ascii_digit())
        && let Ok(n) = count.parse::<u32>()
    {
        return format!("{base} {}{ext}", n + 1);
    }
    format!("{stem} 1{ext}")
}
