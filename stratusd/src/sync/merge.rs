use std::collections::{HashMap, HashSet};
use std::io;
use std::path::Path;

use stratus_core::{ApiError, Resource, ResourceKind};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::SyncContext;
use super::hash::HashCache;
use super::paths::{self, child_rel, drive_path, split_rel};
use super::remote::parse_modified;
use super::store::{ItemRecord, ItemStatus, StoreError};
use super::task::{
    CreateFolderTask, DeleteTask, DownloadTask, MergeDirectoryTask, SyncTask, UploadTask,
};

#[derive(Debug, Error)]
pub enum MergeError {
    #[error("api error: {0}")]
    Api(#[from] ApiError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("trash error: {0}")]
    Trash(#[from] trash::Error),
    #[error("invalid timestamp: {0}")]
    Timestamp(#[from] time::error::Parse),
}

/// Reconciles one directory level: compares the remote listing, the local
/// entries and the stored records, queueing corrective tasks for whatever
/// disagrees. The watcher is detached from the directory for the duration so
/// the pass does not react to its own writes.
pub async fn merge_directory(
    ctx: &SyncContext,
    task: &MergeDirectoryTask,
) -> Result<(), MergeError> {
    let is_dir = tokio::fs::metadata(&task.local_path)
        .await
        .map(|meta| meta.is_dir())
        .unwrap_or(false);
    if !is_dir {
        warn!(path = %task.local_path.display(), "merge target is not a directory, skipping");
        return Ok(());
    }

    ctx.watches.unwatch(&task.local_path);
    let pass = MergePass {
        ctx,
        rel_path: &task.rel_path,
        local_path: &task.local_path,
        deep: task.deep,
        assume_remote_unchanged: task.assume_remote_unchanged,
        parent_remote_unchanged: task.parent_remote_unchanged,
    };
    let result = pass.run().await;
    if let Err(err) = ctx.watches.watch(&task.local_path) {
        debug!(path = %task.local_path.display(), error = %err, "could not re-watch merged directory");
    }
    result
}

struct MergePass<'a> {
    ctx: &'a SyncContext,
    rel_path: &'a str,
    local_path: &'a Path,
    deep: bool,
    assume_remote_unchanged: bool,
    parent_remote_unchanged: bool,
}

impl MergePass<'_> {
    async fn run(&self) -> Result<(), MergeError> {
        let mut locals = match list_local_names(self.local_path, &self.ctx.hashes) {
            Ok(names) => names,
            Err(err) => {
                warn!(path = %self.local_path.display(), error = %err, "cannot list local entries, skipping merge");
                return Ok(());
            }
        };
        let mut records = self.ctx.store.children(self.rel_path).await?;

        // The remote listing can be skipped only when this directory matched
        // its record against live metadata, i.e. the parent pass had fetched.
        if !self.assume_remote_unchanged || !self.parent_remote_unchanged {
            let items = match self
                .ctx
                .remote
                .list_children_all(drive_path(self.rel_path))
                .await
            {
                Ok(items) => items,
                Err(err) => {
                    warn!(rel = %self.rel_path, error = %err, "cannot list remote children, skipping directory");
                    self.unmark_after_failed_fetch().await?;
                    return Ok(());
                }
            };
            for item in items {
                locals.remove(&item.name);
                let rel = child_rel(self.rel_path, &item.name);
                if self.ctx.filter.should_ignore(&rel, item.kind == ResourceKind::Dir) {
                    debug!(rel = %rel, "ignored remote entry");
                    continue;
                }
                let outcome = self
                    .handle_remote_item(&item, &mut records, &mut locals)
                    .await;
                self.note_entry_outcome(&item.name, outcome)?;
            }
        }

        for name in locals {
            let outcome = self.handle_local_item(&name, &mut records).await;
            self.note_entry_outcome(&name, outcome)?;
        }

        // Records never matched by a remote or local entry are dead.
        for record in records.values() {
            info!(rel = %record.rel_path(), "record has no counterpart on either side, deleting it");
            self.ctx
                .store
                .delete(&record.name, &record.parent_relpath, record.is_folder())
                .await?;
        }
        Ok(())
    }

    /// Store failures abort the pass; anything else skips the entry so the
    /// next full pass can re-evaluate it.
    fn note_entry_outcome(
        &self,
        name: &str,
        outcome: Result<(), MergeError>,
    ) -> Result<(), MergeError> {
        match outcome {
            Err(err @ MergeError::Store(_)) => Err(err),
            Err(err) => {
                warn!(rel = %self.rel_path, name, error = %err, "skipping entry");
                Ok(())
            }
            Ok(()) => Ok(()),
        }
    }

    /// A failed listing must not look like a remote deletion to the sweep.
    async fn unmark_after_failed_fetch(&self) -> Result<(), StoreError> {
        if self.rel_path.is_empty() {
            self.ctx.store.unmark_all().await
        } else {
            let (parent, name) = split_rel(self.rel_path);
            self.ctx.store.unmark(name, parent, true).await
        }
    }

    async fn handle_remote_item(
        &self,
        item: &Resource,
        records: &mut HashMap<String, ItemRecord>,
        locals: &mut HashSet<String>,
    ) -> Result<(), MergeError> {
        let record = records.remove(&item.name);
        let item_local = self.local_path.join(&item.name);
        match item.kind {
            ResourceKind::Dir => {
                self.handle_remote_folder(item, &item_local, record.as_ref(), locals)
                    .await
            }
            ResourceKind::File => {
                let stat = entry_stat(&item_local).await?;
                match record {
                    Some(record) => {
                        self.handle_remote_file_with_record(item, &record, stat, &item_local, locals)
                            .await
                    }
                    None => {
                        self.handle_remote_file_without_record(item, stat, &item_local, locals)
                            .await
                    }
                }
            }
        }
    }

    async fn handle_remote_folder(
        &self,
        item: &Resource,
        item_local: &Path,
        record: Option<&ItemRecord>,
        locals: &mut HashSet<String>,
    ) -> Result<(), MergeError> {
        if !self.deep {
            return Ok(());
        }
        let matches_record = remote_dir_matches_record(item, record);

        let stat = entry_stat(item_local).await?;
        if stat.as_ref().is_some_and(|meta| meta.is_file()) {
            if matches_record {
                // The remote folder is unchanged since it was synced, but a
                // file sits at its local path now: the replacement happened
                // locally and wins.
                warn!(path = %item_local.display(), "local file replaced a synced folder, propagating");
                self.delete_remote_now(&item.name, true).await?;
                self.queue_upload(&item.name, item_local);
                return Ok(());
            }
            let renamed = rename_with_suffix(self.local_path, &item.name, &self.ctx.host_label)?;
            info!(from = %item.name, to = %renamed, "renamed local file aside, remote folder wins the name");
            self.ctx.hashes.forget(item_local);
            locals.insert(renamed);
        }

        if tokio::fs::metadata(item_local).await.is_err() {
            if matches_record {
                debug!(path = %item_local.display(), "local folder deleted while synced, deleting remote folder");
                self.queue_task(SyncTask::Delete(DeleteTask {
                    parent_relpath: self.rel_path.to_string(),
                    name: item.name.clone(),
                    is_folder: true,
                    local_path: item_local.to_path_buf(),
                }));
                return Ok(());
            }
            tokio::fs::create_dir_all(item_local).await?;
            info!(path = %item_local.display(), "created missing local directory");
        }

        self.ctx
            .store
            .upsert(item, self.rel_path, 0, ItemStatus::Ok)
            .await?;
        self.queue_task(SyncTask::MergeDirectory(MergeDirectoryTask {
            rel_path: child_rel(self.rel_path, &item.name),
            local_path: item_local.to_path_buf(),
            deep: true,
            assume_remote_unchanged: matches_record,
            parent_remote_unchanged: self.assume_remote_unchanged,
        }));
        Ok(())
    }

    async fn handle_remote_file_with_record(
        &self,
        item: &Resource,
        record: &ItemRecord,
        stat: Option<std::fs::Metadata>,
        item_local: &Path,
        locals: &mut HashSet<String>,
    ) -> Result<(), MergeError> {
        if stat.as_ref().is_some_and(|meta| meta.is_dir()) {
            // Remote entry is a file but a directory occupies its local path.
            if record.is_folder() {
                // Folder became a file remotely; the local folder is stale.
                move_to_trash(item_local)?;
                self.ctx.hashes.forget(item_local);
                self.ctx.store.delete(&item.name, self.rel_path, true).await?;
                return self
                    .handle_remote_file_without_record(item, None, item_local, locals)
                    .await;
            }
            // The file record contradicts the local directory, drop it and
            // reconcile from what is actually on disk.
            self.ctx.store.delete(&item.name, self.rel_path, false).await?;
            let stat = entry_stat(item_local).await?;
            return self
                .handle_remote_file_without_record(item, stat, item_local, locals)
                .await;
        }

        let remote_mtime = parse_modified(item.modified.as_deref())?.unwrap_or(0);
        let remote_size = item.size.unwrap_or(0) as i64;
        let same_identity = item.id.as_deref().is_some_and(|id| id == record.id)
            && item.ctag == record.c_tag;
        let synced_before = same_identity
            || (remote_size == record.remote_size && remote_mtime == record.modified_time);

        let Some(meta) = stat else {
            // The local copy is gone. If the remote file changed since the
            // record it must be kept; if it did not, a fresh copy restores
            // what was lost locally. Either way, download.
            info!(path = %item_local.display(), "local file is gone, downloading remote copy");
            self.queue_download(item, item_local);
            return Ok(());
        };
        let local_mtime = paths::file_mtime_unix(&meta)?;
        let local_size = meta.len() as i64;

        if synced_before {
            let local_matches_record = local_size == record.local_size
                && (local_mtime == record.modified_time
                    || self.hash_matches(item_local, item.sha256.as_deref()).await?);
            if local_matches_record {
                if local_mtime != remote_mtime {
                    info!(path = %item_local.display(), "same content with drifted timestamp, fixing it");
                    paths::set_file_mtime(item_local, remote_mtime)?;
                    self.ctx
                        .store
                        .upsert(item, self.rel_path, local_size, ItemStatus::Ok)
                        .await?;
                } else {
                    self.ctx
                        .store
                        .unmark(&record.name, &record.parent_relpath, false)
                        .await?;
                }
            } else {
                debug!(path = %item_local.display(), "edited locally and remote is known stale, uploading");
                self.queue_upload(&item.name, item_local);
            }
            return Ok(());
        }

        // Remote no longer matches the record.
        let local_matches_record = local_size == record.local_size
            && (local_mtime == record.modified_time
                || self
                    .hash_matches(item_local, record.content_hash.as_deref())
                    .await?);
        if local_matches_record {
            debug!(path = %item_local.display(), "remote changed and local did not, overwriting local");
            self.queue_download(item, item_local);
            return Ok(());
        }

        // Both sides changed since the record was written. The content hash
        // settles it; remote size metadata alone is not trusted.
        let equal_ts = local_mtime == remote_mtime;
        let same_content = (local_size == remote_size && equal_ts)
            || self.hash_matches(item_local, item.sha256.as_deref()).await?;
        if same_content {
            debug!(path = %item_local.display(), "both sides converged on the same content, fixing record");
            if !equal_ts {
                paths::set_file_mtime(item_local, remote_mtime)?;
            }
            self.ctx
                .store
                .upsert(item, self.rel_path, local_size, ItemStatus::Ok)
                .await?;
        } else {
            info!(path = %item_local.display(), "conflicting edits on both sides, keeping both copies");
            self.rename_local_and_download_remote(item, locals)?;
        }
        Ok(())
    }

    async fn handle_remote_file_without_record(
        &self,
        item: &Resource,
        stat: Option<std::fs::Metadata>,
        item_local: &Path,
        locals: &mut HashSet<String>,
    ) -> Result<(), MergeError> {
        let Some(meta) = stat else {
            debug!(path = %item_local.display(), "new remote file, downloading");
            self.queue_download(item, item_local);
            return Ok(());
        };
        if meta.is_dir() {
            info!(path = %item_local.display(), "remote file collides with a local directory, keeping both");
            self.rename_local_and_download_remote(item, locals)?;
            return Ok(());
        }

        let remote_mtime = parse_modified(item.modified.as_deref())?.unwrap_or(0);
        let local_mtime = paths::file_mtime_unix(&meta)?;
        let equal_ts = local_mtime == remote_mtime;
        let equal_attr = equal_ts && item.size.unwrap_or(0) as i64 == meta.len() as i64;
        if equal_attr || self.hash_matches(item_local, item.sha256.as_deref()).await? {
            if !equal_ts {
                info!(path = %item_local.display(), "same content with drifted timestamp, fixing it");
                paths::set_file_mtime(item_local, remote_mtime)?;
            }
            self.ctx
                .store
                .upsert(item, self.rel_path, meta.len() as i64, ItemStatus::Ok)
                .await?;
        } else {
            self.rename_local_and_download_remote(item, locals)?;
        }
        Ok(())
    }

    async fn handle_local_item(
        &self,
        name: &str,
        records: &mut HashMap<String, ItemRecord>,
    ) -> Result<(), MergeError> {
        let record = records.remove(name);
        let item_local = self.local_path.join(name);
        match entry_stat(&item_local).await? {
            Some(meta) if meta.is_file() => {
                self.handle_local_file(name, record.as_ref(), &meta, &item_local)
                    .await
            }
            Some(meta) if meta.is_dir() => {
                self.handle_local_folder(name, record.as_ref(), &item_local)
                    .await
            }
            Some(_) => {
                warn!(path = %item_local.display(), "unsupported local entry type, skipping");
                if let Some(record) = record {
                    self.ctx
                        .store
                        .delete(&record.name, &record.parent_relpath, record.is_folder())
                        .await?;
                }
                Ok(())
            }
            None => {
                if let Some(record) = record {
                    warn!(path = %item_local.display(), "local entry vanished during the pass");
                    self.ctx
                        .store
                        .delete(&record.name, &record.parent_relpath, record.is_folder())
                        .await?;
                    if self.assume_remote_unchanged && !record.is_folder() {
                        self.queue_task(SyncTask::Delete(DeleteTask {
                            parent_relpath: self.rel_path.to_string(),
                            name: name.to_string(),
                            is_folder: false,
                            local_path: item_local,
                        }));
                    }
                }
                Ok(())
            }
        }
    }

    async fn handle_local_file(
        &self,
        name: &str,
        record: Option<&ItemRecord>,
        meta: &std::fs::Metadata,
        item_local: &Path,
    ) -> Result<(), MergeError> {
        let rel = child_rel(self.rel_path, name);
        if self.ctx.filter.should_ignore(&rel, false) {
            debug!(rel = %rel, "ignored local file");
            return Ok(());
        }

        match record {
            Some(record) if !record.is_folder() => {
                let local_mtime = paths::file_mtime_unix(meta)?;
                let equal_ts = local_mtime == record.modified_time;
                let matches_record = meta.len() as i64 == record.local_size
                    && (equal_ts
                        || self
                            .hash_matches(item_local, record.content_hash.as_deref())
                            .await?);
                if matches_record {
                    if self.assume_remote_unchanged {
                        // Nothing changed on either side.
                        if !equal_ts {
                            paths::set_file_mtime(item_local, record.modified_time)?;
                        }
                        self.ctx.store.unmark(name, self.rel_path, false).await?;
                    } else {
                        info!(path = %item_local.display(), "file was deleted remotely, removing local copy");
                        move_to_trash(item_local)?;
                        self.ctx.hashes.forget(item_local);
                        self.ctx
                            .store
                            .delete(&record.name, &record.parent_relpath, false)
                            .await?;
                    }
                    return Ok(());
                }
                debug!(path = %item_local.display(), "file changed since last sync, uploading");
            }
            Some(_) => {
                // Record says folder but a file is here now.
                if self.assume_remote_unchanged {
                    info!(path = %item_local.display(), "replacing remote folder with local file");
                    if let Err(err) = self.delete_remote_now(name, true).await {
                        // Keep the record so the branch is revisited next pass.
                        warn!(rel = %rel, error = %err, "could not delete outdated remote folder");
                        return Ok(());
                    }
                }
            }
            None => {
                debug!(path = %item_local.display(), "new local file, uploading");
            }
        }
        self.queue_upload(name, item_local);
        Ok(())
    }

    async fn handle_local_folder(
        &self,
        name: &str,
        record: Option<&ItemRecord>,
        item_local: &Path,
    ) -> Result<(), MergeError> {
        if !self.deep {
            return Ok(());
        }
        let rel = child_rel(self.rel_path, name);
        if self.ctx.filter.should_ignore(&rel, true) {
            debug!(rel = %rel, "ignored local directory");
            return Ok(());
        }

        match record {
            Some(record) if record.is_folder() => {
                if self.assume_remote_unchanged {
                    self.ctx.store.unmark(name, self.rel_path, true).await?;
                    self.queue_task(SyncTask::MergeDirectory(MergeDirectoryTask {
                        rel_path: rel,
                        local_path: item_local.to_path_buf(),
                        deep: true,
                        assume_remote_unchanged: true,
                        parent_remote_unchanged: self.assume_remote_unchanged,
                    }));
                } else {
                    info!(path = %item_local.display(), "directory was deleted remotely, removing local copy");
                    move_to_trash(item_local)?;
                    self.ctx.hashes.forget(item_local);
                    self.ctx.store.delete(name, self.rel_path, true).await?;
                }
                return Ok(());
            }
            Some(_) => {
                // Record says file but a directory is here now.
                if self.assume_remote_unchanged {
                    info!(path = %item_local.display(), "replacing remote file with local directory");
                    if let Err(err) = self.delete_remote_now(name, false).await {
                        warn!(rel = %rel, error = %err, "could not delete outdated remote file");
                        return Ok(());
                    }
                }
            }
            None => {}
        }
        debug!(path = %item_local.display(), "new local directory, creating remote folder");
        self.queue_task(SyncTask::CreateFolder(CreateFolderTask {
            parent_relpath: self.rel_path.to_string(),
            name: name.to_string(),
            local_path: item_local.to_path_buf(),
            upload_if_success: true,
            abort_if_local_gone: true,
        }));
        Ok(())
    }

    /// Deletes the remote item and its records right away, without going
    /// through the pool. Used where the rest of the branch depends on the
    /// deletion having happened.
    async fn delete_remote_now(&self, name: &str, is_folder: bool) -> Result<(), MergeError> {
        let rel = child_rel(self.rel_path, name);
        self.ctx.remote.delete_item(drive_path(&rel)).await?;
        self.ctx.store.delete(name, self.rel_path, is_folder).await?;
        Ok(())
    }

    fn rename_local_and_download_remote(
        &self,
        item: &Resource,
        locals: &mut HashSet<String>,
    ) -> io::Result<()> {
        let renamed = rename_with_suffix(self.local_path, &item.name, &self.ctx.host_label)?;
        info!(from = %item.name, to = %renamed, "kept local copy under a new name");
        locals.insert(renamed);
        let item_local = self.local_path.join(&item.name);
        self.ctx.hashes.forget(&item_local);
        self.queue_download(item, &item_local);
        Ok(())
    }

    async fn hash_matches(&self, path: &Path, expected: Option<&str>) -> Result<bool, MergeError> {
        Ok(self.ctx.hashes.matches(path, expected).await?)
    }

    fn queue_download(&self, item: &Resource, item_local: &Path) {
        self.queue_task(SyncTask::Download(DownloadTask {
            item: item.clone(),
            parent_relpath: self.rel_path.to_string(),
            local_path: item_local.to_path_buf(),
        }));
    }

    fn queue_upload(&self, name: &str, item_local: &Path) {
        self.queue_task(SyncTask::Upload(UploadTask {
            parent_relpath: self.rel_path.to_string(),
            name: name.to_string(),
            local_path: item_local.to_path_buf(),
        }));
    }

    fn queue_task(&self, task: SyncTask) {
        let label = task.to_string();
        if !self.ctx.pool.add(task) {
            debug!(task = %label, "not queued, path already occupied");
        }
    }
}

fn remote_dir_matches_record(item: &Resource, record: Option<&ItemRecord>) -> bool {
    record.is_some_and(|record| {
        record.is_folder()
            && record.remote_size == item.size.unwrap_or(0) as i64
            && record.c_tag == item.ctag
            && record.e_tag == item.etag
    })
}

async fn entry_stat(path: &Path) -> Result<Option<std::fs::Metadata>, MergeError> {
    match tokio::fs::metadata(path).await {
        Ok(meta) => Ok(Some(meta)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn move_to_trash(path: &Path) -> Result<(), MergeError> {
    trash::delete(path)?;
    Ok(())
}

/// Lists the directory, renaming case-insensitive duplicates so each entry
/// maps to a distinct remote name. Entries are visited in sorted order, so
/// the lexicographically later name is the one renamed.
fn list_local_names(dir: &Path, hashes: &HashCache) -> io::Result<HashSet<String>> {
    let mut entries = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        match entry.file_name().into_string() {
            Ok(name) => entries.push(name),
            Err(raw) => {
                warn!(name = %raw.to_string_lossy(), "skipping entry with a non-UTF-8 name")
            }
        }
    }
    entries.sort();
    let lower_all: HashSet<String> = entries.iter().map(|name| name.to_lowercase()).collect();
    if lower_all.len() == entries.len() {
        return Ok(entries.into_iter().collect());
    }

    let mut names = HashSet::new();
    let mut taken = HashSet::new();
    for name in entries {
        let lower = name.to_lowercase();
        if !taken.contains(&lower) {
            taken.insert(lower);
            names.insert(name);
            continue;
        }
        let mut count = 1;
        let mut renamed = numbered_name(&name, count);
        while taken.contains(&renamed.to_lowercase()) || lower_all.contains(&renamed.to_lowercase())
        {
            count += 1;
            renamed = numbered_name(&name, count);
        }
        match std::fs::rename(dir.join(&name), dir.join(&renamed)) {
            Ok(()) => {
                info!(from = %name, to = %renamed, "renamed entry to resolve a case collision");
                hashes.forget(&dir.join(&name));
                taken.insert(renamed.to_lowercase());
                names.insert(renamed);
            }
            Err(err) => {
                warn!(name = %name, error = %err, "could not rename colliding entry, skipping it")
            }
        }
    }
    Ok(names)
}

/// `"report.txt"` with count 2 becomes `"report 2.txt"`.
pub(crate) fn numbered_name(name: &str, count: u32) -> String {
    let (stem, ext) = split_name(name);
    format!("{stem} {count}{ext}")
}

pub(crate) fn split_name(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(idx) if idx > 0 => name.split_at(idx),
        _ => (name, ""),
    }
}

/// Renames an entry out of the way of a conflicting download, tagging it with
/// the host label so the origin of the surviving copy stays visible.
fn rename_with_suffix(parent: &Path, name: &str, host: &str) -> io::Result<String> {
    let suffix = format!(" ({host})");
    let (stem, ext) = split_name(name);
    let stem = stem.strip_suffix(suffix.as_str()).unwrap_or(stem);

    let mut new_name = format!("{stem}{suffix}{ext}");
    if parent.join(&new_name).exists() {
        let mut base = stem;
        let mut count: u32 = 1;
        if let Some((head, tail)) = stem.rsplit_once(' ')
            && !tail.is_empty()
            && !tail.starts_with('0')
            && tail.chars().all(|c| c.is_ascii_digit())
            && let Ok(n) = tail.parse::<u32>()
        {
            base = head;
            count = n + 1;
        }
        new_name = format!("{base} {count}{suffix}{ext}");
        while parent.join(&new_name).exists() {
            count += 1;
            new_name = format!("{base} {count}{suffix}{ext}");
        }
    }
    std::fs::rename(parent.join(name), parent.join(&new_name))?;
    Ok(new_name)
}
