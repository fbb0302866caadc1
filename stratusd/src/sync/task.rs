use std::fmt;
use std::path::{Path, PathBuf};

use stratus_core::{ApiError, ApiErrorClass, Resource};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::SyncContext;
use super::merge::MergeError;
use super::paths::{self, child_rel, drive_path, local_path_for};
use super::remote::{format_modified, is_not_found, parse_modified};
use super::store::{ItemStatus, StoreError};
use super::transfer::{TransferError, UPLOAD_CHUNK_SIZE};

/// Files up to this size go through a single upload request; anything larger
/// uses a chunked upload session.
pub(crate) const PUT_SIZE_THRESHOLD: u64 = 10 << 20;

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("api error: {0}")]
    Api(#[from] ApiError),
    #[error("transfer error: {0}")]
    Transfer(#[from] TransferError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("path error: {0}")]
    Path(#[from] paths::PathError),
    #[error("invalid timestamp: {0}")]
    Timestamp(#[from] time::error::Parse),
    #[error("timestamp out of range: {0}")]
    TimestampOutOfRange(i64),
    #[error(transparent)]
    Merge(#[from] MergeError),
}

/// Discriminant used for path occupancy bookkeeping in the task pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    MergeDirectory,
    Download,
    Upload,
    Move,
    Delete,
    CreateFolder,
    UpdateTimestamp,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::MergeDirectory => "MergeDirectory",
            TaskKind::Download => "Download",
            TaskKind::Upload => "Upload",
            TaskKind::Move => "Move",
            TaskKind::Delete => "Delete",
            TaskKind::CreateFolder => "CreateFolder",
            TaskKind::UpdateTimestamp => "UpdateTimestamp",
        }
    }
}

/// Reconciles one directory level; see the merge module for the strategy.
#[derive(Debug, Clone)]
pub struct MergeDirectoryTask {
    pub rel_path: String,
    pub local_path: PathBuf,
    /// Recurse into subdirectories.
    pub deep: bool,
    /// The remote listing is known to match the stored records, so skip
    /// fetching it and treat record-only entries as locally deleted.
    pub assume_remote_unchanged: bool,
    /// Whether the parent merge ran with the same assumption. Nested merges
    /// inherit this so a stale ancestor keeps its subtree conservative.
    pub parent_remote_unchanged: bool,
}

#[derive(Debug, Clone)]
pub struct DownloadTask {
    pub item: Resource,
    pub parent_relpath: String,
    pub local_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct UploadTask {
    pub parent_relpath: String,
    pub name: String,
    pub local_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct MoveTask {
    pub parent_relpath: String,
    pub name: String,
    pub new_parent_relpath: String,
    pub new_name: String,
    pub is_folder: bool,
    /// Source path before the move; occupancy is keyed on it.
    pub local_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct DeleteTask {
    pub parent_relpath: String,
    pub name: String,
    pub is_folder: bool,
    pub local_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct CreateFolderTask {
    pub parent_relpath: String,
    pub name: String,
    pub local_path: PathBuf,
    /// Queue a merge of the new folder afterwards so its contents upload.
    pub upload_if_success: bool,
    /// Skip silently when the local directory has disappeared meanwhile.
    pub abort_if_local_gone: bool,
}

#[derive(Debug, Clone)]
pub struct UpdateTimestampTask {
    pub parent_relpath: String,
    pub name: String,
    pub local_path: PathBuf,
}

/// A unit of sync work. Tasks are queued on the pool and executed by worker
/// coroutines; each one is self-contained and owns the paths it touches.
#[derive(Debug, Clone)]
pub enum SyncTask {
    MergeDirectory(MergeDirectoryTask),
    Download(DownloadTask),
    Upload(UploadTask),
    Move(MoveTask),
    Delete(DeleteTask),
    CreateFolder(CreateFolderTask),
    UpdateTimestamp(UpdateTimestampTask),
}

impl SyncTask {
    pub fn kind(&self) -> TaskKind {
        match self {
            SyncTask::MergeDirectory(_) => TaskKind::MergeDirectory,
            SyncTask::Download(_) => TaskKind::Download,
            SyncTask::Upload(_) => TaskKind::Upload,
            SyncTask::Move(_) => TaskKind::Move,
            SyncTask::Delete(_) => TaskKind::Delete,
            SyncTask::CreateFolder(_) => TaskKind::CreateFolder,
            SyncTask::UpdateTimestamp(_) => TaskKind::UpdateTimestamp,
        }
    }

    /// The local path this task operates on, used for occupancy tracking.
    pub fn local_path(&self) -> &Path {
        match self {
            SyncTask::MergeDirectory(task) => &task.local_path,
            SyncTask::Download(task) => &task.local_path,
            SyncTask::Upload(task) => &task.local_path,
            SyncTask::Move(task) => &task.local_path,
            SyncTask::Delete(task) => &task.local_path,
            SyncTask::CreateFolder(task) => &task.local_path,
            SyncTask::UpdateTimestamp(task) => &task.local_path,
        }
    }

    pub async fn execute(&self, ctx: &SyncContext) -> Result<(), TaskError> {
        match self {
            SyncTask::MergeDirectory(task) => {
                super::merge::merge_directory(ctx, task).await?;
                Ok(())
            }
            SyncTask::Download(task) => run_download(task, ctx).await,
            SyncTask::Upload(task) => run_upload(task, ctx).await,
            SyncTask::Move(task) => run_move(task, ctx).await,
            SyncTask::Delete(task) => run_delete(task, ctx).await,
            SyncTask::CreateFolder(task) => run_create_folder(task, ctx).await,
            SyncTask::UpdateTimestamp(task) => run_update_timestamp(task, ctx).await,
        }
    }
}

impl fmt::Display for SyncTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.kind().as_str(), self.local_path().display())
    }
}

/// After a transfer, settles whose modification time wins and records the
/// snapshot. When the server lets us write timestamps the local mtime is
/// pushed up; otherwise the remote one is stamped onto the local file.
pub(crate) async fn update_timestamp_and_record(
    ctx: &SyncContext,
    item: &Resource,
    parent_relpath: &str,
    local_path: &Path,
    local_size: i64,
) -> Result<(), TaskError> {
    let updated;
    let item = if item.mtime_writable {
        let meta = tokio::fs::metadata(local_path).await?;
        let local_mtime = paths::file_mtime_unix(&meta)?;
        let value =
            format_modified(local_mtime).ok_or(TaskError::TimestampOutOfRange(local_mtime))?;
        let rel = child_rel(parent_relpath, &item.name);
        updated = ctx.remote.set_modified(drive_path(&rel), &value).await?;
        &updated
    } else {
        if let Some(remote_mtime) = parse_modified(item.modified.as_deref())? {
            paths::set_file_mtime(local_path, remote_mtime)?;
        }
        item
    };
    ctx.store
        .upsert(item, parent_relpath, local_size, ItemStatus::Ok)
        .await?;
    Ok(())
}

async fn run_upload(task: &UploadTask, ctx: &SyncContext) -> Result<(), TaskError> {
    if !ctx.pool.occupy(&task.local_path, Some(TaskKind::Upload)) {
        debug!(path = %task.local_path.display(), "upload skipped, path is busy");
        return Ok(());
    }
    let result = upload_inner(task, ctx).await;
    match &result {
        Err(TaskError::Api(err))
            if err.classification() == Some(ApiErrorClass::Permanent) && !is_not_found(err) =>
        {
            // The server refuses this content; stop retrying until the file
            // is written again.
            warn!(path = %task.local_path.display(), error = %err, "upload rejected, ignoring path until it changes");
            ctx.pool.occupy(&task.local_path, None);
        }
        _ => ctx.pool.release(&task.local_path),
    }
    result
}

async fn upload_inner(task: &UploadTask, ctx: &SyncContext) -> Result<(), TaskError> {
    let meta = tokio::fs::metadata(&task.local_path).await?;
    if !meta.is_file() {
        info!(path = %task.local_path.display(), "no longer a file, not uploading");
        return Ok(());
    }
    let size = meta.len();
    let rel = child_rel(&task.parent_relpath, &task.name);

    let item = if size <= PUT_SIZE_THRESHOLD {
        let link = ctx.remote.upload_link(drive_path(&rel), true).await?;
        ctx.transfer
            .upload_from_path(link.href.as_str(), &task.local_path)
            .await?;
        ctx.remote.get_item(drive_path(&rel)).await?
    } else {
        let link = ctx.remote.upload_session(drive_path(&rel), size).await?;
        match ctx
            .transfer
            .upload_chunked(link.href.as_str(), &task.local_path, size, UPLOAD_CHUNK_SIZE)
            .await?
        {
            Some(item) => item,
            None => ctx.remote.get_item(drive_path(&rel)).await?,
        }
    };

    update_timestamp_and_record(ctx, &item, &task.parent_relpath, &task.local_path, size as i64)
        .await?;
    info!(rel = %rel, bytes = size, "uploaded file");
    Ok(())
}

async fn run_download(task: &DownloadTask, ctx: &SyncContext) -> Result<(), TaskError> {
    let rel = child_rel(&task.parent_relpath, &task.item.name);
    let link = ctx.remote.download_link(drive_path(&rel)).await?;
    let written = ctx
        .transfer
        .download_to_path(
            link.href.as_str(),
            &task.local_path,
            task.item.sha256.as_deref(),
        )
        .await?;
    ctx.hashes.forget(&task.local_path);
    if let Some(remote_mtime) = parse_modified(task.item.modified.as_deref())? {
        paths::set_file_mtime(&task.local_path, remote_mtime)?;
    }
    ctx.store
        .upsert(&task.item, &task.parent_relpath, written as i64, ItemStatus::Ok)
        .await?;
    info!(rel = %rel, bytes = written, "downloaded file");
    Ok(())
}

async fn run_move(task: &MoveTask, ctx: &SyncContext) -> Result<(), TaskError> {
    let from_rel = child_rel(&task.parent_relpath, &task.name);
    let to_rel = child_rel(&task.new_parent_relpath, &task.new_name);
    let item = ctx
        .remote
        .move_item(drive_path(&from_rel), drive_path(&to_rel))
        .await?;
    ctx.store
        .move_item(
            &task.name,
            &task.parent_relpath,
            &task.new_name,
            &task.new_parent_relpath,
            task.is_folder,
        )
        .await?;
    let dest = local_path_for(&ctx.local_root, &to_rel)?;
    let local_size = match tokio::fs::metadata(&dest).await {
        Ok(meta) if meta.is_file() => meta.len() as i64,
        _ => 0,
    };
    ctx.store
        .upsert(&item, &task.new_parent_relpath, local_size, ItemStatus::Ok)
        .await?;
    info!(from = %from_rel, to = %to_rel, "moved remote item");
    Ok(())
}

async fn run_delete(task: &DeleteTask, ctx: &SyncContext) -> Result<(), TaskError> {
    let rel = child_rel(&task.parent_relpath, &task.name);
    ctx.remote.delete_item(drive_path(&rel)).await?;
    ctx.store
        .delete(&task.name, &task.parent_relpath, task.is_folder)
        .await?;
    info!(rel = %rel, "deleted remote item");
    Ok(())
}

async fn run_create_folder(task: &CreateFolderTask, ctx: &SyncContext) -> Result<(), TaskError> {
    if task.abort_if_local_gone {
        let still_a_dir = tokio::fs::metadata(&task.local_path)
            .await
            .map(|meta| meta.is_dir())
            .unwrap_or(false);
        if !still_a_dir {
            info!(path = %task.local_path.display(), "local directory is gone, not creating remote folder");
            return Ok(());
        }
    }
    let rel = child_rel(&task.parent_relpath, &task.name);
    let item = ctx.remote.create_folder(drive_path(&rel)).await?;
    ctx.store
        .upsert(&item, &task.parent_relpath, 0, ItemStatus::Ok)
        .await?;
    info!(rel = %rel, "created remote folder");
    if task.upload_if_success {
        ctx.pool.add(SyncTask::MergeDirectory(MergeDirectoryTask {
            rel_path: rel,
            local_path: task.local_path.clone(),
            deep: true,
            assume_remote_unchanged: false,
            parent_remote_unchanged: false,
        }));
    }
    Ok(())
}

async fn run_update_timestamp(
    task: &UpdateTimestampTask,
    ctx: &SyncContext,
) -> Result<(), TaskError> {
    let meta = match tokio::fs::metadata(&task.local_path).await {
        Ok(meta) if meta.is_file() => meta,
        _ => {
            info!(path = %task.local_path.display(), "no longer a file, not updating timestamp");
            return Ok(());
        }
    };
    let rel = child_rel(&task.parent_relpath, &task.name);
    let item = ctx.remote.get_item(drive_path(&rel)).await?;
    update_timestamp_and_record(
        ctx,
        &item,
        &task.parent_relpath,
        &task.local_path,
        meta.len() as i64,
    )
    .await?;
    Ok(())
}
