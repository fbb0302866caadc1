use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use sqlx::{Row, SqlitePool, migrate::Migrator, sqlite::SqliteConnectOptions};
use stratus_core::{Resource, ResourceKind};
use thiserror::Error;

use super::remote::parse_modified;

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("XDG data directory is unavailable")]
    MissingDataDir,
    #[error("invalid item kind: {0}")]
    InvalidItemKind(String),
    #[error("invalid item status: {0}")]
    InvalidStatus(String),
    #[error("invalid timestamp: {0}")]
    Timestamp(#[from] time::error::Parse),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemKind {
    File,
    Folder,
}

impl ItemKind {
    fn as_str(&self) -> &'static str {
        match self {
            ItemKind::File => "file",
            ItemKind::Folder => "folder",
        }
    }

    fn parse(value: &str) -> Result<Self, StoreError> {
        match value {
            "file" => Ok(ItemKind::File),
            "folder" => Ok(ItemKind::Folder),
            other => Err(StoreError::InvalidItemKind(other.to_string())),
        }
    }
}

impl From<ResourceKind> for ItemKind {
    fn from(kind: ResourceKind) -> Self {
        match kind {
            ResourceKind::File => ItemKind::File,
            ResourceKind::Dir => ItemKind::Folder,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemStatus {
    Ok,
    Marked,
}

impl ItemStatus {
    fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::Ok => "ok",
            ItemStatus::Marked => "marked",
        }
    }

    fn parse(value: &str) -> Result<Self, StoreError> {
        match value {
            "ok" => Ok(ItemStatus::Ok),
            "marked" => Ok(ItemStatus::Marked),
            other => Err(StoreError::InvalidStatus(other.to_string())),
        }
    }
}

/// Last-known-synced snapshot of one entry, keyed by `(parent_relpath, name)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemRecord {
    pub id: String,
    pub kind: ItemKind,
    pub name: String,
    pub parent_id: Option<String>,
    pub parent_relpath: String,
    pub e_tag: Option<String>,
    pub c_tag: Option<String>,
    pub remote_size: i64,
    pub local_size: i64,
    pub created_time: i64,
    pub modified_time: i64,
    pub status: ItemStatus,
    pub content_hash: Option<String>,
}

impl ItemRecord {
    pub fn is_folder(&self) -> bool {
        self.kind == ItemKind::Folder
    }

    /// Relative path of the item itself, e.g. `"/Docs/A.txt"`.
    pub fn rel_path(&self) -> String {
        format!("{}/{}", self.parent_relpath, self.name)
    }
}

pub struct MetadataStore {
    pool: SqlitePool,
}

impl MetadataStore {
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn open(db_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    pub async fn init(&self) -> Result<(), StoreError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    pub async fn get(
        &self,
        name: &str,
        parent_relpath: &str,
    ) -> Result<Option<ItemRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT id, kind, name, parent_id, parent_relpath, e_tag, c_tag, remote_size, local_size, created_time, modified_time, status, content_hash
             FROM items WHERE parent_relpath = ?1 AND name = ?2",
        )
        .bind(parent_relpath)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(record_from_row(&row)?))
    }

    pub async fn children(
        &self,
        parent_relpath: &str,
    ) -> Result<HashMap<String, ItemRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, kind, name, parent_id, parent_relpath, e_tag, c_tag, remote_size, local_size, created_time, modified_time, status, content_hash
             FROM items WHERE parent_relpath = ?1 ORDER BY name ASC",
        )
        .bind(parent_relpath)
        .fetch_all(&self.pool)
        .await?;

        let mut out = HashMap::with_capacity(rows.len());
        for row in rows {
            let record = record_from_row(&row)?;
            out.insert(record.name.clone(), record);
        }
        Ok(out)
    }

    /// Writes the last-known-synced snapshot for a remote item. `local_size`
    /// is the size observed on disk, which can lag the remote metadata.
    pub async fn upsert(
        &self,
        item: &Resource,
        parent_relpath: &str,
        local_size: i64,
        status: ItemStatus,
    ) -> Result<(), StoreError> {
        let created = parse_modified(item.created.as_deref())?.unwrap_or(0);
        let modified = parse_modified(item.modified.as_deref())?.unwrap_or(0);
        sqlx::query(
            "INSERT INTO items (id, kind, name, parent_id, parent_relpath, e_tag, c_tag, remote_size, local_size, created_time, modified_time, status, content_hash)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
             ON CONFLICT(parent_relpath, name) DO UPDATE SET
                id = excluded.id,
                kind = excluded.kind,
                parent_id = excluded.parent_id,
                e_tag = excluded.e_tag,
                c_tag = excluded.c_tag,
                remote_size = excluded.remote_size,
                local_size = excluded.local_size,
                created_time = excluded.created_time,
                modified_time = excluded.modified_time,
                status = excluded.status,
                content_hash = excluded.content_hash;",
        )
        .bind(item.id.as_deref().unwrap_or_default())
        .bind(ItemKind::from(item.kind).as_str())
        .bind(&item.name)
        .bind(Option::<String>::None)
        .bind(parent_relpath)
        .bind(&item.etag)
        .bind(&item.ctag)
        .bind(item.size.unwrap_or(0) as i64)
        .bind(local_size)
        .bind(created)
        .bind(modified)
        .bind(status.as_str())
        .bind(&item.sha256)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Deletes the record; for folders every record nested under it goes too.
    pub async fn delete(
        &self,
        name: &str,
        parent_relpath: &str,
        is_folder: bool,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM items WHERE parent_relpath = ?1 AND name = ?2")
            .bind(parent_relpath)
            .bind(name)
            .execute(&mut *tx)
            .await?;
        if is_folder {
            let sub = format!("{parent_relpath}/{name}");
            sqlx::query("DELETE FROM items WHERE parent_relpath = ?1 OR parent_relpath LIKE ?1 || '/%'")
                .bind(&sub)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Renames or reparents a record; for folders the path prefix of every
    /// descendant record is rewritten in the same transaction.
    pub async fn move_item(
        &self,
        name: &str,
        parent_relpath: &str,
        new_name: &str,
        new_parent_relpath: &str,
        is_folder: bool,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "UPDATE items SET name = ?1, parent_relpath = ?2 WHERE parent_relpath = ?3 AND name = ?4",
        )
        .bind(new_name)
        .bind(new_parent_relpath)
        .bind(parent_relpath)
        .bind(name)
        .execute(&mut *tx)
        .await?;
        if is_folder {
            let old_sub = format!("{parent_relpath}/{name}");
            let new_sub = format!("{new_parent_relpath}/{new_name}");
            sqlx::query(
                "UPDATE items SET parent_relpath = ?1 || substr(parent_relpath, length(?2) + 1)
                 WHERE parent_relpath = ?2 OR parent_relpath LIKE ?2 || '/%'",
            )
            .bind(&new_sub)
            .bind(&old_sub)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Flags every record for the generational sweep at the start of a rescan.
    pub async fn mark_all(&self) -> Result<(), StoreError> {
        sqlx::query("UPDATE items SET status = ?1")
            .bind(ItemStatus::Marked.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Clears the sweep flag on every record, abandoning the current rescan
    /// generation. Used when the drive root cannot be listed.
    pub async fn unmark_all(&self) -> Result<(), StoreError> {
        sqlx::query("UPDATE items SET status = ?1")
            .bind(ItemStatus::Ok.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Clears the sweep flag; for folders the whole subtree is spared, which
    /// keeps an aborted merge from losing its records to the next sweep.
    pub async fn unmark(
        &self,
        name: &str,
        parent_relpath: &str,
        is_folder: bool,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE items SET status = ?1 WHERE parent_relpath = ?2 AND name = ?3")
            .bind(ItemStatus::Ok.as_str())
            .bind(parent_relpath)
            .bind(name)
            .execute(&mut *tx)
            .await?;
        if is_folder {
            let sub = format!("{parent_relpath}/{name}");
            sqlx::query(
                "UPDATE items SET status = ?1 WHERE parent_relpath = ?2 OR parent_relpath LIKE ?2 || '/%'",
            )
            .bind(ItemStatus::Ok.as_str())
            .bind(&sub)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Deletes every record still carrying the sweep flag and returns how
    /// many rows went away.
    pub async fn sweep(&self) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM items WHERE status = ?1")
            .bind(ItemStatus::Marked.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

fn record_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<ItemRecord, StoreError> {
    let kind: String = row.try_get("kind")?;
    let status: String = row.try_get("status")?;
    Ok(ItemRecord {
        id: row.try_get("id")?,
        kind: ItemKind::parse(&kind)?,
        name: row.try_get("name")?,
        parent_id: row.try_get("parent_id")?,
        parent_relpath: row.try_get("parent_relpath")?,
        e_tag: row.try_get("e_tag")?,
        c_tag: row.try_get("c_tag")?,
        remote_size: row.try_get("remote_size")?,
        local_size: row.try_get("local_size")?,
        created_time: row.try_get("created_time")?,
        modified_time: row.try_get("modified_time")?,
        status: ItemStatus::parse(&status)?,
        content_hash: row.try_get("content_hash")?,
    })
}

pub fn default_db_path() -> Result<PathBuf, StoreError> {
    let mut path = dirs::data_dir().ok_or(StoreError::MissingDataDir)?;
    path.push("stratusd");
    path.push("index.db");
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn make_store() -> MetadataStore {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let store = MetadataStore::from_pool(pool);
        store.init().await.unwrap();
        store
    }

    fn resource(name: &str, parent_relpath: &str, kind: ResourceKind, size: u64) -> Resource {
        Resource {
            id: Some(format!("id-{name}")),
            path: format!("{parent_relpath}/{name}"),
            name: name.to_string(),
            kind,
            size: Some(size),
            created: Some("2024-05-01T10:00:00Z".to_string()),
            modified: Some("2024-05-02T10:00:00Z".to_string()),
            etag: Some(format!("etag-{name}")),
            ctag: Some(format!("ctag-{name}")),
            mtime_writable: true,
            sha256: None,
        }
    }

    #[tokio::test]
    async fn upsert_and_get_round_trip() {
        let store = make_store().await;
        let item = resource("A.txt", "/Docs", ResourceKind::File, 12);
        store.upsert(&item, "/Docs", 12, ItemStatus::Ok).await.unwrap();

        let record = store.get("A.txt", "/Docs").await.unwrap().unwrap();
        assert_eq!(record.id, "id-A.txt");
        assert_eq!(record.kind, ItemKind::File);
        assert_eq!(record.parent_relpath, "/Docs");
        assert_eq!(record.remote_size, 12);
        assert_eq!(record.local_size, 12);
        assert_eq!(record.modified_time, 1_714_644_000);
        assert_eq!(record.status, ItemStatus::Ok);
        assert_eq!(record.rel_path(), "/Docs/A.txt");
    }

    #[tokio::test]
    async fn upsert_replaces_existing_row() {
        let store = make_store().await;
        let mut item = resource("A.txt", "", ResourceKind::File, 12);
        store.upsert(&item, "", 12, ItemStatus::Ok).await.unwrap();

        item.size = Some(40);
        item.etag = Some("etag-2".to_string());
        store.upsert(&item, "", 40, ItemStatus::Ok).await.unwrap();

        let record = store.get("A.txt", "").await.unwrap().unwrap();
        assert_eq!(record.remote_size, 40);
        assert_eq!(record.local_size, 40);
        assert_eq!(record.e_tag.as_deref(), Some("etag-2"));
    }

    #[tokio::test]
    async fn children_maps_records_by_name() {
        let store = make_store().await;
        for name in ["a.txt", "b.txt"] {
            let item = resource(name, "/Docs", ResourceKind::File, 1);
            store.upsert(&item, "/Docs", 1, ItemStatus::Ok).await.unwrap();
        }
        let other = resource("c.txt", "/Other", ResourceKind::File, 1);
        store.upsert(&other, "/Other", 1, ItemStatus::Ok).await.unwrap();

        let children = store.children("/Docs").await.unwrap();
        assert_eq!(children.len(), 2);
        assert!(children.contains_key("a.txt"));
        assert!(children.contains_key("b.txt"));
    }

    #[tokio::test]
    async fn delete_folder_cascades_to_descendants() {
        let store = make_store().await;
        let folder = resource("Docs", "", ResourceKind::Dir, 0);
        store.upsert(&folder, "", 0, ItemStatus::Ok).await.unwrap();
        let nested = resource("Sub", "/Docs", ResourceKind::Dir, 0);
        store.upsert(&nested, "/Docs", 0, ItemStatus::Ok).await.unwrap();
        let deep = resource("deep.txt", "/Docs/Sub", ResourceKind::File, 3);
        store.upsert(&deep, "/Docs/Sub", 3, ItemStatus::Ok).await.unwrap();
        let sibling = resource("keep.txt", "", ResourceKind::File, 3);
        store.upsert(&sibling, "", 3, ItemStatus::Ok).await.unwrap();

        store.delete("Docs", "", true).await.unwrap();

        assert!(store.get("Docs", "").await.unwrap().is_none());
        assert!(store.get("Sub", "/Docs").await.unwrap().is_none());
        assert!(store.get("deep.txt", "/Docs/Sub").await.unwrap().is_none());
        assert!(store.get("keep.txt", "").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn delete_file_leaves_lookalike_prefixes() {
        let store = make_store().await;
        let file = resource("Docs", "", ResourceKind::File, 1);
        store.upsert(&file, "", 1, ItemStatus::Ok).await.unwrap();
        let nested = resource("x.txt", "/Docs", ResourceKind::File, 1);
        store.upsert(&nested, "/Docs", 1, ItemStatus::Ok).await.unwrap();

        store.delete("Docs", "", false).await.unwrap();

        assert!(store.get("Docs", "").await.unwrap().is_none());
        assert!(store.get("x.txt", "/Docs").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn move_folder_rewrites_descendant_prefixes() {
        let store = make_store().await;
        let folder = resource("Docs", "", ResourceKind::Dir, 0);
        store.upsert(&folder, "", 0, ItemStatus::Ok).await.unwrap();
        let nested = resource("Sub", "/Docs", ResourceKind::Dir, 0);
        store.upsert(&nested, "/Docs", 0, ItemStatus::Ok).await.unwrap();
        let deep = resource("deep.txt", "/Docs/Sub", ResourceKind::File, 3);
        store.upsert(&deep, "/Docs/Sub", 3, ItemStatus::Ok).await.unwrap();

        store.move_item("Docs", "", "Archive", "", true).await.unwrap();

        assert!(store.get("Docs", "").await.unwrap().is_none());
        assert!(store.get("Archive", "").await.unwrap().is_some());
        assert!(store.get("Sub", "/Archive").await.unwrap().is_some());
        let deep = store.get("deep.txt", "/Archive/Sub").await.unwrap().unwrap();
        assert_eq!(deep.parent_relpath, "/Archive/Sub");
    }

    #[tokio::test]
    async fn move_file_to_new_parent() {
        let store = make_store().await;
        let file = resource("a.txt", "/Docs", ResourceKind::File, 5);
        store.upsert(&file, "/Docs", 5, ItemStatus::Ok).await.unwrap();

        store
            .move_item("a.txt", "/Docs", "b.txt", "/Other", false)
            .await
            .unwrap();

        assert!(store.get("a.txt", "/Docs").await.unwrap().is_none());
        let moved = store.get("b.txt", "/Other").await.unwrap().unwrap();
        assert_eq!(moved.parent_relpath, "/Other");
    }

    #[tokio::test]
    async fn mark_unmark_sweep_cycle() {
        let store = make_store().await;
        let keep = resource("keep.txt", "", ResourceKind::File, 1);
        store.upsert(&keep, "", 1, ItemStatus::Ok).await.unwrap();
        let dead = resource("dead.txt", "", ResourceKind::File, 1);
        store.upsert(&dead, "", 1, ItemStatus::Ok).await.unwrap();

        store.mark_all().await.unwrap();
        store.unmark("keep.txt", "", false).await.unwrap();

        let swept = store.sweep().await.unwrap();
        assert_eq!(swept, 1);
        assert!(store.get("keep.txt", "").await.unwrap().is_some());
        assert!(store.get("dead.txt", "").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unmark_all_abandons_the_generation() {
        let store = make_store().await;
        let a = resource("a.txt", "", ResourceKind::File, 1);
        store.upsert(&a, "", 1, ItemStatus::Ok).await.unwrap();
        let b = resource("b.txt", "", ResourceKind::File, 1);
        store.upsert(&b, "", 1, ItemStatus::Ok).await.unwrap();

        store.mark_all().await.unwrap();
        store.unmark_all().await.unwrap();

        assert_eq!(store.sweep().await.unwrap(), 0);
        assert!(store.get("a.txt", "").await.unwrap().is_some());
        assert!(store.get("b.txt", "").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn unmark_folder_spares_subtree() {
        let store = make_store().await;
        let folder = resource("Docs", "", ResourceKind::Dir, 0);
        store.upsert(&folder, "", 0, ItemStatus::Ok).await.unwrap();
        let deep = resource("deep.txt", "/Docs", ResourceKind::File, 3);
        store.upsert(&deep, "/Docs", 3, ItemStatus::Ok).await.unwrap();
        let dead = resource("dead.txt", "", ResourceKind::File, 1);
        store.upsert(&dead, "", 1, ItemStatus::Ok).await.unwrap();

        store.mark_all().await.unwrap();
        store.unmark("Docs", "", true).await.unwrap();

        let swept = store.sweep().await.unwrap();
        assert_eq!(swept, 1);
        assert!(store.get("Docs", "").await.unwrap().is_some());
        assert!(store.get("deep.txt", "/Docs").await.unwrap().is_some());
    }
}
