use super::*;
use crate::sync::store::ItemStatus;
use sqlx::SqlitePool;
use stratus_core::Resource;
use tempfile::tempdir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn scan_context(root: &Path) -> Arc<SyncContext> {
    let client = DriveClient::with_base_url("http://127.0.0.1:9", "token").unwrap();
    let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
    let store = MetadataStore::from_pool(pool);
    store.init().await.unwrap();
    Arc::new(SyncContext {
        local_root: root.to_path_buf(),
        host_label: "test-host".to_string(),
        store,
        filter: PathFilter::with_builtins(),
        pool: TaskPool::new(),
        remote: Remote::new(client, None, None),
        transfer: TransferClient::new(),
        hashes: HashCache::new(),
        watches: WatchRegistry::new(),
    })
}

async fn seed_file(ctx: &SyncContext, name: &str) {
    let item: Resource = serde_json::from_value(serde_json::json!({
        "id": format!("id-{name}"),
        "path": format!("disk:/{name}"),
        "name": name,
        "type": "file",
        "size": 5,
        "modified": "2024-05-02T10:00:00Z",
        "etag": format!("e-{name}"),
        "ctag": format!("c-{name}"),
    }))
    .unwrap();
    ctx.store.upsert(&item, "", 5, ItemStatus::Ok).await.unwrap();
}

fn bootstrap_config(dir: &Path, api_base: &str) -> DaemonConfig {
    DaemonConfig {
        local_root: dir.join("Root"),
        db_path: dir.join("data").join("index.db"),
        ignore_file: None,
        api_base: Some(api_base.to_string()),
        auth_base: None,
        token: "token".to_string(),
        refresh_token: None,
        client_id: None,
        client_secret: None,
        workers: 1,
        scan_interval: Duration::from_secs(60),
        host_label: "test-host".to_string(),
        enable_watcher: false,
    }
}

#[test]
fn expands_tilde_to_home_sync_dir() {
    let home = PathBuf::from("/tmp/home-user");
    assert_eq!(
        expand_with_home("~/Stratus", &home),
        PathBuf::from("/tmp/home-user/Stratus")
    );
    assert_eq!(expand_with_home("~", &home), home);
    assert_eq!(
        expand_with_home("/var/sync", &home),
        PathBuf::from("/var/sync")
    );
}

#[test]
fn reads_numbers_from_env_or_default() {
    assert_eq!(read_u64_env("NO_SUCH_ENV_FOR_TEST", 42), 42);
    assert_eq!(read_usize_env("NO_SUCH_ENV_FOR_TEST", 3), 3);
}

#[test]
fn watcher_is_enabled_by_default() {
    assert!(read_bool_env("NO_SUCH_BOOL_ENV_FOR_TEST", true));
}

#[test]
fn host_label_is_never_empty() {
    assert!(!default_host_label().is_empty());
}

#[tokio::test]
async fn removes_stale_temp_files_recursively() {
    let dir = tempdir().unwrap();
    let sub = dir.path().join("Docs");
    tokio::fs::create_dir_all(&sub).await.unwrap();
    tokio::fs::write(sub.join(".a.txt.stratuspart"), b"partial")
        .await
        .unwrap();
    tokio::fs::write(sub.join("a.txt"), b"keep-me").await.unwrap();

    remove_stale_temp_files(dir.path()).await;

    assert!(
        tokio::fs::metadata(sub.join(".a.txt.stratuspart"))
            .await
            .is_err()
    );
    assert!(tokio::fs::metadata(sub.join("a.txt")).await.is_ok());
}

#[tokio::test]
async fn full_scan_sweeps_the_previous_generation_and_queues_the_root() {
    let dir = tempdir().unwrap();
    let ctx = scan_context(dir.path()).await;
    seed_file(&ctx, "a.txt").await;
    ctx.store.mark_all().await.unwrap();

    schedule_full_scan(&ctx).await;

    assert!(ctx.store.get("a.txt", "").await.unwrap().is_none());
    assert_eq!(ctx.pool.outstanding(), 1);
    let task = ctx.pool.pop().await.unwrap();
    match task {
        SyncTask::MergeDirectory(merge) => {
            assert_eq!(merge.rel_path, "");
            assert!(merge.deep);
        }
        other => panic!("unexpected task {other}"),
    }
}

#[tokio::test]
async fn rescan_is_skipped_while_work_is_outstanding() {
    let dir = tempdir().unwrap();
    let ctx = scan_context(dir.path()).await;
    seed_file(&ctx, "a.txt").await;
    ctx.store.mark_all().await.unwrap();
    queue_root_merge(&ctx);

    schedule_full_scan(&ctx).await;

    assert!(ctx.store.get("a.txt", "").await.unwrap().is_some());
    assert_eq!(ctx.pool.outstanding(), 1);
}

#[tokio::test]
async fn bootstrap_creates_the_root_store_and_filter() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/drive"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "total_space": 1000,
            "used_space": 100,
            "trash_size": 0
        })))
        .mount(&server)
        .await;
    let dir = tempdir().unwrap();
    let ignore_file = dir.path().join("ignore.txt");
    tokio::fs::write(&ignore_file, "*.log\n").await.unwrap();
    let mut config = bootstrap_config(dir.path(), &server.uri());
    config.ignore_file = Some(ignore_file);

    let daemon = DaemonRuntime::bootstrap(config).await.unwrap();

    assert!(tokio::fs::metadata(dir.path().join("Root")).await.is_ok());
    assert!(
        tokio::fs::metadata(dir.path().join("data").join("index.db"))
            .await
            .is_ok()
    );
    assert!(daemon.ctx.filter.should_ignore("/build.log", false));
    assert!(!daemon.ctx.filter.should_ignore("/notes.txt", false));
}

#[tokio::test]
async fn bootstrap_fails_fast_on_rejected_credentials() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/drive"))
        .respond_with(ResponseTemplate::new(401).set_body_string("unauthorized"))
        .mount(&server)
        .await;
    let dir = tempdir().unwrap();

    let err = DaemonRuntime::bootstrap(bootstrap_config(dir.path(), &server.uri()))
        .await
        .unwrap_err();

    assert!(err.to_string().contains("credentials"));
    assert!(tokio::fs::metadata(dir.path().join("Root")).await.is_ok());
}
