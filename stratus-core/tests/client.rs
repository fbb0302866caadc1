use serde_json::json;
use stratus_core::{ApiErrorClass, DriveClient, ResourceKind};
use wiremock::matchers::{body_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn get_drive_info_includes_bearer_header() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v1/drive"))
        .and(header("authorization", "Bearer test-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "total_space": 1024,
            "used_space": 256,
            "trash_size": 0
        })))
        .mount(&server)
        .await;

    let client = DriveClient::with_base_url(&server.uri(), "test-token").unwrap();
    let info = client.get_drive_info().await.unwrap();

    assert_eq!(info.total_space, 1024);
    assert_eq!(info.used_space, 256);
}

#[tokio::test]
async fn set_token_replaces_auth_header() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v1/drive"))
        .and(header("authorization", "Bearer rotated"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "total_space": 1,
            "used_space": 0
        })))
        .mount(&server)
        .await;

    let client = DriveClient::with_base_url(&server.uri(), "stale").unwrap();
    client.set_token("rotated");
    client.get_drive_info().await.unwrap();
}

#[tokio::test]
async fn get_resource_encodes_path() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v1/resources"))
        .and(query_param("path", "/Docs/Hello World.txt"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "res-1",
            "path": "/Docs/Hello World.txt",
            "name": "Hello World.txt",
            "type": "file",
            "size": 12,
            "modified": "2024-01-01T00:00:00Z",
            "etag": "e1",
            "ctag": "c1",
            "sha256": "abc"
        })))
        .mount(&server)
        .await;

    let client = DriveClient::with_base_url(&server.uri(), "test-token").unwrap();
    let resource = client.get_resource("/Docs/Hello World.txt").await.unwrap();

    assert_eq!(resource.kind, ResourceKind::File);
    assert_eq!(resource.size, Some(12));
    assert_eq!(resource.etag.as_deref(), Some("e1"));
    assert!(resource.mtime_writable);
}

#[tokio::test]
async fn list_folder_returns_embedded_items() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v1/resources"))
        .and(query_param("path", "/Docs"))
        .and(query_param("limit", "2"))
        .and(query_param("offset", "0"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "_embedded": {
                "limit": 2,
                "offset": 0,
                "total": 4,
                "items": [
                    {
                        "path": "/Docs/A.txt",
                        "name": "A.txt",
                        "type": "file",
                        "size": 1
                    },
                    {
                        "path": "/Docs/B",
                        "name": "B",
                        "type": "dir"
                    }
                ]
            }
        })))
        .mount(&server)
        .await;

    let client = DriveClient::with_base_url(&server.uri(), "test-token").unwrap();
    let list = client.list_folder("/Docs", Some(2), Some(0)).await.unwrap();

    assert_eq!(list.limit, 2);
    assert_eq!(list.total, 4);
    assert_eq!(list.items.len(), 2);
    assert_eq!(list.items[0].name, "A.txt");
    assert_eq!(list.items[1].kind, ResourceKind::Dir);
}

#[tokio::test]
async fn list_folder_all_chains_pages() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v1/resources"))
        .and(query_param("offset", "0"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "_embedded": {
                "limit": 2,
                "offset": 0,
                "total": 3,
                "items": [
                    { "path": "/D/a", "name": "a", "type": "file" },
                    { "path": "/D/b", "name": "b", "type": "file" }
                ]
            }
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/resources"))
        .and(query_param("offset", "2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "_embedded": {
                "limit": 2,
                "offset": 2,
                "total": 3,
                "items": [
                    { "path": "/D/c", "name": "c", "type": "file" }
                ]
            }
        })))
        .mount(&server)
        .await;

    let client = DriveClient::with_base_url(&server.uri(), "test-token").unwrap();
    let items = client.list_folder_all("/D", 2).await.unwrap();

    let names: Vec<_> = items.iter().map(|r| r.name.as_str()).collect();
    assert_eq!(names, vec!["a", "b", "c"]);
}

#[tokio::test]
async fn create_folder_uses_put() {
    let server = MockServer::start().await;

    Mock::given(method("PUT"))
        .and(path("/v1/resources"))
        .and(query_param("path", "/Docs/NewFolder"))
        .and(header("authorization", "Bearer test-token"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "path": "/Docs/NewFolder",
            "name": "NewFolder",
            "type": "dir"
        })))
        .mount(&server)
        .await;

    let client = DriveClient::with_base_url(&server.uri(), "test-token").unwrap();
    let resource = client.create_folder("/Docs/NewFolder").await.unwrap();

    assert_eq!(resource.kind, ResourceKind::Dir);
    assert_eq!(resource.name, "NewFolder");
}

#[tokio::test]
async fn move_resource_returns_moved_metadata() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/resources/move"))
        .and(query_param("from", "/Docs/A.txt"))
        .and(query_param("path", "/Docs/B.txt"))
        .and(query_param("overwrite", "false"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "res-1",
            "path": "/Docs/B.txt",
            "name": "B.txt",
            "type": "file",
            "size": 7
        })))
        .mount(&server)
        .await;

    let client = DriveClient::with_base_url(&server.uri(), "test-token").unwrap();
    let moved = client
        .move_resource("/Docs/A.txt", "/Docs/B.txt", false)
        .await
        .unwrap();

    assert_eq!(moved.name, "B.txt");
    assert_eq!(moved.path, "/Docs/B.txt");
}

#[tokio::test]
async fn delete_resource_accepts_no_content() {
    let server = MockServer::start().await;

    Mock::given(method("DELETE"))
        .and(path("/v1/resources"))
        .and(query_param("path", "/Docs/Delete.txt"))
        .and(query_param("permanently", "true"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;

    let client = DriveClient::with_base_url(&server.uri(), "test-token").unwrap();
    client
        .delete_resource("/Docs/Delete.txt", true)
        .await
        .unwrap();
}

#[tokio::test]
async fn set_modified_patches_resource() {
    let server = MockServer::start().await;

    Mock::given(method("PATCH"))
        .and(path("/v1/resources"))
        .and(query_param("path", "/Docs/A.txt"))
        .and(body_json(json!({ "modified": "2024-02-02T00:00:00Z" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "path": "/Docs/A.txt",
            "name": "A.txt",
            "type": "file",
            "modified": "2024-02-02T00:00:00Z"
        })))
        .mount(&server)
        .await;

    let client = DriveClient::with_base_url(&server.uri(), "test-token").unwrap();
    let updated = client
        .set_modified("/Docs/A.txt", "2024-02-02T00:00:00Z")
        .await
        .unwrap();

    assert_eq!(updated.modified.as_deref(), Some("2024-02-02T00:00:00Z"));
}

#[tokio::test]
async fn transfer_links_round_trip() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v1/resources/download"))
        .and(query_param("path", "/Docs/Hello.txt"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "href": "https://download.example/hello.txt",
            "method": "GET",
            "templated": false
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/resources/upload"))
        .and(query_param("path", "/Docs/Hello.txt"))
        .and(query_param("overwrite", "true"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "href": "https://upload.example/hello.txt",
            "method": "PUT",
            "templated": false
        })))
        .mount(&server)
        .await;

    let client = DriveClient::with_base_url(&server.uri(), "test-token").unwrap();
    let download = client.get_download_link("/Docs/Hello.txt").await.unwrap();
    let upload = client
        .get_upload_link("/Docs/Hello.txt", true)
        .await
        .unwrap();

    assert_eq!(download.href.as_str(), "https://download.example/hello.txt");
    assert_eq!(upload.method, "PUT");
}

#[tokio::test]
async fn create_upload_session_posts_size() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/resources/upload-session"))
        .and(query_param("path", "/Docs/big.bin"))
        .and(query_param("size", "20971520"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "href": "https://upload.example/session/1",
            "method": "PUT",
            "templated": false
        })))
        .mount(&server)
        .await;

    let client = DriveClient::with_base_url(&server.uri(), "test-token").unwrap();
    let session = client
        .create_upload_session("/Docs/big.bin", 20 * 1024 * 1024)
        .await
        .unwrap();

    assert_eq!(session.href.as_str(), "https://upload.example/session/1");
}

#[tokio::test]
async fn api_errors_classify_by_status() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v1/resources"))
        .and(query_param("path", "/throttled"))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "7"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/resources"))
        .and(query_param("path", "/denied"))
        .respond_with(ResponseTemplate::new(403))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/resources"))
        .and(query_param("path", "/missing"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/resources"))
        .and(query_param("path", "/broken"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let client = DriveClient::with_base_url(&server.uri(), "test-token").unwrap();

    let throttled = client.get_resource("/throttled").await.unwrap_err();
    assert_eq!(throttled.classification(), Some(ApiErrorClass::RateLimit));
    assert_eq!(throttled.retry_after_secs(), Some(7));
    assert!(throttled.is_retryable());

    let denied = client.get_resource("/denied").await.unwrap_err();
    assert_eq!(denied.classification(), Some(ApiErrorClass::Auth));
    assert!(!denied.is_retryable());

    let missing = client.get_resource("/missing").await.unwrap_err();
    assert_eq!(missing.classification(), Some(ApiErrorClass::Permanent));

    let broken = client.get_resource("/broken").await.unwrap_err();
    assert_eq!(broken.classification(), Some(ApiErrorClass::Transient));
    assert!(broken.is_retryable());
}
