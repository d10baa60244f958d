use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, head, post};
use axum::{Json, Router};
use base64::Engine;
use serde_json::{json, Value};

use biomero_importer::client::OmeroWebClient;
use biomero_importer::load_config::{ServerSection, SessionSecrets};
use biomero_importer_core::config::UploadConfig;
use biomero_importer_core::contract::{
    DatasetType, ImportApi, ImportRequest, NewUpload, ResumableTransport, TreeFilter, TreeService,
    UploadHandle,
};
use biomero_importer_core::error::{ImportError, TransportError};
use biomero_importer_core::upload::{ImportTarget, UploadSession};

const SESSION_KEY: &str = "key123";
const CSRF_TOKEN: &str = "tok456";

#[derive(Default)]
struct StoredUpload {
    length: u64,
    metadata: String,
    data: Vec<u8>,
}

/// In-process OMERO.web stand-in speaking TUS 1.0.0 and the import API.
#[derive(Default)]
struct Server {
    uploads: HashMap<String, StoredUpload>,
    next_id: u32,
    /// PATCH requests that store their bytes but answer 503.
    lost_acks: u32,
    requests: Vec<String>,
    tree_queries: Vec<HashMap<String, String>>,
    imports: Vec<Value>,
}

type Shared = Arc<Mutex<Server>>;

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn authorized(headers: &HeaderMap, unsafe_method: bool) -> bool {
    let cookie = header(headers, "cookie").unwrap_or_default();
    if !cookie.contains(&format!("sessionid={SESSION_KEY}")) {
        return false;
    }
    !unsafe_method
        || (header(headers, "x-csrftoken") == Some(CSRF_TOKEN)
            && cookie.contains(&format!("csrftoken={CSRF_TOKEN}")))
}

async fn tree(
    State(server): State<Shared>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    if !authorized(&headers, false) {
        return StatusCode::FORBIDDEN.into_response();
    }
    server.lock().unwrap().tree_queries.push(query);
    Json(json!([
        {"id": 1, "type": "project", "name": "project one", "childCount": 1, "children": [
            {"id": 10, "type": "dataset", "name": "dataset ten", "children": [
                {"id": 100, "type": "file", "name": "a.tif", "mimetype": "image/tiff", "size": 10}
            ]}
        ]}
    ]))
    .into_response()
}

async fn create_upload(State(server): State<Shared>, headers: HeaderMap) -> Response {
    if !authorized(&headers, true) {
        return (StatusCode::FORBIDDEN, "CSRF verification failed").into_response();
    }
    if header(&headers, "tus-resumable") != Some("1.0.0") {
        return StatusCode::PRECONDITION_FAILED.into_response();
    }
    let Some(length) = header(&headers, "upload-length").and_then(|v| v.parse::<u64>().ok()) else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    let mut server = server.lock().unwrap();
    server.requests.push("POST".to_string());
    server.next_id += 1;
    let id = format!("up{}", server.next_id);
    server.uploads.insert(
        id.clone(),
        StoredUpload {
            length,
            metadata: header(&headers, "upload-metadata").unwrap_or_default().to_string(),
            data: Vec::new(),
        },
    );
    (
        StatusCode::CREATED,
        [
            ("Location", format!("/omero_biomero/upload/{id}")),
            ("Tus-Resumable", "1.0.0".to_string()),
        ],
    )
        .into_response()
}

async fn upload_offset(
    State(server): State<Shared>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    if !authorized(&headers, false) {
        return StatusCode::FORBIDDEN.into_response();
    }
    let mut server = server.lock().unwrap();
    server.requests.push("HEAD".to_string());
    match server.uploads.get(&id) {
        Some(upload) => (
            StatusCode::OK,
            [
                ("Upload-Offset", upload.data.len().to_string()),
                ("Upload-Length", upload.length.to_string()),
            ],
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn append(
    State(server): State<Shared>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if !authorized(&headers, true) {
        return StatusCode::FORBIDDEN.into_response();
    }
    if header(&headers, "content-type") != Some("application/offset+octet-stream") {
        return StatusCode::UNSUPPORTED_MEDIA_TYPE.into_response();
    }
    let mut server = server.lock().unwrap();
    server.requests.push("PATCH".to_string());
    let lose_ack = server.lost_acks > 0;
    if lose_ack {
        server.lost_acks -= 1;
    }
    let Some(upload) = server.uploads.get_mut(&id) else {
        return (StatusCode::NOT_FOUND, Json(json!({"error": "Upload not found"}))).into_response();
    };
    let offset = header(&headers, "upload-offset").and_then(|v| v.parse::<usize>().ok());
    if offset != Some(upload.data.len()) {
        return StatusCode::CONFLICT.into_response();
    }
    upload.data.extend_from_slice(&body);
    let stored = upload.data.len();
    if lose_ack {
        return (StatusCode::SERVICE_UNAVAILABLE, "upstream timed out").into_response();
    }
    (StatusCode::NO_CONTENT, [("Upload-Offset", stored.to_string())]).into_response()
}

async fn terminate(
    State(server): State<Shared>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    if !authorized(&headers, true) {
        return StatusCode::FORBIDDEN.into_response();
    }
    let mut server = server.lock().unwrap();
    server.requests.push("DELETE".to_string());
    match server.uploads.remove(&id) {
        Some(_) => StatusCode::NO_CONTENT.into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn import(State(server): State<Shared>, headers: HeaderMap, Json(body): Json<Value>) -> Response {
    if !authorized(&headers, true) {
        return StatusCode::FORBIDDEN.into_response();
    }
    let dataset_id = body["datasetId"].as_i64();
    server.lock().unwrap().imports.push(body);
    if dataset_id == Some(404) {
        return (StatusCode::NOT_FOUND, Json(json!({"error": "Dataset 404 not found"}))).into_response();
    }
    Json(json!({"status": "success", "message": "Import queued", "jobId": "job-1"})).into_response()
}

async fn spawn_server(server: Shared) -> String {
    let app = Router::new()
        .route("/omero_biomero/api/importer/omero_tree/", get(tree))
        .route("/omero_biomero/upload/", post(create_upload))
        .route(
            "/omero_biomero/upload/{id}",
            head(upload_offset).patch(append).delete(terminate),
        )
        .route("/omero_biomero/api/importer/import_uploaded_file/", post(import))
        .with_state(server);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

fn client(base_url: &str, csrf_token: Option<&str>) -> OmeroWebClient {
    let server: ServerSection =
        serde_yaml::from_str(&format!("base_url: \"{base_url}\"\ntimeout_secs: 5\n")).unwrap();
    OmeroWebClient::new(
        &server,
        SessionSecrets {
            session_key: SESSION_KEY.to_string(),
            csrf_token: csrf_token.map(str::to_string),
        },
    )
    .unwrap()
}

fn target(dataset_id: i64) -> ImportTarget {
    ImportTarget {
        dataset_id,
        dataset_type: DatasetType::Dataset,
        group: None,
    }
}

#[tokio::test]
async fn fetch_tree_sends_the_session_cookie_and_filter() {
    let server = Shared::default();
    let base = spawn_server(server.clone()).await;

    let forest = client(&base, None)
        .fetch_tree(&TreeFilter {
            group: Some("lab".to_string()),
            owner: Some(3),
        })
        .await
        .unwrap();

    assert_eq!(forest.len(), 1);
    assert_eq!(forest[0].child_count, Some(1));
    assert_eq!(forest[0].children[0].children[0].name, "a.tif");
    assert_eq!(forest[0].children[0].children[0].size, Some(10));

    let server = server.lock().unwrap();
    let queries = &server.tree_queries;
    assert_eq!(queries[0].get("group").map(String::as_str), Some("lab"));
    assert_eq!(queries[0].get("owner").map(String::as_str), Some("3"));
}

#[tokio::test]
async fn session_uploads_over_tus_and_resumes_after_a_lost_acknowledgment() {
    let server = Shared::default();
    server.lock().unwrap().lost_acks = 1;
    let base = spawn_server(server.clone()).await;
    let client = client(&base, Some(CSRF_TOKEN));

    let bytes: Vec<u8> = (0u8..10).collect();
    let mut session = UploadSession::new(
        "plate 1.tif",
        bytes.clone(),
        target(10),
        UploadConfig {
            chunk_size: 4,
            retry_delays_ms: vec![0, 0],
            ..UploadConfig::default()
        },
    )
    .with_mimetype("image/tiff");

    assert_eq!(session.run(&client).await.unwrap(), 10);
    assert_eq!(session.retry_count(), 1);

    let server = server.lock().unwrap();
    // The first PATCH stored 4 bytes without acknowledging them; HEAD recovers the offset.
    assert_eq!(server.requests, ["POST", "PATCH", "HEAD", "PATCH", "PATCH"]);
    let upload = &server.uploads["up1"];
    assert_eq!(upload.length, 10);
    assert_eq!(upload.data, bytes);

    let engine = base64::engine::general_purpose::STANDARD;
    let metadata: HashMap<&str, String> = upload
        .metadata
        .split(',')
        .filter_map(|pair| pair.split_once(' '))
        .map(|(k, v)| (k, String::from_utf8(engine.decode(v).unwrap()).unwrap()))
        .collect();
    assert_eq!(metadata["filename"], "plate 1.tif");
    assert_eq!(metadata["filetype"], "image/tiff");
}

#[tokio::test]
async fn missing_csrf_token_is_a_fatal_create_error() {
    let base = spawn_server(Shared::default()).await;

    let mut session = UploadSession::new("a.tif", vec![1, 2, 3], target(10), UploadConfig::default());
    let err = session.run(&client(&base, None)).await.unwrap_err();

    assert!(err.to_string().contains("CSRF verification failed"), "{err}");
    assert_eq!(session.retry_count(), 0);
}

#[tokio::test]
async fn offset_conflicts_are_transient_and_unknown_uploads_fatal() {
    let server = Shared::default();
    let base = spawn_server(server.clone()).await;
    let client = client(&base, Some(CSRF_TOKEN));

    let handle = client
        .create(&NewUpload {
            file_id: "a.tif".to_string(),
            total_size: 8,
            mimetype: None,
        })
        .await
        .unwrap();
    assert_eq!(handle.location, format!("{base}/omero_biomero/upload/up1"));

    let conflict = client.send_chunk(&handle, 4, b"abcd").await.unwrap_err();
    assert!(conflict.is_transient(), "{conflict:?}");

    let ack = client.send_chunk(&handle, 0, b"abcd").await.unwrap();
    assert_eq!(ack.offset, 4);
    assert_eq!(client.current_offset(&handle).await.unwrap(), 4);

    let missing = UploadHandle {
        location: format!("{base}/omero_biomero/upload/missing"),
    };
    assert_eq!(
        client.send_chunk(&missing, 0, b"x").await.unwrap_err(),
        TransportError::Fatal("404 Not Found: Upload not found".to_string())
    );
}

#[tokio::test]
async fn terminate_deletes_the_upload_resource() {
    let server = Shared::default();
    let base = spawn_server(server.clone()).await;
    let client = client(&base, Some(CSRF_TOKEN));

    let handle = client
        .create(&NewUpload {
            file_id: "a.tif".to_string(),
            total_size: 8,
            mimetype: None,
        })
        .await
        .unwrap();
    client.terminate(&handle).await.unwrap();

    assert!(server.lock().unwrap().uploads.is_empty());
    assert!(!client.current_offset(&handle).await.unwrap_err().is_transient());
}

#[tokio::test]
async fn import_posts_the_request_and_maps_error_bodies() {
    let server = Shared::default();
    let base = spawn_server(server.clone()).await;
    let client = client(&base, Some(CSRF_TOKEN));

    let ack = client
        .import(&ImportRequest {
            file_id: "a.tif".to_string(),
            dataset_id: 10,
            dataset_type: DatasetType::Dataset,
            group: Some("lab".to_string()),
        })
        .await
        .unwrap();
    assert_eq!(ack.status, "success");
    assert_eq!(ack.job_id.as_deref(), Some("job-1"));

    let err = client
        .import(&ImportRequest {
            file_id: "b.tif".to_string(),
            dataset_id: 404,
            dataset_type: DatasetType::Dataset,
            group: None,
        })
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ImportError::Rejected { status: 404, ref message } if message == "Dataset 404 not found"
    ));

    let server = server.lock().unwrap();
    let imports = &server.imports;
    assert_eq!(
        imports[0],
        json!({"filename": "a.tif", "datasetId": 10, "datasetType": "Dataset", "group": "lab"})
    );
    assert!(imports[1].get("group").is_none());
}
