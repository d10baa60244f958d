//! # OMERO.web client
//!
//! [`OmeroWebClient`] implements the three remote contracts of the core
//! crate over HTTP:
//! - [`TreeService`]: `GET` of the project/dataset/file forest.
//! - [`ResumableTransport`]: a TUS 1.0.0 client for the plugin's upload endpoint.
//! - [`ImportApi`]: `POST` of an import request for an uploaded file.
//!
//! Authentication reuses an existing OMERO.web session: the session key is
//! sent as the `sessionid` cookie, plus a CSRF token for unsafe methods when
//! one is configured.

use async_trait::async_trait;
use base64::Engine;
use reqwest::header::{HeaderMap, CONTENT_TYPE, COOKIE, LOCATION, REFERER};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;

use biomero_importer_core::contract::{
    ChunkAck, Forest, ImportAck, ImportApi, ImportRequest, NewUpload, ResumableTransport,
    TreeFilter, TreeService, UploadHandle,
};
use biomero_importer_core::error::{ImportError, ServiceError, TransportError};

use crate::load_config::{ServerSection, SessionSecrets};

pub const TUS_VERSION: &str = "1.0.0";
const TUS_RESUMABLE: &str = "Tus-Resumable";
const UPLOAD_LENGTH: &str = "Upload-Length";
const UPLOAD_OFFSET: &str = "Upload-Offset";
const UPLOAD_METADATA: &str = "Upload-Metadata";
const CSRF_HEADER: &str = "X-CSRFToken";
const OFFSET_OCTET_STREAM: &str = "application/offset+octet-stream";
const DEFAULT_FILETYPE: &str = "application/octet-stream";

#[derive(Clone)]
pub struct OmeroWebClient {
    http: Client,
    base_url: String,
    tree_path: String,
    upload_path: String,
    import_path: String,
    secrets: SessionSecrets,
}

impl OmeroWebClient {
    pub fn new(server: &ServerSection, secrets: SessionSecrets) -> Result<Self, reqwest::Error> {
        let http = Client::builder().timeout(server.timeout()).build()?;
        tracing::info!(
            base_url = %server.base_url,
            upload_path = %server.upload_path,
            "Initialized OmeroWebClient"
        );
        Ok(OmeroWebClient {
            http,
            base_url: server.base_url.trim_end_matches('/').to_string(),
            tree_path: server.tree_path.clone(),
            upload_path: server.upload_path.clone(),
            import_path: server.import_path.clone(),
            secrets,
        })
    }

    /// Absolute URL for a server path; absolute URLs pass through.
    pub fn url(&self, path: &str) -> String {
        resolve_url(&self.base_url, path)
    }

    fn authorized(&self, request: RequestBuilder, unsafe_method: bool) -> RequestBuilder {
        let mut cookie = format!("sessionid={}", self.secrets.session_key);
        let mut request = request.header(REFERER, format!("{}/", self.base_url));
        if unsafe_method {
            if let Some(token) = &self.secrets.csrf_token {
                cookie.push_str(&format!("; csrftoken={token}"));
                request = request.header(CSRF_HEADER, token);
            }
        }
        request.header(COOKIE, cookie)
    }

    fn tus(&self, request: RequestBuilder, unsafe_method: bool) -> RequestBuilder {
        self.authorized(request, unsafe_method)
            .header(TUS_RESUMABLE, TUS_VERSION)
    }
}

#[async_trait]
impl TreeService for OmeroWebClient {
    async fn fetch_tree(&self, filter: &TreeFilter) -> Result<Forest, ServiceError> {
        let url = self.url(&self.tree_path);
        let mut query: Vec<(&str, String)> = Vec::new();
        if let Some(group) = &filter.group {
            query.push(("group", group.clone()));
        }
        if let Some(owner) = filter.owner {
            query.push(("owner", owner.to_string()));
        }
        tracing::debug!(url = %url, ?query, "Fetching OMERO tree");

        let resp = self
            .authorized(self.http.get(&url).query(&query), false)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            tracing::error!(status = %status, url = %url, "Tree request failed. Response body: {text}");
            return Err(format!("tree request returned {status}: {}", error_message(&text)).into());
        }
        let forest: Forest = resp.json().await?;
        tracing::info!(projects = forest.len(), "Fetched OMERO tree");
        Ok(forest)
    }
}

#[async_trait]
impl ResumableTransport for OmeroWebClient {
    async fn create(&self, req: &NewUpload) -> Result<UploadHandle, TransportError> {
        let url = self.url(&self.upload_path);
        let resp = self
            .tus(self.http.post(&url), true)
            .header(UPLOAD_LENGTH, req.total_size)
            .header(UPLOAD_METADATA, upload_metadata(req))
            .send()
            .await
            .map_err(classify_request_error)?;
        let resp = expect_status(resp, StatusCode::CREATED).await?;

        let location = header_str(resp.headers(), LOCATION.as_str())
            .ok_or_else(|| TransportError::Fatal("upload created without a Location header".to_string()))?;
        let handle = UploadHandle {
            location: self.url(location),
        };
        tracing::info!(file = %req.file_id, location = %handle.location, "Created TUS upload");
        Ok(handle)
    }

    async fn current_offset(&self, handle: &UploadHandle) -> Result<u64, TransportError> {
        let resp = self
            .tus(self.http.head(&handle.location), false)
            .send()
            .await
            .map_err(classify_request_error)?;
        let resp = expect_status(resp, StatusCode::OK).await?;
        upload_offset(resp.headers())
    }

    async fn send_chunk(
        &self,
        handle: &UploadHandle,
        offset: u64,
        chunk: &[u8],
    ) -> Result<ChunkAck, TransportError> {
        let resp = self
            .tus(self.http.patch(&handle.location), true)
            .header(UPLOAD_OFFSET, offset)
            .header(CONTENT_TYPE, OFFSET_OCTET_STREAM)
            .body(chunk.to_vec())
            .send()
            .await
            .map_err(classify_request_error)?;
        let resp = expect_status(resp, StatusCode::NO_CONTENT).await?;
        let offset = upload_offset(resp.headers())?;
        Ok(ChunkAck { offset })
    }

    async fn terminate(&self, handle: &UploadHandle) -> Result<(), TransportError> {
        let resp = self
            .tus(self.http.delete(&handle.location), true)
            .send()
            .await
            .map_err(classify_request_error)?;
        expect_status(resp, StatusCode::NO_CONTENT).await?;
        tracing::info!(location = %handle.location, "Terminated TUS upload");
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

#[async_trait]
impl ImportApi for OmeroWebClient {
    async fn import(&self, req: &ImportRequest) -> Result<ImportAck, ImportError> {
        let url = self.url(&self.import_path);
        let resp = self
            .authorized(self.http.post(&url), true)
            .json(req)
            .send()
            .await
            .map_err(|e| ImportError::Request(e.to_string()))?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| ImportError::Request(e.to_string()))?;
        if !status.is_success() {
            tracing::error!(status = %status, file = %req.file_id, "Import endpoint rejected request. Response body: {text}");
            return Err(ImportError::Rejected {
                status: status.as_u16(),
                message: error_message(&text),
            });
        }
        serde_json::from_str::<ImportAck>(&text)
            .map_err(|e| ImportError::Request(format!("unreadable import response: {e}")))
    }
}

/// `Upload-Metadata` value: comma separated `key base64(value)` pairs.
pub fn upload_metadata(req: &NewUpload) -> String {
    let engine = base64::engine::general_purpose::STANDARD;
    format!(
        "filename {},filetype {}",
        engine.encode(req.file_id.as_bytes()),
        engine.encode(req.mimetype.as_deref().unwrap_or(DEFAULT_FILETYPE).as_bytes())
    )
}

/// Retryable statuses: server errors, offset conflicts, locks and rate limiting.
pub fn classify_status(status: StatusCode, detail: &str) -> TransportError {
    let message = if detail.is_empty() {
        status.to_string()
    } else {
        format!("{status}: {detail}")
    };
    if status.is_server_error()
        || status == StatusCode::CONFLICT
        || status == StatusCode::LOCKED
        || status == StatusCode::TOO_MANY_REQUESTS
    {
        TransportError::Transient(message)
    } else {
        TransportError::Fatal(message)
    }
}

pub fn resolve_url(base_url: &str, path: &str) -> String {
    if path.starts_with("http://") || path.starts_with("https://") {
        path.to_string()
    } else if path.starts_with('/') {
        format!("{}{}", base_url.trim_end_matches('/'), path)
    } else {
        format!("{}/{}", base_url.trim_end_matches('/'), path)
    }
}

/// The `error` field of a JSON error body, or the body itself.
pub fn error_message(body: &str) -> String {
    serde_json::from_str::<ErrorBody>(body)
        .map(|b| b.error)
        .unwrap_or_else(|_| body.trim().to_string())
}

fn classify_request_error(e: reqwest::Error) -> TransportError {
    if e.is_builder() {
        TransportError::Fatal(e.to_string())
    } else {
        TransportError::Transient(e.to_string())
    }
}

async fn expect_status(resp: Response, expected: StatusCode) -> Result<Response, TransportError> {
    let status = resp.status();
    if status == expected || (expected == StatusCode::OK && status.is_success()) {
        return Ok(resp);
    }
    let text = resp.text().await.unwrap_or_default();
    let err = classify_status(status, &error_message(&text));
    tracing::warn!(status = %status, error = %err, "TUS request returned unexpected status");
    Err(err)
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn upload_offset(headers: &HeaderMap) -> Result<u64, TransportError> {
    header_str(headers, UPLOAD_OFFSET)
        .and_then(|v| v.trim().parse::<u64>().ok())
        .ok_or_else(|| TransportError::Fatal("response carries no valid Upload-Offset".to_string()))
}
