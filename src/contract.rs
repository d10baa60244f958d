#![allow(unused)]

//! # contract: interfaces to the remote collaborators
//!
//! Three remote services are involved and each one is reached only through a
//! trait defined here:
//! - [`TreeService`]: returns the whole project → dataset → file forest per call.
//! - [`ResumableTransport`]: the chunked, resumable upload endpoint.
//! - [`ImportApi`]: queues a backend import of an uploaded file.
//!
//! ## Mocking & Testing
//! - Every trait is annotated for `mockall`, so tests (and downstream crates
//!   with the `test-export-mocks` feature) get `MockTreeService`,
//!   `MockResumableTransport` and `MockImportApi`.
//!
//! ## Type Sources
//! - Request and response types are plain data and carry no transport detail;
//!   the HTTP client in the CLI crate maps them to the wire.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use mockall::{automock, predicate::*};

use crate::error::{ImportError, ServiceError, TransportError};
use crate::node::NodeKind;

/// One record of the remote forest. Projects nest datasets, datasets nest files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRecord {
    pub id: i64,
    #[serde(rename = "type")]
    pub kind: NodeKind,
    pub name: String,
    #[serde(default)]
    pub children: Vec<RemoteRecord>,
    /// Server side child count, when the service reports one.
    #[serde(default, rename = "childCount")]
    pub child_count: Option<usize>,
    #[serde(default)]
    pub mimetype: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub path: Option<String>,
}

/// Ordered sequence of project records.
pub type Forest = Vec<RemoteRecord>;

/// Filter options passed through to the tree service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeFilter {
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub owner: Option<i64>,
}

/// Source of the remote tree. No incremental endpoint: every call returns the full forest.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait TreeService: Send + Sync {
    async fn fetch_tree(&self, filter: &TreeFilter) -> Result<Forest, ServiceError>;
}

/// Everything the endpoint needs to create an upload resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewUpload {
    pub file_id: String,
    pub total_size: u64,
    pub mimetype: Option<String>,
}

/// Identifies one upload resource on the endpoint (the TUS `Location`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UploadHandle {
    pub location: String,
}

/// Acknowledgment of a chunk: the number of bytes the endpoint now holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkAck {
    pub offset: u64,
}

/// Chunked upload endpoint that can resume from any acknowledged offset.
///
/// Implementations classify failures as [`TransportError::Transient`] or
/// [`TransportError::Fatal`]; the upload session owns the retry policy.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait ResumableTransport: Send + Sync {
    /// Create the remote upload resource.
    async fn create(&self, req: &NewUpload) -> Result<UploadHandle, TransportError>;

    /// Ask the endpoint how many bytes of the resource it holds.
    async fn current_offset(&self, handle: &UploadHandle) -> Result<u64, TransportError>;

    /// Send `chunk`, which starts at byte `offset` of the file.
    async fn send_chunk(
        &self,
        handle: &UploadHandle,
        offset: u64,
        chunk: &[u8],
    ) -> Result<ChunkAck, TransportError>;

    /// Discard the remote resource.
    async fn terminate(&self, handle: &UploadHandle) -> Result<(), TransportError>;
}

/// Kind of OMERO container an upload is imported into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DatasetType {
    Dataset,
    Project,
    Screen,
}

impl std::str::FromStr for DatasetType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Dataset" | "dataset" | "datasets" => Ok(DatasetType::Dataset),
            "Project" | "project" | "projects" => Ok(DatasetType::Project),
            "Screen" | "screen" | "screens" => Ok(DatasetType::Screen),
            other => Err(format!("unknown dataset type '{other}'")),
        }
    }
}

/// Body of an import request for one uploaded file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportRequest {
    #[serde(rename = "filename")]
    pub file_id: String,
    #[serde(rename = "datasetId")]
    pub dataset_id: i64,
    #[serde(rename = "datasetType")]
    pub dataset_type: DatasetType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
}

/// What the import endpoint returns once the job is queued.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportAck {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default, rename = "jobId")]
    pub job_id: Option<String>,
}

/// Backend import queue.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait ImportApi: Send + Sync {
    async fn import(&self, req: &ImportRequest) -> Result<ImportAck, ImportError>;
}
