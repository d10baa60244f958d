//! Node identity and node records for the cached tree.
//!
//! Every node is addressed as `{kind}-{remoteId}` (e.g. `dataset-10`). The
//! kind prefix keeps a project and a dataset with the same numeric id apart.
//! The synthetic address `root` is the unloaded entry point of the tree.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::AddressError;

const ROOT: &str = "root";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Project,
    Dataset,
    File,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Project => "project",
            NodeKind::Dataset => "dataset",
            NodeKind::File => "file",
        }
    }

    /// Projects and datasets hold children; files are leaves.
    pub fn is_folder(&self) -> bool {
        !matches!(self, NodeKind::File)
    }

    /// The kind a well-formed child of this kind must have.
    pub fn child_kind(&self) -> Option<NodeKind> {
        match self {
            NodeKind::Project => Some(NodeKind::Dataset),
            NodeKind::Dataset => Some(NodeKind::File),
            NodeKind::File => None,
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeKind {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "project" => Ok(NodeKind::Project),
            "dataset" => Ok(NodeKind::Dataset),
            "file" => Ok(NodeKind::File),
            other => Err(AddressError::Malformed(other.to_string())),
        }
    }
}

/// Opaque key of a node in the [`crate::tree_cache::TreeCache`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeAddress(String);

impl NodeAddress {
    pub fn root() -> Self {
        NodeAddress(ROOT.to_string())
    }

    pub fn is_root(&self) -> bool {
        self.0 == ROOT
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeAddress {
    fn from(s: &str) -> Self {
        NodeAddress(s.to_string())
    }
}

impl From<String> for NodeAddress {
    fn from(s: String) -> Self {
        NodeAddress(s)
    }
}

/// Builds the canonical address of a remote entity.
pub fn address(kind: NodeKind, remote_id: i64) -> NodeAddress {
    NodeAddress(format!("{}-{}", kind.as_str(), remote_id))
}

/// Inverse of [`address`].
pub fn parse(address: &NodeAddress) -> Result<(NodeKind, i64), AddressError> {
    if address.is_root() {
        return Err(AddressError::Synthetic(address.0.clone()));
    }
    let malformed = || AddressError::Malformed(address.0.clone());
    let (prefix, id) = address.0.split_once('-').ok_or_else(malformed)?;
    let kind = prefix.parse::<NodeKind>().map_err(|_| malformed())?;
    // split_once cuts at the first '-', so a negative id keeps its sign here.
    let remote_id = id.parse::<i64>().map_err(|_| malformed())?;
    // One spelling per entity: "project-007" and "project-+5" are rejected.
    if remote_id.to_string() != id {
        return Err(malformed());
    }
    Ok((kind, remote_id))
}

/// Attributes of a file leaf, handed back to the caller on confirm.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilePayload {
    pub remote_id: i64,
    pub name: String,
    pub mimetype: Option<String>,
    pub size: Option<u64>,
    pub path: Option<String>,
}

/// What a node is. Only files carry a payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum NodeBody {
    Root,
    Project,
    Dataset,
    File(FilePayload),
}

/// Tag of the collaborator that produced a node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeSource(pub String);

impl NodeSource {
    pub fn omero() -> Self {
        NodeSource("omero".to_string())
    }
}

impl Default for NodeSource {
    fn default() -> Self {
        NodeSource::omero()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub address: NodeAddress,
    pub label: String,
    pub body: NodeBody,
    /// Empty until the node has been expanded. Server order.
    pub child_addresses: Vec<NodeAddress>,
    /// Hint usable before expansion; may be stale.
    pub child_count: usize,
    pub source: NodeSource,
}

impl Node {
    /// Placeholder for the unloaded tree entry point.
    pub fn root() -> Self {
        Node {
            address: NodeAddress::root(),
            label: "root".to_string(),
            body: NodeBody::Root,
            child_addresses: Vec::new(),
            child_count: 0,
            source: NodeSource::default(),
        }
    }

    pub fn project(remote_id: i64, label: impl Into<String>, source: NodeSource) -> Self {
        Self::folder(NodeKind::Project, NodeBody::Project, remote_id, label.into(), source)
    }

    pub fn dataset(remote_id: i64, label: impl Into<String>, source: NodeSource) -> Self {
        Self::folder(NodeKind::Dataset, NodeBody::Dataset, remote_id, label.into(), source)
    }

    fn folder(kind: NodeKind, body: NodeBody, remote_id: i64, label: String, source: NodeSource) -> Self {
        Node {
            address: address(kind, remote_id),
            label,
            body,
            child_addresses: Vec::new(),
            child_count: 0,
            source,
        }
    }

    pub fn file(payload: FilePayload, source: NodeSource) -> Self {
        Node {
            address: address(NodeKind::File, payload.remote_id),
            label: payload.name.clone(),
            body: NodeBody::File(payload),
            child_addresses: Vec::new(),
            child_count: 0,
            source,
        }
    }

    pub fn with_child_count(mut self, count: usize) -> Self {
        self.child_count = count;
        self
    }

    /// `None` for the synthetic root.
    pub fn kind(&self) -> Option<NodeKind> {
        match self.body {
            NodeBody::Root => None,
            NodeBody::Project => Some(NodeKind::Project),
            NodeBody::Dataset => Some(NodeKind::Dataset),
            NodeBody::File(_) => Some(NodeKind::File),
        }
    }

    pub fn is_folder(&self) -> bool {
        !matches!(self.body, NodeBody::File(_))
    }

    pub fn payload(&self) -> Option<&FilePayload> {
        match &self.body {
            NodeBody::File(payload) => Some(payload),
            _ => None,
        }
    }
}
