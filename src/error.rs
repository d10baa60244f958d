//! Error kinds shared across the browsing and transfer subsystems.
//!
//! Remote contracts without retry semantics return [`ServiceError`]; everything
//! the crate itself decides on has a dedicated enum here.

use thiserror::Error;

/// Boxed error returned by remote collaborators (tree service, import API).
pub type ServiceError = Box<dyn std::error::Error + Send + Sync>;

/// Failure to interpret a [`crate::node::NodeAddress`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    #[error("address '{0}' is synthetic and carries no remote identity")]
    Synthetic(String),
    #[error("malformed node address '{0}'")]
    Malformed(String),
}

/// Internal invariant breaches on the tree store. Not user recoverable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    #[error("precondition violation: {0}")]
    PreconditionViolation(String),
}

#[derive(Debug, Error)]
pub enum ExpansionError {
    /// The remote tree could not be fetched, or what came back does not describe the node.
    #[error("fetching children of '{address}' failed: {reason}")]
    FetchFailed { address: String, reason: String },
    #[error(transparent)]
    Address(#[from] AddressError),
    #[error(transparent)]
    Cache(#[from] CacheError),
}

/// Outcome of one call against the resumable transfer endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Connection reset, timeout, 5xx, offset conflict: worth retrying.
    #[error("transient transport error: {0}")]
    Transient(String),
    /// Rejected request or protocol violation: retrying cannot help.
    #[error("transport error: {0}")]
    Fatal(String),
}

impl TransportError {
    pub fn is_transient(&self) -> bool {
        matches!(self, TransportError::Transient(_))
    }
}

/// Terminal failure of one upload session.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("transfer of '{file_id}' failed: {reason}")]
    Failed { file_id: String, reason: String },
    #[error("transfer of '{file_id}' was canceled")]
    Canceled { file_id: String },
    #[error("upload session for '{file_id}' already finished")]
    AlreadyFinished { file_id: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SelectionError {
    #[error("no file selected")]
    NoSelection,
    #[error("invalid selection: {0}")]
    InvalidSelection(String),
}

impl SelectionError {
    /// Text shown to the user when a confirm is rejected.
    pub fn reason(&self) -> String {
        match self {
            SelectionError::NoSelection => "Please select a file".to_string(),
            SelectionError::InvalidSelection(why) => why.clone(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ImportError {
    /// The import endpoint answered but refused the request.
    #[error("import rejected ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("import request failed: {0}")]
    Request(String),
}
