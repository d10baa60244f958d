//! User-facing outcome reporting.
//!
//! How a notice is presented (toast, dialog, terminal line) is up to the
//! implementor; the core only decides *what* is reported and when.

use mockall::automock;
use serde::Serialize;
use tracing::{error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "notice", rename_all = "snake_case")]
pub enum Notice {
    ImportQueued { file_name: String },
    ImportFailed { file_name: String, reason: String },
    SelectionRejected { reason: String },
    TransferFailed { file_name: String, reason: String },
}

#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
pub trait Notifier: Send + Sync {
    fn notify(&self, notice: &Notice);
}

/// Reports every notice as a tracing event.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, notice: &Notice) {
        match notice {
            Notice::ImportQueued { file_name } => {
                info!(file = %file_name, "[NOTICE] Import queued")
            }
            Notice::ImportFailed { file_name, reason } => {
                error!(file = %file_name, reason = %reason, "[NOTICE] Import failed")
            }
            Notice::SelectionRejected { reason } => {
                warn!(reason = %reason, "[NOTICE] Selection rejected")
            }
            Notice::TransferFailed { file_name, reason } => {
                error!(file = %file_name, reason = %reason, "[NOTICE] Transfer failed")
            }
        }
    }
}
