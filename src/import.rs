//! Requests a backend import once a transfer has completed.
//!
//! The trigger makes exactly one attempt per call and never touches the
//! transfer that preceded it: a failed import leaves the uploaded bytes in place.

use serde::Serialize;
use tracing::{error, info};

use crate::contract::{ImportAck, ImportApi, ImportRequest};
use crate::notify::{Notice, Notifier};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ImportOutcome {
    Queued { file_id: String, ack: ImportAck },
    Failed { file_id: String, reason: String },
}

impl ImportOutcome {
    pub fn is_queued(&self) -> bool {
        matches!(self, ImportOutcome::Queued { .. })
    }
}

pub struct ImportTrigger<A, N> {
    api: A,
    notifier: N,
}

impl<A, N> ImportTrigger<A, N>
where
    A: ImportApi,
    N: Notifier,
{
    pub fn new(api: A, notifier: N) -> Self {
        ImportTrigger { api, notifier }
    }

    pub fn notifier(&self) -> &N {
        &self.notifier
    }

    pub async fn trigger_import(&self, request: &ImportRequest) -> ImportOutcome {
        info!(
            file = %request.file_id,
            dataset_id = request.dataset_id,
            dataset_type = ?request.dataset_type,
            group = request.group.as_deref().unwrap_or("<session default>"),
            "[IMPORT] Requesting import"
        );
        match self.api.import(request).await {
            Ok(ack) => {
                info!(file = %request.file_id, job_id = ?ack.job_id, "[IMPORT] Import queued");
                self.notifier.notify(&Notice::ImportQueued {
                    file_name: request.file_id.clone(),
                });
                ImportOutcome::Queued {
                    file_id: request.file_id.clone(),
                    ack,
                }
            }
            Err(e) => {
                let reason = e.to_string();
                error!(file = %request.file_id, error = %reason, "[IMPORT][ERROR] Import request failed");
                self.notifier.notify(&Notice::ImportFailed {
                    file_name: request.file_id.clone(),
                    reason: reason.clone(),
                });
                ImportOutcome::Failed {
                    file_id: request.file_id.clone(),
                    reason,
                }
            }
        }
    }
}
