//! Runs a batch of upload sessions and the imports that follow them.
//!
//! Sessions run concurrently and share nothing but the transport. Each
//! session that succeeds is handed to the [`ImportTrigger`] exactly once;
//! failed and canceled sessions never are.

use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{info, warn};

use crate::contract::{ImportApi, ResumableTransport};
use crate::error::TransferError;
use crate::import::{ImportOutcome, ImportTrigger};
use crate::notify::{Notice, Notifier};
use crate::upload::{CancelHandle, UploadSession};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TransferOutcome {
    Succeeded { bytes: u64, retry_count: u32 },
    Failed { reason: String, retry_count: u32 },
    Canceled,
}

impl TransferOutcome {
    pub fn is_succeeded(&self) -> bool {
        matches!(self, TransferOutcome::Succeeded { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileReport {
    pub file_id: String,
    pub transfer: TransferOutcome,
    /// `None` unless the transfer succeeded.
    pub import: Option<ImportOutcome>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PipelineReport {
    pub files: Vec<FileReport>,
}

impl PipelineReport {
    pub fn file(&self, file_id: &str) -> Option<&FileReport> {
        self.files.iter().find(|f| f.file_id == file_id)
    }

    pub fn all_transfers_succeeded(&self) -> bool {
        self.files.iter().all(|f| f.transfer.is_succeeded())
    }
}

#[derive(Debug)]
struct Entry {
    token: u64,
    handle: CancelHandle,
}

/// Registry of the sessions currently in flight, keyed by file id.
///
/// A session stays registered until its import attempt, if any, has been
/// reported.
#[derive(Debug, Default)]
pub struct UploadQueue {
    active: Mutex<HashMap<String, Vec<Entry>>>,
    next_token: AtomicU64,
}

impl UploadQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancels every active session for `file_id`. Returns false if there is none.
    pub fn cancel(&self, file_id: &str) -> bool {
        match self.active.lock().get(file_id) {
            Some(entries) if !entries.is_empty() => {
                for entry in entries {
                    entry.handle.cancel();
                }
                info!(file = %file_id, sessions = entries.len(), "[QUEUE] Cancellation requested");
                true
            }
            _ => false,
        }
    }

    pub fn active(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.active.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Runs every session to a terminal state. The report keeps the order of `sessions`.
    pub async fn run<T, A, N>(
        &self,
        sessions: Vec<UploadSession>,
        transport: &T,
        trigger: &ImportTrigger<A, N>,
    ) -> PipelineReport
    where
        T: ResumableTransport + ?Sized,
        A: ImportApi,
        N: Notifier,
    {
        let registered: Vec<(u64, UploadSession)> = {
            let mut active = self.active.lock();
            sessions
                .into_iter()
                .map(|session| {
                    let token = self.next_token.fetch_add(1, Ordering::Relaxed);
                    let entries = active.entry(session.file_id().to_string()).or_default();
                    if !entries.is_empty() {
                        warn!(file = %session.file_id(), "[QUEUE] File id queued twice; cancel applies to every copy");
                    }
                    entries.push(Entry {
                        token,
                        handle: session.cancel_handle(),
                    });
                    (token, session)
                })
                .collect()
        };
        info!(sessions = registered.len(), "[QUEUE] Starting uploads");

        let files = join_all(
            registered
                .into_iter()
                .map(|(token, session)| self.run_one(token, session, transport, trigger)),
        )
        .await;

        let report = PipelineReport { files };
        info!(
            files = report.files.len(),
            succeeded = report.files.iter().filter(|f| f.transfer.is_succeeded()).count(),
            "[QUEUE] All uploads finished"
        );
        report
    }

    async fn run_one<T, A, N>(
        &self,
        token: u64,
        mut session: UploadSession,
        transport: &T,
        trigger: &ImportTrigger<A, N>,
    ) -> FileReport
    where
        T: ResumableTransport + ?Sized,
        A: ImportApi,
        N: Notifier,
    {
        let file_id = session.file_id().to_string();
        let result = session.run(transport).await;

        let transfer = match result {
            Ok(bytes) => TransferOutcome::Succeeded {
                bytes,
                retry_count: session.retry_count(),
            },
            Err(TransferError::Canceled { .. }) => TransferOutcome::Canceled,
            Err(e) => {
                let reason = e.to_string();
                trigger.notifier().notify(&Notice::TransferFailed {
                    file_name: file_id.clone(),
                    reason: reason.clone(),
                });
                TransferOutcome::Failed {
                    reason,
                    retry_count: session.retry_count(),
                }
            }
        };

        let import = if transfer.is_succeeded() {
            Some(trigger.trigger_import(&session.import_request()).await)
        } else {
            None
        };
        self.release(&file_id, token);

        FileReport {
            file_id,
            transfer,
            import,
        }
    }

    fn release(&self, file_id: &str, token: u64) {
        let mut active = self.active.lock();
        if let Some(entries) = active.get_mut(file_id) {
            entries.retain(|entry| entry.token != token);
            if entries.is_empty() {
                active.remove(file_id);
            }
        }
    }
}
