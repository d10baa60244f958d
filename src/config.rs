use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

use crate::contract::TreeFilter;

pub const DEFAULT_CHUNK_SIZE: u64 = 2 * 1024 * 1024;
pub const DEFAULT_RETRY_DELAYS_MS: [u64; 4] = [0, 1000, 3000, 5000];
/// Largest upload the endpoint accepts (`Tus-Max-Size`).
pub const DEFAULT_MAX_UPLOAD_SIZE: u64 = 50 * 1024 * 1024 * 1024;

/// Chunking and retry policy for upload sessions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,
    /// Delay before retry `n`, indexed by consecutive failures. Once exhausted the session fails.
    #[serde(default = "default_retry_delays_ms")]
    pub retry_delays_ms: Vec<u64>,
    #[serde(default = "default_max_upload_size")]
    pub max_upload_size: u64,
}

impl Default for UploadConfig {
    fn default() -> Self {
        UploadConfig {
            chunk_size: DEFAULT_CHUNK_SIZE,
            retry_delays_ms: DEFAULT_RETRY_DELAYS_MS.to_vec(),
            max_upload_size: DEFAULT_MAX_UPLOAD_SIZE,
        }
    }
}

impl UploadConfig {
    pub fn retry_delays(&self) -> Vec<Duration> {
        self.retry_delays_ms
            .iter()
            .map(|ms| Duration::from_millis(*ms))
            .collect()
    }

    pub fn trace_loaded(&self) {
        info!(
            chunk_size = self.chunk_size,
            retries = self.retry_delays_ms.len(),
            max_upload_size = self.max_upload_size,
            "Loaded UploadConfig"
        );
        debug!(?self, "UploadConfig loaded (full debug)");
    }
}

/// Tree browsing options.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrowserConfig {
    /// Format tokens a confirmed file must match. Empty accepts everything.
    #[serde(default)]
    pub accepted_formats: Vec<String>,
    /// Reuse one forest fetch across expansions within this window.
    #[serde(default)]
    pub snapshot_ttl_ms: Option<u64>,
    #[serde(default)]
    pub filter: TreeFilter,
}

impl BrowserConfig {
    pub fn snapshot_ttl(&self) -> Option<Duration> {
        self.snapshot_ttl_ms.map(Duration::from_millis)
    }

    pub fn trace_loaded(&self) {
        info!(
            accepted_formats = ?self.accepted_formats,
            snapshot_ttl_ms = ?self.snapshot_ttl_ms,
            group = self.filter.group.as_deref().unwrap_or("<session default>"),
            "Loaded BrowserConfig"
        );
    }
}

fn default_chunk_size() -> u64 {
    DEFAULT_CHUNK_SIZE
}

fn default_retry_delays_ms() -> Vec<u64> {
    DEFAULT_RETRY_DELAYS_MS.to_vec()
}

fn default_max_upload_size() -> u64 {
    DEFAULT_MAX_UPLOAD_SIZE
}
