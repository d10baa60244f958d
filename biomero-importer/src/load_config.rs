//! `load_config`: reads the static YAML config and injects the OMERO session secrets.
//!
//! The YAML file never holds credentials. The session key is taken from
//! `OMERO_SESSION_KEY` (required) and the CSRF token from `OMERO_CSRF_TOKEN`
//! (optional). `.env` files are honoured through `dotenvy`.
//!
//! # Errors
//! All errors use `anyhow::Error` and are surfaced at the CLI boundary.
use anyhow::{anyhow, Result};
use biomero_importer_core::config::{BrowserConfig, UploadConfig};
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::{error, info};

pub const SESSION_KEY_ENV: &str = "OMERO_SESSION_KEY";
pub const CSRF_TOKEN_ENV: &str = "OMERO_CSRF_TOKEN";

/// Where OMERO.web and the plugin endpoints live.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    pub base_url: String,
    #[serde(default = "default_tree_path")]
    pub tree_path: String,
    #[serde(default = "default_upload_path")]
    pub upload_path: String,
    #[serde(default = "default_import_path")]
    pub import_path: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl ServerSection {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// OMERO.web session credentials, taken from the environment only.
#[derive(Clone)]
pub struct SessionSecrets {
    pub session_key: String,
    pub csrf_token: Option<String>,
}

impl std::fmt::Debug for SessionSecrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionSecrets")
            .field("session_key", &"<redacted>")
            .field("csrf_token", &self.csrf_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct CliConfig {
    pub server: ServerSection,
    pub upload: UploadConfig,
    pub browser: BrowserConfig,
    pub secrets: SessionSecrets,
}

/// Loads a static YAML config file (no secrets) and injects the session secrets from the environment.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<CliConfig> {
    let path_ref = path.as_ref();
    info!(config_path = ?path_ref, "Loading configuration from file");

    let config_content = match fs::read_to_string(path_ref) {
        Ok(content) => content,
        Err(e) => {
            error!(error = ?e, config_path = ?path_ref, "Failed to read config file");
            return Err(anyhow!("Failed to read config file {:?}: {}", path_ref, e));
        }
    };

    #[derive(Debug, Deserialize)]
    struct RawConfig {
        server: ServerSection,
        #[serde(default)]
        upload: UploadConfig,
        #[serde(default)]
        browser: BrowserConfig,
    }

    let raw: RawConfig = match serde_yaml::from_str(&config_content) {
        Ok(conf) => {
            info!(config_path = ?path_ref, "Parsed config YAML successfully");
            conf
        }
        Err(e) => {
            error!(error = ?e, config_path = ?path_ref, "Failed to parse config YAML");
            return Err(anyhow!("Failed to parse config YAML: {e}"));
        }
    };

    if raw.upload.chunk_size == 0 {
        return Err(anyhow!("upload.chunk_size must be greater than zero"));
    }

    dotenvy::dotenv().ok();
    let session_key = match std::env::var(SESSION_KEY_ENV) {
        Ok(key) if !key.trim().is_empty() => key,
        _ => {
            error!(env = SESSION_KEY_ENV, "Session key missing in environment");
            return Err(anyhow!("{SESSION_KEY_ENV} must be set to an OMERO.web session key"));
        }
    };
    let csrf_token = std::env::var(CSRF_TOKEN_ENV).ok().filter(|t| !t.is_empty());

    info!(
        base_url = %raw.server.base_url,
        csrf_token_set = csrf_token.is_some(),
        "Injected session secrets from environment"
    );
    raw.upload.trace_loaded();
    raw.browser.trace_loaded();

    Ok(CliConfig {
        server: raw.server,
        upload: raw.upload,
        browser: raw.browser,
        secrets: SessionSecrets {
            session_key,
            csrf_token,
        },
    })
}

fn default_tree_path() -> String {
    "/omero_biomero/api/importer/omero_tree/".to_string()
}

fn default_upload_path() -> String {
    "/omero_biomero/upload/".to_string()
}

fn default_import_path() -> String {
    "/omero_biomero/api/importer/import_uploaded_file/".to_string()
}

fn default_timeout_secs() -> u64 {
    60
}
