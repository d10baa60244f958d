//! CLI glue for biomero-importer: command parsing, wiring of the HTTP client
//! into the core components, and user-visible output.
//!
//! All browsing and transfer logic lives in `biomero-importer-core`; this
//! module only loads config, builds an [`OmeroWebClient`] and prints results.
//!
//! For programmatic or integration use, call [`run`] with a constructed [`Cli`].
use crate::client::OmeroWebClient;
use crate::load_config::load_config;
use anyhow::{anyhow, Context, Result};
use biomero_importer_core::contract::DatasetType;
use biomero_importer_core::expansion::ExpansionLoader;
use biomero_importer_core::import::ImportTrigger;
use biomero_importer_core::node::{NodeAddress, NodeBody};
use biomero_importer_core::notify::{Notice, Notifier, TracingNotifier};
use biomero_importer_core::pipeline::UploadQueue;
use biomero_importer_core::selection::{FormatFilter, SelectionManager};
use biomero_importer_core::tree_cache::TreeCache;
use biomero_importer_core::upload::{ImportTarget, UploadSession};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

/// Browse an OMERO server's projects and upload files for BIOMERO import.
#[derive(Parser)]
#[clap(
    name = "biomero-importer",
    version,
    about = "Browse OMERO project/dataset trees and upload files for BIOMERO import"
)]
pub struct Cli {
    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Expand the tree and optionally confirm one file from it
    Browse {
        /// Path to the YAML config file
        #[clap(long)]
        config: PathBuf,
        /// Node address to expand after the root, e.g. `project-1`. Repeatable, applied in order.
        #[clap(long)]
        expand: Vec<String>,
        /// File address to select and confirm, e.g. `file-100`
        #[clap(long)]
        select: Option<String>,
    },
    /// Upload files and queue an import of each into a dataset
    Upload {
        /// Path to the YAML config file
        #[clap(long)]
        config: PathBuf,
        #[clap(long)]
        dataset_id: i64,
        /// Dataset, Project or Screen
        #[clap(long, default_value = "Dataset")]
        dataset_type: DatasetType,
        /// OMERO group to import into; defaults to the session's current group
        #[clap(long)]
        group: Option<String>,
        #[clap(required = true)]
        files: Vec<PathBuf>,
    },
}

/// Extracted async CLI logic entrypoint for integration tests and main()
pub async fn run(cli: Cli) -> Result<()> {
    // Emit a top-level 'trace_initialised' event at the very start
    tracing::info!("trace_initialised");

    match cli.command {
        Commands::Browse {
            config,
            expand,
            select,
        } => browse(config, expand, select).await,
        Commands::Upload {
            config,
            dataset_id,
            dataset_type,
            group,
            files,
        } => {
            let target = ImportTarget {
                dataset_id,
                dataset_type,
                group,
            };
            upload(config, target, files).await
        }
    }
}

async fn browse(config: PathBuf, expand: Vec<String>, select: Option<String>) -> Result<()> {
    let config = load_config(config)?;
    tracing::info!(command = "browse", "Starting tree browse");
    let client = OmeroWebClient::new(&config.server, config.secrets.clone())
        .context("Failed to construct OMERO.web client")?;

    let cache = Arc::new(TreeCache::new());
    let loader = ExpansionLoader::new(client, cache.clone())
        .with_filter(config.browser.filter.clone())
        .with_snapshot_ttl(config.browser.snapshot_ttl());

    let root = NodeAddress::root();
    loader.expand(&root).await?;
    for address in expand {
        let address = NodeAddress::from(address);
        loader
            .expand(&address)
            .await
            .with_context(|| format!("Expanding {address} failed"))?;
    }

    for (depth, node) in cache.walk(&root).into_iter().skip(1) {
        let indent = "  ".repeat(depth - 1);
        match &node.body {
            NodeBody::File(payload) => println!(
                "{indent}{} [{}] {}",
                node.label,
                node.address,
                payload.size.map(|s| format!("{s} bytes")).unwrap_or_default()
            ),
            _ => println!(
                "{indent}{}/ [{}] ({} children)",
                node.label, node.address, node.child_count
            ),
        }
    }

    if let Some(address) = select {
        let mut selection = SelectionManager::new(
            cache.clone(),
            FormatFilter::new(&config.browser.accepted_formats),
        );
        selection.toggle(&NodeAddress::from(address));
        match selection.confirm() {
            Ok(payload) => println!("{}", serde_json::to_string_pretty(&payload)?),
            Err(e) => {
                let reason = e.reason();
                TracingNotifier.notify(&Notice::SelectionRejected {
                    reason: reason.clone(),
                });
                return Err(anyhow!("Selection rejected: {reason}"));
            }
        }
    }
    Ok(())
}

async fn upload(config: PathBuf, target: ImportTarget, files: Vec<PathBuf>) -> Result<()> {
    let config = load_config(config)?;
    tracing::info!(command = "upload", files = files.len(), "Starting uploads");
    let client = OmeroWebClient::new(&config.server, config.secrets.clone())
        .context("Failed to construct OMERO.web client")?;

    let mut sessions = Vec::with_capacity(files.len());
    for path in &files {
        let session = UploadSession::from_path(path, target.clone(), config.upload.clone())
            .await
            .with_context(|| format!("Cannot read {}", path.display()))?;
        let mut progress = session.subscribe();
        let file_id = session.file_id().to_string();
        tokio::spawn(async move {
            // Ends once the session is dropped.
            while progress.changed().await.is_ok() {
                let p = *progress.borrow();
                tracing::info!(
                    file = %file_id,
                    state = ?p.state,
                    offset = p.offset,
                    total = p.total_size,
                    retries = p.retry_count,
                    "Upload progress"
                );
            }
        });
        sessions.push(session);
    }

    let trigger = ImportTrigger::new(client.clone(), TracingNotifier);
    let report = UploadQueue::new().run(sessions, &client, &trigger).await;
    println!("{}", serde_json::to_string_pretty(&report)?);

    if report.all_transfers_succeeded() {
        tracing::info!(command = "upload", "All transfers succeeded");
        Ok(())
    } else {
        Err(anyhow!("One or more transfers did not succeed"))
    }
}
