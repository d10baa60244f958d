#![doc = "biomero-importer-core: lazy OMERO tree browsing and resumable upload + import pipeline."]

//! This crate holds all logic that does not depend on a concrete transport:
//! the lazily materialized project/dataset/file tree, single-file selection,
//! the resumable chunked upload state machine and the import trigger that
//! follows a finished upload.
//!
//! Remote collaborators are reached only through the async traits in
//! [`contract`]; the CLI crate supplies the HTTP implementation and tests
//! supply `mockall` mocks.
//!
//! # Navigation
//! - Addressing: [`node`]
//! - Store: [`tree_cache`]
//! - On-demand fetching: [`expansion`]
//! - Picking one file: [`selection`]
//! - Transfers: [`upload`], [`import`], [`pipeline`]

pub mod config;
pub mod contract;
pub mod error;
pub mod expansion;
pub mod import;
pub mod node;
pub mod notify;
pub mod pipeline;
pub mod selection;
pub mod tree_cache;
pub mod upload;
