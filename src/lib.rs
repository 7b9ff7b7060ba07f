//! mediagraph - storage, provenance, query and compaction core for
//! multimodal media search
//!
//! This crate provides:
//! - A tagged schema registry for media entities and their sub-tables
//! - A columnar (Parquet) writer with per-run manifests in object storage
//! - Snapshot building with HNSW indexes over a read-only SQLite image
//! - Semantic, keyword, hybrid and metadata queries against a snapshot
//! - Manifest-driven compaction with audit records
//! - An idempotency guard and an ingestion batcher

pub mod batcher;
pub mod commands;
pub mod compaction;
pub mod config;
pub mod embed;
pub mod embedding_backend;
pub mod error;
pub mod guard;
pub mod manifest;
pub mod progress;
pub mod query;
pub mod registry;
pub mod snapshot;
pub mod storage;
pub mod table;
pub mod writer;

#[cfg(test)]
pub(crate) mod fixtures;

pub use config::Config;
pub use error::{Error, Result};
