//! Queue-driven PDF ingestion.
//!
//! Uploaded PDFs are split into per-page PDF, image and markdown artifacts by
//! the upload consumer; indexing jobs over the resulting ingestion container
//! are driven through an external indexer and a graph-processing stage by the
//! job orchestrator. Both consumers run on [`pipeline::QueueWorker`].

pub mod captioning;
pub mod config;
pub mod containers;
pub mod db;
pub mod error;
pub mod graph;
pub mod http;
pub mod indexing;
pub mod messages;
pub mod pipeline;
pub mod policy;
pub mod queue;
pub mod render;
pub mod retry;
pub mod status;
pub mod storage;
