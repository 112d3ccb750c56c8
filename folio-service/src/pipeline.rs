//! The two queue consumers and the client-side enqueue API.
//!
//! Upload path: `IngestionClient::queue_file_for_processing` → upload queue →
//! `QueueWorker<UploadConsumer>` → `PageProcessor`.
//!
//! Indexing path: `IngestionClient::queue_indexing_job` → indexing queue →
//! `QueueWorker<JobOrchestrator>`.

mod client;
mod orchestrator;
mod page_processor;
mod upload;
mod worker;

pub use client::{IngestionClient, JobStatusReport, UploadRequest};
pub use orchestrator::{JobOrchestrator, OrchestratorSettings};
pub use page_processor::{PageProcessor, ProcessingSummary};
pub use upload::UploadConsumer;
pub use worker::{BatchReport, MessageHandler, QueueWorker};

use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Sleep for `duration` unless cancelled first. Returns false on cancellation.
pub(crate) async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> bool {
    if duration.is_zero() {
        return !cancel.is_cancelled();
    }
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}
