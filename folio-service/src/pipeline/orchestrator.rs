//! Indexing queue handler: drives one job from submission to cleanup.
//!
//! ```text
//! queued → ingestion_started → graphrag_started → graphrag_completed → completed | failed
//! ```
//!
//! A redelivered message resumes from the first step its status row has not
//! recorded as done. Every step is safe to repeat. A message past the retry
//! limit marks its job `failed` before it is dropped.

use async_trait::async_trait;
use metrics::counter;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::sleep_or_cancel;
use super::worker::MessageHandler;
use crate::config::{IndexingConfig, QueueConfig, RetryConfig};
use crate::containers::ContainerNames;
use crate::error::{QueueError, ServiceError, ServiceResult, format_error_chain};
use crate::graph::{GraphBuilder, GraphIndexConfig};
use crate::indexing::IndexingService;
use crate::messages::IndexingJobMessage;
use crate::policy::HandlerOutcome;
use crate::queue::{LeasedMessage, WorkQueue};
use crate::retry::{BackoffPolicy, with_backoff};
use crate::status::{JobStatus, ProbeStatus, StatusStore};

const MIN_RENEW_INTERVAL: Duration = Duration::from_secs(1);

/// Timing knobs for the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrchestratorSettings {
    /// Pause between indexer status probes.
    pub poll_interval: Duration,
    /// How long a terminal status row is kept for late readers.
    pub cleanup_grace: Duration,
    /// Upper bound on probing before the job is declared failed.
    pub job_timeout: Duration,
    /// Lease length requested on each renewal.
    pub visibility_timeout: Duration,
    pub backoff: BackoffPolicy,
}

impl OrchestratorSettings {
    pub fn from_config(indexing: &IndexingConfig, queue: &QueueConfig, retry: &RetryConfig) -> Self {
        Self {
            poll_interval: indexing.status_poll_interval(),
            cleanup_grace: indexing.cleanup_grace(),
            job_timeout: indexing.job_timeout(),
            visibility_timeout: queue.visibility_timeout(),
            backoff: BackoffPolicy::from(retry),
        }
    }

    fn renew_interval(&self) -> Duration {
        (self.visibility_timeout / 2).max(MIN_RENEW_INTERVAL)
    }
}

/// How far one delivery got.
enum JobRun {
    /// Terminal status reached and the row cleaned up.
    Finished(JobStatus),
    /// Shutdown arrived first; the message should be redelivered.
    Interrupted,
}

pub struct JobOrchestrator {
    status: Arc<dyn StatusStore>,
    indexer: Arc<dyn IndexingService>,
    graph: Arc<dyn GraphBuilder>,
    queue: Arc<dyn WorkQueue>,
    settings: OrchestratorSettings,
}

impl JobOrchestrator {
    /// `queue` must be the queue this orchestrator consumes; it is used to
    /// keep the lease alive while a job runs.
    pub fn new(
        status: Arc<dyn StatusStore>,
        indexer: Arc<dyn IndexingService>,
        graph: Arc<dyn GraphBuilder>,
        queue: Arc<dyn WorkQueue>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            status,
            indexer,
            graph,
            queue,
            settings,
        }
    }

    async fn drive(
        &self,
        job: &IndexingJobMessage,
        cancel: &CancellationToken,
    ) -> ServiceResult<JobRun> {
        let job_id = job.job_id.as_str();

        let current = match self.status.get(job_id)? {
            Some(status) => status,
            None => {
                warn!(job_id = %job_id, "No status row for job, starting from queued");
                self.status.create(job_id)?;
                JobStatus::Queued
            }
        };

        let terminal = if current.is_terminal() {
            info!(job_id = %job_id, status = %current, "Job already terminal, only cleanup left");
            current
        } else {
            match self.advance(job, current, cancel).await {
                Ok(Some(status)) => status,
                Ok(None) => return Ok(JobRun::Interrupted),
                Err(e) => {
                    error!(
                        job_id = %job_id,
                        error = %format_error_chain(&e),
                        "Indexing job failed"
                    );
                    self.status.transition(job_id, JobStatus::Failed)?;
                    JobStatus::Failed
                }
            }
        };

        if !self.clean_up(job_id, terminal, cancel).await? {
            return Ok(JobRun::Interrupted);
        }
        Ok(JobRun::Finished(terminal))
    }

    /// Keep a terminal row for the grace period, then delete it. `Ok(false)`
    /// means shutdown arrived first and the row is still there.
    async fn clean_up(
        &self,
        job_id: &str,
        terminal: JobStatus,
        cancel: &CancellationToken,
    ) -> ServiceResult<bool> {
        info!(
            job_id = %job_id,
            status = %terminal,
            grace_secs = self.settings.cleanup_grace.as_secs(),
            "Job finished, keeping status for grace period"
        );
        if !sleep_or_cancel(self.settings.cleanup_grace, cancel).await {
            return Ok(false);
        }

        self.status.delete(job_id)?;
        counter!("folio_jobs_finished_total", "status" => terminal.as_str()).increment(1);
        debug!(job_id = %job_id, "Deleted status row");
        Ok(true)
    }

    /// Settle the row of a job whose message is past the retry limit: a live
    /// row becomes `failed`, then cleanup runs as for any finished job.
    async fn abandon(&self, job_id: &str, cancel: &CancellationToken) -> ServiceResult<bool> {
        let terminal = match self.status.get(job_id)? {
            None => return Ok(true),
            Some(status) if status.is_terminal() => status,
            Some(status) => {
                self.status.transition(job_id, JobStatus::Failed)?;
                error!(
                    job_id = %job_id,
                    last_status = %status,
                    "Indexing job exhausted its deliveries, marked failed"
                );
                JobStatus::Failed
            }
        };
        self.clean_up(job_id, terminal, cancel).await
    }

    /// Run the remaining steps from `current`. `Ok(None)` means cancelled.
    async fn advance(
        &self,
        job: &IndexingJobMessage,
        current: JobStatus,
        cancel: &CancellationToken,
    ) -> ServiceResult<Option<JobStatus>> {
        let job_id = job.job_id.as_str();

        if matches!(current, JobStatus::Queued | JobStatus::IngestionStarted) {
            self.status.transition(job_id, JobStatus::IngestionStarted)?;
            self.submit(job).await?;
            self.status.transition(job_id, JobStatus::GraphragStarted)?;
        }

        if current != JobStatus::GraphragCompleted {
            tokio::select! {
                result = self.build_graph(job) => result?,
                _ = cancel.cancelled() => return Ok(None),
            }
            self.status.transition(job_id, JobStatus::GraphragCompleted)?;
        }

        self.await_indexer(job_id, cancel).await
    }

    async fn submit(&self, job: &IndexingJobMessage) -> ServiceResult<()> {
        let indexer = &self.indexer;
        let container = job.container_name.as_str();

        let submission = with_backoff(&self.settings.backoff, "indexing job submission", move || {
            indexer.submit(container)
        })
        .await?;

        info!(
            job_id = %submission.job_id,
            message = %submission.message,
            "Submitted indexing job"
        );
        Ok(())
    }

    async fn build_graph(&self, job: &IndexingJobMessage) -> ServiceResult<()> {
        let names = ContainerNames::derive(&job.user_id, &job.index_name, job.is_restricted)?;
        let config = GraphIndexConfig::for_index(&names, &job.index_name);

        info!(
            job_id = %job.job_id,
            input = %config.input_container,
            storage = %config.storage_container,
            "Starting graph build"
        );
        self.graph.build(&config).await
    }

    /// Probe until the indexer reports a terminal status, then record it.
    async fn await_indexer(
        &self,
        job_id: &str,
        cancel: &CancellationToken,
    ) -> ServiceResult<Option<JobStatus>> {
        let started = Instant::now();

        loop {
            match self.indexer.probe(job_id).await {
                ProbeStatus::Completed => {
                    self.status.transition(job_id, JobStatus::Completed)?;
                    return Ok(Some(JobStatus::Completed));
                }
                ProbeStatus::Failed => {
                    warn!(job_id = %job_id, "Indexer reported the job as failed");
                    self.status.transition(job_id, JobStatus::Failed)?;
                    return Ok(Some(JobStatus::Failed));
                }
                ProbeStatus::InProgress => debug!(job_id = %job_id, "Indexing still in progress"),
                ProbeStatus::Error => {
                    warn!(job_id = %job_id, "Could not determine indexer status, polling again")
                }
            }

            if started.elapsed() >= self.settings.job_timeout {
                return Err(ServiceError::JobTimedOut {
                    job_id: job_id.to_string(),
                    timeout: self.settings.job_timeout,
                });
            }
            if !sleep_or_cancel(self.settings.poll_interval, cancel).await {
                return Ok(None);
            }
        }
    }

    /// Renew the lease until it is lost. Only returns with the loss.
    async fn keep_lease(&self, message: &LeasedMessage) -> ServiceError {
        let interval = self.settings.renew_interval();
        loop {
            tokio::time::sleep(interval).await;
            match self
                .queue
                .renew_lease(message, self.settings.visibility_timeout)
            {
                Ok(()) => debug!(message_id = %message.id, "Renewed lease"),
                Err(e @ ServiceError::Queue(QueueError::LeaseLost { .. })) => return e,
                Err(e) => warn!(
                    message_id = %message.id,
                    error = %format_error_chain(&e),
                    "Failed to renew lease"
                ),
            }
        }
    }
}

#[async_trait]
impl MessageHandler for JobOrchestrator {
    async fn handle(&self, message: &LeasedMessage, cancel: &CancellationToken) -> HandlerOutcome {
        let job = match IndexingJobMessage::decode(&message.body) {
            Ok(job) => job,
            Err(e) => {
                error!(
                    message_id = %message.id,
                    error = %format_error_chain(&e),
                    "Malformed indexing message"
                );
                return HandlerOutcome::RetryableFailure {
                    reason: e.to_string(),
                };
            }
        };

        info!(
            job_id = %job.job_id,
            index = %job.index_name,
            attempt = message.delivery_count,
            "Processing indexing job"
        );

        let run = tokio::select! {
            run = self.drive(&job, cancel) => run,
            lost = self.keep_lease(message) => Err(lost),
        };

        match run {
            Ok(JobRun::Finished(status)) => {
                info!(job_id = %job.job_id, status = %status, "Indexing job done");
                HandlerOutcome::Success
            }
            Ok(JobRun::Interrupted) => {
                info!(job_id = %job.job_id, "Indexing job interrupted, leaving for redelivery");
                HandlerOutcome::RetryableFailure {
                    reason: "interrupted by shutdown".to_string(),
                }
            }
            Err(e) => {
                error!(
                    job_id = %job.job_id,
                    error = %format_error_chain(&e),
                    "Error driving indexing job"
                );
                HandlerOutcome::RetryableFailure {
                    reason: e.to_string(),
                }
            }
        }
    }

    async fn on_poison(&self, message: &LeasedMessage, cancel: &CancellationToken) -> HandlerOutcome {
        // Nothing to settle for a body that never decoded
        let Ok(job) = IndexingJobMessage::decode(&message.body) else {
            return HandlerOutcome::PoisonDrop;
        };

        let settled = tokio::select! {
            settled = self.abandon(&job.job_id, cancel) => settled,
            lost = self.keep_lease(message) => Err(lost),
        };

        match settled {
            Ok(true) => HandlerOutcome::PoisonDrop,
            Ok(false) => HandlerOutcome::RetryableFailure {
                reason: "status cleanup interrupted by shutdown".to_string(),
            },
            Err(e) => {
                error!(
                    job_id = %job.job_id,
                    error = %format_error_chain(&e),
                    "Failed to settle status of dropped job"
                );
                HandlerOutcome::PoisonDrop
            }
        }
    }
}
