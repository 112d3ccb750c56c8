//! Polling loop shared by both consumers.

use async_trait::async_trait;
use futures::StreamExt;
use metrics::counter;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::sleep_or_cancel;
use crate::config::QueueConfig;
use crate::error::{ServiceResult, format_error_chain};
use crate::policy::{Disposition, HandlerOutcome, PoisonPolicy, disposition};
use crate::queue::{LeasedMessage, WorkQueue};

/// Business logic for one kind of message.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Handle one admitted delivery. `cancel` fires on shutdown; handlers
    /// that wait for long periods should stop waiting and report a
    /// retryable failure so the message is redelivered later.
    async fn handle(&self, message: &LeasedMessage, cancel: &CancellationToken) -> HandlerOutcome;

    /// Called instead of `handle` for a delivery past the retry limit, so the
    /// handler can settle any state the message owns. The default drops it.
    /// A retryable outcome keeps the message; its next delivery comes back here.
    async fn on_poison(&self, _message: &LeasedMessage, _cancel: &CancellationToken) -> HandlerOutcome {
        HandlerOutcome::PoisonDrop
    }
}

/// Counts for one receive/handle cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub received: usize,
    pub completed: usize,
    pub retried: usize,
    pub poisoned: usize,
    /// Messages whose delete failed (usually a lost lease); they will be redelivered.
    pub delete_failures: usize,
}

enum Settled {
    Completed,
    Retried,
    Poisoned,
    DeleteFailed,
}

/// Leases batches from a queue, applies the poison policy and hands admitted
/// messages to the handler, at most `concurrency` at a time.
pub struct QueueWorker<H> {
    queue: Arc<dyn WorkQueue>,
    handler: H,
    config: QueueConfig,
    poison: PoisonPolicy,
}

impl<H: MessageHandler> QueueWorker<H> {
    pub fn new(queue: Arc<dyn WorkQueue>, handler: H, config: QueueConfig) -> Self {
        let poison = PoisonPolicy::from(&config);
        Self {
            queue,
            handler,
            config,
            poison,
        }
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// Poll until `cancel` fires. The current batch always runs to completion.
    pub async fn run(&self, cancel: CancellationToken) {
        let queue = self.queue.name().to_string();
        info!(queue = %queue, "Queue worker started");

        while !cancel.is_cancelled() {
            match self.run_batch(&cancel).await {
                Ok(report) if report.received > 0 => {
                    info!(
                        queue = %queue,
                        received = report.received,
                        completed = report.completed,
                        retried = report.retried,
                        poisoned = report.poisoned,
                        "Batch finished"
                    );
                }
                Ok(_) => debug!(queue = %queue, "No messages"),
                Err(e) => {
                    error!(queue = %queue, error = %format_error_chain(&e), "Failed to receive messages");
                }
            }

            if !sleep_or_cancel(self.config.poll_interval(), &cancel).await {
                break;
            }
        }

        info!(queue = %queue, "Queue worker stopped");
    }

    /// Receive one batch and settle every message in it.
    pub async fn run_batch(&self, cancel: &CancellationToken) -> ServiceResult<BatchReport> {
        let messages = self
            .queue
            .receive(self.config.batch_size, self.config.visibility_timeout())?;

        let mut report = BatchReport {
            received: messages.len(),
            ..BatchReport::default()
        };

        let mut settled = futures::stream::iter(messages)
            .map(|message| self.settle(message, cancel))
            .buffer_unordered(self.config.concurrency.max(1));

        while let Some(outcome) = settled.next().await {
            match outcome {
                Settled::Completed => report.completed += 1,
                Settled::Retried => report.retried += 1,
                Settled::Poisoned => report.poisoned += 1,
                Settled::DeleteFailed => report.delete_failures += 1,
            }
        }

        Ok(report)
    }

    async fn settle(&self, message: LeasedMessage, cancel: &CancellationToken) -> Settled {
        let queue = self.queue.name();
        counter!("folio_messages_received_total", "queue" => queue.to_string()).increment(1);

        let outcome = if self.poison.admit(message.delivery_count) {
            debug!(
                queue = %queue,
                message_id = %message.id,
                delivery_count = message.delivery_count,
                "Handling message"
            );
            self.handler.handle(&message, cancel).await
        } else {
            error!(
                queue = %queue,
                message_id = %message.id,
                delivery_count = message.delivery_count,
                payload = %message.body,
                "Message exceeded retry limit"
            );
            self.handler.on_poison(&message, cancel).await
        };

        match disposition(&outcome) {
            Disposition::Delete => {
                if let Err(e) = self.queue.delete(&message) {
                    warn!(
                        queue = %queue,
                        message_id = %message.id,
                        error = %format_error_chain(&e),
                        "Failed to delete message"
                    );
                    return Settled::DeleteFailed;
                }
                if outcome == HandlerOutcome::PoisonDrop {
                    counter!("folio_messages_poisoned_total", "queue" => queue.to_string())
                        .increment(1);
                    Settled::Poisoned
                } else {
                    counter!("folio_messages_completed_total", "queue" => queue.to_string())
                        .increment(1);
                    Settled::Completed
                }
            }
            Disposition::Release => {
                if let HandlerOutcome::RetryableFailure { reason } = &outcome {
                    warn!(
                        queue = %queue,
                        message_id = %message.id,
                        delivery_count = message.delivery_count,
                        reason = %reason,
                        "Leaving message for redelivery"
                    );
                }
                counter!("folio_messages_retried_total", "queue" => queue.to_string())
                    .increment(1);
                Settled::Retried
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Database, SqliteWorkQueue};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Fails every message whose body starts with "fail". Bodies containing
    /// "hold" survive their first poison check.
    #[derive(Default)]
    struct RecordingHandler {
        seen: Mutex<Vec<String>>,
        poisoned: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl MessageHandler for RecordingHandler {
        async fn handle(&self, message: &LeasedMessage, _cancel: &CancellationToken) -> HandlerOutcome {
            self.seen.lock().unwrap().push(message.body.clone());
            if message.body.starts_with("fail") {
                HandlerOutcome::RetryableFailure {
                    reason: "told to fail".to_string(),
                }
            } else {
                HandlerOutcome::Success
            }
        }

        async fn on_poison(&self, message: &LeasedMessage, _cancel: &CancellationToken) -> HandlerOutcome {
            let mut poisoned = self.poisoned.lock().unwrap();
            let first = !poisoned.contains(&message.body);
            poisoned.push(message.body.clone());
            if first && message.body.contains("hold") {
                HandlerOutcome::RetryableFailure {
                    reason: "cleanup pending".to_string(),
                }
            } else {
                HandlerOutcome::PoisonDrop
            }
        }
    }

    fn config(visibility_timeout_secs: u64) -> QueueConfig {
        QueueConfig {
            name: "ingestion".to_string(),
            batch_size: 32,
            visibility_timeout_secs,
            max_dequeue_count: 2,
            poll_interval_secs: 0,
            concurrency: 4,
        }
    }

    fn worker(visibility_timeout_secs: u64) -> (Arc<SqliteWorkQueue>, QueueWorker<RecordingHandler>) {
        let queue = Arc::new(SqliteWorkQueue::new(
            Arc::new(Database::open_in_memory().unwrap()),
            "ingestion",
        ));
        let worker = QueueWorker::new(
            queue.clone(),
            RecordingHandler::default(),
            config(visibility_timeout_secs),
        );
        (queue, worker)
    }

    #[tokio::test]
    async fn test_success_deletes_and_failure_releases() {
        let (queue, worker) = worker(300);
        queue.enqueue("ok-1").unwrap();
        queue.enqueue("fail-1").unwrap();

        let report = worker.run_batch(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.received, 2);
        assert_eq!(report.completed, 1);
        assert_eq!(report.retried, 1);
        assert_eq!(queue.approximate_len().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_repeated_failure_ends_in_poison_drop() {
        // Zero visibility timeout: every batch sees the message again
        let (queue, worker) = worker(0);
        queue.enqueue("fail-forever").unwrap();
        let cancel = CancellationToken::new();

        let first = worker.run_batch(&cancel).await.unwrap();
        let second = worker.run_batch(&cancel).await.unwrap();
        let third = worker.run_batch(&cancel).await.unwrap();

        assert_eq!((first.retried, second.retried), (1, 1));
        assert_eq!(third.poisoned, 1);
        assert_eq!(queue.approximate_len().unwrap(), 0);
        // The third delivery never reached the handler
        assert_eq!(worker.handler().seen.lock().unwrap().len(), 2);
        assert_eq!(
            *worker.handler().poisoned.lock().unwrap(),
            vec!["fail-forever".to_string()]
        );
    }

    #[tokio::test]
    async fn test_poison_hook_can_keep_message() {
        let (queue, worker) = worker(0);
        queue.enqueue("fail-hold").unwrap();
        let cancel = CancellationToken::new();

        worker.run_batch(&cancel).await.unwrap();
        worker.run_batch(&cancel).await.unwrap();

        let kept = worker.run_batch(&cancel).await.unwrap();
        assert_eq!((kept.retried, kept.poisoned), (1, 0));
        assert_eq!(queue.approximate_len().unwrap(), 1);

        let dropped = worker.run_batch(&cancel).await.unwrap();
        assert_eq!(dropped.poisoned, 1);
        assert_eq!(queue.approximate_len().unwrap(), 0);
        assert_eq!(worker.handler().poisoned.lock().unwrap().len(), 2);
        assert_eq!(worker.handler().seen.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let (_queue, worker) = worker(300);
        let cancel = CancellationToken::new();
        cancel.cancel();

        tokio::time::timeout(Duration::from_secs(5), worker.run(cancel))
            .await
            .unwrap();
    }
}
