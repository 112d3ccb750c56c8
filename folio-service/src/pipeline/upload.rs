//! Upload queue handler: one landed PDF per message, split into page artifacts.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::page_processor::PageProcessor;
use super::worker::MessageHandler;
use crate::error::format_error_chain;
use crate::messages::UploadMessage;
use crate::policy::HandlerOutcome;
use crate::queue::LeasedMessage;

/// Upload queue handler: one message is one landed PDF.
pub struct UploadConsumer {
    processor: PageProcessor,
}

impl UploadConsumer {
    pub fn new(processor: PageProcessor) -> Self {
        Self { processor }
    }
}

#[async_trait]
impl MessageHandler for UploadConsumer {
    async fn handle(&self, message: &LeasedMessage, _cancel: &CancellationToken) -> HandlerOutcome {
        // A body that does not parse is left for lease expiry like any other
        // failure; the poison check bounds how often it comes back.
        let upload = match UploadMessage::decode(&message.body) {
            Ok(upload) => upload,
            Err(e) => {
                error!(
                    message_id = %message.id,
                    error = %format_error_chain(&e),
                    "Malformed upload message"
                );
                return HandlerOutcome::RetryableFailure {
                    reason: e.to_string(),
                };
            }
        };

        info!(
            message_id = %message.id,
            filename = %upload.filename,
            pages = upload.num_pages,
            attempt = message.delivery_count,
            "Processing file"
        );

        match self.processor.process(&upload).await {
            Ok(summary) => {
                info!(
                    filename = %upload.filename,
                    pages = summary.pages,
                    objects = summary.objects_written,
                    figures_captioned = summary.figures_captioned,
                    "Completed processing all pages"
                );
                HandlerOutcome::Success
            }
            Err(e) => {
                error!(
                    filename = %upload.filename,
                    error = %format_error_chain(&e),
                    "Error processing file"
                );
                HandlerOutcome::RetryableFailure {
                    reason: e.to_string(),
                }
            }
        }
    }
}
