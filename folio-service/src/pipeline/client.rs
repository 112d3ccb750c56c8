//! Producer-side API: enqueue uploads and indexing jobs, query job status.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use crate::containers::ContainerNames;
use crate::error::{ServiceError, ServiceResult};
use crate::indexing::IndexingService;
use crate::messages::{IndexingJobMessage, UploadMessage, validate_upload_filename};
use crate::queue::WorkQueue;
use crate::status::{JobStatus, ProbeStatus, ReconciledStatus, StatusStore, reconcile};

/// A PDF that has landed and should be split into pages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadRequest {
    pub filename: String,
    pub user_id: String,
    pub index_name: String,
    pub is_restricted: bool,
    pub num_pages: u32,
    pub blob_url: String,
    pub is_multimodal: bool,
}

/// Answer to a status query, with both authorities shown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobStatusReport {
    pub job_id: String,
    pub status: ReconciledStatus,
    pub local: JobStatus,
    pub external: ProbeStatus,
    pub message: String,
}

/// Producer side of both queues, plus status lookups.
pub struct IngestionClient {
    upload_queue: Arc<dyn WorkQueue>,
    indexing_queue: Arc<dyn WorkQueue>,
    status: Arc<dyn StatusStore>,
    indexer: Arc<dyn IndexingService>,
}

impl IngestionClient {
    pub fn new(
        upload_queue: Arc<dyn WorkQueue>,
        indexing_queue: Arc<dyn WorkQueue>,
        status: Arc<dyn StatusStore>,
        indexer: Arc<dyn IndexingService>,
    ) -> Self {
        Self {
            upload_queue,
            indexing_queue,
            status,
            indexer,
        }
    }

    /// Enqueue one landed PDF. Returns the queue message id.
    pub fn queue_file_for_processing(&self, request: UploadRequest) -> ServiceResult<String> {
        validate_upload_filename(&request.filename)?;
        let names = ContainerNames::derive(&request.user_id, &request.index_name, request.is_restricted)?;

        let message = UploadMessage {
            ingestion_container: names.ingestion(),
            reference_container: names.reference(),
            lz_container: names.landing_zone(),
            filename: request.filename,
            user_id: request.user_id,
            index_name: request.index_name,
            is_restricted: request.is_restricted,
            num_pages: request.num_pages,
            blob_url: request.blob_url,
            is_multimodal: request.is_multimodal,
        };
        let message_id = self.upload_queue.enqueue(&message.encode()?)?;

        info!(
            filename = %message.filename,
            pages = message.num_pages,
            message_id = %message_id,
            "Queued file for processing"
        );
        Ok(message_id)
    }

    /// Enqueue an indexing job for an ingestion container. The container name
    /// is the job id.
    pub fn queue_indexing_job(
        &self,
        container_name: &str,
        user_id: &str,
        index_name: &str,
        is_restricted: bool,
    ) -> ServiceResult<String> {
        let job_id = container_name.to_string();
        let message = IndexingJobMessage {
            job_id: job_id.clone(),
            container_name: container_name.to_string(),
            user_id: user_id.to_string(),
            index_name: index_name.to_string(),
            is_restricted,
        };
        let body = message.encode()?;

        // Row first: a consumer must never see the message without it
        self.status.create(&job_id)?;
        self.indexing_queue.enqueue(&body)?;

        info!(job_id = %job_id, index = %index_name, "Queued indexing job");
        Ok(job_id)
    }

    /// Combine our own record with the indexer's view of the job.
    pub async fn check_job_status(&self, job_id: &str) -> ServiceResult<JobStatusReport> {
        let local = self
            .status
            .get(job_id)?
            .ok_or_else(|| ServiceError::JobNotFound {
                job_id: job_id.to_string(),
            })?;
        let external = self.indexer.probe(job_id).await;
        let status = reconcile(local, external);

        Ok(JobStatusReport {
            job_id: job_id.to_string(),
            status,
            local,
            external,
            message: status.message().to_string(),
        })
    }

    /// Remove the search index built for `job_id`.
    pub async fn delete_ingestion_index(&self, job_id: &str) -> ServiceResult<()> {
        self.indexer.delete_index(job_id).await?;
        info!(job_id = %job_id, "Deleted search index");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Database, SqliteWorkQueue};
    use crate::error::MessageError;
    use crate::indexing::JobSubmission;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct FixedProbe {
        answer: ProbeStatus,
        deleted: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl IndexingService for FixedProbe {
        async fn submit(&self, container_name: &str) -> ServiceResult<JobSubmission> {
            Ok(JobSubmission {
                job_id: container_name.to_string(),
                message: "ok".to_string(),
            })
        }

        async fn probe(&self, _job_id: &str) -> ProbeStatus {
            self.answer
        }

        async fn delete_index(&self, job_id: &str) -> ServiceResult<()> {
            self.deleted.lock().unwrap().push(job_id.to_string());
            Ok(())
        }
    }

    struct Fixture {
        db: Arc<Database>,
        uploads: Arc<SqliteWorkQueue>,
        jobs: Arc<SqliteWorkQueue>,
        indexer: Arc<FixedProbe>,
        client: IngestionClient,
    }

    fn fixture(answer: ProbeStatus) -> Fixture {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let uploads = Arc::new(SqliteWorkQueue::new(db.clone(), "ingestion"));
        let jobs = Arc::new(SqliteWorkQueue::new(db.clone(), "indexing"));
        let indexer = Arc::new(FixedProbe {
            answer,
            deleted: Mutex::new(Vec::new()),
        });
        let client = IngestionClient::new(uploads.clone(), jobs.clone(), db.clone(), indexer.clone());
        Fixture {
            db,
            uploads,
            jobs,
            indexer,
            client,
        }
    }

    fn request(filename: &str) -> UploadRequest {
        UploadRequest {
            filename: filename.to_string(),
            user_id: "u1".to_string(),
            index_name: "Manuals".to_string(),
            is_restricted: true,
            num_pages: 3,
            blob_url: format!("https://acct.blob.core.windows.net/u1-manuals-lz/{filename}"),
            is_multimodal: false,
        }
    }

    #[test]
    fn test_upload_message_carries_derived_containers() {
        let f = fixture(ProbeStatus::InProgress);
        f.client.queue_file_for_processing(request("guide.pdf")).unwrap();

        let leased = f.uploads.receive(1, std::time::Duration::from_secs(30)).unwrap();
        let message = UploadMessage::decode(&leased[0].body).unwrap();
        assert_eq!(message.ingestion_container, "u1-manuals-ingestion");
        assert_eq!(message.reference_container, "u1-manuals-reference");
        assert_eq!(message.lz_container, "u1-manuals-lz");
        assert_eq!(message.num_pages, 3);
    }

    #[test]
    fn test_reserved_separator_rejected_before_enqueue() {
        let f = fixture(ProbeStatus::InProgress);
        let result = f.client.queue_file_for_processing(request("bad___name.pdf"));

        assert!(matches!(
            result,
            Err(ServiceError::Message(MessageError::ReservedSeparator { .. }))
        ));
        assert_eq!(f.uploads.approximate_len().unwrap(), 0);
    }

    #[test]
    fn test_indexing_job_creates_row_and_message() {
        let f = fixture(ProbeStatus::InProgress);
        let job_id = f
            .client
            .queue_indexing_job("u1-manuals-ingestion", "u1", "Manuals", true)
            .unwrap();

        assert_eq!(job_id, "u1-manuals-ingestion");
        assert_eq!(f.db.get(&job_id).unwrap(), Some(JobStatus::Queued));

        let leased = f.jobs.receive(1, std::time::Duration::from_secs(30)).unwrap();
        let message = IndexingJobMessage::decode(&leased[0].body).unwrap();
        assert_eq!(message.job_id, message.container_name);
    }

    #[test]
    fn test_requeue_of_live_job_is_rejected() {
        let f = fixture(ProbeStatus::InProgress);
        f.client
            .queue_indexing_job("u1-manuals-ingestion", "u1", "Manuals", true)
            .unwrap();
        f.db
            .transition("u1-manuals-ingestion", JobStatus::GraphragStarted)
            .unwrap();

        let result = f
            .client
            .queue_indexing_job("u1-manuals-ingestion", "u1", "Manuals", true);

        assert!(matches!(result, Err(ServiceError::InvalidTransition { .. })));
        assert_eq!(
            f.db.get("u1-manuals-ingestion").unwrap(),
            Some(JobStatus::GraphragStarted)
        );
        assert_eq!(f.jobs.approximate_len().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_completed_needs_both_sources() {
        let f = fixture(ProbeStatus::InProgress);
        f.db.create("job-1").unwrap();
        f.db.transition("job-1", JobStatus::GraphragCompleted).unwrap();
        f.db.transition("job-1", JobStatus::Completed).unwrap();

        let report = f.client.check_job_status("job-1").await.unwrap();
        assert_eq!(report.status, ReconciledStatus::InProgress);
        assert_eq!(report.local, JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_external_failure_wins() {
        let f = fixture(ProbeStatus::Failed);
        f.db.create("job-1").unwrap();
        f.db.transition("job-1", JobStatus::Completed).unwrap();

        let report = f.client.check_job_status("job-1").await.unwrap();
        assert_eq!(report.status, ReconciledStatus::Failed);
        assert_eq!(report.message, "Job failed");
    }

    #[tokio::test]
    async fn test_unknown_job_is_not_found() {
        let f = fixture(ProbeStatus::Completed);
        let result = f.client.check_job_status("missing").await;
        assert!(matches!(result, Err(ServiceError::JobNotFound { .. })));
    }

    #[tokio::test]
    async fn test_delete_index_delegates_to_indexer() {
        let f = fixture(ProbeStatus::Completed);
        f.client.delete_ingestion_index("job-1").await.unwrap();
        assert_eq!(*f.indexer.deleted.lock().unwrap(), vec!["job-1".to_string()]);
    }
}
