//! External indexer: job submission, run-status probe and index deletion.

use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::IndexingConfig;
use crate::error::ServiceResult;
use crate::http::{build_client, check_status, connection_error};
use crate::status::ProbeStatus;

const SERVICE: &str = "indexer";
const SEARCH_SERVICE: &str = "search";

/// Accepted submission for one ingestion container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSubmission {
    pub job_id: String,
    pub message: String,
}

#[async_trait]
pub trait IndexingService: Send + Sync {
    /// Create or overwrite the indexing job for `container_name`. Called once;
    /// retrying is up to the caller.
    async fn submit(&self, container_name: &str) -> ServiceResult<JobSubmission>;

    /// Current run status. Never fails: anything that prevents an answer
    /// is reported as `ProbeStatus::Error`.
    async fn probe(&self, job_id: &str) -> ProbeStatus;

    /// Remove the search index built for `job_id`.
    async fn delete_index(&self, job_id: &str) -> ServiceResult<()>;
}

/// Translate a run-status response into the closed vocabulary.
///
/// The upstream schema is not stable, so this matches on substrings of the
/// raw body: any mention of "succeeded" wins, then "failed"; otherwise a 200
/// means still running and anything else means the status is unknown.
pub fn map_run_status(status_code: u16, body: &str) -> ProbeStatus {
    if body.contains("succeeded") {
        ProbeStatus::Completed
    } else if body.contains("failed") {
        ProbeStatus::Failed
    } else if status_code == 200 {
        ProbeStatus::InProgress
    } else {
        ProbeStatus::Error
    }
}

pub struct HttpIndexingSubmitter {
    client: Client,
    config: IndexingConfig,
}

impl HttpIndexingSubmitter {
    pub fn new(config: IndexingConfig) -> ServiceResult<Self> {
        let client = build_client(
            SERVICE,
            &config.endpoint,
            Duration::from_secs(config.request_timeout_secs),
        )?;
        Ok(Self { client, config })
    }

    fn jobs_url(&self, job_id: &str) -> String {
        format!(
            "{}/openai/ingestion/jobs/{}",
            self.config.endpoint.trim_end_matches('/'),
            urlencoding::encode(job_id)
        )
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, url)
            .query(&[("api-version", self.config.api_version.as_str())])
            .header("api-key", &self.config.api_key)
            .header("Opc-Apim-Subscription-Key", &self.config.api_key)
    }
}

/// Job definition: index the container's markdown with the configured
/// embedding deployment, reading and writing through managed identity.
fn submission_payload(config: &IndexingConfig, container_name: &str) -> serde_json::Value {
    serde_json::json!({
        "kind": "system",
        "searchServiceConnection": {
            "kind": "EndpointWithManagedIdentity",
            "endpoint": config.search_endpoint,
        },
        "datasource": {
            "kind": "Storage",
            "storageAccountConnection": {
                "kind": "EndpointWithManagedIdentity",
                "endpoint": format!("https://{}.blob.core.windows.net/", config.storage_account),
                "resourceId": format!(
                    "ResourceId=/subscriptions/{}/resourceGroups/{}/providers/Microsoft.Storage/storageAccounts/{}",
                    config.subscription_id, config.resource_group, config.storage_account
                ),
            },
            "containerName": container_name,
            "chunkingSettings": { "maxChunkSizeInTokens": config.max_chunk_size_tokens },
            "embeddingsSettings": [{
                "embeddingResourceConnection": { "kind": "RelativeConnection" },
                "modelProvider": "AOAI",
                "deploymentName": config.embedding_deployment,
            }],
        },
        "completionAction": 1,
    })
}

#[async_trait]
impl IndexingService for HttpIndexingSubmitter {
    async fn submit(&self, container_name: &str) -> ServiceResult<JobSubmission> {
        let url = self.jobs_url(container_name);
        let response = self
            .request(reqwest::Method::PUT, &url)
            .json(&submission_payload(&self.config, container_name))
            .send()
            .await
            .map_err(connection_error(SERVICE, &url))?;
        check_status(SERVICE, response).await?;

        debug!(job_id = %container_name, "Indexing job submitted");
        Ok(JobSubmission {
            job_id: container_name.to_string(),
            message: "Indexing job initiated successfully".to_string(),
        })
    }

    async fn probe(&self, job_id: &str) -> ProbeStatus {
        let url = format!("{}/runs", self.jobs_url(job_id));
        let response = match self.request(reqwest::Method::GET, &url).send().await {
            Ok(response) => response,
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "Indexer status request failed");
                return ProbeStatus::Error;
            }
        };

        let status_code = response.status().as_u16();
        match response.text().await {
            Ok(body) => map_run_status(status_code, &body),
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "Failed to read indexer status body");
                ProbeStatus::Error
            }
        }
    }

    async fn delete_index(&self, job_id: &str) -> ServiceResult<()> {
        let url = format!(
            "{}/indexes/{}",
            self.config.search_endpoint.trim_end_matches('/'),
            urlencoding::encode(job_id)
        );
        let response = self
            .client
            .delete(&url)
            .query(&[("api-version", self.config.search_api_version.as_str())])
            .header("api-key", &self.config.search_api_key)
            .header("Opc-Apim-Subscription-Key", &self.config.search_api_key)
            .send()
            .await
            .map_err(connection_error(SEARCH_SERVICE, &url))?;
        check_status(SEARCH_SERVICE, response).await?;
        Ok(())
    }
}
