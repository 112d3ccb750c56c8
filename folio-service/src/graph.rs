//! Graph-processing stage run between indexer submission and status polling.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, warn};

use crate::config::GraphConfig;
use crate::containers::ContainerNames;
use crate::error::{ExternalServiceError, ServiceResult};
use crate::http::{build_client, check_status, connection_error};

const SERVICE: &str = "graph";

/// Only page markdown feeds the graph.
pub const INPUT_FILE_PATTERN: &str = r".*\.md$";

/// Where a graph build reads its input and writes its outputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphIndexConfig {
    pub index_name: String,
    pub input_container: String,
    pub file_pattern: String,
    pub storage_container: String,
    pub reporting_container: String,
    pub cache_container: String,
    /// Vector-store collection for graph entity embeddings.
    pub collection_name: String,
}

impl GraphIndexConfig {
    pub fn for_index(names: &ContainerNames, index_name: &str) -> Self {
        Self {
            index_name: index_name.to_string(),
            input_container: names.ingestion(),
            file_pattern: INPUT_FILE_PATTERN.to_string(),
            storage_container: names.graph_data(),
            reporting_container: names.graph_reports(),
            cache_container: names.graph_cache(),
            collection_name: format!("{}-graphrag", names.base()),
        }
    }
}

#[async_trait]
pub trait GraphBuilder: Send + Sync {
    /// Run the whole graph pipeline to completion. An `Err` means the stage
    /// itself failed; problems inside individual workflows are only logged.
    async fn build(&self, config: &GraphIndexConfig) -> ServiceResult<()>;
}

pub struct HttpGraphBuilder {
    client: Client,
    config: GraphConfig,
}

impl HttpGraphBuilder {
    pub fn new(config: GraphConfig) -> ServiceResult<Self> {
        let client = build_client(
            SERVICE,
            &config.endpoint,
            Duration::from_secs(config.request_timeout_secs),
        )?;
        Ok(Self { client, config })
    }
}

#[derive(Debug, Default, Deserialize)]
struct BuildResponse {
    #[serde(default)]
    workflows: Vec<WorkflowResult>,
}

#[derive(Debug, Deserialize)]
struct WorkflowResult {
    workflow: String,
    #[serde(default)]
    errors: Vec<serde_json::Value>,
}

/// Log each workflow that reported errors; returns how many did.
fn report_workflow_errors(index_name: &str, response: &BuildResponse) -> usize {
    let mut failed = 0;
    for result in response.workflows.iter().filter(|w| !w.errors.is_empty()) {
        failed += 1;
        warn!(
            index = %index_name,
            workflow = %result.workflow,
            errors = %serde_json::Value::from(result.errors.clone()),
            "Graph workflow reported errors"
        );
    }
    failed
}

#[async_trait]
impl GraphBuilder for HttpGraphBuilder {
    async fn build(&self, config: &GraphIndexConfig) -> ServiceResult<()> {
        let url = format!("{}/index", self.config.endpoint.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .header("api-key", &self.config.api_key)
            .json(config)
            .send()
            .await
            .map_err(connection_error(SERVICE, &url))?;
        let response = check_status(SERVICE, response).await?;

        let body: BuildResponse =
            response
                .json()
                .await
                .map_err(|e| ExternalServiceError::InvalidResponse {
                    service: SERVICE,
                    message: e.to_string(),
                })?;

        let failed = report_workflow_errors(&config.index_name, &body);
        info!(
            index = %config.index_name,
            workflows = body.workflows.len(),
            failed_workflows = failed,
            "Graph build finished"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_for_restricted_index() {
        let names = ContainerNames::derive("u1", "idx1", true).unwrap();
        let config = GraphIndexConfig::for_index(&names, "idx1");

        assert_eq!(config.input_container, "u1-idx1-ingestion");
        assert_eq!(config.storage_container, "u1-idx1-grdata");
        assert_eq!(config.reporting_container, "u1-idx1-grrep");
        assert_eq!(config.cache_container, "u1-idx1-grcache");
        assert_eq!(config.collection_name, "u1-idx1-graphrag");
        assert_eq!(config.file_pattern, r".*\.md$");
    }

    #[test]
    fn test_workflow_errors_are_counted_not_fatal() {
        let body: BuildResponse = serde_json::from_str(
            r#"{"workflows":[
                {"workflow":"create_base_text_units","errors":[]},
                {"workflow":"create_final_entities","errors":["rate limit"]},
                {"workflow":"create_final_communities"}
            ]}"#,
        )
        .unwrap();

        assert_eq!(report_workflow_errors("idx1", &body), 1);
    }
}
