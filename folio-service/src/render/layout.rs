//! Client for the layout-extraction service (prebuilt-layout, markdown output).

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use super::{BoundingBox, FigureRegion, PageLayout};
use crate::config::LayoutConfig;
use crate::error::{ExternalServiceError, ServiceResult};
use crate::http::{build_client, check_status, connection_error};

const SERVICE: &str = "layout";

pub struct LayoutClient {
    client: Client,
    config: LayoutConfig,
}

impl LayoutClient {
    pub fn new(config: LayoutConfig) -> ServiceResult<Self> {
        let client = build_client(
            SERVICE,
            &config.endpoint,
            Duration::from_secs(config.request_timeout_secs),
        )?;
        Ok(Self { client, config })
    }

    fn analyze_url(&self) -> String {
        format!(
            "{}/documentintelligence/documentModels/{}:analyze?api-version={}&outputContentFormat=markdown&stringIndexType=unicodeCodePoint",
            self.config.endpoint.trim_end_matches('/'),
            self.config.model,
            self.config.api_version
        )
    }

    /// Submit one page and wait for the analysis to finish.
    pub async fn analyze(&self, page_pdf: &[u8]) -> ServiceResult<PageLayout> {
        let url = self.analyze_url();
        let body = serde_json::json!({ "base64Source": BASE64.encode(page_pdf) });

        let response = self
            .client
            .post(&url)
            .header("Ocp-Apim-Subscription-Key", &self.config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(connection_error(SERVICE, &url))?;
        let response = check_status(SERVICE, response).await?;

        let operation_url = response
            .headers()
            .get("operation-location")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| ExternalServiceError::InvalidResponse {
                service: SERVICE,
                message: "analyze response has no Operation-Location header".to_string(),
            })?;

        let poll_interval = Duration::from_millis(self.config.poll_interval_ms);
        for poll in 1..=self.config.max_polls {
            let response = self
                .client
                .get(&operation_url)
                .header("Ocp-Apim-Subscription-Key", &self.config.api_key)
                .send()
                .await
                .map_err(connection_error(SERVICE, &operation_url))?;
            let response = check_status(SERVICE, response).await?;

            let operation: AnalyzeOperation =
                response
                    .json()
                    .await
                    .map_err(|e| ExternalServiceError::InvalidResponse {
                        service: SERVICE,
                        message: e.to_string(),
                    })?;

            match operation.status.as_str() {
                "succeeded" => {
                    let result = operation.analyze_result.unwrap_or_default();
                    debug!(polls = poll, figures = result.figures.len(), "Layout analysis finished");
                    return Ok(layout_from_result(result));
                }
                "failed" | "canceled" => {
                    return Err(ExternalServiceError::OperationFailed {
                        service: SERVICE,
                        message: operation
                            .error
                            .map(|e| e.to_string())
                            .unwrap_or_else(|| format!("analysis {}", operation.status)),
                    }
                    .into());
                }
                _ => tokio::time::sleep(poll_interval).await,
            }
        }

        Err(ExternalServiceError::OperationFailed {
            service: SERVICE,
            message: format!(
                "analysis still running after {} polls",
                self.config.max_polls
            ),
        }
        .into())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnalyzeOperation {
    status: String,
    analyze_result: Option<AnalyzeResult>,
    error: Option<serde_json::Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnalyzeResult {
    #[serde(default)]
    content: String,
    #[serde(default)]
    figures: Vec<AnalyzedFigure>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnalyzedFigure {
    id: Option<String>,
    #[serde(default)]
    bounding_regions: Vec<BoundingRegion>,
    #[serde(default)]
    spans: Vec<Span>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BoundingRegion {
    /// Flat `[x1, y1, x2, y2, ...]`, inches for PDF input
    #[serde(default)]
    polygon: Vec<f32>,
}

#[derive(Debug, Deserialize)]
struct Span {
    offset: usize,
    length: usize,
}

/// Flatten the analysis into markdown plus figure regions. Figures without a
/// span are dropped since they cannot be located in the text.
fn layout_from_result(result: AnalyzeResult) -> PageLayout {
    let figures = result
        .figures
        .into_iter()
        .enumerate()
        .filter_map(|(i, figure)| {
            let start = figure.spans.iter().map(|s| s.offset).min()?;
            let end = figure.spans.iter().map(|s| s.offset + s.length).max()?;
            Some(FigureRegion {
                id: figure.id.unwrap_or_else(|| format!("figure-{}", i + 1)),
                offset: start,
                length: end - start,
                bounding_box: figure
                    .bounding_regions
                    .first()
                    .and_then(|r| polygon_bounds(&r.polygon)),
            })
        })
        .collect();

    PageLayout {
        content: result.content,
        figures,
    }
}

fn polygon_bounds(polygon: &[f32]) -> Option<BoundingBox> {
    if polygon.len() < 4 {
        return None;
    }
    let xs = polygon.iter().step_by(2);
    let ys = polygon.iter().skip(1).step_by(2);
    Some(BoundingBox {
        left: xs.clone().copied().fold(f32::INFINITY, f32::min),
        right: xs.copied().fold(f32::NEG_INFINITY, f32::max),
        top: ys.clone().copied().fold(f32::INFINITY, f32::min),
        bottom: ys.copied().fold(f32::NEG_INFINITY, f32::max),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r##"{
        "status": "succeeded",
        "analyzeResult": {
            "content": "# Results\n\n<figure>\n\nRevenue chart\n\n</figure>\n\nClosing text",
            "figures": [
                {
                    "id": "1.1",
                    "boundingRegions": [
                        { "pageNumber": 1, "polygon": [1.0, 2.0, 5.5, 2.0, 5.5, 4.25, 1.0, 4.25] }
                    ],
                    "spans": [ { "offset": 11, "length": 34 } ]
                },
                { "id": "1.2", "boundingRegions": [], "spans": [] }
            ]
        }
    }"##;

    #[test]
    fn test_layout_from_sample_response() {
        let operation: AnalyzeOperation = serde_json::from_str(SAMPLE).unwrap();
        let layout = layout_from_result(operation.analyze_result.unwrap());

        assert!(layout.content.starts_with("# Results"));
        assert_eq!(layout.figures.len(), 1);

        let figure = &layout.figures[0];
        assert_eq!(figure.id, "1.1");
        assert_eq!((figure.offset, figure.length), (11, 34));
        assert_eq!(
            figure.bounding_box,
            Some(BoundingBox {
                left: 1.0,
                top: 2.0,
                right: 5.5,
                bottom: 4.25
            })
        );
    }

    #[test]
    fn test_running_operation_has_no_result() {
        let operation: AnalyzeOperation =
            serde_json::from_str(r#"{"status": "running"}"#).unwrap();
        assert_eq!(operation.status, "running");
        assert!(operation.analyze_result.is_none());
    }
}
