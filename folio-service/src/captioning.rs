//! Vision-model figure captioning for multimodal uploads.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::CaptioningConfig;
use crate::error::{ExternalServiceError, ServiceResult};
use crate::http::{build_client, check_status, connection_error};

const SERVICE: &str = "captioning";

/// Describes a cropped figure image in a sentence or two.
#[async_trait]
pub trait FigureCaptioner: Send + Sync {
    async fn caption(&self, figure_png: &[u8]) -> ServiceResult<String>;
}

/// Captioner backed by an Ollama-compatible `/api/chat` endpoint.
pub struct OllamaCaptioner {
    client: Client,
    config: CaptioningConfig,
}

impl OllamaCaptioner {
    pub fn new(config: CaptioningConfig) -> ServiceResult<Self> {
        let client = build_client(
            SERVICE,
            &config.base_url,
            Duration::from_secs(config.request_timeout_secs),
        )?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl FigureCaptioner for OllamaCaptioner {
    async fn caption(&self, figure_png: &[u8]) -> ServiceResult<String> {
        let url = format!("{}/api/chat", self.config.base_url.trim_end_matches('/'));

        let request = ChatRequest {
            model: &self.config.model,
            messages: vec![ChatMessage {
                role: "user",
                content: &self.config.prompt,
                images: vec![BASE64.encode(figure_png)],
            }],
            stream: false,
            options: ChatOptions {
                // Low temperature keeps descriptions factual
                temperature: 0.2,
            },
        };

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(connection_error(SERVICE, &url))?;
        let response = check_status(SERVICE, response).await?;

        let chat: ChatResponse =
            response
                .json()
                .await
                .map_err(|e| ExternalServiceError::InvalidResponse {
                    service: SERVICE,
                    message: e.to_string(),
                })?;

        let caption = chat.message.content.trim().to_string();
        if caption.is_empty() {
            return Err(ExternalServiceError::InvalidResponse {
                service: SERVICE,
                message: "empty caption".to_string(),
            }
            .into());
        }
        Ok(caption)
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    stream: bool,
    options: ChatOptions,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
    /// Base64-encoded images for vision models
    images: Vec<String>,
}

#[derive(Serialize)]
struct ChatOptions {
    temperature: f32,
}

#[derive(Deserialize)]
struct ChatResponse {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    content: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_shape() {
        let request = ChatRequest {
            model: "llava",
            messages: vec![ChatMessage {
                role: "user",
                content: "Describe",
                images: vec![BASE64.encode(b"png")],
            }],
            stream: false,
            options: ChatOptions { temperature: 0.2 },
        };

        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["model"], "llava");
        assert_eq!(json["stream"], false);
        assert_eq!(json["messages"][0]["images"][0], "cG5n");
    }

    #[test]
    fn test_response_parse() {
        let chat: ChatResponse = serde_json::from_str(
            r#"{"model":"llava","message":{"role":"assistant","content":" A bar chart. "},"done":true}"#,
        )
        .unwrap();
        assert_eq!(chat.message.content.trim(), "A bar chart.");
    }
}
