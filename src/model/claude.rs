//! Anthropic backend: `POST {base}/v1/messages` with a base64 `image`
//! content block followed by the prompt text.

use super::http::{HttpFailure, HttpTransport, StatusFailure};
use super::{
    configured_prompt, validate_http_url, validate_temperature, DescribeOptions, ImageData,
    VisionModel,
};
use crate::config::ModelConfig;
use crate::error::{BackendError, VisionError};
use crate::retry::{RetryManager, TracingRetryObserver};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use tracing::debug;

pub const PROVIDER: &str = "claude";
pub const DEFAULT_MODEL: &str = "claude-3-5-sonnet-20241022";
pub const DEFAULT_MAX_TOKENS: u32 = 1024;
pub const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
pub const API_KEY_VAR: &str = "ANTHROPIC_API_KEY";
pub const BASE_URL_VAR: &str = "ANTHROPIC_BASE_URL";
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Claude vision model (cloud).
pub struct ClaudeModel {
    api_key: Option<String>,
    base_url: String,
    model: String,
    max_tokens: u32,
    temperature: Option<f32>,
    prompt: String,
    transport: HttpTransport,
    retry: RetryManager,
}

impl ClaudeModel {
    /// Build from `config`. Missing credentials are reported by
    /// [`VisionModel::validate_config`], not here.
    pub fn new(config: &ModelConfig) -> Result<Self, VisionError> {
        Ok(Self {
            api_key: config.credential(API_KEY_VAR),
            base_url: config.endpoint(BASE_URL_VAR, DEFAULT_BASE_URL),
            model: config.model.clone().unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            max_tokens: config.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            temperature: config.temperature,
            prompt: configured_prompt(config.prompt.as_deref()),
            transport: HttpTransport::new(PROVIDER, config.timeout())?,
            retry: RetryManager::new(config.retry)
                .with_observer(Arc::new(TracingRetryObserver::new(PROVIDER))),
        })
    }

    fn messages_url(&self) -> String {
        format!("{}/v1/messages", self.base_url)
    }

    fn build_request(
        &self,
        image: &ImageData,
        prompt: &str,
        options: &DescribeOptions,
    ) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": options.model.as_deref().unwrap_or(&self.model),
            "max_tokens": options.max_tokens.unwrap_or(self.max_tokens),
            "messages": [{
                "role": "user",
                "content": [
                    {
                        "type": "image",
                        "source": {
                            "type": "base64",
                            "media_type": image.mime_type,
                            "data": image.data,
                        }
                    },
                    { "type": "text", "text": prompt }
                ]
            }],
        });
        if let Some(t) = options.temperature.or(self.temperature) {
            body["temperature"] = serde_json::json!(t);
        }
        body
    }

    fn classify(&self, failure: HttpFailure) -> BackendError {
        match failure {
            HttpFailure::Backend(e) => e,
            HttpFailure::Status(status) => self.map_status(status),
        }
    }

    /// Anthropic reports an empty balance as a 400 `invalid_request_error`
    /// mentioning the credit balance.
    fn map_status(&self, failure: StatusFailure) -> BackendError {
        if failure.body.mentions("credit balance") || failure.body.mentions("billing") {
            return BackendError::QuotaExhausted {
                provider: PROVIDER.to_string(),
                message: failure.body.message,
            };
        }
        self.transport.map_status(failure)
    }
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    text: Option<String>,
}

#[async_trait]
impl VisionModel for ClaudeModel {
    fn provider(&self) -> &str {
        PROVIDER
    }

    fn model_id(&self) -> &str {
        &self.model
    }

    fn default_prompt(&self) -> &str {
        &self.prompt
    }

    fn retry_manager(&self) -> &RetryManager {
        &self.retry
    }

    fn validate_config(&self) -> Result<(), VisionError> {
        if self.api_key.is_none() {
            return Err(VisionError::Configuration {
                model: PROVIDER.to_string(),
                reason: format!("no API key; pass one explicitly or set {API_KEY_VAR}"),
            });
        }
        validate_http_url(PROVIDER, &self.base_url)?;
        validate_temperature(PROVIDER, self.temperature)
    }

    async fn request(
        &self,
        image: &ImageData,
        prompt: &str,
        options: &DescribeOptions,
    ) -> Result<String, BackendError> {
        let api_key = self.api_key.as_deref().unwrap_or_default();
        let body = self.build_request(image, prompt, options);
        let headers = [
            ("x-api-key", api_key),
            ("anthropic-version", ANTHROPIC_VERSION),
        ];

        let response: MessagesResponse = self
            .transport
            .post_json(&self.messages_url(), &headers, &body)
            .await
            .map_err(|f| self.classify(f))?;

        let text = response
            .content
            .into_iter()
            .filter(|block| block.kind == "text")
            .filter_map(|block| block.text)
            .collect::<Vec<_>>()
            .join("");
        debug!("claude: {} chars from {}", text.len(), self.model);
        Ok(text)
    }
}
