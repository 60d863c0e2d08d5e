//! Ollama backend: `POST {host}/api/generate` with the image in `images`.
//!
//! Runs against a local server, so there is no credential. The only thing
//! validation can check is that the host is a usable http(s) URL; whether
//! the server is actually up shows up as a (retryable) network error on the
//! first request.

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

pub const PROVIDER: &str = "ollama";
pub const DEFAULT_MODEL: &str = "llama3.2-vision";
pub const DEFAULT_HOST: &str = "http://localhost:11434";
pub const HOST_VAR: &str = "OLLAMA_HOST";

/// Ollama vision model (local).
pub struct OllamaModel {
    host: String,
    model: String,
    num_predict: Option<u32>,
    temperature: Option<f32>,
    prompt: String,
    transport: HttpTransport,
    retry: RetryManager,
}

impl OllamaModel {
    pub fn new(config: &ModelConfig) -> Result<Self, VisionError> {
        Ok(Self {
            host: config.endpoint(HOST_VAR, DEFAULT_HOST),
            model: config.model.clone().unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            num_predict: config.max_tokens,
            temperature: config.temperature,
            prompt: configured_prompt(config.prompt.as_deref()),
            transport: HttpTransport::new(PROVIDER, config.timeout())?,
            retry: RetryManager::new(config.retry)
                .with_observer(Arc::new(TracingRetryObserver::new(PROVIDER))),
        })
    }

    fn generate_url(&self) -> String {
        format!("{}/api/generate", self.host)
    }

    fn build_request(
        &self,
        image: &ImageData,
        prompt: &str,
        options: &DescribeOptions,
    ) -> serde_json::Value {
        let mut model_options = serde_json::Map::new();
        if let Some(n) = options.max_tokens.or(self.num_predict) {
            model_options.insert("num_predict".into(), serde_json::json!(n));
        }
        if let Some(t) = options.temperature.or(self.temperature) {
            model_options.insert("temperature".into(), serde_json::json!(t));
        }

        let mut body = serde_json::json!({
            "model": options.model.as_deref().unwrap_or(&self.model),
            "prompt": prompt,
            "images": [image.data],
            "stream": false,
        });
        if !model_options.is_empty() {
            body["options"] = serde_json::Value::Object(model_options);
        }
        body
    }

    fn classify(&self, failure: HttpFailure) -> BackendError {
        match failure {
            HttpFailure::Backend(e) => e,
            HttpFailure::Status(status) => self.map_status(status),
        }
    }

    /// A 404 naming a model means it was never pulled.
    fn map_status(&self, failure: StatusFailure) -> BackendError {
        if failure.status == 404 && failure.body.mentions("not found") {
            return BackendError::InvalidRequest {
                provider: PROVIDER.to_string(),
                status: 404,
                message: format!(
                    "{} (run `ollama pull {}` on the server)",
                    failure.body.message, self.model
                ),
            };
        }
        self.transport.map_status(failure)
    }
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
}

#[async_trait]
impl VisionModel for OllamaModel {
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
        validate_http_url(PROVIDER, &self.host)?;
        validate_temperature(PROVIDER, self.temperature)
    }

    async fn request(
        &self,
        image: &ImageData,
        prompt: &str,
        options: &DescribeOptions,
    ) -> Result<String, BackendError> {
        let body = self.build_request(image, prompt, options);
        let response: GenerateResponse = self
            .transport
            .post_json(&self.generate_url(), &[], &body)
            .await
            .map_err(|f| self.classify(f))?;
        debug!("ollama: {} chars from {}", response.response.len(), self.model);
        Ok(response.response)
    }
}
