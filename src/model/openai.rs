//! OpenAI backend: `POST {base}/v1/chat/completions` with an `image_url`
//! content part carrying the image as a data URL.

use super::http::{HttpFailure, HttpTransport, StatusFailure};
use super::{
    configured_prompt, validate_http_url, validate_temperature, DescribeOptions, ImageData,
    ImageDetail, VisionModel,
};
use crate::config::ModelConfig;
use crate::error::{BackendError, VisionError};
use crate::retry::{RetryManager, TracingRetryObserver};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use tracing::debug;

pub const PROVIDER: &str = "openai";
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_MAX_TOKENS: u32 = 300;
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com";
pub const API_KEY_VAR: &str = "OPENAI_API_KEY";
pub const BASE_URL_VAR: &str = "OPENAI_BASE_URL";

/// OpenAI vision model (cloud).
pub struct OpenAiModel {
    api_key: Option<String>,
    base_url: String,
    model: String,
    max_tokens: u32,
    temperature: Option<f32>,
    prompt: String,
    transport: HttpTransport,
    retry: RetryManager,
}

impl OpenAiModel {
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

    /// Accepts both `https://api.openai.com` and `https://api.openai.com/v1`.
    fn completions_url(&self) -> String {
        if self.base_url.ends_with("/v1") {
            format!("{}/chat/completions", self.base_url)
        } else {
            format!("{}/v1/chat/completions", self.base_url)
        }
    }

    fn build_request(
        &self,
        image: &ImageData,
        prompt: &str,
        options: &DescribeOptions,
    ) -> serde_json::Value {
        let detail = options.detail.unwrap_or(ImageDetail::Auto);
        let mut body = serde_json::json!({
            "model": options.model.as_deref().unwrap_or(&self.model),
            "messages": [{
                "role": "user",
                "content": [
                    { "type": "text", "text": prompt },
                    {
                        "type": "image_url",
                        "image_url": { "url": image.data_url(), "detail": detail.as_str() }
                    }
                ]
            }],
            "max_tokens": options.max_tokens.unwrap_or(self.max_tokens),
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

    /// `insufficient_quota` can arrive as 429 or 403; it is never transient.
    fn map_status(&self, failure: StatusFailure) -> BackendError {
        if failure.body.mentions("insufficient_quota") {
            return BackendError::QuotaExhausted {
                provider: PROVIDER.to_string(),
                message: failure.body.message,
            };
        }
        self.transport.map_status(failure)
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[async_trait]
impl VisionModel for OpenAiModel {
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
        let auth = format!("Bearer {api_key}");
        let body = self.build_request(image, prompt, options);

        let response: ChatResponse = self
            .transport
            .post_json(&self.completions_url(), &[("Authorization", auth.as_str())], &body)
            .await
            .map_err(|f| self.classify(f))?;

        let text = response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();
        debug!("openai: {} chars from {}", text.len(), self.model);
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EnvSource;
    use crate::model::http::ErrorBody;

    fn image() -> ImageData {
        ImageData {
            data: "AAAA".into(),
            mime_type: "image/png".into(),
            width: 1,
            height: 1,
        }
    }

    fn model_with(env: EnvSource) -> OpenAiModel {
        let config = ModelConfig::builder().env(env).build().unwrap();
        OpenAiModel::new(&config).unwrap()
    }

    #[test]
    fn missing_key_fails_validation() {
        let model = model_with(EnvSource::empty());
        let err = model.validate_config().unwrap_err();
        assert!(matches!(err, VisionError::Configuration { ref model, .. } if model == "openai"));
        assert!(err.to_string().contains("OPENAI_API_KEY"));
    }

    #[test]
    fn env_key_and_defaults() {
        let model = model_with(EnvSource::from_pairs([(API_KEY_VAR, "sk-test")]));
        assert!(model.validate_config().is_ok());
        assert_eq!(model.model_id(), DEFAULT_MODEL);
        assert_eq!(model.max_tokens, 300);
        assert_eq!(model.completions_url(), "https://api.openai.com/v1/chat/completions");
    }

    #[test]
    fn base_url_with_v1_suffix() {
        let model = model_with(EnvSource::from_pairs([
            (API_KEY_VAR, "sk-test"),
            (BASE_URL_VAR, "http://proxy.local/v1/"),
        ]));
        assert_eq!(model.completions_url(), "http://proxy.local/v1/chat/completions");
    }

    #[test]
    fn request_body_shape() {
        let model = model_with(EnvSource::from_pairs([(API_KEY_VAR, "sk-test")]));
        let opts = DescribeOptions {
            max_tokens: Some(50),
            temperature: Some(0.0),
            model: Some("gpt-4o".into()),
            detail: Some(ImageDetail::High),
        };
        let body = model.build_request(&image(), "Describe", &opts);
        assert_eq!(body["model"], "gpt-4o");
        assert_eq!(body["max_tokens"], 50);
        assert_eq!(body["temperature"], 0.0);
        let parts = &body["messages"][0]["content"];
        assert_eq!(parts[0]["text"], "Describe");
        assert_eq!(parts[1]["image_url"]["url"], "data:image/png;base64,AAAA");
        assert_eq!(parts[1]["image_url"]["detail"], "high");
    }

    #[test]
    fn default_body_omits_temperature() {
        let model = model_with(EnvSource::from_pairs([(API_KEY_VAR, "sk-test")]));
        let body = model.build_request(&image(), "Describe", &DescribeOptions::default());
        assert!(body.get("temperature").is_none());
        assert_eq!(body["model"], DEFAULT_MODEL);
        assert_eq!(body["messages"][0]["content"][1]["image_url"]["detail"], "auto");
    }

    #[test]
    fn insufficient_quota_is_fatal_even_on_403() {
        let model = model_with(EnvSource::empty());
        let err = model.map_status(StatusFailure {
            status: 403,
            retry_after: None,
            body: ErrorBody::parse(r#"{"error":{"message":"quota","code":"insufficient_quota"}}"#),
        });
        assert!(matches!(err, BackendError::QuotaExhausted { .. }));
    }
}
