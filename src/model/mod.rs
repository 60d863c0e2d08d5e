//! Vision-model abstraction and its backends.
//!
//! Callers depend only on the [`VisionModel`] trait object; the concrete
//! backend is chosen by name through [`ModelRegistry`].
//!
//! ```text
//! describe_image(path, prompt, opts)
//!   │
//!   ├─ 1. image::load_image   missing file / undecodable → error, no network
//!   ├─ 2. RetryManager        wraps every attempt
//!   │     └─ request()        one HTTP call, backend-specific mapping
//!   └─ 3. empty reply         → EmptyResponse (retryable)
//! ```
//!
//! | Module | Backend |
//! |--------|---------|
//! | [`openai`] | OpenAI chat completions (cloud) |
//! | [`claude`] | Anthropic messages API (cloud) |
//! | [`ollama`] | Ollama `/api/generate` (local) |

pub mod claude;
pub mod http;
pub mod image;
pub mod ollama;
pub mod openai;
pub mod registry;

pub use self::image::{load_image, ImageData};
pub use claude::ClaudeModel;
pub use ollama::OllamaModel;
pub use openai::OpenAiModel;
pub use registry::{ModelConstructor, ModelRegistry};

use crate::error::{BackendError, VisionError};
use crate::retry::{RetryError, RetryManager};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// OpenAI image detail level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageDetail {
    Low,
    High,
    #[default]
    Auto,
}

impl ImageDetail {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageDetail::Low => "low",
            ImageDetail::High => "high",
            ImageDetail::Auto => "auto",
        }
    }
}

/// Per-call overrides for [`VisionModel::describe_image`].
///
/// Unset fields fall back to the model's configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DescribeOptions {
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    /// Override the backend's model identifier for this call only.
    pub model: Option<String>,
    /// OpenAI only; ignored by the other backends.
    pub detail: Option<ImageDetail>,
}

/// A backend that turns an image into a natural-language description.
///
/// Implementors supply the one-request primitive [`VisionModel::request`];
/// loading, validation, retries and empty-reply handling are shared by the
/// provided [`VisionModel::describe_image`].
#[async_trait]
pub trait VisionModel: Send + Sync {
    /// Backend name, e.g. "openai".
    fn provider(&self) -> &str;

    /// Model identifier sent to the backend, e.g. "gpt-4o-mini".
    fn model_id(&self) -> &str;

    /// Prompt used when the caller supplies none.
    fn default_prompt(&self) -> &str;

    /// Retry manager wrapped around every request.
    fn retry_manager(&self) -> &RetryManager;

    /// Check credentials and parameters. No network I/O.
    fn validate_config(&self) -> Result<(), VisionError>;

    /// Exactly one backend request, with native errors mapped into
    /// [`BackendError`].
    async fn request(
        &self,
        image: &ImageData,
        prompt: &str,
        options: &DescribeOptions,
    ) -> Result<String, BackendError>;

    /// Describe the image at `path`.
    ///
    /// # Errors
    /// * [`VisionError::FileNotFound`] / [`VisionError::InvalidImage`] before
    ///   any network attempt.
    /// * [`VisionError::Backend`] on a fatal backend error (one attempt).
    /// * [`VisionError::RetriesExhausted`] when every attempt failed with a
    ///   retryable error.
    async fn describe_image(
        &self,
        path: &Path,
        prompt: Option<&str>,
        options: &DescribeOptions,
    ) -> Result<String, VisionError> {
        self.describe_image_counted(path, prompt, options)
            .await
            .map(|(text, _)| text)
    }

    /// [`VisionModel::describe_image`], also returning how many backend
    /// attempts the successful description took.
    async fn describe_image_counted(
        &self,
        path: &Path,
        prompt: Option<&str>,
        options: &DescribeOptions,
    ) -> Result<(String, u32), VisionError> {
        let image = load_image(path).await?;
        let image = &image;
        let prompt = prompt
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| self.default_prompt());
        let provider = self.provider();
        let mut attempts = 0u32;

        let text = self
            .retry_manager()
            .execute(|| {
                attempts += 1;
                async move {
                    let text = self.request(image, prompt, options).await?;
                    if text.trim().is_empty() {
                        Err(BackendError::EmptyResponse {
                            provider: provider.to_string(),
                        })
                    } else {
                        Ok(text)
                    }
                }
            })
            .await
            .map_err(into_vision_error)?;
        Ok((text, attempts))
    }
}

/// Map the retry loop's outcome into the caller-facing error.
pub(crate) fn into_vision_error(err: RetryError<BackendError>) -> VisionError {
    match err {
        RetryError::Fatal(e) => VisionError::Backend(e),
        RetryError::Exhausted { attempts, last } => VisionError::RetriesExhausted { attempts, last },
    }
}

/// Resolve the effective prompt: per-call, else model config, else built-in.
pub(crate) fn configured_prompt(prompt: Option<&str>) -> String {
    prompt
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .unwrap_or(crate::prompts::DEFAULT_PROMPT)
        .to_string()
}

/// Check that `url` is an absolute http(s) URL.
pub(crate) fn validate_http_url(provider: &str, url: &str) -> Result<(), VisionError> {
    let parsed = reqwest::Url::parse(url).map_err(|e| VisionError::Configuration {
        model: provider.to_string(),
        reason: format!("invalid endpoint URL '{url}': {e}"),
    })?;
    match parsed.scheme() {
        "http" | "https" if parsed.host_str().is_some() => Ok(()),
        _ => Err(VisionError::Configuration {
            model: provider.to_string(),
            reason: format!("endpoint '{url}' must be an http(s) URL with a host"),
        }),
    }
}

/// Check an optional temperature against the range all backends accept.
pub(crate) fn validate_temperature(provider: &str, t: Option<f32>) -> Result<(), VisionError> {
    match t {
        Some(t) if !(0.0..=2.0).contains(&t) => Err(VisionError::Configuration {
            model: provider.to_string(),
            reason: format!("temperature must be within 0.0–2.0, got {t}"),
        }),
        _ => Ok(()),
    }
}
