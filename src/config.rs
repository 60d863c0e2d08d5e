//! Configuration types for model construction, page pipelines and whole
//! extraction jobs.
//!
//! Three structs, each with a builder:
//!
//! * [`ModelConfig`]: credentials, endpoint, model id, token cap, timeout
//!   and retry policy. Consumed by [`crate::model::ModelRegistry`].
//! * [`PipelineConfig`]: worker count, prompt and merge options. Consumed
//!   by [`crate::pipeline::Pipeline`].
//! * [`ExtractionConfig`]: both of the above plus the logical model name.
//!   Consumed by [`crate::extract::extract`].
//!
//! Environment lookups go through the [`EnvSource`] carried in
//! [`ModelConfig`]; [`EnvSource::Map`] substitutes a private map for the
//! process environment.

use crate::benchmark::BenchmarkSink;
use crate::error::VisionError;
use crate::progress::ProgressCallback;
use crate::retry::{RetryPolicy, RetryStrategy};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

// ── Environment ──────────────────────────────────────────────────────────

/// Where credentials and endpoint overrides are looked up.
#[derive(Debug, Clone, Default)]
pub enum EnvSource {
    /// The process environment (default).
    #[default]
    Process,
    /// A fixed map, typically built in tests.
    Map(HashMap<String, String>),
}

impl EnvSource {
    /// An empty map: every lookup misses.
    pub fn empty() -> Self {
        EnvSource::Map(HashMap::new())
    }

    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        EnvSource::Map(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    /// Look up `key`. Blank values count as unset.
    pub fn get(&self, key: &str) -> Option<String> {
        let value = match self {
            EnvSource::Process => std::env::var(key).ok(),
            EnvSource::Map(map) => map.get(key).cloned(),
        }?;
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    }

    fn parse<T: std::str::FromStr>(&self, key: &str) -> Result<Option<T>, VisionError> {
        match self.get(key) {
            None => Ok(None),
            Some(raw) => raw.parse::<T>().map(Some).map_err(|_| {
                VisionError::InvalidConfig(format!("{key} has an invalid value: '{raw}'"))
            }),
        }
    }
}

// ── Model configuration ──────────────────────────────────────────────────

/// The order [`crate::model::ModelRegistry::auto_select`] tries backends in.
pub const DEFAULT_PREFERENCE: [&str; 3] = ["openai", "claude", "ollama"];

/// Per-backend settings.
///
/// Every field is optional except `timeout_secs` and `retry`; an unset field
/// falls back to the backend's environment variable, then to its built-in
/// default.
#[derive(Clone)]
pub struct ModelConfig {
    /// Explicit API key. Wins over the backend's environment variable.
    pub api_key: Option<String>,

    /// Model identifier, e.g. "gpt-4o-mini". If None, the backend default.
    pub model: Option<String>,

    /// Endpoint override (OpenAI / Anthropic base URL, Ollama host).
    pub base_url: Option<String>,

    /// Output token cap. If None, the backend default.
    pub max_tokens: Option<u32>,

    /// Sampling temperature. If None, left to the backend.
    pub temperature: Option<f32>,

    /// Per-request timeout in seconds. Default: 60.
    pub timeout_secs: u64,

    /// Retry policy wrapped around every backend request.
    pub retry: RetryPolicy,

    /// Prompt used when `describe_image` is called without one.
    pub prompt: Option<String>,

    /// Auto-selection order. Default: openai, claude, ollama.
    pub preference: Vec<String>,

    /// Where credentials and endpoint overrides are read from.
    pub env: EnvSource,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            model: None,
            base_url: None,
            max_tokens: None,
            temperature: None,
            timeout_secs: 60,
            retry: RetryPolicy::default(),
            prompt: None,
            preference: DEFAULT_PREFERENCE.iter().map(|s| s.to_string()).collect(),
            env: EnvSource::Process,
        }
    }
}

impl fmt::Debug for ModelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelConfig")
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("model", &self.model)
            .field("base_url", &self.base_url)
            .field("max_tokens", &self.max_tokens)
            .field("temperature", &self.temperature)
            .field("timeout_secs", &self.timeout_secs)
            .field("retry", &self.retry)
            .field("preference", &self.preference)
            .finish()
    }
}

impl ModelConfig {
    pub fn builder() -> ModelConfigBuilder {
        ModelConfigBuilder {
            config: Self::default(),
        }
    }

    /// Explicit key, else `env_var`, else None.
    pub fn credential(&self, env_var: &str) -> Option<String> {
        self.api_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .map(str::to_string)
            .or_else(|| self.env.get(env_var))
    }

    /// Explicit base URL, else `env_var`, else `default`. Trailing `/` removed.
    pub fn endpoint(&self, env_var: &str, default: &str) -> String {
        self.base_url
            .clone()
            .or_else(|| self.env.get(env_var))
            .unwrap_or_else(|| default.to_string())
            .trim_end_matches('/')
            .to_string()
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Builder for [`ModelConfig`].
#[derive(Debug)]
pub struct ModelConfigBuilder {
    config: ModelConfig,
}

impl ModelConfigBuilder {
    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.config.api_key = Some(key.into());
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = Some(model.into());
        self
    }

    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.config.base_url = Some(url.into());
        self
    }

    pub fn max_tokens(mut self, n: u32) -> Self {
        self.config.max_tokens = Some(n);
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = Some(t.clamp(0.0, 2.0));
        self
    }

    pub fn timeout_secs(mut self, secs: u64) -> Self {
        self.config.timeout_secs = secs;
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.config.retry = policy;
        self
    }

    pub fn prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.prompt = Some(prompt.into());
        self
    }

    pub fn preference<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.preference = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn env(mut self, env: EnvSource) -> Self {
        self.config.env = env;
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<ModelConfig, VisionError> {
        let c = &self.config;
        if c.timeout_secs == 0 {
            return Err(VisionError::InvalidConfig(
                "Timeout must be ≥ 1 second".into(),
            ));
        }
        if c.max_tokens == Some(0) {
            return Err(VisionError::InvalidConfig(
                "max_tokens must be ≥ 1 when set".into(),
            ));
        }
        c.retry.validate()?;
        Ok(self.config)
    }
}

// ── Pipeline configuration ───────────────────────────────────────────────

/// Heading written above each page section in the merged document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PageHeading {
    /// "## Page N" (default).
    #[default]
    Numbered,
    /// "## Slide N", for presentations.
    Slide,
    /// No heading; sections are separated by a blank line only.
    None,
}

impl PageHeading {
    /// Render the heading for the page at `index` (0-based).
    pub fn render(&self, index: usize) -> Option<String> {
        match self {
            PageHeading::Numbered => Some(format!("## Page {}", index + 1)),
            PageHeading::Slide => Some(format!("## Slide {}", index + 1)),
            PageHeading::None => None,
        }
    }
}

/// How a failed page is rendered in the merged document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorMarker {
    /// `> **[Page N failed]** <error>` (default).
    #[default]
    Blockquote,
    /// `<!-- page N failed: <error> -->`, invisible when rendered.
    Comment,
}

/// Settings for one [`crate::pipeline::Pipeline`] run.
#[derive(Clone)]
pub struct PipelineConfig {
    /// Worker-pool size. Default: 4.
    ///
    /// Vision calls are network-bound, so the limit is usually the backend's
    /// rate limit rather than local CPU. Lower it if pages keep hitting 429.
    pub workers: usize,

    /// Prompt for every page. If None, the model's default prompt.
    pub prompt: Option<String>,

    /// Heading style for merged output. Default: [`PageHeading::Numbered`].
    pub page_heading: PageHeading,

    /// Failed-page marker style. Default: [`ErrorMarker::Blockquote`].
    pub error_marker: ErrorMarker,

    /// Write "# <document name>" at the top of the merged output. Default: true.
    pub include_title: bool,

    /// Append a short statistics footer to the merged output. Default: false.
    pub include_stats_footer: bool,

    /// Run [`crate::pipeline::postprocess::clean_description`] on every page. Default: true.
    pub clean_output: bool,

    /// Receives per-page progress events.
    pub progress_callback: Option<ProgressCallback>,

    /// Receives one benchmark entry per page.
    pub benchmark: Option<Arc<dyn BenchmarkSink>>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            prompt: None,
            page_heading: PageHeading::default(),
            error_marker: ErrorMarker::default(),
            include_title: true,
            include_stats_footer: false,
            clean_output: true,
            progress_callback: None,
            benchmark: None,
        }
    }
}

impl fmt::Debug for PipelineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineConfig")
            .field("workers", &self.workers)
            .field("prompt", &self.prompt)
            .field("page_heading", &self.page_heading)
            .field("error_marker", &self.error_marker)
            .field("include_title", &self.include_title)
            .field("include_stats_footer", &self.include_stats_footer)
            .field("clean_output", &self.clean_output)
            .field(
                "progress_callback",
                &self.progress_callback.as_ref().map(|_| "<dyn PageProgressCallback>"),
            )
            .field("benchmark", &self.benchmark.as_ref().map(|_| "<dyn BenchmarkSink>"))
            .finish()
    }
}

impl PipelineConfig {
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder {
            config: Self::default(),
        }
    }
}

/// Builder for [`PipelineConfig`].
#[derive(Debug)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    pub fn workers(mut self, n: usize) -> Self {
        self.config.workers = n;
        self
    }

    pub fn prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.prompt = Some(prompt.into());
        self
    }

    pub fn page_heading(mut self, heading: PageHeading) -> Self {
        self.config.page_heading = heading;
        self
    }

    pub fn error_marker(mut self, marker: ErrorMarker) -> Self {
        self.config.error_marker = marker;
        self
    }

    pub fn include_title(mut self, v: bool) -> Self {
        self.config.include_title = v;
        self
    }

    pub fn include_stats_footer(mut self, v: bool) -> Self {
        self.config.include_stats_footer = v;
        self
    }

    pub fn clean_output(mut self, v: bool) -> Self {
        self.config.clean_output = v;
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    pub fn benchmark(mut self, sink: Arc<dyn BenchmarkSink>) -> Self {
        self.config.benchmark = Some(sink);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<PipelineConfig, VisionError> {
        if self.config.workers == 0 {
            return Err(VisionError::InvalidConfig("Workers must be ≥ 1".into()));
        }
        Ok(self.config)
    }
}

// ── Whole-job configuration ──────────────────────────────────────────────

/// Everything [`crate::extract::extract`] needs.
#[derive(Debug, Clone, Default)]
pub struct ExtractionConfig {
    /// Logical model name ("openai", "claude", "ollama" or an alias).
    /// If None, the registry auto-selects.
    pub model_name: Option<String>,
    pub model: ModelConfig,
    pub pipeline: PipelineConfig,
}

impl ExtractionConfig {
    /// Read overrides from the process environment.
    pub fn from_env() -> Result<Self, VisionError> {
        Self::from_env_source(&EnvSource::Process)
    }

    /// Read overrides from `env`, starting from the defaults.
    ///
    /// | Variable | Field |
    /// |----------|-------|
    /// | `DOCVISION_MODEL` | `model_name` |
    /// | `DOCVISION_WORKERS` | `pipeline.workers` |
    /// | `DOCVISION_PROMPT` | `pipeline.prompt` |
    /// | `DOCVISION_RETRY_STRATEGY` | `model.retry.strategy` |
    /// | `DOCVISION_RETRY_MAX_ATTEMPTS` | `model.retry.max_attempts` |
    /// | `DOCVISION_RETRY_BASE_DELAY_MS` | `model.retry.base_delay` |
    /// | `DOCVISION_RETRY_MAX_DELAY_MS` | `model.retry.max_delay` |
    /// | `DOCVISION_TIMEOUT_SECS` | `model.timeout_secs` |
    pub fn from_env_source(env: &EnvSource) -> Result<Self, VisionError> {
        let mut config = ExtractionConfig {
            model_name: env.get("DOCVISION_MODEL"),
            ..Default::default()
        };
        config.model.env = env.clone();

        if let Some(workers) = env.parse::<usize>("DOCVISION_WORKERS")? {
            config.pipeline.workers = workers;
        }
        config.pipeline.prompt = env.get("DOCVISION_PROMPT");

        if let Some(strategy) = env.parse::<RetryStrategy>("DOCVISION_RETRY_STRATEGY")? {
            config.model.retry.strategy = strategy;
        }
        if let Some(n) = env.parse::<u32>("DOCVISION_RETRY_MAX_ATTEMPTS")? {
            config.model.retry.max_attempts = n;
        }
        if let Some(ms) = env.parse::<u64>("DOCVISION_RETRY_BASE_DELAY_MS")? {
            config.model.retry.base_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = env.parse::<u64>("DOCVISION_RETRY_MAX_DELAY_MS")? {
            config.model.retry.max_delay = Duration::from_millis(ms);
        }
        if let Some(secs) = env.parse::<u64>("DOCVISION_TIMEOUT_SECS")? {
            config.model.timeout_secs = secs;
        }

        config.validate()?;
        Ok(config)
    }

    /// Re-check the invariants the builders enforce.
    pub fn validate(&self) -> Result<(), VisionError> {
        if self.pipeline.workers == 0 {
            return Err(VisionError::InvalidConfig("Workers must be ≥ 1".into()));
        }
        if self.model.timeout_secs == 0 {
            return Err(VisionError::InvalidConfig(
                "Timeout must be ≥ 1 second".into(),
            ));
        }
        self.model.retry.validate()
    }
}
