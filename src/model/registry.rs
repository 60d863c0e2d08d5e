//! Model factory: logical name → validated [`VisionModel`].
//!
//! The registry is the only place that knows which backends exist. Adding a
//! backend means one [`ModelRegistry::register`] call; neither callers nor
//! the pipeline change.
//!
//! Names are case-insensitive. Legacy aliases (`gpt4`, `llama`, …) resolve
//! to their canonical name before lookup.

use super::{claude, ollama, openai, ClaudeModel, OllamaModel, OpenAiModel, VisionModel};
use crate::config::ModelConfig;
use crate::error::VisionError;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// Builds one backend instance from a [`ModelConfig`].
pub type ModelConstructor =
    Arc<dyn Fn(&ModelConfig) -> Result<Arc<dyn VisionModel>, VisionError> + Send + Sync>;

/// Name → constructor table plus alias map.
#[derive(Clone, Default)]
pub struct ModelRegistry {
    constructors: BTreeMap<String, ModelConstructor>,
    aliases: BTreeMap<String, String>,
}

impl fmt::Debug for ModelRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelRegistry")
            .field("names", &self.names())
            .field("aliases", &self.aliases)
            .finish()
    }
}

impl ModelRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// `openai`, `claude` and `ollama`, plus their legacy aliases.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(openai::PROVIDER, |c| {
            Ok(Arc::new(OpenAiModel::new(c)?) as Arc<dyn VisionModel>)
        });
        registry.register(claude::PROVIDER, |c| {
            Ok(Arc::new(ClaudeModel::new(c)?) as Arc<dyn VisionModel>)
        });
        registry.register(ollama::PROVIDER, |c| {
            Ok(Arc::new(OllamaModel::new(c)?) as Arc<dyn VisionModel>)
        });
        registry.register_alias("gpt4", openai::PROVIDER);
        registry.register_alias("gpt-4o", openai::PROVIDER);
        registry.register_alias("anthropic", claude::PROVIDER);
        registry.register_alias("llama", ollama::PROVIDER);
        registry
    }

    /// Add (or replace) a backend under `name`.
    pub fn register<F>(&mut self, name: &str, constructor: F) -> &mut Self
    where
        F: Fn(&ModelConfig) -> Result<Arc<dyn VisionModel>, VisionError> + Send + Sync + 'static,
    {
        self.constructors
            .insert(normalize(name), Arc::new(constructor));
        self
    }

    /// Make `alias` resolve to the canonical `target`.
    pub fn register_alias(&mut self, alias: &str, target: &str) -> &mut Self {
        self.aliases.insert(normalize(alias), normalize(target));
        self
    }

    /// Canonical registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        self.constructors.keys().cloned().collect()
    }

    /// Aliases and the canonical names they resolve to, sorted by alias.
    pub fn aliases(&self) -> Vec<(String, String)> {
        self.aliases
            .iter()
            .map(|(a, t)| (a.clone(), t.clone()))
            .collect()
    }

    /// Canonical name for `name`, if registered (directly or via an alias).
    pub fn resolve(&self, name: &str) -> Option<String> {
        let key = normalize(name);
        let key = self.aliases.get(&key).cloned().unwrap_or(key);
        self.constructors.contains_key(&key).then_some(key)
    }

    /// Construct and validate the backend registered as `name`.
    ///
    /// # Errors
    /// * [`VisionError::UnsupportedModel`]: `name` is not registered.
    /// * [`VisionError::Configuration`]: construction or validation failed.
    pub fn create(
        &self,
        name: &str,
        config: &ModelConfig,
    ) -> Result<Arc<dyn VisionModel>, VisionError> {
        let canonical = self
            .resolve(name)
            .ok_or_else(|| VisionError::UnsupportedModel {
                name: name.to_string(),
                available: self.names(),
            })?;
        let constructor = self
            .constructors
            .get(&canonical)
            .ok_or_else(|| VisionError::Internal(format!("constructor for '{canonical}' vanished")))?;

        let as_config_error = |e: VisionError| match e {
            e @ VisionError::Configuration { .. } => e,
            other => VisionError::Configuration {
                model: canonical.clone(),
                reason: other.to_string(),
            },
        };

        let model = constructor(config).map_err(as_config_error)?;
        model.validate_config().map_err(as_config_error)?;
        debug!("Created vision model {} ({})", canonical, model.model_id());
        Ok(model)
    }

    /// First backend in `config.preference` that constructs and validates.
    ///
    /// Candidates are judged on their own environment variables only. An
    /// explicit `api_key` or `base_url` belongs to a single backend, so it
    /// must come with a named model.
    ///
    /// # Errors
    /// [`VisionError::InvalidConfig`] when an explicit key or endpoint is
    /// set. [`VisionError::NoAvailableModel`] listing every candidate and
    /// why it was skipped.
    pub fn auto_select(&self, config: &ModelConfig) -> Result<Arc<dyn VisionModel>, VisionError> {
        let explicit_key = config.api_key.as_deref().is_some_and(|k| !k.trim().is_empty());
        if explicit_key || config.base_url.is_some() {
            return Err(VisionError::InvalidConfig(
                "an explicit API key or base URL applies to one backend; name the model to use it with"
                    .into(),
            ));
        }

        let mut tried = Vec::new();
        for name in &config.preference {
            match self.create(name, config) {
                Ok(model) => {
                    info!(
                        "Auto-selected vision model {} ({})",
                        model.provider(),
                        model.model_id()
                    );
                    return Ok(model);
                }
                Err(e) => {
                    debug!("Skipping {}: {}", name, e);
                    tried.push(format!("{name}: {e}"));
                }
            }
        }
        Err(VisionError::NoAvailableModel { tried })
    }
}

fn normalize(name: &str) -> String {
    name.trim().to_ascii_lowercase()
}
