//! High-level entry points: resolve a model, run the pipeline, merge.
//!
//! These wait for every page and return the merged document. Use
//! [`crate::stream::extract_stream`] to receive pages as they finish.

use crate::config::ExtractionConfig;
use crate::error::VisionError;
use crate::model::{ModelRegistry, VisionModel};
use crate::output::{ExtractionOutput, ExtractionStats};
use crate::pipeline::{DocumentSource, Pipeline};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// Describe every page of `document` and merge the descriptions.
///
/// # Returns
/// `Ok(ExtractionOutput)` once every page is terminal, even when some
/// failed (check `output.stats.failed_pages`).
///
/// # Errors
/// * Configuration and model-resolution errors ([`VisionError::Configuration`],
///   [`VisionError::UnsupportedModel`], [`VisionError::NoAvailableModel`]).
/// * [`VisionError::Decomposition`] when the document cannot be split.
pub async fn extract(
    document: &dyn DocumentSource,
    config: &ExtractionConfig,
) -> Result<ExtractionOutput, VisionError> {
    extract_with(&ModelRegistry::with_builtin(), document, config).await
}

/// [`extract`] with a caller-supplied registry (custom or stub backends).
pub async fn extract_with(
    registry: &ModelRegistry,
    document: &dyn DocumentSource,
    config: &ExtractionConfig,
) -> Result<ExtractionOutput, VisionError> {
    config.validate()?;
    let model = resolve_model_with(registry, config)?;
    info!(
        "Extracting '{}' with {}/{}",
        document.name(),
        model.provider(),
        model.model_id()
    );
    Pipeline::new(model, config.pipeline.clone())
        .run_document(document)
        .await
}

/// Extract and write the merged document to `output_path`.
///
/// The file is written through a temporary sibling and renamed into place,
/// so readers never see a partial document.
pub async fn extract_to_file(
    document: &dyn DocumentSource,
    output_path: impl AsRef<Path>,
    config: &ExtractionConfig,
) -> Result<ExtractionStats, VisionError> {
    let output = extract(document, config).await?;
    let path = output_path.as_ref().to_path_buf();
    let contents = output.document;
    tokio::task::spawn_blocking(move || write_atomic(&path, contents.as_bytes()))
        .await
        .map_err(|e| VisionError::Internal(format!("output write task failed: {e}")))??;
    Ok(output.stats)
}

/// Blocking wrapper around [`extract`].
///
/// Creates a temporary Tokio runtime; do not call from inside one.
pub fn extract_sync(
    document: &dyn DocumentSource,
    config: &ExtractionConfig,
) -> Result<ExtractionOutput, VisionError> {
    tokio::runtime::Runtime::new()
        .map_err(|e| VisionError::Internal(format!("Failed to create tokio runtime: {e}")))?
        .block_on(extract(document, config))
}

/// The configured model: by name when `config.model_name` is set, otherwise
/// the first backend in the preference order that validates.
pub fn resolve_model(config: &ExtractionConfig) -> Result<Arc<dyn VisionModel>, VisionError> {
    resolve_model_with(&ModelRegistry::with_builtin(), config)
}

/// [`resolve_model`] against `registry`.
pub fn resolve_model_with(
    registry: &ModelRegistry,
    config: &ExtractionConfig,
) -> Result<Arc<dyn VisionModel>, VisionError> {
    match config.model_name.as_deref().map(str::trim) {
        Some(name) if !name.is_empty() => registry.create(name, &config.model),
        _ => registry.auto_select(&config.model),
    }
}

/// Write `bytes` to a temp file next to `path`, then rename over `path`.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), VisionError> {
    let failed = |source: std::io::Error| VisionError::OutputWriteFailed {
        path: path.to_path_buf(),
        source,
    };
    let parent: PathBuf = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&parent).map_err(failed)?;

    let mut tmp = tempfile::NamedTempFile::new_in(&parent).map_err(failed)?;
    tmp.write_all(bytes).map_err(failed)?;
    tmp.flush().map_err(failed)?;
    tmp.persist(path).map_err(|e| failed(e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EnvSource;

    #[test]
    fn atomic_write_creates_parents_and_replaces() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("deck.md");
        write_atomic(&path, b"first").unwrap();
        write_atomic(&path, b"second").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "second");
        let leftovers = std::fs::read_dir(path.parent().unwrap()).unwrap().count();
        assert_eq!(leftovers, 1);
    }

    #[test]
    fn named_model_resolves_through_aliases() {
        let mut config = ExtractionConfig::default();
        config.model_name = Some("llama".into());
        config.model.env = EnvSource::empty();
        let model = resolve_model(&config).unwrap();
        assert_eq!(model.provider(), "ollama");
    }

    #[test]
    fn unnamed_model_is_auto_selected() {
        let mut config = ExtractionConfig::default();
        config.model.env = EnvSource::from_pairs([("OPENAI_API_KEY", "sk-test")]);
        let model = resolve_model(&config).unwrap();
        assert_eq!(model.provider(), "openai");
    }

    #[test]
    fn unknown_model_name_is_unsupported() {
        let mut config = ExtractionConfig::default();
        config.model_name = Some("gemini".into());
        config.model.env = EnvSource::empty();
        assert!(matches!(
            resolve_model(&config),
            Err(VisionError::UnsupportedModel { .. })
        ));
    }

    #[tokio::test]
    async fn decomposition_failure_aborts_before_any_page() {
        let mut config = ExtractionConfig::default();
        config.model_name = Some("ollama".into());
        config.model.env = EnvSource::empty();
        let err = extract(&crate::pipeline::ImageDirectory::new("/no/such/deck"), &config)
            .await
            .unwrap_err();
        assert!(matches!(err, VisionError::Decomposition { .. }), "got {err:?}");
    }
}
