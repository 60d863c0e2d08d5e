//! Streaming API: page results as they complete.
//!
//! [`crate::extract::extract`] returns only after every page is done. The
//! functions here yield each [`PageResult`] as soon as its page finishes, so
//! callers can render progressively or write pages incrementally. Results
//! arrive in completion order; sort by `index` if order matters.
//!
//! ```rust,no_run
//! use docvision::{extract_stream, ExtractionConfig, ImageDirectory};
//! use futures::StreamExt;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ExtractionConfig::from_env()?;
//! let mut pages = extract_stream(&ImageDirectory::new("slides/"), &config)?;
//! while let Some(page) = pages.next().await {
//!     match page.text() {
//!         Some(text) => println!("page {}: {} chars", page.index + 1, text.len()),
//!         None => eprintln!("page {} failed", page.index + 1),
//!     }
//! }
//! # Ok(())
//! # }
//! ```

use crate::config::ExtractionConfig;
use crate::error::VisionError;
use crate::extract::resolve_model;
use crate::output::PageResult;
use crate::pipeline::{DocumentSource, PageSource, Pipeline};
use std::pin::Pin;
use tokio_stream::Stream;
use tracing::info;

/// A boxed stream of page results, in completion order.
pub type PageStream = Pin<Box<dyn Stream<Item = PageResult> + Send>>;

/// Stream results for `sources` through `pipeline`.
///
/// Same dispatch, isolation and cancellation rules as [`Pipeline::run`].
/// `on_job_complete` is not fired; the stream ending marks completion.
pub fn run_stream(pipeline: &Pipeline, sources: Vec<PageSource>, prompt: Option<&str>) -> PageStream {
    let total = sources.len();
    if let Some(cb) = &pipeline.config().progress_callback {
        cb.on_job_start(total);
    }
    let tasks = pipeline.tasks(sources, prompt);
    Box::pin(pipeline.dispatch(tasks, total))
}

/// Resolve the configured model, decompose `document` and stream its pages.
///
/// # Errors
/// Model resolution and decomposition failures, before any page is sent.
pub fn extract_stream(
    document: &dyn DocumentSource,
    config: &ExtractionConfig,
) -> Result<PageStream, VisionError> {
    config.validate()?;
    let model = resolve_model(config)?;
    let sources = document.pages()?;
    info!(
        "Streaming '{}': {} pages via {}/{}",
        document.name(),
        sources.len(),
        model.provider(),
        model.model_id()
    );
    let pipeline = Pipeline::new(model, config.pipeline.clone());
    Ok(run_stream(&pipeline, sources, None))
}
