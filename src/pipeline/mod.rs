//! Concurrent, order-preserving page pipeline.
//!
//! ```text
//! DocumentSource ──▶ PageTask[0..N) ──▶ worker pool ──▶ PageResult[0..N) ──▶ merge
//!  (decompose)        (index order)     (≤ workers)     (slot per index)     (index order)
//! ```
//!
//! 1. [`source`]:      list a document's page images in reading order
//! 2. [`worker`]:      one page through the model, errors captured per page
//! 3. [`postprocess`]: deterministic clean-up of each description
//! 4. [`merge`]:       one section per page, failed pages marked inline
//!
//! Pages complete in any order; results are always returned by index.

pub mod merge;
pub mod postprocess;
pub mod source;
pub mod worker;

pub use source::{DocumentSource, ImageDirectory, ImageList, PageSource, PageTask};
pub use worker::CancelHandle;

use crate::config::PipelineConfig;
use crate::error::{PageError, VisionError};
use crate::model::{DescribeOptions, VisionModel};
use crate::output::{ExtractionOutput, ExtractionStats, PageResult};
use futures::stream::{self, Stream, StreamExt};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};
use worker::PageWorker;

/// Where a job is in its lifecycle. Logged at every transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    /// Pages listed and numbered.
    Decomposed,
    /// Tasks handed to the worker pool.
    Dispatched,
    /// Every page reached success or failure.
    Completed,
    /// Sections assembled into the final document.
    Merged,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            JobState::Decomposed => "decomposed",
            JobState::Dispatched => "dispatched",
            JobState::Completed => "completed",
            JobState::Merged => "merged",
        })
    }
}

/// Runs page tasks against one model with a bounded worker pool.
pub struct Pipeline {
    model: Arc<dyn VisionModel>,
    config: PipelineConfig,
    options: DescribeOptions,
    cancel: CancelHandle,
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("model", &self.model_name())
            .field("config", &self.config)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

impl Pipeline {
    pub fn new(model: Arc<dyn VisionModel>, config: PipelineConfig) -> Self {
        Self {
            model,
            config,
            options: DescribeOptions::default(),
            cancel: CancelHandle::new(),
        }
    }

    /// Per-call overrides passed to every page's describe call.
    pub fn with_options(mut self, options: DescribeOptions) -> Self {
        self.options = options;
        self
    }

    /// Handle that stops dispatching further pages.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn model(&self) -> &Arc<dyn VisionModel> {
        &self.model
    }

    /// "provider/model", e.g. "openai/gpt-4o-mini".
    pub fn model_name(&self) -> String {
        format!("{}/{}", self.model.provider(), self.model.model_id())
    }

    /// Number `sources` in order. `prompt` wins over the configured prompt;
    /// with neither, the model's default applies.
    pub fn tasks(&self, sources: Vec<PageSource>, prompt: Option<&str>) -> Vec<PageTask> {
        let prompt: Option<Arc<str>> = prompt
            .or(self.config.prompt.as_deref())
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(Arc::from);
        let model_name = self.model_name();
        sources
            .into_iter()
            .enumerate()
            .map(|(index, source)| PageTask {
                index,
                source,
                prompt: prompt.clone(),
                model_name: model_name.clone(),
            })
            .collect()
    }

    /// Describe every page, returning one result per source in source order.
    ///
    /// Never fails as a whole: each page's error is recorded in its own
    /// [`PageResult`].
    pub async fn run(&self, sources: Vec<PageSource>, prompt: Option<&str>) -> Vec<PageResult> {
        let total = sources.len();
        let tasks = self.tasks(sources, prompt);

        if let Some(cb) = &self.config.progress_callback {
            cb.on_job_start(total);
        }
        info!(
            "Job {}: {} pages, {} workers, model {}",
            JobState::Dispatched,
            total,
            self.config.workers,
            self.model_name()
        );

        let mut slots: Vec<Option<PageResult>> = vec![None; total];
        let mut completed = Box::pin(self.dispatch(tasks, total));
        while let Some(result) = completed.next().await {
            match slots.get_mut(result.index) {
                Some(slot) => *slot = Some(result),
                None => warn!("Dropping result for out-of-range page {}", result.index + 1),
            }
        }

        let results: Vec<PageResult> = slots
            .into_iter()
            .enumerate()
            .map(|(index, slot)| {
                slot.unwrap_or_else(|| {
                    PageResult::failure(
                        index,
                        PageError::Worker {
                            index,
                            detail: "no result recorded".into(),
                        },
                        0,
                        0,
                    )
                })
            })
            .collect();

        let succeeded = results.iter().filter(|r| r.is_success()).count();
        info!(
            "Job {}: {}/{} pages described",
            JobState::Completed,
            succeeded,
            total
        );
        if let Some(cb) = &self.config.progress_callback {
            cb.on_job_complete(total, succeeded);
        }
        results
    }

    /// Decompose `document`, describe every page and merge the sections.
    ///
    /// # Errors
    /// Only decomposition failures. Page failures are reported in the
    /// output's pages and stats.
    pub async fn run_document(
        &self,
        document: &dyn DocumentSource,
    ) -> Result<ExtractionOutput, VisionError> {
        let start = Instant::now();
        let name = document.name();
        let sources = document.pages()?;
        info!("Job {}: '{}' has {} pages", JobState::Decomposed, name, sources.len());

        let pages = self.run(sources, None).await;
        let stats = ExtractionStats::from_pages(&pages, start.elapsed().as_millis() as u64);
        let merged = merge::merge(&name, &pages, &self.config, Some(&stats));
        info!(
            "Job {}: '{}', {} bytes, {}ms",
            JobState::Merged,
            name,
            merged.len(),
            stats.total_duration_ms
        );

        Ok(ExtractionOutput {
            document: merged,
            pages,
            stats,
            model: self.model_name(),
        })
    }

    /// Results in completion order; at most `workers` pages in flight.
    pub(crate) fn dispatch(
        &self,
        tasks: Vec<PageTask>,
        total: usize,
    ) -> impl Stream<Item = PageResult> + Send + 'static {
        let worker = PageWorker {
            model: Arc::clone(&self.model),
            options: self.options.clone(),
            clean_output: self.config.clean_output,
            progress: self.config.progress_callback.clone(),
            benchmark: self.config.benchmark.clone(),
            cancel: self.cancel.clone(),
            total,
        };
        stream::iter(tasks)
            .map(move |task| worker.clone().dispatch(task))
            .buffer_unordered(self.config.workers.max(1))
    }
}
