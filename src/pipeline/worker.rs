//! One page through the model: dispatch, describe, report.
//!
//! Every task ends in a [`PageResult`]. Errors are recorded against the
//! page's index instead of propagating, so one bad page never aborts the
//! document. The describe call runs on its own Tokio task; a panic there
//! is caught at the join and becomes [`PageError::Worker`].

use super::postprocess::clean_description;
use super::source::PageTask;
use crate::benchmark::{BenchmarkEntry, BenchmarkMetrics, BenchmarkSink};
use crate::error::PageError;
use crate::model::{DescribeOptions, VisionModel};
use crate::output::PageResult;
use crate::progress::ProgressCallback;
use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinError;
use tracing::{debug, warn};

/// Stops further dispatch. Pages already running finish normally.
///
/// Cheap to clone; all clones share one flag.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    cancelled: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Everything a page task needs, shared by all tasks of one run.
#[derive(Clone)]
pub(crate) struct PageWorker {
    pub model: Arc<dyn VisionModel>,
    pub options: DescribeOptions,
    pub clean_output: bool,
    pub progress: Option<ProgressCallback>,
    pub benchmark: Option<Arc<dyn BenchmarkSink>>,
    pub cancel: CancelHandle,
    pub total: usize,
}

impl PageWorker {
    /// Run `task` to a terminal [`PageResult`].
    ///
    /// Called when the pool has a free slot, so the cancellation check here
    /// happens at dispatch time.
    pub async fn dispatch(self, task: PageTask) -> PageResult {
        let index = task.index;
        if self.cancel.is_cancelled() {
            debug!("Page {}: cancelled before dispatch", index + 1);
            let result = PageResult::failure(index, PageError::Cancelled { index }, 0, 0);
            self.report(&result);
            return result;
        }

        if let Some(cb) = &self.progress {
            cb.on_page_start(index, self.total);
        }
        let file_type = task.source.file_type();
        let start = Instant::now();

        let handle = tokio::spawn(process_page(
            Arc::clone(&self.model),
            task,
            self.options.clone(),
            self.clean_output,
        ));
        let result = match handle.await {
            Ok(result) => result,
            Err(e) => {
                let detail = join_error_detail(e);
                warn!("Page {}: worker failed: {}", index + 1, detail);
                PageResult::failure(
                    index,
                    PageError::Worker { index, detail },
                    start.elapsed().as_millis() as u64,
                    0,
                )
            }
        };

        self.report(&result);
        self.record_benchmark(&file_type, &result).await;
        result
    }

    fn report(&self, result: &PageResult) {
        let Some(cb) = &self.progress else { return };
        match &result.outcome {
            Ok(text) => cb.on_page_complete(result.index, self.total, text.len()),
            Err(e) => cb.on_page_error(result.index, self.total, &e.to_string()),
        }
    }

    /// Sinks do blocking file I/O, so the entry is written off the runtime.
    async fn record_benchmark(&self, file_type: &str, result: &PageResult) {
        let Some(sink) = &self.benchmark else { return };
        let output_size = result.text().map(str::len).unwrap_or(0);
        let metrics = BenchmarkMetrics::api(0.0, result.duration_ms as f64 / 1000.0, output_size);
        let method = format!("describe_image:{}", self.model.provider());
        let entry = BenchmarkEntry::new(file_type, method, metrics);
        let sink = Arc::clone(sink);

        let outcome = tokio::task::spawn_blocking(move || sink.record(entry)).await;
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Page {}: benchmark entry not recorded: {}", result.index + 1, e),
            Err(e) => warn!(
                "Page {}: benchmark task failed: {}",
                result.index + 1,
                join_error_detail(e)
            ),
        }
    }
}

/// Describe one page image and package the outcome.
pub(crate) async fn process_page(
    model: Arc<dyn VisionModel>,
    task: PageTask,
    options: DescribeOptions,
    clean_output: bool,
) -> PageResult {
    let start = Instant::now();
    let index = task.index;
    let outcome = model
        .describe_image_counted(&task.source.path, task.prompt.as_deref(), &options)
        .await;
    let duration_ms = start.elapsed().as_millis() as u64;

    match outcome {
        Ok((text, attempts)) => {
            let text = if clean_output {
                clean_description(&text)
            } else {
                text
            };
            debug!(
                "Page {}: {} chars from {} in {}ms ({} attempts)",
                index + 1,
                text.len(),
                task.model_name,
                duration_ms,
                attempts
            );
            PageResult::success(index, text, duration_ms, attempts)
        }
        Err(e) => {
            let attempts = e.attempts();
            let error = e.into_page_error(index);
            warn!("{}", error);
            PageResult::failure(index, error, duration_ms, attempts)
        }
    }
}

fn join_error_detail(err: JoinError) -> String {
    if err.is_cancelled() {
        return "task was cancelled".to_string();
    }
    match err.try_into_panic() {
        Ok(payload) => format!("panicked: {}", panic_message(payload.as_ref())),
        Err(err) => err.to_string(),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
