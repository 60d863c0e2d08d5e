//! Progress-callback trait for per-page pipeline events.
//!
//! Inject an [`Arc<dyn PageProgressCallback>`] via
//! [`crate::config::PipelineConfigBuilder::progress_callback`] to receive
//! events as the pipeline processes each page.
//!
//! Pages run concurrently, so implementations must be `Send + Sync`.
//!
//! # Example
//!
//! ```rust
//! use docvision::{PageProgressCallback, PipelineConfig};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct CountingCallback {
//!     completed: AtomicUsize,
//! }
//!
//! impl PageProgressCallback for CountingCallback {
//!     fn on_page_complete(&self, index: usize, total: usize, text_len: usize) {
//!         let done = self.completed.fetch_add(1, Ordering::SeqCst) + 1;
//!         eprintln!("{done}/{total} done (page {}, {text_len} bytes)", index + 1);
//!     }
//! }
//!
//! let config = PipelineConfig::builder()
//!     .progress_callback(Arc::new(CountingCallback { completed: AtomicUsize::new(0) }))
//!     .build()
//!     .unwrap();
//! ```

use std::sync::Arc;

/// Called by the pipeline as it processes each page.
///
/// All methods have default no-op implementations so callers only override
/// what they care about. Page indices are 0-based.
///
/// # Thread safety
///
/// `on_page_start`, `on_page_complete` and `on_page_error` may be called
/// concurrently from different worker tasks. Protect shared mutable state
/// with `Mutex` or atomics.
pub trait PageProgressCallback: Send + Sync {
    /// Called once after decomposition, before any page is dispatched.
    fn on_job_start(&self, total_pages: usize) {
        let _ = total_pages;
    }

    /// Called just before a page's first backend attempt.
    fn on_page_start(&self, index: usize, total_pages: usize) {
        let _ = (index, total_pages);
    }

    /// Called when a page produced a description.
    ///
    /// `text_len` is the byte length of the (cleaned) description.
    fn on_page_complete(&self, index: usize, total_pages: usize, text_len: usize) {
        let _ = (index, total_pages, text_len);
    }

    /// Called when a page failed (fatal error, exhausted retries, bad input,
    /// worker panic or cancellation).
    fn on_page_error(&self, index: usize, total_pages: usize, error: &str) {
        let _ = (index, total_pages, error);
    }

    /// Called once after every page reached a terminal state.
    fn on_job_complete(&self, total_pages: usize, success_count: usize) {
        let _ = (total_pages, success_count);
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgressCallback;

impl PageProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::PipelineConfig`].
pub type ProgressCallback = Arc<dyn PageProgressCallback>;
