//! Result types produced by the pipeline.
//!
//! A [`PageResult`] is produced for every page, successful or not, so a
//! job's results always line up one-to-one with its pages. The whole-job
//! [`ExtractionOutput`] adds the merged document and [`ExtractionStats`].

use crate::error::PageError;
use serde::{Deserialize, Serialize};

/// Outcome of one page.
///
/// Exactly one of text or error is present: `outcome` is a `Result`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageResult {
    /// 0-based position in the document; defines merge order.
    pub index: usize,
    pub outcome: Result<String, PageError>,
    /// Wall-clock time spent on this page, retries included.
    pub duration_ms: u64,
    /// Backend attempts made (0 if the page never reached the backend).
    pub attempts: u32,
}

impl PageResult {
    pub fn success(index: usize, text: String, duration_ms: u64, attempts: u32) -> Self {
        Self {
            index,
            outcome: Ok(text),
            duration_ms,
            attempts,
        }
    }

    pub fn failure(index: usize, error: PageError, duration_ms: u64, attempts: u32) -> Self {
        Self {
            index,
            outcome: Err(error),
            duration_ms,
            attempts,
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    /// The description, if the page succeeded.
    pub fn text(&self) -> Option<&str> {
        self.outcome.as_deref().ok()
    }

    /// The error, if the page failed.
    pub fn error(&self) -> Option<&PageError> {
        self.outcome.as_ref().err()
    }
}

/// Aggregate numbers for a finished job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionStats {
    pub total_pages: usize,
    pub succeeded_pages: usize,
    pub failed_pages: usize,
    /// Subset of `failed_pages` that were never dispatched.
    pub cancelled_pages: usize,
    /// Backend attempts across all pages.
    pub total_attempts: u64,
    pub total_duration_ms: u64,
}

impl ExtractionStats {
    pub fn from_pages(pages: &[PageResult], total_duration_ms: u64) -> Self {
        let succeeded = pages.iter().filter(|p| p.is_success()).count();
        let cancelled = pages
            .iter()
            .filter(|p| matches!(p.error(), Some(PageError::Cancelled { .. })))
            .count();
        Self {
            total_pages: pages.len(),
            succeeded_pages: succeeded,
            failed_pages: pages.len() - succeeded,
            cancelled_pages: cancelled,
            total_attempts: pages.iter().map(|p| u64::from(p.attempts)).sum(),
            total_duration_ms,
        }
    }
}

/// Output of a whole extraction job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionOutput {
    /// Merged document: one section per page, in page order.
    pub document: String,
    /// Per-page results, sorted by index.
    pub pages: Vec<PageResult>,
    pub stats: ExtractionStats,
    /// Backend and model that produced the descriptions, e.g. "openai/gpt-4o-mini".
    pub model: String,
}
