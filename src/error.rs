//! Error types for the docvision library.
//!
//! Three error types reflect three distinct failure modes:
//!
//! * [`BackendError`]: what a single backend request can fail with, already
//!   mapped from the backend's native vocabulary (HTTP status, error body,
//!   transport error). Every variant is classified [`ErrorClass::Retryable`]
//!   or [`ErrorClass::Fatal`]; the [`crate::retry::RetryManager`] consumes
//!   that classification.
//!
//! * [`VisionError`]: **Fatal** for the caller: configuration problems,
//!   unknown models, unreadable images, a backend that rejected the request,
//!   or retries that ran out. Returned as `Err(VisionError)` from the model,
//!   registry and top-level `extract*` functions.
//!
//! * [`PageError`]: **Non-fatal**: a single page failed but the other pages
//!   are fine. Stored inside [`crate::output::PageResult`] so a job with a
//!   bad page still produces a complete document.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Whether a failed attempt is worth repeating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Transient: rate limit, 5xx, network, overload, timeout, empty reply.
    Retryable,
    /// Permanent: bad credentials, malformed request, exhausted quota.
    Fatal,
}

/// An error the retry loop knows how to classify.
///
/// Implemented by [`BackendError`]; callers wrapping their own flaky
/// operations with [`crate::retry::RetryManager`] implement it for their
/// error type.
pub trait Classify {
    /// Retryable or fatal.
    fn class(&self) -> ErrorClass;

    /// Short machine-readable name, reported in each attempt outcome.
    fn kind(&self) -> &'static str;

    /// Server-suggested wait before the next attempt, if the backend sent one.
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

/// Failure of one backend request, in the shared taxonomy.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BackendError {
    // ── Retryable ─────────────────────────────────────────────────────────
    /// HTTP 429 or an equivalent throttle signal.
    #[error("{provider}: rate limit exceeded: {message}")]
    RateLimited {
        provider: String,
        message: String,
        retry_after: Option<Duration>,
    },

    /// 5xx that is not an explicit overload.
    #[error("{provider}: server error (HTTP {status}): {message}")]
    ServerError {
        provider: String,
        status: u16,
        message: String,
    },

    /// Explicit "overloaded" signal (Anthropic 529, `overloaded_error`).
    #[error("{provider}: service overloaded: {message}")]
    Overloaded { provider: String, message: String },

    /// Connection refused, DNS failure, reset, TLS handshake, …
    #[error("{provider}: network error: {message}")]
    Network { provider: String, message: String },

    /// The request exceeded the configured per-call timeout.
    #[error("{provider}: request timed out after {secs}s")]
    Timeout { provider: String, secs: u64 },

    /// The backend answered but the description was empty or whitespace.
    #[error("{provider}: no description generated (empty response)")]
    EmptyResponse { provider: String },

    /// The response body could not be decoded.
    #[error("{provider}: malformed response: {detail}")]
    MalformedResponse { provider: String, detail: String },

    // ── Fatal ─────────────────────────────────────────────────────────────
    /// 401/403: the key is missing, wrong, or lacks permission.
    #[error("{provider}: authentication failed: {message}")]
    Authentication { provider: String, message: String },

    /// 4xx validation failure; retrying the same payload cannot succeed.
    #[error("{provider}: invalid request (HTTP {status}): {message}")]
    InvalidRequest {
        provider: String,
        status: u16,
        message: String,
    },

    /// The account has no quota left.
    #[error("{provider}: quota exhausted: {message}")]
    QuotaExhausted { provider: String, message: String },
}

impl BackendError {
    /// The backend that produced this error.
    pub fn provider(&self) -> &str {
        match self {
            BackendError::RateLimited { provider, .. }
            | BackendError::ServerError { provider, .. }
            | BackendError::Overloaded { provider, .. }
            | BackendError::Network { provider, .. }
            | BackendError::Timeout { provider, .. }
            | BackendError::EmptyResponse { provider }
            | BackendError::MalformedResponse { provider, .. }
            | BackendError::Authentication { provider, .. }
            | BackendError::InvalidRequest { provider, .. }
            | BackendError::QuotaExhausted { provider, .. } => provider,
        }
    }

    /// Shorthand for [`Classify::class`] `== Retryable`.
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Retryable
    }
}

impl Classify for BackendError {
    fn class(&self) -> ErrorClass {
        match self {
            BackendError::RateLimited { .. }
            | BackendError::ServerError { .. }
            | BackendError::Overloaded { .. }
            | BackendError::Network { .. }
            | BackendError::Timeout { .. }
            | BackendError::EmptyResponse { .. }
            | BackendError::MalformedResponse { .. } => ErrorClass::Retryable,
            BackendError::Authentication { .. }
            | BackendError::InvalidRequest { .. }
            | BackendError::QuotaExhausted { .. } => ErrorClass::Fatal,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            BackendError::RateLimited { .. } => "rate_limited",
            BackendError::ServerError { .. } => "server_error",
            BackendError::Overloaded { .. } => "overloaded",
            BackendError::Network { .. } => "network",
            BackendError::Timeout { .. } => "timeout",
            BackendError::EmptyResponse { .. } => "empty_response",
            BackendError::MalformedResponse { .. } => "malformed_response",
            BackendError::Authentication { .. } => "authentication",
            BackendError::InvalidRequest { .. } => "invalid_request",
            BackendError::QuotaExhausted { .. } => "quota_exhausted",
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            BackendError::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// All fatal errors returned by the docvision library.
///
/// Page-level failures use [`PageError`] and are stored in
/// [`crate::output::PageResult`] rather than propagated here.
#[derive(Debug, Error)]
pub enum VisionError {
    // ── Config errors ─────────────────────────────────────────────────────
    /// A backend is missing credentials or has invalid parameters.
    #[error("Vision model '{model}' is not configured: {reason}")]
    Configuration { model: String, reason: String },

    /// Builder or environment validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Registry errors ───────────────────────────────────────────────────
    /// The requested logical model name is not registered.
    #[error("Unsupported model type: '{name}'. Available models: {}", .available.join(", "))]
    UnsupportedModel {
        name: String,
        available: Vec<String>,
    },

    /// Auto-selection found no backend whose configuration validates.
    #[error(
        "No vision model available.\nTried: {}\n\
Set OPENAI_API_KEY or ANTHROPIC_API_KEY, or point OLLAMA_HOST at a running Ollama.",
        .tried.join("; ")
    )]
    NoAvailableModel { tried: Vec<String> },

    // ── Input errors ──────────────────────────────────────────────────────
    /// The image path does not resolve to a readable file.
    #[error("Image file not found: '{path}'")]
    FileNotFound { path: PathBuf },

    /// The file exists but cannot be decoded as an image.
    #[error("File '{path}' is not a valid image: {detail}")]
    InvalidImage { path: PathBuf, detail: String },

    // ── Backend errors ────────────────────────────────────────────────────
    /// The backend rejected the request with a fatal error; not retried.
    #[error("Backend rejected the request: {0}")]
    Backend(BackendError),

    /// Every attempt failed with a retryable error.
    #[error("Gave up after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: BackendError,
    },

    // ── Job errors ────────────────────────────────────────────────────────
    /// The document could not be split into pages at all.
    #[error("Could not split '{document}' into pages: {detail}")]
    Decomposition { document: String, detail: String },

    /// Could not create or write the output file.
    #[error("Failed to write output file '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Could not read a file the crate produced earlier, such as a benchmark log.
    #[error("Failed to read file '{path}': {source}")]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl VisionError {
    /// The underlying backend error, if this failure came from a backend.
    pub fn backend_error(&self) -> Option<&BackendError> {
        match self {
            VisionError::Backend(e) | VisionError::RetriesExhausted { last: e, .. } => Some(e),
            _ => None,
        }
    }

    /// Number of backend attempts made before this error surfaced.
    pub fn attempts(&self) -> u32 {
        match self {
            VisionError::Backend(_) => 1,
            VisionError::RetriesExhausted { attempts, .. } => *attempts,
            _ => 0,
        }
    }

    /// Convert into the non-fatal per-page form.
    pub fn into_page_error(self, index: usize) -> PageError {
        match self {
            VisionError::FileNotFound { .. } | VisionError::InvalidImage { .. } => {
                PageError::Input {
                    index,
                    detail: self.to_string(),
                }
            }
            VisionError::Backend(e) => PageError::Backend {
                index,
                kind: e.kind().to_string(),
                detail: e.to_string(),
            },
            VisionError::RetriesExhausted { attempts, last } => PageError::RetriesExhausted {
                index,
                attempts,
                kind: last.kind().to_string(),
                detail: last.to_string(),
            },
            other => PageError::Worker {
                index,
                detail: other.to_string(),
            },
        }
    }
}

/// A non-fatal error for a single page.
///
/// Stored alongside [`crate::output::PageResult`] when a page fails. The
/// job continues and the merged output carries an inline marker instead of
/// the page's description.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum PageError {
    /// The page image was missing or not decodable.
    #[error("Page {}: {detail}", .index + 1)]
    Input { index: usize, detail: String },

    /// The backend rejected the request.
    #[error("Page {}: backend rejected request ({kind}): {detail}", .index + 1)]
    Backend {
        index: usize,
        kind: String,
        detail: String,
    },

    /// Transient failures persisted through every attempt.
    #[error("Page {}: gave up after {attempts} attempts ({kind}): {detail}", .index + 1)]
    RetriesExhausted {
        index: usize,
        attempts: u32,
        kind: String,
        detail: String,
    },

    /// The worker itself failed (panic or unexpected error).
    #[error("Page {}: worker failed: {detail}", .index + 1)]
    Worker { index: usize, detail: String },

    /// The job was cancelled before this page was dispatched.
    #[error("Page {}: cancelled before dispatch", .index + 1)]
    Cancelled { index: usize },
}

impl PageError {
    /// Zero-based index of the page this error belongs to.
    pub fn index(&self) -> usize {
        match self {
            PageError::Input { index, .. }
            | PageError::Backend { index, .. }
            | PageError::RetriesExhausted { index, .. }
            | PageError::Worker { index, .. }
            | PageError::Cancelled { index } => *index,
        }
    }
}
