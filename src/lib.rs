//! # docvision
//!
//! Describe document page images with vision models and merge the
//! descriptions into one Markdown document.
//!
//! A document is split into ordered page images (a directory of scans or
//! slide exports, or an explicit list). Each page goes to a vision backend
//! (OpenAI, Anthropic Claude or a local Ollama), transient failures are
//! retried with backoff, and the descriptions are merged back in page order.
//! A page that fails is marked inline; it never sinks the whole document.
//!
//! ## Pipeline Overview
//!
//! ```text
//! document
//!  │
//!  ├─ 1. Decompose  DocumentSource → ordered PageSource list
//!  ├─ 2. Dispatch   bounded pool of Tokio tasks (default 4)
//!  ├─ 3. Describe   VisionModel::describe_image, wrapped in RetryManager
//!  ├─ 4. Clean      deterministic post-processing of each reply
//!  └─ 5. Merge      "# name" + "## Page N" sections, in index order
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use docvision::{extract, ExtractionConfig, ImageDirectory};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Backend auto-selected from OPENAI_API_KEY / ANTHROPIC_API_KEY / Ollama
//!     let config = ExtractionConfig::from_env()?;
//!     let output = extract(&ImageDirectory::new("slides/"), &config).await?;
//!     println!("{}", output.document);
//!     eprintln!(
//!         "{}/{} pages described",
//!         output.stats.succeeded_pages, output.stats.total_pages
//!     );
//!     Ok(())
//! }
//! ```
//!
//! ## Describing a single image
//!
//! ```rust,no_run
//! use docvision::{DescribeOptions, ModelConfig, ModelRegistry, VisionModel};
//! use std::path::Path;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let model = ModelRegistry::with_builtin().create("claude", &ModelConfig::default())?;
//! let text = model
//!     .describe_image(Path::new("chart.png"), Some("What does this chart show?"), &DescribeOptions::default())
//!     .await?;
//! println!("{text}");
//! # Ok(())
//! # }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `docvision` binary (clap + anyhow + tracing-subscriber + indicatif) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! docvision = { version = "0.3", default-features = false }
//! ```
//!
//! ## Backends
//!
//! | Name | Aliases | Credentials | Default model |
//! |------|---------|-------------|---------------|
//! | `openai` | `gpt4`, `gpt-4o` | `OPENAI_API_KEY` | `gpt-4o-mini` |
//! | `claude` | `anthropic` | `ANTHROPIC_API_KEY` | `claude-3-5-sonnet-20241022` |
//! | `ollama` | `llama` | none (`OLLAMA_HOST`) | `llama3.2-vision` |

// ── Modules ──────────────────────────────────────────────────────────────

pub mod benchmark;
pub mod config;
pub mod error;
pub mod extract;
pub mod model;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod retry;
pub mod stream;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use benchmark::{BenchmarkEntry, BenchmarkLogger, BenchmarkMetrics, BenchmarkSink};
pub use config::{
    EnvSource, ErrorMarker, ExtractionConfig, ModelConfig, ModelConfigBuilder, PageHeading,
    PipelineConfig, PipelineConfigBuilder,
};
pub use error::{BackendError, Classify, ErrorClass, PageError, VisionError};
pub use extract::{extract, extract_sync, extract_to_file, extract_with, resolve_model};
pub use model::{DescribeOptions, ImageData, ImageDetail, ModelRegistry, VisionModel};
pub use output::{ExtractionOutput, ExtractionStats, PageResult};
pub use pipeline::{
    CancelHandle, DocumentSource, ImageDirectory, ImageList, JobState, PageSource, PageTask,
    Pipeline,
};
pub use progress::{NoopProgressCallback, PageProgressCallback, ProgressCallback};
pub use prompts::PromptKind;
pub use retry::{RetryError, RetryManager, RetryPolicy, RetryStrategy};
pub use stream::{extract_stream, run_stream, PageStream};
