//! Benchmark log: one JSON line per timed operation.
//!
//! ```json
//! {"timestamp":"2026-10-19T09:12:44.120Z",
//!  "test":{"file_type":"png","method":"describe_image:openai"},
//!  "metrics":{"interface":"api","output_size":812,"setup_time":0.0,"extraction_time":2.41}}
//! ```
//!
//! The pipeline records one entry per page through the [`BenchmarkSink`]
//! trait; [`BenchmarkLogger`] is the file-backed implementation. Writers on
//! different tasks are serialised by a mutex so lines never interleave.

use crate::error::VisionError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

/// Timing and size figures for one operation.
///
/// CLI runs report a single `cli_time`; library (API) runs report
/// `setup_time` and `extraction_time` separately.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkMetrics {
    /// "cli" or "api".
    pub interface: String,
    /// Bytes of output produced. Must be ≥ 0.
    pub output_size: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cli_time: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub setup_time: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extraction_time: Option<f64>,
    /// Legacy field; folded into `cli_time` by [`BenchmarkMetrics::normalize`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_time: Option<f64>,
}

impl BenchmarkMetrics {
    /// Metrics for a library call.
    pub fn api(setup_time: f64, extraction_time: f64, output_size: usize) -> Self {
        Self {
            interface: "api".into(),
            output_size: i64::try_from(output_size).unwrap_or(i64::MAX),
            setup_time: Some(setup_time),
            extraction_time: Some(extraction_time),
            ..Default::default()
        }
    }

    /// Metrics for a whole CLI invocation.
    pub fn cli(cli_time: f64, output_size: usize) -> Self {
        Self {
            interface: "cli".into(),
            output_size: i64::try_from(output_size).unwrap_or(i64::MAX),
            cli_time: Some(cli_time),
            ..Default::default()
        }
    }

    /// Check the field combination the interface requires.
    pub fn validate(&self) -> Result<(), VisionError> {
        if self.output_size < 0 {
            return Err(VisionError::InvalidConfig(
                "output_size must be a non-negative integer".into(),
            ));
        }
        match self.interface.as_str() {
            "cli" if self.cli_time.is_none() => Err(VisionError::InvalidConfig(
                "cli_time is required for CLI interface".into(),
            )),
            "api" if self.extraction_time.is_none() => Err(VisionError::InvalidConfig(
                "extraction_time is required for API interface".into(),
            )),
            "cli" | "api" => Ok(()),
            _ => Err(VisionError::InvalidConfig(
                "interface must be either 'cli' or 'api'".into(),
            )),
        }
    }

    /// Bring legacy shapes to the current one.
    ///
    /// * CLI: `total_time` becomes `cli_time` when the latter is missing.
    /// * API: a missing `setup_time` is 0, and `cli_time` is filled with
    ///   `setup_time + extraction_time` so every entry has one comparable total.
    pub fn normalize(mut self) -> Self {
        self.interface = self.interface.trim().to_ascii_lowercase();
        match self.interface.as_str() {
            "cli" => {
                if self.cli_time.is_none() {
                    self.cli_time = self.total_time.take();
                }
            }
            "api" => {
                let setup = *self.setup_time.get_or_insert(0.0);
                if self.cli_time.is_none() {
                    self.cli_time = self
                        .extraction_time
                        .or(self.total_time)
                        .map(|extraction| setup + extraction);
                }
            }
            _ => {}
        }
        self
    }
}

/// What was measured.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BenchmarkTest {
    pub file_type: String,
    pub method: String,
}

/// One line of the benchmark log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkEntry {
    pub timestamp: DateTime<Utc>,
    pub test: BenchmarkTest,
    pub metrics: BenchmarkMetrics,
}

impl BenchmarkEntry {
    pub fn new(
        file_type: impl Into<String>,
        method: impl Into<String>,
        metrics: BenchmarkMetrics,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            test: BenchmarkTest {
                file_type: file_type.into(),
                method: method.into(),
            },
            metrics,
        }
    }
}

/// Destination for benchmark entries.
pub trait BenchmarkSink: Send + Sync {
    /// Normalise, validate and store `entry`.
    fn record(&self, entry: BenchmarkEntry) -> Result<(), VisionError>;
}

/// Appends entries as JSON lines to a file.
#[derive(Debug)]
pub struct BenchmarkLogger {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl BenchmarkLogger {
    /// Log to `path`, creating parent directories on first write.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Parse every line of a benchmark log. Blank lines are skipped.
    pub fn read_entries(path: &Path) -> Result<Vec<BenchmarkEntry>, VisionError> {
        let text = std::fs::read_to_string(path).map_err(|e| VisionError::ReadFailed {
            path: path.to_path_buf(),
            source: e,
        })?;
        text.lines()
            .filter(|l| !l.trim().is_empty())
            .enumerate()
            .map(|(n, line)| {
                serde_json::from_str::<BenchmarkEntry>(line).map_err(|e| {
                    VisionError::Internal(format!(
                        "{}: line {} is not a benchmark entry: {e}",
                        path.display(),
                        n + 1
                    ))
                })
            })
            .collect()
    }

    fn write_failed(&self, source: std::io::Error) -> VisionError {
        VisionError::OutputWriteFailed {
            path: self.path.clone(),
            source,
        }
    }
}

impl BenchmarkSink for BenchmarkLogger {
    fn record(&self, entry: BenchmarkEntry) -> Result<(), VisionError> {
        let entry = BenchmarkEntry {
            metrics: entry.metrics.normalize(),
            ..entry
        };
        entry.metrics.validate()?;

        let mut line = serde_json::to_string(&entry)
            .map_err(|e| VisionError::Internal(format!("benchmark entry: {e}")))?;
        line.push('\n');

        // A poisoned lock only means another writer panicked mid-call; the
        // file itself is still line-consistent.
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| self.write_failed(e))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| self.write_failed(e))?;
        file.write_all(line.as_bytes())
            .map_err(|e| self.write_failed(e))?;

        debug!(
            "benchmark: {} {} → {}",
            entry.test.file_type,
            entry.test.method,
            self.path.display()
        );
        Ok(())
    }
}
