//! Prompts sent with every image.
//!
//! Callers override the default per model ([`crate::config::ModelConfig::prompt`]),
//! per job ([`crate::config::PipelineConfig::prompt`]) or per call
//! (`describe_image(path, Some(prompt), ..)`).

use crate::error::VisionError;
use std::fmt;
use std::str::FromStr;

/// Prompt used when nothing more specific is configured.
pub const DEFAULT_PROMPT: &str = "Describe this image in detail. \
Preserve as much of the precise original text, format, images and style as possible. \
Reproduce any visible text verbatim, keep tables as tables, and describe charts, \
diagrams and photos by their content. Output only the description.";

/// Document genres with a tuned prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PromptKind {
    /// Code snippets, commands, architecture diagrams.
    Technical,
    /// Metrics, financial figures, trends.
    Business,
    /// Methodology, findings, figures, citations.
    Academic,
    /// Chart type, axes, data points.
    Chart,
    /// Headers and every cell, structure preserved.
    Table,
}

impl PromptKind {
    pub const ALL: [PromptKind; 5] = [
        PromptKind::Technical,
        PromptKind::Business,
        PromptKind::Academic,
        PromptKind::Chart,
        PromptKind::Table,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PromptKind::Technical => "technical",
            PromptKind::Business => "business",
            PromptKind::Academic => "academic",
            PromptKind::Chart => "chart",
            PromptKind::Table => "table",
        }
    }
}

impl fmt::Display for PromptKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PromptKind {
    type Err = VisionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        PromptKind::ALL
            .into_iter()
            .find(|k| k.as_str() == wanted)
            .ok_or_else(|| {
                VisionError::InvalidConfig(format!(
                    "Unknown prompt kind '{s}' (expected one of: technical, business, academic, chart, table)"
                ))
            })
    }
}

/// The tuned prompt for `kind`.
pub fn specialized(kind: PromptKind) -> &'static str {
    match kind {
        PromptKind::Technical => {
            "Extract all code snippets, technical terms, and command examples. \
For diagrams, describe the technical architecture and components shown."
        }
        PromptKind::Business => {
            "Extract key business metrics, financial figures, and trends. \
For charts, provide detailed analysis of the data presented."
        }
        PromptKind::Academic => {
            "Extract research methodology, key findings, and citations. \
For figures, describe the experimental setup and results shown."
        }
        PromptKind::Chart => {
            "Analyze the chart type, axes labels, and data trends. \
Provide key insights and numerical values where visible."
        }
        PromptKind::Table => {
            "Extract table headers and all cell contents precisely. \
Maintain the tabular structure in the description."
        }
    }
}

/// Join several tuned prompts for mixed-content pages.
///
/// Each part is labelled with what it applies to; duplicates are dropped.
pub fn combined(kinds: &[PromptKind]) -> String {
    let mut seen = Vec::with_capacity(kinds.len());
    for kind in kinds {
        if !seen.contains(kind) {
            seen.push(*kind);
        }
    }
    if seen.is_empty() {
        return DEFAULT_PROMPT.to_string();
    }
    seen.iter()
        .map(|k| format!("For {} content: {}", k, specialized(*k)))
        .collect::<Vec<_>>()
        .join("\n")
}
