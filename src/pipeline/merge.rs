//! Assemble per-page results into one document.
//!
//! ```text
//! # deck
//!
//! ## Page 1
//!
//! A title slide reading "Q3 results".
//!
//! ## Page 2
//!
//! > **Extraction failed:** Page 2: gave up after 3 attempts (server_error): …
//! ```
//!
//! Every page gets a section, failed ones included, so the merged output
//! always has exactly as many sections as the document has pages.

use crate::config::{ErrorMarker, PipelineConfig};
use crate::error::PageError;
use crate::output::{ExtractionStats, PageResult};

/// Merge `pages` in index order.
///
/// `stats` is only used when the config asks for a footer.
pub fn merge(
    title: &str,
    pages: &[PageResult],
    config: &PipelineConfig,
    stats: Option<&ExtractionStats>,
) -> String {
    let mut ordered: Vec<&PageResult> = pages.iter().collect();
    ordered.sort_by_key(|p| p.index);

    let mut parts: Vec<String> = Vec::with_capacity(ordered.len() + 2);
    if config.include_title && !title.trim().is_empty() {
        parts.push(format!("# {}", title.trim()));
    }

    for page in ordered {
        let body = match &page.outcome {
            Ok(text) => text.trim().to_string(),
            Err(err) => error_marker(&config.error_marker, err),
        };
        match config.page_heading.render(page.index) {
            Some(heading) => parts.push(format!("{heading}\n\n{body}")),
            None => parts.push(body),
        }
    }

    if config.include_stats_footer {
        if let Some(stats) = stats {
            parts.push(stats_footer(stats));
        }
    }

    let mut document = parts.join("\n\n");
    document.push('\n');
    document
}

fn error_marker(style: &ErrorMarker, err: &PageError) -> String {
    let message = err.to_string().replace(['\r', '\n'], " ");
    match style {
        ErrorMarker::Blockquote => format!("> **Extraction failed:** {message}"),
        ErrorMarker::Comment => {
            format!("<!-- Extraction failed: {} -->", message.replace("--", "- -"))
        }
    }
}

fn stats_footer(stats: &ExtractionStats) -> String {
    format!(
        "---\n\n*{}/{} pages described, {} failed, {} backend attempts, {:.1}s*",
        stats.succeeded_pages,
        stats.total_pages,
        stats.failed_pages,
        stats.total_attempts,
        stats.total_duration_ms as f64 / 1000.0
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PageHeading;

    fn pages() -> Vec<PageResult> {
        vec![
            PageResult::failure(
                1,
                PageError::RetriesExhausted {
                    index: 1,
                    attempts: 3,
                    kind: "server_error".into(),
                    detail: "HTTP 503\nupstream".into(),
                },
                10,
                3,
            ),
            PageResult::success(0, "  A title slide.  ".into(), 5, 1),
            PageResult::success(2, "A bar chart.".into(), 7, 1),
        ]
    }

    #[test]
    fn sections_follow_index_order() {
        let doc = merge("deck", &pages(), &PipelineConfig::default(), None);
        let expected = "# deck\n\n\
## Page 1\n\nA title slide.\n\n\
## Page 2\n\n> **Extraction failed:** Page 2: gave up after 3 attempts (server_error): HTTP 503 upstream\n\n\
## Page 3\n\nA bar chart.\n";
        assert_eq!(doc, expected);
    }

    #[test]
    fn slide_headings_and_comment_markers() {
        let config = PipelineConfig::builder()
            .page_heading(PageHeading::Slide)
            .error_marker(ErrorMarker::Comment)
            .include_title(false)
            .build()
            .unwrap();
        let doc = merge("deck", &pages(), &config, None);
        assert!(doc.starts_with("## Slide 1\n\nA title slide."));
        assert!(doc.contains("## Slide 2\n\n<!-- Extraction failed: Page 2:"));
        assert!(doc.contains("-->\n\n## Slide 3"));
        assert!(!doc.contains("# deck"));
    }

    #[test]
    fn comment_marker_cannot_close_early() {
        let err = PageError::Worker {
            index: 0,
            detail: "bad --> input".into(),
        };
        let marker = error_marker(&ErrorMarker::Comment, &err);
        assert_eq!(marker.matches("-->").count(), 1);
        assert!(marker.ends_with("-->"));
    }

    #[test]
    fn headingless_sections() {
        let config = PipelineConfig::builder()
            .page_heading(PageHeading::None)
            .include_title(false)
            .build()
            .unwrap();
        let only = vec![PageResult::success(0, "One.".into(), 1, 1)];
        assert_eq!(merge("x", &only, &config, None), "One.\n");
    }

    #[test]
    fn stats_footer_when_enabled() {
        let config = PipelineConfig::builder()
            .include_stats_footer(true)
            .build()
            .unwrap();
        let pages = pages();
        let stats = ExtractionStats::from_pages(&pages, 2500);
        let doc = merge("deck", &pages, &config, Some(&stats));
        assert!(doc.ends_with(
            "---\n\n*2/3 pages described, 1 failed, 5 backend attempts, 2.5s*\n"
        ));
    }

    #[test]
    fn empty_document_is_just_the_title() {
        assert_eq!(merge("deck", &[], &PipelineConfig::default(), None), "# deck\n");
    }
}
