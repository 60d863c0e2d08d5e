//! CLI binary for docvision.
//!
//! A thin shim over the library crate that maps CLI flags onto
//! `ExtractionConfig` and prints results.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use docvision::{
    extract, extract_to_file, prompts, BenchmarkEntry, BenchmarkLogger, BenchmarkMetrics,
    BenchmarkSink, DescribeOptions, DocumentSource, ErrorMarker, ExtractionConfig,
    ImageDirectory, ImageList, ModelRegistry, PageHeading, PageProgressCallback, PromptKind,
    RetryStrategy, VisionModel,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers ──────────────────────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Live progress bar plus one log line per finished page. Pages may finish
/// out of order.
struct CliProgressCallback {
    bar: ProgressBar,
    start_times: Mutex<HashMap<usize, Instant>>,
    errors: AtomicUsize,
}

impl CliProgressCallback {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        let spinner_style = ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(TICKS);
        bar.set_style(spinner_style);
        bar.set_prefix("Preparing");
        bar.set_message("Listing pages…");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self {
            bar,
            start_times: Mutex::new(HashMap::new()),
            errors: AtomicUsize::new(0),
        })
    }

    fn elapsed_secs(&self, index: usize) -> f64 {
        self.start_times
            .lock()
            .ok()
            .and_then(|mut m| m.remove(&index))
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0)
    }
}

impl PageProgressCallback for CliProgressCallback {
    fn on_job_start(&self, total_pages: usize) {
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>3}/{len} pages  \
             ⏱ {elapsed_precise}  ETA {eta_precise}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(TICKS);

        self.bar.set_length(total_pages as u64);
        self.bar.set_style(style);
        self.bar.set_prefix("Describing");
        self.bar.reset_eta();
        self.bar.println(format!(
            "{} {}",
            cyan("◆"),
            bold(&format!("Describing {total_pages} pages…"))
        ));
    }

    fn on_page_start(&self, index: usize, _total_pages: usize) {
        if let Ok(mut m) = self.start_times.lock() {
            m.insert(index, Instant::now());
        }
        self.bar.set_message(format!("page {}", index + 1));
    }

    fn on_page_complete(&self, index: usize, total_pages: usize, text_len: usize) {
        let secs = self.elapsed_secs(index);
        self.bar.println(format!(
            "  {} Page {:>3}/{:<3}  {:<8}  {}",
            green("✓"),
            index + 1,
            total_pages,
            dim(&format!("{text_len:>5} chars")),
            dim(&format!("{secs:.1}s")),
        ));
        self.bar.inc(1);
    }

    fn on_page_error(&self, index: usize, total_pages: usize, error: &str) {
        let secs = self.elapsed_secs(index);
        self.errors.fetch_add(1, Ordering::SeqCst);

        let msg = if error.chars().count() > 80 {
            format!("{}…", error.chars().take(79).collect::<String>())
        } else {
            error.to_string()
        };
        self.bar.println(format!(
            "  {} Page {:>3}/{:<3}  {}  {}",
            red("✗"),
            index + 1,
            total_pages,
            red(&msg),
            dim(&format!("{secs:.1}s")),
        ));
        self.bar.inc(1);
    }

    fn on_job_complete(&self, total_pages: usize, success_count: usize) {
        let failed = total_pages.saturating_sub(success_count);
        self.bar.finish_and_clear();
        if failed == 0 {
            eprintln!(
                "{} {} pages described",
                green("✔"),
                bold(&success_count.to_string())
            );
        } else {
            eprintln!(
                "{} {}/{} pages described  ({} failed)",
                if failed == total_pages { red("✘") } else { cyan("⚠") },
                bold(&success_count.to_string()),
                total_pages,
                red(&failed.to_string()),
            );
        }
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Describe one image with the first available backend
  docvision describe chart.png

  # Use Claude with a chart-tuned prompt
  docvision describe --model claude --prompt-kind chart revenue.png

  # Describe every slide image in a directory, write Markdown
  docvision extract slides/ -o deck.md --slides

  # Explicit page list, local Ollama, 2 workers
  docvision extract --model ollama --workers 2 p1.png p2.png p3.png

  # Which backends are configured?
  docvision models

BACKENDS:
  Name     Aliases          Credentials          Default model
  ───────  ───────────────  ───────────────────  ──────────────────────────
  openai   gpt4, gpt-4o     OPENAI_API_KEY       gpt-4o-mini
  claude   anthropic        ANTHROPIC_API_KEY    claude-3-5-sonnet-20241022
  ollama   llama            none (OLLAMA_HOST)   llama3.2-vision

ENVIRONMENT VARIABLES:
  OPENAI_API_KEY, OPENAI_BASE_URL          OpenAI credentials / endpoint
  ANTHROPIC_API_KEY, ANTHROPIC_BASE_URL    Anthropic credentials / endpoint
  OLLAMA_HOST                              Ollama endpoint (default http://localhost:11434)
  DOCVISION_MODEL                          Backend name or alias
  DOCVISION_WORKERS                        Concurrent pages (default 4)
  DOCVISION_PROMPT                         Prompt for every page
  DOCVISION_RETRY_STRATEGY                 exponential | linear | constant
  DOCVISION_RETRY_MAX_ATTEMPTS             Attempts per request (default 3)
  DOCVISION_RETRY_BASE_DELAY_MS            Base backoff delay (default 1000)
  DOCVISION_RETRY_MAX_DELAY_MS             Backoff cap (default 30000)
  DOCVISION_TIMEOUT_SECS                   Per-request timeout (default 60)
  DOCVISION_BENCHMARK_LOG                  Append benchmark JSON lines here

A .env file in the working directory is loaded first.
"#;

/// Describe images and document pages with vision language models.
#[derive(Parser, Debug)]
#[command(
    name = "docvision",
    version,
    about = "Describe images and document pages with vision language models",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, global = true, env = "DOCVISION_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, global = true, env = "DOCVISION_QUIET")]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Describe a single image.
    Describe {
        /// Image file (png or jpeg).
        image: PathBuf,

        #[command(flatten)]
        model: ModelArgs,

        /// Print a JSON object instead of plain text.
        #[arg(long)]
        json: bool,
    },

    /// Describe every page of a document and merge the descriptions.
    Extract {
        /// A directory of page images, or one or more image files in page order.
        #[arg(required = true)]
        inputs: Vec<PathBuf>,

        /// Write the merged document to this file instead of stdout.
        #[arg(short, long, env = "DOCVISION_OUTPUT")]
        output: Option<PathBuf>,

        /// Title for the merged document (default: directory or first file name).
        #[arg(long)]
        title: Option<String>,

        #[command(flatten)]
        model: ModelArgs,

        /// Number of pages described concurrently.
        #[arg(short, long)]
        workers: Option<usize>,

        /// Head sections "## Slide N" instead of "## Page N".
        #[arg(long, conflicts_with = "no_headings")]
        slides: bool,

        /// Separate sections by a blank line only.
        #[arg(long)]
        no_headings: bool,

        /// Omit the "# title" line.
        #[arg(long)]
        no_title: bool,

        /// Mark failed pages with an HTML comment instead of a blockquote.
        #[arg(long)]
        comment_markers: bool,

        /// Append a statistics footer.
        #[arg(long)]
        stats_footer: bool,

        /// Keep model replies exactly as returned.
        #[arg(long)]
        raw: bool,

        /// Output structured JSON (ExtractionOutput) instead of Markdown.
        #[arg(long)]
        json: bool,

        /// Disable the progress bar.
        #[arg(long, env = "DOCVISION_NO_PROGRESS")]
        no_progress: bool,
    },

    /// List backends, their aliases and whether they are configured.
    Models,
}

/// Backend and request flags shared by `describe` and `extract`.
#[derive(Args, Debug, Clone)]
struct ModelArgs {
    /// Backend name or alias: openai, claude, ollama (default: first configured).
    #[arg(short, long)]
    model: Option<String>,

    /// Model identifier sent to the backend (e.g. gpt-4o, llava).
    #[arg(long)]
    model_id: Option<String>,

    /// API key for the chosen backend; needs --model (or DOCVISION_MODEL).
    #[arg(long, hide_env_values = true)]
    api_key: Option<String>,

    /// Endpoint override (OpenAI/Anthropic base URL, Ollama host); needs --model.
    #[arg(long)]
    base_url: Option<String>,

    /// Prompt sent with every image.
    #[arg(short, long, conflicts_with = "prompt_kind")]
    prompt: Option<String>,

    /// Tuned prompt(s): technical, business, academic, chart, table.
    #[arg(long, value_delimiter = ',')]
    prompt_kind: Vec<String>,

    /// Max output tokens per image.
    #[arg(long)]
    max_tokens: Option<u32>,

    /// Sampling temperature (0.0–2.0).
    #[arg(long)]
    temperature: Option<f32>,

    /// Per-request timeout in seconds.
    #[arg(long)]
    timeout: Option<u64>,

    /// Retry backoff: exponential, linear, constant.
    #[arg(long)]
    retry_strategy: Option<String>,

    /// Attempts per request, first one included.
    #[arg(long)]
    max_attempts: Option<u32>,

    /// Base retry delay in milliseconds.
    #[arg(long)]
    retry_base_ms: Option<u64>,

    /// Maximum retry delay in milliseconds.
    #[arg(long)]
    retry_max_ms: Option<u64>,

    /// Append one benchmark JSON line per image to this file.
    #[arg(long, env = "DOCVISION_BENCHMARK_LOG")]
    benchmark_log: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The progress bar already reports per-page outcomes; keep library INFO
    // lines out of its way unless asked.
    let show_progress = match &cli.command {
        Command::Extract {
            json, no_progress, ..
        } => !cli.quiet && !no_progress && !json,
        _ => false,
    };
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    match cli.command {
        Command::Describe { image, model, json } => run_describe(image, &model, json).await,
        Command::Extract {
            inputs,
            output,
            title,
            model,
            workers,
            slides,
            no_headings,
            no_title,
            comment_markers,
            stats_footer,
            raw,
            json,
            no_progress: _,
        } => {
            let mut config = build_config(&model)?;
            let p = &mut config.pipeline;
            if let Some(n) = workers {
                p.workers = n;
            }
            p.page_heading = if no_headings {
                PageHeading::None
            } else if slides {
                PageHeading::Slide
            } else {
                PageHeading::Numbered
            };
            p.include_title = !no_title;
            p.include_stats_footer = stats_footer;
            p.clean_output = !raw;
            if comment_markers {
                p.error_marker = ErrorMarker::Comment;
            }
            if show_progress {
                p.progress_callback = Some(CliProgressCallback::new());
            }
            if let Some(path) = &model.benchmark_log {
                p.benchmark = Some(Arc::new(BenchmarkLogger::new(path)));
            }
            config.validate().context("Invalid configuration")?;

            let document = document_source(inputs, title)?;
            run_extract(document.as_ref(), output, &config, json, cli.quiet, show_progress).await
        }
        Command::Models => run_models(),
    }
}

/// Environment first (`DOCVISION_*`), then explicit flags on top.
fn build_config(args: &ModelArgs) -> Result<ExtractionConfig> {
    let mut config = ExtractionConfig::from_env().context("Invalid DOCVISION_* environment")?;

    if let Some(name) = &args.model {
        config.model_name = Some(name.clone());
    }
    let m = &mut config.model;
    if let Some(v) = &args.model_id {
        m.model = Some(v.clone());
    }
    if let Some(v) = &args.api_key {
        m.api_key = Some(v.clone());
    }
    if let Some(v) = &args.base_url {
        m.base_url = Some(v.clone());
    }
    if let Some(v) = args.max_tokens {
        anyhow::ensure!(v > 0, "--max-tokens must be ≥ 1");
        m.max_tokens = Some(v);
    }
    if let Some(v) = args.temperature {
        m.temperature = Some(v);
    }
    if let Some(v) = args.timeout {
        m.timeout_secs = v;
    }
    if let Some(v) = &args.retry_strategy {
        m.retry.strategy = v
            .parse::<RetryStrategy>()
            .context("Invalid --retry-strategy")?;
    }
    if let Some(v) = args.max_attempts {
        m.retry.max_attempts = v;
    }
    if let Some(v) = args.retry_base_ms {
        m.retry.base_delay = Duration::from_millis(v);
    }
    if let Some(v) = args.retry_max_ms {
        m.retry.max_delay = Duration::from_millis(v);
    }

    if let Some(prompt) = resolve_prompt(args)? {
        m.prompt = Some(prompt.clone());
        config.pipeline.prompt = Some(prompt);
    }

    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn resolve_prompt(args: &ModelArgs) -> Result<Option<String>> {
    if let Some(p) = &args.prompt {
        return Ok(Some(p.clone()));
    }
    if args.prompt_kind.is_empty() {
        return Ok(None);
    }
    let kinds = args
        .prompt_kind
        .iter()
        .map(|k| k.parse::<PromptKind>())
        .collect::<Result<Vec<_>, _>>()
        .context("Invalid --prompt-kind")?;
    Ok(Some(prompts::combined(&kinds)))
}

fn document_source(
    inputs: Vec<PathBuf>,
    title: Option<String>,
) -> Result<Box<dyn DocumentSource>> {
    let single_dir = match inputs.as_slice() {
        [single] if single.is_dir() => Some(single.clone()),
        _ => None,
    };

    let source: Box<dyn DocumentSource> = match (single_dir, title) {
        (Some(dir), None) => Box::new(ImageDirectory::new(dir)),
        // A title override keeps the directory's page order.
        (Some(dir), Some(title)) => {
            let pages = ImageDirectory::new(dir)
                .pages()
                .context("Failed to list page images")?;
            Box::new(ImageList::new(pages.into_iter().map(|p| p.path)).with_name(title))
        }
        (None, None) => Box::new(ImageList::new(inputs)),
        (None, Some(title)) => Box::new(ImageList::new(inputs).with_name(title)),
    };
    Ok(source)
}

async fn run_describe(image: PathBuf, args: &ModelArgs, json: bool) -> Result<()> {
    let start = Instant::now();
    let config = build_config(args)?;
    let model = docvision::resolve_model(&config).context("No usable vision model")?;

    let options = DescribeOptions {
        max_tokens: config.model.max_tokens,
        temperature: config.model.temperature,
        ..Default::default()
    };
    let text = model
        .describe_image(&image, config.model.prompt.as_deref(), &options)
        .await
        .with_context(|| format!("Failed to describe {}", image.display()))?;
    let text = docvision::pipeline::postprocess::clean_description(&text);

    if let Some(path) = &args.benchmark_log {
        let file_type = docvision::PageSource::new(&image).file_type();
        let entry = BenchmarkEntry::new(
            file_type,
            format!("describe_image:{}", model.provider()),
            BenchmarkMetrics::cli(start.elapsed().as_secs_f64(), text.len()),
        );
        BenchmarkLogger::new(path)
            .record(entry)
            .context("Failed to write benchmark entry")?;
    }

    if json {
        let value = serde_json::json!({
            "image": image.display().to_string(),
            "model": format!("{}/{}", model.provider(), model.model_id()),
            "description": text,
        });
        println!(
            "{}",
            serde_json::to_string_pretty(&value).context("Failed to serialise output")?
        );
    } else {
        println!("{text}");
    }
    Ok(())
}

async fn run_extract(
    document: &dyn DocumentSource,
    output: Option<PathBuf>,
    config: &ExtractionConfig,
    json: bool,
    quiet: bool,
    show_progress: bool,
) -> Result<()> {
    if let Some(output_path) = output {
        let stats = extract_to_file(document, &output_path, config)
            .await
            .context("Extraction failed")?;
        if !quiet {
            eprintln!(
                "{}  {}/{} pages  {}ms  →  {}",
                if stats.failed_pages == 0 { green("✔") } else { cyan("⚠") },
                stats.succeeded_pages,
                stats.total_pages,
                stats.total_duration_ms,
                bold(&output_path.display().to_string()),
            );
        }
        anyhow::ensure!(
            stats.total_pages == 0 || stats.succeeded_pages > 0,
            "All {} pages failed",
            stats.total_pages
        );
        return Ok(());
    }

    let output = extract(document, config).await.context("Extraction failed")?;
    if json {
        let json = serde_json::to_string_pretty(&output).context("Failed to serialise output")?;
        println!("{json}");
    } else {
        let stdout = io::stdout();
        let mut handle = stdout.lock();
        handle
            .write_all(output.document.as_bytes())
            .context("Failed to write to stdout")?;
    }

    let stats = &output.stats;
    if !quiet && !show_progress {
        eprintln!(
            "Described {}/{} pages in {}ms ({} backend attempts)",
            stats.succeeded_pages, stats.total_pages, stats.total_duration_ms, stats.total_attempts
        );
    } else if !quiet && !json {
        eprintln!(
            "   {} backend attempts, {}ms total",
            dim(&stats.total_attempts.to_string()),
            stats.total_duration_ms,
        );
    }
    anyhow::ensure!(
        stats.total_pages == 0 || stats.succeeded_pages > 0,
        "All {} pages failed",
        stats.total_pages
    );
    Ok(())
}

fn run_models() -> Result<()> {
    let registry = ModelRegistry::with_builtin();
    let base = ExtractionConfig::from_env().context("Invalid DOCVISION_* environment")?;
    let aliases = registry.aliases();

    for name in registry.names() {
        let alias_list: Vec<&str> = aliases
            .iter()
            .filter(|(_, target)| *target == name)
            .map(|(alias, _)| alias.as_str())
            .collect();
        let status = match registry.create(&name, &base.model) {
            Ok(model) => format!("{} {}", green("✓"), dim(model.model_id())),
            Err(e) => format!("{} {}", red("✗"), dim(&e.to_string())),
        };
        println!(
            "{:<8} {:<18} {}",
            bold(&name),
            alias_list.join(", "),
            status
        );
    }

    if let Some(default) = &base.model_name {
        println!("\nDOCVISION_MODEL = {default}");
    }
    Ok(())
}
