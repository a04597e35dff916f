//! CLI binary for pdf2epub.
//!
//! A thin shim over the library crate that maps CLI flags
//! to `ConversionConfig` and prints results.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use pdf2epub::{
    convert, ConversionConfig, ConversionProgressCallback, ConversionStats, CoverKind,
    ProgressCallback, SectionFailurePolicy,
};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

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

/// Live progress bar with one log line per finished section.
///
/// Sections finish out of order when requests run concurrently, so start
/// times are keyed by section order.
struct CliProgressCallback {
    bar: ProgressBar,
    start_times: Mutex<HashMap<usize, Instant>>,
    errors: AtomicUsize,
}

impl CliProgressCallback {
    /// Spinner only until `on_conversion_start` reports the section count.
    fn new_dynamic() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        let spinner_style = ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(TICKS);

        bar.set_style(spinner_style);
        bar.set_prefix("Preparing");
        bar.set_message("Requesting outline…");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self {
            bar,
            start_times: Mutex::new(HashMap::new()),
            errors: AtomicUsize::new(0),
        })
    }

    fn activate_bar(&self, total: usize) {
        let progress_style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>3}/{len} sections  \
             ⏱ {elapsed_precise}  ETA {eta_precise}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(TICKS);

        self.bar.set_length(total as u64);
        self.bar.set_style(progress_style);
        self.bar.set_prefix("Converting");
        self.bar.reset_eta();
    }

    fn elapsed_secs(&self, order: usize) -> f64 {
        self.start_times
            .lock()
            .ok()
            .and_then(|mut m| m.remove(&order))
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0)
    }
}

impl ConversionProgressCallback for CliProgressCallback {
    fn on_conversion_start(&self, total_sections: usize) {
        self.activate_bar(total_sections);
        self.bar.println(format!(
            "{} {}",
            cyan("◆"),
            bold(&format!("Converting {total_sections} sections…"))
        ));
    }

    fn on_section_start(&self, order: usize, _total: usize, title: &str) {
        if let Ok(mut m) = self.start_times.lock() {
            m.insert(order, Instant::now());
        }
        self.bar.set_message(title.to_string());
    }

    fn on_section_complete(&self, order: usize, total: usize, title: &str) {
        let secs = self.elapsed_secs(order);
        self.bar.println(format!(
            "  {} {:>3}/{:<3}  {}  {}",
            green("✓"),
            order,
            total,
            truncate(title, 60),
            dim(&format!("{secs:.1}s")),
        ));
        self.bar.inc(1);
    }

    fn on_section_error(&self, order: usize, total: usize, error: &str) {
        let secs = self.elapsed_secs(order);
        self.errors.fetch_add(1, Ordering::SeqCst);
        self.bar.println(format!(
            "  {} {:>3}/{:<3}  {}  {}",
            red("✗"),
            order,
            total,
            red(&truncate(error, 80)),
            dim(&format!("{secs:.1}s")),
        ));
        self.bar.inc(1);
    }

    fn on_conversion_complete(&self, total_sections: usize, success_count: usize) {
        let failed = total_sections.saturating_sub(success_count);
        self.bar.finish_and_clear();

        if failed == 0 {
            eprintln!(
                "{} {} sections converted",
                green("✔"),
                bold(&success_count.to_string())
            );
        } else {
            eprintln!(
                "{} {}/{} sections converted  ({} replaced by placeholders)",
                if failed == total_sections { red("✘") } else { cyan("⚠") },
                bold(&success_count.to_string()),
                total_sections,
                red(&failed.to_string()),
            );
        }
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() > max {
        let head: String = s.chars().take(max - 1).collect();
        format!("{head}\u{2026}")
    } else {
        s.to_string()
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Convert with the native Gemini backend
  GEMINI_API_KEY=... pdf2epub convert book.pdf

  # Explicit output, keep the unpacked package for inspection
  pdf2epub convert book.pdf -o out/book.epub --keep-sources

  # Use your own cover, or none at all
  pdf2epub convert book.pdf --cover-image cover.jpg
  pdf2epub convert book.pdf --no-auto-cover

  # Any edgequake-llm vision provider (pages are sent as images)
  pdf2epub convert book.pdf --provider openai --model gpt-4.1

  # Save raw service responses next to the output
  pdf2epub convert book.pdf --debug

ENVIRONMENT VARIABLES:
  GEMINI_API_KEY          Gemini API key (native backend, PDF sent inline)
  GEMINI_MODEL            Model ID override
  EDGEQUAKE_PROVIDER      edgequake-llm provider (openai, anthropic, ollama, ...)
  OPENAI_API_KEY, ...     Provider keys for edgequake-llm auto-detection
  PDFIUM_LIB_PATH         Path to libpdfium
  RUST_LOG                Log filter, overrides -v / -q
"#;

/// Convert PDF documents to EPUB with an LLM structuring service.
#[derive(Parser, Debug)]
#[command(
    name = "pdf2epub",
    version,
    about = "Convert PDF documents to EPUB with an LLM structuring service",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Convert one PDF into an EPUB book.
    Convert(ConvertArgs),
}

#[derive(Args, Debug)]
struct ConvertArgs {
    /// Local PDF file.
    input: PathBuf,

    /// Output EPUB path. Default: the input path with an `.epub` extension.
    #[arg(short, long, env = "PDF2EPUB_OUTPUT")]
    output: Option<PathBuf>,

    /// Also write the unpacked package to `<output-stem>_epub_src/`.
    #[arg(long)]
    keep_sources: bool,

    /// Write raw service responses as JSON next to the output.
    #[arg(long, env = "PDF2EPUB_DEBUG")]
    debug: bool,

    /// Use this PNG or JPEG as the cover.
    #[arg(long, value_name = "PATH")]
    cover_image: Option<PathBuf>,

    /// Do not render the first page as a cover when no cover image is given.
    #[arg(long)]
    no_auto_cover: bool,

    /// Gemini API key.
    #[arg(long, env = "GEMINI_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Model ID.
    #[arg(long, env = "GEMINI_MODEL")]
    model: Option<String>,

    /// edgequake-llm provider; takes precedence over the Gemini key.
    #[arg(long, env = "EDGEQUAKE_PROVIDER")]
    provider: Option<String>,

    /// Section requests in flight at once.
    #[arg(short, long, env = "PDF2EPUB_CONCURRENCY", default_value_t = 4)]
    concurrency: usize,

    /// Rendering DPI (72–400).
    #[arg(long, env = "PDF2EPUB_DPI", default_value_t = 150,
          value_parser = clap::value_parser!(u32).range(72..=400))]
    dpi: u32,

    /// Retries per request on transient failure.
    #[arg(long, env = "PDF2EPUB_MAX_RETRIES", default_value_t = 3)]
    max_retries: u32,

    /// Per-request timeout in seconds.
    #[arg(long, env = "PDF2EPUB_API_TIMEOUT", default_value_t = 300)]
    api_timeout: u64,

    /// PDF user password for encrypted documents.
    #[arg(long, env = "PDF2EPUB_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Abort on the first failed section instead of inserting a placeholder.
    #[arg(long)]
    fail_fast: bool,

    /// Skip the metadata request; use the PDF info dictionary instead.
    #[arg(long)]
    no_metadata: bool,

    /// Disable the progress bar.
    #[arg(long, env = "PDF2EPUB_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long)]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long)]
    quiet: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let Command::Convert(args) = Cli::parse().command;

    // ── Logging setup ────────────────────────────────────────────────────
    // The progress bar replaces INFO logs; -v brings them back.
    let show_progress = !args.quiet && !args.no_progress;
    let filter = if args.verbose {
        "debug"
    } else if args.quiet || show_progress {
        "error"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_writer(io::stderr)
        .init();

    match run(&args, show_progress).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {:#}", red("error:"), e);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: &ConvertArgs, show_progress: bool) -> Result<()> {
    let progress_cb: Option<ProgressCallback> = if show_progress {
        let cb = CliProgressCallback::new_dynamic();
        Some(cb as Arc<dyn ConversionProgressCallback>)
    } else {
        None
    };

    let config = build_config(args, progress_cb)?;
    let output = args
        .output
        .clone()
        .unwrap_or_else(|| args.input.with_extension("epub"));

    let stats = convert(&args.input, &output, &config)
        .await
        .context("Conversion failed")?;

    if !args.quiet {
        print_summary(&stats, &output);
    }
    Ok(())
}

/// Map CLI args to `ConversionConfig`.
fn build_config(args: &ConvertArgs, progress: Option<ProgressCallback>) -> Result<ConversionConfig> {
    let mut builder = ConversionConfig::builder()
        .dpi(args.dpi)
        .concurrency(args.concurrency)
        .max_retries(args.max_retries)
        .api_timeout_secs(args.api_timeout)
        .auto_cover(!args.no_auto_cover)
        .keep_sources(args.keep_sources)
        .debug(args.debug)
        .fetch_metadata(!args.no_metadata)
        .section_failure(if args.fail_fast {
            SectionFailurePolicy::Abort
        } else {
            SectionFailurePolicy::Placeholder
        });

    if let Some(ref key) = args.api_key {
        builder = builder.api_key(key);
    }
    if let Some(ref model) = args.model {
        builder = builder.model(model);
    }
    if let Some(ref provider) = args.provider {
        builder = builder.provider_name(provider);
    }
    if let Some(ref password) = args.password {
        builder = builder.password(password);
    }
    if let Some(ref cover) = args.cover_image {
        builder = builder.cover_image(cover);
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }

    builder.build().context("Invalid configuration")
}

fn print_summary(stats: &ConversionStats, output: &Path) {
    eprintln!(
        "{}  {}/{} sections  {} images  {}ms  →  {}",
        if stats.failed_sections == 0 { green("✔") } else { cyan("⚠") },
        stats.converted_sections,
        stats.total_sections,
        stats.images_packaged,
        stats.total_duration_ms,
        bold(&output.display().to_string()),
    );
    if stats.images_rejected + stats.images_failed > 0 {
        eprintln!(
            "   {}",
            dim(&format!(
                "{} decorative regions skipped, {} regions failed",
                stats.images_rejected, stats.images_failed
            ))
        );
    }
    if stats.cover != CoverKind::None {
        eprintln!("   {}", dim(&format!("cover: {}", stats.cover)));
    }
    for section in stats.sections.iter().filter(|s| s.error.is_some()) {
        eprintln!(
            "   {} section {} '{}' replaced by a placeholder",
            red("✗"),
            section.order,
            section.title
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> ConvertArgs {
        let mut argv = vec!["pdf2epub", "convert"];
        argv.extend_from_slice(args);
        let Command::Convert(args) = Cli::try_parse_from(argv).unwrap().command;
        args
    }

    #[test]
    fn flags_map_to_config() {
        let args = parse(&[
            "book.pdf",
            "-o",
            "out.epub",
            "--keep-sources",
            "--no-auto-cover",
            "--fail-fast",
            "--no-metadata",
            "--concurrency",
            "2",
        ]);
        assert_eq!(args.output.as_deref(), Some(Path::new("out.epub")));
        let config = build_config(&args, None).unwrap();
        assert!(config.keep_sources);
        assert!(!config.auto_cover);
        assert!(!config.fetch_metadata);
        assert_eq!(config.concurrency, 2);
        assert_eq!(config.section_failure, SectionFailurePolicy::Abort);
    }

    #[test]
    fn dpi_out_of_range_is_rejected() {
        let argv = ["pdf2epub", "convert", "book.pdf", "--dpi", "1000"];
        assert!(Cli::try_parse_from(argv).is_err());
    }

    #[test]
    fn truncate_counts_chars() {
        assert_eq!(truncate("héllo", 10), "héllo");
        assert_eq!(truncate("héllo wörld", 5), "héll\u{2026}");
    }
}
