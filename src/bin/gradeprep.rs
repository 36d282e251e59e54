//! CLI binary for gradeprep.
//!
//! A thin shim over the library crate that maps CLI flags to
//! `PreprocessConfig` and renders batch progress.

use anyhow::{bail, Context, Result};
use clap::Parser;
use gradeprep::{check_dependencies, run_all, BatchProgress, PreprocessConfig, ProcessRegistry};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
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

/// Preprocess student submissions for LLM grading.
#[derive(Parser, Debug)]
#[command(name = "gradeprep", version, about)]
struct Cli {
    /// Directory containing one subdirectory per submission
    submissions_dir: PathBuf,

    /// Number of parallel workers (use 1 for sequential processing)
    #[arg(long, default_value_t = 4)]
    workers: usize,

    /// Maximum PDF pages rendered per document
    #[arg(long, default_value_t = 30)]
    max_pdf_pages: usize,

    /// Global batch deadline in seconds
    #[arg(long, default_value_t = 600)]
    batch_timeout: u64,

    /// Per-tool-invocation timeout in seconds
    #[arg(long, default_value_t = 300)]
    tool_timeout: u64,

    /// Skip the startup check for external tools
    #[arg(long)]
    skip_dependency_check: bool,
}

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Terminal progress: one bar across all submissions, with a log line per
/// completed or failed submission. Submissions finish out of order under
/// the worker pool, so everything routes through the bar's println.
struct CliProgress {
    bar: ProgressBar,
}

impl CliProgress {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::with_template(
                "{spinner:.cyan} {prefix:.bold}  [{bar:40.green/238}] {pos}/{len} submissions  ⏱ {elapsed_precise}",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("█▉▊▋▌▍▎▏  "),
        );
        bar.set_prefix("Preprocessing");
        bar.enable_steady_tick(Duration::from_millis(80));
        Arc::new(Self { bar })
    }
}

impl BatchProgress for CliProgress {
    fn on_batch_start(&self, total: usize) {
        self.bar.set_length(total as u64);
    }

    fn on_submission_start(&self, name: &str) {
        self.bar.set_message(name.to_string());
    }

    fn on_submission_complete(&self, name: &str, _completed: usize, _total: usize) {
        self.bar.println(format!("  {} {}", green("✓"), name));
        self.bar.inc(1);
    }

    fn on_submission_failed(&self, name: &str, _completed: usize, _total: usize, reason: &str) {
        // Truncate very long reasons to keep the log tidy.
        let msg = if reason.chars().count() > 80 {
            format!("{}\u{2026}", reason.chars().take(79).collect::<String>())
        } else {
            reason.to_string()
        };
        self.bar
            .println(format!("  {} {}  {}", red("✗"), name, dim(&msg)));
        self.bar.inc(1);
    }

    fn on_batch_complete(&self, _total: usize, _successful: usize) {
        self.bar.finish_and_clear();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if !cli.submissions_dir.exists() {
        bail!(
            "Submissions directory not found: {}",
            cli.submissions_dir.display()
        );
    }

    let config = PreprocessConfig::builder()
        .workers(cli.workers)
        .max_pdf_pages(cli.max_pdf_pages)
        .batch_timeout_secs(cli.batch_timeout)
        .tool_timeout_secs(cli.tool_timeout)
        .build()
        .context("invalid configuration")?;

    if !cli.skip_dependency_check {
        check_dependencies()
            .await
            .context("external tool check failed")?;
    }

    let registry = ProcessRegistry::new();
    let progress = CliProgress::new();
    let run = run_all(
        &cli.submissions_dir,
        &config,
        &registry,
        progress as Arc<dyn BatchProgress>,
    );
    let summary = tokio::select! {
        res = run => res?,
        _ = tokio::signal::ctrl_c() => {
            eprintln!("Received interrupt signal. Shutting down...");
            std::process::exit(130);
        }
    };

    println!();
    println!("{}", bold("Preprocessing Summary:"));
    println!("Total submissions: {}", summary.total_submissions);
    println!(
        "Successfully processed: {}",
        summary.successful_preprocessing
    );
    println!("Failed: {}", summary.failed_preprocessing);

    if !summary.failed_submissions.is_empty() {
        println!();
        println!("{}", bold("Failed submissions:"));
        for (name, reason) in &summary.failed_submissions {
            println!("  {} {}  {}", red("✗"), name, dim(reason));
        }
    }

    if summary.successful_preprocessing > 0 {
        println!();
        println!("Processed submissions now have:");
        println!("- processed/textual/ with PDF and text files");
        println!("- processed/visual/ with page images");
        println!("- processed/preprocess_info.json with processing details");
    }

    if summary.failed_preprocessing > 0 {
        std::process::exit(1);
    }
    Ok(())
}
