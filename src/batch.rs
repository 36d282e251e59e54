//! Batch runner: apply the normalizer across every submission in a
//! directory, sequentially or with a bounded worker pool.
//!
//! Submissions are embarrassingly parallel — disjoint directories, no
//! shared mutable state except the summary written after all workers
//! join — so concurrency is a plain `Semaphore` over spawned tasks. A
//! global deadline bounds the whole batch: on expiry outstanding tasks
//! are aborted (their child processes die via `kill_on_drop`), the
//! unfinished submissions are recorded as cancelled, and the summary is
//! still written. Worker panics are caught at the task boundary and
//! recorded as that submission's failure; the batch continues.

use crate::config::PreprocessConfig;
use crate::error::PreprocessError;
use crate::manifest::{write_json, BatchSummary, SUMMARY_FILE};
use crate::normalize::process_submission;
use crate::progress::BatchProgress;
use crate::tools::ProcessRegistry;
use futures::FutureExt;
use std::any::Any;
use std::collections::BTreeMap;
use std::fs;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

/// Process every submission under `submissions_dir` and write the batch
/// summary. Returns the summary that was persisted.
///
/// Subdirectory names starting with `#` are reserved (quarantine,
/// reports) and excluded from the work set. Loose PDFs sitting directly
/// in the batch directory are first moved into synthetic one-file
/// submission folders so they follow the same pipeline.
pub async fn run_all(
    submissions_dir: &Path,
    config: &PreprocessConfig,
    registry: &ProcessRegistry,
    progress: Arc<dyn BatchProgress>,
) -> Result<BatchSummary, PreprocessError> {
    if !submissions_dir.is_dir() {
        return Err(PreprocessError::SubmissionsDirNotFound {
            path: submissions_dir.to_path_buf(),
        });
    }

    adopt_loose_pdfs(submissions_dir)?;

    let submission_dirs = enumerate_submissions(submissions_dir)?;
    let total = submission_dirs.len();
    info!("Found {} submissions to preprocess", total);
    progress.on_batch_start(total);

    let results = if config.workers == 1 {
        run_sequential(submission_dirs, submissions_dir, config, registry, &progress).await
    } else {
        run_parallel(submission_dirs, submissions_dir, config, registry, &progress).await
    };

    let summary = BatchSummary::from_results(&results);
    let summary_path = submissions_dir.join(SUMMARY_FILE);
    write_json(&summary_path, &summary).map_err(|e| PreprocessError::io(&summary_path, e))?;

    info!(
        "Preprocessing complete: {}/{} submissions processed successfully",
        summary.successful_preprocessing, summary.total_submissions
    );
    if !summary.failed_submissions.is_empty() {
        warn!(
            "Failed submissions: {:?}",
            summary.failed_submissions.keys().collect::<Vec<_>>()
        );
    }
    progress.on_batch_complete(total, summary.successful_preprocessing);

    Ok(summary)
}

/// Immediate subdirectories of the batch directory, minus reserved `#`
/// names, in sorted order.
fn enumerate_submissions(submissions_dir: &Path) -> Result<Vec<PathBuf>, PreprocessError> {
    let mut dirs: Vec<PathBuf> = fs::read_dir(submissions_dir)
        .map_err(|e| PreprocessError::io(submissions_dir, e))?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .filter(|p| {
            p.file_name()
                .map(|n| !n.to_string_lossy().starts_with('#'))
                .unwrap_or(false)
        })
        .collect();
    dirs.sort();
    Ok(dirs)
}

/// Move loose `*.pdf` files in the batch root into synthetic one-file
/// submission folders named after the file stem.
fn adopt_loose_pdfs(submissions_dir: &Path) -> Result<(), PreprocessError> {
    let loose: Vec<PathBuf> = fs::read_dir(submissions_dir)
        .map_err(|e| PreprocessError::io(submissions_dir, e))?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.is_file()
                && p.extension()
                    .map(|e| e.to_ascii_lowercase() == "pdf")
                    .unwrap_or(false)
        })
        .collect();

    for pdf in loose {
        let stem = pdf
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "submission".to_string());
        let mut dir = submissions_dir.join(&stem);
        let mut counter = 1;
        while dir.exists() {
            dir = submissions_dir.join(format!("{stem}_{counter}"));
            counter += 1;
        }
        fs::create_dir_all(&dir).map_err(|e| PreprocessError::io(&dir, e))?;
        let dest = dir.join(pdf.file_name().unwrap_or_default());
        fs::rename(&pdf, &dest).map_err(|e| PreprocessError::io(&pdf, e))?;
        info!(
            "Relocated loose PDF {} into submission folder {}",
            dest.file_name().unwrap_or_default().to_string_lossy(),
            dir.display()
        );
    }
    Ok(())
}

/// Best-effort extraction of a panic payload's message.
fn panic_text(payload: &Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn submission_name(dir: &Path) -> String {
    dir.file_name()
        .unwrap_or_default()
        .to_string_lossy()
        .to_string()
}

/// One submission per task even in sequential mode, so a panicking
/// conversion is caught at the task boundary instead of taking down the
/// batch.
async fn run_sequential(
    submission_dirs: Vec<PathBuf>,
    submissions_root: &Path,
    config: &PreprocessConfig,
    registry: &ProcessRegistry,
    progress: &Arc<dyn BatchProgress>,
) -> BTreeMap<String, Result<(), String>> {
    let total = submission_dirs.len();
    let mut results = BTreeMap::new();

    for dir in submission_dirs {
        let name = submission_name(&dir);
        progress.on_submission_start(&name);

        let root = submissions_root.to_path_buf();
        let cfg = config.clone();
        let reg = registry.clone();
        let task_dir = dir.clone();
        let outcome = tokio::spawn(async move {
            process_submission(&task_dir, &root, &cfg, &reg).await
        })
        .await;

        let result = match outcome {
            Ok(r) => r,
            Err(e) => {
                error!("Error processing {}: {}", name, e);
                Err(format!("worker crashed: {e}"))
            }
        };
        record(&mut results, &name, result, total, progress);
    }
    results
}

async fn run_parallel(
    submission_dirs: Vec<PathBuf>,
    submissions_root: &Path,
    config: &PreprocessConfig,
    registry: &ProcessRegistry,
    progress: &Arc<dyn BatchProgress>,
) -> BTreeMap<String, Result<(), String>> {
    let total = submission_dirs.len();
    info!("Processing submissions in parallel with {} workers", config.workers);

    // Clear leftovers from a previous aborted run before spawning anew.
    registry.kill_stale(Duration::from_secs(config.stale_process_secs));

    let semaphore = Arc::new(Semaphore::new(config.workers));
    let mut tasks: JoinSet<(String, Result<(), String>)> = JoinSet::new();

    for dir in &submission_dirs {
        let name = submission_name(dir);
        let dir = dir.clone();
        let root = submissions_root.to_path_buf();
        let cfg = config.clone();
        let reg = registry.clone();
        let sem = Arc::clone(&semaphore);
        let prog = Arc::clone(progress);

        tasks.spawn(async move {
            // Closed semaphores cannot happen here; treat it like a
            // cancellation if it ever does.
            let _permit = match sem.acquire().await {
                Ok(p) => p,
                Err(_) => return (name, Err("Processing cancelled".to_string())),
            };
            prog.on_submission_start(&name);
            // Catch panics at the task boundary so the submission is
            // recorded with the panic text and the batch continues.
            let result = AssertUnwindSafe(process_submission(&dir, &root, &cfg, &reg))
                .catch_unwind()
                .await
                .unwrap_or_else(|payload| Err(format!("worker crashed: {}", panic_text(&payload))));
            (name, result)
        });
    }

    let mut results: BTreeMap<String, Result<(), String>> = BTreeMap::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(config.batch_timeout_secs);

    loop {
        let joined = tokio::time::timeout_at(deadline, tasks.join_next()).await;
        match joined {
            Ok(None) => break, // all tasks finished
            Ok(Some(Ok((name, result)))) => {
                record(&mut results, &name, result, total, progress);
            }
            Ok(Some(Err(join_err))) => {
                // Panics are caught inside the task; reaching here means
                // the task itself was aborted. The submission is filled in
                // as cancelled below.
                error!("Worker task failed: {}", join_err);
            }
            Err(_) => {
                warn!(
                    "Batch deadline of {}s expired - cancelling outstanding submissions",
                    config.batch_timeout_secs
                );
                tasks.abort_all();
                while tasks.join_next().await.is_some() {}
                registry.kill_stale(Duration::from_secs(config.stale_process_secs));
                break;
            }
        }
    }

    // Anything not recorded was cancelled, aborted, or panicked.
    for dir in &submission_dirs {
        let name = submission_name(dir);
        if !results.contains_key(&name) {
            record(
                &mut results,
                &name,
                Err("Processing cancelled".to_string()),
                total,
                progress,
            );
        }
    }
    results
}

fn record(
    results: &mut BTreeMap<String, Result<(), String>>,
    name: &str,
    result: Result<(), String>,
    total: usize,
    progress: &Arc<dyn BatchProgress>,
) {
    match &result {
        Ok(()) => {
            info!("✓ Completed ({}/{}): {}", results.len() + 1, total, name);
        }
        Err(reason) => {
            warn!("✗ Failed ({}/{}): {} - {}", results.len() + 1, total, name, reason);
        }
    }
    results.insert(name.to_string(), result.clone());
    let completed = results.len();
    match result {
        Ok(()) => progress.on_submission_complete(name, completed, total),
        Err(reason) => progress.on_submission_failed(name, completed, total, &reason),
    }
}
