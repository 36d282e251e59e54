//! Per-submission normalization: the state machine that turns one raw
//! submission directory into the `processed/{textual,visual}` contract.
//!
//! States: `unprocessed → flattening → routing → {manifest-committed |
//! rolled-back}`.
//!
//! The `processed/` directory doubles as the idempotency marker: if it
//! exists the submission is skipped untouched, so reruns are no-ops for
//! completed work. Conversely, *any* recorded file failure rolls the
//! whole `processed/` tree back — partial submissions are never left
//! behind, and the next run retries every file, not just the failed ones.

use crate::config::PreprocessConfig;
use crate::error::ConversionKind;
use crate::manifest::{
    aggregate_failure_reason, write_json, FailedFile, FailureReport, FailureReportEntry,
    OriginalFile, PreprocessManifest, ScannedPdf, SkippedFile, FAILED_DIR, FAILURE_REPORT_FILE,
    MANIFEST_FILE, PROCESSED_DIR,
};
use crate::pipeline::classify::{classify, extension_of, FileCategory, Verdict};
use crate::pipeline::convert::{convert_to_images, convert_to_pdf, has_extractable_text};
use crate::pipeline::flatten::flatten;
use crate::tools::ProcessRegistry;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// `Ok(())` on a committed manifest, `Err(reason)` on a rolled-back or
/// never-started submission. Failures are values, not panics: the reason
/// string is what lands in the batch summary.
pub type SubmissionResult = Result<(), String>;

/// Process a single submission directory end to end.
///
/// `submissions_root` is where the shared `#failed_preprocessing`
/// quarantine lives (normally the submission's parent directory).
pub async fn process_submission(
    submission_dir: &Path,
    submissions_root: &Path,
    config: &PreprocessConfig,
    registry: &ProcessRegistry,
) -> SubmissionResult {
    let name = submission_dir
        .file_name()
        .unwrap_or_default()
        .to_string_lossy()
        .to_string();
    info!("Processing submission: {}", name);

    // ── Idempotency short-circuit ────────────────────────────────────────
    let processed_dir = submission_dir.join(PROCESSED_DIR);
    if processed_dir.exists() {
        info!("Skipping {} - already processed", name);
        return Ok(());
    }

    // ── Flatten into a scratch directory ─────────────────────────────────
    let scratch = tempfile::TempDir::new()
        .map_err(|e| format!("could not create scratch directory: {e}"))?;
    let flat = flatten(submission_dir, scratch.path(), config, registry)
        .await
        .map_err(|e| format!("flattening failed: {e}"))?;

    if flat.files.is_empty() {
        warn!("No files found in {}", name);
        return Err("No processable files found".to_string());
    }

    // Only now that at least one file is confirmed processable does the
    // completion marker get created.
    let textual_dir = processed_dir.join("textual");
    let visual_dir = processed_dir.join("visual");
    for dir in [&processed_dir, &textual_dir, &visual_dir] {
        fs::create_dir_all(dir).map_err(|e| format!("could not create {}: {e}", dir.display()))?;
    }

    // ── Route each file ──────────────────────────────────────────────────
    let mut manifest = PreprocessManifest::new(&name);
    manifest.skipped_files = flat.skipped;
    let mut failed: Vec<FailedFile> = Vec::new();

    let mut files = flat.files;
    files.sort();

    for file in &files {
        route_file(
            file,
            submission_dir,
            &textual_dir,
            &visual_dir,
            config,
            registry,
            &mut manifest,
            &mut failed,
        )
        .await;
    }

    // ── Commit or roll back ──────────────────────────────────────────────
    manifest.finalise(failed.len());
    let info_path = processed_dir.join(MANIFEST_FILE);
    write_json(&info_path, &manifest).map_err(|e| format!("could not write manifest: {e}"))?;

    if !failed.is_empty() {
        save_failed_files(&name, &failed, submissions_root);

        // Undo partial output so the next run starts clean.
        if processed_dir.exists() {
            if let Err(e) = fs::remove_dir_all(&processed_dir) {
                warn!("Could not roll back {}: {}", processed_dir.display(), e);
            } else {
                info!(
                    "Removed processed folder from {} due to failures - can be retried",
                    name
                );
            }
        }

        let reason = aggregate_failure_reason(&failed);
        warn!("Failed to process {}: {}", name, reason);
        return Err(reason);
    }

    info!("Processed {}: {:?}", name, manifest.summary);
    Ok(())
}

/// Route one flattened file into the textual and/or visual streams,
/// recording outcomes in the manifest and the failure list.
#[allow(clippy::too_many_arguments)]
async fn route_file(
    file: &Path,
    submission_dir: &Path,
    textual_dir: &Path,
    visual_dir: &Path,
    config: &PreprocessConfig,
    registry: &ProcessRegistry,
    manifest: &mut PreprocessManifest,
    failed: &mut Vec<FailedFile>,
) {
    let category = match classify(file, &config.size_limits) {
        Verdict::Process(c) => c,
        Verdict::Skip(reason) => {
            // Flattening already filtered these; anything left means the
            // file changed under us.
            manifest.skipped_files.push(SkippedFile {
                filename: file_name_of(file),
                size: size_of(file),
                reason,
            });
            return;
        }
    };

    manifest.original_files.push(OriginalFile {
        name: file_name_of(file),
        size: size_of(file),
        category: category.as_str().to_string(),
    });

    match category {
        FileCategory::Textual => {
            let dest = unique_dest(textual_dir, file);
            match fs::copy(file, &dest) {
                Ok(_) => manifest.textual_files.push(rel_to(submission_dir, &dest)),
                Err(e) => failed.push(failure(
                    file,
                    category,
                    format!("Copy failed: {e}"),
                    None,
                    None,
                )),
            }
        }
        FileCategory::Visual => {
            match convert_to_images(file, visual_dir, config, registry).await {
                Ok(images) => {
                    for img in images {
                        manifest.visual_files.push(rel_to(submission_dir, &img));
                    }
                }
                Err(e) => failed.push(failure(
                    file,
                    category,
                    format!("Image conversion failed: {e}"),
                    Some(e.to_string()),
                    Some(ConversionKind::Image),
                )),
            }
        }
        FileCategory::Mixed => {
            let is_pdf = extension_of(file) == "pdf";
            let mut wants_textual = true;

            if is_pdf {
                let (has_text, text_sample) = has_extractable_text(file, config, registry).await;
                if !has_text {
                    // Scanned PDF: no textual output, page images only.
                    manifest.scanned_pdfs.push(ScannedPdf {
                        filename: file_name_of(file),
                        size: size_of(file),
                        text_sample: if text_sample.is_empty() {
                            "No text found".to_string()
                        } else {
                            text_sample.chars().take(100).collect()
                        },
                    });
                    wants_textual = false;
                }
            }

            if wants_textual {
                match convert_to_pdf(file, textual_dir, config, registry).await {
                    Ok(pdf) => manifest.textual_files.push(rel_to(submission_dir, &pdf)),
                    Err(e) => failed.push(failure(
                        file,
                        category,
                        format!("PDF conversion failed: {e}"),
                        Some(e.to_string()),
                        Some(ConversionKind::Pdf),
                    )),
                }
            }

            // Visual conversion always proceeds, text or no text.
            match convert_to_images(file, visual_dir, config, registry).await {
                Ok(images) => {
                    for img in images {
                        manifest.visual_files.push(rel_to(submission_dir, &img));
                    }
                }
                Err(e) => failed.push(failure(
                    file,
                    category,
                    format!("Image conversion failed: {e}"),
                    Some(e.to_string()),
                    Some(ConversionKind::Image),
                )),
            }
        }
        FileCategory::Archive => {
            // Archives never reach routing; the flattener expanded them.
            warn!("Archive {} reached routing; ignoring", file.display());
        }
    }
}

/// Quarantine the failing files and write the failure report.
///
/// Best-effort by design: a failure while saving failures must not mask
/// the original failure reason, so errors here are only logged.
fn save_failed_files(submission_name: &str, failed: &[FailedFile], submissions_root: &Path) {
    let failed_dir = submissions_root.join(FAILED_DIR).join(submission_name);
    if let Err(e) = fs::create_dir_all(&failed_dir) {
        warn!("Could not create {}: {}", failed_dir.display(), e);
        return;
    }

    let mut entries = Vec::with_capacity(failed.len());
    for f in failed {
        if !f.original_path.exists() {
            continue;
        }
        let dest = unique_dest(&failed_dir, &f.original_path);
        match fs::copy(&f.original_path, &dest) {
            Ok(_) => entries.push(FailureReportEntry {
                original_file: f.filename.clone(),
                copied_to: rel_to(submissions_root, &dest),
                failure_reason: f.failure_reason.clone(),
                detailed_error: f.detailed_error.clone(),
                conversion_type: f.conversion_type,
                size_bytes: f.size,
                category: f.category.clone(),
            }),
            Err(e) => warn!("Error saving failed file {}: {}", f.filename, e),
        }
    }

    if entries.is_empty() {
        return;
    }

    let report = FailureReport {
        submission_name: submission_name.to_string(),
        processing_timestamp: chrono::Utc::now().to_rfc3339(),
        total_failed_files: entries.len(),
        failed_files: entries,
    };
    let report_path = failed_dir.join(FAILURE_REPORT_FILE);
    match write_json(&report_path, &report) {
        Ok(()) => warn!(
            "Created failure report for {}: {} failed files",
            submission_name, report.total_failed_files
        ),
        Err(e) => warn!("Could not write failure report: {}", e),
    }
}

fn failure(
    file: &Path,
    category: FileCategory,
    reason: String,
    detailed: Option<String>,
    kind: Option<ConversionKind>,
) -> FailedFile {
    FailedFile {
        original_path: file.to_path_buf(),
        filename: file_name_of(file),
        size: size_of(file),
        category: category.as_str().to_string(),
        failure_reason: reason,
        detailed_error: detailed,
        conversion_type: kind,
    }
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .unwrap_or_default()
        .to_string_lossy()
        .to_string()
}

fn size_of(path: &Path) -> u64 {
    path.metadata().map(|m| m.len()).unwrap_or(0)
}

/// Output path relative to `base`, with forward slashes as written to the
/// manifest. Falls back to the absolute path if the output somehow landed
/// outside the submission.
fn rel_to(base: &Path, path: &Path) -> String {
    path.strip_prefix(base)
        .unwrap_or(path)
        .to_string_lossy()
        .replace('\\', "/")
}

/// Collision-suffixed destination next to `dir` for `src`'s file name.
fn unique_dest(dir: &Path, src: &Path) -> PathBuf {
    let name = src.file_name().unwrap_or_default();
    let mut target = dir.join(name);
    if !target.exists() {
        return target;
    }
    let stem = src
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    let ext = src
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    let mut counter = 1;
    while target.exists() {
        target = dir.join(format!("{stem}_{counter}{ext}"));
        counter += 1;
    }
    target
}
