//! On-disk bookkeeping artifacts: the per-submission manifest, the
//! per-submission failure report, and the batch-level summary.
//!
//! Field names are the wire contract consumed by the downstream grading
//! stage — renaming any of them is a breaking change for consumers that
//! enumerate `textual_files` / `visual_files` out of
//! `processed/preprocess_info.json`.
//!
//! Durability rules:
//! * the manifest persists only on a fully successful run (any recorded
//!   failure rolls back the whole `processed/` tree, manifest included);
//! * a failure report's existence implies that rollback happened;
//! * the batch summary is overwritten on every run.

use crate::error::ConversionKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// File name of the per-submission manifest inside `processed/`.
pub const MANIFEST_FILE: &str = "preprocess_info.json";
/// File name of the per-submission failure report.
pub const FAILURE_REPORT_FILE: &str = "failure_report.json";
/// File name of the batch summary in the submissions root.
pub const SUMMARY_FILE: &str = "preprocessing_summary.json";
/// Completion-marker directory created inside each submission.
pub const PROCESSED_DIR: &str = "processed";
/// Shared quarantine directory for failed submissions. The `#` prefix
/// keeps it out of submission enumeration.
pub const FAILED_DIR: &str = "#failed_preprocessing";

/// One input file that entered the routing stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OriginalFile {
    pub name: String,
    pub size: u64,
    pub category: String,
}

/// One file excluded before conversion, with the reason shown to graders.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkippedFile {
    pub filename: String,
    pub size: u64,
    pub reason: String,
}

/// A PDF with no extractable text: imaged for visual grading but absent
/// from the textual outputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScannedPdf {
    pub filename: String,
    pub size: u64,
    pub text_sample: String,
}

/// Roll-up counts at the end of the manifest.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ManifestSummary {
    pub total_original_files: usize,
    pub textual_outputs: usize,
    pub visual_outputs: usize,
    pub skipped_files: usize,
    pub failed_files: usize,
    pub scanned_pdfs: usize,
}

/// Per-submission manifest, written to `processed/preprocess_info.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreprocessManifest {
    pub submission_name: String,
    pub processing_timestamp: String,
    pub original_files: Vec<OriginalFile>,
    /// Output paths relative to the submission root.
    pub textual_files: Vec<String>,
    pub visual_files: Vec<String>,
    pub skipped_files: Vec<SkippedFile>,
    pub scanned_pdfs: Vec<ScannedPdf>,
    pub summary: ManifestSummary,
}

impl PreprocessManifest {
    pub fn new(submission_name: impl Into<String>) -> Self {
        Self {
            submission_name: submission_name.into(),
            processing_timestamp: chrono::Utc::now().to_rfc3339(),
            original_files: Vec::new(),
            textual_files: Vec::new(),
            visual_files: Vec::new(),
            skipped_files: Vec::new(),
            scanned_pdfs: Vec::new(),
            summary: ManifestSummary::default(),
        }
    }

    /// Finalise the summary counts from the accumulated lists.
    pub fn finalise(&mut self, failed_files: usize) {
        self.summary = ManifestSummary {
            total_original_files: self.original_files.len(),
            textual_outputs: self.textual_files.len(),
            visual_outputs: self.visual_files.len(),
            skipped_files: self.skipped_files.len(),
            failed_files,
            scanned_pdfs: self.scanned_pdfs.len(),
        };
    }
}

/// In-memory record of one failed file, accumulated during routing.
///
/// `original_path` points at the flattened scratch copy so the quarantine
/// step can copy the exact bytes that failed.
#[derive(Debug, Clone)]
pub struct FailedFile {
    pub original_path: PathBuf,
    pub filename: String,
    pub size: u64,
    pub category: String,
    pub failure_reason: String,
    pub detailed_error: Option<String>,
    pub conversion_type: Option<ConversionKind>,
}

/// One entry of the persisted failure report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureReportEntry {
    pub original_file: String,
    /// Path of the quarantined copy, relative to the submissions root.
    pub copied_to: String,
    pub failure_reason: String,
    pub detailed_error: Option<String>,
    pub conversion_type: Option<ConversionKind>,
    pub size_bytes: u64,
    pub category: String,
}

/// Per-submission failure report, written under
/// `#failed_preprocessing/<submission>/failure_report.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureReport {
    pub submission_name: String,
    pub processing_timestamp: String,
    pub total_failed_files: usize,
    pub failed_files: Vec<FailureReportEntry>,
}

/// Batch-level summary, written to `preprocessing_summary.json` in the
/// submissions root. Overwritten each run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchSummary {
    pub total_submissions: usize,
    pub successful_preprocessing: usize,
    pub failed_preprocessing: usize,
    /// Failed submission name → aggregated failure reason. BTreeMap so
    /// the JSON is stable across runs.
    pub failed_submissions: BTreeMap<String, String>,
}

impl BatchSummary {
    pub fn from_results(results: &BTreeMap<String, Result<(), String>>) -> Self {
        let total = results.len();
        let failed_submissions: BTreeMap<String, String> = results
            .iter()
            .filter_map(|(name, r)| r.as_ref().err().map(|e| (name.clone(), e.clone())))
            .collect();
        Self {
            total_submissions: total,
            successful_preprocessing: total - failed_submissions.len(),
            failed_preprocessing: failed_submissions.len(),
            failed_submissions,
        }
    }
}

/// Collapse per-file failures into one human-readable reason string.
///
/// Failures sharing a message are grouped: a lone file is named
/// explicitly, several files with the same message become a count. Groups
/// are joined with "; " in first-seen order.
pub fn aggregate_failure_reason(failures: &[FailedFile]) -> String {
    let mut order: Vec<&str> = Vec::new();
    let mut by_reason: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for f in failures {
        let entry = by_reason.entry(f.failure_reason.as_str()).or_default();
        if entry.is_empty() {
            order.push(f.failure_reason.as_str());
        }
        entry.push(f.filename.as_str());
    }

    let mut parts = Vec::with_capacity(order.len());
    for reason in order {
        let files = &by_reason[reason];
        if files.len() == 1 {
            parts.push(format!("{}: {}", files[0], reason));
        } else {
            parts.push(format!("{} files: {}", files.len(), reason));
        }
    }
    parts.join("; ")
}

/// Write a value as pretty-printed JSON, creating parent directories.
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(value)?;
    std::fs::write(path, json)
}
