//! End-to-end integration tests for gradeprep.
//!
//! These tests build real submission trees in temporary directories and
//! drive the normalizer and batch runner against them. Scenarios that
//! would need working conversion tools (LibreOffice, poppler, jupyter)
//! are arranged so the expected outcome is the same whether the tools are
//! installed or not — e.g. a garbage PDF fails conversion either way.

use gradeprep::manifest::{BatchSummary, FailureReport, PreprocessManifest};
use gradeprep::{process_submission, run_all, PreprocessConfig, ProcessRegistry};
use image::{Rgb, RgbImage};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

// ── Test helpers ─────────────────────────────────────────────────────────────

fn config() -> PreprocessConfig {
    PreprocessConfig::default()
}

/// Create `<root>/<name>` as a submission directory.
fn submission(root: &Path, name: &str) -> PathBuf {
    let dir = root.join(name);
    fs::create_dir_all(&dir).unwrap();
    dir
}

fn read_manifest(submission_dir: &Path) -> PreprocessManifest {
    let raw = fs::read_to_string(submission_dir.join("processed/preprocess_info.json")).unwrap();
    serde_json::from_str(&raw).unwrap()
}

fn file_names(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().to_string())
        .collect();
    names.sort();
    names
}

fn make_zip(path: &Path, entries: &[(&str, &[u8])]) {
    let file = fs::File::create(path).unwrap();
    let mut writer = zip::ZipWriter::new(file);
    let options = zip::write::SimpleFileOptions::default();
    for (name, bytes) in entries {
        writer.start_file(*name, options).unwrap();
        writer.write_all(bytes).unwrap();
    }
    writer.finish().unwrap();
}

// ── Normalizer scenarios ─────────────────────────────────────────────────────

/// A submission with one text file and one oversized PNG: the text file
/// is copied into textual, the PNG is bounded to the 2048 px ceiling in
/// visual, and the manifest counts line up.
#[tokio::test]
async fn text_and_oversized_png_submission() {
    let root = TempDir::new().unwrap();
    let sub = submission(root.path(), "alice");
    fs::write(sub.join("solution.txt"), b"x = 42 because the limit says so").unwrap();
    RgbImage::from_pixel(4000, 3000, Rgb([180, 40, 40]))
        .save(sub.join("workings.png"))
        .unwrap();

    let result = process_submission(&sub, root.path(), &config(), &ProcessRegistry::new()).await;
    assert_eq!(result, Ok(()));

    assert_eq!(file_names(&sub.join("processed/textual")), vec!["solution.txt"]);
    assert_eq!(file_names(&sub.join("processed/visual")), vec!["workings.png"]);

    let bounded = image::open(sub.join("processed/visual/workings.png")).unwrap();
    assert_eq!(bounded.width().max(bounded.height()), 2048);
    assert_eq!(bounded.height(), 1536, "aspect ratio preserved");

    let manifest = read_manifest(&sub);
    assert_eq!(manifest.submission_name, "alice");
    assert_eq!(manifest.summary.total_original_files, 2);
    assert_eq!(manifest.summary.textual_outputs, 1);
    assert_eq!(manifest.summary.visual_outputs, 1);
    assert_eq!(manifest.summary.failed_files, 0);
    assert_eq!(manifest.summary.skipped_files, 0);
    assert!(manifest
        .textual_files
        .contains(&"processed/textual/solution.txt".to_string()));
}

/// An already-within-bounds image is copied byte-for-byte.
#[tokio::test]
async fn small_image_survives_untouched() {
    let root = TempDir::new().unwrap();
    let sub = submission(root.path(), "bob");
    let src = sub.join("sketch.png");
    RgbImage::from_pixel(800, 600, Rgb([10, 10, 200]))
        .save(&src)
        .unwrap();
    let original = fs::read(&src).unwrap();

    process_submission(&sub, root.path(), &config(), &ProcessRegistry::new())
        .await
        .unwrap();

    assert_eq!(
        fs::read(sub.join("processed/visual/sketch.png")).unwrap(),
        original
    );
}

/// A zip with two same-named text files in different folders plus an
/// unsupported .exe: both texts land in textual with de-duplicated names,
/// the .exe shows up in skipped_files, and nothing fails.
#[tokio::test]
async fn zip_submission_with_unsupported_entry() {
    let root = TempDir::new().unwrap();
    let sub = submission(root.path(), "carol");
    make_zip(
        &sub.join("homework.zip"),
        &[
            ("part1/answers.txt", b"1) 7  2) 12"),
            ("part2/answers.txt", b"3) x^2  4) e"),
            ("solver.exe", &[0u8; 128]),
        ],
    );

    let result = process_submission(&sub, root.path(), &config(), &ProcessRegistry::new()).await;
    assert_eq!(result, Ok(()));

    assert_eq!(
        file_names(&sub.join("processed/textual")),
        vec!["answers.txt", "answers_1.txt"]
    );

    let manifest = read_manifest(&sub);
    assert_eq!(manifest.summary.textual_outputs, 2);
    assert_eq!(manifest.summary.failed_files, 0);
    assert_eq!(manifest.skipped_files.len(), 1);
    assert_eq!(manifest.skipped_files[0].filename, "solver.exe");
    assert_eq!(manifest.skipped_files[0].reason, "Unsupported file type");
}

/// Rollback invariant: one file guaranteed to fail conversion (a garbage
/// PDF) makes the whole submission fail, `processed/` is gone afterwards,
/// and the quarantine holds a failure report with exactly one entry.
#[tokio::test]
async fn failed_conversion_rolls_back_processed_tree() {
    let root = TempDir::new().unwrap();
    let sub = submission(root.path(), "dave");
    fs::write(sub.join("notes.txt"), b"these notes are fine").unwrap();
    // Not a real PDF: the text probe finds nothing (scanned path) and
    // page rasterisation fails, with or without poppler installed.
    fs::write(sub.join("broken.pdf"), b"%PDF-1.4 garbage garbage").unwrap();

    let result = process_submission(&sub, root.path(), &config(), &ProcessRegistry::new()).await;
    let reason = result.unwrap_err();
    assert!(
        reason.contains("Image conversion failed"),
        "unexpected reason: {reason}"
    );

    // Rolled back: no partial output left behind.
    assert!(!sub.join("processed").exists());

    // Quarantined with a one-entry report.
    let report_path = root
        .path()
        .join("#failed_preprocessing/dave/failure_report.json");
    assert!(report_path.is_file());
    let report: FailureReport =
        serde_json::from_str(&fs::read_to_string(&report_path).unwrap()).unwrap();
    assert_eq!(report.submission_name, "dave");
    assert_eq!(report.total_failed_files, 1);
    assert_eq!(report.failed_files[0].original_file, "broken.pdf");
    assert!(root
        .path()
        .join("#failed_preprocessing/dave/broken.pdf")
        .is_file());
}

/// A submission with nothing processable fails fast without ever
/// creating `processed/`.
#[tokio::test]
async fn empty_submission_fails_without_processed_dir() {
    let root = TempDir::new().unwrap();
    let sub = submission(root.path(), "erin");
    fs::write(sub.join(".DS_Store"), b"junk").unwrap();
    fs::write(sub.join("empty.txt"), b"").unwrap();

    let result = process_submission(&sub, root.path(), &config(), &ProcessRegistry::new()).await;
    assert_eq!(result, Err("No processable files found".to_string()));
    assert!(!sub.join("processed").exists());
}

/// Idempotency: a pre-existing `processed/` marker short-circuits the
/// whole submission, leaving the tree byte-for-byte unchanged.
#[tokio::test]
async fn existing_processed_marker_is_a_noop() {
    let root = TempDir::new().unwrap();
    let sub = submission(root.path(), "frank");
    fs::write(sub.join("new_upload.txt"), b"should not be ingested").unwrap();
    fs::create_dir_all(sub.join("processed/textual")).unwrap();
    fs::write(sub.join("processed/textual/old.txt"), b"from a prior run").unwrap();
    fs::write(sub.join("processed/preprocess_info.json"), b"{\"sentinel\":1}").unwrap();

    let result = process_submission(&sub, root.path(), &config(), &ProcessRegistry::new()).await;
    assert_eq!(result, Ok(()));

    // Marker content untouched, nothing added.
    assert_eq!(
        fs::read(sub.join("processed/preprocess_info.json")).unwrap(),
        b"{\"sentinel\":1}"
    );
    assert_eq!(file_names(&sub.join("processed/textual")), vec!["old.txt"]);
    assert_eq!(
        file_names(&sub.join("processed")),
        vec!["preprocess_info.json", "textual"]
    );
}

// ── Batch runner scenarios ───────────────────────────────────────────────────

/// Sequential batch over a good and a bad submission: both outcomes are
/// recorded, and the summary file is written with matching counts.
#[tokio::test]
async fn batch_writes_summary_with_failures() {
    let root = TempDir::new().unwrap();
    let good = submission(root.path(), "good");
    fs::write(good.join("work.txt"), b"some work").unwrap();
    submission(root.path(), "hollow"); // nothing inside

    let cfg = PreprocessConfig::builder().workers(1).build().unwrap();
    let summary = run_all(
        root.path(),
        &cfg,
        &ProcessRegistry::new(),
        gradeprep::progress::noop(),
    )
    .await
    .unwrap();

    assert_eq!(summary.total_submissions, 2);
    assert_eq!(summary.successful_preprocessing, 1);
    assert_eq!(summary.failed_preprocessing, 1);
    assert_eq!(
        summary.failed_submissions.get("hollow").map(String::as_str),
        Some("No processable files found")
    );

    let on_disk: BatchSummary = serde_json::from_str(
        &fs::read_to_string(root.path().join("preprocessing_summary.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(on_disk.total_submissions, 2);
    assert_eq!(on_disk.failed_preprocessing, 1);
}

/// Parallel batch: three clean submissions, a three-worker pool, all
/// succeed.
#[tokio::test]
async fn parallel_batch_processes_all_submissions() {
    let root = TempDir::new().unwrap();
    for name in ["s1", "s2", "s3"] {
        let sub = submission(root.path(), name);
        fs::write(sub.join("hw.txt"), format!("answer from {name}")).unwrap();
    }

    let cfg = PreprocessConfig::builder().workers(3).build().unwrap();
    let summary = run_all(
        root.path(),
        &cfg,
        &ProcessRegistry::new(),
        gradeprep::progress::noop(),
    )
    .await
    .unwrap();

    assert_eq!(summary.total_submissions, 3);
    assert_eq!(summary.successful_preprocessing, 3);
    for name in ["s1", "s2", "s3"] {
        assert!(root.path().join(name).join("processed/textual/hw.txt").is_file());
    }
}

/// Re-running a batch skips completed submissions (marker present) and
/// leaves their outputs identical; the summary is rewritten.
#[tokio::test]
async fn rerun_is_idempotent_and_rewrites_summary() {
    let root = TempDir::new().unwrap();
    let sub = submission(root.path(), "gail");
    fs::write(sub.join("final.txt"), b"done").unwrap();

    let cfg = PreprocessConfig::builder().workers(1).build().unwrap();
    let registry = ProcessRegistry::new();
    run_all(root.path(), &cfg, &registry, gradeprep::progress::noop())
        .await
        .unwrap();

    let manifest_before =
        fs::read(sub.join("processed/preprocess_info.json")).unwrap();

    let summary = run_all(root.path(), &cfg, &registry, gradeprep::progress::noop())
        .await
        .unwrap();
    assert_eq!(summary.successful_preprocessing, 1);

    // Timestamped manifest unchanged → the submission was not reprocessed.
    assert_eq!(
        fs::read(sub.join("processed/preprocess_info.json")).unwrap(),
        manifest_before
    );
}

/// Failed submissions stay retry-eligible: after a failing run the
/// `processed/` marker is absent, so the next batch picks them up again.
#[tokio::test]
async fn failed_submission_is_retried_on_next_run() {
    let root = TempDir::new().unwrap();
    let sub = submission(root.path(), "henry");
    fs::write(sub.join("broken.pdf"), b"%PDF-1.4 still garbage").unwrap();

    let cfg = PreprocessConfig::builder().workers(1).build().unwrap();
    let registry = ProcessRegistry::new();

    let first = run_all(root.path(), &cfg, &registry, gradeprep::progress::noop())
        .await
        .unwrap();
    assert_eq!(first.failed_preprocessing, 1);
    assert!(!sub.join("processed").exists());

    // Fix the submission and re-run: it is picked up again.
    fs::remove_file(sub.join("broken.pdf")).unwrap();
    fs::write(sub.join("fixed.txt"), b"all good now").unwrap();

    let second = run_all(root.path(), &cfg, &registry, gradeprep::progress::noop())
        .await
        .unwrap();
    assert_eq!(second.successful_preprocessing, 1);
    assert!(sub.join("processed/textual/fixed.txt").is_file());
}

/// Progress callbacks fire once per submission plus the batch brackets.
#[tokio::test]
async fn progress_callbacks_fire_per_submission() {
    use gradeprep::BatchProgress;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counting {
        started: AtomicUsize,
        completed: AtomicUsize,
        failed: AtomicUsize,
        batch_total: AtomicUsize,
    }
    impl BatchProgress for Counting {
        fn on_batch_start(&self, total: usize) {
            self.batch_total.store(total, Ordering::SeqCst);
        }
        fn on_submission_start(&self, _name: &str) {
            self.started.fetch_add(1, Ordering::SeqCst);
        }
        fn on_submission_complete(&self, _name: &str, _c: usize, _t: usize) {
            self.completed.fetch_add(1, Ordering::SeqCst);
        }
        fn on_submission_failed(&self, _name: &str, _c: usize, _t: usize, _reason: &str) {
            self.failed.fetch_add(1, Ordering::SeqCst);
        }
    }

    let root = TempDir::new().unwrap();
    let ok = submission(root.path(), "ok");
    fs::write(ok.join("a.txt"), b"fine").unwrap();
    submission(root.path(), "empty");

    let progress = Arc::new(Counting::default());
    let cfg = PreprocessConfig::builder().workers(2).build().unwrap();
    run_all(
        root.path(),
        &cfg,
        &ProcessRegistry::new(),
        Arc::clone(&progress) as Arc<dyn BatchProgress>,
    )
    .await
    .unwrap();

    assert_eq!(progress.batch_total.load(Ordering::SeqCst), 2);
    assert_eq!(progress.started.load(Ordering::SeqCst), 2);
    assert_eq!(progress.completed.load(Ordering::SeqCst), 1);
    assert_eq!(progress.failed.load(Ordering::SeqCst), 1);
}
