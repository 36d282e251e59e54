//! # gradeprep
//!
//! Normalize messy student submission trees into two fixed streams —
//! textual documents and page-image sequences — ready for LLM-based
//! grading.
//!
//! ## Why this crate?
//!
//! Collected assignment submissions are combinatorially messy: zip files
//! inside rar files, Word documents, Jupyter notebooks, 40-megapixel
//! phone photos, scanned PDFs with no text layer, and platform junk like
//! `__MACOSX`. A grading pipeline cannot feed that to a model directly.
//! This crate deterministically reduces each submission to a stable
//! on-disk contract, tracking every file's fate (processed, skipped,
//! failed) with enough detail to support retries and auditing.
//!
//! ## Pipeline Overview
//!
//! ```text
//! submission/
//!  │
//!  ├─ 1. Classify  extension tables + content sniff → category or skip
//!  ├─ 2. Flatten   recursive walk, archives expanded until none remain
//!  ├─ 3. Route     textual → copy, visual → bounded images,
//!  │               mixed → PDF + page images (scan detection via
//!  │               pdftotext probe)
//!  ├─ 4. Commit    processed/{textual,visual} + preprocess_info.json
//!  └─ 5. Rollback  any failure deletes processed/, quarantines the
//!                  failing files under #failed_preprocessing/
//! ```
//!
//! The batch runner applies this per-submission machine across a whole
//! directory with a bounded worker pool, a global deadline, and a final
//! `preprocessing_summary.json`.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use gradeprep::{check_dependencies, run_all, PreprocessConfig, ProcessRegistry};
//! use std::path::Path;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = PreprocessConfig::default();
//!     // Fatal if LibreOffice, poppler, pandoc, jupyter, or 7z is missing:
//!     check_dependencies().await?;
//!
//!     let registry = ProcessRegistry::new();
//!     let summary = run_all(
//!         Path::new("submissions/"),
//!         &config,
//!         &registry,
//!         gradeprep::progress::noop(),
//!     )
//!     .await?;
//!     println!(
//!         "{}/{} submissions processed",
//!         summary.successful_preprocessing, summary.total_submissions
//!     );
//!     Ok(())
//! }
//! ```
//!
//! ## On-disk contract
//!
//! After a successful run each submission contains:
//!
//! ```text
//! <submission>/processed/textual/*            # converted/copied documents
//! <submission>/processed/visual/*.jpg|png     # page images / bounded images
//! <submission>/processed/preprocess_info.json # manifest
//! ```
//!
//! A *missing* `processed/` directory means "not yet preprocessed";
//! failed submissions leave their evidence under
//! `#failed_preprocessing/<submission>/` instead.
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `gradeprep` binary (clap + anyhow + tracing-subscriber + indicatif) |

// ── Modules ──────────────────────────────────────────────────────────────

pub mod batch;
pub mod config;
pub mod error;
pub mod manifest;
pub mod normalize;
pub mod pipeline;
pub mod progress;
pub mod tools;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use batch::run_all;
pub use config::{PreprocessConfig, PreprocessConfigBuilder, SizeLimits};
pub use error::{ConversionKind, ConvertError, PreprocessError};
pub use manifest::{BatchSummary, FailureReport, PreprocessManifest};
pub use normalize::process_submission;
pub use pipeline::classify::{classify, FileCategory, Verdict};
pub use progress::{BatchProgress, NoopProgress};
pub use tools::{check_dependencies, ProcessRegistry};
