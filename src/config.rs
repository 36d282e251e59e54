//! Configuration for the submission preprocessing pipeline.
//!
//! All pipeline behaviour is controlled through [`PreprocessConfig`], built
//! via its [`PreprocessConfigBuilder`]. Keeping every knob in one immutable
//! struct makes it trivial to share configs across worker tasks, serialise
//! them for logging, and diff two runs to understand why their outputs
//! differ.
//!
//! # Design choice: no construction-time side effects
//! The external-tool availability check is NOT part of building a config —
//! it is an explicit startup step ([`crate::tools::check_dependencies`])
//! the caller invokes once before the first submission is touched. A config
//! is pure data.

use crate::error::PreprocessError;
use serde::{Deserialize, Serialize};

/// Configuration for a preprocessing run.
///
/// Built via [`PreprocessConfig::builder()`] or using
/// [`PreprocessConfig::default()`].
///
/// # Example
/// ```rust
/// use gradeprep::PreprocessConfig;
///
/// let config = PreprocessConfig::builder()
///     .workers(8)
///     .max_pdf_pages(20)
///     .build()
///     .unwrap();
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreprocessConfig {
    /// Maximum PDF pages rendered to images per document. Default: 30.
    ///
    /// Longer documents are clamped to the first N pages (logged, not an
    /// error). Grading rarely needs more than 30 pages, and each rendered
    /// page is an LLM image upload downstream.
    pub max_pdf_pages: usize,

    /// Maximum image dimension (width or height) in pixels. Default: 2048.
    ///
    /// Images whose longer side exceeds this are downscaled preserving
    /// aspect ratio. 2048 px matches the input-size sweet spot of current
    /// vision models; larger uploads cost tokens without helping OCR.
    pub max_image_resolution: u32,

    /// Rendering DPI used when rasterising PDF pages. Default: 96.
    pub pdf_dpi: u32,

    /// JPEG quality for rendered and re-encoded images. Default: 85.
    pub jpeg_quality: u8,

    /// Minimum extracted character count for a PDF to count as
    /// text-bearing. Default: 50.
    ///
    /// Below this the PDF is treated as a scan: it still produces page
    /// images but no textual output.
    pub min_pdf_text_length: usize,

    /// Minimum alphanumeric+whitespace ratio for extracted PDF text to
    /// count as meaningful. Default: 0.7.
    ///
    /// Garbled extraction output (broken encodings, vector junk) tends to
    /// be symbol-heavy; real prose is not.
    pub min_pdf_text_ratio: f64,

    /// Per-category size ceilings, in megabytes.
    pub size_limits: SizeLimits,

    /// Timeout for a single external conversion-tool invocation, in
    /// seconds. Default: 300.
    ///
    /// LibreOffice and nbconvert occasionally hang on malformed input;
    /// the per-call timeout is the safety net that keeps one bad file
    /// from stalling a worker forever.
    pub tool_timeout_secs: u64,

    /// Timeout for the cheap text-extraction probe, in seconds. Default: 30.
    pub probe_timeout_secs: u64,

    /// Number of parallel submission workers. Default: 4. Use 1 for
    /// strictly sequential processing.
    pub workers: usize,

    /// Global deadline for an entire batch, in seconds. Default: 600.
    ///
    /// On expiry, outstanding submissions are cancelled and recorded as
    /// failed rather than blocking the summary forever.
    pub batch_timeout_secs: u64,

    /// Age after which a still-running child process is considered stale
    /// and killed by the sweep, in seconds. Default: 600.
    pub stale_process_secs: u64,

    /// Maximum nesting depth for archives-within-archives. Default: 8.
    ///
    /// A zip-bomb guard; archives nested deeper than this are skipped
    /// with a warning rather than expanded.
    pub max_archive_depth: usize,
}

/// Per-category file size ceilings in megabytes.
///
/// Fixed policy constants, not derived values: oversized inputs are
/// skipped (recorded, not failed) before any conversion is attempted.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SizeLimits {
    pub textual_mb: u64,
    pub visual_mb: u64,
    pub mixed_mb: u64,
    pub archive_mb: u64,
}

impl Default for SizeLimits {
    fn default() -> Self {
        Self {
            textual_mb: 5,
            visual_mb: 10,
            mixed_mb: 75,
            archive_mb: 100,
        }
    }
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            max_pdf_pages: 30,
            max_image_resolution: 2048,
            pdf_dpi: 96,
            jpeg_quality: 85,
            min_pdf_text_length: 50,
            min_pdf_text_ratio: 0.7,
            size_limits: SizeLimits::default(),
            tool_timeout_secs: 300,
            probe_timeout_secs: 30,
            workers: 4,
            batch_timeout_secs: 600,
            stale_process_secs: 600,
            max_archive_depth: 8,
        }
    }
}

impl PreprocessConfig {
    /// Create a new builder for `PreprocessConfig`.
    pub fn builder() -> PreprocessConfigBuilder {
        PreprocessConfigBuilder {
            config: Self::default(),
        }
    }
}

/// Builder for [`PreprocessConfig`].
#[derive(Debug)]
pub struct PreprocessConfigBuilder {
    config: PreprocessConfig,
}

impl PreprocessConfigBuilder {
    pub fn max_pdf_pages(mut self, n: usize) -> Self {
        self.config.max_pdf_pages = n.max(1);
        self
    }

    pub fn max_image_resolution(mut self, px: u32) -> Self {
        self.config.max_image_resolution = px.max(256);
        self
    }

    pub fn pdf_dpi(mut self, dpi: u32) -> Self {
        self.config.pdf_dpi = dpi.clamp(72, 400);
        self
    }

    pub fn jpeg_quality(mut self, q: u8) -> Self {
        self.config.jpeg_quality = q.clamp(1, 100);
        self
    }

    pub fn min_pdf_text_length(mut self, n: usize) -> Self {
        self.config.min_pdf_text_length = n;
        self
    }

    pub fn size_limits(mut self, limits: SizeLimits) -> Self {
        self.config.size_limits = limits;
        self
    }

    pub fn tool_timeout_secs(mut self, secs: u64) -> Self {
        self.config.tool_timeout_secs = secs.max(1);
        self
    }

    pub fn probe_timeout_secs(mut self, secs: u64) -> Self {
        self.config.probe_timeout_secs = secs.max(1);
        self
    }

    pub fn workers(mut self, n: usize) -> Self {
        self.config.workers = n.max(1);
        self
    }

    pub fn batch_timeout_secs(mut self, secs: u64) -> Self {
        self.config.batch_timeout_secs = secs.max(1);
        self
    }

    pub fn stale_process_secs(mut self, secs: u64) -> Self {
        self.config.stale_process_secs = secs.max(1);
        self
    }

    pub fn max_archive_depth(mut self, depth: usize) -> Self {
        self.config.max_archive_depth = depth.max(1);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<PreprocessConfig, PreprocessError> {
        let c = &self.config;
        if c.min_pdf_text_ratio <= 0.0 || c.min_pdf_text_ratio >= 1.0 {
            return Err(PreprocessError::InvalidConfig(format!(
                "min_pdf_text_ratio must be in (0, 1), got {}",
                c.min_pdf_text_ratio
            )));
        }
        if c.workers == 0 {
            return Err(PreprocessError::InvalidConfig("workers must be ≥ 1".into()));
        }
        Ok(self.config)
    }
}
