//! Error types for the gradeprep library.
//!
//! Two distinct error types reflect two distinct failure modes:
//!
//! * [`PreprocessError`] — **Fatal**: the run cannot proceed at all
//!   (required external tools missing, invalid configuration, the
//!   submissions directory unreadable). Returned as `Err(PreprocessError)`
//!   from the top-level entry points.
//!
//! * [`ConvertError`] — **Non-fatal**: a single file failed to convert
//!   (tool crash, timeout, missing output, unreadable image). Recorded in
//!   the submission's failure bookkeeping so sibling files keep
//!   processing; it never crosses a component boundary as `Err` of a
//!   public pipeline operation.
//!
//! The separation mirrors the failure taxonomy of the pipeline: a missing
//! tool fails every submission identically, so the run aborts before any
//! work starts; a bad file fails only its own submission, and only after
//! every other file in it has been given a chance.

use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the gradeprep library.
///
/// Per-file failures use [`ConvertError`] and are aggregated into failure
/// reports rather than propagated here.
#[derive(Debug, Error)]
pub enum PreprocessError {
    /// One or more required external tools are not on PATH.
    ///
    /// Checked once at startup; every submission would fail without them,
    /// so the run aborts before processing begins.
    #[error(
        "Missing required external tools: {tools:?}\n\
         Install them and re-run; every conversion depends on these."
    )]
    MissingTools { tools: Vec<String> },

    /// The submissions directory does not exist or is not a directory.
    #[error("Submissions directory not found: '{path}'")]
    SubmissionsDirNotFound { path: PathBuf },

    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Filesystem error that prevents the run from continuing.
    #[error("I/O error at '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl PreprocessError {
    /// Wrap an `io::Error` with the path it occurred at.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Which conversion produced a failure.
///
/// Serialised into failure reports so a retry can tell whether the
/// textual or the visual leg of a mixed file broke.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ConversionKind {
    #[serde(rename = "PDF")]
    Pdf,
    Image,
}

impl std::fmt::Display for ConversionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConversionKind::Pdf => write!(f, "PDF"),
            ConversionKind::Image => write!(f, "Image"),
        }
    }
}

/// A non-fatal error for a single file conversion.
///
/// A timeout is deliberately a distinct variant from a non-zero exit:
/// timeouts point at hung tools (retry may help), exits point at bad
/// input (retry usually will not).
#[derive(Debug, Clone, Error)]
pub enum ConvertError {
    /// External tool exceeded its per-call timeout and was killed.
    #[error("{tool} timed out after {secs}s")]
    Timeout { tool: String, secs: u64 },

    /// External tool exited non-zero.
    #[error("{tool} failed ({status}): {stderr}")]
    ToolFailed {
        tool: String,
        status: String,
        stderr: String,
    },

    /// External tool could not be spawned at all.
    #[error("{tool} could not be started: {detail}")]
    SpawnFailed { tool: String, detail: String },

    /// Tool exited zero but the expected output file never appeared.
    #[error("output file not created for {extension} file")]
    MissingOutput { extension: String },

    /// Notebook conversion failed on both the direct and the HTML
    /// fallback path.
    #[error(
        "Jupyter notebook conversion failed (both direct PDF and HTML→PDF methods failed)"
    )]
    NotebookFailed,

    /// Image could not be decoded, resized, or re-encoded.
    #[error("image processing failed: {detail}")]
    Image { detail: String },

    /// Filesystem error while copying or renaming conversion output.
    #[error("I/O error: {detail}")]
    Io { detail: String },
}

impl ConvertError {
    /// Truncate a stderr blob to a reportable single-line reason.
    pub fn trim_detail(raw: &str) -> String {
        let flat = raw.split_whitespace().collect::<Vec<_>>().join(" ");
        if flat.len() > 100 {
            let mut cut = 100;
            while !flat.is_char_boundary(cut) {
                cut -= 1;
            }
            format!("{}…", &flat[..cut])
        } else {
            flat
        }
    }
}

impl From<std::io::Error> for ConvertError {
    fn from(e: std::io::Error) -> Self {
        ConvertError::Io {
            detail: e.to_string(),
        }
    }
}

impl From<image::ImageError> for ConvertError {
    fn from(e: image::ImageError) -> Self {
        ConvertError::Image {
            detail: e.to_string(),
        }
    }
}
