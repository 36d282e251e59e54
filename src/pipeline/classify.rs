//! File classification: decide whether a file enters the pipeline and
//! which output stream it feeds.
//!
//! Classification is a pure function of file metadata plus, for unknown
//! extensions, a 1 KiB content probe — it never writes anything. The
//! gates run in a fixed order (system junk → denylist → empty → category
//! → size ceiling) so that skip reasons are deterministic.

use crate::config::SizeLimits;
use std::io::Read;
use std::path::Path;

/// Which output stream a processable file feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileCategory {
    /// Plain text / source code — copied into `processed/textual`.
    Textual,
    /// Raster or vector images — bounded-resized into `processed/visual`.
    Visual,
    /// Documents carrying both text and layout (PDF, notebooks, office
    /// files, HTML) — converted into both streams.
    Mixed,
    /// Containers expanded in place by the flattener.
    Archive,
}

impl FileCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            FileCategory::Textual => "textual",
            FileCategory::Visual => "visual",
            FileCategory::Mixed => "mixed",
            FileCategory::Archive => "archive",
        }
    }

    /// Size ceiling for this category, in bytes.
    pub fn size_limit_bytes(self, limits: &SizeLimits) -> u64 {
        let mb = match self {
            FileCategory::Textual => limits.textual_mb,
            FileCategory::Visual => limits.visual_mb,
            FileCategory::Mixed => limits.mixed_mb,
            FileCategory::Archive => limits.archive_mb,
        };
        mb * 1024 * 1024
    }
}

/// Outcome of classifying one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Process(FileCategory),
    Skip(String),
}

impl Verdict {
    pub fn category(&self) -> Option<FileCategory> {
        match self {
            Verdict::Process(c) => Some(*c),
            Verdict::Skip(_) => None,
        }
    }
}

const TEXTUAL_EXTENSIONS: &[&str] = &[
    "txt", "py", "md", "json", "csv", "xml", "yaml", "yml", "js", "css", "sql", "r", "m", "c",
    "cpp", "h", "java", "php", "rb", "go", "rs", "swift", "kt", "scala", "tex",
];

const VISUAL_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "png", "gif", "bmp", "tiff", "tif", "svg", "webp", "ico", "eps",
];

const MIXED_EXTENSIONS: &[&str] = &[
    "pdf", "ipynb", "html", "pptx", "ppt", "docx", "doc", "odt", "rtf",
];

const ARCHIVE_EXTENSIONS: &[&str] = &["zip", "rar", "7z", "tar", "gz", "tgz", "bz2"];

/// Platform junk that should never reach conversion.
const SKIP_NAMES: &[&str] = &[".DS_Store", "Thumbs.db", "desktop.ini", "__MACOSX"];

/// Data/binary formats the downstream model cannot use.
const SKIP_EXTENSIONS: &[&str] = &[
    "npy", "npz", "pkl", "pickle", "mat", "rds", "rdata", "h5", "hdf5", "db", "sqlite",
    "sqlite3", "exe", "msi", "dmg", "app", "dll", "so", "dylib", "bin", "dat", "tmp", "log",
    "cache", "bak", "swp",
];

/// Lower-cased final extension, without the dot.
pub fn extension_of(path: &Path) -> String {
    path.extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default()
}

pub fn is_textual_extension(ext: &str) -> bool {
    TEXTUAL_EXTENSIONS.contains(&ext)
}

pub fn is_visual_extension(ext: &str) -> bool {
    VISUAL_EXTENSIONS.contains(&ext)
}

fn is_system_file(path: &Path) -> bool {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();

    if name.starts_with("._") {
        return true;
    }
    if name.starts_with('.') && !name.starts_with("..") {
        return true;
    }
    if SKIP_NAMES.contains(&name.as_str()) {
        return true;
    }
    // Archive-extraction metadata folders anywhere in the path.
    path.components()
        .any(|c| c.as_os_str().to_string_lossy() == "__MACOSX")
}

/// Probe the first 1 KiB: mostly printable text → textual.
fn sniff_is_text(path: &Path) -> bool {
    let mut buf = [0u8; 1024];
    let n = match std::fs::File::open(path).and_then(|mut f| f.read(&mut buf)) {
        Ok(n) => n,
        Err(_) => return false,
    };
    if n == 0 {
        return false;
    }
    let content = String::from_utf8_lossy(&buf[..n]);
    let total = content.chars().count();
    let printable = content
        .chars()
        .filter(|c| (!c.is_control() && *c != '\u{FFFD}') || c.is_whitespace())
        .count();
    printable as f64 / total as f64 > 0.8
}

/// Classify one file: should it be processed, and into which category?
///
/// Skip reasons are user-facing strings recorded verbatim in the
/// manifest's `skipped_files` list.
pub fn classify(path: &Path, limits: &SizeLimits) -> Verdict {
    if is_system_file(path) {
        return Verdict::Skip("System/hidden file".into());
    }

    let ext = extension_of(path);
    if SKIP_EXTENSIONS.contains(&ext.as_str()) {
        return Verdict::Skip("Unsupported file type".into());
    }

    let size = match path.metadata() {
        Ok(m) => m.len(),
        Err(_) => return Verdict::Skip("Cannot access file".into()),
    };
    if size == 0 {
        return Verdict::Skip("Empty file".into());
    }

    let category = if TEXTUAL_EXTENSIONS.contains(&ext.as_str()) {
        FileCategory::Textual
    } else if VISUAL_EXTENSIONS.contains(&ext.as_str()) {
        FileCategory::Visual
    } else if MIXED_EXTENSIONS.contains(&ext.as_str()) {
        FileCategory::Mixed
    } else if ARCHIVE_EXTENSIONS.contains(&ext.as_str()) {
        FileCategory::Archive
    } else if sniff_is_text(path) {
        FileCategory::Textual
    } else {
        return Verdict::Skip("Unknown binary file type".into());
    };

    let limit = category.size_limit_bytes(limits);
    if size > limit {
        return Verdict::Skip(format!(
            "File too large ({:.1}MB > {}MB)",
            size as f64 / (1024.0 * 1024.0),
            limit / (1024 * 1024)
        ));
    }

    Verdict::Process(category)
}
