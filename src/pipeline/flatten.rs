//! Directory flattening: reduce a submission's raw file tree to one flat
//! list of processable files in a scratch directory.
//!
//! The walk is deterministic (sorted), skips anything under a `processed`
//! path segment so reruns never ingest their own output, and expands
//! archives recursively until no archive files remain — a nested
//! `zip`-in-`zip` is treated the same as a directory-in-directory, up to
//! a depth cap guarding against archive bombs.

use crate::config::PreprocessConfig;
use crate::manifest::SkippedFile;
use crate::pipeline::archive;
use crate::pipeline::classify::{classify, FileCategory, Verdict};
use crate::tools::ProcessRegistry;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Result of flattening one submission.
#[derive(Debug, Default)]
pub struct FlattenOutcome {
    /// Processable files, all living under the scratch directory (copies)
    /// or its extraction subdirectories.
    pub files: Vec<PathBuf>,
    /// Files excluded during the walk, with the reasons recorded in the
    /// manifest. System junk is logged but not recorded.
    pub skipped: Vec<SkippedFile>,
}

/// Flatten `source_dir` into `scratch_dir`.
///
/// Archives are expanded in place (recursively); everything else is
/// copied into the scratch root with collision-suffixed names.
pub async fn flatten(
    source_dir: &Path,
    scratch_dir: &Path,
    config: &PreprocessConfig,
    registry: &ProcessRegistry,
) -> std::io::Result<FlattenOutcome> {
    fs::create_dir_all(scratch_dir)?;
    let mut outcome = FlattenOutcome::default();

    let entries: Vec<PathBuf> = WalkDir::new(source_dir)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|p| !under_processed(p.strip_prefix(source_dir).unwrap_or(p)))
        .collect();

    for item in entries {
        match classify(&item, &config.size_limits) {
            Verdict::Skip(reason) => record_skip(&mut outcome, &item, reason),
            Verdict::Process(FileCategory::Archive) => {
                expand_recursively(&item, scratch_dir, config, registry, &mut outcome).await;
            }
            Verdict::Process(_) => {
                let target = unique_path(scratch_dir, &item);
                fs::copy(&item, &target)?;
                outcome.files.push(target);
            }
        }
    }

    info!(
        "Flattened {} into {} processable files ({} skipped)",
        source_dir.display(),
        outcome.files.len(),
        outcome.skipped.len()
    );
    Ok(outcome)
}

/// Expand an archive and classify its contents; nested archives are
/// queued for further expansion until none remain or the depth cap hits.
async fn expand_recursively(
    archive_path: &Path,
    scratch_dir: &Path,
    config: &PreprocessConfig,
    registry: &ProcessRegistry,
    outcome: &mut FlattenOutcome,
) {
    let mut pending: Vec<(PathBuf, usize)> = vec![(archive_path.to_path_buf(), 0)];

    while let Some((arch, depth)) = pending.pop() {
        if depth >= config.max_archive_depth {
            warn!(
                "Archive nesting deeper than {} at {}; skipping",
                config.max_archive_depth,
                arch.display()
            );
            record_skip(outcome, &arch, "Archive nested too deeply".to_string());
            continue;
        }

        let extract_dir = unique_extract_dir(scratch_dir, &arch);
        let extracted = archive::expand(&arch, &extract_dir, config, registry).await;

        for file in extracted {
            match classify(&file, &config.size_limits) {
                Verdict::Skip(reason) => record_skip(outcome, &file, reason),
                Verdict::Process(FileCategory::Archive) => pending.push((file, depth + 1)),
                Verdict::Process(_) => outcome.files.push(file),
            }
        }
    }
}

fn record_skip(outcome: &mut FlattenOutcome, path: &Path, reason: String) {
    if reason == "System/hidden file" {
        debug!("Skipping {}: {}", path.display(), reason);
        return;
    }
    info!(
        "Skipping {}: {}",
        path.file_name().unwrap_or_default().to_string_lossy(),
        reason
    );
    outcome.skipped.push(SkippedFile {
        filename: path
            .file_name()
            .unwrap_or_default()
            .to_string_lossy()
            .to_string(),
        size: path.metadata().map(|m| m.len()).unwrap_or(0),
        reason,
    });
}

/// True when any path component is the `processed` output marker.
fn under_processed(path: &Path) -> bool {
    path.components()
        .any(|c| c.as_os_str().to_string_lossy() == "processed")
}

/// Join `dir` and the file name of `src`, suffixing `_1`, `_2`, … before
/// the extension until the name is free.
fn unique_path(dir: &Path, src: &Path) -> PathBuf {
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

/// Allocate a fresh `extracted_<stem>` directory for an archive.
fn unique_extract_dir(scratch_dir: &Path, archive: &Path) -> PathBuf {
    let stem = archive
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "archive".to_string());
    let mut dir = scratch_dir.join(format!("extracted_{stem}"));
    let mut counter = 1;
    while dir.exists() {
        dir = scratch_dir.join(format!("extracted_{stem}_{counter}"));
        counter += 1;
    }
    dir
}
