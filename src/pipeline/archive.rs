//! Archive expansion: turn a container file into the plain files inside it.
//!
//! Expansion is fail-soft by contract: student archives are routinely
//! truncated or corrupt, and a broken container must not abort the
//! submission. Whatever was extracted before the fault is returned;
//! the fault itself is only logged.
//!
//! Native formats (zip, tar, tar.gz, standalone gz) are unpacked
//! in-process; `.7z`, `.rar`, and bzip2-compressed tars go through the
//! external `7z` tool under the standard per-call timeout.

use crate::config::PreprocessConfig;
use crate::error::ConvertError;
use crate::tools::{run_tool, ProcessRegistry};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{error, info, warn};
use walkdir::WalkDir;

/// Extract `archive` into `target_dir` and return every file that ended
/// up inside, in a stable (sorted) order.
///
/// Never returns an error: extraction faults yield partial results.
pub async fn expand(
    archive: &Path,
    target_dir: &Path,
    config: &PreprocessConfig,
    registry: &ProcessRegistry,
) -> Vec<PathBuf> {
    if let Err(e) = try_expand(archive, target_dir, config, registry).await {
        error!("Failed to extract {}: {}", archive.display(), e);
    }

    let files = collect_files(target_dir);
    info!(
        "Extracted {} files from {}",
        files.len(),
        archive.file_name().unwrap_or_default().to_string_lossy()
    );
    files
}

async fn try_expand(
    archive: &Path,
    target_dir: &Path,
    config: &PreprocessConfig,
    registry: &ProcessRegistry,
) -> Result<(), ConvertError> {
    fs::create_dir_all(target_dir)?;
    let name = archive
        .file_name()
        .map(|n| n.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();

    if name.ends_with(".zip") {
        extract_zip(archive, target_dir)
    } else if name.ends_with(".tar") {
        let file = fs::File::open(archive)?;
        tar::Archive::new(file)
            .unpack(target_dir)
            .map_err(ConvertError::from)
    } else if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
        let file = fs::File::open(archive)?;
        tar::Archive::new(flate2::read::GzDecoder::new(file))
            .unpack(target_dir)
            .map_err(ConvertError::from)
    } else if name.ends_with(".7z") || name.ends_with(".rar") || name.ends_with(".bz2") {
        // 7z covers rar and bzip2 tars; -y answers prompts, -o has no
        // space before the path.
        let out_flag = format!("-o{}", target_dir.display());
        run_tool(
            registry,
            "7z",
            &[
                "x".to_string(),
                "-y".to_string(),
                out_flag,
                archive.display().to_string(),
            ],
            Duration::from_secs(config.tool_timeout_secs),
        )
        .await
        .map(|_| ())
    } else if name.ends_with(".gz") {
        extract_standalone_gz(archive, target_dir)
    } else {
        warn!("No extractor for {}", archive.display());
        Ok(())
    }
}

/// Unpack a zip entry by entry, skipping entries whose names escape the
/// target directory.
fn extract_zip(archive: &Path, target_dir: &Path) -> Result<(), ConvertError> {
    let file = fs::File::open(archive)?;
    let mut zip = zip::ZipArchive::new(file).map_err(|e| ConvertError::Io {
        detail: format!("zip open: {}", e),
    })?;

    for i in 0..zip.len() {
        let mut entry = zip.by_index(i).map_err(|e| ConvertError::Io {
            detail: format!("zip entry {}: {}", i, e),
        })?;
        // enclosed_name rejects ../ traversal and absolute paths.
        let out_path = match entry.enclosed_name() {
            Some(rel) => target_dir.join(rel),
            None => {
                warn!("Skipping unsafe zip entry name: {}", entry.name());
                continue;
            }
        };

        if entry.is_dir() {
            fs::create_dir_all(&out_path)?;
        } else {
            if let Some(parent) = out_path.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut out = fs::File::create(&out_path)?;
            std::io::copy(&mut entry, &mut out)?;
        }
    }
    Ok(())
}

/// Decompress a standalone `.gz` (not a tarball) to `<stem>`.
fn extract_standalone_gz(archive: &Path, target_dir: &Path) -> Result<(), ConvertError> {
    let stem = archive
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "extracted".to_string());
    let out_path = target_dir.join(stem);

    let file = fs::File::open(archive)?;
    let mut decoder = flate2::read::GzDecoder::new(file);
    let mut out = fs::File::create(&out_path)?;
    std::io::copy(&mut decoder, &mut out)?;
    Ok(())
}

/// Enumerate all files under `dir`, sorted for deterministic processing.
pub fn collect_files(dir: &Path) -> Vec<PathBuf> {
    WalkDir::new(dir)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn make_zip(dir: &Path, name: &str, entries: &[(&str, &[u8])]) -> PathBuf {
        let path = dir.join(name);
        let file = fs::File::create(&path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default();
        for (entry_name, bytes) in entries {
            writer.start_file(*entry_name, options).unwrap();
            writer.write_all(bytes).unwrap();
        }
        writer.finish().unwrap();
        path
    }

    #[tokio::test]
    async fn zip_round_trip_yields_all_files() {
        let dir = TempDir::new().unwrap();
        let archive = make_zip(
            dir.path(),
            "work.zip",
            &[
                ("answers.txt", b"1 + 1 = 2"),
                ("nested/proof.txt", b"qed"),
            ],
        );
        let target = dir.path().join("out");
        let files = expand(
            &archive,
            &target,
            &PreprocessConfig::default(),
            &ProcessRegistry::new(),
        )
        .await;

        let names: Vec<String> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(files.len(), 2);
        assert!(names.contains(&"answers.txt".to_string()));
        assert!(names.contains(&"proof.txt".to_string()));
    }

    #[tokio::test]
    async fn corrupt_zip_returns_partial_not_panic() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("broken.zip");
        fs::write(&archive, b"PK\x03\x04 this is not really a zip").unwrap();
        let target = dir.path().join("out");
        let files = expand(
            &archive,
            &target,
            &PreprocessConfig::default(),
            &ProcessRegistry::new(),
        )
        .await;
        assert!(files.is_empty());
    }

    #[tokio::test]
    async fn standalone_gz_decompresses_to_stem() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("notes.txt.gz");
        let file = fs::File::create(&archive).unwrap();
        let mut encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
        encoder.write_all(b"compressed homework").unwrap();
        encoder.finish().unwrap();

        let target = dir.path().join("out");
        let files = expand(
            &archive,
            &target,
            &PreprocessConfig::default(),
            &ProcessRegistry::new(),
        )
        .await;
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].file_name().unwrap(), "notes.txt");
        assert_eq!(fs::read(&files[0]).unwrap(), b"compressed homework");
    }

    #[tokio::test]
    async fn tar_gz_unpacks_tree() {
        let dir = TempDir::new().unwrap();
        // Build a small tar.gz in memory.
        let archive_path = dir.path().join("bundle.tar.gz");
        {
            let file = fs::File::create(&archive_path).unwrap();
            let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
            let mut builder = tar::Builder::new(encoder);
            let data = b"derivative rules";
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, "cheatsheet.txt", &data[..])
                .unwrap();
            builder.into_inner().unwrap().finish().unwrap();
        }

        let target = dir.path().join("out");
        let files = expand(
            &archive_path,
            &target,
            &PreprocessConfig::default(),
            &ProcessRegistry::new(),
        )
        .await;
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].file_name().unwrap(), "cheatsheet.txt");
    }

    #[test]
    fn collect_files_is_sorted() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("b.txt"), b"b").unwrap();
        fs::write(dir.path().join("a.txt"), b"a").unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub/c.txt"), b"c").unwrap();
        let files = collect_files(dir.path());
        let names: Vec<_> = files
            .iter()
            .map(|p| p.strip_prefix(dir.path()).unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["a.txt", "b.txt", "sub/c.txt"]);
    }
}
