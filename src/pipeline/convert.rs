//! Format conversion: anything → PDF, and anything → bounded page images.
//!
//! Conversion is inherently flaky — missing fonts, malformed office
//! files, tool crashes — so every external invocation is individually
//! time-boxed and every failure is folded into a [`ConvertError`] value.
//! Nothing in this module panics or propagates past the caller; one bad
//! file never aborts a batch.
//!
//! ## Why spawn_blocking for image work?
//!
//! Decoding and Lanczos-resampling a 4000×3000 scan is CPU-bound for
//! hundreds of milliseconds. Running it on the blocking pool keeps the
//! Tokio workers free to drive sibling submissions' subprocesses.

use crate::config::PreprocessConfig;
use crate::error::ConvertError;
use crate::pipeline::classify::{extension_of, is_visual_extension};
use crate::tools::{run_tool, ProcessRegistry};
use image::imageops::FilterType;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

const OFFICE_EXTENSIONS: &[&str] = &["docx", "doc", "odt", "rtf", "pptx", "ppt"];

/// Target PDF name: `<stem>.pdf` for PDFs, `<stem>_from_<ext>.pdf`
/// otherwise, so a `report.docx` and a `report.pdf` in the same
/// submission cannot collide in the textual output.
fn pdf_output_name(file: &Path, out_dir: &Path) -> PathBuf {
    let stem = file
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "converted".to_string());
    let ext = extension_of(file);
    if ext == "pdf" {
        out_dir.join(format!("{stem}.pdf"))
    } else {
        out_dir.join(format!("{stem}_from_{ext}.pdf"))
    }
}

/// Convert a mixed-format document to PDF inside `out_dir`.
///
/// Dispatch by extension: PDFs are copied verbatim, office formats go
/// through LibreOffice, HTML through pandoc/wkhtmltopdf, and notebooks
/// through nbconvert with an HTML fallback chain.
pub async fn convert_to_pdf(
    file: &Path,
    out_dir: &Path,
    config: &PreprocessConfig,
    registry: &ProcessRegistry,
) -> Result<PathBuf, ConvertError> {
    fs::create_dir_all(out_dir)?;
    let ext = extension_of(file);
    let output_path = pdf_output_name(file, out_dir);
    let timeout = Duration::from_secs(config.tool_timeout_secs);

    match ext.as_str() {
        "pdf" => {
            fs::copy(file, &output_path)?;
        }
        "ipynb" => {
            return convert_notebook(file, out_dir, &output_path, config, registry).await;
        }
        e if OFFICE_EXTENSIONS.contains(&e) => {
            run_tool(
                registry,
                "libreoffice",
                &[
                    "--headless".to_string(),
                    "--convert-to".to_string(),
                    "pdf".to_string(),
                    "--outdir".to_string(),
                    out_dir.display().to_string(),
                    file.display().to_string(),
                ],
                timeout,
            )
            .await?;

            // LibreOffice names its output after the bare stem; rename to
            // the collision-safe target.
            let produced = out_dir.join(format!(
                "{}.pdf",
                file.file_stem().unwrap_or_default().to_string_lossy()
            ));
            if produced.exists() && produced != output_path {
                fs::rename(&produced, &output_path)?;
            }
        }
        "html" => {
            run_tool(
                registry,
                "pandoc",
                &[
                    file.display().to_string(),
                    "-o".to_string(),
                    output_path.display().to_string(),
                    "--pdf-engine=wkhtmltopdf".to_string(),
                ],
                timeout,
            )
            .await?;
        }
        other => {
            return Err(ConvertError::Io {
                detail: format!("no PDF conversion route for .{other}"),
            });
        }
    }

    if output_path.exists() {
        info!(
            "Converted {} to PDF",
            file.file_name().unwrap_or_default().to_string_lossy()
        );
        Ok(output_path)
    } else {
        Err(ConvertError::MissingOutput { extension: ext })
    }
}

/// Notebook → PDF with a two-stage fallback: direct nbconvert first, then
/// nbconvert→HTML followed by pandoc. The intermediate HTML is removed on
/// every path; only a double failure marks the file failed.
async fn convert_notebook(
    file: &Path,
    out_dir: &Path,
    output_path: &Path,
    config: &PreprocessConfig,
    registry: &ProcessRegistry,
) -> Result<PathBuf, ConvertError> {
    let timeout = Duration::from_secs(config.tool_timeout_secs);
    let stem = file
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "notebook".to_string());

    // nbconvert writes <stem>.pdf; rename to the _from_ipynb target after.
    let direct = run_tool(
        registry,
        "jupyter",
        &[
            "nbconvert".to_string(),
            "--to".to_string(),
            "pdf".to_string(),
            "--output-dir".to_string(),
            out_dir.display().to_string(),
            "--output".to_string(),
            stem.clone(),
            file.display().to_string(),
        ],
        timeout,
    )
    .await;

    let produced = out_dir.join(format!("{stem}.pdf"));
    match direct {
        Ok(_) if produced.exists() => {
            if produced != *output_path {
                fs::rename(&produced, output_path)?;
            }
            info!(
                "Converted {} to PDF (direct)",
                file.file_name().unwrap_or_default().to_string_lossy()
            );
            return Ok(output_path.to_path_buf());
        }
        Ok(_) => {
            warn!("nbconvert exited cleanly but produced no PDF for {}", file.display());
        }
        Err(e) => {
            warn!("Direct PDF conversion failed for {}: {}", file.display(), e);
        }
    }

    // Fallback: notebook → HTML → PDF.
    let html_path = out_dir.join(format!("{stem}.html"));
    let via_html = async {
        run_tool(
            registry,
            "jupyter",
            &[
                "nbconvert".to_string(),
                "--to".to_string(),
                "html".to_string(),
                "--output-dir".to_string(),
                out_dir.display().to_string(),
                "--output".to_string(),
                stem.clone(),
                file.display().to_string(),
            ],
            timeout,
        )
        .await?;
        run_tool(
            registry,
            "pandoc",
            &[
                html_path.display().to_string(),
                "-o".to_string(),
                output_path.display().to_string(),
                "--pdf-engine=wkhtmltopdf".to_string(),
            ],
            timeout,
        )
        .await?;
        Ok::<(), ConvertError>(())
    }
    .await;

    let _ = fs::remove_file(&html_path);

    match via_html {
        Ok(()) if output_path.exists() => {
            info!(
                "Converted {} to PDF (via HTML)",
                file.file_name().unwrap_or_default().to_string_lossy()
            );
            Ok(output_path.to_path_buf())
        }
        Ok(()) => Err(ConvertError::NotebookFailed),
        Err(e) => {
            warn!("HTML fallback conversion failed for {}: {}", file.display(), e);
            Err(ConvertError::NotebookFailed)
        }
    }
}

/// Convert a file to one or more page images inside `out_dir`.
///
/// * visual formats — bounded resize (or verbatim copy when already
///   within the ceiling);
/// * PDFs — first N pages rasterised at the configured DPI, each page
///   then passed through the same bounding step;
/// * other mixed formats — converted to a throwaway PDF first, then
///   imaged like a PDF.
pub async fn convert_to_images(
    file: &Path,
    out_dir: &Path,
    config: &PreprocessConfig,
    registry: &ProcessRegistry,
) -> Result<Vec<PathBuf>, ConvertError> {
    fs::create_dir_all(out_dir)?;
    let ext = extension_of(file);

    let images = if is_visual_extension(&ext) {
        let dest = out_dir.join(file.file_name().unwrap_or_default());
        vec![bound_image(file.to_path_buf(), dest, config).await?]
    } else if ext == "pdf" {
        pdf_to_images(file, out_dir, config, registry).await?
    } else {
        // Mixed non-PDF: go through a temporary PDF, discarded afterwards.
        let tmp = tempfile::TempDir::new()?;
        let pdf = convert_to_pdf(file, tmp.path(), config, registry)
            .await
            .map_err(|e| ConvertError::Image {
                detail: format!("intermediate PDF conversion failed: {e}"),
            })?;
        pdf_to_images(&pdf, out_dir, config, registry).await?
    };

    info!(
        "Generated {} images from {}",
        images.len(),
        file.file_name().unwrap_or_default().to_string_lossy()
    );
    Ok(images)
}

/// Rasterise the first N pages of a PDF to `<stem>_page_<n>.jpg`.
async fn pdf_to_images(
    file: &Path,
    out_dir: &Path,
    config: &PreprocessConfig,
    registry: &ProcessRegistry,
) -> Result<Vec<PathBuf>, ConvertError> {
    let total_pages = pdf_page_count(file, config, registry).await?;
    let pages_to_render = total_pages.min(config.max_pdf_pages);
    if total_pages > config.max_pdf_pages {
        warn!(
            "PDF {} has {} pages, limiting to first {}",
            file.file_name().unwrap_or_default().to_string_lossy(),
            total_pages,
            config.max_pdf_pages
        );
    }

    run_tool(
        registry,
        "pdftoppm",
        &[
            "-jpeg".to_string(),
            "-r".to_string(),
            config.pdf_dpi.to_string(),
            "-l".to_string(),
            pages_to_render.to_string(),
            "-jpegopt".to_string(),
            format!("quality={}", config.jpeg_quality),
            file.display().to_string(),
            out_dir.join("page").display().to_string(),
        ],
        Duration::from_secs(config.tool_timeout_secs),
    )
    .await?;

    let stem = file
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "document".to_string());

    // pdftoppm writes page-1.jpg, page-2.jpg, … (zero-padded for larger
    // documents); rename to the per-document pattern and bound each one.
    let mut rendered: Vec<PathBuf> = fs::read_dir(out_dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .map(|n| {
                    let n = n.to_string_lossy();
                    n.starts_with("page-") && n.ends_with(".jpg")
                })
                .unwrap_or(false)
        })
        .collect();
    rendered.sort();

    let mut images = Vec::with_capacity(rendered.len());
    for page_file in rendered {
        let page_num = page_file
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default()
            .rsplit('-')
            .next()
            .unwrap_or("0")
            .to_string();
        let dest = out_dir.join(format!("{stem}_page_{page_num}.jpg"));
        fs::rename(&page_file, &dest)?;
        images.push(bound_image(dest.clone(), dest, config).await?);
    }
    Ok(images)
}

/// Read the page count via pdfinfo.
async fn pdf_page_count(
    file: &Path,
    config: &PreprocessConfig,
    registry: &ProcessRegistry,
) -> Result<usize, ConvertError> {
    let out = run_tool(
        registry,
        "pdfinfo",
        &[file.display().to_string()],
        Duration::from_secs(config.probe_timeout_secs),
    )
    .await?;

    let stdout = String::from_utf8_lossy(&out.stdout);
    stdout
        .lines()
        .find_map(|line| {
            line.strip_prefix("Pages:")
                .and_then(|rest| rest.trim().parse::<usize>().ok())
        })
        .ok_or_else(|| ConvertError::Image {
            detail: "pdfinfo reported no page count".into(),
        })
}

/// Downscale `src` to the resolution ceiling (preserving aspect ratio)
/// into `dest`, or copy verbatim when already within bounds. `src` and
/// `dest` may be the same path for in-place bounding.
async fn bound_image(
    src: PathBuf,
    dest: PathBuf,
    config: &PreprocessConfig,
) -> Result<PathBuf, ConvertError> {
    let max_dim = config.max_image_resolution;
    let quality = config.jpeg_quality;
    tokio::task::spawn_blocking(move || bound_image_blocking(&src, &dest, max_dim, quality))
        .await
        .map_err(|e| ConvertError::Image {
            detail: format!("image task panicked: {e}"),
        })?
}

fn bound_image_blocking(
    src: &Path,
    dest: &Path,
    max_dim: u32,
    quality: u8,
) -> Result<PathBuf, ConvertError> {
    let img = image::open(src)?;
    let (width, height) = (img.width(), img.height());

    if width.max(height) > max_dim {
        let resized = img.resize(max_dim, max_dim, FilterType::Lanczos3);
        save_image(&resized, dest, quality)?;
        info!(
            "Resized image {} from {}x{} to {}x{}",
            src.file_name().unwrap_or_default().to_string_lossy(),
            width,
            height,
            resized.width(),
            resized.height()
        );
    } else if src != dest {
        fs::copy(src, dest)?;
    }
    Ok(dest.to_path_buf())
}

/// Encode at the configured JPEG quality for .jpg targets; other formats
/// use their container defaults.
fn save_image(img: &image::DynamicImage, dest: &Path, quality: u8) -> Result<(), ConvertError> {
    let ext = extension_of(dest);
    if ext == "jpg" || ext == "jpeg" {
        let out = fs::File::create(dest)?;
        let mut writer = std::io::BufWriter::new(out);
        let mut encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut writer, quality);
        // JPEG has no alpha channel.
        encoder.encode_image(&img.to_rgb8())?;
        Ok(())
    } else {
        img.save(dest).map_err(ConvertError::from)
    }
}

/// Probe a PDF for extractable text.
///
/// Returns `(has_text, sample)`. A PDF counts as text-bearing when the
/// whitespace-normalised extraction output reaches the configured minimum
/// length with an alphanumeric+whitespace ratio above the threshold —
/// scans and vector-only pages fail both. Probe failures (timeout,
/// corrupt PDF) are treated as "no text": the document still gets page
/// images, so nothing is lost.
pub async fn has_extractable_text(
    pdf: &Path,
    config: &PreprocessConfig,
    registry: &ProcessRegistry,
) -> (bool, String) {
    let out = match run_tool(
        registry,
        "pdftotext",
        &[pdf.display().to_string(), "-".to_string()],
        Duration::from_secs(config.probe_timeout_secs),
    )
    .await
    {
        Ok(out) => out,
        Err(e) => {
            warn!("Error extracting text from {}: {}", pdf.display(), e);
            return (false, String::new());
        }
    };

    let raw = String::from_utf8_lossy(&out.stdout);
    let cleaned = raw.split_whitespace().collect::<Vec<_>>().join(" ");

    if cleaned.chars().count() >= config.min_pdf_text_length
        && alnum_whitespace_ratio(&cleaned) > config.min_pdf_text_ratio
    {
        (true, truncate_sample(&cleaned, 200))
    } else {
        (false, truncate_sample(&cleaned, 100))
    }
}

fn alnum_whitespace_ratio(text: &str) -> f64 {
    let total = text.chars().count();
    if total == 0 {
        return 0.0;
    }
    let good = text
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .count();
    good as f64 / total as f64
}

fn truncate_sample(text: &str, max_chars: usize) -> String {
    if text.chars().count() > max_chars {
        let cut: String = text.chars().take(max_chars).collect();
        format!("{cut}...")
    } else {
        text.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use tempfile::TempDir;

    #[test]
    fn pdf_output_name_disambiguates_sources() {
        let out = Path::new("/out");
        assert_eq!(
            pdf_output_name(Path::new("hw.pdf"), out),
            PathBuf::from("/out/hw.pdf")
        );
        assert_eq!(
            pdf_output_name(Path::new("hw.docx"), out),
            PathBuf::from("/out/hw_from_docx.pdf")
        );
        assert_eq!(
            pdf_output_name(Path::new("hw.IPYNB"), out),
            PathBuf::from("/out/hw_from_ipynb.pdf")
        );
    }

    #[test]
    fn alnum_ratio_separates_prose_from_junk() {
        assert!(alnum_whitespace_ratio("The derivative of x squared is 2x") > 0.9);
        assert!(alnum_whitespace_ratio("%%%&&&***((()))@@@!!!~~") < 0.1);
        assert_eq!(alnum_whitespace_ratio(""), 0.0);
    }

    #[test]
    fn truncate_sample_appends_ellipsis() {
        let long = "a".repeat(300);
        let s = truncate_sample(&long, 200);
        assert_eq!(s.chars().count(), 203);
        assert!(s.ends_with("..."));
        assert_eq!(truncate_sample("short", 200), "short");
    }

    #[tokio::test]
    async fn oversized_image_is_bounded_to_ceiling() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("big.png");
        RgbImage::from_pixel(4000, 3000, Rgb([120, 10, 10]))
            .save(&src)
            .unwrap();

        let config = PreprocessConfig::default();
        let dest = dir.path().join("out.png");
        let bounded = bound_image(src, dest, &config).await.unwrap();

        let img = image::open(&bounded).unwrap();
        assert_eq!(img.width().max(img.height()), 2048);
        // Aspect ratio preserved within rounding: 4000:3000 → 2048:1536.
        assert_eq!(img.height(), 1536);
    }

    #[tokio::test]
    async fn small_image_is_copied_verbatim() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("small.png");
        RgbImage::from_pixel(640, 480, Rgb([0, 200, 0]))
            .save(&src)
            .unwrap();
        let original_bytes = fs::read(&src).unwrap();

        let config = PreprocessConfig::default();
        let dest = dir.path().join("copied.png");
        bound_image(src, dest.clone(), &config).await.unwrap();

        assert_eq!(fs::read(&dest).unwrap(), original_bytes);
    }

    #[tokio::test]
    async fn oversized_jpeg_reencodes_as_jpeg() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("scan.jpg");
        RgbImage::from_pixel(3000, 3000, Rgb([200, 200, 200]))
            .save(&src)
            .unwrap();

        let config = PreprocessConfig::default();
        let out = bound_image(src.clone(), src.clone(), &config).await.unwrap();
        let img = image::open(&out).unwrap();
        assert_eq!(img.width(), 2048);
        assert_eq!(img.height(), 2048);
    }

    #[tokio::test]
    async fn unreadable_image_yields_convert_error() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("fake.png");
        fs::write(&src, b"not an image at all").unwrap();

        let config = PreprocessConfig::default();
        let err = bound_image(src.clone(), dir.path().join("out.png"), &config)
            .await
            .unwrap_err();
        assert!(matches!(err, ConvertError::Image { .. }));
    }

    #[tokio::test]
    async fn unroutable_extension_is_reported_not_panicked() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("data.csv");
        fs::write(&src, b"a,b\n1,2\n").unwrap();
        let err = convert_to_pdf(
            &src,
            dir.path(),
            &PreprocessConfig::default(),
            &ProcessRegistry::new(),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("no PDF conversion route"));
    }
}
