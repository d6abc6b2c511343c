//! Batch input collection: files, directories (non-recursive) and glob patterns.

use anyhow::{anyhow, Result};
use image::RgbImage;
use std::fs;
use std::path::{Path, PathBuf};

use crate::color_utils::symbols;

/// How strictly to treat missing or unsupported inputs
#[derive(Debug, Clone)]
pub struct ImageInputConfig {
    pub require_glob_matches: bool,
    pub strict_mode: bool,
}

impl Default for ImageInputConfig {
    fn default() -> Self {
        Self::strict()
    }
}

impl ImageInputConfig {
    pub fn strict() -> Self {
        Self {
            strict_mode: true,
            require_glob_matches: true,
        }
    }

    pub fn permissive() -> Self {
        Self {
            strict_mode: false,
            require_glob_matches: false,
        }
    }

    pub fn from_strict_flag(strict: bool) -> Self {
        if strict {
            Self::strict()
        } else {
            Self::permissive()
        }
    }
}

/// Supported: jpg, jpeg, png, webp, bmp, tiff, tif
pub fn is_supported_image_file(path: &Path) -> bool {
    path.extension()
        .map(|ext| {
            matches!(
                ext.to_string_lossy().to_lowercase().as_str(),
                "jpg" | "jpeg" | "png" | "webp" | "bmp" | "tiff" | "tif"
            )
        })
        .unwrap_or(false)
}

/// Image files directly inside `dir_path`, sorted
pub fn find_images_in_directory(dir_path: &Path) -> Result<Vec<PathBuf>> {
    let mut image_files = Vec::new();
    for entry in fs::read_dir(dir_path)? {
        let path = entry?.path();
        if path.is_file() && is_supported_image_file(&path) {
            image_files.push(path);
        }
    }
    image_files.sort();
    Ok(image_files)
}

fn is_glob_pattern(source: &str) -> bool {
    source.contains('*') || source.contains('?') || source.contains('[')
}

fn missing_source(message: String, config: &ImageInputConfig) -> Result<()> {
    if config.strict_mode {
        Err(anyhow!(message))
    } else {
        log::warn!("{}{message}", symbols::warning());
        Ok(())
    }
}

/// Collect image files from files, directories and glob patterns
pub fn collect_images_from_sources(
    sources: &[String],
    config: &ImageInputConfig,
) -> Result<Vec<PathBuf>> {
    let mut all_image_files = Vec::new();

    for source in sources {
        let source_path = Path::new(source);

        if source_path.is_file() {
            if is_supported_image_file(source_path) {
                all_image_files.push(source_path.to_path_buf());
            } else {
                missing_source(
                    format!(
                        "File is not a supported image format: {}",
                        source_path.display()
                    ),
                    config,
                )?;
            }
        } else if source_path.is_dir() {
            all_image_files.extend(find_images_in_directory(source_path)?);
        } else if !is_glob_pattern(source) {
            missing_source(format!("File does not exist: {source}"), config)?;
        } else {
            match glob::glob(source) {
                Ok(paths) => {
                    let mut found_any = false;
                    for path_result in paths {
                        match path_result {
                            Ok(path) if path.is_file() && is_supported_image_file(&path) => {
                                all_image_files.push(path);
                                found_any = true;
                            }
                            Ok(_) => {}
                            Err(e) => log::warn!(
                                "{}Error reading path in glob {source}: {e}",
                                symbols::warning()
                            ),
                        }
                    }
                    if !found_any && config.require_glob_matches {
                        return Err(anyhow!("No image files found matching pattern: {source}"));
                    }
                }
                Err(_) => missing_source(
                    format!("Source path does not exist and is not a valid glob pattern: {source}"),
                    config,
                )?,
            }
        }
    }

    all_image_files.sort();
    all_image_files.dedup();

    if all_image_files.is_empty() && config.strict_mode {
        return Err(anyhow!("No image files found in the specified sources"));
    }

    Ok(all_image_files)
}

/// Decode any supported format into RGB8
pub fn load_rgb_image(path: &Path) -> Result<RgbImage> {
    let image = image::open(path)
        .map_err(|e| anyhow!("Failed to read image {}: {e}", path.display()))?;
    Ok(image.to_rgb8())
}
