//! Model weight acquisition: local paths, download cache and remote fetch.
//!
//! Weights are looked up in this order:
//! 1. `--model-path`
//! 2. `BUBBLE_CLEAN_MODEL_PATH`
//! 3. `--model-url` (with optional `--model-checksum`)
//! 4. the default model, with `BUBBLE_CLEAN_MODEL_URL` / `BUBBLE_CLEAN_MODEL_CHECKSUM` overrides
//!
//! Remote fetches go through the download cache and are retried a bounded
//! number of times with a fixed delay.

use crate::color_utils::progress::{add_progress_bar, remove_progress_bar};
use crate::color_utils::symbols;
use anyhow::{anyhow, Result};
use indicatif::{ProgressBar, ProgressStyle};
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const MODEL_PATH_ENV: &str = "BUBBLE_CLEAN_MODEL_PATH";
pub const MODEL_URL_ENV: &str = "BUBBLE_CLEAN_MODEL_URL";
pub const MODEL_CHECKSUM_ENV: &str = "BUBBLE_CLEAN_MODEL_CHECKSUM";
pub const CACHE_DIR_ENV: &str = "BUBBLE_CLEAN_CACHE_DIR";

/// Version tag of the default segmentation model
pub const MODEL_VERSION: &str = "modelev1";

/// Model information for caching and verification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelInfo {
    pub name: String,
    pub url: String,
    pub md5_checksum: Option<String>,
    pub filename: String,
}

/// The published text-region segmentation model
pub fn default_model_info() -> ModelInfo {
    ModelInfo {
        name: format!("comic-text-seg-{MODEL_VERSION}"),
        url: "https://huggingface.co/HaashS/modelev1/resolve/main/model_final.onnx".to_string(),
        md5_checksum: None,
        filename: "model_final.onnx".to_string(),
    }
}

/// Default model info with `BUBBLE_CLEAN_MODEL_URL` / `BUBBLE_CLEAN_MODEL_CHECKSUM` applied
pub fn default_model_info_with_env_overrides() -> ModelInfo {
    let mut info = default_model_info();

    if let Ok(url) = std::env::var(MODEL_URL_ENV) {
        log::debug!("🔄 Using model URL from {MODEL_URL_ENV}: {url}");
        info.filename = filename_from_url(&url);
        info.url = url;
        // A different URL invalidates the default checksum
        info.md5_checksum = None;
    }
    if let Ok(checksum) = std::env::var(MODEL_CHECKSUM_ENV) {
        log::debug!("🔄 Using model checksum from {MODEL_CHECKSUM_ENV}: {checksum}");
        info.md5_checksum = Some(checksum);
    }
    info
}

fn filename_from_url(url: &str) -> String {
    url.split('?')
        .next()
        .and_then(|u| u.rsplit('/').next())
        .filter(|name| !name.is_empty())
        .unwrap_or("custom_model.onnx")
        .to_string()
}

/// Platform cache directory
pub fn get_cache_base_dir() -> Result<PathBuf> {
    dirs::cache_dir().ok_or_else(|| anyhow!("Unable to determine cache directory"))
}

/// Cache directory with environment variable override and `~/` expansion
pub fn get_cache_dir_with_env_override(env_var: &str, default_subdir: &str) -> Result<PathBuf> {
    if let Ok(cache_dir) = std::env::var(env_var) {
        if let Some(stripped) = cache_dir.strip_prefix("~/") {
            if let Some(home_dir) = dirs::home_dir() {
                return Ok(home_dir.join(stripped));
            }
        }
        return Ok(PathBuf::from(cache_dir));
    }

    get_cache_base_dir().map(|dir| dir.join(default_subdir))
}

/// Directory holding downloaded model weights
pub fn get_cache_dir() -> Result<PathBuf> {
    get_cache_dir_with_env_override(CACHE_DIR_ENV, "bubble-clean/models")
}

/// Directory holding compiled CoreML models
pub fn get_coreml_cache_dir() -> Result<PathBuf> {
    get_cache_base_dir().map(|dir| dir.join("bubble-clean").join("coreml"))
}

pub fn calculate_md5(path: &Path) -> Result<String> {
    let contents = fs::read(path)?;
    Ok(calculate_md5_bytes(&contents))
}

pub fn calculate_md5_bytes(bytes: &[u8]) -> String {
    let mut hasher = md5::Context::new();
    hasher.consume(bytes);
    format!("{:x}", hasher.compute())
}

pub fn verify_checksum(path: &Path, expected_md5: &str) -> Result<bool> {
    Ok(calculate_md5(path)?.eq_ignore_ascii_case(expected_md5))
}

/// Reject empty weight files
pub fn validate_model_file_size(path: &Path) -> Result<()> {
    let file_size = fs::metadata(path)
        .map_err(|e| anyhow!("Cannot read model file {}: {e}", path.display()))?
        .len();

    if file_size == 0 {
        return Err(anyhow!(
            "Model file is empty (0 bytes): {}",
            path.display()
        ));
    }

    log::debug!(
        "✓ Model file size: {:.2} MB",
        file_size as f64 / (1024.0 * 1024.0)
    );
    Ok(())
}

/// Bounded retry with a fixed delay between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_secs(5),
        }
    }
}

/// Result of a retried fetch
#[derive(Debug)]
pub enum FetchOutcome {
    Fetched { path: PathBuf, attempts: u32 },
    Exhausted { attempts: u32, last_error: anyhow::Error },
}

impl FetchOutcome {
    /// Turn exhaustion into an error
    pub fn into_result(self) -> Result<PathBuf> {
        match self {
            FetchOutcome::Fetched { path, .. } => Ok(path),
            FetchOutcome::Exhausted {
                attempts,
                last_error,
            } => Err(anyhow!(
                "Model download failed after {attempts} attempt(s): {last_error}"
            )),
        }
    }
}

/// Call `fetch(url, dest)` until it succeeds or the policy is exhausted.
///
/// A failed attempt removes whatever partial file it left behind.
pub fn fetch_with_retry<F>(policy: &RetryPolicy, url: &str, dest: &Path, mut fetch: F) -> FetchOutcome
where
    F: FnMut(&str, &Path) -> Result<()>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut last_error = anyhow!("no download attempted");

    for attempt in 1..=max_attempts {
        match fetch(url, dest) {
            Ok(()) => {
                return FetchOutcome::Fetched {
                    path: dest.to_path_buf(),
                    attempts: attempt,
                }
            }
            Err(e) => {
                let _ = fs::remove_file(dest);
                if attempt < max_attempts {
                    log::warn!(
                        "{} Download attempt {attempt}/{max_attempts} failed: {e}; retrying in {}s",
                        symbols::retrying(),
                        policy.delay.as_secs_f32()
                    );
                    std::thread::sleep(policy.delay);
                } else {
                    log::warn!(
                        "{}Download attempt {attempt}/{max_attempts} failed: {e}",
                        symbols::warning()
                    );
                }
                last_error = e;
            }
        }
    }

    FetchOutcome::Exhausted {
        attempts: max_attempts,
        last_error,
    }
}

/// Stream `url` into `output_path` with a progress bar
pub fn download_model(url: &str, output_path: &Path) -> Result<()> {
    log::info!("{} Downloading model from {url}", symbols::downloading());

    if let Some(parent) = output_path.parent() {
        fs::create_dir_all(parent)?;
    }

    let client = reqwest::blocking::Client::builder()
        .redirect(reqwest::redirect::Policy::limited(10))
        .build()?;

    let mut response = client
        .get(url)
        .send()
        .map_err(|e| anyhow!("Failed to send HTTP request: {e}"))?;

    let status = response.status();
    log::debug!("📡 HTTP response status: {status}");
    if !status.is_success() {
        return Err(anyhow!("HTTP request failed with status: {status}"));
    }

    let content_length = response.content_length();
    let progress_bar = match content_length {
        Some(length) => {
            log::info!(
                "📏 Download size: {:.1} MB",
                length as f64 / (1024.0 * 1024.0)
            );
            let style = ProgressStyle::default_bar()
                .template(
                    "[{elapsed_precise}] [{bar:30}] {bytes}/{total_bytes} ({bytes_per_sec}, ETA {eta})",
                )
                .map_err(|e| anyhow!("Failed to create progress style: {e}"))?
                .progress_chars("#> ");
            let pb = add_progress_bar(ProgressBar::new(length));
            pb.set_style(style);
            pb
        }
        None => {
            let pb = add_progress_bar(ProgressBar::new_spinner());
            pb.set_message("Downloading model (unknown size)...");
            pb.enable_steady_tick(Duration::from_millis(100));
            pb
        }
    };

    let mut file = fs::File::create(output_path)
        .map_err(|e| anyhow!("Failed to create {}: {e}", output_path.display()))?;

    let mut downloaded = 0u64;
    let mut buffer = [0u8; 8192];
    loop {
        let bytes_read = response
            .read(&mut buffer)
            .map_err(|e| anyhow!("Failed to read response data: {e}"))?;
        if bytes_read == 0 {
            break;
        }
        file.write_all(&buffer[..bytes_read])
            .map_err(|e| anyhow!("Failed to write to {}: {e}", output_path.display()))?;
        downloaded += bytes_read as u64;
        progress_bar.set_position(downloaded);
    }

    file.flush()?;
    file.sync_all()?;
    drop(file);

    progress_bar.finish_and_clear();
    remove_progress_bar(&progress_bar);

    if downloaded == 0 {
        return Err(anyhow!("Downloaded file is empty (0 bytes)"));
    }
    if let Some(expected) = content_length {
        if downloaded != expected {
            return Err(anyhow!(
                "Truncated download: expected {expected} bytes, got {downloaded}"
            ));
        }
    }

    log::debug!("📦 Downloaded {downloaded} bytes to {}", output_path.display());
    Ok(())
}

/// Cache file name; includes the checksum when one is known
pub fn cached_file_name(model_info: &ModelInfo) -> String {
    match &model_info.md5_checksum {
        Some(checksum) => match model_info.filename.rsplit_once('.') {
            Some((name, ext)) => format!("{name}-{checksum}.{ext}"),
            None => format!("{}-{checksum}", model_info.filename),
        },
        None => model_info.filename.clone(),
    }
}

/// Whether a cached file can be used as is
fn cached_model_is_valid(model_path: &Path, model_info: &ModelInfo) -> Result<bool> {
    if !model_path.exists() {
        return Ok(false);
    }
    if fs::metadata(model_path)?.len() == 0 {
        log::warn!("{}Cached model file is empty, re-downloading", symbols::warning());
        return Ok(false);
    }

    match &model_info.md5_checksum {
        Some(checksum) => {
            if verify_checksum(model_path, checksum)? {
                Ok(true)
            } else {
                log::warn!(
                    "{}Cached model has invalid checksum, re-downloading\n   Expected: {checksum}\n   Actual:   {}",
                    symbols::warning(),
                    calculate_md5(model_path).unwrap_or_default()
                );
                Ok(false)
            }
        }
        None => {
            log::debug!("No checksum configured; using cached model without verification");
            Ok(true)
        }
    }
}

/// Return the cached weights, fetching them with `fetch` if missing or invalid
pub fn get_or_fetch_model<F>(
    model_info: &ModelInfo,
    cache_dir: &Path,
    policy: &RetryPolicy,
    fetch: F,
) -> Result<PathBuf>
where
    F: FnMut(&str, &Path) -> Result<()>,
{
    let model_path = cache_dir.join(cached_file_name(model_info));
    log::debug!("📄 Model path: {}", model_path.display());

    if cached_model_is_valid(&model_path, model_info)? {
        log::info!(
            "{} Using cached model: {}",
            symbols::completed_successfully(),
            model_path.display()
        );
        return Ok(model_path);
    }
    if model_path.exists() {
        fs::remove_file(&model_path)?;
    }

    fs::create_dir_all(cache_dir)
        .map_err(|e| anyhow!("Failed to create cache dir {}: {e}", cache_dir.display()))?;

    // Download beside the final name and rename, so readers never see a partial file
    let partial_path = cache_dir.join(format!(
        "{}.{}.part",
        cached_file_name(model_info),
        std::process::id()
    ));
    let fetched = fetch_with_retry(policy, &model_info.url, &partial_path, fetch).into_result()?;

    if let Some(checksum) = &model_info.md5_checksum {
        let actual = calculate_md5(&fetched)?;
        if !actual.eq_ignore_ascii_case(checksum) {
            let _ = fs::remove_file(&fetched);
            return Err(anyhow!(
                "Downloaded model failed checksum verification.\n\
                 Expected checksum: {checksum}\n\
                 Actual checksum:   {actual}\n\
                 Model URL: {}",
                model_info.url
            ));
        }
    } else {
        log::warn!(
            "{}Model downloaded but no checksum provided to verify download",
            symbols::warning()
        );
    }

    fs::rename(&fetched, &model_path)?;
    log::info!(
        "{} Model stored at {}",
        symbols::completed_successfully(),
        model_path.display()
    );
    Ok(model_path)
}

/// [`get_or_fetch_model`] against the real cache directory and network
pub fn get_or_download_model(model_info: &ModelInfo, policy: &RetryPolicy) -> Result<PathBuf> {
    let cache_dir = get_cache_dir()?;
    log::debug!("🗂️  Cache directory: {}", cache_dir.display());
    get_or_fetch_model(model_info, &cache_dir, policy, download_model)
}

/// Model location options from the command line
#[derive(Debug, Clone, Default)]
pub struct CliModelInfo {
    pub model_path: Option<String>,
    pub model_url: Option<String>,
    pub model_checksum: Option<String>,
}

impl CliModelInfo {
    pub fn validate(&self) -> Result<()> {
        if self.model_path.is_some() && self.model_url.is_some() {
            return Err(anyhow!(
                "Cannot specify both --model-path and --model-url. Choose one."
            ));
        }
        if self.model_checksum.is_some() && self.model_url.is_none() {
            return Err(anyhow!(
                "--model-checksum can only be used with --model-url"
            ));
        }
        Ok(())
    }
}

fn existing_local_model(path: &str, origin: &str) -> Result<PathBuf> {
    let path = PathBuf::from(path);
    if !path.exists() {
        return Err(anyhow!(
            "Model path specified with {origin} does not exist: {}",
            path.display()
        ));
    }
    validate_model_file_size(&path)?;
    Ok(path)
}

/// Locate usable weights, downloading them if no local copy is configured
pub fn resolve_model_path(cli: &CliModelInfo, policy: &RetryPolicy) -> Result<PathBuf> {
    cli.validate()?;

    if let Some(path) = &cli.model_path {
        log::info!("🔧 Using CLI-provided model path: {path}");
        return existing_local_model(path, "--model-path");
    }

    if let Ok(path) = std::env::var(MODEL_PATH_ENV) {
        log::info!("🔧 Using model path from {MODEL_PATH_ENV}: {path}");
        return existing_local_model(&path, MODEL_PATH_ENV);
    }

    let info = match &cli.model_url {
        Some(url) => {
            log::info!("🔧 Using CLI-provided model URL: {url}");
            ModelInfo {
                name: "cli-provided".to_string(),
                url: url.clone(),
                md5_checksum: cli.model_checksum.clone(),
                filename: filename_from_url(url),
            }
        }
        None => default_model_info_with_env_overrides(),
    };

    let path = get_or_download_model(&info, policy)?;
    validate_model_file_size(&path)?;
    Ok(path)
}
