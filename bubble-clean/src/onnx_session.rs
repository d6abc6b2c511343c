use crate::color_utils::symbols;
use crate::model_access;
use anyhow::{anyhow, Result};
use log::Level;
use ort::{
    execution_providers::{
        CPUExecutionProvider, CUDAExecutionProvider, CoreMLExecutionProvider,
        ExecutionProvider, ExecutionProviderDispatch,
    },
    logging::LogLevel,
    session::Session,
};
use serde::Serialize;
use std::fs;
use std::path::Path;

/// Devices accepted by `--device`
pub const SUPPORTED_DEVICES: &[&str] = &["auto", "cpu", "cuda", "coreml"];

fn ort_level_from_log(level: Level) -> LogLevel {
    match level {
        // ONNX info output is closer to our trace
        Level::Trace => LogLevel::Verbose,
        Level::Debug => LogLevel::Warning,
        Level::Info => LogLevel::Error,
        Level::Warn => LogLevel::Error,
        Level::Error => LogLevel::Fatal,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub model_path: String,
    pub model_size_bytes: usize,
    pub model_checksum: String,
    pub execution_providers: Vec<String>,
}

/// Device selection result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSelection {
    pub device: String,
    pub reason: String,
}

/// Resolve the requested device once; `auto` prefers CUDA, then CoreML, then CPU
pub fn determine_optimal_device(requested_device: &str) -> DeviceSelection {
    match requested_device {
        "auto" => {
            if matches!(CUDAExecutionProvider::default().is_available(), Ok(true)) {
                DeviceSelection {
                    device: "cuda".to_string(),
                    reason: "Auto-selected CUDA (available)".to_string(),
                }
            } else if matches!(CoreMLExecutionProvider::default().is_available(), Ok(true)) {
                DeviceSelection {
                    device: "coreml".to_string(),
                    reason: "Auto-selected CoreML (available)".to_string(),
                }
            } else {
                DeviceSelection {
                    device: "cpu".to_string(),
                    reason: "Auto-selected CPU (no accelerator available)".to_string(),
                }
            }
        }
        other => DeviceSelection {
            device: other.to_string(),
            reason: format!("User explicitly chose {other}"),
        },
    }
}

fn coreml_provider(model_bytes: &[u8]) -> CoreMLExecutionProvider {
    let cache_dir = model_access::get_coreml_cache_dir().map(|base| {
        let hash = model_access::calculate_md5_bytes(model_bytes);
        base.join(format!("{}_{}", &hash[..8], env!("CARGO_PKG_VERSION").replace('.', "_")))
    });

    match cache_dir {
        Ok(dir) => {
            if let Err(e) = fs::create_dir_all(&dir) {
                log::warn!(
                    "{}Failed to create CoreML cache directory: {e}",
                    symbols::warning()
                );
                return CoreMLExecutionProvider::default();
            }
            match dir.to_str() {
                Some(dir_str) => {
                    log::debug!("🗂️  Configuring CoreML model cache: {dir_str}");
                    CoreMLExecutionProvider::default().with_model_cache_dir(dir_str)
                }
                None => CoreMLExecutionProvider::default(),
            }
        }
        Err(e) => {
            log::warn!(
                "{}Failed to get CoreML cache directory: {e}",
                symbols::warning()
            );
            CoreMLExecutionProvider::default()
        }
    }
}

fn execution_providers(device: &str, model_bytes: &[u8]) -> Vec<ExecutionProviderDispatch> {
    let cpu = || CPUExecutionProvider::default().build();

    match device {
        "cuda" => match CUDAExecutionProvider::default().is_available() {
            Ok(true) => vec![CUDAExecutionProvider::default().build(), cpu()],
            _ => {
                log::warn!("{}CUDA not available, falling back to CPU", symbols::warning());
                vec![cpu()]
            }
        },
        "coreml" => match CoreMLExecutionProvider::default().is_available() {
            Ok(true) => vec![coreml_provider(model_bytes).build(), cpu()],
            _ => {
                log::warn!(
                    "{}CoreML not available, falling back to CPU",
                    symbols::warning()
                );
                vec![cpu()]
            }
        },
        "cpu" => {
            log::debug!("🖥️  Using CPU execution provider");
            vec![cpu()]
        }
        other => {
            log::warn!("{}Unknown device '{other}', using CPU", symbols::warning());
            vec![cpu()]
        }
    }
}

/// Deserialize a model file into an inference session on the selected device
pub fn create_onnx_session(
    model_path: &Path,
    device: &DeviceSelection,
) -> Result<(Session, SessionInfo)> {
    let bytes = fs::read(model_path)
        .map_err(|e| anyhow!("Failed to read model {}: {e}", model_path.display()))?;
    if bytes.is_empty() {
        return Err(anyhow!("Model file is empty: {}", model_path.display()));
    }

    let providers = execution_providers(&device.device, &bytes);
    let ep_names: Vec<String> = providers.iter().map(|ep| format!("{ep:?}")).collect();

    let ort_log_level = [
        Level::Trace,
        Level::Debug,
        Level::Info,
        Level::Warn,
        Level::Error,
    ]
    .into_iter()
    .find(|&lvl| log::log_enabled!(lvl))
    .map(ort_level_from_log)
    .unwrap_or(LogLevel::Fatal);

    let session = Session::builder()
        .map_err(|e| anyhow!("Failed to create session builder: {e}"))?
        .with_log_level(ort_log_level)
        .map_err(|e| anyhow!("Failed to set log level: {e}"))?
        .with_execution_providers(providers)
        .map_err(|e| anyhow!("Failed to set execution providers: {e}"))?
        .commit_from_memory(&bytes)
        .map_err(|e| anyhow!("Failed to load model {}: {e}", model_path.display()))?;

    let info = SessionInfo {
        model_path: model_path.display().to_string(),
        model_size_bytes: bytes.len(),
        model_checksum: model_access::calculate_md5_bytes(&bytes),
        execution_providers: ep_names,
    };

    log::debug!(
        "{} Execution providers registered: {}",
        symbols::system_setup(),
        info.execution_providers.join(" -> ")
    );

    Ok((session, info))
}
