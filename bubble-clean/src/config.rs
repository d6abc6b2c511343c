//! Configuration layer separating CLI arguments from internal processing configs.
//!
//! - `GlobalArgs`: flags shared by every command
//! - `*Command`: command-specific clap arguments
//! - `BaseConfig` and the `*Config` structs: what processing actually consumes
//!
//! Cleaning parameters start from defaults, are optionally replaced by a TOML
//! file (`--params`), and are finally overridden by individual CLI flags.

use anyhow::{anyhow, Result};
use clap::{Args, Parser};
use clap_verbosity_flag::Verbosity;
use serde::Serialize;
use std::path::{Path, PathBuf};

use crate::cleaning::CleaningParams;
use crate::model_access::CliModelInfo;
use crate::region_source::DEFAULT_SIMPLIFY_TOLERANCE;

/// Parse an RGB color like "255,255,255"
pub fn parse_rgb_color(s: &str) -> Result<[u8; 3], String> {
    let parts: Vec<&str> = s.split(',').collect();
    if parts.len() != 3 {
        return Err("Color must be in format 'R,G,B' (e.g., '255,255,255')".to_string());
    }

    let mut color = [0u8; 3];
    for (i, part) in parts.iter().enumerate() {
        color[i] = part
            .trim()
            .parse::<u8>()
            .map_err(|_| format!("Invalid color component: '{part}'"))?;
    }
    Ok(color)
}

/// Parse a non-negative pixel tolerance
pub fn parse_tolerance(s: &str) -> Result<f64, String> {
    let val = s
        .parse::<f64>()
        .map_err(|_| format!("Invalid number: '{s}'"))?;
    if !val.is_finite() || val < 0.0 {
        return Err(format!("Must be a non-negative number, got {val}"));
    }
    Ok(val)
}

/// Parse a Gaussian sigma (0 disables feathering)
pub fn parse_sigma(s: &str) -> Result<f32, String> {
    let val = s
        .parse::<f32>()
        .map_err(|_| format!("Invalid number: '{s}'"))?;
    if !val.is_finite() || val < 0.0 {
        return Err(format!("Must be a non-negative number, got {val}"));
    }
    Ok(val)
}

/// Global CLI arguments that apply to all commands
#[derive(Parser, Debug, Clone)]
pub struct GlobalArgs {
    /// Global output directory (overrides default placement next to input)
    #[arg(long, global = true)]
    pub output_dir: Option<String>,

    /// Verbosity level (-q/--quiet, -v/-vv/-vvv/-vvvv for info/debug/trace)
    #[command(flatten)]
    pub verbosity: Verbosity,

    /// Use permissive mode for input validation (warn instead of error for unsupported files)
    #[arg(long, global = true)]
    pub permissive: bool,

    /// Device to use for inference (auto, cpu, cuda, coreml)
    #[arg(long, default_value = "auto", global = true)]
    pub device: String,

    /// Disable colored output (also respects NO_COLOR and BUBBLE_CLEAN_NO_COLOR env vars)
    #[arg(long, global = true)]
    pub no_color: bool,

    /// Overwrite existing output files
    #[arg(long, global = true)]
    pub force: bool,
}

/// Where to find the segmentation model
#[derive(Args, Debug, Clone, Default)]
pub struct ModelArgs {
    /// Path to a local segmentation model file
    #[arg(long)]
    pub model_path: Option<String>,

    /// URL to download the segmentation model from
    #[arg(long)]
    pub model_url: Option<String>,

    /// MD5 checksum for model verification (used with --model-url)
    #[arg(long)]
    pub model_checksum: Option<String>,
}

impl From<ModelArgs> for CliModelInfo {
    fn from(args: ModelArgs) -> Self {
        Self {
            model_path: args.model_path,
            model_url: args.model_url,
            model_checksum: args.model_checksum,
        }
    }
}

/// Cleaning parameter overrides
#[derive(Args, Debug, Clone, Default)]
pub struct CleaningArgs {
    /// TOML file with cleaning parameters
    #[arg(long, value_name = "TOML")]
    pub params: Option<PathBuf>,

    /// Erosion radius separating the solid fill from the feathered edge
    #[arg(long)]
    pub erode_radius: Option<u8>,

    /// Gaussian sigma of the feathered edge (0 disables feathering)
    #[arg(long, value_parser = parse_sigma)]
    pub feather_sigma: Option<f32>,

    /// Dilation radius applied to floating-text masks before inpainting
    #[arg(long)]
    pub dilate_radius: Option<u8>,

    /// Neighborhood radius for inpainting
    #[arg(long)]
    pub inpaint_radius: Option<u32>,

    /// Fill color for bubbles and narration boxes as R,G,B
    #[arg(long, value_parser = parse_rgb_color)]
    pub fill_color: Option<[u8; 3]>,
}

impl CleaningArgs {
    /// Defaults, then the TOML file, then individual flags
    pub fn resolve(&self) -> Result<CleaningParams> {
        let mut params = match &self.params {
            Some(path) => load_cleaning_params(path)?,
            None => CleaningParams::default(),
        };

        if let Some(v) = self.erode_radius {
            params.erode_radius = v;
        }
        if let Some(v) = self.feather_sigma {
            params.feather_sigma = v;
        }
        if let Some(v) = self.dilate_radius {
            params.dilate_radius = v;
        }
        if let Some(v) = self.inpaint_radius {
            params.inpaint_radius = v;
        }
        if let Some(v) = self.fill_color {
            params.fill_color = v;
        }

        params.validate()?;
        Ok(params)
    }
}

/// Read cleaning parameters from TOML; missing keys keep their defaults
pub fn load_cleaning_params(path: &Path) -> Result<CleaningParams> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("Failed to read params file {}: {e}", path.display()))?;
    toml::from_str(&text).map_err(|e| anyhow!("Invalid params file {}: {e}", path.display()))
}

/// CLI command for detecting and cleaning text regions
#[derive(Parser, Debug, Clone)]
pub struct CleanCommand {
    /// Path(s) to input images or directories. Supports glob patterns like *.jpg
    #[arg(value_name = "IMAGES_OR_DIRS", required = true)]
    pub sources: Vec<String>,

    /// Also write the detected regions as an editor document (<stem>_regions.json)
    #[arg(long)]
    pub polygons: bool,

    /// Outline simplification tolerance in pixels for the editor document
    #[arg(long, default_value_t = DEFAULT_SIMPLIFY_TOLERANCE, value_parser = parse_tolerance)]
    pub simplify_tolerance: f64,

    #[command(flatten)]
    pub cleaning: CleaningArgs,

    #[command(flatten)]
    pub model: ModelArgs,
}

/// CLI command for exporting detected regions as editable polygons
#[derive(Parser, Debug, Clone)]
pub struct PolygonsCommand {
    /// Path(s) to input images or directories. Supports glob patterns like *.jpg
    #[arg(value_name = "IMAGES_OR_DIRS", required = true)]
    pub sources: Vec<String>,

    /// Outline simplification tolerance in pixels
    #[arg(long, default_value_t = DEFAULT_SIMPLIFY_TOLERANCE, value_parser = parse_tolerance)]
    pub simplify_tolerance: f64,

    #[command(flatten)]
    pub model: ModelArgs,
}

/// CLI command for cleaning an image with edited polygons (no model needed)
#[derive(Parser, Debug, Clone)]
pub struct ApplyCommand {
    /// Input image
    #[arg(value_name = "IMAGE")]
    pub image: String,

    /// Editor document with the regions to erase
    #[arg(long, value_name = "JSON")]
    pub regions: PathBuf,

    #[command(flatten)]
    pub cleaning: CleaningArgs,
}

/// Configuration shared by all commands
#[derive(Debug, Clone, Serialize)]
pub struct BaseConfig {
    pub sources: Vec<String>,
    pub device: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_dir: Option<String>,
    /// Fail on missing or unsupported inputs. Opposite of `--permissive`.
    pub strict: bool,
    pub force: bool,
}

impl From<GlobalArgs> for BaseConfig {
    fn from(global: GlobalArgs) -> Self {
        Self {
            sources: Vec::new(),
            device: global.device,
            output_dir: global.output_dir,
            strict: !global.permissive,
            force: global.force,
        }
    }
}

/// Implemented by every internal config so output handling can be shared
pub trait ProcessingConfig {
    fn base(&self) -> &BaseConfig;

    fn tool_name(&self) -> &'static str;
}

#[derive(Debug, Clone, Serialize)]
pub struct CleanConfig {
    pub base: BaseConfig,
    pub params: CleaningParams,
    pub write_polygons: bool,
    pub simplify_tolerance: f64,
    #[serde(skip)]
    pub model: CliModelInfo,
}

#[derive(Debug, Clone, Serialize)]
pub struct PolygonsConfig {
    pub base: BaseConfig,
    pub simplify_tolerance: f64,
    #[serde(skip)]
    pub model: CliModelInfo,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApplyConfig {
    pub base: BaseConfig,
    pub regions_path: PathBuf,
    pub params: CleaningParams,
}

impl CleanConfig {
    pub fn from_args(global: GlobalArgs, cmd: CleanCommand) -> Result<Self> {
        let mut base: BaseConfig = global.into();
        base.sources = cmd.sources;

        let model: CliModelInfo = cmd.model.into();
        model.validate()?;

        Ok(Self {
            base,
            params: cmd.cleaning.resolve()?,
            write_polygons: cmd.polygons,
            simplify_tolerance: cmd.simplify_tolerance,
            model,
        })
    }
}

impl PolygonsConfig {
    pub fn from_args(global: GlobalArgs, cmd: PolygonsCommand) -> Result<Self> {
        let mut base: BaseConfig = global.into();
        base.sources = cmd.sources;

        let model: CliModelInfo = cmd.model.into();
        model.validate()?;

        Ok(Self {
            base,
            simplify_tolerance: cmd.simplify_tolerance,
            model,
        })
    }
}

impl ApplyConfig {
    pub fn from_args(global: GlobalArgs, cmd: ApplyCommand) -> Result<Self> {
        let mut base: BaseConfig = global.into();
        base.sources = vec![cmd.image];

        Ok(Self {
            base,
            regions_path: cmd.regions,
            params: cmd.cleaning.resolve()?,
        })
    }
}

impl ProcessingConfig for CleanConfig {
    fn base(&self) -> &BaseConfig {
        &self.base
    }

    fn tool_name(&self) -> &'static str {
        "clean"
    }
}

impl ProcessingConfig for PolygonsConfig {
    fn base(&self) -> &BaseConfig {
        &self.base
    }

    fn tool_name(&self) -> &'static str {
        "polygons"
    }
}

impl ProcessingConfig for ApplyConfig {
    fn base(&self) -> &BaseConfig {
        &self.base
    }

    fn tool_name(&self) -> &'static str {
        "apply"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn global(permissive: bool) -> GlobalArgs {
        GlobalArgs {
            output_dir: Some("/tmp/out".to_string()),
            verbosity: Verbosity::new(0, 0),
            permissive,
            device: "cpu".to_string(),
            no_color: false,
            force: true,
        }
    }

    #[test]
    fn test_global_args_conversion() {
        let config: BaseConfig = global(true).into();
        assert!(config.sources.is_empty());
        assert_eq!(config.device, "cpu");
        assert_eq!(config.output_dir.as_deref(), Some("/tmp/out"));
        assert!(!config.strict);
        assert!(config.force);
    }

    #[test]
    fn test_clean_command_conversion() {
        let cmd = CleanCommand {
            sources: vec!["page.png".to_string()],
            polygons: true,
            simplify_tolerance: 2.0,
            cleaning: CleaningArgs {
                inpaint_radius: Some(7),
                ..Default::default()
            },
            model: ModelArgs::default(),
        };

        let config = CleanConfig::from_args(global(false), cmd).unwrap();
        assert_eq!(config.base.sources, vec!["page.png"]);
        assert!(config.base.strict);
        assert!(config.write_polygons);
        assert_eq!(config.simplify_tolerance, 2.0);
        assert_eq!(config.params.inpaint_radius, 7);
        assert_eq!(config.params.erode_radius, 1);
        assert_eq!(config.tool_name(), "clean");
    }

    #[test]
    fn test_conflicting_model_args_rejected() {
        let cmd = PolygonsCommand {
            sources: vec!["page.png".to_string()],
            simplify_tolerance: 1.5,
            model: ModelArgs {
                model_path: Some("a.onnx".to_string()),
                model_url: Some("https://example.com/a.onnx".to_string()),
                model_checksum: None,
            },
        };
        assert!(PolygonsConfig::from_args(global(false), cmd).is_err());
    }

    #[test]
    fn test_params_file_then_flag_override() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("params.toml");
        std::fs::write(
            &path,
            "feather_sigma = 2.0\ninpaint_radius = 9\nfill_color = [240, 240, 240]\n",
        )
        .unwrap();

        let args = CleaningArgs {
            params: Some(path),
            inpaint_radius: Some(3),
            ..Default::default()
        };
        let params = args.resolve().unwrap();
        assert_eq!(params.feather_sigma, 2.0);
        assert_eq!(params.inpaint_radius, 3);
        assert_eq!(params.fill_color, [240, 240, 240]);
        assert_eq!(params.dilate_radius, 1);
    }

    #[test]
    fn test_params_file_errors() {
        let dir = tempdir().unwrap();
        let bad = dir.path().join("bad.toml");
        std::fs::write(&bad, "blur = 3\n").unwrap();

        let args = CleaningArgs {
            params: Some(bad),
            ..Default::default()
        };
        assert!(args.resolve().is_err());

        let missing = CleaningArgs {
            params: Some(dir.path().join("missing.toml")),
            ..Default::default()
        };
        assert!(missing.resolve().is_err());
    }

    #[test]
    fn test_invalid_params_rejected() {
        let args = CleaningArgs {
            inpaint_radius: Some(0),
            ..Default::default()
        };
        assert!(args.resolve().is_err());
    }

    #[test]
    fn test_apply_command_conversion() {
        let cmd = ApplyCommand {
            image: "page.jpg".to_string(),
            regions: PathBuf::from("page_regions.json"),
            cleaning: CleaningArgs::default(),
        };
        let config = ApplyConfig::from_args(global(false), cmd).unwrap();
        assert_eq!(config.base.sources, vec!["page.jpg"]);
        assert_eq!(config.regions_path, PathBuf::from("page_regions.json"));
        assert_eq!(config.params, CleaningParams::default());
    }

    #[test]
    fn test_parse_rgb_color() {
        assert_eq!(parse_rgb_color("255, 250,0").unwrap(), [255, 250, 0]);
        assert!(parse_rgb_color("255,255").is_err());
        assert!(parse_rgb_color("256,0,0").is_err());
    }

    #[test]
    fn test_parse_tolerance_and_sigma() {
        assert_eq!(parse_tolerance("1.5").unwrap(), 1.5);
        assert!(parse_tolerance("-1").is_err());
        assert!(parse_tolerance("abc").is_err());
        assert_eq!(parse_sigma("0").unwrap(), 0.0);
        assert!(parse_sigma("-0.5").is_err());
    }
}
