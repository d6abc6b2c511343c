//! Output path management shared by all commands.
//!
//! Main outputs placed next to the input get a suffix (`page_clean.png`);
//! under `--output-dir` they keep the input stem (`out/page.png`).
//! Auxiliary outputs always carry their suffix (`page_regions.json`).

use anyhow::{anyhow, Result};
use log::debug;
use std::path::{Path, PathBuf};

use crate::config::ProcessingConfig;

pub struct OutputManager<'a> {
    config: &'a dyn ProcessingConfig,
    input_path: &'a Path,
}

impl<'a> OutputManager<'a> {
    pub fn new(config: &'a dyn ProcessingConfig, input_path: &'a Path) -> Self {
        Self { config, input_path }
    }

    fn input_stem(&self) -> &str {
        self.input_path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("output")
    }

    fn place(&self, file_name: &str) -> Result<PathBuf> {
        match &self.config.base().output_dir {
            Some(output_dir) => {
                let output_dir = Path::new(output_dir);
                std::fs::create_dir_all(output_dir)?;
                Ok(output_dir.join(file_name))
            }
            None => Ok(self
                .input_path
                .parent()
                .unwrap_or(Path::new("."))
                .join(file_name)),
        }
    }

    /// Primary output path; suffix only when written next to the input
    pub fn generate_main_output_path(&self, default_suffix: &str, extension: &str) -> Result<PathBuf> {
        let input_stem = self.input_stem();
        let file_name = if self.config.base().output_dir.is_some() {
            format!("{input_stem}.{extension}")
        } else {
            format!("{input_stem}_{default_suffix}.{extension}")
        };
        let path = self.place(&file_name)?;
        self.check_writable(&path)?;
        Ok(path)
    }

    /// Auxiliary output path (always includes suffix)
    pub fn generate_auxiliary_output(&self, suffix: &str, extension: &str) -> Result<PathBuf> {
        let file_name = format!("{}_{suffix}.{extension}", self.input_stem());
        let path = self.place(&file_name)?;
        self.check_writable(&path)?;
        Ok(path)
    }

    /// Refuse to clobber the input or an existing file unless `--force`
    fn check_writable(&self, path: &Path) -> Result<()> {
        if same_file(path, self.input_path) {
            return Err(anyhow!(
                "Output {} would overwrite the input image",
                path.display()
            ));
        }
        if path.exists() && !self.config.base().force {
            return Err(anyhow!(
                "Output {} already exists (use --force to overwrite)",
                path.display()
            ));
        }
        debug!("{} output: {}", self.config.tool_name(), path.display());
        Ok(())
    }
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}
