//! Color and styling utilities with support for NO_COLOR and TERM environment variables.
//!
//! Colored output is disabled by any of:
//! - `--no-color` CLI flag
//! - `NO_COLOR` environment variable (https://no-color.org/)
//! - `BUBBLE_CLEAN_NO_COLOR` environment variable (application-specific)
//! - `TERM=dumb` environment variable
//! - stderr not being a TTY

use colored::ColoredString;
use std::io::{stderr, IsTerminal};
use std::sync::OnceLock;

/// Application-specific switch to disable colors
pub const NO_COLOR_ENV: &str = "BUBBLE_CLEAN_NO_COLOR";

static COLOR_CONFIG: OnceLock<ColorConfig> = OnceLock::new();

fn should_disable_colors_from_env() -> bool {
    !std::env::var("NO_COLOR").unwrap_or_default().is_empty()
        || !std::env::var(NO_COLOR_ENV).unwrap_or_default().is_empty()
        || std::env::var("TERM").unwrap_or_default() == "dumb"
        || !stderr().is_terminal()
}

#[derive(Debug, Clone)]
struct ColorConfig {
    colors_enabled: bool,
}

impl ColorConfig {
    fn new(no_color_flag: bool) -> Self {
        let colors_enabled = !no_color_flag && !should_disable_colors_from_env();
        Self { colors_enabled }
    }

    fn is_enabled(&self) -> bool {
        self.colors_enabled
    }
}

/// Initialize the color configuration from the CLI flag.
/// Call once at startup, after parsing arguments.
pub fn init_color_config(no_color_flag: bool) {
    let config = ColorConfig::new(no_color_flag);
    if COLOR_CONFIG.set(config).is_err() {
        log::debug!("Color configuration already initialized");
    }
}

/// Whether colored output and emoji are enabled
pub fn colors_enabled() -> bool {
    COLOR_CONFIG
        .get()
        .map(|config| config.is_enabled())
        .unwrap_or_else(|| !should_disable_colors_from_env())
}

/// Apply color to a string only if colors are enabled for stderr output
pub fn maybe_color_stderr<F>(text: &str, color_fn: F) -> String
where
    F: FnOnce(&str) -> ColoredString,
{
    if colors_enabled() {
        color_fn(text).to_string()
    } else {
        text.to_string()
    }
}

/// Semantic color functions for log levels
pub mod colors {
    use super::maybe_color_stderr;
    use colored::Colorize;

    pub fn error_level(text: &str) -> String {
        maybe_color_stderr(text, |s| s.red().bold())
    }

    pub fn warning_level(text: &str) -> String {
        maybe_color_stderr(text, |s| s.yellow())
    }

    pub fn info_level(text: &str) -> String {
        maybe_color_stderr(text, |s| s.green())
    }

    pub fn debug_level(text: &str) -> String {
        maybe_color_stderr(text, |s| s.blue())
    }

    pub fn trace_level(text: &str) -> String {
        maybe_color_stderr(text, |s| s.magenta())
    }
}

/// Semantic symbols for operations and states; plain text when colors are off
pub mod symbols {
    use super::colors_enabled;

    fn pick(emoji: &'static str, plain: &'static str) -> &'static str {
        if colors_enabled() {
            emoji
        } else {
            plain
        }
    }

    pub fn model_loaded() -> &'static str {
        pick("✅", "")
    }

    pub fn cleaning_start() -> &'static str {
        pick("🧽", "[CLEAN]")
    }

    pub fn polygons_start() -> &'static str {
        pick("📐", "[POLYGONS]")
    }

    pub fn downloading() -> &'static str {
        pick("📥", "")
    }

    pub fn retrying() -> &'static str {
        pick("🔁", "[RETRY]")
    }

    pub fn operation_failed() -> &'static str {
        pick("❌", "[FAILED]")
    }

    pub fn system_setup() -> &'static str {
        pick("⚙️ ", "")
    }

    pub fn checking() -> &'static str {
        pick("🔍", "")
    }

    pub fn save_file() -> &'static str {
        pick("💾", "")
    }

    pub fn completed_successfully() -> &'static str {
        pick("✅", "[SUCCESS]")
    }

    pub fn completed_partially_successfully() -> &'static str {
        pick("⚠️ ", "[PARTIAL-SUCCESS]")
    }

    pub fn warning() -> &'static str {
        pick("⚠️ ", "")
    }
}

/// Progress bars that respect TTY state
pub mod progress {
    use super::colors_enabled;
    use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
    use std::io::{stderr, IsTerminal};
    use std::sync::OnceLock;

    static MULTI: OnceLock<MultiProgress> = OnceLock::new();

    /// Shared container so download and batch bars do not overwrite each other
    pub fn global_mp() -> &'static MultiProgress {
        MULTI.get_or_init(MultiProgress::new)
    }

    pub fn add_progress_bar(pb: ProgressBar) -> ProgressBar {
        global_mp().add(pb)
    }

    pub fn remove_progress_bar(pb: &ProgressBar) {
        global_mp().remove(pb);
    }

    /// Progress bar for batch processing, only when more than one image is
    /// processed and stderr is interactive
    pub fn create_batch_progress_bar(total: usize) -> Option<ProgressBar> {
        if total <= 1 || !stderr().is_terminal() {
            return None;
        }

        let style = if colors_enabled() {
            ProgressStyle::default_bar()
                .template("[{elapsed_precise}] [{bar:30.green/black}] ({percent}%) {msg}")
                .ok()?
                .progress_chars("█▓▒░")
        } else {
            ProgressStyle::default_bar()
                .template("[{elapsed_precise}] [{bar:30}] ({percent}%) {msg}")
                .ok()?
                .progress_chars("#> ")
        };

        let pb = add_progress_bar(ProgressBar::new(total as u64));
        pb.set_style(style);
        pb.enable_steady_tick(std::time::Duration::from_millis(100));
        Some(pb)
    }
}
