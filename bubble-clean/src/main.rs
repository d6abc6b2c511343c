use clap::Parser;
use env_logger::Builder;
use env_logger::Env;
use log::{error, info, Level};
use std::io::Write;

use bubble_clean::color_utils::{colors, init_color_config, symbols};
use bubble_clean::config::{
    ApplyCommand, ApplyConfig, CleanCommand, CleanConfig, GlobalArgs, PolygonsCommand,
    PolygonsConfig,
};
use bubble_clean::model_access::{CliModelInfo, MODEL_VERSION};
use bubble_clean::model_manager::ModelManager;
use bubble_clean::processing::{run_apply, run_clean, run_polygons, BatchSummary};
use bubble_clean::segmentation::OnnxModelLoader;

#[derive(clap::Subcommand)]
pub enum Commands {
    /// Detect text regions and erase them
    Clean(CleanCommand),

    /// Detect text regions and write them as editable polygons
    Polygons(PolygonsCommand),

    /// Erase the regions of an edited polygon document (no model needed)
    Apply(ApplyCommand),

    /// Show version information
    Version,
}

#[derive(Parser)]
#[command(name = "bubble-clean")]
#[command(about = "Erase speech bubbles, narration boxes and floating text from comic pages")]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Option<Commands>,
}

fn get_log_level_from_verbosity(
    verbosity: clap_verbosity_flag::Verbosity<clap_verbosity_flag::ErrorLevel>,
) -> log::LevelFilter {
    // -q maps to ERROR; otherwise everything shifts one level louder than clap's default
    if verbosity.is_silent() {
        return log::LevelFilter::Error;
    }
    match verbosity.log_level_filter() {
        log::LevelFilter::Off => log::LevelFilter::Off,
        log::LevelFilter::Error => log::LevelFilter::Warn,
        log::LevelFilter::Warn => log::LevelFilter::Info,
        log::LevelFilter::Info => log::LevelFilter::Debug,
        log::LevelFilter::Debug | log::LevelFilter::Trace => log::LevelFilter::Trace,
    }
}

fn init_logging(global: &GlobalArgs) {
    // Without -v/-q an explicit RUST_LOG wins
    let use_env = !global.verbosity.is_present() && std::env::var_os("RUST_LOG").is_some();

    let mut logger = if use_env {
        Builder::from_env(Env::default())
    } else {
        let mut b = Builder::new();
        b.filter_level(get_log_level_from_verbosity(global.verbosity.clone()));
        b
    };

    logger
        .format(|buf, record| {
            let level_str = match record.level() {
                Level::Error => colors::error_level("ERROR"),
                Level::Warn => colors::warning_level("WARN"),
                Level::Info => colors::info_level("INFO"),
                Level::Debug => colors::debug_level("DEBUG"),
                Level::Trace => colors::trace_level("TRACE"),
            };
            writeln!(buf, "[{}] {}", level_str, record.args())
        })
        .init();
}

fn describe_sources(sources: &[String]) -> String {
    if sources.len() == 1 {
        sources[0].clone()
    } else {
        format!("{} inputs", sources.len())
    }
}

fn model_manager(model: &CliModelInfo, device: &str) -> ModelManager {
    ModelManager::new(OnnxModelLoader::new(model.clone(), device))
}

fn finish(result: anyhow::Result<BatchSummary>, what: &str) {
    match result {
        Ok(summary) if summary.processed == 0 && summary.failed > 0 => {
            error!("{} {what} failed for every input", symbols::operation_failed());
            std::process::exit(1);
        }
        Ok(_) => {}
        Err(e) => {
            error!("{} {what} failed: {e:#}", symbols::operation_failed());
            std::process::exit(1);
        }
    }
}

fn main() {
    let cli = Cli::parse();
    init_color_config(cli.global.no_color);
    init_logging(&cli.global);

    match cli.command {
        Some(Commands::Clean(cmd)) => {
            info!(
                "{} Cleaning: {} | device: {}",
                symbols::cleaning_start(),
                describe_sources(&cmd.sources),
                cli.global.device
            );
            let mut outputs = vec!["clean"];
            if cmd.polygons {
                outputs.push("regions");
            }
            info!("   Outputs: {}", outputs.join(", "));

            let result = CleanConfig::from_args(cli.global, cmd).and_then(|config| {
                let manager = model_manager(&config.model, &config.base.device);
                run_clean(&config, &manager)
            });
            finish(result, "Cleaning");
        }
        Some(Commands::Polygons(cmd)) => {
            info!(
                "{} Polygon export: {} | tolerance: {} | device: {}",
                symbols::polygons_start(),
                describe_sources(&cmd.sources),
                cmd.simplify_tolerance,
                cli.global.device
            );

            let result = PolygonsConfig::from_args(cli.global, cmd).and_then(|config| {
                let manager = model_manager(&config.model, &config.base.device);
                run_polygons(&config, &manager)
            });
            finish(result, "Polygon export");
        }
        Some(Commands::Apply(cmd)) => {
            info!(
                "{} Applying {} to {}",
                symbols::cleaning_start(),
                cmd.regions.display(),
                cmd.image
            );

            let result =
                ApplyConfig::from_args(cli.global, cmd).and_then(|config| run_apply(&config));
            finish(result, "Apply");
        }
        Some(Commands::Version) => {
            println!("bubble-clean v{}", env!("CARGO_PKG_VERSION"));
            println!("Segmentation model version: {MODEL_VERSION}");
            println!("Repository: {}", env!("CARGO_PKG_REPOSITORY"));
        }
        None => {
            use clap::CommandFactory;
            let mut cmd = Cli::command();
            if let Err(e) = cmd.print_help() {
                eprintln!("{e}");
            }
        }
    }
}
