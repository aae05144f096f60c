//! Rasterkiln CLI - command-line interface
//!
//! This binary provides a command-line workbench for the rasterkiln
//! library: an adaptive progressive render of a procedural scene, and
//! a multithreaded cache stress run.

mod commands;
mod error;

use clap::{Parser, Subcommand};

use error::CliError;

#[derive(Parser)]
#[command(name = "rasterkiln")]
#[command(about = "Tile cache and adaptive sampling workbench", long_about = None)]
#[command(version = rasterkiln::VERSION)]
struct Cli {
    /// Skip log file setup; only stdout output.
    #[arg(long, global = true)]
    no_log_file: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Adaptively render a procedural scene to PNG
    Render(commands::render::RenderArgs),
    /// Hammer the tile cache from worker threads and report statistics
    Stress(commands::stress::StressArgs),
}

fn main() {
    let cli = Cli::parse();

    let _log_guard = if cli.no_log_file {
        None
    } else {
        match rasterkiln::logging::init_logging(
            rasterkiln::logging::default_log_dir(),
            rasterkiln::logging::default_log_file(),
        ) {
            Ok(guard) => Some(guard),
            Err(e) => CliError::LoggingInit(e.to_string()).exit(),
        }
    };

    let result = match cli.command {
        Commands::Render(args) => commands::render::run(args),
        Commands::Stress(args) => commands::stress::run(args),
    };

    if let Err(e) = result {
        e.exit();
    }
}
