//! `devstack`: start a local development stack and watch its health

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

mod commands;
mod logging;
mod output;

use commands::{health::HealthArgs, status::StatusArgs, stop::StopArgs, up::UpArgs};

/// Exit code for "could not run the command at all"
pub const EXIT_ERROR: u8 = 2;
/// Exit code when streaming is interrupted with Ctrl+C
pub const EXIT_INTERRUPTED: u8 = 130;

#[derive(Parser)]
#[command(name = "devstack")]
#[command(about = "Devstack - start services in dependency order and monitor their health")]
#[command(version)]
struct Cli {
    /// Project directory; runtime state lives in its `.devstack/` folder
    #[arg(short = 'C', long, global = true, default_value = ".")]
    project_dir: PathBuf,

    /// Stack file, relative to the project directory
    #[arg(short, long, global = true, default_value = "devstack.yaml")]
    config: PathBuf,

    /// Log level when RUST_LOG is unset (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start services, then stream their health until Ctrl+C
    Up(UpArgs),

    /// Check service health
    Health(HealthArgs),

    /// Show registered services
    Status(StatusArgs),

    /// Stop services recorded in the registry
    Stop(StopArgs),
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init(&cli.log_level);

    let project = commands::Project::new(cli.project_dir, cli.config);
    let result = match cli.command {
        Commands::Up(args) => commands::up::run(&project, args).await,
        Commands::Health(args) => commands::health::run(&project, args).await,
        Commands::Status(args) => commands::status::run(&project, args).await,
        Commands::Stop(args) => commands::stop::run(&project, args).await,
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::from(EXIT_ERROR)
        }
    }
}
