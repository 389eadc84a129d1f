mod config_cmd;
mod discover_cmd;
mod output;

use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::debug;

#[derive(Parser)]
#[command(name = "modforge")]
#[command(about = "modforge — extension runtime tooling")]
#[command(version)]
struct Cli {
    /// Config file (default: $MODFORGE_CONFIG_DIR/config.yaml or ~/.modforge/config.yaml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan the configured source roots and report what would load
    Discover {
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Inspect or create the runtime config
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective config (env vars substituted, defaults applied)
    Show,
    /// Validate the config; exits non-zero on errors
    Validate,
    /// Write a default config file
    Init {
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = cli
        .config
        .unwrap_or_else(|| modforge_config::config_file_path(&modforge_config::config_dir()));
    let base = config_path.parent().map(Path::to_path_buf).unwrap_or_default();

    match cli.command {
        Commands::Discover { json } => {
            let (config, report) = modforge_config::load_with_report(&config_path).await?;
            modforge_logging::init_logger(config.log_dir(&base), config.log_level())?;
            modforge_config::log_report(&report);
            debug!(path = %config_path.display(), "Config loaded");
            discover_cmd::run(&config, &base, json)
        }
        Commands::Config { action } => {
            modforge_logging::init_console_logger("warn");
            match action {
                ConfigAction::Init { force } => config_cmd::init(&config_path, force).await,
                ConfigAction::Show => {
                    let (config, report) = modforge_config::load_with_report(&config_path).await?;
                    modforge_config::log_report(&report);
                    config_cmd::show(&config)
                }
                ConfigAction::Validate => {
                    let (config, _) = modforge_config::load_with_report(&config_path).await?;
                    config_cmd::check(&config, &config_path)
                }
            }
        }
    }
}
