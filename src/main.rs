use anyhow::Result;
use clap::Parser;
use log::info;

mod cli;

use ai_companion::config::Config;
use cli::commands::{assets, config as config_cmd, rendezvous, task};
use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logger to file (truncate on each run)
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open("ai-companion.log")?;
    env_logger::Builder::from_default_env()
        .target(env_logger::Target::Pipe(Box::new(log_file)))
        .init();

    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    info!("Starting ai-companion");

    let config = Config::load()?;

    match cli.command {
        Commands::FetchAssets(cmd) => assets::handle_fetch_assets(&config, cmd).await,
        Commands::Rendezvous(cmd) => rendezvous::handle_rendezvous(&config, cmd).await,
        Commands::RunTask(cmd) => task::handle_run_task(&config, cmd).await,
        Commands::Config(cmd) => config_cmd::handle_config_command(config, cmd).await,
    }
}
