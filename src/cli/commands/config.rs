//! `config`

use ai_companion::config::Config;
use anyhow::Result;
use clap::{Args, Subcommand};
use colored::*;
use std::path::PathBuf;

#[derive(Args)]
pub struct ConfigCommands {
    #[command(subcommand)]
    pub command: ConfigSubcommands,
}

#[derive(Subcommand)]
pub enum ConfigSubcommands {
    /// Show the effective configuration
    Show,
    /// Print the config file location
    Path,
    /// Set the App Inventor server URI
    SetServer {
        /// e.g. https://ai2.appinventor.mit.edu
        uri: String,
    },
    /// Set the rendezvous host
    SetRendezvous {
        host: String,
    },
    /// Set where downloaded assets are stored
    SetAssetDir {
        dir: PathBuf,
    },
}

pub async fn handle_config_command(mut config: Config, cmd: ConfigCommands) -> Result<()> {
    match cmd.command {
        ConfigSubcommands::Show => {
            println!("{}", "Configuration".bold());
            println!("  Server:      {}", config.server_uri.bright_cyan());
            println!("  Rendezvous:  {}", config.rendezvous_host.bright_cyan());
            println!("  Asset dir:   {}", config.asset_dir.display());
            println!("  TURN:        {}", config.turn.url);
            println!("  Poll every:  {} ms", config.runtime.poll_interval_ms);
            println!("  Alert every: {} s", config.runtime.toast_interval_secs);
        }
        ConfigSubcommands::Path => {
            println!("{}", Config::get_config_path()?.display());
        }
        ConfigSubcommands::SetServer { uri } => {
            config.set_server_uri(uri)?;
            println!("{} Server set to {}", "✓".bright_green().bold(), config.server_uri.bright_green());
        }
        ConfigSubcommands::SetRendezvous { host } => {
            config.set_rendezvous_host(host)?;
            println!("{} Rendezvous host set to {}", "✓".bright_green().bold(), config.rendezvous_host.bright_green());
        }
        ConfigSubcommands::SetAssetDir { dir } => {
            config.set_asset_dir(dir)?;
            println!("{} Asset directory set to {}", "✓".bright_green().bold(), config.asset_dir.display());
        }
    }
    Ok(())
}
