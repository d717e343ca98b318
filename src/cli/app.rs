use super::commands::{ConfigCommands, FetchAssetsCommand, RendezvousCommand, RunTaskCommand};
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "ai-companion")]
#[command(about = "Task runtime and live-development companion for App Inventor programs")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Download project assets from the App Inventor server
    FetchAssets(FetchAssetsCommand),
    /// Poll the rendezvous server for a companion code
    Rendezvous(RendezvousCommand),
    /// Run a demo task through its lifecycle
    RunTask(RunTaskCommand),
    /// Configuration management
    Config(ConfigCommands),
}
