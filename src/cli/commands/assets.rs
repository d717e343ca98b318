//! `fetch-assets`

use ai_companion::companion::{AssetFetcher, AssetSession, HttpAssetSource, RetValManager};
use ai_companion::config::Config;
use anyhow::Result;
use clap::Args;
use colored::*;
use log::info;
use std::sync::Arc;

#[derive(Args)]
pub struct FetchAssetsCommand {
    /// Project id on the server
    #[arg(short, long)]
    pub project: String,
    /// Value of the AppInventor session cookie
    #[arg(short, long)]
    pub cookie: String,
    /// Server base URI (defaults to the configured one)
    #[arg(short, long)]
    pub server: Option<String>,
    /// Asset paths, downloaded in the given order
    #[arg(required = true)]
    pub assets: Vec<String>,
}

pub async fn handle_fetch_assets(config: &Config, cmd: FetchAssetsCommand) -> Result<()> {
    let server = cmd.server.unwrap_or_else(|| config.server_uri.clone());
    info!("Fetching {} assets from {}", cmd.assets.len(), server);

    let session = AssetSession::new(server, cmd.project, cmd.cookie);
    let retvals = Arc::new(RetValManager::new());
    let fetcher = AssetFetcher::spawn(
        Arc::new(HttpAssetSource::new()),
        config.asset_dir.clone(),
        retvals.clone(),
    );

    let report = fetcher.fetch_and_wait(&session, cmd.assets).await?;
    fetcher.shutdown().await?;

    for asset in &report.transferred {
        println!("{} {}", "✓".bright_green().bold(), asset);
    }
    if let Some((asset, reason)) = &report.failed {
        println!("{} {}: {}", "✗".bright_red().bold(), asset.bright_yellow(), reason.red());
    }
    for asset in &report.skipped {
        println!("{} {} {}", "-".dimmed(), asset, "(skipped)".dimmed());
    }
    println!(
        "Saved to {}",
        config.asset_dir.display().to_string().bright_cyan()
    );

    if !report.is_success() {
        anyhow::bail!("Batch {} aborted", report.batch_id);
    }
    Ok(())
}
