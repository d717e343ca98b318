//! `rendezvous`

use ai_companion::companion::rendezvous::HttpRendezvous;
use ai_companion::companion::webrtc::{BlockResult, LoggingPeer};
use ai_companion::companion::{CodeEvaluator, IceServer, RetValManager, WebRtcNativeMgr};
use ai_companion::config::Config;
use anyhow::Result;
use clap::Args;
use colored::*;
use log::info;
use std::sync::Arc;

#[derive(Args)]
pub struct RendezvousCommand {
    /// Six-character companion code shown in the browser
    #[arg(short, long)]
    pub code: String,
    /// Poll once and exit
    #[arg(long)]
    pub once: bool,
}

/// Logs YAIL that arrives on the data channel instead of running it.
struct EchoEvaluator;

impl CodeEvaluator for EchoEvaluator {
    fn evaluate(&self, code: &str) -> Result<Option<BlockResult>> {
        info!("Received YAIL ({} bytes)", code.len());
        Ok(None)
    }
}

pub async fn handle_rendezvous(config: &Config, cmd: RendezvousCommand) -> Result<()> {
    let transport = HttpRendezvous::new(config.rendezvous_host.clone());
    println!(
        "Polling {} (Ctrl-C to stop)",
        transport.poll_url(&cmd.code).bright_cyan()
    );

    let peer = LoggingPeer::new(vec![IceServer::from_turn(&config.turn)]);
    let mgr = WebRtcNativeMgr::new(
        cmd.code.clone(),
        Arc::new(transport),
        Arc::new(peer),
        Arc::new(RetValManager::new()),
        Arc::new(EchoEvaluator),
    )
    .with_poll_interval(config.runtime.poll_interval());

    if cmd.once {
        let outcome = mgr.poll_once().await?;
        println!(
            "{} offers applied: {}, candidates added: {}, rejected: {}, sent: {}",
            "●".bright_green(),
            outcome.offers_applied.to_string().bold(),
            outcome.candidates_added,
            outcome.candidates_failed.to_string().red(),
            outcome.candidates_sent
        );
        return Ok(());
    }

    tokio::select! {
        result = mgr.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted");
            mgr.stop();
        }
    }

    if mgr.have_offer().await {
        println!("{} answered the browser's offer", "✓".bright_green().bold());
    } else {
        println!("{}", "no offer received".dimmed());
    }
    Ok(())
}
