//! Companion WebRTC session
//!
//! [`WebRtcNativeMgr`] drives the device side of a rendezvous: it polls the rendezvous server
//! on a fixed interval, applies the browser's offer once, answers it, trades ICE candidates,
//! and stops polling when the connection comes up or [`WebRtcNativeMgr::stop`] is called.
//! Once connected, YAIL arriving on the data channel goes to a [`CodeEvaluator`] and its
//! results travel back through the [`RetValManager`].

use super::rendezvous::{
    IceCandidate, SessionDescription, SignalAction, SignalingState, SignalingTransport,
    answer_message, candidate_message, new_nonce,
};
use super::retval::{RetValManager, RetValSink};
use crate::config::TurnSettings;
use crate::runtime::lock;
use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, error, info, warn};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{Mutex, watch};

/// Relay configuration handed to the peer connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    pub username: String,
    pub credential: String,
}

impl IceServer {
    pub fn from_turn(turn: &TurnSettings) -> Self {
        Self {
            urls: vec![turn.url.clone()],
            username: turn.username.clone(),
            credential: turn.password.clone(),
        }
    }
}

/// The WebRTC stack, reduced to what the companion needs.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn set_remote_description(&self, description: &SessionDescription) -> Result<()>;

    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_local_description(&self, description: &SessionDescription) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<()>;

    /// Local candidates gathered since the last call.
    async fn take_local_candidates(&self) -> Vec<IceCandidate>;

    /// Sends text on the data channel.
    fn send(&self, text: &str) -> Result<()>;

    fn is_connected(&self) -> bool;
}

/// A peer that takes part in signaling without a media stack behind it.
///
/// It answers offers with a minimal SDP that mirrors the offer's media sections, records
/// remote candidates, and logs data-channel traffic. It never gathers local candidates, so it
/// never reports a connection.
pub struct LoggingPeer {
    ice_servers: Vec<IceServer>,
    session_id: u32,
    remote: StdMutex<Option<SessionDescription>>,
    remote_candidates: StdMutex<Vec<IceCandidate>>,
}

impl LoggingPeer {
    pub fn new(ice_servers: Vec<IceServer>) -> Self {
        for server in &ice_servers {
            info!("ICE server {} (user {})", server.urls.join(","), server.username);
        }
        Self {
            ice_servers,
            session_id: rand::random(),
            remote: StdMutex::new(None),
            remote_candidates: StdMutex::new(Vec::new()),
        }
    }

    pub fn ice_servers(&self) -> &[IceServer] {
        &self.ice_servers
    }

    pub fn remote_candidate_count(&self) -> usize {
        lock(&self.remote_candidates).len()
    }

    fn answer_sdp(&self, offer: &SessionDescription) -> String {
        let mut sdp = format!(
            "v=0\r\no=- {} 2 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n",
            self.session_id
        );
        for line in offer.sdp.lines() {
            if line.starts_with("m=") || line.starts_with("a=mid:") {
                sdp.push_str(line);
                sdp.push_str("\r\n");
                if line.starts_with("m=") {
                    sdp.push_str("a=setup:active\r\n");
                }
            }
        }
        sdp
    }
}

#[async_trait]
impl PeerConnection for LoggingPeer {
    async fn set_remote_description(&self, description: &SessionDescription) -> Result<()> {
        info!("Remote {} ({} bytes)", description.kind, description.sdp.len());
        *lock(&self.remote) = Some(description.clone());
        Ok(())
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let remote = lock(&self.remote).clone();
        let Some(offer) = remote else {
            anyhow::bail!("Cannot answer before a remote description is set");
        };
        Ok(SessionDescription::answer(self.answer_sdp(&offer)))
    }

    async fn set_local_description(&self, description: &SessionDescription) -> Result<()> {
        debug!("Local {}:\n{}", description.kind, description.sdp);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<()> {
        info!("Remote candidate {}", candidate.candidate);
        lock(&self.remote_candidates).push(candidate.clone());
        Ok(())
    }

    async fn take_local_candidates(&self) -> Vec<IceCandidate> {
        Vec::new()
    }

    fn send(&self, text: &str) -> Result<()> {
        info!("Data channel send: {}", text);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        false
    }
}

/// A block result to report to the browser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockResult {
    pub block_id: String,
    pub ok: bool,
    pub value: String,
}

/// Runs YAIL pushed from the blocks editor.
pub trait CodeEvaluator: Send + Sync {
    fn evaluate(&self, code: &str) -> Result<Option<BlockResult>>;
}

struct DataChannelSink {
    peer: Arc<dyn PeerConnection>,
}

impl RetValSink for DataChannelSink {
    fn send_text(&self, text: &str) -> Result<()> {
        self.peer.send(text)
    }
}

/// What one poll did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollOutcome {
    pub offers_applied: usize,
    pub candidates_added: usize,
    /// Remote candidates the peer rejected; they are retried on the next poll.
    pub candidates_failed: usize,
    pub candidates_sent: usize,
}

pub struct WebRtcNativeMgr {
    code: String,
    transport: Arc<dyn SignalingTransport>,
    peer: Arc<dyn PeerConnection>,
    retvals: Arc<RetValManager>,
    evaluator: Arc<dyn CodeEvaluator>,
    state: Mutex<SignalingState>,
    local_answer: Mutex<Option<SessionDescription>>,
    outgoing: Mutex<VecDeque<IceCandidate>>,
    poll_interval: Duration,
    stop: watch::Sender<bool>,
}

impl WebRtcNativeMgr {
    pub fn new(
        code: impl Into<String>,
        transport: Arc<dyn SignalingTransport>,
        peer: Arc<dyn PeerConnection>,
        retvals: Arc<RetValManager>,
        evaluator: Arc<dyn CodeEvaluator>,
    ) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            code: code.into(),
            transport,
            peer,
            retvals,
            evaluator,
            state: Mutex::new(SignalingState::new()),
            local_answer: Mutex::new(None),
            outgoing: Mutex::new(VecDeque::new()),
            poll_interval: Duration::from_secs(1),
            stop,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub async fn have_offer(&self) -> bool {
        self.state.lock().await.have_offer()
    }

    /// Polls the rendezvous server once and acts on anything new.
    ///
    /// Only actions that succeed are committed. A failed answer ends the poll with an error;
    /// a rejected candidate is logged. Either way the next poll tries again.
    pub async fn poll_once(&self) -> Result<PollOutcome> {
        let messages = self.transport.poll(&self.code).await?;
        let actions = self.state.lock().await.ingest(messages);
        let mut outcome = PollOutcome::default();

        for action in actions {
            match &action {
                SignalAction::ApplyOffer(offer) => {
                    self.answer(offer).await?;
                    outcome.offers_applied += 1;
                }
                SignalAction::AddCandidate { candidate, .. } => {
                    debug!("Adding remote candidate {}", candidate.candidate);
                    if let Err(err) = self.peer.add_ice_candidate(candidate).await {
                        warn!("Failed to add remote ICE candidate: {:#}", err);
                        outcome.candidates_failed += 1;
                        continue;
                    }
                    outcome.candidates_added += 1;
                }
                SignalAction::EndOfCandidates { .. } => {
                    debug!("Browser finished sending candidates")
                }
            }
            self.state.lock().await.commit(&action);
        }

        let mut outgoing = self.outgoing.lock().await;
        outgoing.extend(self.peer.take_local_candidates().await);
        while let Some(candidate) = outgoing.front() {
            let message = candidate_message(&self.code, &new_nonce(), candidate);
            self.transport
                .post(&message)
                .await
                .context("Failed to post local ICE candidate")?;
            outgoing.pop_front();
            outcome.candidates_sent += 1;
        }
        Ok(outcome)
    }

    /// Answers `offer`. The answer is created once; a retry only re-posts it.
    async fn answer(&self, offer: &SessionDescription) -> Result<()> {
        let mut local_answer = self.local_answer.lock().await;
        let answer = match local_answer.as_ref() {
            Some(answer) => {
                debug!("Re-posting answer for {}", self.code);
                answer.clone()
            }
            None => {
                info!("Applying offer for {}", self.code);
                self.peer
                    .set_remote_description(offer)
                    .await
                    .context("Failed to set remote description")?;
                let answer = self.peer.create_answer().await.context("Failed to create answer")?;
                self.peer
                    .set_local_description(&answer)
                    .await
                    .context("Failed to set local description")?;
                *local_answer = Some(answer.clone());
                answer
            }
        };
        self.transport
            .post(&answer_message(&self.code, &answer))
            .await
            .context("Failed to post answer")
    }

    /// Polls until the peer connects or [`stop`](Self::stop) is called. Poll failures are
    /// logged and retried on the next tick.
    pub async fn run(&self) -> Result<()> {
        let mut stop = self.stop.subscribe();
        let mut ticker = tokio::time::interval(self.poll_interval);
        info!("Polling rendezvous for {} every {:?}", self.code, self.poll_interval);

        loop {
            if *stop.borrow() {
                info!("Rendezvous polling stopped");
                return Ok(());
            }
            tokio::select! {
                _ = ticker.tick() => {}
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        info!("Rendezvous polling stopped");
                        return Ok(());
                    }
                    continue;
                }
            }

            if let Err(err) = self.poll_once().await {
                warn!("Rendezvous poll failed: {:#}", err);
            }
            if self.peer.is_connected() {
                info!("Peer connected; rendezvous polling done");
                self.retvals.attach_sink(Arc::new(DataChannelSink {
                    peer: self.peer.clone(),
                }));
                return Ok(());
            }
        }
    }

    pub fn stop(&self) {
        self.stop.send_replace(true);
    }

    /// Evaluates text received on the data channel and reports the outcome.
    pub fn on_data_channel_message(&self, text: &str) {
        debug!("Data channel received {} bytes", text.len());
        match self.evaluator.evaluate(text) {
            Ok(Some(result)) => {
                self.retvals
                    .append_return_value(&result.block_id, result.ok, &result.value)
            }
            Ok(None) => {}
            Err(err) => {
                error!("Evaluation failed: {:#}", err);
                self.retvals.send_error(&format!("{:#}", err));
            }
        }
    }
}
