//! Rendezvous signaling
//!
//! Browser and device meet on the rendezvous server under a short code. The browser posts its
//! SDP offer and ICE candidates under `<code>-s`; the device polls that key and answers under
//! `<code>-r`. The server returns everything posted so far on every poll, so the device must
//! treat repeats as no-ops: the offer is applied once and each candidate nonce only once.

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::BTreeSet;

/// An SDP offer or answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: String,
    pub sdp: String,
}

impl SessionDescription {
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: "answer".to_string(),
            sdp: sdp.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_m_line_index: Option<u32>,
}

/// One entry of a rendezvous poll response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SignalMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offer: Option<SessionDescription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate: Option<IceCandidate>,
}

/// What the peer connection must do after a poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalAction {
    ApplyOffer(SessionDescription),
    AddCandidate {
        nonce: Option<String>,
        candidate: IceCandidate,
    },
    EndOfCandidates {
        nonce: Option<String>,
    },
}

/// Receive-side signaling state for one rendezvous session.
///
/// [`ingest`](Self::ingest) only plans actions. An action counts as handled once it is
/// [`commit`](Self::commit)ted, so anything that failed is planned again on the next poll.
#[derive(Debug, Default)]
pub struct SignalingState {
    seen_nonces: BTreeSet<String>,
    have_offer: bool,
    pending: Vec<(Option<String>, IceCandidate)>,
}

impl SignalingState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn have_offer(&self) -> bool {
        self.have_offer
    }

    pub fn seen_nonce_count(&self) -> usize {
        self.seen_nonces.len()
    }

    /// Candidates held back because no offer has been applied yet, or because adding them
    /// failed.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    fn is_seen(&self, nonce: &Option<String>) -> bool {
        nonce.as_ref().is_some_and(|nonce| self.seen_nonces.contains(nonce))
    }

    /// Turns one poll response into actions, dropping anything already committed.
    ///
    /// Candidates seen before the offer are held back and released right after it.
    pub fn ingest(&mut self, messages: Vec<SignalMessage>) -> Vec<SignalAction> {
        let mut actions = Vec::new();
        let mut planned: BTreeSet<String> = BTreeSet::new();
        let mut offer_planned = self.have_offer;

        if offer_planned {
            self.release_pending(&mut planned, &mut actions);
        }

        for message in messages {
            if let Some(offer) = message.offer {
                if offer_planned {
                    debug!("Ignoring repeated offer");
                    continue;
                }
                info!("Received offer");
                offer_planned = true;
                actions.push(SignalAction::ApplyOffer(offer));
                self.release_pending(&mut planned, &mut actions);
                continue;
            }

            let nonce = message.nonce;
            if nonce.is_none() {
                warn!("Signaling entry without a nonce");
            }
            if self.is_seen(&nonce) || nonce.as_ref().is_some_and(|n| planned.contains(n)) {
                continue;
            }

            match message.candidate {
                Some(candidate) if offer_planned => {
                    if let Some(nonce) = &nonce {
                        planned.insert(nonce.clone());
                    }
                    actions.push(SignalAction::AddCandidate { nonce, candidate });
                }
                Some(candidate) => {
                    let entry = (nonce, candidate);
                    if !self.pending.contains(&entry) {
                        debug!("Holding candidate until the offer arrives");
                        self.pending.push(entry);
                    }
                }
                None => {
                    if let Some(nonce) = &nonce {
                        planned.insert(nonce.clone());
                    }
                    actions.push(SignalAction::EndOfCandidates { nonce });
                }
            }
        }
        actions
    }

    fn release_pending(&self, planned: &mut BTreeSet<String>, actions: &mut Vec<SignalAction>) {
        for (nonce, candidate) in &self.pending {
            if let Some(nonce) = nonce {
                if !planned.insert(nonce.clone()) {
                    continue;
                }
            }
            actions.push(SignalAction::AddCandidate {
                nonce: nonce.clone(),
                candidate: candidate.clone(),
            });
        }
    }

    /// Records that `action` took effect; replays of it are ignored from now on.
    pub fn commit(&mut self, action: &SignalAction) {
        match action {
            SignalAction::ApplyOffer(_) => self.have_offer = true,
            SignalAction::AddCandidate { nonce, candidate } => {
                self.pending
                    .retain(|(held_nonce, held)| !(held_nonce == nonce && held == candidate));
                if let Some(nonce) = nonce {
                    self.seen_nonces.insert(nonce.clone());
                }
            }
            SignalAction::EndOfCandidates { nonce } => {
                if let Some(nonce) = nonce {
                    self.seen_nonces.insert(nonce.clone());
                }
            }
        }
    }
}

fn reply_key(code: &str) -> String {
    format!("{}-r", code)
}

/// The device's SDP answer, posted under `<code>-r`.
pub fn answer_message(code: &str, answer: &SessionDescription) -> Value {
    json!({
        "key": reply_key(code),
        "webrtc": true,
        "offer": answer,
    })
}

/// One local ICE candidate, posted under `<code>-r`.
pub fn candidate_message(code: &str, nonce: &str, candidate: &IceCandidate) -> Value {
    json!({
        "key": reply_key(code),
        "webrtc": true,
        "nonce": nonce,
        "candidate": candidate,
    })
}

/// Fresh nonce for an outgoing candidate.
pub fn new_nonce() -> String {
    rand::random_range(1..=u32::MAX).to_string()
}

/// Transport to the rendezvous server.
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    /// Everything the browser has posted for `code` so far.
    async fn poll(&self, code: &str) -> Result<Vec<SignalMessage>>;

    async fn post(&self, message: &Value) -> Result<()>;
}

pub struct HttpRendezvous {
    client: reqwest::Client,
    host: String,
}

impl HttpRendezvous {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            host: host.into(),
        }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}/rendezvous2/", self.host)
    }

    pub fn poll_url(&self, code: &str) -> String {
        format!("{}{}-s", self.base_url(), code)
    }
}

#[async_trait]
impl SignalingTransport for HttpRendezvous {
    async fn poll(&self, code: &str) -> Result<Vec<SignalMessage>> {
        let url = self.poll_url(code);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("Failed to poll {}", url))?;

        if !response.status().is_success() {
            anyhow::bail!("Rendezvous poll failed with status {}", response.status());
        }
        let text = response.text().await?;
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }
        let messages: Vec<SignalMessage> =
            serde_json::from_str(&text).context("Failed to parse rendezvous response")?;
        debug!("Rendezvous returned {} entries", messages.len());
        Ok(messages)
    }

    async fn post(&self, message: &Value) -> Result<()> {
        let response = self
            .client
            .post(self.base_url())
            .json(message)
            .send()
            .await
            .context("Failed to post to rendezvous server")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Rendezvous post failed ({}): {}", status, body);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(nonce: &str, text: &str) -> SignalMessage {
        SignalMessage {
            offer: None,
            nonce: Some(nonce.to_string()),
            candidate: Some(IceCandidate {
                candidate: text.to_string(),
                sdp_mid: Some("0".to_string()),
                sdp_m_line_index: Some(0),
            }),
        }
    }

    fn offer() -> SignalMessage {
        SignalMessage {
            offer: Some(SessionDescription {
                kind: "offer".to_string(),
                sdp: "v=0".to_string(),
            }),
            ..SignalMessage::default()
        }
    }

    #[test]
    fn test_parse_poll_response() {
        let body = r#"[
            {"offer": {"type": "offer", "sdp": "v=0"}},
            {"nonce": "81", "candidate": {"candidate": "candidate:1", "sdpMid": "0", "sdpMLineIndex": 0}},
            {"nonce": "82"}
        ]"#;
        let messages: Vec<SignalMessage> = serde_json::from_str(body).unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].offer.as_ref().unwrap().kind, "offer");
        assert_eq!(messages[1].candidate.as_ref().unwrap().sdp_m_line_index, Some(0));
        assert!(messages[2].candidate.is_none());
    }

    fn commit_all(state: &mut SignalingState, actions: &[SignalAction]) {
        for action in actions {
            state.commit(action);
        }
    }

    #[test]
    fn test_candidates_before_offer_are_held() {
        let mut state = SignalingState::new();
        let actions = state.ingest(vec![candidate("1", "early")]);
        assert!(actions.is_empty());
        assert_eq!(state.pending_count(), 1);

        let actions = state.ingest(vec![candidate("1", "early"), offer()]);
        assert_eq!(actions.len(), 2);
        assert!(matches!(actions[0], SignalAction::ApplyOffer(_)));
        assert!(matches!(&actions[1], SignalAction::AddCandidate { candidate, .. } if candidate.candidate == "early"));

        commit_all(&mut state, &actions);
        assert_eq!(state.pending_count(), 0);
        assert!(state.ingest(vec![candidate("1", "early"), offer()]).is_empty());
    }

    #[test]
    fn test_uncommitted_actions_are_planned_again() {
        let mut state = SignalingState::new();
        let first = state.ingest(vec![offer(), candidate("1", "a")]);
        assert_eq!(first.len(), 2);
        assert!(!state.have_offer());

        // Nothing committed: the replayed response yields the same plan.
        let second = state.ingest(vec![offer(), candidate("1", "a")]);
        assert_eq!(first, second);

        state.commit(&second[0]);
        let third = state.ingest(vec![offer(), candidate("1", "a")]);
        assert_eq!(third, vec![second[1].clone()]);
    }

    #[test]
    fn test_failed_held_candidate_is_retried_without_replay() {
        let mut state = SignalingState::new();
        state.ingest(vec![candidate("4", "held")]);
        let actions = state.ingest(vec![offer()]);
        state.commit(&actions[0]);

        // The held candidate was never committed, so it comes back on an empty poll.
        let retry = state.ingest(Vec::new());
        assert!(matches!(&retry[..], [SignalAction::AddCandidate { nonce: Some(n), .. }] if n == "4"));
        state.commit(&retry[0]);
        assert!(state.ingest(Vec::new()).is_empty());
    }

    #[test]
    fn test_duplicate_nonce_in_one_response_planned_once() {
        let mut state = SignalingState::new();
        let actions = state.ingest(vec![offer(), candidate("2", "x"), candidate("2", "x")]);
        assert_eq!(actions.len(), 2);
    }

    #[test]
    fn test_end_of_candidates_records_nonce() {
        let mut state = SignalingState::new();
        let actions = state.ingest(vec![offer()]);
        commit_all(&mut state, &actions);
        let end = SignalMessage {
            nonce: Some("9".to_string()),
            ..SignalMessage::default()
        };
        let actions = state.ingest(vec![end.clone()]);
        assert_eq!(
            actions,
            vec![SignalAction::EndOfCandidates {
                nonce: Some("9".to_string())
            }]
        );
        commit_all(&mut state, &actions);
        assert!(state.ingest(vec![end]).is_empty());
        assert_eq!(state.seen_nonce_count(), 1);
    }

    #[test]
    fn test_outgoing_messages() {
        let answer = answer_message("abc123", &SessionDescription::answer("v=0"));
        assert_eq!(answer["key"], "abc123-r");
        assert_eq!(answer["webrtc"], true);
        assert_eq!(answer["offer"]["type"], "answer");

        let cand = IceCandidate {
            candidate: "candidate:7".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_m_line_index: Some(0),
        };
        let message = candidate_message("abc123", "55", &cand);
        assert_eq!(message["nonce"], "55");
        assert_eq!(message["candidate"]["sdpMLineIndex"], 0);
    }

    #[test]
    fn test_urls() {
        let rendezvous = HttpRendezvous::new("rendezvous.appinventor.mit.edu");
        assert_eq!(
            rendezvous.poll_url("abc123"),
            "http://rendezvous.appinventor.mit.edu/rendezvous2/abc123-s"
        );
    }
}
