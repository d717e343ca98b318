//! Integration tests for the companion transport
//!
//! Asset downloads and rendezvous signaling run against in-memory fakes of the HTTP
//! transports and the WebRTC peer connection.

use ai_companion::companion::assets::{AssetFetcher, AssetSession, AssetSource, AssetStream};
use ai_companion::companion::rendezvous::{
    IceCandidate, SessionDescription, SignalMessage, SignalingTransport,
};
use ai_companion::companion::retval::RetValManager;
use ai_companion::companion::webrtc::{BlockResult, CodeEvaluator, PeerConnection, WebRtcNativeMgr};
use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// Assets

#[derive(Default)]
struct FakeSource {
    log: Arc<Mutex<Vec<String>>>,
    failing: Vec<String>,
}

struct FakeStream {
    asset: String,
    chunks: VecDeque<Vec<u8>>,
    log: Arc<Mutex<Vec<String>>>,
}

impl Drop for FakeStream {
    fn drop(&mut self) {
        self.log.lock().unwrap().push(format!("close {}", self.asset));
    }
}

#[async_trait]
impl AssetStream for FakeStream {
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>> {
        tokio::task::yield_now().await;
        Ok(self.chunks.pop_front())
    }
}

#[async_trait]
impl AssetSource for FakeSource {
    async fn open(&self, session: &AssetSession, asset: &str) -> Result<Box<dyn AssetStream>> {
        self.log
            .lock()
            .unwrap()
            .push(format!("open {}", session.download_url(asset)));
        if self.failing.iter().any(|name| name == asset) {
            anyhow::bail!("Download of {} failed with status 404 Not Found", asset);
        }
        Ok(Box::new(FakeStream {
            asset: asset.to_string(),
            chunks: VecDeque::from(vec![asset.as_bytes().to_vec(), b"-data".to_vec()]),
            log: self.log.clone(),
        }))
    }
}

fn session() -> AssetSession {
    AssetSession::new("http://ai2.test", "1234", "cookie")
}

#[tokio::test]
async fn test_assets_download_in_order_one_at_a_time() {
    let dir = tempfile::tempdir().unwrap();
    let source = Arc::new(FakeSource::default());
    let log = source.log.clone();
    let retvals = Arc::new(RetValManager::new());
    let fetcher = AssetFetcher::spawn(source, dir.path(), retvals.clone());

    let report = fetcher
        .fetch_and_wait(&session(), vec!["a.png".to_string(), "sub/b.png".to_string()])
        .await
        .unwrap();
    assert!(report.is_success());
    assert_eq!(report.transferred, vec!["a.png", "sub/b.png"]);

    assert_eq!(
        *log.lock().unwrap(),
        vec![
            "open http://ai2.test/ode/download/file/1234/a.png",
            "close a.png",
            "open http://ai2.test/ode/download/file/1234/sub/b.png",
            "close sub/b.png",
        ]
    );
    assert_eq!(std::fs::read(dir.path().join("a.png")).unwrap(), b"a.png-data");
    assert_eq!(std::fs::read(dir.path().join("sub/b.png")).unwrap(), b"sub/b.png-data");

    let fetched = retvals.fetch();
    let values = fetched["values"].as_array().unwrap();
    assert_eq!(values.len(), 2);
    assert_eq!(values[0]["type"], "assetTransferred");
    assert_eq!(values[1]["value"], "sub/b.png");
    fetcher.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_failed_asset_aborts_its_batch_only() {
    let dir = tempfile::tempdir().unwrap();
    let source = Arc::new(FakeSource {
        failing: vec!["bad.png".to_string()],
        ..FakeSource::default()
    });
    let retvals = Arc::new(RetValManager::new());
    let fetcher = AssetFetcher::spawn(source, dir.path(), retvals.clone());

    let first = fetcher
        .fetch_assets(
            &session(),
            vec!["a.png".to_string(), "bad.png".to_string(), "c.png".to_string()],
        )
        .unwrap();
    let second = fetcher.fetch_asset(&session(), "d.png").unwrap();

    let first = first.await.unwrap();
    assert_eq!(first.transferred, vec!["a.png"]);
    assert_eq!(first.failed.as_ref().map(|(asset, _)| asset.as_str()), Some("bad.png"));
    assert_eq!(first.skipped, vec!["c.png"]);
    assert!(!dir.path().join("c.png").exists());

    let second = second.await.unwrap();
    assert!(second.is_success());
    assert_ne!(first.batch_id, second.batch_id);
    assert!(dir.path().join("d.png").exists());
    assert_eq!(retvals.pending_count(), 2);
    fetcher.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_escaping_asset_path_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let source = Arc::new(FakeSource::default());
    let log = source.log.clone();
    let fetcher = AssetFetcher::spawn(source, dir.path(), Arc::new(RetValManager::new()));

    let report = fetcher
        .fetch_and_wait(&session(), vec!["../escape.png".to_string()])
        .await
        .unwrap();
    assert!(!report.is_success());
    assert!(log.lock().unwrap().is_empty());
    fetcher.shutdown().await.unwrap();
}

// Signaling

#[derive(Default)]
struct FakeTransport {
    responses: Mutex<VecDeque<Vec<SignalMessage>>>,
    posted: Mutex<Vec<Value>>,
    /// Number of upcoming posts to reject.
    fail_posts: AtomicUsize,
}

impl FakeTransport {
    fn with_responses(responses: Vec<Vec<SignalMessage>>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into()),
            ..Self::default()
        })
    }
}

#[async_trait]
impl SignalingTransport for FakeTransport {
    async fn poll(&self, code: &str) -> Result<Vec<SignalMessage>> {
        assert_eq!(code, "abc123");
        Ok(self.responses.lock().unwrap().pop_front().unwrap_or_default())
    }

    async fn post(&self, message: &Value) -> Result<()> {
        let failing = self
            .fail_posts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            anyhow::bail!("rendezvous server unavailable");
        }
        self.posted.lock().unwrap().push(message.clone());
        Ok(())
    }
}

#[derive(Default)]
struct FakePeer {
    remote_descriptions: AtomicUsize,
    answers: AtomicUsize,
    candidates: Mutex<Vec<IceCandidate>>,
    local: Mutex<Vec<IceCandidate>>,
    sent: Mutex<Vec<String>>,
    connect_after_offer: bool,
    connected: AtomicBool,
    /// Candidates rejected the first time they are added.
    fail_candidates: Mutex<Vec<String>>,
}

#[async_trait]
impl PeerConnection for FakePeer {
    async fn set_remote_description(&self, _description: &SessionDescription) -> Result<()> {
        self.remote_descriptions.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        self.answers.fetch_add(1, Ordering::SeqCst);
        if self.connect_after_offer {
            self.connected.store(true, Ordering::SeqCst);
        }
        Ok(SessionDescription::answer("v=0 answer"))
    }

    async fn set_local_description(&self, _description: &SessionDescription) -> Result<()> {
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<()> {
        let mut failing = self.fail_candidates.lock().unwrap();
        if let Some(index) = failing.iter().position(|c| *c == candidate.candidate) {
            failing.remove(index);
            anyhow::bail!("peer rejected {}", candidate.candidate);
        }
        drop(failing);
        self.candidates.lock().unwrap().push(candidate.clone());
        Ok(())
    }

    async fn take_local_candidates(&self) -> Vec<IceCandidate> {
        std::mem::take(&mut *self.local.lock().unwrap())
    }

    fn send(&self, text: &str) -> Result<()> {
        self.sent.lock().unwrap().push(text.to_string());
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

struct Echo;

impl CodeEvaluator for Echo {
    fn evaluate(&self, code: &str) -> Result<Option<BlockResult>> {
        if code.contains("(error") {
            anyhow::bail!("Bad YAIL: {}", code);
        }
        Ok(Some(BlockResult {
            block_id: "5".to_string(),
            ok: true,
            value: code.to_string(),
        }))
    }
}

fn offer() -> SignalMessage {
    SignalMessage {
        offer: Some(SessionDescription {
            kind: "offer".to_string(),
            sdp: "v=0 offer".to_string(),
        }),
        ..SignalMessage::default()
    }
}

fn remote_candidate(nonce: &str) -> SignalMessage {
    SignalMessage {
        offer: None,
        nonce: Some(nonce.to_string()),
        candidate: Some(IceCandidate {
            candidate: format!("candidate:{}", nonce),
            sdp_mid: Some("0".to_string()),
            sdp_m_line_index: Some(0),
        }),
    }
}

fn manager(transport: Arc<FakeTransport>, peer: Arc<FakePeer>, retvals: Arc<RetValManager>) -> WebRtcNativeMgr {
    WebRtcNativeMgr::new("abc123", transport, peer, retvals, Arc::new(Echo))
        .with_poll_interval(Duration::from_millis(10))
}

#[tokio::test]
async fn test_replayed_offer_is_answered_once() {
    // The server returns everything posted so far on every poll.
    let transport = FakeTransport::with_responses(vec![vec![offer()], vec![offer()]]);
    let peer = Arc::new(FakePeer::default());
    let mgr = manager(transport.clone(), peer.clone(), Arc::new(RetValManager::new()));

    let first = mgr.poll_once().await.unwrap();
    let second = mgr.poll_once().await.unwrap();

    assert_eq!(first.offers_applied, 1);
    assert_eq!(second.offers_applied, 0);
    assert_eq!(peer.remote_descriptions.load(Ordering::SeqCst), 1);
    assert_eq!(peer.answers.load(Ordering::SeqCst), 1);
    assert!(mgr.have_offer().await);

    let posted = transport.posted.lock().unwrap().clone();
    assert_eq!(posted.len(), 1);
    assert_eq!(posted[0]["key"], "abc123-r");
    assert_eq!(posted[0]["offer"]["type"], "answer");
}

#[tokio::test]
async fn test_answer_is_reposted_after_failed_post() {
    let transport = FakeTransport::with_responses(vec![vec![offer()], vec![offer()], vec![offer()]]);
    transport.fail_posts.store(1, Ordering::SeqCst);
    let peer = Arc::new(FakePeer::default());
    let mgr = manager(transport.clone(), peer.clone(), Arc::new(RetValManager::new()));

    assert!(mgr.poll_once().await.is_err());
    assert!(!mgr.have_offer().await);

    let second = mgr.poll_once().await.unwrap();
    let third = mgr.poll_once().await.unwrap();
    assert_eq!(second.offers_applied, 1);
    assert_eq!(third.offers_applied, 0);
    assert!(mgr.have_offer().await);

    // The answer is created once and only posted again.
    assert_eq!(peer.remote_descriptions.load(Ordering::SeqCst), 1);
    assert_eq!(peer.answers.load(Ordering::SeqCst), 1);
    let posted = transport.posted.lock().unwrap().clone();
    assert_eq!(posted.len(), 1);
    assert_eq!(posted[0]["offer"]["type"], "answer");
}

#[tokio::test]
async fn test_rejected_candidate_is_retried_next_poll() {
    let response = vec![
        offer(),
        remote_candidate("1"),
        remote_candidate("2"),
        remote_candidate("3"),
    ];
    let transport = FakeTransport::with_responses(vec![response.clone(), response]);
    let peer = Arc::new(FakePeer {
        fail_candidates: Mutex::new(vec!["candidate:1".to_string()]),
        ..FakePeer::default()
    });
    let mgr = manager(transport, peer.clone(), Arc::new(RetValManager::new()));

    let first = mgr.poll_once().await.unwrap();
    assert_eq!(first.offers_applied, 1);
    assert_eq!(first.candidates_added, 2);
    assert_eq!(first.candidates_failed, 1);

    let second = mgr.poll_once().await.unwrap();
    assert_eq!(second.candidates_added, 1);
    assert_eq!(second.candidates_failed, 0);

    let mut added: Vec<String> = peer
        .candidates
        .lock()
        .unwrap()
        .iter()
        .map(|c| c.candidate.clone())
        .collect();
    added.sort();
    assert_eq!(added, vec!["candidate:1", "candidate:2", "candidate:3"]);
}

#[tokio::test]
async fn test_local_candidate_kept_until_posted() {
    let transport = FakeTransport::with_responses(vec![Vec::new(), Vec::new()]);
    transport.fail_posts.store(1, Ordering::SeqCst);
    let peer = Arc::new(FakePeer::default());
    peer.local.lock().unwrap().push(IceCandidate {
        candidate: "candidate:local".to_string(),
        sdp_mid: Some("0".to_string()),
        sdp_m_line_index: Some(0),
    });
    let mgr = manager(transport.clone(), peer.clone(), Arc::new(RetValManager::new()));

    assert!(mgr.poll_once().await.is_err());
    assert!(transport.posted.lock().unwrap().is_empty());
    assert!(peer.local.lock().unwrap().is_empty());

    let second = mgr.poll_once().await.unwrap();
    assert_eq!(second.candidates_sent, 1);
    let posted = transport.posted.lock().unwrap().clone();
    assert_eq!(posted.len(), 1);
    assert_eq!(posted[0]["candidate"]["candidate"], "candidate:local");
}

#[tokio::test]
async fn test_repeated_nonce_adds_candidate_once() {
    let transport = FakeTransport::with_responses(vec![
        vec![offer(), remote_candidate("7")],
        vec![offer(), remote_candidate("7"), remote_candidate("8")],
    ]);
    let peer = Arc::new(FakePeer::default());
    let mgr = manager(transport, peer.clone(), Arc::new(RetValManager::new()));

    mgr.poll_once().await.unwrap();
    let second = mgr.poll_once().await.unwrap();

    assert_eq!(second.candidates_added, 1);
    let added: Vec<String> = peer
        .candidates
        .lock()
        .unwrap()
        .iter()
        .map(|c| c.candidate.clone())
        .collect();
    assert_eq!(added, vec!["candidate:7", "candidate:8"]);
}

#[tokio::test]
async fn test_local_candidates_are_posted_with_nonces() {
    let transport = FakeTransport::with_responses(vec![vec![offer()]]);
    let peer = Arc::new(FakePeer::default());
    peer.local.lock().unwrap().push(IceCandidate {
        candidate: "candidate:local".to_string(),
        sdp_mid: Some("0".to_string()),
        sdp_m_line_index: Some(0),
    });
    let mgr = manager(transport.clone(), peer, Arc::new(RetValManager::new()));

    let outcome = mgr.poll_once().await.unwrap();
    assert_eq!(outcome.candidates_sent, 1);

    let posted = transport.posted.lock().unwrap().clone();
    let candidate = posted.last().unwrap();
    assert_eq!(candidate["key"], "abc123-r");
    assert_eq!(candidate["webrtc"], true);
    assert_eq!(candidate["candidate"]["candidate"], "candidate:local");
    assert!(!candidate["nonce"].as_str().unwrap().is_empty());
}

#[tokio::test]
async fn test_run_stops_when_connected_and_pushes_results() {
    let transport = FakeTransport::with_responses(vec![vec![offer()]]);
    let peer = Arc::new(FakePeer {
        connect_after_offer: true,
        ..FakePeer::default()
    });
    let retvals = Arc::new(RetValManager::new());
    let mgr = manager(transport, peer.clone(), retvals.clone());

    tokio::time::timeout(Duration::from_secs(5), mgr.run())
        .await
        .expect("polling should end once connected")
        .unwrap();

    mgr.on_data_channel_message("(+ 1 2)");
    mgr.on_data_channel_message("(error)");
    let sent = peer.sent.lock().unwrap().clone();
    assert_eq!(sent.len(), 2);
    assert!(sent[0].contains("\"blockid\":\"5\""));
    assert!(sent[1].contains("\"type\":\"error\""));
    assert_eq!(retvals.pending_count(), 0);
}

#[tokio::test]
async fn test_stop_ends_polling() {
    let transport = FakeTransport::with_responses(Vec::new());
    let peer = Arc::new(FakePeer::default());
    let mgr = Arc::new(manager(transport, peer, Arc::new(RetValManager::new())));

    let running = tokio::spawn({
        let mgr = mgr.clone();
        async move { mgr.run().await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    mgr.stop();

    tokio::time::timeout(Duration::from_secs(5), running)
        .await
        .expect("polling should stop")
        .unwrap()
        .unwrap();
    assert!(!mgr.have_offer().await);
}
