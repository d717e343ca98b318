//! Live-development companion transport
//!
//! Asset downloads from the App Inventor server, the return-value channel back to the
//! browser, and WebRTC signaling through the rendezvous server.

pub mod assets;
pub mod rendezvous;
pub mod retval;
pub mod webrtc;

pub use assets::{AssetFetcher, AssetSession, AssetSource, BatchReport, HttpAssetSource};
pub use rendezvous::{HttpRendezvous, SignalMessage, SignalingState, SignalingTransport};
pub use retval::{RetValManager, RetValSink};
pub use webrtc::{CodeEvaluator, IceServer, LoggingPeer, PeerConnection, WebRtcNativeMgr};
