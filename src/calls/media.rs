//! Media engine interface.
//!
//! The engine is the ICE/DTLS/RTP stack (a WebRTC peer connection or
//! similar). The call engine drives it with content maps and receives its
//! events over an unbounded channel, one per session.

use async_trait::async_trait;
use jinglecore::content::{ContentMap, IceCandidate};
use jinglecore::media::{MediaKind, MediaSet};
use jinglecore::state::{PeerConnectionState, SignalingState};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MediaError {
    #[error("failed to initialize media engine: {0}")]
    Initialization(String),
    #[error("failed to apply description: {0}")]
    Description(String),
    #[error("invalid candidate: {0}")]
    Candidate(String),
    #[error("media engine is closed")]
    Closed,
}

/// Events emitted by a media engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaEvent {
    /// A local ICE candidate was gathered for the named content.
    IceCandidate {
        content: String,
        candidate: IceCandidate,
    },
    ConnectionStateChanged(PeerConnectionState),
    /// The engine changed its local configuration on its own and needs a
    /// new offer. Changes requested through [`MediaEngine::add_track`] or
    /// [`MediaEngine::restart_ice`] do not raise this event.
    RenegotiationNeeded,
}

pub type MediaEventSender = mpsc::UnboundedSender<MediaEvent>;

#[async_trait]
pub trait MediaEngine: Send + Sync {
    async fn add_track(&self, kind: MediaKind) -> Result<(), MediaError>;

    async fn remove_track(&self, kind: MediaKind) -> Result<(), MediaError>;

    /// Create an offer and apply it as the local description.
    async fn apply_local_offer(&self) -> Result<ContentMap, MediaError>;

    /// Create an answer to the current remote offer and apply it.
    async fn apply_local_answer(&self) -> Result<ContentMap, MediaError>;

    /// Apply a remote offer. A pending local offer is rolled back first.
    async fn apply_remote_offer(&self, offer: &ContentMap) -> Result<(), MediaError>;

    async fn apply_remote_answer(&self, answer: &ContentMap) -> Result<(), MediaError>;

    async fn add_ice_candidate(
        &self,
        content: &str,
        candidate: &IceCandidate,
    ) -> Result<(), MediaError>;

    /// Generate fresh ICE credentials for the next offer.
    async fn restart_ice(&self) -> Result<(), MediaError>;

    fn signaling_state(&self) -> SignalingState;

    async fn close(&self);
}

/// Creates one media engine per session.
pub trait MediaEngineFactory: Send + Sync {
    fn create(
        &self,
        media: &MediaSet,
        events: MediaEventSender,
    ) -> Result<Arc<dyn MediaEngine>, MediaError>;
}
