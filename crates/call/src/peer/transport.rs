//! Peer transport abstraction
//!
//! The manager drives negotiation through [`PeerTransport`]; asynchronous
//! notifications (local candidates, remote tracks, connection state) come
//! back on a single event channel taken once with
//! [`PeerTransport::take_events`].

use crate::config::CallConfig;
use crate::media::{MediaTrack, TrackKind};
use crate::signaling::{IceCandidate, SessionDescription};
use crate::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Handle to an outbound sender created by [`PeerTransport::add_track`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SenderId(pub u32);

/// Track received from the remote peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    pub id: String,
    pub kind: TrackKind,
}

/// Remote media grouped by stream, as rendered by the UI
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteStream {
    pub id: String,
    pub tracks: Vec<RemoteTrack>,
}

impl RemoteStream {
    pub fn has_kind(&self, kind: TrackKind) -> bool {
        self.tracks.iter().any(|t| t.kind == kind)
    }
}

/// Transport-level connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Notification emitted by a transport
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Locally gathered candidate to forward to the remote peer
    LocalCandidate(IceCandidate),
    /// Candidate gathering finished
    GatheringComplete,
    /// A remote track arrived
    RemoteTrack { stream_id: String, track: RemoteTrack },
    ConnectionState(ConnectionState),
}

/// One peer-to-peer media connection
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Start sending a local track
    async fn add_track(&self, track: &MediaTrack) -> Result<SenderId>;

    /// Swap the track on an existing sender without renegotiating
    async fn replace_track(&self, sender: SenderId, track: &MediaTrack) -> Result<()>;

    async fn create_offer(&self) -> Result<SessionDescription>;

    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_local_description(&self, description: &SessionDescription) -> Result<()>;

    async fn set_remote_description(&self, description: &SessionDescription) -> Result<()>;

    /// Apply a remote candidate; only valid once a remote description is set
    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<()>;

    async fn close(&self) -> Result<()>;

    /// Event stream; `None` after the first call
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>>;
}

/// Creates a fresh transport per call
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(&self, config: &CallConfig) -> Result<Arc<dyn PeerTransport>>;
}
