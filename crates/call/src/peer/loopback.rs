//! In-process [`PeerTransport`] pair
//!
//! Two loopback transports on the same [`LoopbackNetwork`] find each other
//! through the descriptions they exchange: a transport links to the peer whose
//! local description it receives as its remote description. A linked
//! transport reports the peer's tracks and `Connected` once it has both
//! descriptions and at least one remote candidate applied, mirroring when a
//! real connection first has a usable path.
//!
//! Every transport records what was applied to it, so tests can assert on
//! candidates, descriptions and sender tracks.

use super::transport::{
    ConnectionState, PeerTransport, RemoteTrack, SenderId, TransportEvent, TransportFactory,
};
use crate::config::CallConfig;
use crate::media::{MediaTrack, TrackKind};
use crate::signaling::{IceCandidate, SdpKind, SessionDescription};
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Candidates each transport gathers per local description
const HOST_CANDIDATES: u16 = 2;

/// Shared medium that loopback transports connect through
#[derive(Default)]
pub struct LoopbackNetwork {
    transports: Mutex<Vec<Weak<LoopbackTransport>>>,
    next_id: AtomicU32,
}

impl LoopbackNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Create a transport attached to this network
    pub fn create_transport(self: &Arc<Self>) -> Arc<LoopbackTransport> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let transport = Arc::new(LoopbackTransport::new(id, Arc::downgrade(self)));
        let mut transports = self.transports.lock();
        transports.retain(|t| t.strong_count() > 0);
        transports.push(Arc::downgrade(&transport));
        transport
    }

    fn find_by_local_description(
        &self,
        exclude: u32,
        description: &SessionDescription,
    ) -> Option<Arc<LoopbackTransport>> {
        self.transports
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|t| t.id != exclude)
            .find(|t| t.local_description().as_ref() == Some(description))
    }
}

/// Creates loopback transports and keeps them for inspection
pub struct LoopbackTransportFactory {
    network: Arc<LoopbackNetwork>,
    created: Mutex<Vec<Arc<LoopbackTransport>>>,
    fail_creates: AtomicBool,
    create_delay: Mutex<Option<Duration>>,
}

impl LoopbackTransportFactory {
    pub fn new(network: Arc<LoopbackNetwork>) -> Self {
        Self {
            network,
            created: Mutex::new(Vec::new()),
            fail_creates: AtomicBool::new(false),
            create_delay: Mutex::new(None),
        }
    }

    /// Make every subsequent `create` fail
    pub fn set_fail_creates(&self, fail: bool) {
        self.fail_creates.store(fail, Ordering::SeqCst);
    }

    /// Delay every subsequent `create`
    pub fn set_create_delay(&self, delay: Option<Duration>) {
        *self.create_delay.lock() = delay;
    }

    /// Every transport created so far, oldest first
    pub fn transports(&self) -> Vec<Arc<LoopbackTransport>> {
        self.created.lock().clone()
    }

    /// Most recently created transport
    pub fn last(&self) -> Option<Arc<LoopbackTransport>> {
        self.created.lock().last().cloned()
    }
}

#[async_trait]
impl TransportFactory for LoopbackTransportFactory {
    async fn create(&self, _config: &CallConfig) -> Result<Arc<dyn PeerTransport>> {
        let delay = *self.create_delay.lock();
        if let Some(delay) = delay {
            trace!("Delaying transport creation by {:?}", delay);
            tokio::time::sleep(delay).await;
        }
        if self.fail_creates.load(Ordering::SeqCst) {
            return Err(Error::PeerConnectionError(
                "loopback network unavailable".to_string(),
            ));
        }
        let transport = self.network.create_transport();
        self.created.lock().push(transport.clone());
        Ok(transport)
    }
}

#[derive(Default)]
struct LoopbackState {
    senders: Vec<(SenderId, MediaTrack)>,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    applied_candidates: Vec<IceCandidate>,
    peer: Option<Weak<LoopbackTransport>>,
    negotiations: usize,
    gathered: bool,
    connected: bool,
    closed: bool,
}

/// One end of a loopback connection
pub struct LoopbackTransport {
    id: u32,
    stream_id: String,
    network: Weak<LoopbackNetwork>,
    state: Mutex<LoopbackState>,
    next_sender: AtomicU32,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
}

impl LoopbackTransport {
    fn new(id: u32, network: Weak<LoopbackNetwork>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            id,
            stream_id: format!("loopback-stream-{}", id),
            network,
            state: Mutex::new(LoopbackState::default()),
            next_sender: AtomicU32::new(0),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Stream id the peer sees for this transport's tracks
    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        self.state.lock().local.clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.state.lock().remote.clone()
    }

    /// Remote candidates applied so far, in application order
    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().applied_candidates.clone()
    }

    /// Track currently sent by a sender
    pub fn sender_track(&self, sender: SenderId) -> Option<MediaTrack> {
        self.state
            .lock()
            .senders
            .iter()
            .find(|(id, _)| *id == sender)
            .map(|(_, track)| track.clone())
    }

    pub fn sender_tracks(&self) -> Vec<(SenderId, MediaTrack)> {
        self.state.lock().senders.clone()
    }

    /// Offers and answers generated so far
    pub fn negotiation_count(&self) -> usize {
        self.state.lock().negotiations
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Report a failed connection, as ICE would after exhausting every path
    pub fn fail_connection(&self) {
        let _ = self
            .events_tx
            .send(TransportEvent::ConnectionState(ConnectionState::Failed));
    }

    fn emit(&self, event: TransportEvent) {
        let _ = self.events_tx.send(event);
    }

    fn ensure_open(&self, state: &LoopbackState) -> Result<()> {
        if state.closed {
            return Err(Error::PeerConnectionError(format!(
                "loopback transport {} is closed",
                self.id
            )));
        }
        Ok(())
    }

    fn describe(&self, kind: SdpKind, state: &LoopbackState) -> SessionDescription {
        let mut sdp = format!(
            "v=0\r\no=loopback {} {} IN IP4 127.0.0.1\r\ns=-\r\n",
            self.id, state.negotiations
        );
        for (sender, track) in &state.senders {
            let media = match track.kind() {
                TrackKind::Audio => "audio",
                TrackKind::Video => "video",
            };
            sdp.push_str(&format!(
                "m={} 9 UDP/TLS/RTP/SAVPF 0\r\na=msid:{} {}\r\n",
                media,
                self.stream_id,
                self.remote_track_id(*sender)
            ));
        }
        SessionDescription { kind, sdp }
    }

    fn remote_track_id(&self, sender: SenderId) -> String {
        format!("loopback-{}-track-{}", self.id, sender.0)
    }

    /// Tracks as the peer receives them
    fn outbound_tracks(&self) -> Vec<RemoteTrack> {
        self.state
            .lock()
            .senders
            .iter()
            .map(|(sender, track)| RemoteTrack {
                id: self.remote_track_id(*sender),
                kind: track.kind(),
            })
            .collect()
    }

    fn maybe_connect(&self) {
        let peer = {
            let mut state = self.state.lock();
            let ready = !state.connected
                && !state.closed
                && state.local.is_some()
                && state.remote.is_some()
                && !state.applied_candidates.is_empty();
            let peer = state.peer.as_ref().and_then(Weak::upgrade);
            match peer {
                Some(peer) if ready => {
                    state.connected = true;
                    peer
                }
                _ => return,
            }
        };

        debug!("Loopback transport {} connected to {}", self.id, peer.id);
        self.emit(TransportEvent::ConnectionState(ConnectionState::Connecting));
        for track in peer.outbound_tracks() {
            self.emit(TransportEvent::RemoteTrack {
                stream_id: peer.stream_id.clone(),
                track,
            });
        }
        self.emit(TransportEvent::ConnectionState(ConnectionState::Connected));
    }
}

#[async_trait]
impl PeerTransport for LoopbackTransport {
    async fn add_track(&self, track: &MediaTrack) -> Result<SenderId> {
        let mut state = self.state.lock();
        self.ensure_open(&state)?;
        let id = SenderId(self.next_sender.fetch_add(1, Ordering::SeqCst));
        state.senders.push((id, track.clone()));
        Ok(id)
    }

    async fn replace_track(&self, sender: SenderId, track: &MediaTrack) -> Result<()> {
        let mut state = self.state.lock();
        self.ensure_open(&state)?;
        let slot = state
            .senders
            .iter_mut()
            .find(|(id, _)| *id == sender)
            .ok_or_else(|| Error::MediaTrackError(format!("Unknown sender {:?}", sender)))?;
        if slot.1.kind() != track.kind() {
            return Err(Error::MediaTrackError(format!(
                "Cannot replace {:?} track with {:?}",
                slot.1.kind(),
                track.kind()
            )));
        }
        slot.1 = track.clone();
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        let mut state = self.state.lock();
        self.ensure_open(&state)?;
        state.negotiations += 1;
        Ok(self.describe(SdpKind::Offer, &state))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let mut state = self.state.lock();
        self.ensure_open(&state)?;
        if !matches!(&state.remote, Some(d) if d.kind == SdpKind::Offer) {
            return Err(Error::SdpError(
                "Cannot create answer without a remote offer".to_string(),
            ));
        }
        state.negotiations += 1;
        Ok(self.describe(SdpKind::Answer, &state))
    }

    async fn set_local_description(&self, description: &SessionDescription) -> Result<()> {
        let gather = {
            let mut state = self.state.lock();
            self.ensure_open(&state)?;
            state.local = Some(description.clone());
            !std::mem::replace(&mut state.gathered, true)
        };

        if gather {
            for n in 0..HOST_CANDIDATES {
                self.emit(TransportEvent::LocalCandidate(IceCandidate::new(
                    format!(
                        "candidate:{} 1 udp 2122260223 127.0.0.1 {} typ host",
                        n + 1,
                        40000 + u32::from(self.id) * 10 + u32::from(n)
                    ),
                    Some("0".to_string()),
                    Some(0),
                )));
            }
            self.emit(TransportEvent::GatheringComplete);
        }
        self.maybe_connect();
        Ok(())
    }

    async fn set_remote_description(&self, description: &SessionDescription) -> Result<()> {
        self.ensure_open(&self.state.lock())?;

        let peer = self
            .network
            .upgrade()
            .and_then(|network| network.find_by_local_description(self.id, description));

        {
            let mut state = self.state.lock();
            state.remote = Some(description.clone());
            if let Some(peer) = &peer {
                trace!("Loopback transport {} linked to {}", self.id, peer.id);
                state.peer = Some(Arc::downgrade(peer));
            }
        }
        self.maybe_connect();
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<()> {
        {
            let mut state = self.state.lock();
            self.ensure_open(&state)?;
            if state.remote.is_none() {
                return Err(Error::IceCandidateError(
                    "remote description not set".to_string(),
                ));
            }
            state.applied_candidates.push(candidate.clone());
        }
        self.maybe_connect();
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let was_closed = std::mem::replace(&mut self.state.lock().closed, true);
        if !was_closed {
            self.emit(TransportEvent::ConnectionState(ConnectionState::Closed));
        }
        Ok(())
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        self.events_rx.lock().take()
    }
}
