//! Peer connection manager
//!
//! Owns one [`PeerTransport`] for the lifetime of a call together with the
//! local media feeding it. Description and candidate operations are
//! serialized on one async lock, so candidates queued before the remote
//! description are flushed in order before any later candidate is applied.

use super::transport::{
    ConnectionState, PeerTransport, RemoteStream, RemoteTrack, SenderId, TransportEvent,
};
use crate::config::MediaConstraints;
use crate::media::{MediaDevices, MediaStream, MediaTrack, TrackKind};
use crate::signaling::{IceCandidate, SdpKind, SessionDescription};
use crate::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Result of applying a remote description
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteDescriptionOutcome {
    /// The description was applied to the transport
    Applied,
    /// The same description was already applied; nothing changed
    AlreadyApplied,
}

/// Notification surfaced by the manager's event loop
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// Local candidate to publish on the signaling channel
    LocalCandidate(IceCandidate),
    /// Latest remote stream
    RemoteStream(RemoteStream),
    ConnectionState(ConnectionState),
}

#[derive(Default)]
struct ManagerState {
    camera_stream: Option<MediaStream>,
    screen_stream: Option<MediaStream>,
    audio_sender: Option<SenderId>,
    video_sender: Option<SenderId>,
    /// Track currently on the video sender
    outbound_video: Option<MediaTrack>,
    local_description: Option<SessionDescription>,
    remote_description: Option<SessionDescription>,
    pending_candidates: Vec<IceCandidate>,
    seen_candidates: HashSet<IceCandidate>,
    event_task: Option<JoinHandle<()>>,
    revert_task: Option<JoinHandle<()>>,
}

/// Local/remote media and the native connection for one call
pub struct PeerConnectionManager {
    transport: Arc<dyn PeerTransport>,
    devices: Arc<dyn MediaDevices>,
    state: Mutex<ManagerState>,
    negotiation: tokio::sync::Mutex<()>,
    local_stream: watch::Sender<Option<MediaStream>>,
    remote_stream: watch::Sender<Option<RemoteStream>>,
    closed: AtomicBool,
}

impl PeerConnectionManager {
    pub fn new(transport: Arc<dyn PeerTransport>, devices: Arc<dyn MediaDevices>) -> Arc<Self> {
        let (local_stream, _) = watch::channel(None);
        let (remote_stream, _) = watch::channel(None);
        Arc::new(Self {
            transport,
            devices,
            state: Mutex::new(ManagerState::default()),
            negotiation: tokio::sync::Mutex::new(()),
            local_stream,
            remote_stream,
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::SessionClosed("peer connection closed".to_string()));
        }
        Ok(())
    }

    // ========================================================================
    // Local media
    // ========================================================================

    /// Request camera and/or microphone
    ///
    /// Tracks acquired after the manager was closed are stopped immediately.
    pub async fn acquire_local_media(&self, constraints: MediaConstraints) -> Result<MediaStream> {
        self.ensure_open()?;
        let stream = self.devices.get_user_media(constraints).await?;

        let previous = {
            let mut state = self.state.lock();
            if self.closed.load(Ordering::SeqCst) {
                drop(state);
                stream.stop_all();
                return Err(Error::SessionClosed(
                    "call ended while acquiring media".to_string(),
                ));
            }
            state.camera_stream.replace(stream.clone())
        };
        if let Some(previous) = previous {
            previous.stop_all();
        }

        debug!("Acquired local media: {} track(s)", stream.tracks().len());
        self.local_stream.send_replace(Some(stream.clone()));
        Ok(stream)
    }

    /// Add every track of the stream to the outbound set
    pub async fn attach_local_tracks(&self, stream: &MediaStream) -> Result<()> {
        for track in stream.tracks() {
            self.ensure_open()?;
            let sender = self.transport.add_track(track).await?;

            let mut state = self.state.lock();
            match track.kind() {
                TrackKind::Audio if state.audio_sender.is_none() => {
                    state.audio_sender = Some(sender);
                }
                TrackKind::Video if state.video_sender.is_none() => {
                    state.video_sender = Some(sender);
                    state.outbound_video = Some(track.clone());
                }
                _ => {}
            }
            trace!("Attached {:?} track {} as {:?}", track.kind(), track.id(), sender);
        }
        Ok(())
    }

    // ========================================================================
    // Negotiation
    // ========================================================================

    /// Generate an offer and apply it locally in one step
    pub async fn create_offer(&self) -> Result<SessionDescription> {
        let _guard = self.negotiation.lock().await;
        self.ensure_open()?;

        let offer = self.transport.create_offer().await?;
        self.transport.set_local_description(&offer).await?;
        self.state.lock().local_description = Some(offer.clone());
        debug!("Created and applied local offer");
        Ok(offer)
    }

    /// Generate an answer to the applied remote offer and apply it locally
    pub async fn create_answer(&self) -> Result<SessionDescription> {
        let _guard = self.negotiation.lock().await;
        self.ensure_open()?;

        let has_offer = matches!(
            &self.state.lock().remote_description,
            Some(d) if d.kind == SdpKind::Offer
        );
        if !has_offer {
            return Err(Error::InvalidState(
                "cannot answer before a remote offer is applied".to_string(),
            ));
        }

        let answer = self.transport.create_answer().await?;
        self.transport.set_local_description(&answer).await?;
        self.state.lock().local_description = Some(answer.clone());
        debug!("Created and applied local answer");
        Ok(answer)
    }

    /// Apply a remote offer or answer
    ///
    /// Re-applying the applied description is a no-op. A different
    /// description after one is applied is rejected with
    /// [`Error::StaleNegotiation`] and the original stays in place. Queued
    /// candidates are flushed once the description is applied.
    pub async fn set_remote_description(
        &self,
        description: &SessionDescription,
    ) -> Result<RemoteDescriptionOutcome> {
        let _guard = self.negotiation.lock().await;
        self.ensure_open()?;

        {
            let state = self.state.lock();
            if let Some(existing) = &state.remote_description {
                if existing == description {
                    debug!("Remote {:?} already applied", description.kind);
                    return Ok(RemoteDescriptionOutcome::AlreadyApplied);
                }
                return Err(Error::StaleNegotiation(format!(
                    "remote {:?} conflicts with the applied {:?}",
                    description.kind, existing.kind
                )));
            }
            if let Some(local) = &state.local_description {
                if local.kind == description.kind {
                    return Err(Error::InvalidState(format!(
                        "remote {:?} received while local {:?} is applied",
                        description.kind, local.kind
                    )));
                }
            }
        }

        self.transport.set_remote_description(description).await?;

        let pending = {
            let mut state = self.state.lock();
            state.remote_description = Some(description.clone());
            std::mem::take(&mut state.pending_candidates)
        };

        if !pending.is_empty() {
            debug!("Flushing {} queued remote candidate(s)", pending.len());
        }
        for candidate in pending {
            if let Err(e) = self.transport.add_ice_candidate(&candidate).await {
                warn!("Failed to apply queued candidate: {}", e);
            }
        }
        Ok(RemoteDescriptionOutcome::Applied)
    }

    /// Feed one remote candidate, queuing it until the remote description
    /// is applied
    ///
    /// Duplicates are ignored, and so is anything arriving after close.
    pub async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Ok(());
        }
        let _guard = self.negotiation.lock().await;
        if self.closed.load(Ordering::SeqCst) {
            return Ok(());
        }

        {
            let mut state = self.state.lock();
            if !state.seen_candidates.insert(candidate.clone()) {
                trace!("Ignoring duplicate remote candidate");
                return Ok(());
            }
            if state.remote_description.is_none() {
                trace!("Queuing remote candidate until remote description is set");
                state.pending_candidates.push(candidate);
                return Ok(());
            }
        }

        self.transport.add_ice_candidate(&candidate).await
    }

    // ========================================================================
    // Transport events
    // ========================================================================

    /// Start forwarding transport events; call once per manager
    pub fn start_event_loop(self: &Arc<Self>) -> Result<mpsc::UnboundedReceiver<PeerEvent>> {
        self.ensure_open()?;
        let mut events = self
            .transport
            .take_events()
            .ok_or_else(|| Error::InvalidState("event loop already started".to_string()))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let manager = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                let forwarded = match event {
                    TransportEvent::LocalCandidate(candidate) => {
                        Some(PeerEvent::LocalCandidate(candidate))
                    }
                    TransportEvent::GatheringComplete => {
                        debug!("ICE gathering complete");
                        None
                    }
                    TransportEvent::RemoteTrack { stream_id, track } => {
                        Some(PeerEvent::RemoteStream(manager.on_remote_track(stream_id, track)))
                    }
                    TransportEvent::ConnectionState(state) => {
                        debug!("Transport connection state: {:?}", state);
                        Some(PeerEvent::ConnectionState(state))
                    }
                };
                if let Some(event) = forwarded {
                    let _ = tx.send(event);
                }
            }
            trace!("Transport event loop finished");
        });

        let mut state = self.state.lock();
        if self.closed.load(Ordering::SeqCst) {
            task.abort();
        } else {
            state.event_task = Some(task);
        }
        Ok(rx)
    }

    fn on_remote_track(&self, stream_id: String, track: RemoteTrack) -> RemoteStream {
        let mut stream = match self.remote_stream.borrow().as_ref() {
            Some(current) if current.id == stream_id => current.clone(),
            _ => RemoteStream {
                id: stream_id,
                tracks: Vec::new(),
            },
        };
        if !stream.tracks.iter().any(|t| t.id == track.id) {
            debug!("Remote {:?} track {} on stream {}", track.kind, track.id, stream.id);
            stream.tracks.push(track);
        }
        self.remote_stream.send_replace(Some(stream.clone()));
        stream
    }

    // ========================================================================
    // Screen share
    // ========================================================================

    /// Swap the track on the outbound video sender without renegotiating
    ///
    /// When the new track is not the camera track, the sender reverts to the
    /// camera once the new track ends.
    pub async fn replace_outbound_video_track(self: &Arc<Self>, track: &MediaTrack) -> Result<()> {
        self.ensure_open()?;
        let sender = self.state.lock().video_sender.ok_or_else(|| {
            Error::InvalidState("no outbound video sender to replace".to_string())
        })?;

        self.transport.replace_track(sender, track).await?;

        let camera = self.camera_video_track();
        let revert = camera.filter(|c| !c.same_track(track)).map(|_| {
            let manager = Arc::downgrade(self);
            let ended = track.clone();
            tokio::spawn(Self::revert_when_ended(manager, ended))
        });

        let previous = {
            let mut state = self.state.lock();
            state.outbound_video = Some(track.clone());
            std::mem::replace(&mut state.revert_task, revert)
        };
        if let Some(previous) = previous {
            previous.abort();
        }
        info!("Outbound video now {:?} track {}", track.source(), track.id());
        Ok(())
    }

    async fn revert_when_ended(manager: Weak<Self>, track: MediaTrack) {
        track.ended().await;
        let Some(manager) = manager.upgrade() else {
            return;
        };
        let current = {
            let mut state = manager.state.lock();
            let current = state
                .outbound_video
                .as_ref()
                .is_some_and(|t| t.same_track(&track));
            if current {
                state.revert_task = None;
            }
            current
        };
        if current {
            debug!("Outbound track {} ended, reverting to camera", track.id());
            if let Err(e) = manager.restore_camera().await {
                warn!("Failed to revert to camera track: {}", e);
            }
        }
    }

    /// Capture the screen and send it in place of the camera
    ///
    /// Returns the active screen stream if already sharing.
    pub async fn start_screen_share(self: &Arc<Self>) -> Result<MediaStream> {
        self.ensure_open()?;
        {
            let state = self.state.lock();
            if let Some(screen) = &state.screen_stream {
                return Ok(screen.clone());
            }
            if state.video_sender.is_none() {
                return Err(Error::InvalidState(
                    "screen share needs an outbound video sender".to_string(),
                ));
            }
        }

        let stream = self.devices.get_display_media().await?;
        let Some(track) = stream.video_track().cloned() else {
            stream.stop_all();
            return Err(Error::MediaTrackError(
                "display stream has no video track".to_string(),
            ));
        };

        if let Err(e) = self.replace_outbound_video_track(&track).await {
            stream.stop_all();
            return Err(e);
        }

        {
            let mut state = self.state.lock();
            if self.closed.load(Ordering::SeqCst) {
                drop(state);
                stream.stop_all();
                return Err(Error::SessionClosed(
                    "call ended while starting screen share".to_string(),
                ));
            }
            state.screen_stream = Some(stream.clone());
        }
        self.local_stream.send_replace(Some(stream.clone()));

        // The capture may have been stopped before the stream was recorded
        if !track.is_live() {
            self.restore_camera().await?;
        }

        info!("Screen share started");
        Ok(stream)
    }

    /// Stop sharing and revert to the camera; no-op when not sharing
    pub async fn stop_screen_share(&self) -> Result<()> {
        let revert = {
            let mut state = self.state.lock();
            if state.screen_stream.is_none() {
                return Ok(());
            }
            state.revert_task.take()
        };
        if let Some(revert) = revert {
            revert.abort();
        }
        self.restore_camera().await
    }

    async fn restore_camera(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Ok(());
        }

        let (sender, camera, camera_stream, screen) = {
            let mut state = self.state.lock();
            (
                state.video_sender,
                state.camera_stream.as_ref().and_then(|s| s.video_track()).cloned(),
                state.camera_stream.clone(),
                state.screen_stream.take(),
            )
        };
        if let Some(screen) = screen {
            screen.stop_all();
        }

        if let (Some(sender), Some(camera)) = (sender, camera) {
            self.transport.replace_track(sender, &camera).await?;
            self.state.lock().outbound_video = Some(camera);
            info!("Outbound video reverted to camera");
        }
        self.local_stream.send_replace(camera_stream);
        Ok(())
    }

    // ========================================================================
    // Teardown
    // ========================================================================

    /// Stop every local track and close the transport. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let (event_task, revert_task, camera, screen) = {
            let mut state = self.state.lock();
            state.pending_candidates.clear();
            (
                state.event_task.take(),
                state.revert_task.take(),
                state.camera_stream.take(),
                state.screen_stream.take(),
            )
        };

        for task in [event_task, revert_task].into_iter().flatten() {
            task.abort();
        }
        for stream in [camera, screen].into_iter().flatten() {
            stream.stop_all();
        }

        if let Err(e) = self.transport.close().await {
            warn!("Error closing peer transport: {}", e);
        }

        self.local_stream.send_replace(None);
        self.remote_stream.send_replace(None);
        info!("Peer connection closed");
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn camera_video_track(&self) -> Option<MediaTrack> {
        self.state
            .lock()
            .camera_stream
            .as_ref()
            .and_then(|s| s.video_track())
            .cloned()
    }

    /// Stream currently shown as local preview (camera or screen)
    pub fn local_stream(&self) -> Option<MediaStream> {
        self.local_stream.borrow().clone()
    }

    pub fn remote_stream(&self) -> Option<RemoteStream> {
        self.remote_stream.borrow().clone()
    }

    pub fn subscribe_local_stream(&self) -> watch::Receiver<Option<MediaStream>> {
        self.local_stream.subscribe()
    }

    pub fn subscribe_remote_stream(&self) -> watch::Receiver<Option<RemoteStream>> {
        self.remote_stream.subscribe()
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        self.state.lock().local_description.clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.state.lock().remote_description.clone()
    }

    pub fn pending_candidate_count(&self) -> usize {
        self.state.lock().pending_candidates.len()
    }

    pub fn has_video_sender(&self) -> bool {
        self.state.lock().video_sender.is_some()
    }

    pub fn audio_sender(&self) -> Option<SenderId> {
        self.state.lock().audio_sender
    }

    pub fn video_sender(&self) -> Option<SenderId> {
        self.state.lock().video_sender
    }

    pub fn outbound_video_track(&self) -> Option<MediaTrack> {
        self.state.lock().outbound_video.clone()
    }

    pub fn is_screen_sharing(&self) -> bool {
        self.state.lock().screen_stream.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::StaticMediaDevices;
    use crate::peer::loopback::{LoopbackNetwork, LoopbackTransport};
    use std::time::Duration;

    fn setup() -> (Arc<PeerConnectionManager>, Arc<LoopbackTransport>, Arc<StaticMediaDevices>) {
        let network = LoopbackNetwork::new();
        let transport = network.create_transport();
        let devices = Arc::new(StaticMediaDevices::new());
        let manager = PeerConnectionManager::new(transport.clone(), devices.clone());
        (manager, transport, devices)
    }

    fn candidate(n: u16) -> IceCandidate {
        IceCandidate::new(
            format!("candidate:{} 1 udp 1 10.0.0.{} 5000 typ host", n, n),
            Some("0".to_string()),
            Some(0),
        )
    }

    async fn with_media(manager: &Arc<PeerConnectionManager>) -> MediaStream {
        let stream = manager
            .acquire_local_media(MediaConstraints::default())
            .await
            .unwrap();
        manager.attach_local_tracks(&stream).await.unwrap();
        stream
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_same_remote_description_twice_is_noop() {
        let (manager, transport, _) = setup();
        let offer = SessionDescription::offer("v=0 remote-offer");

        let first = manager.set_remote_description(&offer).await.unwrap();
        let second = manager.set_remote_description(&offer).await.unwrap();

        assert_eq!(first, RemoteDescriptionOutcome::Applied);
        assert_eq!(second, RemoteDescriptionOutcome::AlreadyApplied);
        assert_eq!(transport.remote_description(), Some(offer));
    }

    #[tokio::test]
    async fn test_conflicting_remote_description_is_stale() {
        let (manager, transport, _) = setup();
        let original = SessionDescription::offer("v=0 first");
        manager.set_remote_description(&original).await.unwrap();

        let err = manager
            .set_remote_description(&SessionDescription::offer("v=0 second"))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::StaleNegotiation(_)));
        assert_eq!(manager.remote_description(), Some(original.clone()));
        assert_eq!(transport.remote_description(), Some(original));
    }

    #[tokio::test]
    async fn test_candidates_queue_until_remote_description() {
        let (manager, transport, _) = setup();
        manager.add_remote_candidate(candidate(1)).await.unwrap();
        manager.add_remote_candidate(candidate(2)).await.unwrap();
        manager.add_remote_candidate(candidate(1)).await.unwrap();
        assert_eq!(manager.pending_candidate_count(), 2);
        assert!(transport.applied_candidates().is_empty());

        manager
            .set_remote_description(&SessionDescription::offer("v=0 offer"))
            .await
            .unwrap();
        manager.add_remote_candidate(candidate(3)).await.unwrap();

        assert_eq!(manager.pending_candidate_count(), 0);
        assert_eq!(
            transport.applied_candidates(),
            vec![candidate(1), candidate(2), candidate(3)]
        );
    }

    #[tokio::test]
    async fn test_answer_requires_remote_offer() {
        let (manager, _, _) = setup();
        let err = manager.create_answer().await.unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_offer_is_applied_locally() {
        let (manager, transport, _) = setup();
        with_media(&manager).await;
        let offer = manager.create_offer().await.unwrap();
        assert_eq!(transport.local_description(), Some(offer.clone()));
        assert_eq!(manager.local_description(), Some(offer));
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_releases_media() {
        let (manager, transport, devices) = setup();
        with_media(&manager).await;
        let mut local = manager.subscribe_local_stream();
        assert!(local.borrow_and_update().is_some());

        manager.close().await;
        manager.close().await;

        assert_eq!(devices.live_track_count(), 0);
        assert!(transport.is_closed());
        assert!(local.borrow().is_none());
        manager.add_remote_candidate(candidate(1)).await.unwrap();
        assert!(transport.applied_candidates().is_empty());
    }

    #[tokio::test]
    async fn test_media_acquired_after_close_is_stopped() {
        let (manager, _, devices) = setup();
        devices.set_acquire_delay(Some(Duration::from_millis(30)));

        let acquiring = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.acquire_local_media(MediaConstraints::default()).await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        manager.close().await;

        let err = acquiring.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::SessionClosed(_)));
        assert_eq!(devices.live_track_count(), 0);
    }

    #[tokio::test]
    async fn test_screen_share_reverts_when_track_ends() {
        let (manager, transport, _) = setup();
        let camera_stream = with_media(&manager).await;
        let camera = camera_stream.video_track().cloned().unwrap();
        let audio_sender = manager.audio_sender().unwrap();
        let video_sender = manager.video_sender().unwrap();
        let mic = transport.sender_track(audio_sender).unwrap();

        let screen = manager.start_screen_share().await.unwrap();
        let screen_track = screen.video_track().cloned().unwrap();
        assert!(transport.sender_track(video_sender).unwrap().same_track(&screen_track));
        assert_eq!(manager.local_stream().unwrap().id(), screen.id());

        screen_track.stop();
        wait_until(|| {
            !manager.is_screen_sharing()
                && manager.local_stream().is_some_and(|s| s.id() == camera_stream.id())
        })
        .await;

        assert!(transport.sender_track(video_sender).unwrap().same_track(&camera));
        assert!(transport.sender_track(audio_sender).unwrap().same_track(&mic));
        assert_eq!(manager.local_stream().unwrap().id(), camera_stream.id());
        assert_eq!(transport.negotiation_count(), 0);
    }

    #[tokio::test]
    async fn test_stop_screen_share_reverts_explicitly() {
        let (manager, transport, _) = setup();
        let camera = with_media(&manager).await.video_track().cloned().unwrap();

        let screen = manager.start_screen_share().await.unwrap();
        manager.stop_screen_share().await.unwrap();

        assert!(!manager.is_screen_sharing());
        assert!(!screen.video_track().unwrap().is_live());
        let video_sender = manager.video_sender().unwrap();
        assert!(transport.sender_track(video_sender).unwrap().same_track(&camera));

        manager.stop_screen_share().await.unwrap();
    }

    #[tokio::test]
    async fn test_screen_share_without_video_sender_is_invalid() {
        let (manager, _, _) = setup();
        let stream = manager
            .acquire_local_media(MediaConstraints {
                video: false,
                audio: true,
            })
            .await
            .unwrap();
        manager.attach_local_tracks(&stream).await.unwrap();

        let err = manager.start_screen_share().await.unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
    }
}
