//! Local media: tracks, streams and device access
//!
//! A [`MediaTrack`] is a cheap, clonable handle. Stopping any clone ends the
//! track for every holder, and [`MediaTrack::ended`] resolves for all of them,
//! which is how an OS-level "stop sharing" reaches the peer connection manager.

use crate::config::MediaConstraints;
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;

/// Media kind of a track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

/// Where a local track comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackSource {
    Microphone,
    Camera,
    Screen,
}

impl TrackSource {
    /// Media kind produced by this source
    pub fn kind(&self) -> TrackKind {
        match self {
            TrackSource::Microphone => TrackKind::Audio,
            TrackSource::Camera | TrackSource::Screen => TrackKind::Video,
        }
    }
}

/// Lifecycle of a local track
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackState {
    Live,
    Ended,
}

struct TrackInner {
    id: String,
    source: TrackSource,
    label: String,
    state: watch::Sender<TrackState>,
}

/// Handle to one local media track
#[derive(Clone)]
pub struct MediaTrack {
    inner: Arc<TrackInner>,
}

impl MediaTrack {
    /// Create a live track for the given source
    pub fn new(source: TrackSource, label: impl Into<String>) -> Self {
        let (state, _) = watch::channel(TrackState::Live);
        Self {
            inner: Arc::new(TrackInner {
                id: uuid::Uuid::new_v4().to_string(),
                source,
                label: label.into(),
                state,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn kind(&self) -> TrackKind {
        self.inner.source.kind()
    }

    pub fn source(&self) -> TrackSource {
        self.inner.source
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn state(&self) -> TrackState {
        *self.inner.state.borrow()
    }

    pub fn is_live(&self) -> bool {
        self.state() == TrackState::Live
    }

    /// Stop the track. Idempotent.
    pub fn stop(&self) {
        let stopped = self.inner.state.send_if_modified(|state| {
            if *state == TrackState::Live {
                *state = TrackState::Ended;
                true
            } else {
                false
            }
        });
        if stopped {
            debug!("Stopped {:?} track {}", self.inner.source, self.inner.id);
        }
    }

    /// Resolves once the track has ended, whoever stopped it
    pub async fn ended(&self) {
        let mut rx = self.inner.state.subscribe();
        let _ = rx.wait_for(|state| *state == TrackState::Ended).await;
    }

    /// Whether two handles refer to the same underlying track
    pub fn same_track(&self, other: &MediaTrack) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaTrack")
            .field("id", &self.inner.id)
            .field("source", &self.inner.source)
            .field("label", &self.inner.label)
            .field("state", &self.state())
            .finish()
    }
}

impl PartialEq for MediaTrack {
    fn eq(&self, other: &Self) -> bool {
        self.same_track(other)
    }
}

/// A group of local tracks captured together
#[derive(Debug, Clone, PartialEq)]
pub struct MediaStream {
    id: String,
    tracks: Vec<MediaTrack>,
}

impl MediaStream {
    pub fn new(tracks: Vec<MediaTrack>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            tracks,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[MediaTrack] {
        &self.tracks
    }

    /// First track of the given kind
    pub fn track_of(&self, kind: TrackKind) -> Option<&MediaTrack> {
        self.tracks.iter().find(|t| t.kind() == kind)
    }

    pub fn video_track(&self) -> Option<&MediaTrack> {
        self.track_of(TrackKind::Video)
    }

    pub fn audio_track(&self) -> Option<&MediaTrack> {
        self.track_of(TrackKind::Audio)
    }

    /// Stop every track in the stream
    pub fn stop_all(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}

/// Access to capture devices
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Request camera and/or microphone
    async fn get_user_media(&self, constraints: MediaConstraints) -> Result<MediaStream>;

    /// Request a screen capture stream
    async fn get_display_media(&self) -> Result<MediaStream>;
}

/// Device set with fixed availability and permission
///
/// Keeps every track it hands out so callers can check nothing was leaked.
pub struct StaticMediaDevices {
    camera: bool,
    microphone: bool,
    screen: bool,
    permission_granted: AtomicBool,
    acquire_delay: Mutex<Option<Duration>>,
    issued: Mutex<Vec<MediaTrack>>,
}

impl Default for StaticMediaDevices {
    fn default() -> Self {
        Self {
            camera: true,
            microphone: true,
            screen: true,
            permission_granted: AtomicBool::new(true),
            acquire_delay: Mutex::new(None),
            issued: Mutex::new(Vec::new()),
        }
    }
}

impl StaticMediaDevices {
    /// All devices present and permission granted
    pub fn new() -> Self {
        Self::default()
    }

    /// Device set with explicit availability
    pub fn with_devices(camera: bool, microphone: bool, screen: bool) -> Self {
        Self {
            camera,
            microphone,
            screen,
            ..Default::default()
        }
    }

    pub fn set_permission_granted(&self, granted: bool) {
        self.permission_granted.store(granted, Ordering::SeqCst);
    }

    /// Delay every acquisition, simulating a pending permission prompt
    pub fn set_acquire_delay(&self, delay: Option<Duration>) {
        *self.acquire_delay.lock() = delay;
    }

    /// Number of handed-out tracks that are still live
    pub fn live_track_count(&self) -> usize {
        self.issued.lock().iter().filter(|t| t.is_live()).count()
    }

    /// Every track handed out so far
    pub fn issued_tracks(&self) -> Vec<MediaTrack> {
        self.issued.lock().clone()
    }

    async fn wait_for_prompt(&self) -> Result<()> {
        let delay = *self.acquire_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if !self.permission_granted.load(Ordering::SeqCst) {
            return Err(Error::MediaAccess("permission denied".to_string()));
        }
        Ok(())
    }

    fn issue(&self, tracks: Vec<MediaTrack>) -> MediaStream {
        self.issued.lock().extend(tracks.iter().cloned());
        MediaStream::new(tracks)
    }
}

#[async_trait]
impl MediaDevices for StaticMediaDevices {
    async fn get_user_media(&self, constraints: MediaConstraints) -> Result<MediaStream> {
        self.wait_for_prompt().await?;

        if constraints.video && !self.camera {
            return Err(Error::MediaAccess("no camera available".to_string()));
        }
        if constraints.audio && !self.microphone {
            return Err(Error::MediaAccess("no microphone available".to_string()));
        }

        let mut tracks = Vec::new();
        if constraints.audio {
            tracks.push(MediaTrack::new(TrackSource::Microphone, "Default microphone"));
        }
        if constraints.video {
            tracks.push(MediaTrack::new(TrackSource::Camera, "Default camera"));
        }
        Ok(self.issue(tracks))
    }

    async fn get_display_media(&self) -> Result<MediaStream> {
        self.wait_for_prompt().await?;

        if !self.screen {
            return Err(Error::MediaAccess("screen capture unavailable".to_string()));
        }
        Ok(self.issue(vec![MediaTrack::new(TrackSource::Screen, "Entire screen")]))
    }
}
