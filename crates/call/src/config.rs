//! Configuration types for call sessions

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main configuration for a call session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    /// ICE servers handed to every peer connection
    pub ice_servers: Vec<IceServerConfig>,

    /// Number of ICE candidates gathered ahead of negotiation (default: 10)
    pub ice_candidate_pool_size: u8,

    /// Which local media to request when a call starts or is answered
    pub media: MediaConstraints,

    /// Bounded wait for signaling writes before falling back (default: 5000ms)
    pub persistence_timeout_ms: u64,
}

/// ICE (STUN/TURN) server configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IceServerConfig {
    /// Server URLs (stun:, stuns:, turn: or turns:)
    pub urls: Vec<String>,

    /// Username for TURN authentication
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    /// Credential for TURN authentication
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

/// Local media request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaConstraints {
    /// Request a camera track
    pub video: bool,
    /// Request a microphone track
    pub audio: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            video: true,
            audio: true,
        }
    }
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![IceServerConfig {
                urls: vec![
                    "stun:stun1.l.google.com:19302".to_string(),
                    "stun:stun2.l.google.com:19302".to_string(),
                ],
                ..Default::default()
            }],
            ice_candidate_pool_size: 10,
            media: MediaConstraints::default(),
            persistence_timeout_ms: 5000,
        }
    }
}

impl IceServerConfig {
    fn is_turn(&self) -> bool {
        self.urls
            .iter()
            .any(|url| url.starts_with("turn:") || url.starts_with("turns:"))
    }
}

impl CallConfig {
    /// Persistence timeout as a Duration
    pub fn persistence_timeout(&self) -> Duration {
        Duration::from_millis(self.persistence_timeout_ms)
    }

    /// Validate configuration parameters
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `ice_servers` is empty or an entry has no URLs
    /// - an ICE URL has no `stun:`/`stuns:`/`turn:`/`turns:` scheme
    /// - a TURN entry is missing its username or credential
    /// - both audio and video are disabled
    /// - `persistence_timeout_ms` is not in range 100-60000
    pub fn validate(&self) -> crate::Result<()> {
        use crate::Error;

        if self.ice_servers.is_empty() {
            return Err(Error::InvalidConfig(
                "At least one ICE server is required".to_string(),
            ));
        }

        for server in &self.ice_servers {
            if server.urls.is_empty() {
                return Err(Error::InvalidConfig(
                    "ICE server entry has no URLs".to_string(),
                ));
            }

            if let Some(url) = server.urls.iter().find(|url| {
                !["stun:", "stuns:", "turn:", "turns:"]
                    .iter()
                    .any(|scheme| url.starts_with(scheme))
            }) {
                return Err(Error::InvalidConfig(format!(
                    "ICE server URL must start with stun:, stuns:, turn: or turns:, got {}",
                    url
                )));
            }

            if server.is_turn() && (server.username.is_none() || server.credential.is_none()) {
                return Err(Error::InvalidConfig(
                    "TURN servers require username and credential".to_string(),
                ));
            }
        }

        if !self.media.video && !self.media.audio {
            return Err(Error::InvalidConfig(
                "At least one of audio or video must be requested".to_string(),
            ));
        }

        if self.persistence_timeout_ms < 100 || self.persistence_timeout_ms > 60_000 {
            return Err(Error::InvalidConfig(format!(
                "persistence_timeout_ms must be in range 100-60000, got {}",
                self.persistence_timeout_ms
            )));
        }

        Ok(())
    }
}
