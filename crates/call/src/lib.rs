//! Huddle Call - one-to-one call signaling and peer connection lifecycle
//!
//! This crate drives a WebRTC call between two identities whose only shared
//! channel is a document store: the caller writes an offer into a call
//! record, the callee answers on the same record, and both sides trickle ICE
//! candidates into per-role sequences under it.
//!
//! # Architecture
//!
//! - `signaling`: call records and candidate sequences over a [`DocumentStore`]
//!   (with an in-memory implementation for tests and demos)
//! - `peer`: media attachment, idempotent remote descriptions, candidate
//!   queueing and screen-share track replacement over a [`PeerTransport`]
//!   (webrtc-rs or an in-process loopback)
//! - `negotiation`: per-call state machine wiring signaling to the peer
//! - `watcher`: incoming offer subscription
//! - `controller`: one-call-at-a-time orchestration and the observable
//!   [`CallSnapshot`]
//!
//! # Example
//!
//! ```ignore
//! use huddle_call::{CallConfig, CallSessionController, SignalingChannel};
//! use huddle_call::signaling::MemoryDocumentStore;
//! use huddle_call::media::StaticMediaDevices;
//! use huddle_call::peer::RtcTransportFactory;
//! use std::sync::Arc;
//!
//! let channel = SignalingChannel::new(Arc::new(MemoryDocumentStore::new()));
//! let alice = CallSessionController::new(
//!     "alice",
//!     CallConfig::default(),
//!     channel,
//!     Arc::new(StaticMediaDevices::new()),
//!     Arc::new(RtcTransportFactory),
//! )?;
//! let call_id = alice.start_call("bob").await?;
//! ```
//!
//! [`DocumentStore`]: signaling::DocumentStore
//! [`PeerTransport`]: peer::PeerTransport

#![warn(clippy::all)]

pub mod config;
pub mod controller;
pub mod error;
pub mod media;
pub mod negotiation;
pub mod peer;
pub mod signaling;
pub mod watcher;

pub use config::{CallConfig, IceServerConfig, MediaConstraints};
pub use controller::{CallSessionController, CallSnapshot};
pub use error::{CallFailure, Error, Result};
pub use negotiation::{CallNegotiator, NegotiationState};
pub use signaling::{CallId, CallRecord, CallStatus, EndReason, IncomingCall, SignalingChannel};
pub use watcher::IncomingCallWatcher;

/// Crate version
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
