//! Peer connection: transport seam, implementations and the manager

pub mod loopback;
pub mod manager;
pub mod rtc;
pub mod transport;

pub use loopback::{LoopbackNetwork, LoopbackTransport, LoopbackTransportFactory};
pub use manager::{PeerConnectionManager, PeerEvent, RemoteDescriptionOutcome};
pub use rtc::{RtcPeerTransport, RtcTransportFactory};
pub use transport::{
    ConnectionState, PeerTransport, RemoteStream, RemoteTrack, SenderId, TransportEvent,
    TransportFactory,
};
