//! Signaling: call records and ICE candidate exchange over a document store

pub mod channel;
pub mod memory;
pub mod store;
pub mod types;

pub use channel::{CandidateWatch, OfferWatch, RecordWatch, SignalingChannel, CALLS_COLLECTION};
pub use memory::MemoryDocumentStore;
pub use store::{DocumentStore, FieldFilter, Subscription};
pub use types::{
    CallId, CallRecord, CallRecordPatch, CallRole, CallStatus, CandidateSide, EndReason,
    IceCandidate, IncomingCall, SdpKind, SessionDescription,
};
