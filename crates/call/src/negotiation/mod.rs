//! Call negotiation state machine

pub mod negotiator;
pub mod state;

pub use negotiator::CallNegotiator;
pub use state::NegotiationState;
