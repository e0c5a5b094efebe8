//! Negotiation phases

use serde::Serialize;

/// Phase of one call's offer/answer exchange
///
/// Caller: `Idle → CreatingOffer → AwaitingAnswer → Connected → Ended`.
/// Callee: `Idle → ReceivedOffer → CreatingAnswer → Connected → Ended`.
/// Any phase may move to `Ended`; nothing leaves it.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum NegotiationState {
    #[default]
    Idle,
    CreatingOffer,
    AwaitingAnswer,
    ReceivedOffer,
    CreatingAnswer,
    Connected,
    Ended,
}

impl NegotiationState {
    pub fn can_transition_to(self, next: NegotiationState) -> bool {
        use NegotiationState::*;
        match (self, next) {
            (Ended, _) => false,
            (_, Ended) => true,
            (Idle, CreatingOffer) | (Idle, ReceivedOffer) => true,
            (CreatingOffer, AwaitingAnswer) => true,
            (ReceivedOffer, CreatingAnswer) => true,
            (AwaitingAnswer, Connected) | (CreatingAnswer, Connected) => true,
            _ => false,
        }
    }

    pub fn is_terminal(self) -> bool {
        self == NegotiationState::Ended
    }

    /// Negotiation still in progress
    pub fn is_negotiating(self) -> bool {
        !matches!(
            self,
            NegotiationState::Idle | NegotiationState::Connected | NegotiationState::Ended
        )
    }
}

impl std::fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            NegotiationState::Idle => "idle",
            NegotiationState::CreatingOffer => "creating-offer",
            NegotiationState::AwaitingAnswer => "awaiting-answer",
            NegotiationState::ReceivedOffer => "received-offer",
            NegotiationState::CreatingAnswer => "creating-answer",
            NegotiationState::Connected => "connected",
            NegotiationState::Ended => "ended",
        };
        f.write_str(name)
    }
}
