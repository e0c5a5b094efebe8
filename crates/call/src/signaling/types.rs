//! Typed signaling payloads
//!
//! Documents read from the store are validated into these types at the
//! adapter boundary; nothing past the adapter handles raw JSON.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// Call identifier, assigned by the store when the record is created
pub type CallId = String;

/// Call status as persisted on the call record
///
/// Transitions are monotonic: `offering → answered → ended`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    Offering,
    Answered,
    Ended,
}

impl CallStatus {
    fn rank(self) -> u8 {
        match self {
            CallStatus::Offering => 0,
            CallStatus::Answered => 1,
            CallStatus::Ended => 2,
        }
    }

    /// Whether moving to `next` keeps the status monotonic
    pub fn can_advance_to(self, next: CallStatus) -> bool {
        next.rank() >= self.rank()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Offering => "offering",
            CallStatus::Answered => "answered",
            CallStatus::Ended => "ended",
        }
    }
}

/// Why a call record was ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EndReason {
    HungUp,
    Declined,
    Busy,
    Failed,
}

/// Session description type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Offer or answer payload, passed through to the peer connection unmodified
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }

    /// Check the description is non-empty and of the expected kind
    pub fn validate(&self, expected: SdpKind) -> Result<()> {
        if self.kind != expected {
            return Err(Error::InvalidData(format!(
                "expected {:?} description, got {:?}",
                expected, self.kind
            )));
        }
        if self.sdp.trim().is_empty() {
            return Err(Error::InvalidData(format!(
                "{:?} description has empty SDP",
                self.kind
            )));
        }
        Ok(())
    }
}

/// One ICE candidate, in the browser `RTCIceCandidateInit` JSON shape
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>, sdp_mid: Option<String>, sdp_mline_index: Option<u16>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid,
            sdp_mline_index,
            username_fragment: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.candidate.trim().is_empty() {
            return Err(Error::InvalidData("ICE candidate string is empty".to_string()));
        }
        if self.sdp_mid.is_none() && self.sdp_mline_index.is_none() {
            return Err(Error::InvalidData(
                "ICE candidate needs sdpMid or sdpMLineIndex".to_string(),
            ));
        }
        Ok(())
    }
}

/// Which party contributed a candidate sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CandidateSide {
    Offer,
    Answer,
}

impl CandidateSide {
    /// Name of the ordered sub-sequence on the call record
    pub fn sequence_name(&self) -> &'static str {
        match self {
            CandidateSide::Offer => "offerCandidates",
            CandidateSide::Answer => "answerCandidates",
        }
    }
}

/// Role of the local peer in a call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallRole {
    Caller,
    Callee,
}

impl CallRole {
    /// Candidate sequence this role writes to
    pub fn local_side(&self) -> CandidateSide {
        match self {
            CallRole::Caller => CandidateSide::Offer,
            CallRole::Callee => CandidateSide::Answer,
        }
    }

    /// Candidate sequence this role reads from
    pub fn remote_side(&self) -> CandidateSide {
        match self {
            CallRole::Caller => CandidateSide::Answer,
            CallRole::Callee => CandidateSide::Offer,
        }
    }
}

/// Signaling document describing one call attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRecord {
    /// Document id; not part of the stored body
    #[serde(skip)]
    pub call_id: CallId,
    pub caller_id: String,
    pub callee_id: String,
    pub status: CallStatus,
    pub offer: SessionDescription,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<SessionDescription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_reason: Option<EndReason>,
}

impl CallRecord {
    /// Decode and validate a stored document
    pub fn from_document(call_id: &str, document: serde_json::Value) -> Result<Self> {
        let mut record: CallRecord = serde_json::from_value(document).map_err(|e| {
            Error::InvalidData(format!("call record {} does not match schema: {}", call_id, e))
        })?;
        record.call_id = call_id.to_string();
        record.validate()?;
        Ok(record)
    }

    /// Enforce the record invariants
    ///
    /// An `answered` record always carries its answer, and an answer is never
    /// present while the record is still `offering`.
    pub fn validate(&self) -> Result<()> {
        if self.caller_id.is_empty() || self.callee_id.is_empty() {
            return Err(Error::InvalidData(format!(
                "call record {} is missing a participant id",
                self.call_id
            )));
        }
        self.offer.validate(SdpKind::Offer)?;
        if let Some(answer) = &self.answer {
            answer.validate(SdpKind::Answer)?;
        }
        match (self.status, &self.answer) {
            (CallStatus::Answered, None) => Err(Error::InvalidData(format!(
                "call record {} is answered without an answer",
                self.call_id
            ))),
            (CallStatus::Offering, Some(_)) => Err(Error::InvalidData(format!(
                "call record {} carries an answer while still offering",
                self.call_id
            ))),
            _ => Ok(()),
        }
    }
}

/// Partial update of a call record
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallRecordPatch {
    pub status: Option<CallStatus>,
    pub answer: Option<SessionDescription>,
    pub ended_reason: Option<EndReason>,
}

impl CallRecordPatch {
    /// Attach the answer and advance to `answered`
    pub fn answered(answer: SessionDescription) -> Self {
        Self {
            status: Some(CallStatus::Answered),
            answer: Some(answer),
            ended_reason: None,
        }
    }

    /// Advance to `ended`
    pub fn ended(reason: EndReason) -> Self {
        Self {
            status: Some(CallStatus::Ended),
            answer: None,
            ended_reason: Some(reason),
        }
    }

    pub(crate) fn to_fields(&self) -> Result<serde_json::Map<String, serde_json::Value>> {
        let mut fields = serde_json::Map::new();
        if let Some(status) = self.status {
            fields.insert("status".to_string(), serde_json::to_value(status)?);
        }
        if let Some(answer) = &self.answer {
            fields.insert("answer".to_string(), serde_json::to_value(answer)?);
        }
        if let Some(reason) = self.ended_reason {
            fields.insert("endedReason".to_string(), serde_json::to_value(reason)?);
        }
        Ok(fields)
    }
}

/// An offer addressed to the local identity, waiting to be answered
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingCall {
    pub call_id: CallId,
    pub caller_id: String,
    pub offer: SessionDescription,
}

impl From<&CallRecord> for IncomingCall {
    fn from(record: &CallRecord) -> Self {
        Self {
            call_id: record.call_id.clone(),
            caller_id: record.caller_id.clone(),
            offer: record.offer.clone(),
        }
    }
}
