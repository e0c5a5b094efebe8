//! Signaling channel adapter
//!
//! Maps call records and candidate sequences onto the document store and
//! validates everything it reads back. Invalid documents are logged and
//! skipped, never handed to the negotiation layer.

use super::store::{DocumentStore, FieldFilter, Subscription};
use super::types::{
    CallId, CallRecord, CallRecordPatch, CallStatus, CandidateSide, IceCandidate, IncomingCall,
    SessionDescription,
};
use crate::{Error, Result};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

/// Collection holding one document per call
pub const CALLS_COLLECTION: &str = "calls";

/// Conditional writes retried this many times against a changing record
const MAX_UPDATE_ATTEMPTS: usize = 5;

/// Call record subscription, yielding validated records
pub struct RecordWatch {
    call_id: CallId,
    inner: Subscription<Value>,
}

impl RecordWatch {
    /// Next valid record state; `None` when the subscription ends
    pub async fn next(&mut self) -> Option<CallRecord> {
        while let Some(document) = self.inner.next().await {
            match CallRecord::from_document(&self.call_id, document) {
                Ok(record) => return Some(record),
                Err(e) => warn!("Ignoring invalid call record {}: {}", self.call_id, e),
            }
        }
        None
    }

    pub fn unsubscribe(self) {
        self.inner.unsubscribe();
    }
}

/// Candidate sequence subscription, yielding validated candidates in order
pub struct CandidateWatch {
    call_id: CallId,
    side: CandidateSide,
    inner: Subscription<Value>,
}

impl CandidateWatch {
    pub async fn next(&mut self) -> Option<IceCandidate> {
        while let Some(item) = self.inner.next().await {
            let parsed = serde_json::from_value::<IceCandidate>(item)
                .map_err(Error::from)
                .and_then(|c| c.validate().map(|_| c));
            match parsed {
                Ok(candidate) => return Some(candidate),
                Err(e) => warn!(
                    "Ignoring invalid {} entry on call {}: {}",
                    self.side.sequence_name(),
                    self.call_id,
                    e
                ),
            }
        }
        None
    }

    pub fn unsubscribe(self) {
        self.inner.unsubscribe();
    }
}

/// Subscription to offers addressed to one identity
pub struct OfferWatch {
    inner: Subscription<(String, Value)>,
}

impl OfferWatch {
    pub async fn next(&mut self) -> Option<IncomingCall> {
        while let Some((call_id, document)) = self.inner.next().await {
            match CallRecord::from_document(&call_id, document) {
                Ok(record) if record.status == CallStatus::Offering => {
                    return Some(IncomingCall::from(&record))
                }
                Ok(_) => debug!("Call {} no longer offering, skipping", call_id),
                Err(e) => warn!("Ignoring invalid offer {}: {}", call_id, e),
            }
        }
        None
    }

    pub fn unsubscribe(self) {
        self.inner.unsubscribe();
    }
}

/// Typed access to call records over a document store
///
/// # Example
///
/// ```
/// # tokio_test::block_on(async {
/// use huddle_call::signaling::{MemoryDocumentStore, SessionDescription, SignalingChannel};
/// use std::sync::Arc;
///
/// let channel = SignalingChannel::new(Arc::new(MemoryDocumentStore::new()));
/// let call_id = channel
///     .create_call_record("alice", "bob", &SessionDescription::offer("v=0"))
///     .await?;
///
/// let record = channel.fetch_call_record(&call_id).await?;
/// assert_eq!(record.caller_id, "alice");
/// assert_eq!(record.call_id, call_id);
/// # Ok::<(), huddle_call::Error>(())
/// # }).unwrap();
/// ```
#[derive(Clone)]
pub struct SignalingChannel {
    store: Arc<dyn DocumentStore>,
}

impl SignalingChannel {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Persist a new call record in `offering` state
    #[instrument(skip(self, offer))]
    pub async fn create_call_record(
        &self,
        caller_id: &str,
        callee_id: &str,
        offer: &SessionDescription,
    ) -> Result<CallId> {
        let record = CallRecord {
            call_id: String::new(),
            caller_id: caller_id.to_string(),
            callee_id: callee_id.to_string(),
            status: CallStatus::Offering,
            offer: offer.clone(),
            answer: None,
            ended_reason: None,
        };
        record.validate()?;

        let call_id = self
            .store
            .create(CALLS_COLLECTION, serde_json::to_value(&record)?)
            .await?;
        debug!("Created call record {}", call_id);
        Ok(call_id)
    }

    /// Read and validate a call record
    pub async fn fetch_call_record(&self, call_id: &str) -> Result<CallRecord> {
        let document = self
            .store
            .get(CALLS_COLLECTION, call_id)
            .await?
            .ok_or_else(|| Error::NotFound(call_id.to_string()))?;
        CallRecord::from_document(call_id, document)
    }

    /// Apply a partial update, keeping status monotonic
    ///
    /// The status check and the write are applied atomically: the write only
    /// lands if the status read is still current, otherwise the record is
    /// read again and the checks rerun. Rewriting the same answer is a no-op;
    /// a different answer on a record that already has one is rejected as
    /// stale.
    #[instrument(skip(self, patch), fields(status = ?patch.status))]
    pub async fn update_call_record(&self, call_id: &str, patch: CallRecordPatch) -> Result<()> {
        let fields = patch.to_fields()?;

        for _ in 0..MAX_UPDATE_ATTEMPTS {
            let current = self.fetch_call_record(call_id).await?;

            if let Some(next) = patch.status {
                if !current.status.can_advance_to(next) {
                    return Err(Error::InvalidState(format!(
                        "call {} cannot go from {} to {}",
                        call_id,
                        current.status.as_str(),
                        next.as_str()
                    )));
                }
                if current.status == CallStatus::Ended {
                    debug!("Call {} already ended, skipping update", call_id);
                    return Ok(());
                }
            }

            if let (Some(existing), Some(answer)) = (&current.answer, &patch.answer) {
                if existing == answer {
                    debug!("Answer for call {} already stored", call_id);
                    return Ok(());
                }
                return Err(Error::StaleNegotiation(format!(
                    "call {} already carries a different answer",
                    call_id
                )));
            }

            let unchanged = [FieldFilter::eq("status", current.status.as_str())];
            if self
                .store
                .update_where(CALLS_COLLECTION, call_id, &unchanged, fields.clone())
                .await?
            {
                return Ok(());
            }
            debug!("Call {} changed during update, retrying", call_id);
        }

        Err(Error::Persistence(format!(
            "call {} kept changing, update abandoned after {} attempts",
            call_id, MAX_UPDATE_ATTEMPTS
        )))
    }

    /// Append a local candidate to this side's sequence
    pub async fn append_candidate(
        &self,
        call_id: &str,
        side: CandidateSide,
        candidate: &IceCandidate,
    ) -> Result<()> {
        self.store
            .append(
                CALLS_COLLECTION,
                call_id,
                side.sequence_name(),
                serde_json::to_value(candidate)?,
            )
            .await
    }

    /// Current record, then every change
    pub async fn subscribe_to_record(&self, call_id: &str) -> Result<RecordWatch> {
        let inner = self.store.watch_document(CALLS_COLLECTION, call_id).await?;
        Ok(RecordWatch {
            call_id: call_id.to_string(),
            inner,
        })
    }

    /// Candidates from one side, existing ones first
    pub async fn subscribe_to_candidates(
        &self,
        call_id: &str,
        side: CandidateSide,
    ) -> Result<CandidateWatch> {
        let inner = self
            .store
            .watch_sequence(CALLS_COLLECTION, call_id, side.sequence_name())
            .await?;
        Ok(CandidateWatch {
            call_id: call_id.to_string(),
            side,
            inner,
        })
    }

    /// Records in `offering` state addressed to `callee_id`
    pub async fn subscribe_to_incoming_offers(&self, callee_id: &str) -> Result<OfferWatch> {
        let inner = self
            .store
            .watch_query(
                CALLS_COLLECTION,
                vec![
                    FieldFilter::eq("calleeId", callee_id),
                    FieldFilter::eq("status", CallStatus::Offering.as_str()),
                ],
            )
            .await?;
        Ok(OfferWatch { inner })
    }
}
