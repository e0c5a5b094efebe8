//! Offer/answer/candidate exchange for one call
//!
//! A [`CallNegotiator`] drives a single call through its phases using the
//! signaling channel and a [`PeerConnectionManager`]. Subscriptions run as
//! background tasks holding only a weak reference to the negotiator; all of
//! them are aborted before the peer connection closes, and anything they
//! observe after the call ended is dropped silently.

use super::state::NegotiationState;
use crate::config::CallConfig;
use crate::error::CallFailure;
use crate::peer::{ConnectionState, PeerConnectionManager, PeerEvent, RemoteDescriptionOutcome};
use crate::signaling::{
    CallId, CallRecordPatch, CallRole, CallStatus, CandidateSide, CandidateWatch, EndReason,
    RecordWatch, SessionDescription, SignalingChannel,
};
use crate::{Error, Result};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, trace, warn};

#[derive(Default)]
struct NegotiatorInner {
    role: Option<CallRole>,
    call_id: Option<CallId>,
    tasks: Vec<JoinHandle<()>>,
    remote_stream_seen: bool,
    transport_connected: bool,
    /// Set once the terminal status is written, or known not to be needed
    end_recorded: bool,
    end_reason: Option<EndReason>,
    failure: Option<CallFailure>,
}

/// Negotiation state machine for one call
pub struct CallNegotiator {
    local_id: String,
    config: CallConfig,
    channel: SignalingChannel,
    manager: Arc<PeerConnectionManager>,
    state: watch::Sender<NegotiationState>,
    unsynchronized: watch::Sender<bool>,
    /// Raised once teardown, including the terminal write, has finished
    torn_down: watch::Sender<bool>,
    inner: Mutex<NegotiatorInner>,
}

impl CallNegotiator {
    pub fn new(
        local_id: impl Into<String>,
        config: CallConfig,
        channel: SignalingChannel,
        manager: Arc<PeerConnectionManager>,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(NegotiationState::Idle);
        let (unsynchronized, _) = watch::channel(false);
        let (torn_down, _) = watch::channel(false);
        Arc::new(Self {
            local_id: local_id.into(),
            config,
            channel,
            manager,
            state,
            unsynchronized,
            torn_down,
            inner: Mutex::new(NegotiatorInner::default()),
        })
    }

    // ========================================================================
    // Caller
    // ========================================================================

    /// Offer a call to `callee_id` and return the new call id
    #[instrument(skip(self), fields(local_id = %self.local_id))]
    pub async fn start_call(self: &Arc<Self>, callee_id: &str) -> Result<CallId> {
        self.enter(NegotiationState::CreatingOffer, CallRole::Caller)?;
        match self.run_caller(callee_id).await {
            Ok(call_id) => Ok(call_id),
            Err(e) => Err(self.fail(e).await),
        }
    }

    async fn run_caller(self: &Arc<Self>, callee_id: &str) -> Result<CallId> {
        let stream = self.manager.acquire_local_media(self.config.media).await?;
        self.manager.attach_local_tracks(&stream).await?;
        let events = self.manager.start_event_loop()?;
        let offer = self.manager.create_offer().await?;

        let call_id = self.create_record(callee_id, offer).await?;
        if self.record_call_id(&call_id) {
            return Err(Error::SessionClosed(format!(
                "call {} ended while the offer was being written",
                call_id
            )));
        }

        let records = self.channel.subscribe_to_record(&call_id).await?;
        let candidates = self
            .channel
            .subscribe_to_candidates(&call_id, CandidateSide::Answer)
            .await?;
        self.spawn_event_pump(events, call_id.clone(), CandidateSide::Offer);
        self.spawn_record_watch(records);
        self.spawn_candidate_watch(candidates);

        if !self.transition(NegotiationState::AwaitingAnswer) {
            return Err(Error::SessionClosed(format!("call {} ended", call_id)));
        }
        info!("Offered call {} to {}", call_id, callee_id);
        self.try_connect();
        Ok(call_id)
    }

    /// Create the call record within the persistence timeout
    ///
    /// Unlike the answer, the offer is never written optimistically: a record
    /// that lands after we gave up is marked ended so the callee never sees it
    /// as ringing.
    async fn create_record(&self, callee_id: &str, offer: SessionDescription) -> Result<CallId> {
        let channel = self.channel.clone();
        let local_id = self.local_id.clone();
        let callee = callee_id.to_string();
        let mut write = tokio::spawn(async move {
            channel.create_call_record(&local_id, &callee, &offer).await
        });

        match tokio::time::timeout(self.config.persistence_timeout(), &mut write).await {
            Ok(joined) => joined.map_err(|e| Error::Other(e.into()))?,
            Err(_) => {
                let channel = self.channel.clone();
                tokio::spawn(async move {
                    if let Ok(Ok(call_id)) = write.await {
                        warn!("Call record {} landed after timeout, ending it", call_id);
                        let patch = CallRecordPatch::ended(EndReason::Failed);
                        if let Err(e) = channel.update_call_record(&call_id, patch).await {
                            warn!("Failed to end orphaned call {}: {}", call_id, e);
                        }
                    }
                });
                Err(Error::Persistence(format!(
                    "call record not written within {:?}",
                    self.config.persistence_timeout()
                )))
            }
        }
    }

    // ========================================================================
    // Callee
    // ========================================================================

    /// Answer the offer stored under `call_id`
    #[instrument(skip(self), fields(local_id = %self.local_id))]
    pub async fn answer_call(self: &Arc<Self>, call_id: &str) -> Result<()> {
        self.enter(NegotiationState::ReceivedOffer, CallRole::Callee)?;

        let record = match self.channel.fetch_call_record(call_id).await {
            Ok(record) => record,
            Err(e) => return Err(self.abandon(e).await),
        };
        if record.callee_id != self.local_id {
            let e = Error::InvalidState(format!("call {} is not addressed to us", call_id));
            return Err(self.abandon(e).await);
        }
        if record.status != CallStatus::Offering {
            let e = Error::InvalidState(format!(
                "call {} is {}, not offering",
                call_id,
                record.status.as_str()
            ));
            return Err(self.abandon(e).await);
        }

        if self.record_call_id(call_id) {
            return Err(Error::SessionClosed(format!("call {} ended", call_id)));
        }
        match self.run_callee(call_id, &record.offer).await {
            Ok(()) => Ok(()),
            Err(e) => Err(self.fail(e).await),
        }
    }

    async fn run_callee(self: &Arc<Self>, call_id: &str, offer: &SessionDescription) -> Result<()> {
        let stream = self.manager.acquire_local_media(self.config.media).await?;
        self.manager.attach_local_tracks(&stream).await?;
        let events = self.manager.start_event_loop()?;
        self.spawn_event_pump(events, call_id.to_string(), CandidateSide::Answer);

        let records = self.channel.subscribe_to_record(call_id).await?;
        self.spawn_record_watch(records);

        self.manager.set_remote_description(offer).await?;
        if !self.transition(NegotiationState::CreatingAnswer) {
            return Err(Error::SessionClosed(format!("call {} ended", call_id)));
        }

        let answer = self.manager.create_answer().await?;
        self.persist_answer(call_id, answer).await?;

        let candidates = self
            .channel
            .subscribe_to_candidates(call_id, CandidateSide::Offer)
            .await?;
        self.spawn_candidate_watch(candidates);

        info!("Answered call {}", call_id);
        self.try_connect();
        Ok(())
    }

    /// Write the answer, waiting at most the persistence timeout
    ///
    /// A write still pending after the timeout keeps running in the
    /// background and the call proceeds flagged as unsynchronized. A write
    /// that fails outright aborts the call.
    async fn persist_answer(self: &Arc<Self>, call_id: &str, answer: SessionDescription) -> Result<()> {
        let channel = self.channel.clone();
        let id = call_id.to_string();
        let mut write = tokio::spawn(async move {
            channel
                .update_call_record(&id, CallRecordPatch::answered(answer))
                .await
        });

        let timeout = self.config.persistence_timeout();
        match tokio::time::timeout(timeout, &mut write).await {
            Ok(joined) => joined.map_err(|e| Error::Other(e.into()))?,
            Err(_) => {
                warn!("Answer for call {} not confirmed after {:?}, continuing", call_id, timeout);
                self.unsynchronized.send_replace(true);

                let negotiator = Arc::downgrade(self);
                let call_id = call_id.to_string();
                self.track_task(tokio::spawn(async move {
                    let result = write.await;
                    let Some(negotiator) = negotiator.upgrade() else {
                        return;
                    };
                    match result {
                        Ok(Ok(())) => {
                            info!("Answer for call {} persisted late", call_id);
                            negotiator.unsynchronized.send_replace(false);
                        }
                        Ok(Err(e)) => warn!("Answer for call {} never persisted: {}", call_id, e),
                        Err(e) => warn!("Answer write task failed: {}", e),
                    }
                }));
                Ok(())
            }
        }
    }

    // ========================================================================
    // Background tasks
    // ========================================================================

    fn spawn_event_pump(
        self: &Arc<Self>,
        events: mpsc::UnboundedReceiver<PeerEvent>,
        call_id: CallId,
        side: CandidateSide,
    ) {
        let task = tokio::spawn(Self::run_event_pump(Arc::downgrade(self), events, call_id, side));
        self.track_task(task);
    }

    async fn run_event_pump(
        negotiator: Weak<Self>,
        mut events: mpsc::UnboundedReceiver<PeerEvent>,
        call_id: CallId,
        side: CandidateSide,
    ) {
        while let Some(event) = events.recv().await {
            let Some(this) = negotiator.upgrade() else {
                break;
            };
            match event {
                PeerEvent::LocalCandidate(candidate) => {
                    if let Err(e) = this.channel.append_candidate(&call_id, side, &candidate).await {
                        warn!("Failed to publish local candidate for call {}: {}", call_id, e);
                        this.unsynchronized.send_replace(true);
                    }
                }
                PeerEvent::RemoteStream(stream) => {
                    debug!("Remote stream {} has {} track(s)", stream.id, stream.tracks.len());
                    this.inner.lock().remote_stream_seen = true;
                    this.try_connect();
                }
                PeerEvent::ConnectionState(state) => this.on_connection_state(state),
            }
        }
    }

    fn on_connection_state(self: &Arc<Self>, state: ConnectionState) {
        match state {
            ConnectionState::Connected => {
                self.inner.lock().transport_connected = true;
                self.try_connect();
            }
            ConnectionState::Failed | ConnectionState::Disconnected => {
                let phase = self.state();
                if phase == NegotiationState::Connected {
                    warn!("Connection degraded ({:?}); keeping call until it is ended", state);
                } else if state == ConnectionState::Failed && !phase.is_terminal() {
                    let this = self.clone();
                    tokio::spawn(async move {
                        this.fail(Error::PeerConnectionError(
                            "connection failed during negotiation".to_string(),
                        ))
                        .await;
                    });
                }
            }
            other => trace!("Connection state {:?}", other),
        }
    }

    fn spawn_record_watch(self: &Arc<Self>, records: RecordWatch) {
        let task = tokio::spawn(Self::run_record_watch(Arc::downgrade(self), records));
        self.track_task(task);
    }

    async fn run_record_watch(negotiator: Weak<Self>, mut records: RecordWatch) {
        while let Some(record) = records.next().await {
            let Some(this) = negotiator.upgrade() else {
                break;
            };
            if this.state().is_terminal() {
                break;
            }

            match record.status {
                CallStatus::Ended => {
                    info!("Call {} ended by peer ({:?})", record.call_id, record.ended_reason);
                    this.inner.lock().end_reason = record.ended_reason;
                    tokio::spawn(async move { this.shutdown(None).await });
                    break;
                }
                CallStatus::Answered if this.role() == Some(CallRole::Caller) => {
                    let Some(answer) = record.answer.as_ref() else {
                        continue;
                    };
                    match this.manager.set_remote_description(answer).await {
                        Ok(RemoteDescriptionOutcome::Applied) => {
                            debug!("Applied answer for call {}", record.call_id);
                            this.try_connect();
                        }
                        Ok(RemoteDescriptionOutcome::AlreadyApplied) => {
                            trace!("Answer for call {} redelivered", record.call_id);
                        }
                        Err(Error::StaleNegotiation(msg)) => {
                            warn!("Ignoring stale answer on call {}: {}", record.call_id, msg);
                        }
                        Err(Error::SessionClosed(_)) => break,
                        Err(e) if this.state() == NegotiationState::Connected => {
                            warn!("Answer error on connected call {}: {}", record.call_id, e);
                        }
                        Err(e) => {
                            tokio::spawn(async move { this.fail(e).await });
                            break;
                        }
                    }
                }
                _ => {}
            }
        }
    }

    fn spawn_candidate_watch(self: &Arc<Self>, candidates: CandidateWatch) {
        let task = tokio::spawn(Self::run_candidate_watch(Arc::downgrade(self), candidates));
        self.track_task(task);
    }

    async fn run_candidate_watch(negotiator: Weak<Self>, mut candidates: CandidateWatch) {
        while let Some(candidate) = candidates.next().await {
            let Some(this) = negotiator.upgrade() else {
                break;
            };
            if this.state().is_terminal() {
                break;
            }
            if let Err(e) = this.manager.add_remote_candidate(candidate).await {
                warn!("Failed to apply remote candidate: {}", e);
            }
        }
    }

    fn track_task(&self, task: JoinHandle<()>) {
        let mut inner = self.inner.lock();
        if self.state().is_terminal() {
            task.abort();
        } else {
            inner.tasks.push(task);
        }
    }

    // ========================================================================
    // State
    // ========================================================================

    fn enter(&self, next: NegotiationState, role: CallRole) -> Result<()> {
        if self.state().is_terminal() {
            return Err(Error::SessionClosed("call already ended".to_string()));
        }
        if !self.transition(next) {
            return Err(Error::InvalidState(format!(
                "cannot move from {} to {}",
                self.state(),
                next
            )));
        }
        self.inner.lock().role = Some(role);
        Ok(())
    }

    fn transition(&self, next: NegotiationState) -> bool {
        let mut from = NegotiationState::Idle;
        let moved = self.state.send_if_modified(|state| {
            from = *state;
            if state.can_transition_to(next) {
                *state = next;
                true
            } else {
                false
            }
        });
        if moved {
            debug!("Negotiation {} -> {}", from, next);
        }
        moved
    }

    /// Store the call id; true if the call already ended and the ended
    /// status was written here
    fn record_call_id(self: &Arc<Self>, call_id: &str) -> bool {
        let pending_end = {
            let mut inner = self.inner.lock();
            inner.call_id = Some(call_id.to_string());
            if self.state().is_terminal() && !inner.end_recorded {
                inner.end_recorded = true;
                // A callee hanging up before joining turns the call down
                let reason = match (inner.role, inner.end_reason) {
                    (Some(CallRole::Callee), None | Some(EndReason::HungUp)) => EndReason::Declined,
                    (_, reason) => reason.unwrap_or(EndReason::HungUp),
                };
                inner.end_reason = Some(reason);
                Some(reason)
            } else {
                None
            }
        };

        match pending_end {
            Some(reason) => {
                let this = self.clone();
                let call_id = call_id.to_string();
                tokio::spawn(async move { this.write_end(&call_id, reason).await });
                true
            }
            None => self.state().is_terminal(),
        }
    }

    fn try_connect(&self) {
        let ready = {
            let inner = self.inner.lock();
            inner.remote_stream_seen && inner.transport_connected
        };
        let phase = self.state();
        if ready
            && matches!(
                phase,
                NegotiationState::AwaitingAnswer | NegotiationState::CreatingAnswer
            )
            && self.transition(NegotiationState::Connected)
        {
            info!("Call {} connected", self.call_id().unwrap_or_default());
        }
    }

    // ========================================================================
    // Teardown
    // ========================================================================

    /// End the call locally and mark the record ended
    pub async fn hang_up(self: &Arc<Self>) {
        self.shutdown(Some(EndReason::HungUp)).await;
    }

    /// Tear down setup after an error; returns the error to surface
    async fn fail(self: &Arc<Self>, error: Error) -> Error {
        if self.state().is_terminal() {
            return match error {
                Error::SessionClosed(_) => error,
                other => Error::SessionClosed(format!("call ended: {}", other)),
            };
        }
        warn!("Call attempt failed: {}", error);
        self.inner.lock().failure = error.failure_reason();
        self.shutdown(Some(EndReason::Failed)).await;
        error
    }

    /// Give up on a call we never took part in; nothing is written
    async fn abandon(self: &Arc<Self>, error: Error) -> Error {
        warn!("Not answering: {}", error);
        self.inner.lock().failure = error.failure_reason();
        self.shutdown(None).await;
        error
    }

    /// Move to Ended exactly once: drop subscriptions, close the peer
    /// connection, then write the terminal status when `reason` is given
    async fn shutdown(self: &Arc<Self>, reason: Option<EndReason>) {
        let ended = self.state.send_if_modified(|state| {
            if state.is_terminal() {
                false
            } else {
                *state = NegotiationState::Ended;
                true
            }
        });
        if !ended {
            return;
        }

        let (tasks, write) = {
            let mut inner = self.inner.lock();
            if let Some(reason) = reason {
                inner.end_reason = Some(reason);
            }
            let write = match (reason, inner.call_id.clone()) {
                (Some(reason), Some(call_id)) if !inner.end_recorded => {
                    inner.end_recorded = true;
                    Some((call_id, reason))
                }
                (None, _) => {
                    inner.end_recorded = true;
                    None
                }
                _ => None,
            };
            (std::mem::take(&mut inner.tasks), write)
        };

        for task in tasks {
            task.abort();
        }
        self.manager.close().await;

        if let Some((call_id, reason)) = write {
            self.write_end(&call_id, reason).await;
        }
        self.torn_down.send_replace(true);
        info!("Call {} ended", self.call_id().unwrap_or_default());
    }

    async fn write_end(&self, call_id: &str, reason: EndReason) {
        let channel = self.channel.clone();
        let id = call_id.to_string();
        let mut write = tokio::spawn(async move {
            channel
                .update_call_record(&id, CallRecordPatch::ended(reason))
                .await
        });

        let timeout = self.config.persistence_timeout();
        match tokio::time::timeout(timeout, &mut write).await {
            Ok(Ok(Ok(()))) => debug!("Marked call {} ended ({:?})", call_id, reason),
            Ok(Ok(Err(e))) => {
                warn!("Failed to mark call {} ended: {}", call_id, e);
                self.unsynchronized.send_replace(true);
            }
            Ok(Err(e)) => {
                warn!("End write task for call {} failed: {}", call_id, e);
                self.unsynchronized.send_replace(true);
            }
            Err(_) => {
                warn!("End of call {} not confirmed after {:?}", call_id, timeout);
                self.unsynchronized.send_replace(true);
            }
        }
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn state(&self) -> NegotiationState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<NegotiationState> {
        self.state.subscribe()
    }

    pub fn is_unsynchronized(&self) -> bool {
        *self.unsynchronized.borrow()
    }

    pub fn subscribe_unsynchronized(&self) -> watch::Receiver<bool> {
        self.unsynchronized.subscribe()
    }

    pub fn is_torn_down(&self) -> bool {
        *self.torn_down.borrow()
    }

    pub fn subscribe_torn_down(&self) -> watch::Receiver<bool> {
        self.torn_down.subscribe()
    }

    pub fn role(&self) -> Option<CallRole> {
        self.inner.lock().role
    }

    pub fn call_id(&self) -> Option<CallId> {
        self.inner.lock().call_id.clone()
    }

    /// Why the call attempt failed, if it did
    pub fn failure(&self) -> Option<CallFailure> {
        self.inner.lock().failure
    }

    /// Why the call ended, locally or as written by the peer
    pub fn end_reason(&self) -> Option<EndReason> {
        self.inner.lock().end_reason
    }

    pub fn manager(&self) -> &Arc<PeerConnectionManager> {
        &self.manager
    }
}
