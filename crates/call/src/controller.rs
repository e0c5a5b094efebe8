//! Call session controller
//!
//! Top-level entry point for the UI: start, answer, decline and end calls,
//! share the screen, and observe everything through one [`CallSnapshot`]
//! watch channel. At most one call exists per controller; a second incoming
//! offer while busy is rejected on its record.

use crate::config::CallConfig;
use crate::error::CallFailure;
use crate::media::{MediaDevices, MediaStream};
use crate::negotiation::{CallNegotiator, NegotiationState};
use crate::peer::{PeerConnectionManager, RemoteStream, TransportFactory};
use crate::signaling::{
    CallId, CallRecordPatch, CallRole, CallStatus, EndReason, IncomingCall, SignalingChannel,
};
use crate::watcher::IncomingCallWatcher;
use crate::{Error, Result};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

/// Observable call state
#[derive(Debug, Clone, Default)]
pub struct CallSnapshot {
    /// A call is being set up or is in progress
    pub active: bool,
    /// Phase of the current or most recent call
    pub phase: NegotiationState,
    pub call_id: Option<CallId>,
    pub role: Option<CallRole>,
    /// Offer waiting to be answered or declined
    pub incoming: Option<IncomingCall>,
    /// Local preview: camera, or the screen while sharing
    pub local_stream: Option<MediaStream>,
    pub remote_stream: Option<RemoteStream>,
    pub screen_sharing: bool,
    /// A signaling write fell back without confirmation
    pub unsynchronized: bool,
    /// Why the most recent call attempt failed
    pub last_failure: Option<CallFailure>,
    /// Why the most recent call ended
    pub ended_reason: Option<EndReason>,
}

struct ActiveSession {
    negotiator: Arc<CallNegotiator>,
    mirror: Option<JoinHandle<()>>,
}

#[derive(Default)]
enum SessionSlot {
    #[default]
    Vacant,
    /// Reserved while the transport is created. `answering` holds the
    /// incoming call being answered, if any.
    Opening {
        reservation: u64,
        answering: Option<IncomingCall>,
    },
    Active(ActiveSession),
}

/// A call given up before its negotiator existed
#[derive(Debug, Clone)]
struct AbortedAttempt {
    call_id: Option<CallId>,
    role: CallRole,
    reason: EndReason,
}

impl AbortedAttempt {
    fn new(answering: Option<&IncomingCall>, reason: EndReason) -> Self {
        Self {
            call_id: answering.map(|call| call.call_id.clone()),
            role: if answering.is_some() {
                CallRole::Callee
            } else {
                CallRole::Caller
            },
            reason,
        }
    }
}

#[derive(Default)]
struct ControllerInner {
    slot: SessionSlot,
    /// Negotiator of the current or most recent call
    last: Option<Arc<CallNegotiator>>,
    /// Set instead of `last` when setup never got that far
    aborted: Option<AbortedAttempt>,
    incoming: Option<IncomingCall>,
    pending_watch: Option<JoinHandle<()>>,
    reservations: u64,
    /// A write issued by the controller itself fell back
    unsynchronized: bool,
    last_failure: Option<CallFailure>,
}

impl ControllerInner {
    /// An ended call still in the slot does not count; its mirror releases
    /// it shortly
    fn is_busy(&self) -> bool {
        match &self.slot {
            SessionSlot::Vacant => false,
            SessionSlot::Opening { .. } => true,
            SessionSlot::Active(session) => !session.negotiator.state().is_terminal(),
        }
    }

    fn current(&self) -> Option<Arc<CallNegotiator>> {
        match &self.slot {
            SessionSlot::Active(session) => Some(session.negotiator.clone()),
            _ => None,
        }
    }

    fn reserve(&mut self, answering: Option<IncomingCall>) -> u64 {
        self.reservations += 1;
        self.slot = SessionSlot::Opening {
            reservation: self.reservations,
            answering,
        };
        self.last = None;
        self.aborted = None;
        self.unsynchronized = false;
        self.last_failure = None;
        self.reservations
    }
}

/// Call orchestration for one local identity
pub struct CallSessionController {
    local_id: String,
    config: CallConfig,
    channel: SignalingChannel,
    devices: Arc<dyn MediaDevices>,
    transports: Arc<dyn TransportFactory>,
    inner: Mutex<ControllerInner>,
    snapshot: watch::Sender<CallSnapshot>,
    watcher: Mutex<Option<(IncomingCallWatcher, JoinHandle<()>)>>,
}

impl CallSessionController {
    /// Build a controller; the configuration is validated here
    pub fn new(
        local_id: impl Into<String>,
        config: CallConfig,
        channel: SignalingChannel,
        devices: Arc<dyn MediaDevices>,
        transports: Arc<dyn TransportFactory>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let (snapshot, _) = watch::channel(CallSnapshot::default());
        Ok(Arc::new(Self {
            local_id: local_id.into(),
            config,
            channel,
            devices,
            transports,
            inner: Mutex::new(ControllerInner::default()),
            snapshot,
            watcher: Mutex::new(None),
        }))
    }

    // ========================================================================
    // Incoming calls
    // ========================================================================

    /// Start surfacing offers addressed to the local identity. Idempotent.
    pub async fn start_watching(self: &Arc<Self>) -> Result<()> {
        if self.watcher.lock().is_some() {
            return Ok(());
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        let watcher = IncomingCallWatcher::start(&self.channel, &self.local_id, tx).await?;

        let controller = Arc::downgrade(self);
        let relay = tokio::spawn(async move {
            while let Some(incoming) = rx.recv().await {
                let Some(this) = controller.upgrade() else {
                    break;
                };
                this.on_incoming(incoming).await;
            }
        });

        let mut slot = self.watcher.lock();
        if slot.is_some() {
            relay.abort();
        } else {
            *slot = Some((watcher, relay));
        }
        Ok(())
    }

    /// Stop surfacing offers
    pub fn stop_watching(&self) {
        if let Some((watcher, relay)) = self.watcher.lock().take() {
            watcher.stop();
            relay.abort();
        }
    }

    async fn on_incoming(self: &Arc<Self>, incoming: IncomingCall) {
        let accepted = {
            let mut inner = self.inner.lock();
            if inner.is_busy() || inner.incoming.is_some() {
                false
            } else {
                inner.incoming = Some(incoming.clone());
                inner.pending_watch = Some(self.watch_pending(incoming.call_id.clone()));
                true
            }
        };

        if accepted {
            info!("Call {} from {} is ringing", incoming.call_id, incoming.caller_id);
            self.publish();
        } else {
            info!("Busy, rejecting call {} from {}", incoming.call_id, incoming.caller_id);
            self.mark_ended(&incoming.call_id, EndReason::Busy).await;
        }
    }

    /// Drop the pending call once its record ends
    fn watch_pending(self: &Arc<Self>, call_id: CallId) -> JoinHandle<()> {
        let controller = Arc::downgrade(self);
        let channel = self.channel.clone();
        tokio::spawn(async move {
            let mut records = match channel.subscribe_to_record(&call_id).await {
                Ok(records) => records,
                Err(e) => {
                    warn!("Cannot watch pending call {}: {}", call_id, e);
                    return;
                }
            };
            while let Some(record) = records.next().await {
                if record.status == CallStatus::Ended {
                    if let Some(this) = controller.upgrade() {
                        this.withdraw(&call_id);
                    }
                    break;
                }
            }
        })
    }

    fn withdraw(&self, call_id: &str) {
        let withdrawn = {
            let mut inner = self.inner.lock();
            if inner.incoming.as_ref().is_some_and(|c| c.call_id == call_id) {
                inner.incoming = None;
                inner.pending_watch = None;
                true
            } else {
                false
            }
        };
        if withdrawn {
            info!("Call {} withdrawn by caller", call_id);
            self.publish();
        }
    }

    // ========================================================================
    // Call operations
    // ========================================================================

    /// Call `callee_id`
    ///
    /// # Errors
    ///
    /// `InvalidState` if a call is already active. Setup failures are
    /// returned and recorded as the snapshot's `last_failure`.
    #[instrument(skip(self), fields(local_id = %self.local_id))]
    pub async fn start_call(self: &Arc<Self>, callee_id: &str) -> Result<CallId> {
        if callee_id == self.local_id {
            return Err(Error::InvalidState("cannot call yourself".to_string()));
        }
        let reservation = {
            let mut inner = self.inner.lock();
            if inner.is_busy() {
                return Err(Error::InvalidState("a call is already active".to_string()));
            }
            inner.reserve(None)
        };
        self.publish();

        let negotiator = self.open_session(reservation).await?;
        let result = negotiator.start_call(callee_id).await;
        if let Err(e) = &result {
            self.record_failure(e);
        }
        result
    }

    /// Answer the pending incoming call
    ///
    /// Returns `Ok(None)` when nothing is pending.
    #[instrument(skip(self), fields(local_id = %self.local_id))]
    pub async fn answer_call(self: &Arc<Self>) -> Result<Option<CallId>> {
        let (incoming, reservation) = {
            let mut inner = self.inner.lock();
            if inner.is_busy() {
                return Err(Error::InvalidState("a call is already active".to_string()));
            }
            let Some(incoming) = inner.incoming.take() else {
                return Ok(None);
            };
            if let Some(watch) = inner.pending_watch.take() {
                watch.abort();
            }
            let reservation = inner.reserve(Some(incoming.clone()));
            (incoming, reservation)
        };
        self.publish();

        let negotiator = self.open_session(reservation).await?;
        match negotiator.answer_call(&incoming.call_id).await {
            Ok(()) => Ok(Some(incoming.call_id)),
            Err(e) => {
                self.record_failure(&e);
                Err(e)
            }
        }
    }

    /// Decline the pending incoming call; no-op when nothing is pending
    pub async fn decline_call(&self) -> Result<()> {
        let incoming = {
            let mut inner = self.inner.lock();
            if let Some(watch) = inner.pending_watch.take() {
                watch.abort();
            }
            inner.incoming.take()
        };
        let Some(incoming) = incoming else {
            return Ok(());
        };

        self.publish();
        info!("Declining call {} from {}", incoming.call_id, incoming.caller_id);
        self.mark_ended(&incoming.call_id, EndReason::Declined).await;
        Ok(())
    }

    /// End the current call, or decline the pending one. Safe in any state.
    ///
    /// A call still opening is cancelled; if it was being answered, its
    /// record is marked declined. A ringing call is only declined when no
    /// call of our own is in progress.
    pub async fn end_call(&self) {
        let slot = std::mem::take(&mut self.inner.lock().slot);

        match slot {
            SessionSlot::Active(session) => session.negotiator.hang_up().await,
            SessionSlot::Opening { answering, .. } => {
                debug!("Cancelling call before its transport was ready");
                let reason = if answering.is_some() {
                    EndReason::Declined
                } else {
                    EndReason::HungUp
                };
                self.inner.lock().aborted = Some(AbortedAttempt::new(answering.as_ref(), reason));
                self.publish();
                if let Some(incoming) = answering {
                    self.mark_ended(&incoming.call_id, reason).await;
                }
            }
            SessionSlot::Vacant => {
                if let Err(e) = self.decline_call().await {
                    warn!("Failed to decline pending call: {}", e);
                }
            }
        }
        self.publish();
    }

    /// Send the screen instead of the camera
    ///
    /// No-op without an active call or before video is being sent.
    pub async fn share_screen(&self) -> Result<()> {
        let Some(manager) = self.active_manager() else {
            debug!("share_screen ignored: no active call");
            return Ok(());
        };
        if !manager.has_video_sender() {
            debug!("share_screen ignored: no outbound video yet");
            return Ok(());
        }
        match manager.start_screen_share().await {
            Ok(_) | Err(Error::SessionClosed(_)) => {
                self.publish();
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Go back to the camera; no-op when not sharing
    pub async fn stop_screen_share(&self) -> Result<()> {
        let Some(manager) = self.active_manager() else {
            return Ok(());
        };
        manager.stop_screen_share().await?;
        self.publish();
        Ok(())
    }

    // ========================================================================
    // Session plumbing
    // ========================================================================

    async fn open_session(self: &Arc<Self>, reservation: u64) -> Result<Arc<CallNegotiator>> {
        let transport = match self.transports.create(&self.config).await {
            Ok(transport) => transport,
            Err(e) => {
                warn!("Failed to create peer transport: {}", e);
                let answering = self.abort_reservation(reservation);
                self.record_failure(&e);
                if let Some(incoming) = answering {
                    self.mark_ended(&incoming.call_id, EndReason::Failed).await;
                }
                return Err(e);
            }
        };

        let manager = PeerConnectionManager::new(transport, self.devices.clone());
        let negotiator = CallNegotiator::new(
            self.local_id.clone(),
            self.config.clone(),
            self.channel.clone(),
            manager.clone(),
        );

        let activated = {
            let mut inner = self.inner.lock();
            if matches!(&inner.slot, SessionSlot::Opening { reservation: r, .. } if *r == reservation)
            {
                inner.slot = SessionSlot::Active(ActiveSession {
                    negotiator: negotiator.clone(),
                    mirror: None,
                });
                inner.last = Some(negotiator.clone());
                true
            } else {
                false
            }
        };
        if !activated {
            manager.close().await;
            return Err(Error::SessionClosed(
                "call ended before it started".to_string(),
            ));
        }

        let mirror = tokio::spawn(Self::run_mirror(Arc::downgrade(self), negotiator.clone()));
        let mut inner = self.inner.lock();
        match &mut inner.slot {
            SessionSlot::Active(session) if Arc::ptr_eq(&session.negotiator, &negotiator) => {
                session.mirror = Some(mirror);
            }
            _ => {}
        }
        Ok(negotiator)
    }

    /// Give up a reservation whose transport could not be created; returns
    /// the incoming call it was answering
    fn abort_reservation(&self, reservation: u64) -> Option<IncomingCall> {
        let mut inner = self.inner.lock();
        if !matches!(&inner.slot, SessionSlot::Opening { reservation: r, .. } if *r == reservation)
        {
            return None;
        }
        let SessionSlot::Opening { answering, .. } = std::mem::take(&mut inner.slot) else {
            return None;
        };
        inner.aborted = Some(AbortedAttempt::new(answering.as_ref(), EndReason::Failed));
        answering
    }

    /// Free the slot if it still holds this negotiator
    fn release(&self, negotiator: &Arc<CallNegotiator>) {
        let mut inner = self.inner.lock();
        if matches!(&inner.slot, SessionSlot::Active(s) if Arc::ptr_eq(&s.negotiator, negotiator)) {
            inner.slot = SessionSlot::Vacant;
            debug!("Call slot released");
        }
    }

    /// Republish the snapshot whenever the call's state, streams or sync flag
    /// change, until teardown has finished
    async fn run_mirror(controller: Weak<Self>, negotiator: Arc<CallNegotiator>) {
        let manager = negotiator.manager().clone();
        let mut phase = negotiator.subscribe_state();
        let mut unsynchronized = negotiator.subscribe_unsynchronized();
        let mut torn_down = negotiator.subscribe_torn_down();
        let mut local = manager.subscribe_local_stream();
        let mut remote = manager.subscribe_remote_stream();

        loop {
            {
                let Some(this) = controller.upgrade() else {
                    break;
                };
                if negotiator.state().is_terminal() {
                    this.release(&negotiator);
                }
                this.publish();
                if negotiator.is_torn_down() {
                    break;
                }
            }

            let changed = tokio::select! {
                r = phase.changed() => r,
                r = unsynchronized.changed() => r,
                r = torn_down.changed() => r,
                r = local.changed() => r,
                r = remote.changed() => r,
            };
            if changed.is_err() {
                break;
            }
        }
        debug!("Snapshot mirror for call {:?} finished", negotiator.call_id());
    }

    fn publish(&self) {
        let (current, last, aborted, incoming, unsynchronized, last_failure, opening) = {
            let inner = self.inner.lock();
            (
                inner.current(),
                inner.last.clone(),
                inner.aborted.clone(),
                inner.incoming.clone(),
                inner.unsynchronized,
                inner.last_failure,
                matches!(inner.slot, SessionSlot::Opening { .. }),
            )
        };

        let mut next = CallSnapshot {
            active: opening,
            incoming,
            unsynchronized,
            last_failure,
            ..Default::default()
        };

        if let Some(last) = &last {
            next.phase = last.state();
            next.call_id = last.call_id();
            next.role = last.role();
            next.ended_reason = last.end_reason();
            next.unsynchronized |= last.is_unsynchronized();
            next.last_failure = last.failure().or(last_failure);
        } else if let Some(aborted) = aborted {
            next.phase = NegotiationState::Ended;
            next.call_id = aborted.call_id;
            next.role = Some(aborted.role);
            next.ended_reason = Some(aborted.reason);
        }
        if let Some(current) = &current {
            let manager = current.manager();
            next.active = !current.state().is_terminal();
            next.local_stream = manager.local_stream();
            next.remote_stream = manager.remote_stream();
            next.screen_sharing = manager.is_screen_sharing();
        }

        self.snapshot.send_replace(next);
    }

    fn record_failure(&self, error: &Error) {
        if let Some(reason) = error.failure_reason() {
            self.inner.lock().last_failure = Some(reason);
            self.publish();
        }
    }

    /// Write `ended` to a call that has no negotiator here
    async fn mark_ended(&self, call_id: &str, reason: EndReason) {
        let channel = self.channel.clone();
        let id = call_id.to_string();
        let mut write = tokio::spawn(async move {
            channel
                .update_call_record(&id, CallRecordPatch::ended(reason))
                .await
        });

        let timeout = self.config.persistence_timeout();
        let confirmed = match tokio::time::timeout(timeout, &mut write).await {
            Ok(Ok(Ok(()))) => true,
            Ok(Ok(Err(e))) => {
                warn!("Failed to mark call {} {:?}: {}", call_id, reason, e);
                false
            }
            Ok(Err(e)) => {
                warn!("End write task for call {} failed: {}", call_id, e);
                false
            }
            Err(_) => {
                warn!("Marking call {} {:?} not confirmed after {:?}", call_id, reason, timeout);
                false
            }
        };
        if !confirmed {
            self.inner.lock().unsynchronized = true;
            self.publish();
        }
    }

    fn active_manager(&self) -> Option<Arc<PeerConnectionManager>> {
        let negotiator = self.inner.lock().current()?;
        if negotiator.state().is_terminal() {
            return None;
        }
        Some(negotiator.manager().clone())
    }

    // ========================================================================
    // Observation
    // ========================================================================

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn snapshot(&self) -> CallSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<CallSnapshot> {
        self.snapshot.subscribe()
    }

    pub fn is_active(&self) -> bool {
        self.snapshot.borrow().active
    }

    pub fn incoming_call(&self) -> Option<IncomingCall> {
        self.inner.lock().incoming.clone()
    }

    pub fn local_stream(&self) -> Option<MediaStream> {
        self.snapshot.borrow().local_stream.clone()
    }

    pub fn remote_stream(&self) -> Option<RemoteStream> {
        self.snapshot.borrow().remote_stream.clone()
    }

    /// Negotiator of the current or most recent call
    pub fn negotiator(&self) -> Option<Arc<CallNegotiator>> {
        self.inner.lock().last.clone()
    }
}

impl Drop for CallSessionController {
    fn drop(&mut self) {
        self.stop_watching();
        let inner = self.inner.get_mut();
        if let Some(watch) = inner.pending_watch.take() {
            watch.abort();
        }
        if let SessionSlot::Active(session) = std::mem::take(&mut inner.slot) {
            if let Some(mirror) = session.mirror {
                mirror.abort();
            }
        }
    }
}
