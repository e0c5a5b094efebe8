//! Call flow integration tests
//!
//! Full calls between controllers sharing one in-memory store and one
//! loopback network.
//!
//! ```bash
//! cargo test -p huddle-call --test call_flow_test -- --nocapture
//! ```

mod harness;

use harness::{eventually, CallFixture};
use huddle_call::media::{TrackKind, TrackSource};
use huddle_call::signaling::{CandidateSide, DocumentStore, CALLS_COLLECTION};
use huddle_call::{CallFailure, EndReason, Error, NegotiationState};
use serde_json::json;
use std::time::Duration;

// ============================================================================
// Happy path
// ============================================================================

#[tokio::test]
async fn test_call_connects_and_hangs_up() {
    let fixture = CallFixture::new();
    let alice = fixture.participant("alice").await;
    let bob = fixture.participant("bob").await;

    let call_id = alice.controller.start_call("bob").await.unwrap();
    let snapshot = alice.controller.snapshot();
    assert!(snapshot.active);
    assert_eq!(snapshot.call_id.as_deref(), Some(call_id.as_str()));
    assert!(snapshot.local_stream.is_some());
    assert_eq!(fixture.status(&call_id), "offering");

    let ringing = bob.wait_for_ringing().await;
    assert_eq!(ringing, call_id);
    let incoming = bob.controller.incoming_call().unwrap();
    assert_eq!(incoming.caller_id, "alice");

    assert_eq!(bob.controller.answer_call().await.unwrap(), Some(call_id.clone()));

    let alice_view = alice.wait_for(|s| s.phase == NegotiationState::Connected).await;
    let bob_view = bob.wait_for(|s| s.phase == NegotiationState::Connected).await;
    for view in [&alice_view, &bob_view] {
        let remote = view.remote_stream.as_ref().expect("remote stream");
        assert!(remote.has_kind(TrackKind::Audio));
        assert!(remote.has_kind(TrackKind::Video));
        assert!(view.incoming.is_none());
        assert!(!view.unsynchronized);
    }

    let record = fixture.record(&call_id);
    assert_eq!(record["status"], json!("answered"));
    assert_eq!(record["callerId"], json!("alice"));
    assert_eq!(record["answer"]["type"], json!("answer"));
    for side in [CandidateSide::Offer, CandidateSide::Answer] {
        let sequence = fixture
            .store
            .sequence(CALLS_COLLECTION, &call_id, side.sequence_name());
        assert!(!sequence.is_empty(), "no {} written", side.sequence_name());
    }

    alice.controller.end_call().await;
    assert_eq!(fixture.status(&call_id), "ended");
    assert_eq!(fixture.record(&call_id)["endedReason"], json!("hungUp"));

    let bob_view = bob.wait_for(|s| s.phase == NegotiationState::Ended).await;
    assert_eq!(bob_view.ended_reason, Some(EndReason::HungUp));
    assert!(!bob_view.active);
    assert!(bob_view.remote_stream.is_none());

    eventually(|| bob.devices.live_track_count() == 0 && bob.transport().is_closed()).await;
    assert_eq!(alice.devices.live_track_count(), 0);
    assert!(alice.transport().is_closed());
    assert!(!alice.controller.is_active());
}

#[tokio::test]
async fn test_redelivered_answer_connects_once() {
    let fixture = CallFixture::new();
    let alice = fixture.participant("alice").await;
    let bob = fixture.participant("bob").await;

    let call_id = alice.controller.start_call("bob").await.unwrap();
    bob.wait_for_ringing().await;
    bob.controller.answer_call().await.unwrap();
    alice.wait_for(|s| s.phase == NegotiationState::Connected).await;

    let mut phases = alice.controller.negotiator().unwrap().subscribe_state();
    phases.borrow_and_update();
    let remote_before = alice.transport().remote_description();

    // Touch the record so every watcher sees the same answer again
    let mut fields = serde_json::Map::new();
    fields.insert("status".to_string(), json!("answered"));
    fixture
        .store
        .update(CALLS_COLLECTION, &call_id, fields)
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!phases.has_changed().unwrap());
    assert_eq!(alice.transport().remote_description(), remote_before);
    assert_eq!(alice.controller.snapshot().phase, NegotiationState::Connected);
}

// ============================================================================
// Ending and rejecting
// ============================================================================

#[tokio::test]
async fn test_end_call_while_acquiring_media_releases_everything() {
    let fixture = CallFixture::new();
    let alice = fixture.participant("alice").await;
    alice.devices.set_acquire_delay(Some(Duration::from_millis(200)));

    let controller = alice.controller.clone();
    let attempt = tokio::spawn(async move { controller.start_call("bob").await });

    eventually(|| alice.transports.last().is_some()).await;
    tokio::time::sleep(Duration::from_millis(30)).await;
    alice.controller.end_call().await;

    let result = attempt.await.unwrap();
    assert!(matches!(result, Err(Error::SessionClosed(_))), "{:?}", result);

    eventually(|| alice.devices.live_track_count() == 0).await;
    assert!(alice.transport().is_closed());
    assert!(fixture.call_ids().is_empty());

    let snapshot = alice.controller.snapshot();
    assert!(!snapshot.active);
    assert!(snapshot.local_stream.is_none());
    assert_eq!(snapshot.last_failure, None);
}

#[tokio::test]
async fn test_remote_hang_up_ends_local_call() {
    let fixture = CallFixture::new();
    let alice = fixture.participant("alice").await;
    let bob = fixture.participant("bob").await;

    let call_id = alice.controller.start_call("bob").await.unwrap();
    bob.wait_for_ringing().await;
    bob.controller.answer_call().await.unwrap();
    alice.wait_for(|s| s.phase == NegotiationState::Connected).await;

    bob.controller.end_call().await;

    let alice_view = alice.wait_for(|s| s.phase == NegotiationState::Ended).await;
    assert_eq!(alice_view.ended_reason, Some(EndReason::HungUp));
    assert_eq!(alice_view.call_id.as_deref(), Some(call_id.as_str()));
    eventually(|| alice.devices.live_track_count() == 0).await;

    // The slot is free again
    alice.wait_for(|s| !s.active).await;
    bob.wait_for(|s| !s.active).await;
    let next = alice.controller.start_call("bob").await.unwrap();
    assert_ne!(next, call_id);
}

#[tokio::test]
async fn test_decline_marks_record_and_caller_sees_it() {
    let fixture = CallFixture::new();
    let alice = fixture.participant("alice").await;
    let bob = fixture.participant("bob").await;

    let call_id = alice.controller.start_call("bob").await.unwrap();
    bob.wait_for_ringing().await;
    bob.controller.decline_call().await.unwrap();

    assert_eq!(fixture.status(&call_id), "ended");
    assert_eq!(fixture.record(&call_id)["endedReason"], json!("declined"));
    assert!(bob.controller.snapshot().incoming.is_none());
    assert!(bob.transports.transports().is_empty());

    let alice_view = alice.wait_for(|s| s.phase == NegotiationState::Ended).await;
    assert_eq!(alice_view.ended_reason, Some(EndReason::Declined));
    eventually(|| alice.devices.live_track_count() == 0).await;
}

#[tokio::test]
async fn test_end_call_while_answer_opens_declines_record() {
    let fixture = CallFixture::new();
    let alice = fixture.participant("alice").await;
    let bob = fixture.participant("bob").await;

    let call_id = alice.controller.start_call("bob").await.unwrap();
    bob.wait_for_ringing().await;
    bob.transports.set_create_delay(Some(Duration::from_millis(100)));

    let controller = bob.controller.clone();
    let attempt = tokio::spawn(async move { controller.answer_call().await });
    bob.wait_for(|s| s.active).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    bob.controller.end_call().await;

    assert_eq!(fixture.status(&call_id), "ended");
    assert_eq!(fixture.record(&call_id)["endedReason"], json!("declined"));

    let bob_view = bob.controller.snapshot();
    assert!(!bob_view.active);
    assert_eq!(bob_view.phase, NegotiationState::Ended);
    assert_eq!(bob_view.call_id.as_deref(), Some(call_id.as_str()));
    assert_eq!(bob_view.ended_reason, Some(EndReason::Declined));

    let result = attempt.await.unwrap();
    assert!(matches!(result, Err(Error::SessionClosed(_))), "{:?}", result);
    assert_eq!(fixture.status(&call_id), "ended");

    let alice_view = alice.wait_for(|s| s.phase == NegotiationState::Ended).await;
    assert_eq!(alice_view.ended_reason, Some(EndReason::Declined));
    eventually(|| alice.devices.live_track_count() == 0).await;
}

#[tokio::test]
async fn test_cancelling_own_call_keeps_incoming_call_ringing() {
    let fixture = CallFixture::new();
    let bob = fixture.participant("bob").await;
    let carol = fixture.participant("carol").await;

    let incoming = carol.controller.start_call("bob").await.unwrap();
    assert_eq!(bob.wait_for_ringing().await, incoming);

    bob.transports.set_create_delay(Some(Duration::from_millis(100)));
    let controller = bob.controller.clone();
    let attempt = tokio::spawn(async move { controller.start_call("dave").await });
    bob.wait_for(|s| s.active).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    bob.controller.end_call().await;

    let result = attempt.await.unwrap();
    assert!(matches!(result, Err(Error::SessionClosed(_))), "{:?}", result);
    assert_eq!(fixture.status(&incoming), "offering");
    let bob_view = bob.controller.snapshot();
    assert_eq!(
        bob_view.incoming.map(|c| c.call_id).as_deref(),
        Some(incoming.as_str())
    );

    bob.transports.set_create_delay(None);
    assert_eq!(
        bob.controller.answer_call().await.unwrap().as_deref(),
        Some(incoming.as_str())
    );
    carol.wait_for(|s| s.phase == NegotiationState::Connected).await;
    assert_eq!(fixture.status(&incoming), "answered");
}

#[tokio::test]
async fn test_second_caller_gets_busy() {
    let fixture = CallFixture::new();
    let alice = fixture.participant("alice").await;
    let bob = fixture.participant("bob").await;
    let carol = fixture.participant("carol").await;

    let first = alice.controller.start_call("bob").await.unwrap();
    bob.wait_for_ringing().await;
    bob.controller.answer_call().await.unwrap();
    bob.wait_for(|s| s.phase == NegotiationState::Connected).await;

    // Bob may reject before Carol's start_call returns
    let attempt = carol.controller.start_call("bob").await;
    assert!(
        matches!(attempt, Ok(_) | Err(Error::SessionClosed(_))),
        "{:?}",
        attempt
    );
    let second = carol.controller.negotiator().unwrap().call_id().unwrap();
    fixture.wait_for_status(&second, "ended").await;
    assert_eq!(fixture.record(&second)["endedReason"], json!("busy"));

    let carol_view = carol.wait_for(|s| s.phase == NegotiationState::Ended).await;
    assert_eq!(carol_view.ended_reason, Some(EndReason::Busy));

    let bob_view = bob.controller.snapshot();
    assert_eq!(bob_view.phase, NegotiationState::Connected);
    assert_eq!(bob_view.call_id.as_deref(), Some(first.as_str()));
    assert!(bob_view.incoming.is_none());
    assert_eq!(fixture.status(&first), "answered");
}

#[tokio::test]
async fn test_caller_cancelling_withdraws_ringing_call() {
    let fixture = CallFixture::new();
    let alice = fixture.participant("alice").await;
    let bob = fixture.participant("bob").await;

    let call_id = alice.controller.start_call("bob").await.unwrap();
    bob.wait_for_ringing().await;

    alice.controller.end_call().await;
    assert_eq!(fixture.status(&call_id), "ended");

    bob.wait_for(|s| s.incoming.is_none()).await;
    assert_eq!(bob.controller.answer_call().await.unwrap(), None);
    assert!(bob.transports.transports().is_empty());
}

// ============================================================================
// Failures
// ============================================================================

#[tokio::test]
async fn test_permission_denied_fails_without_record() {
    let fixture = CallFixture::new();
    let alice = fixture.participant("alice").await;
    alice.devices.set_permission_granted(false);

    let result = alice.controller.start_call("bob").await;
    assert!(matches!(result, Err(Error::MediaAccess(_))), "{:?}", result);

    let snapshot = alice
        .wait_for(|s| s.phase == NegotiationState::Ended && !s.active)
        .await;
    assert_eq!(snapshot.last_failure, Some(CallFailure::PermissionDenied));
    assert!(fixture.call_ids().is_empty());
    assert!(alice.transport().is_closed());
}

#[tokio::test]
async fn test_transport_failure_while_answering_fails_record() {
    let fixture = CallFixture::new();
    let alice = fixture.participant("alice").await;
    let bob = fixture.participant("bob").await;

    let call_id = alice.controller.start_call("bob").await.unwrap();
    bob.wait_for_ringing().await;
    bob.transports.set_fail_creates(true);

    let err = bob.controller.answer_call().await.unwrap_err();
    assert!(matches!(err, Error::PeerConnectionError(_)), "{:?}", err);

    assert_eq!(fixture.status(&call_id), "ended");
    assert_eq!(fixture.record(&call_id)["endedReason"], json!("failed"));

    let bob_view = bob.controller.snapshot();
    assert!(!bob_view.active);
    assert_eq!(bob_view.phase, NegotiationState::Ended);
    assert_eq!(bob_view.ended_reason, Some(EndReason::Failed));
    assert_eq!(bob_view.last_failure, Some(CallFailure::ConnectionFailed));

    let alice_view = alice.wait_for(|s| s.phase == NegotiationState::Ended).await;
    assert_eq!(alice_view.ended_reason, Some(EndReason::Failed));
}

#[tokio::test]
async fn test_record_write_failure_is_signaling_failure() {
    let fixture = CallFixture::new();
    let alice = fixture.participant("alice").await;
    fixture.store.set_fail_writes(true);

    let result = alice.controller.start_call("bob").await;
    assert!(matches!(result, Err(Error::Persistence(_))), "{:?}", result);

    let snapshot = alice.wait_for(|s| !s.active).await;
    assert_eq!(snapshot.last_failure, Some(CallFailure::SignalingFailed));
    eventually(|| alice.devices.live_track_count() == 0).await;
    assert!(fixture.call_ids().is_empty());

    // A later attempt starts from a clean snapshot
    fixture.store.set_fail_writes(false);
    alice.controller.start_call("bob").await.unwrap();
    assert_eq!(alice.controller.snapshot().last_failure, None);
}

#[tokio::test]
async fn test_slow_answer_write_continues_unsynchronized() {
    let fixture = CallFixture::new();
    let alice = fixture.participant("alice").await;
    let bob = fixture.participant("bob").await;

    let call_id = alice.controller.start_call("bob").await.unwrap();
    bob.wait_for_ringing().await;
    fixture.store.set_write_delay(Some(Duration::from_millis(400)));

    bob.controller.answer_call().await.unwrap();
    let negotiator = bob.controller.negotiator().unwrap();
    assert!(negotiator.is_unsynchronized());
    assert_ne!(negotiator.state(), NegotiationState::Ended);
    bob.wait_for(|s| s.unsynchronized).await;

    // The write lands late; both sides still connect
    fixture.wait_for_status(&call_id, "answered").await;
    alice.wait_for(|s| s.phase == NegotiationState::Connected).await;
    let bob_view = bob
        .wait_for(|s| s.phase == NegotiationState::Connected && !s.unsynchronized)
        .await;
    assert!(bob_view.active);
}

// ============================================================================
// Screen sharing
// ============================================================================

#[tokio::test]
async fn test_screen_share_reverts_when_capture_ends() {
    let fixture = CallFixture::new();
    let alice = fixture.participant("alice").await;
    let bob = fixture.participant("bob").await;

    alice.controller.start_call("bob").await.unwrap();
    bob.wait_for_ringing().await;
    bob.controller.answer_call().await.unwrap();
    alice.wait_for(|s| s.phase == NegotiationState::Connected).await;

    let manager = alice.controller.negotiator().unwrap().manager().clone();
    let video_sender = manager.video_sender().unwrap();
    let outbound_source = || {
        alice
            .transport()
            .sender_track(video_sender)
            .map(|t| t.source())
    };

    alice.controller.share_screen().await.unwrap();
    let sharing = alice.wait_for(|s| s.screen_sharing).await;
    let screen = sharing.local_stream.unwrap();
    assert_eq!(screen.video_track().unwrap().source(), TrackSource::Screen);
    assert_eq!(outbound_source(), Some(TrackSource::Screen));
    assert_eq!(alice.transport().negotiation_count(), 1);

    // The user stops the capture from the browser
    screen.video_track().unwrap().stop();
    let reverted = alice.wait_for(|s| !s.screen_sharing).await;
    assert_eq!(
        reverted.local_stream.unwrap().video_track().unwrap().source(),
        TrackSource::Camera
    );
    eventually(|| outbound_source() == Some(TrackSource::Camera)).await;

    // Explicit stop does the same
    alice.controller.share_screen().await.unwrap();
    alice.wait_for(|s| s.screen_sharing).await;
    alice.controller.stop_screen_share().await.unwrap();
    alice.wait_for(|s| !s.screen_sharing).await;
    assert_eq!(outbound_source(), Some(TrackSource::Camera));
    assert_eq!(alice.controller.snapshot().phase, NegotiationState::Connected);
}
