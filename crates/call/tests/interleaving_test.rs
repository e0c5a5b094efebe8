//! Delivery-order tests for the caller's peer connection
//!
//! The answer and the callee's candidates reach the caller through separate
//! subscriptions, so they can arrive in any order and more than once. Every
//! interleaving must end with each candidate applied exactly once.

mod harness;

use huddle_call::media::StaticMediaDevices;
use huddle_call::peer::{LoopbackNetwork, LoopbackTransport, PeerConnectionManager, PeerEvent};
use huddle_call::signaling::{IceCandidate, SessionDescription};
use huddle_call::{MediaConstraints, Result};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, Clone)]
enum Delivery {
    Answer(SessionDescription),
    Candidate(IceCandidate),
}

struct Pair {
    caller: Arc<PeerConnectionManager>,
    caller_transport: Arc<LoopbackTransport>,
    answer: SessionDescription,
    callee_candidates: Vec<IceCandidate>,
}

async fn local_candidates(events: &mut mpsc::UnboundedReceiver<PeerEvent>) -> Vec<IceCandidate> {
    let mut candidates = Vec::new();
    while candidates.len() < 2 {
        let event = tokio::time::timeout(harness::WAIT, events.recv())
            .await
            .expect("no candidate gathered")
            .expect("event loop closed");
        if let PeerEvent::LocalCandidate(candidate) = event {
            candidates.push(candidate);
        }
    }
    candidates
}

async fn negotiated_pair() -> Result<Pair> {
    let network = LoopbackNetwork::new();
    let devices = Arc::new(StaticMediaDevices::new());

    let caller_transport = network.create_transport();
    let caller = PeerConnectionManager::new(caller_transport.clone(), devices.clone());
    let stream = caller.acquire_local_media(MediaConstraints::default()).await?;
    caller.attach_local_tracks(&stream).await?;
    let _caller_events = caller.start_event_loop()?;
    let offer = caller.create_offer().await?;

    let callee = PeerConnectionManager::new(network.create_transport(), devices);
    let stream = callee.acquire_local_media(MediaConstraints::default()).await?;
    callee.attach_local_tracks(&stream).await?;
    let mut callee_events = callee.start_event_loop()?;
    callee.set_remote_description(&offer).await?;
    let answer = callee.create_answer().await?;

    Ok(Pair {
        caller,
        caller_transport,
        answer,
        callee_candidates: local_candidates(&mut callee_events).await,
    })
}

fn shuffled_deliveries(pair: &Pair, seed: u64) -> Vec<Delivery> {
    let mut deliveries = vec![
        Delivery::Answer(pair.answer.clone()),
        Delivery::Answer(pair.answer.clone()),
    ];
    for candidate in &pair.callee_candidates {
        deliveries.push(Delivery::Candidate(candidate.clone()));
        deliveries.push(Delivery::Candidate(candidate.clone()));
    }
    deliveries.shuffle(&mut StdRng::seed_from_u64(seed));
    deliveries
}

async fn deliver(manager: &PeerConnectionManager, delivery: Delivery) {
    match delivery {
        Delivery::Answer(answer) => {
            manager.set_remote_description(&answer).await.unwrap();
        }
        Delivery::Candidate(candidate) => manager.add_remote_candidate(candidate).await.unwrap(),
    }
}

fn assert_applied_once(pair: &Pair) {
    let applied = pair.caller_transport.applied_candidates();
    let applied_set: HashSet<_> = applied.iter().cloned().collect();
    let expected: HashSet<_> = pair.callee_candidates.iter().cloned().collect();

    assert_eq!(applied.len(), applied_set.len(), "candidate applied twice: {:?}", applied);
    assert_eq!(applied_set, expected);
    assert_eq!(pair.caller.pending_candidate_count(), 0);
    assert_eq!(pair.caller.remote_description().as_ref(), Some(&pair.answer));
    assert_eq!(pair.caller_transport.remote_description().as_ref(), Some(&pair.answer));
}

#[tokio::test]
async fn test_sequential_interleavings_apply_each_candidate_once() {
    harness::init_logging();

    for seed in 0..32 {
        let pair = negotiated_pair().await.unwrap();
        for delivery in shuffled_deliveries(&pair, seed) {
            deliver(&pair.caller, delivery).await;
        }
        assert_applied_once(&pair);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_deliveries_apply_each_candidate_once() {
    harness::init_logging();

    for seed in 0..16 {
        let pair = negotiated_pair().await.unwrap();
        let tasks: Vec<_> = shuffled_deliveries(&pair, seed)
            .into_iter()
            .map(|delivery| {
                let manager = pair.caller.clone();
                tokio::spawn(async move { deliver(&manager, delivery).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }
        assert_applied_once(&pair);
    }
}

#[tokio::test]
async fn test_candidates_after_close_are_dropped() {
    let pair = negotiated_pair().await.unwrap();
    pair.caller.close().await;

    for candidate in pair.callee_candidates.clone() {
        pair.caller.add_remote_candidate(candidate).await.unwrap();
    }
    assert!(pair.caller_transport.applied_candidates().is_empty());
    assert_eq!(pair.caller.pending_candidate_count(), 0);
}
