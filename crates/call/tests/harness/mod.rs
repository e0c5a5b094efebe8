//! Call Test Harness
//!
//! Wires several participants to one in-memory document store and one
//! loopback network, so integration tests can run complete calls in-process.
//!
//! Basic usage pattern:
//!
//! 1. Create a `CallFixture` (optionally with a custom `CallConfig`)
//! 2. Add participants with `fixture.participant("alice")`
//! 3. Drive their controllers and wait on snapshots with `wait_for_snapshot`
//! 4. Inspect records and transports through the fixture and participants

#![allow(dead_code)]

use huddle_call::media::StaticMediaDevices;
use huddle_call::peer::{LoopbackNetwork, LoopbackTransport, LoopbackTransportFactory};
use huddle_call::signaling::{MemoryDocumentStore, CALLS_COLLECTION};
use huddle_call::{CallConfig, CallSessionController, CallSnapshot, SignalingChannel};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// How long any single wait in a test may take
pub const WAIT: Duration = Duration::from_secs(3);

/// Initialize test logging (safe to call from every test)
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info,huddle_call=debug")
        .with_test_writer()
        .try_init();
}

/// Persistence timeout short enough to exercise timeouts quickly
pub fn fast_config() -> CallConfig {
    CallConfig {
        persistence_timeout_ms: 150,
        ..Default::default()
    }
}

/// Shared signaling store and network
pub struct CallFixture {
    pub store: Arc<MemoryDocumentStore>,
    pub network: Arc<LoopbackNetwork>,
    pub config: CallConfig,
}

impl CallFixture {
    pub fn new() -> Self {
        Self::with_config(fast_config())
    }

    pub fn with_config(config: CallConfig) -> Self {
        init_logging();
        Self {
            store: Arc::new(MemoryDocumentStore::new()),
            network: LoopbackNetwork::new(),
            config,
        }
    }

    /// Add a participant that is already watching for incoming calls
    pub async fn participant(&self, id: &str) -> Participant {
        let devices = Arc::new(StaticMediaDevices::new());
        let transports = Arc::new(LoopbackTransportFactory::new(self.network.clone()));
        let controller = CallSessionController::new(
            id,
            self.config.clone(),
            SignalingChannel::new(self.store.clone()),
            devices.clone(),
            transports.clone(),
        )
        .expect("valid config");
        controller.start_watching().await.expect("watch incoming calls");

        Participant {
            id: id.to_string(),
            controller,
            devices,
            transports,
        }
    }

    /// Raw call record document
    pub fn record(&self, call_id: &str) -> Value {
        self.store
            .document(CALLS_COLLECTION, call_id)
            .unwrap_or_else(|| panic!("no record for call {}", call_id))
    }

    pub fn status(&self, call_id: &str) -> String {
        self.record(call_id)["status"]
            .as_str()
            .unwrap_or_default()
            .to_string()
    }

    pub fn call_ids(&self) -> Vec<String> {
        self.store.document_ids(CALLS_COLLECTION)
    }

    /// Wait until the record reaches `status`
    pub async fn wait_for_status(&self, call_id: &str, status: &str) {
        eventually(|| {
            self.store
                .document(CALLS_COLLECTION, call_id)
                .is_some_and(|r| r["status"] == status)
        })
        .await;
    }
}

/// One user with their own devices, transports and controller
pub struct Participant {
    pub id: String,
    pub controller: Arc<CallSessionController>,
    pub devices: Arc<StaticMediaDevices>,
    pub transports: Arc<LoopbackTransportFactory>,
}

impl Participant {
    /// Transport of the most recent call
    pub fn transport(&self) -> Arc<LoopbackTransport> {
        self.transports.last().expect("no transport created yet")
    }

    pub async fn wait_for(&self, check: impl FnMut(&CallSnapshot) -> bool) -> CallSnapshot {
        wait_for_snapshot(&self.controller, check).await
    }

    /// Wait until an incoming call is ringing and return its id
    pub async fn wait_for_ringing(&self) -> String {
        self.wait_for(|s| s.incoming.is_some())
            .await
            .incoming
            .map(|c| c.call_id)
            .unwrap_or_default()
    }
}

/// Wait until the controller publishes a snapshot satisfying `check`
pub async fn wait_for_snapshot(
    controller: &CallSessionController,
    mut check: impl FnMut(&CallSnapshot) -> bool,
) -> CallSnapshot {
    let mut rx = controller.subscribe();
    let snapshot = tokio::time::timeout(WAIT, rx.wait_for(|s| check(s)))
        .await
        .unwrap_or_else(|_| panic!("timed out; last snapshot: {:?}", controller.snapshot()))
        .expect("controller dropped");
    snapshot.clone()
}

/// Poll `check` until it holds
pub async fn eventually(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition never held");
}
