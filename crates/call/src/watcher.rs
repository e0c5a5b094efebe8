//! Incoming call watcher
//!
//! Relays offers addressed to the local identity. Each call id is surfaced at
//! most once, however often the store redelivers it.

use crate::signaling::{CallId, IncomingCall, SignalingChannel};
use crate::Result;
use std::collections::HashSet;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Background subscription to incoming offers
pub struct IncomingCallWatcher {
    local_id: String,
    task: JoinHandle<()>,
}

impl IncomingCallWatcher {
    /// Subscribe for `local_id` and forward each new offer to `sink`
    pub async fn start(
        channel: &SignalingChannel,
        local_id: &str,
        sink: mpsc::UnboundedSender<IncomingCall>,
    ) -> Result<Self> {
        let mut offers = channel.subscribe_to_incoming_offers(local_id).await?;
        let owner = local_id.to_string();

        let task = tokio::spawn(async move {
            let mut seen: HashSet<CallId> = HashSet::new();
            while let Some(incoming) = offers.next().await {
                if !seen.insert(incoming.call_id.clone()) {
                    debug!("Offer {} for {} already surfaced", incoming.call_id, owner);
                    continue;
                }
                info!("Incoming call {} from {}", incoming.call_id, incoming.caller_id);
                if sink.send(incoming).is_err() {
                    break;
                }
            }
            debug!("Incoming call watcher for {} stopped", owner);
        });

        Ok(Self {
            local_id: local_id.to_string(),
            task,
        })
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Stop watching; dropping the watcher does the same
    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for IncomingCallWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}
