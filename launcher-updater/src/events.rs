//! Update events streamed to the presentation layer.
//!
//! The engine never calls into the UI. It publishes `UpdateEvent`s on a
//! broadcast channel and any number of subscribers consume them at their
//! own pace.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::integrity::VerificationOutcome;
use crate::orchestrator::UpdatePhase;

/// Maximum number of queued events per subscriber
const EVENT_CAPACITY: usize = 1000;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum UpdateEvent {
    #[serde(rename = "update:plan")]
    PlanResolved {
        current: String,
        latest: String,
        versions: Vec<String>,
    },

    #[serde(rename = "update:phase")]
    PhaseChanged {
        version: Option<String>,
        phase: UpdatePhase,
    },

    #[serde(rename = "transfer:progress")]
    TransferProgress(TransferProgressPayload),

    #[serde(rename = "transfer:completed")]
    TransferCompleted { id: String, bytes: u64 },

    #[serde(rename = "verify:result")]
    Verification {
        artifact: String,
        outcome: VerificationOutcome,
    },

    #[serde(rename = "install:summary")]
    InstallSummary {
        version: String,
        files_checked: usize,
        mismatched: usize,
    },

    #[serde(rename = "rollback:result")]
    Rollback {
        version: String,
        success: bool,
        restored: usize,
        total: usize,
    },

    #[serde(rename = "update:completed")]
    Completed {
        success: bool,
        message: String,
        version: Option<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferProgressPayload {
    pub id: String,
    pub url: String,
    pub percent: f64,
    pub transferred_bytes: u64,
    pub total_bytes: u64,
    pub bytes_per_second: u64,
    pub eta_seconds: u64,
    pub speed: String,
}

/// Broadcast hub for update events
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<UpdateEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    /// Publish an event; having no subscribers is not an error.
    pub fn emit(&self, event: UpdateEvent) {
        match self.tx.send(event) {
            Ok(count) => debug!("Event delivered to {} subscriber(s)", count),
            Err(broadcast::error::SendError(event)) => {
                debug!("No subscribers for event: {:?}", event)
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UpdateEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
