use std::collections::HashMap;
use tokio::sync::{Mutex, mpsc};
use tracing::warn;

/// Completion delivered to a running instance loop. `ack_token` is the
/// peek-lock token of the orchestrator queue item it came from; the loop
/// acks it once the resulting history is persisted.
#[derive(Debug)]
pub enum OrchestratorMsg {
    ActivityCompleted {
        instance: String,
        execution_id: u64,
        id: u64,
        result: String,
        ack_token: Option<String>,
    },
    ActivityFailed {
        instance: String,
        execution_id: u64,
        id: u64,
        error: String,
        ack_token: Option<String>,
    },
    TimerFired {
        instance: String,
        execution_id: u64,
        id: u64,
        fire_at_ms: u64,
        ack_token: Option<String>,
    },
    ExternalByName {
        instance: String,
        execution_id: u64,
        name: String,
        data: String,
        ack_token: Option<String>,
    },
}

impl OrchestratorMsg {
    pub fn instance(&self) -> &str {
        match self {
            OrchestratorMsg::ActivityCompleted { instance, .. }
            | OrchestratorMsg::ActivityFailed { instance, .. }
            | OrchestratorMsg::TimerFired { instance, .. }
            | OrchestratorMsg::ExternalByName { instance, .. } => instance,
        }
    }

    pub fn ack_token(&self) -> Option<&str> {
        match self {
            OrchestratorMsg::ActivityCompleted { ack_token, .. }
            | OrchestratorMsg::ActivityFailed { ack_token, .. }
            | OrchestratorMsg::TimerFired { ack_token, .. }
            | OrchestratorMsg::ExternalByName { ack_token, .. } => ack_token.as_deref(),
        }
    }
}

/// Per-instance inboxes for the instance loops hosted by this runtime.
pub struct InstanceRouter {
    pub(crate) inboxes: Mutex<HashMap<String, mpsc::UnboundedSender<OrchestratorMsg>>>,
}

impl InstanceRouter {
    pub fn new() -> Self {
        Self {
            inboxes: Mutex::new(HashMap::new()),
        }
    }

    pub async fn register(&self, instance: &str) -> mpsc::UnboundedReceiver<OrchestratorMsg> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inboxes.lock().await.insert(instance.to_string(), tx);
        rx
    }

    pub async fn unregister(&self, instance: &str) {
        self.inboxes.lock().await.remove(instance);
    }

    /// Hand `msg` to the instance loop. Gives the message back when no loop
    /// is listening, so the caller can rehydrate and retry.
    pub async fn try_send(&self, msg: OrchestratorMsg) -> Result<(), OrchestratorMsg> {
        let inboxes = self.inboxes.lock().await;
        match inboxes.get(msg.instance()) {
            Some(tx) => tx.send(msg).map_err(|e| {
                warn!(instance = %e.0.instance(), "instance inbox closed");
                e.0
            }),
            None => Err(msg),
        }
    }
}

impl Default for InstanceRouter {
    fn default() -> Self {
        Self::new()
    }
}
