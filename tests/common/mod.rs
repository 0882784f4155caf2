#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use vcluster_orchestrator::Event;
use vcluster_orchestrator::providers::HistoryStore;
use vcluster_orchestrator::provisioning::{ActionKind, ActionTrigger, InvocationError, ProvisioningRequest};
use vcluster_orchestrator::runtime::{ActivityOptions, RetryPolicy};

/// Poll the latest execution's history until `pred` holds or `timeout_ms` passes.
pub async fn wait_for_history<F>(store: Arc<dyn HistoryStore>, instance: &str, pred: F, timeout_ms: u64) -> bool
where
    F: Fn(&[Event]) -> bool,
{
    let deadline = std::time::Instant::now() + Duration::from_millis(timeout_ms);
    loop {
        let hist = store.read(instance).await;
        if pred(&hist) {
            return true;
        }
        if std::time::Instant::now() > deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Wait until the latest execution has an open subscription for `name`.
pub async fn wait_for_subscription(store: Arc<dyn HistoryStore>, instance: &str, name: &str, timeout_ms: u64) -> bool {
    wait_for_history(
        store,
        instance,
        |hist| {
            hist.iter()
                .any(|e| matches!(e, Event::ExternalSubscribed { name: n, .. } if n == name))
        },
        timeout_ms,
    )
    .await
}

/// Wait until the instance has at least `count` executions.
pub async fn wait_for_executions(store: Arc<dyn HistoryStore>, instance: &str, count: usize, timeout_ms: u64) -> bool {
    let deadline = std::time::Instant::now() + Duration::from_millis(timeout_ms);
    loop {
        if store.list_executions(instance).await.len() >= count {
            return true;
        }
        if std::time::Instant::now() > deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Step options with short backoff so retry tests stay fast.
pub fn fast_step_options(max_attempts: u32) -> ActivityOptions {
    ActivityOptions {
        start_to_close: Some(Duration::from_secs(5)),
        retry: RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(10),
            backoff_coefficient: 2.0,
            max_backoff: Duration::from_millis(50),
        },
    }
}

/// `ActionTrigger` that records every invocation. Failures can be scripted
/// per action: each queued error is returned once, in order, before calls
/// start succeeding.
#[derive(Default)]
pub struct RecordingTrigger {
    calls: Mutex<Vec<(ActionKind, ProvisioningRequest)>>,
    scripted: Mutex<HashMap<ActionKind, Vec<InvocationError>>>,
    always_fail: Mutex<HashMap<ActionKind, InvocationError>>,
    gates: Mutex<HashMap<ActionKind, Arc<Notify>>>,
}

impl RecordingTrigger {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fail the next calls for `kind` with `errors`, then succeed.
    pub fn fail_next(&self, kind: ActionKind, errors: Vec<InvocationError>) {
        let mut scripted = self.scripted.lock().unwrap();
        let mut queued = errors;
        queued.reverse();
        scripted.insert(kind, queued);
    }

    /// Fail every call for `kind`.
    pub fn fail_always(&self, kind: ActionKind, error: InvocationError) {
        self.always_fail.lock().unwrap().insert(kind, error);
    }

    /// Park the next call for `kind` until the returned gate is notified.
    pub fn hold(&self, kind: ActionKind) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.gates.lock().unwrap().insert(kind, gate.clone());
        gate
    }

    pub fn calls(&self) -> Vec<(ActionKind, ProvisioningRequest)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, kind: ActionKind) -> usize {
        self.calls.lock().unwrap().iter().filter(|(k, _)| *k == kind).count()
    }
}

#[async_trait]
impl ActionTrigger for RecordingTrigger {
    async fn invoke(&self, kind: ActionKind, request: &ProvisioningRequest) -> Result<(), InvocationError> {
        self.calls.lock().unwrap().push((kind, request.clone()));
        let gate = self.gates.lock().unwrap().remove(&kind);
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if let Some(err) = self.always_fail.lock().unwrap().get(&kind) {
            return Err(err.clone());
        }
        if let Some(err) = self.scripted.lock().unwrap().get_mut(&kind).and_then(Vec::pop) {
            return Err(err);
        }
        Ok(())
    }
}
