use crate::Event;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

pub mod fs;
pub mod in_memory;

/// Queues backing the three runtime dispatchers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    Orchestrator,
    Worker,
    Timer,
}

/// Units of work exchanged between the runtime dispatchers through a store.
/// Every item names the execution it belongs to, so work produced for an
/// execution that has since rolled over can be recognised and dropped.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum WorkItem {
    ActivityExecute {
        instance: String,
        execution_id: u64,
        id: u64,
        name: String,
        input: String,
    },
    ActivityCompleted {
        instance: String,
        execution_id: u64,
        id: u64,
        result: String,
    },
    ActivityFailed {
        instance: String,
        execution_id: u64,
        id: u64,
        error: String,
    },
    TimerSchedule {
        instance: String,
        execution_id: u64,
        id: u64,
        fire_at_ms: u64,
    },
    TimerFired {
        instance: String,
        execution_id: u64,
        id: u64,
        fire_at_ms: u64,
    },
    ExternalRaised {
        instance: String,
        execution_id: u64,
        name: String,
        data: String,
    },
}

impl WorkItem {
    pub fn instance(&self) -> &str {
        match self {
            WorkItem::ActivityExecute { instance, .. }
            | WorkItem::ActivityCompleted { instance, .. }
            | WorkItem::ActivityFailed { instance, .. }
            | WorkItem::TimerSchedule { instance, .. }
            | WorkItem::TimerFired { instance, .. }
            | WorkItem::ExternalRaised { instance, .. } => instance,
        }
    }
}

/// Storage abstraction for orchestration histories and work queues.
///
/// Histories are kept per execution; `read` and `append` address the latest
/// execution of an instance. Queues use peek-lock semantics: a dequeued item
/// stays invisible until it is acked (removed) or abandoned (made visible
/// again at the front of the queue).
#[async_trait::async_trait]
pub trait HistoryStore: Send + Sync {
    /// Full history of the latest execution, empty if the instance is unknown.
    async fn read(&self, instance: &str) -> Vec<Event>;
    /// Append to the latest execution. Completion and terminal events whose
    /// correlation slot is already filled are skipped.
    async fn append(&self, instance: &str, new_events: Vec<Event>) -> Result<(), String>;
    async fn list_instances(&self) -> Vec<String>;

    /// Enqueue an item; enqueueing an item equal to one already queued is a no-op.
    async fn enqueue_work(&self, kind: QueueKind, item: WorkItem) -> Result<(), String>;
    async fn dequeue_peek_lock(&self, kind: QueueKind) -> Option<(WorkItem, String)>;
    async fn ack(&self, kind: QueueKind, token: &str) -> Result<(), String>;
    async fn abandon(&self, kind: QueueKind, token: &str) -> Result<(), String>;

    async fn latest_execution_id(&self, instance: &str) -> Option<u64>;
    async fn list_executions(&self, instance: &str) -> Vec<u64>;
    async fn read_with_execution(&self, instance: &str, execution_id: u64) -> Vec<Event>;
    async fn append_with_execution(
        &self,
        instance: &str,
        execution_id: u64,
        new_events: Vec<Event>,
    ) -> Result<(), String>;
    /// Start a new execution whose history begins with `OrchestrationStarted`.
    /// Creates the instance when it does not exist yet. Returns the new id.
    async fn create_new_execution(&self, instance: &str, orchestration: &str, input: &str) -> Result<u64, String>;
}

/// Slot a completion-like event occupies; two events with the same slot
/// cannot both live in one execution.
pub(crate) fn completion_slot(ev: &Event) -> Option<(u64, &'static str)> {
    match ev {
        Event::ActivityCompleted { id, .. } | Event::ActivityFailed { id, .. } => Some((*id, "ac")),
        Event::TimerFired { id, .. } => Some((*id, "tf")),
        Event::ExternalEvent { id, .. } => Some((*id, "xe")),
        // Synthetic id 0 for the single terminal slot
        Event::OrchestrationCompleted { .. }
        | Event::OrchestrationFailed { .. }
        | Event::OrchestrationContinuedAsNew { .. } => Some((0, "term")),
        _ => None,
    }
}

/// Filter `new_events` down to the ones that do not collide with `existing`
/// (or with each other).
pub(crate) fn dedupe_completions(existing: &[Event], new_events: Vec<Event>) -> Vec<Event> {
    let mut seen: HashSet<(u64, &'static str)> = existing.iter().filter_map(completion_slot).collect();
    new_events
        .into_iter()
        .filter(|ev| match completion_slot(ev) {
            Some(slot) => seen.insert(slot),
            None => true,
        })
        .collect()
}
