use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::Mutex;

use super::{HistoryStore, QueueKind, WorkItem, dedupe_completions};
use crate::Event;

/// Process-local store; everything is lost when the store is dropped.
#[derive(Default)]
pub struct InMemoryHistoryStore {
    // instance -> executions, index 0 holds execution id 1
    histories: Mutex<HashMap<String, Vec<Vec<Event>>>>,
    queues: Mutex<HashMap<QueueKind, VecDeque<WorkItem>>>,
    locked: Mutex<HashMap<String, (QueueKind, WorkItem)>>,
    next_token: AtomicU64,
    cap: Option<usize>,
}

impl InMemoryHistoryStore {
    /// Store that rejects appends growing one execution past `cap` events.
    pub fn with_cap(cap: usize) -> Self {
        Self {
            cap: Some(cap),
            ..Self::default()
        }
    }

    fn check_cap(&self, have: usize, append: usize) -> Result<(), String> {
        match self.cap {
            Some(cap) if have + append > cap => Err(format!(
                "history cap exceeded (cap={cap}, have={have}, append={append})"
            )),
            _ => Ok(()),
        }
    }
}

#[async_trait::async_trait]
impl HistoryStore for InMemoryHistoryStore {
    async fn read(&self, instance: &str) -> Vec<Event> {
        self.histories
            .lock()
            .await
            .get(instance)
            .and_then(|execs| execs.last().cloned())
            .unwrap_or_default()
    }

    async fn append(&self, instance: &str, new_events: Vec<Event>) -> Result<(), String> {
        let mut histories = self.histories.lock().await;
        let current = histories
            .get_mut(instance)
            .and_then(|execs| execs.last_mut())
            .ok_or_else(|| format!("instance not found: {instance}"))?;
        let fresh = dedupe_completions(current, new_events);
        self.check_cap(current.len(), fresh.len())?;
        current.extend(fresh);
        Ok(())
    }

    async fn list_instances(&self) -> Vec<String> {
        self.histories.lock().await.keys().cloned().collect()
    }

    async fn enqueue_work(&self, kind: QueueKind, item: WorkItem) -> Result<(), String> {
        let mut queues = self.queues.lock().await;
        let q = queues.entry(kind).or_default();
        if !q.contains(&item) {
            q.push_back(item);
        }
        Ok(())
    }

    async fn dequeue_peek_lock(&self, kind: QueueKind) -> Option<(WorkItem, String)> {
        let item = self.queues.lock().await.get_mut(&kind)?.pop_front()?;
        let token = format!("mem-{}", self.next_token.fetch_add(1, Ordering::Relaxed));
        self.locked.lock().await.insert(token.clone(), (kind, item.clone()));
        Some((item, token))
    }

    async fn ack(&self, _kind: QueueKind, token: &str) -> Result<(), String> {
        self.locked.lock().await.remove(token);
        Ok(())
    }

    async fn abandon(&self, kind: QueueKind, token: &str) -> Result<(), String> {
        let Some((locked_kind, item)) = self.locked.lock().await.remove(token) else {
            return Ok(());
        };
        debug_assert_eq!(locked_kind, kind);
        self.queues.lock().await.entry(locked_kind).or_default().push_front(item);
        Ok(())
    }

    async fn latest_execution_id(&self, instance: &str) -> Option<u64> {
        let histories = self.histories.lock().await;
        let n = histories.get(instance)?.len() as u64;
        (n > 0).then_some(n)
    }

    async fn list_executions(&self, instance: &str) -> Vec<u64> {
        match self.latest_execution_id(instance).await {
            Some(lat) => (1..=lat).collect(),
            None => Vec::new(),
        }
    }

    async fn read_with_execution(&self, instance: &str, execution_id: u64) -> Vec<Event> {
        let idx = match execution_id.checked_sub(1) {
            Some(i) => i as usize,
            None => return Vec::new(),
        };
        self.histories
            .lock()
            .await
            .get(instance)
            .and_then(|execs| execs.get(idx).cloned())
            .unwrap_or_default()
    }

    async fn append_with_execution(
        &self,
        instance: &str,
        execution_id: u64,
        new_events: Vec<Event>,
    ) -> Result<(), String> {
        let mut histories = self.histories.lock().await;
        let idx = execution_id.checked_sub(1).unwrap_or(u64::MAX) as usize;
        let exec = histories
            .get_mut(instance)
            .and_then(|execs| execs.get_mut(idx))
            .ok_or_else(|| format!("execution not found: {instance}#{execution_id}"))?;
        let fresh = dedupe_completions(exec, new_events);
        self.check_cap(exec.len(), fresh.len())?;
        exec.extend(fresh);
        Ok(())
    }

    async fn create_new_execution(&self, instance: &str, orchestration: &str, input: &str) -> Result<u64, String> {
        let mut histories = self.histories.lock().await;
        let execs = histories.entry(instance.to_string()).or_default();
        execs.push(vec![Event::OrchestrationStarted {
            name: orchestration.to_string(),
            input: input.to_string(),
        }]);
        Ok(execs.len() as u64)
    }
}
