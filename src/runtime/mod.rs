use crate::_typed_codec::{Codec, Json};
use crate::providers::in_memory::InMemoryHistoryStore;
use crate::providers::{HistoryStore, QueueKind, WorkItem};
use crate::{Action, Event, OrchestrationContext};
use async_trait::async_trait;
use serde::{Serialize, de::DeserializeOwned};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, MutexGuard};
use std::time::Duration;
use tokio::sync::{Mutex, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

pub mod completions;
pub mod registry;
pub mod replay;
pub mod router;
pub mod status;
mod timers;

pub use registry::{
    ActivityError, ActivityOptions, ActivityRegistry, OrchestrationRegistry, OrchestrationRegistryBuilder, RetryPolicy,
};
pub use router::{InstanceRouter, OrchestratorMsg};

/// High-level orchestration status derived from history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrchestrationStatus {
    NotFound,
    Running,
    Completed { output: String },
    Failed { error: String },
}

/// Error type returned by orchestration wait helpers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WaitError {
    #[error("timed out waiting for orchestration")]
    Timeout,
    #[error("{0}")]
    Other(String),
}

/// Errors surfaced by the runtime's client API.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RuntimeError {
    #[error("instance {0} already has an active execution")]
    AlreadyActive(String),
    #[error("instance {0} has no active execution")]
    NotFound(String),
    #[error("orchestration {0} is not registered")]
    UnknownOrchestration(String),
    #[error("history store: {0}")]
    Store(String),
    #[error("codec: {0}")]
    Codec(String),
}

/// Trait implemented by orchestration handlers that can be invoked by the runtime.
#[async_trait]
pub trait OrchestrationHandler: Send + Sync {
    async fn invoke(&self, ctx: OrchestrationContext, input: String) -> Result<String, String>;
}

/// Function wrapper that implements `OrchestrationHandler`.
pub struct FnOrchestration<F>(pub F);

#[async_trait]
impl<F, Fut> OrchestrationHandler for FnOrchestration<F>
where
    F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
{
    async fn invoke(&self, ctx: OrchestrationContext, input: String) -> Result<String, String> {
        (self.0)(ctx, input).await
    }
}

type ResultWaiter = oneshot::Sender<(Vec<Event>, Result<String, String>)>;

/// How an execution's turn loop ended.
enum ExecutionEnd {
    Finished(Result<String, String>),
    ContinuedAsNew(String),
    // Loop released the instance without a terminal event (idle or store failure)
    Released,
}

/// In-process runtime that executes activities and timers and persists
/// history via a `HistoryStore`.
pub struct Runtime {
    router: Arc<InstanceRouter>,
    joins: Mutex<Vec<JoinHandle<()>>>,
    instance_joins: Mutex<Vec<JoinHandle<()>>>,
    history_store: Arc<dyn HistoryStore>,
    // Plain mutexes: both are touched from Drop
    active_instances: std::sync::Mutex<HashSet<String>>,
    current_execution_ids: std::sync::Mutex<HashMap<String, u64>>,
    result_waiters: Mutex<HashMap<String, Vec<ResultWaiter>>>,
    orchestration_registry: OrchestrationRegistry,
    // Serializes the duplicate check and execution creation of starts
    start_lock: Mutex<()>,
}

fn lock_std<T>(m: &std::sync::Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Releases the instance slot when an instance loop ends, even by panic or abort.
struct ActiveGuard {
    rt: Arc<Runtime>,
    inst: String,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        lock_std(&self.rt.active_instances).remove(&self.inst);
        lock_std(&self.rt.current_execution_ids).remove(&self.inst);
    }
}

impl Runtime {
    // Associated constants for runtime behavior
    const COMPLETION_BATCH_LIMIT: usize = 128;
    const POLLER_GATE_DELAY_MS: u64 = 5;
    const POLLER_IDLE_SLEEP_MS: u64 = 10;
    const ORCH_IDLE_DEHYDRATE_MS: u64 = 1000;

    /// Start a new runtime using the in-memory history store.
    pub async fn start(
        activity_registry: Arc<ActivityRegistry>,
        orchestration_registry: OrchestrationRegistry,
    ) -> Arc<Self> {
        let history_store: Arc<dyn HistoryStore> = Arc::new(InMemoryHistoryStore::default());
        Self::start_with_store(history_store, activity_registry, orchestration_registry).await
    }

    /// Start a new runtime with a custom `HistoryStore` implementation.
    /// Instances the store shows as unfinished are resumed.
    pub async fn start_with_store(
        history_store: Arc<dyn HistoryStore>,
        activity_registry: Arc<ActivityRegistry>,
        orchestration_registry: OrchestrationRegistry,
    ) -> Arc<Self> {
        // Install a default subscriber if none set (ok to call many times)
        crate::logging::init_tracing();

        let runtime = Arc::new(Self {
            router: Arc::new(InstanceRouter::new()),
            joins: Mutex::new(Vec::new()),
            instance_joins: Mutex::new(Vec::new()),
            history_store,
            active_instances: std::sync::Mutex::new(HashSet::new()),
            current_execution_ids: std::sync::Mutex::new(HashMap::new()),
            result_waiters: Mutex::new(HashMap::new()),
            orchestration_registry,
            start_lock: Mutex::new(()),
        });

        let handle = runtime.clone().start_orchestration_dispatcher();
        runtime.joins.lock().await.push(handle);
        let work_handle = runtime.clone().start_work_dispatcher(activity_registry);
        runtime.joins.lock().await.push(work_handle);
        let timer_handle = runtime.clone().start_timer_dispatcher();
        runtime.joins.lock().await.push(timer_handle);

        runtime.resume_unfinished_instances().await;
        runtime
    }

    async fn resume_unfinished_instances(self: &Arc<Self>) {
        for instance in self.history_store.list_instances().await {
            let hist = self.history_store.read(&instance).await;
            let Some(name) = started_name(&hist) else {
                continue;
            };
            // A crash between ending an execution and creating its successor
            if let Some(Event::OrchestrationContinuedAsNew { input }) = hist.last() {
                if let Err(e) = self.history_store.create_new_execution(&instance, &name, input).await {
                    error!(instance = %instance, error = %e, "failed to create successor execution on resume");
                    continue;
                }
            } else if hist.iter().any(Event::is_terminal) {
                continue;
            }
            info!(instance = %instance, orchestration = %name, "resuming unfinished instance");
            self.ensure_instance_active(&instance, &name, true).await;
        }
    }

    /// Start an orchestration and return a handle resolving to its final
    /// history and output (after any continue-as-new rollovers).
    pub async fn start_orchestration(
        self: Arc<Self>,
        instance: &str,
        orchestration_name: &str,
        input: impl Into<String>,
    ) -> Result<JoinHandle<(Vec<Event>, Result<String, String>)>, RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.result_waiters
            .lock()
            .await
            .entry(instance.to_string())
            .or_default()
            .push(tx);
        if let Err(e) = self
            .clone()
            .start_orchestration_detached(instance, orchestration_name, input)
            .await
        {
            drop(rx);
            self.prune_waiters(instance).await;
            return Err(e);
        }
        Ok(tokio::spawn(async move {
            rx.await
                .unwrap_or_else(|_| (Vec::new(), Err("runtime stopped before the orchestration finished".into())))
        }))
    }

    /// Start a typed orchestration; input/output are serialized internally.
    pub async fn start_orchestration_typed<In, Out>(
        self: Arc<Self>,
        instance: &str,
        orchestration_name: &str,
        input: In,
    ) -> Result<JoinHandle<(Vec<Event>, Result<Out, String>)>, RuntimeError>
    where
        In: Serialize,
        Out: DeserializeOwned + Send + 'static,
    {
        let payload = Json::encode(&input).map_err(RuntimeError::Codec)?;
        let handle = self.start_orchestration(instance, orchestration_name, payload).await?;
        Ok(tokio::spawn(async move {
            let (hist, res_s) = handle
                .await
                .unwrap_or_else(|e| (Vec::new(), Err(format!("result task failed: {e}"))));
            let res_t = res_s.and_then(|s| Json::decode::<Out>(&s));
            (hist, res_t)
        }))
    }

    /// Start an orchestration without waiting on its result. Returns the new
    /// execution id. Fails with `AlreadyActive` while an execution of the
    /// instance is still running; a finished instance gets a fresh execution.
    pub async fn start_orchestration_detached(
        self: Arc<Self>,
        instance: &str,
        orchestration_name: &str,
        input: impl Into<String>,
    ) -> Result<u64, RuntimeError> {
        if !self.orchestration_registry.contains(orchestration_name) {
            return Err(RuntimeError::UnknownOrchestration(orchestration_name.to_string()));
        }
        let input = input.into();
        let execution_id = {
            let _start = self.start_lock.lock().await;
            let loop_running = lock_std(&self.active_instances).contains(instance);
            if loop_running || self.is_active(instance).await {
                return Err(RuntimeError::AlreadyActive(instance.to_string()));
            }
            self.history_store
                .create_new_execution(instance, orchestration_name, &input)
                .await
                .map_err(RuntimeError::Store)?
        };
        info!(instance, orchestration = %orchestration_name, execution_id, "orchestration started");
        self.ensure_instance_active(instance, orchestration_name, false).await;
        Ok(execution_id)
    }

    /// Raise an external event into the latest execution of an instance.
    /// The event is matched to the oldest open subscription with the same
    /// name when it is applied. With none open it is buffered in the
    /// execution's history until a wait for that name subscribes.
    pub async fn raise_event(
        &self,
        instance: &str,
        name: impl Into<String>,
        data: impl Into<String>,
    ) -> Result<(), RuntimeError> {
        let name_str = name.into();
        let data_str = data.into();
        let hist = self.history_store.read(instance).await;
        if hist.is_empty() || hist.iter().any(Event::is_terminal) {
            warn!(instance, event_name = %name_str, "raise_event: no active execution");
            return Err(RuntimeError::NotFound(instance.to_string()));
        }
        let execution_id = self
            .history_store
            .latest_execution_id(instance)
            .await
            .ok_or_else(|| RuntimeError::NotFound(instance.to_string()))?;
        self.history_store
            .enqueue_work(
                QueueKind::Orchestrator,
                WorkItem::ExternalRaised {
                    instance: instance.to_string(),
                    execution_id,
                    name: name_str.clone(),
                    data: data_str,
                },
            )
            .await
            .map_err(RuntimeError::Store)?;
        info!(instance, execution_id, event_name = %name_str, "raise_event: enqueued external");
        Ok(())
    }

    /// Wait until the orchestration reaches a terminal state (Completed/Failed) or the timeout elapses.
    pub async fn wait_for_orchestration(
        &self,
        instance: &str,
        timeout: Duration,
    ) -> Result<OrchestrationStatus, WaitError> {
        let deadline = std::time::Instant::now() + timeout;
        let mut delay_ms: u64 = 5;
        loop {
            match self.get_orchestration_status(instance).await {
                s @ (OrchestrationStatus::Completed { .. } | OrchestrationStatus::Failed { .. }) => return Ok(s),
                _ if std::time::Instant::now() >= deadline => return Err(WaitError::Timeout),
                _ => {
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    delay_ms = (delay_ms.saturating_mul(2)).min(100);
                }
            }
        }
    }

    /// Abort background tasks and instance loops. Persisted state stays in the
    /// store; a new runtime over the same store resumes where this one stopped.
    pub async fn shutdown(self: Arc<Self>) {
        for j in self.joins.lock().await.drain(..) {
            j.abort();
        }
        for j in self.instance_joins.lock().await.drain(..) {
            j.abort();
        }
    }

    pub fn history_store(&self) -> Arc<dyn HistoryStore> {
        self.history_store.clone()
    }

    async fn ensure_instance_active(self: &Arc<Self>, instance: &str, orchestration_name: &str, rehydrate: bool) -> bool {
        if !lock_std(&self.active_instances).insert(instance.to_string()) {
            return false;
        }
        let guard = ActiveGuard {
            rt: self.clone(),
            inst: instance.to_string(),
        };
        let rt = self.clone();
        let inst = instance.to_string();
        let orch = orchestration_name.to_string();
        let handle = tokio::spawn(async move {
            let _guard = guard;
            rt.run_instance(&inst, &orch, rehydrate).await;
        });
        let mut joins = self.instance_joins.lock().await;
        joins.retain(|j| !j.is_finished());
        joins.push(handle);
        true
    }

    async fn prune_waiters(&self, instance: &str) -> bool {
        let mut waiters = self.result_waiters.lock().await;
        match waiters.get_mut(instance) {
            Some(list) => {
                list.retain(|w| !w.is_closed());
                if list.is_empty() {
                    waiters.remove(instance);
                    false
                } else {
                    true
                }
            }
            None => false,
        }
    }

    async fn notify_waiters(&self, instance: &str, history: &[Event], out: &Result<String, String>) {
        if let Some(waiters) = self.result_waiters.lock().await.remove(instance) {
            for w in waiters {
                let _ = w.send((history.to_vec(), out.clone()));
            }
        }
    }

    /// Host one instance: run its executions one after another until one
    /// ends terminally, or release it when idle.
    async fn run_instance(self: &Arc<Self>, instance: &str, orchestration_name: &str, mut rehydrate: bool) {
        let mut comp_rx = self.router.register(instance).await;
        loop {
            let execution_id = self.history_store.latest_execution_id(instance).await.unwrap_or(1);
            lock_std(&self.current_execution_ids).insert(instance.to_string(), execution_id);
            let history = self.history_store.read(instance).await;

            if let Some(out) = terminal_result(&history) {
                self.notify_waiters(instance, &history, &out).await;
                break;
            }
            if rehydrate {
                completions::rehydrate_pending(instance, execution_id, &history, &self.history_store).await;
                rehydrate = false;
            }

            match self
                .run_execution(instance, orchestration_name, execution_id, history, &mut comp_rx)
                .await
            {
                ExecutionEnd::Finished(_) | ExecutionEnd::Released => break,
                ExecutionEnd::ContinuedAsNew(input) => {
                    match self
                        .history_store
                        .create_new_execution(instance, orchestration_name, &input)
                        .await
                    {
                        Ok(next) => info!(instance, execution_id = next, "continued as new"),
                        Err(e) => {
                            error!(instance, error = %e, "failed to create successor execution");
                            break;
                        }
                    }
                }
            }
        }
        self.router.unregister(instance).await;
        // Anything that slipped into the inbox goes back to the queue
        while let Ok(msg) = comp_rx.try_recv() {
            if let Some(t) = msg.ack_token() {
                let _ = self.history_store.abandon(QueueKind::Orchestrator, t).await;
            }
        }
    }

    async fn run_execution(
        self: &Arc<Self>,
        instance: &str,
        orchestration_name: &str,
        execution_id: u64,
        mut history: Vec<Event>,
        comp_rx: &mut tokio::sync::mpsc::UnboundedReceiver<OrchestratorMsg>,
    ) -> ExecutionEnd {
        let input = history
            .iter()
            .find_map(|e| match e {
                Event::OrchestrationStarted { input, .. } => Some(input.clone()),
                _ => None,
            })
            .unwrap_or_default();

        let Some(handler) = self.orchestration_registry.get(orchestration_name) else {
            let out = Err(format!("unregistered:{orchestration_name}"));
            return self.finish_execution(instance, execution_id, &mut history, out).await;
        };

        let mut turn_index: u64 = 0;
        loop {
            let baseline_len = history.len();
            let turn = replay::Turn::replay(handler.clone(), history, turn_index, &input);
            let continue_input = turn.continue_as_new();
            let replay::Turn {
                history: replayed,
                decisions,
                output: out_opt,
            } = turn;
            history = replayed;

            if history.len() > baseline_len
                && let Err(e) = self
                    .history_store
                    .append_with_execution(instance, execution_id, history[baseline_len..].to_vec())
                    .await
            {
                error!(instance, execution_id, turn_index, error=%e, "failed to append scheduled events");
                return self.release_on_store_failure(instance, &history, e).await;
            }

            self.apply_decisions(instance, execution_id, &history, decisions).await;

            if let Some(next_input) = continue_input {
                let marker = Event::OrchestrationContinuedAsNew { input: next_input.clone() };
                if let Err(e) = self
                    .history_store
                    .append_with_execution(instance, execution_id, vec![marker])
                    .await
                {
                    return self.release_on_store_failure(instance, &history, e).await;
                }
                return ExecutionEnd::ContinuedAsNew(next_input);
            }
            if let Some(out) = out_opt {
                return self.finish_execution(instance, execution_id, &mut history, out).await;
            }

            // Receive at least one completion, or dehydrate on idle timeout
            let first = loop {
                match tokio::time::timeout(Duration::from_millis(Self::ORCH_IDLE_DEHYDRATE_MS), comp_rx.recv()).await {
                    Ok(Some(msg)) => break msg,
                    Ok(None) => return ExecutionEnd::Released,
                    Err(_idle) => {
                        if !self.prune_waiters(instance).await {
                            debug!(instance, execution_id, "dehydrating idle instance");
                            return ExecutionEnd::Released;
                        }
                    }
                }
            };

            let mut batch = vec![first];
            while batch.len() < Self::COMPLETION_BATCH_LIMIT {
                match comp_rx.try_recv() {
                    Ok(msg) => batch.push(msg),
                    Err(_) => break,
                }
            }

            let persisted_len = history.len();
            let mut ack_after_persist: Vec<String> = Vec::new();
            for msg in batch {
                if message_execution_id(&msg) != execution_id {
                    debug!(instance, execution_id, "dropping completion for another execution");
                    if let Some(t) = msg.ack_token() {
                        let _ = self.history_store.ack(QueueKind::Orchestrator, t).await;
                    }
                    continue;
                }
                if let (Some(t), _changed) = completions::append_completion(&mut history, msg) {
                    ack_after_persist.push(t);
                }
            }

            if history.len() > persisted_len {
                if let Err(e) = self
                    .history_store
                    .append_with_execution(instance, execution_id, history[persisted_len..].to_vec())
                    .await
                {
                    error!(instance, execution_id, turn_index, error=%e, "failed to append completions");
                    for t in &ack_after_persist {
                        let _ = self.history_store.abandon(QueueKind::Orchestrator, t).await;
                    }
                    return self.release_on_store_failure(instance, &history, e).await;
                }
                turn_index = turn_index.saturating_add(1);
            }
            for t in ack_after_persist {
                let _ = self.history_store.ack(QueueKind::Orchestrator, &t).await;
            }
        }
    }

    async fn finish_execution(
        &self,
        instance: &str,
        execution_id: u64,
        history: &mut Vec<Event>,
        out: Result<String, String>,
    ) -> ExecutionEnd {
        let term = match &out {
            Ok(s) => Event::OrchestrationCompleted { output: s.clone() },
            Err(e) => Event::OrchestrationFailed { error: e.clone() },
        };
        if let Err(e) = self
            .history_store
            .append_with_execution(instance, execution_id, vec![term.clone()])
            .await
        {
            error!(instance, execution_id, error=%e, "failed to append terminal event");
            return self.release_on_store_failure(instance, history, e).await;
        }
        history.push(term);
        match &out {
            Ok(_) => info!(instance, execution_id, "orchestration completed"),
            Err(e) => warn!(instance, execution_id, error = %e, "orchestration failed"),
        }
        self.notify_waiters(instance, history, &out).await;
        ExecutionEnd::Finished(out)
    }

    async fn release_on_store_failure(&self, instance: &str, history: &[Event], err: String) -> ExecutionEnd {
        self.notify_waiters(instance, history, &Err(format!("history append failed: {err}")))
            .await;
        ExecutionEnd::Released
    }

    /// Materialize decisions of one turn into work items.
    async fn apply_decisions(
        &self,
        instance: &str,
        execution_id: u64,
        history: &[Event],
        decisions: Vec<Action>,
    ) {
        for d in decisions {
            let (kind, item) = match d {
                Action::CallActivity { id, name, input } => (
                    QueueKind::Worker,
                    WorkItem::ActivityExecute {
                        instance: instance.to_string(),
                        execution_id,
                        id,
                        name,
                        input,
                    },
                ),
                Action::CreateTimer { id, delay_ms } => {
                    let fire_at_ms = history
                        .iter()
                        .find_map(|e| match e {
                            Event::TimerCreated { id: cid, fire_at_ms } if *cid == id => Some(*fire_at_ms),
                            _ => None,
                        })
                        .unwrap_or_else(|| timers::now_ms().saturating_add(delay_ms));
                    (
                        QueueKind::Timer,
                        WorkItem::TimerSchedule {
                            instance: instance.to_string(),
                            execution_id,
                            id,
                            fire_at_ms,
                        },
                    )
                }
                Action::WaitExternal { id, name } => {
                    debug!(instance, execution_id, id, event_name = %name, "subscribed to external event");
                    continue;
                }
                Action::ContinueAsNew { .. } => continue,
            };
            if let Err(e) = self.history_store.enqueue_work(kind, item).await {
                error!(instance, execution_id, ?kind, error = %e, "failed to enqueue work item");
            }
        }
    }

    fn start_orchestration_dispatcher(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let Some((item, token)) = self.history_store.dequeue_peek_lock(QueueKind::Orchestrator).await else {
                    tokio::time::sleep(Duration::from_millis(Self::POLLER_IDLE_SLEEP_MS)).await;
                    continue;
                };
                let msg = match item {
                    WorkItem::ActivityCompleted {
                        instance,
                        execution_id,
                        id,
                        result,
                    } => OrchestratorMsg::ActivityCompleted {
                        instance,
                        execution_id,
                        id,
                        result,
                        ack_token: Some(token.clone()),
                    },
                    WorkItem::ActivityFailed {
                        instance,
                        execution_id,
                        id,
                        error,
                    } => OrchestratorMsg::ActivityFailed {
                        instance,
                        execution_id,
                        id,
                        error,
                        ack_token: Some(token.clone()),
                    },
                    WorkItem::TimerFired {
                        instance,
                        execution_id,
                        id,
                        fire_at_ms,
                    } => OrchestratorMsg::TimerFired {
                        instance,
                        execution_id,
                        id,
                        fire_at_ms,
                        ack_token: Some(token.clone()),
                    },
                    WorkItem::ExternalRaised {
                        instance,
                        execution_id,
                        name,
                        data,
                    } => OrchestratorMsg::ExternalByName {
                        instance,
                        execution_id,
                        name,
                        data,
                        ack_token: Some(token.clone()),
                    },
                    other => {
                        error!(?other, "unexpected WorkItem in Orchestrator dispatcher; dropping");
                        let _ = self.history_store.ack(QueueKind::Orchestrator, &token).await;
                        continue;
                    }
                };
                self.deliver_or_rehydrate(msg, token).await;
            }
        })
    }

    /// Forward a completion to its live instance loop, or wake the instance
    /// and put the item back for redelivery. Items for executions that are
    /// no longer current are acked and dropped.
    async fn deliver_or_rehydrate(self: &Arc<Self>, msg: OrchestratorMsg, token: String) {
        let instance = msg.instance().to_string();
        let execution_id = message_execution_id(&msg);

        let current = lock_std(&self.current_execution_ids).get(&instance).copied();
        if let Some(current_id) = current
            && current_id != execution_id
        {
            warn!(
                instance = %instance,
                completion_execution_id = execution_id,
                current_execution_id = current_id,
                "ignoring completion for a different execution"
            );
            let _ = self.history_store.ack(QueueKind::Orchestrator, &token).await;
            return;
        }

        if self.router.try_send(msg).await.is_ok() {
            return;
        }

        let latest = self.history_store.latest_execution_id(&instance).await;
        let hist = self.history_store.read(&instance).await;
        let name = match started_name(&hist) {
            Some(n) if latest == Some(execution_id) && !hist.iter().any(Event::is_terminal) => n,
            _ => {
                debug!(instance = %instance, execution_id, "dropping completion for a finished or unknown execution");
                let _ = self.history_store.ack(QueueKind::Orchestrator, &token).await;
                return;
            }
        };
        self.ensure_instance_active(&instance, &name, false).await;
        let _ = self.history_store.abandon(QueueKind::Orchestrator, &token).await;
        tokio::time::sleep(Duration::from_millis(Self::POLLER_GATE_DELAY_MS)).await;
    }

    fn start_work_dispatcher(self: Arc<Self>, activities: Arc<ActivityRegistry>) -> JoinHandle<()> {
        tokio::spawn(async move {
            // Dropping the set (dispatcher aborted) aborts in-flight activities
            let mut in_flight: JoinSet<()> = JoinSet::new();
            loop {
                while in_flight.try_join_next().is_some() {}
                let Some((item, token)) = self.history_store.dequeue_peek_lock(QueueKind::Worker).await else {
                    tokio::time::sleep(Duration::from_millis(Self::POLLER_IDLE_SLEEP_MS)).await;
                    continue;
                };
                let (instance, execution_id, id, name, input) = match item {
                    WorkItem::ActivityExecute {
                        instance,
                        execution_id,
                        id,
                        name,
                        input,
                    } => (instance, execution_id, id, name, input),
                    other => {
                        error!(?other, "unexpected WorkItem in Worker dispatcher; dropping");
                        let _ = self.history_store.ack(QueueKind::Worker, &token).await;
                        continue;
                    }
                };
                let store = self.history_store.clone();
                let activities = activities.clone();
                in_flight.spawn(async move {
                    let outcome = match activities.resolve(&name) {
                        Some(registered) => execute_with_policy(&instance, &name, &input, &registered).await,
                        None => Err(format!("unregistered:{name}")),
                    };
                    let completion = match outcome {
                        Ok(result) => WorkItem::ActivityCompleted {
                            instance: instance.clone(),
                            execution_id,
                            id,
                            result,
                        },
                        Err(error) => WorkItem::ActivityFailed {
                            instance: instance.clone(),
                            execution_id,
                            id,
                            error,
                        },
                    };
                    match store.enqueue_work(QueueKind::Orchestrator, completion).await {
                        Ok(()) => {
                            let _ = store.ack(QueueKind::Worker, &token).await;
                        }
                        Err(e) => {
                            error!(instance = %instance, id, error = %e, "failed to enqueue activity result");
                            let _ = store.abandon(QueueKind::Worker, &token).await;
                        }
                    }
                });
            }
        })
    }

    fn start_timer_dispatcher(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let (svc_jh, svc_tx) = timers::TimerService::start(self.history_store.clone(), Self::POLLER_IDLE_SLEEP_MS);
            // Abort the service together with this dispatcher
            struct AbortOnDrop(JoinHandle<()>);
            impl Drop for AbortOnDrop {
                fn drop(&mut self) {
                    self.0.abort();
                }
            }
            let _svc = AbortOnDrop(svc_jh);
            loop {
                let Some((item, token)) = self.history_store.dequeue_peek_lock(QueueKind::Timer).await else {
                    tokio::time::sleep(Duration::from_millis(Self::POLLER_IDLE_SLEEP_MS)).await;
                    continue;
                };
                match item {
                    item @ WorkItem::TimerSchedule { .. } => {
                        if svc_tx.send(item).is_err() {
                            let _ = self.history_store.abandon(QueueKind::Timer, &token).await;
                            return;
                        }
                        let _ = self.history_store.ack(QueueKind::Timer, &token).await;
                    }
                    other => {
                        error!(?other, "unexpected WorkItem in Timer dispatcher; dropping");
                        let _ = self.history_store.ack(QueueKind::Timer, &token).await;
                    }
                }
            }
        })
    }
}

/// Run one activity under its options: a time budget per attempt and
/// exponential backoff between retryable failures.
async fn execute_with_policy(
    instance: &str,
    name: &str,
    input: &str,
    registered: &registry::RegisteredActivity,
) -> Result<String, String> {
    let policy = &registered.options.retry;
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt: u32 = 1;
    loop {
        let handler = registered.handler.clone();
        let owned_input = input.to_string();
        // Run on its own task so a panicking activity becomes a failed attempt
        let task = tokio::spawn(async move { handler.invoke(owned_input).await });
        let abort = task.abort_handle();
        let result = match registered.options.start_to_close {
            Some(budget) => match tokio::time::timeout(budget, task).await {
                Ok(joined) => flatten_join(joined),
                Err(_) => {
                    abort.abort();
                    Err(ActivityError::Retryable(format!(
                        "timed out after {}ms",
                        budget.as_millis()
                    )))
                }
            },
            None => flatten_join(task.await),
        };
        match result {
            Ok(out) => return Ok(out),
            Err(ActivityError::Fatal(e)) => {
                warn!(instance, activity = %name, attempt, error = %e, "activity failed (not retryable)");
                return Err(e);
            }
            Err(ActivityError::Retryable(e)) if attempt >= max_attempts => {
                warn!(instance, activity = %name, attempt, error = %e, "activity failed; retries exhausted");
                return Err(e);
            }
            Err(ActivityError::Retryable(e)) => {
                let backoff = policy.backoff_for(attempt);
                info!(instance, activity = %name, attempt, error = %e, backoff_ms = backoff.as_millis() as u64, "activity attempt failed; retrying");
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
        }
    }
}

fn flatten_join(joined: Result<Result<String, ActivityError>, tokio::task::JoinError>) -> Result<String, ActivityError> {
    match joined {
        Ok(res) => res,
        Err(e) if e.is_panic() => Err(ActivityError::Retryable("activity panicked".to_string())),
        Err(e) => Err(ActivityError::Retryable(format!("activity task ended: {e}"))),
    }
}

fn message_execution_id(msg: &OrchestratorMsg) -> u64 {
    match msg {
        OrchestratorMsg::ActivityCompleted { execution_id, .. }
        | OrchestratorMsg::ActivityFailed { execution_id, .. }
        | OrchestratorMsg::TimerFired { execution_id, .. }
        | OrchestratorMsg::ExternalByName { execution_id, .. } => *execution_id,
    }
}

fn started_name(hist: &[Event]) -> Option<String> {
    hist.iter().find_map(|e| match e {
        Event::OrchestrationStarted { name, .. } => Some(name.clone()),
        _ => None,
    })
}

fn terminal_result(hist: &[Event]) -> Option<Result<String, String>> {
    hist.iter().rev().find_map(|e| match e {
        Event::OrchestrationCompleted { output } => Some(Ok(output.clone())),
        Event::OrchestrationFailed { error } => Some(Err(error.clone())),
        _ => None,
    })
}
