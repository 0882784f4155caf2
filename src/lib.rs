//! Durable vCluster provisioning on a small replay-driven orchestration core.
//!
//! The lower half of this crate records append-only `Event`s and replays
//! orchestration code against them, so a provisioning run survives process
//! restarts without re-triggering side effects it already performed. It
//! provides:
//!
//! - Public data model: `Event`, `Action`
//! - Orchestration driver: `run_turn`, `run_turn_with`, and `Executor`
//! - An `OrchestrationContext` with futures to schedule activities,
//!   timers, and external events using correlation IDs
//! - A unified `DurableFuture` that can be raced with `select`/`select2`
//!
//! The upper half (`provisioning`, `service`, `server`) is the vCluster
//! workflow itself: trigger the `create` pipeline, wait for its completion
//! signal against a timer, then trigger `arc-integration`.
use std::cell::Cell;
use std::future::Future;
use std::pin::{Pin, pin};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll, Waker};

pub mod config;
pub mod futures;
pub mod logging;
pub mod providers;
pub mod provisioning;
pub mod runtime;
pub mod server;
pub mod service;

pub use crate::futures::{DurableFuture, DurableOutput, SelectFuture};
pub use runtime::{OrchestrationHandler, OrchestrationRegistry, OrchestrationRegistryBuilder, OrchestrationStatus};

/// Name of the built-in activity backing `OrchestrationContext::trace`.
pub const SYSTEM_TRACE_ACTIVITY: &str = "__system_trace";

use crate::_typed_codec::Codec;
use crate::futures::{AggregateDurableFuture, Kind, KindTag};
use crate::logging::LogLevel;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

// Internal codec utilities for typed I/O (kept private; public API stays string based)
pub(crate) mod _typed_codec {
    use serde::{Serialize, de::DeserializeOwned};
    use serde_json::Value;
    pub trait Codec {
        fn encode<T: Serialize>(v: &T) -> Result<String, String>;
        fn decode<T: DeserializeOwned>(s: &str) -> Result<T, String>;
    }
    pub struct Json;
    impl Codec for Json {
        fn encode<T: Serialize>(v: &T) -> Result<String, String> {
            // Plain strings are stored raw so payloads stay readable in history
            match serde_json::to_value(v) {
                Ok(Value::String(s)) => Ok(s),
                Ok(val) => serde_json::to_string(&val).map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            }
        }
        fn decode<T: DeserializeOwned>(s: &str) -> Result<T, String> {
            match serde_json::from_str::<T>(s) {
                Ok(v) => Ok(v),
                Err(_) => {
                    let val = Value::String(s.to_string());
                    serde_json::from_value(val).map_err(|e| e.to_string())
                }
            }
        }
    }
}

/// Append-only orchestration history entries persisted by a provider and
/// consumed during replay. Variants use stable correlation IDs to pair
/// scheduling operations with their completions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Event {
    /// Execution was created and started by orchestration name with input.
    OrchestrationStarted { name: String, input: String },
    /// Orchestration completed with a final result.
    OrchestrationCompleted { output: String },
    /// Orchestration failed with a final error.
    OrchestrationFailed { error: String },
    /// Execution ended by rolling over into a fresh execution with new input.
    OrchestrationContinuedAsNew { input: String },

    /// Activity was scheduled with a unique ID and input.
    ActivityScheduled { id: u64, name: String, input: String },
    /// Activity completed successfully with a result.
    ActivityCompleted { id: u64, result: String },
    /// Activity failed terminally (after the worker exhausted its retry policy).
    ActivityFailed { id: u64, error: String },

    /// Timer was created and will fire at wall-clock time `fire_at_ms`.
    TimerCreated { id: u64, fire_at_ms: u64 },
    /// Timer fired.
    TimerFired { id: u64, fire_at_ms: u64 },

    /// Subscription to an external event by name was recorded with a unique ID.
    ExternalSubscribed { id: u64, name: String },
    /// An external event matched subscription `id` and carried `data`.
    ExternalEvent { id: u64, name: String, data: String },
    /// An external event arrived while no subscription to `name` was open.
    /// It is handed to the next subscription for that name, oldest first.
    ExternalBuffered { name: String, data: String },
}

impl Event {
    /// Correlation id for scheduling/completion events; `None` for lifecycle markers.
    pub fn correlation_id(&self) -> Option<u64> {
        match self {
            Event::ActivityScheduled { id, .. }
            | Event::ActivityCompleted { id, .. }
            | Event::ActivityFailed { id, .. }
            | Event::TimerCreated { id, .. }
            | Event::TimerFired { id, .. }
            | Event::ExternalSubscribed { id, .. }
            | Event::ExternalEvent { id, .. } => Some(*id),
            Event::OrchestrationStarted { .. }
            | Event::OrchestrationCompleted { .. }
            | Event::OrchestrationFailed { .. }
            | Event::OrchestrationContinuedAsNew { .. }
            | Event::ExternalBuffered { .. } => None,
        }
    }

    /// True for events that end an execution.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Event::OrchestrationCompleted { .. }
                | Event::OrchestrationFailed { .. }
                | Event::OrchestrationContinuedAsNew { .. }
        )
    }
}

/// Declarative decisions produced by an orchestration turn. The runtime
/// materializes these into work items; the matching schedule `Event`s are
/// already in the turn's history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Schedule an activity invocation.
    CallActivity { id: u64, name: String, input: String },
    /// Create a timer that will fire after the requested delay.
    CreateTimer { id: u64, delay_ms: u64 },
    /// Subscribe to an external event by name.
    WaitExternal { id: u64, name: String },
    /// End the current execution and start a new one with `input`.
    ContinueAsNew { input: String },
}

#[derive(Debug)]
pub(crate) struct CtxInner {
    pub(crate) history: Vec<Event>,
    actions: Vec<Action>,
    next_correlation_id: u64,
    turn_index: u64,
    // Ids adopted by futures during this poll, so two futures never share one history record
    claimed_activity_ids: std::collections::HashSet<u64>,
    claimed_timer_ids: std::collections::HashSet<u64>,
    claimed_external_ids: std::collections::HashSet<u64>,
}

impl CtxInner {
    fn new(history: Vec<Event>) -> Self {
        let max_id = history.iter().filter_map(Event::correlation_id).max().unwrap_or(0);
        Self {
            history,
            actions: Vec::new(),
            next_correlation_id: max_id.saturating_add(1),
            turn_index: 0,
            claimed_activity_ids: Default::default(),
            claimed_timer_ids: Default::default(),
            claimed_external_ids: Default::default(),
        }
    }

    pub(crate) fn record_action(&mut self, a: Action) {
        self.actions.push(a);
    }

    pub(crate) fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_correlation_id;
        self.next_correlation_id += 1;
        id
    }
}

/// User-facing orchestration context for scheduling and replay-safe helpers.
#[derive(Clone)]
pub struct OrchestrationContext {
    inner: Arc<Mutex<CtxInner>>,
}

impl OrchestrationContext {
    /// Construct a new context from an existing history vector.
    pub fn new(history: Vec<Event>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(CtxInner::new(history))),
        }
    }

    // A panicking orchestration poisons only its own context; keep reading through it.
    pub(crate) fn lock(&self) -> MutexGuard<'_, CtxInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn take_actions(&self) -> Vec<Action> {
        std::mem::take(&mut self.lock().actions)
    }

    fn history_snapshot(&self) -> Vec<Event> {
        self.lock().history.clone()
    }

    /// The zero-based turn counter assigned by the host for diagnostics.
    pub fn turn_index(&self) -> u64 {
        self.lock().turn_index
    }
    pub(crate) fn set_turn_index(&self, idx: u64) {
        self.lock().turn_index = idx;
    }

    /// Emit a log line exactly once per execution, regardless of how many
    /// times this code is replayed. Backed by the system trace activity.
    pub fn trace(&self, level: LogLevel, message: impl Into<String>) {
        let payload = format!("{}:{}", level.as_str(), message.into());
        let mut fut = self.schedule_activity(SYSTEM_TRACE_ACTIVITY, payload);
        let _ = poll_once(&mut fut);
    }

    pub fn trace_info(&self, message: impl Into<String>) {
        self.trace(LogLevel::Info, message);
    }
    pub fn trace_warn(&self, message: impl Into<String>) {
        self.trace(LogLevel::Warn, message);
    }
    pub fn trace_error(&self, message: impl Into<String>) {
        self.trace(LogLevel::Error, message);
    }

    /// Finish this execution and start a fresh one under the same instance
    /// id. The orchestration should return right after calling this.
    pub fn continue_as_new(&self, input: impl Into<String>) {
        self.lock().record_action(Action::ContinueAsNew { input: input.into() });
    }

    pub fn continue_as_new_typed<In: Serialize>(&self, input: &In) -> Result<(), String> {
        let payload = _typed_codec::Json::encode(input)?;
        self.continue_as_new(payload);
        Ok(())
    }

    /// Schedule an activity and return a `DurableFuture` correlated to it.
    pub fn schedule_activity(&self, name: impl Into<String>, input: impl Into<String>) -> DurableFuture {
        let name: String = name.into();
        let input: String = input.into();
        let mut inner = self.lock();
        // Adopt an existing scheduled activity with the same name and input that no other future holds yet
        let adopted_id = inner
            .history
            .iter()
            .find_map(|e| match e {
                Event::ActivityScheduled {
                    id,
                    name: n,
                    input: inp,
                } if n == &name && inp == &input && !inner.claimed_activity_ids.contains(id) => Some(*id),
                _ => None,
            })
            .unwrap_or_else(|| inner.next_id());
        inner.claimed_activity_ids.insert(adopted_id);
        drop(inner);
        DurableFuture(Kind::Activity {
            id: adopted_id,
            name,
            input,
            scheduled: Cell::new(false),
            ctx: self.clone(),
        })
    }

    /// Typed helper: serializes `input` as the activity payload.
    pub fn schedule_activity_typed<In: Serialize>(
        &self,
        name: impl Into<String>,
        input: &In,
    ) -> Result<DurableFuture, String> {
        let payload = _typed_codec::Json::encode(input)?;
        Ok(self.schedule_activity(name, payload))
    }

    /// Schedule a durable timer and return a `DurableFuture` correlated to it.
    pub fn schedule_timer(&self, delay_ms: u64) -> DurableFuture {
        let mut inner = self.lock();
        let adopted_id = inner
            .history
            .iter()
            .find_map(|e| match e {
                Event::TimerCreated { id, .. } if !inner.claimed_timer_ids.contains(id) => Some(*id),
                _ => None,
            })
            .unwrap_or_else(|| inner.next_id());
        inner.claimed_timer_ids.insert(adopted_id);
        drop(inner);
        DurableFuture(Kind::Timer {
            id: adopted_id,
            delay_ms,
            scheduled: Cell::new(false),
            ctx: self.clone(),
        })
    }

    /// Subscribe to an external event by name and return its `DurableFuture`.
    pub fn schedule_wait(&self, name: impl Into<String>) -> DurableFuture {
        let name: String = name.into();
        let mut inner = self.lock();
        let adopted_id = inner
            .history
            .iter()
            .find_map(|e| match e {
                Event::ExternalSubscribed { id, name: n } if n == &name && !inner.claimed_external_ids.contains(id) => {
                    Some(*id)
                }
                _ => None,
            })
            .unwrap_or_else(|| inner.next_id());
        inner.claimed_external_ids.insert(adopted_id);
        drop(inner);
        DurableFuture(Kind::External {
            id: adopted_id,
            name,
            scheduled: Cell::new(false),
            ctx: self.clone(),
        })
    }

    /// Deterministic select over two futures: returns `(winner_index, output)`.
    pub fn select2(&self, a: DurableFuture, b: DurableFuture) -> SelectFuture {
        SelectFuture(AggregateDurableFuture::new(self.clone(), vec![a, b]))
    }

    /// Deterministic select over N futures. The winner is the child whose
    /// completion appears first in history, not whichever is polled first.
    pub fn select(&self, futures: Vec<DurableFuture>) -> SelectFuture {
        SelectFuture(AggregateDurableFuture::new(self.clone(), futures))
    }

    /// Payload of the oldest buffered event for `name` that no subscription
    /// has taken yet. While buffered events are waiting, new arrivals for the
    /// same name queue up behind them, so every `ExternalEvent` for `name`
    /// recorded after a buffered one consumed the front of the backlog.
    pub(crate) fn oldest_buffered(hist: &[Event], name: &str) -> Option<String> {
        let mut backlog = std::collections::VecDeque::new();
        for e in hist {
            match e {
                Event::ExternalBuffered { name: n, data } if n == name => backlog.push_back(data),
                Event::ExternalEvent { name: n, .. } if n == name => {
                    backlog.pop_front();
                }
                _ => {}
            }
        }
        backlog.pop_front().cloned()
    }

    pub(crate) fn find_history_index(hist: &[Event], id: u64, kind: KindTag) -> Option<usize> {
        hist.iter().position(|e| match (kind, e) {
            (KindTag::Activity, Event::ActivityCompleted { id: cid, .. })
            | (KindTag::Activity, Event::ActivityFailed { id: cid, .. })
            | (KindTag::Timer, Event::TimerFired { id: cid, .. })
            | (KindTag::External, Event::ExternalEvent { id: cid, .. }) => *cid == id,
            _ => false,
        })
    }

    pub(crate) fn synth_output_from_history(hist: &[Event], id: u64, kind: KindTag) -> Option<DurableOutput> {
        hist.iter().rev().find_map(|e| match (kind, e) {
            (KindTag::Activity, Event::ActivityCompleted { id: cid, result }) if *cid == id => {
                Some(DurableOutput::Activity(Ok(result.clone())))
            }
            (KindTag::Activity, Event::ActivityFailed { id: cid, error }) if *cid == id => {
                Some(DurableOutput::Activity(Err(error.clone())))
            }
            (KindTag::Timer, Event::TimerFired { id: cid, .. }) if *cid == id => Some(DurableOutput::Timer),
            (KindTag::External, Event::ExternalEvent { id: cid, data, .. }) if *cid == id => {
                Some(DurableOutput::External(data.clone()))
            }
            _ => None,
        })
    }
}

pub(crate) fn poll_once<F: Future + ?Sized>(fut: &mut F) -> Poll<F::Output>
where
    F: Unpin,
{
    let mut cx = Context::from_waker(Waker::noop());
    Pin::new(fut).poll(&mut cx)
}

/// Tuple returned by `run_turn` and `run_turn_with`: the updated history,
/// actions requested during the turn, and the output if the orchestration
/// finished.
pub type TurnResult<O> = (Vec<Event>, Vec<Action>, Option<O>);

/// Poll the orchestrator once against `history`. Everything already recorded
/// resolves immediately; the first unresolved await leaves the turn pending.
pub fn run_turn<O, F>(history: Vec<Event>, orchestrator: impl Fn(OrchestrationContext) -> F) -> TurnResult<O>
where
    F: Future<Output = O>,
{
    run_turn_with(history, 0, orchestrator)
}

/// Same as `run_turn` but annotates the context with a caller-supplied
/// turn index for diagnostics and logging.
pub fn run_turn_with<O, F>(
    history: Vec<Event>,
    turn_index: u64,
    orchestrator: impl Fn(OrchestrationContext) -> F,
) -> TurnResult<O>
where
    F: Future<Output = O>,
{
    let ctx = OrchestrationContext::new(history);
    ctx.set_turn_index(turn_index);
    let mut fut = pin!(orchestrator(ctx.clone()));
    let mut cx = Context::from_waker(Waker::noop());
    let output = match fut.as_mut().poll(&mut cx) {
        Poll::Ready(out) => Some(out),
        Poll::Pending => None,
    };
    let actions = ctx.take_actions();
    (ctx.history_snapshot(), actions, output)
}

/// Helper for single-threaded, host-driven execution in tests and samples.
pub struct Executor;

impl Executor {
    /// Drives an orchestrator by alternately replaying one turn and invoking
    /// the provided `execute_actions` to materialize requested actions into
    /// history, until the orchestrator completes.
    pub fn drive_to_completion<O, F, X>(
        mut history: Vec<Event>,
        orchestrator: impl Fn(OrchestrationContext) -> F,
        mut execute_actions: X,
    ) -> (Vec<Event>, O)
    where
        F: Future<Output = O>,
        X: FnMut(Vec<Action>, &mut Vec<Event>),
    {
        loop {
            let (hist_after_replay, actions, output) = run_turn(history, &orchestrator);
            history = hist_after_replay;
            if let Some(out) = output {
                return (history, out);
            }
            execute_actions(actions, &mut history);
        }
    }
}
