use std::cell::Cell;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::{Action, Event, OrchestrationContext};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DurableOutput {
    Activity(Result<String, String>),
    Timer,
    External(String),
}

/// A durable operation (activity, timer, or external event) keyed by a
/// correlation id. Polling it for the first time records the scheduling
/// event and the matching `Action`; it resolves once the completion is in
/// history.
pub struct DurableFuture(pub(crate) Kind);

pub(crate) enum Kind {
    Activity {
        id: u64,
        name: String,
        input: String,
        scheduled: Cell<bool>,
        ctx: OrchestrationContext,
    },
    Timer {
        id: u64,
        delay_ms: u64,
        scheduled: Cell<bool>,
        ctx: OrchestrationContext,
    },
    External {
        id: u64,
        name: String,
        scheduled: Cell<bool>,
        ctx: OrchestrationContext,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum KindTag {
    Activity,
    Timer,
    External,
}

impl DurableFuture {
    pub(crate) fn id_and_tag(&self) -> (u64, KindTag) {
        match &self.0 {
            Kind::Activity { id, .. } => (*id, KindTag::Activity),
            Kind::Timer { id, .. } => (*id, KindTag::Timer),
            Kind::External { id, .. } => (*id, KindTag::External),
        }
    }
}

impl Future for DurableFuture {
    type Output = DurableOutput;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match &this.0 {
            Kind::Activity {
                id,
                name,
                input,
                scheduled,
                ctx,
            } => {
                let mut inner = ctx.lock();
                if let Some(out) = OrchestrationContext::synth_output_from_history(&inner.history, *id, KindTag::Activity) {
                    return Poll::Ready(out);
                }
                let already_scheduled = inner
                    .history
                    .iter()
                    .any(|e| matches!(e, Event::ActivityScheduled { id: cid, .. } if cid == id));
                if !already_scheduled && !scheduled.replace(true) {
                    inner.history.push(Event::ActivityScheduled {
                        id: *id,
                        name: name.clone(),
                        input: input.clone(),
                    });
                    inner.record_action(Action::CallActivity {
                        id: *id,
                        name: name.clone(),
                        input: input.clone(),
                    });
                }
                Poll::Pending
            }
            Kind::Timer {
                id,
                delay_ms,
                scheduled,
                ctx,
            } => {
                let mut inner = ctx.lock();
                if inner
                    .history
                    .iter()
                    .any(|e| matches!(e, Event::TimerFired { id: cid, .. } if cid == id))
                {
                    return Poll::Ready(DurableOutput::Timer);
                }
                let already_created = inner
                    .history
                    .iter()
                    .any(|e| matches!(e, Event::TimerCreated { id: cid, .. } if cid == id));
                if !already_created && !scheduled.replace(true) {
                    let fire_at_ms = inner.now_ms().saturating_add(*delay_ms);
                    inner.history.push(Event::TimerCreated { id: *id, fire_at_ms });
                    inner.record_action(Action::CreateTimer {
                        id: *id,
                        delay_ms: *delay_ms,
                    });
                }
                Poll::Pending
            }
            Kind::External {
                id,
                name,
                scheduled,
                ctx,
            } => {
                let mut inner = ctx.lock();
                if let Some(out) = OrchestrationContext::synth_output_from_history(&inner.history, *id, KindTag::External) {
                    return Poll::Ready(out);
                }
                let already_subscribed = inner
                    .history
                    .iter()
                    .any(|e| matches!(e, Event::ExternalSubscribed { id: cid, .. } if cid == id));
                if !already_subscribed && !scheduled.replace(true) {
                    inner.history.push(Event::ExternalSubscribed {
                        id: *id,
                        name: name.clone(),
                    });
                    inner.record_action(Action::WaitExternal {
                        id: *id,
                        name: name.clone(),
                    });
                    // An event that arrived before this subscription is bound right away
                    if let Some(data) = OrchestrationContext::oldest_buffered(&inner.history, name) {
                        inner.history.push(Event::ExternalEvent {
                            id: *id,
                            name: name.clone(),
                            data: data.clone(),
                        });
                        return Poll::Ready(DurableOutput::External(data));
                    }
                }
                Poll::Pending
            }
        }
    }
}

// Adapters from the unified output to a concrete shape. A mismatch means the
// orchestration called the wrong adapter for the future it built.
struct MapActivity(DurableFuture);
impl Future for MapActivity {
    type Output = Result<String, String>;
    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.0).poll(cx) {
            Poll::Ready(DurableOutput::Activity(v)) => Poll::Ready(v),
            Poll::Ready(other) => Poll::Ready(Err(format!("expected activity output, got {other:?}"))),
            Poll::Pending => Poll::Pending,
        }
    }
}

struct MapTimer(DurableFuture);
impl Future for MapTimer {
    type Output = ();
    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.0).poll(cx) {
            Poll::Ready(_) => Poll::Ready(()),
            Poll::Pending => Poll::Pending,
        }
    }
}

struct MapEvent(DurableFuture);
impl Future for MapEvent {
    type Output = String;
    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.0).poll(cx) {
            Poll::Ready(DurableOutput::External(v)) => Poll::Ready(v),
            Poll::Ready(_) => Poll::Ready(String::new()),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl DurableFuture {
    pub fn into_activity(self) -> impl Future<Output = Result<String, String>> {
        MapActivity(self)
    }

    pub fn into_timer(self) -> impl Future<Output = ()> {
        MapTimer(self)
    }

    pub fn into_event(self) -> impl Future<Output = String> {
        MapEvent(self)
    }
}

/// Race over several durable futures. Every child is polled so each one
/// records its schedule event; among the ready children the one whose
/// completion sits earliest in history wins, which keeps replays stable no
/// matter when the host appended the completions.
pub(crate) struct AggregateDurableFuture {
    ctx: OrchestrationContext,
    children: Vec<DurableFuture>,
}

impl AggregateDurableFuture {
    pub(crate) fn new(ctx: OrchestrationContext, children: Vec<DurableFuture>) -> Self {
        Self { ctx, children }
    }
}

impl Future for AggregateDurableFuture {
    type Output = (usize, DurableOutput);

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut ready: Vec<(usize, DurableOutput)> = Vec::new();
        for (i, child) in this.children.iter_mut().enumerate() {
            if let Poll::Ready(out) = Pin::new(child).poll(cx) {
                ready.push((i, out));
            }
        }
        if ready.is_empty() {
            return Poll::Pending;
        }
        let inner = this.ctx.lock();
        let winner = ready.into_iter().min_by_key(|(i, _)| {
            let (id, tag) = this.children[*i].id_and_tag();
            OrchestrationContext::find_history_index(&inner.history, id, tag).unwrap_or(usize::MAX)
        });
        drop(inner);
        match winner {
            Some(w) => Poll::Ready(w),
            None => Poll::Pending,
        }
    }
}

pub struct SelectFuture(pub(crate) AggregateDurableFuture);

impl Future for SelectFuture {
    type Output = (usize, DurableOutput);
    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.get_mut().0).poll(cx)
    }
}
