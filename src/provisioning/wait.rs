use std::time::Duration;

use crate::{DurableOutput, OrchestrationContext};

/// How a completion wait ended. Exactly one of the two, decided by which
/// completion was recorded first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome {
    Signaled(String),
    TimedOut,
}

/// Wait for `signal` or for `max_wait` to pass, whichever is recorded
/// first. The subscription and the timer are both registered in the same
/// turn. A signal arriving after the timer fired is not applied here.
pub async fn await_completion(ctx: &OrchestrationContext, signal: &str, max_wait: Duration) -> WaitOutcome {
    let signal_fut = ctx.schedule_wait(signal);
    let timer_fut = ctx.schedule_timer(u64::try_from(max_wait.as_millis()).unwrap_or(u64::MAX));
    let (_, output) = ctx.select2(signal_fut, timer_fut).await;
    match output {
        DurableOutput::External(payload) => WaitOutcome::Signaled(payload),
        _ => WaitOutcome::TimedOut,
    }
}
