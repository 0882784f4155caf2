use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::steps::{self, CREATE_ACTIVITY, ONBOARD_ACTIVITY};
use super::wait::{self, WaitOutcome};
use super::{ActionKind, COMPLETION_SIGNAL, ORCHESTRATION_NAME, ProvisioningError, ProvisioningRequest};
use crate::runtime::RuntimeError;
use crate::{Event, OrchestrationContext, OrchestrationRegistryBuilder};

/// Output of a provisioning run that reached the end.
pub const COMPLETED_MESSAGE: &str = "vCluster creation and Azure Arc onboarding completed";

/// Limits of one provisioning run. Carried in the orchestration input so a
/// replay sees the values the run started with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestrationPolicy {
    pub completion_timeout_ms: u64,
    /// Executions of the create step, counting the first.
    pub max_create_attempts: u32,
}

impl Default for OrchestrationPolicy {
    fn default() -> Self {
        Self {
            completion_timeout_ms: 15 * 60 * 1000,
            max_create_attempts: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisioningInput {
    pub request: ProvisioningRequest,
    /// 1-based; bumped on every restart after a timeout.
    pub attempt: u32,
    pub policy: OrchestrationPolicy,
}

impl ProvisioningInput {
    pub fn new(request: ProvisioningRequest, policy: OrchestrationPolicy) -> Self {
        Self {
            request,
            attempt: 1,
            policy,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProvisioningPhase {
    Created,
    AwaitingExternalCreate,
    AwaitingSignal,
    AwaitingOnboard,
    Completed,
    Failed,
}

impl ProvisioningPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProvisioningPhase::Completed | ProvisioningPhase::Failed)
    }
}

impl fmt::Display for ProvisioningPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutDecision {
    Restart { next_attempt: u32 },
    GiveUp,
}

/// What to do when the completion signal did not arrive in time.
pub fn decide_on_timeout(attempt: u32, max_attempts: u32) -> TimeoutDecision {
    if attempt < max_attempts {
        TimeoutDecision::Restart {
            next_attempt: attempt.saturating_add(1),
        }
    } else {
        TimeoutDecision::GiveUp
    }
}

pub fn register_orchestration(builder: OrchestrationRegistryBuilder) -> OrchestrationRegistryBuilder {
    builder.register_typed(ORCHESTRATION_NAME, provision_vcluster)
}

/// The provisioning state machine. Triggers `create`, waits for the
/// pipeline's completion signal, then triggers `arc-integration`. A missed
/// signal restarts the run as a fresh execution until the attempt budget is
/// spent.
pub async fn provision_vcluster(ctx: OrchestrationContext, input: ProvisioningInput) -> Result<String, String> {
    let name = input.request.name.clone();
    match run(&ctx, input).await {
        Ok(out) => Ok(out),
        Err(e) => {
            ctx.trace_error(format!("provisioning {name} failed: {e}"));
            Err(e.to_string())
        }
    }
}

async fn run(ctx: &OrchestrationContext, input: ProvisioningInput) -> Result<String, ProvisioningError> {
    let ProvisioningInput {
        request,
        attempt,
        policy,
    } = input;
    ctx.trace_info(format!(
        "provisioning {} (attempt {attempt}/{})",
        request.name, policy.max_create_attempts
    ));

    steps::run_step(ctx, ActionKind::Create, &request).await?;

    let max_wait = Duration::from_millis(policy.completion_timeout_ms);
    match wait::await_completion(ctx, COMPLETION_SIGNAL, max_wait).await {
        WaitOutcome::Signaled(payload) => {
            ctx.trace_info(format!("{COMPLETION_SIGNAL} received for {}: {payload}", request.name));
        }
        WaitOutcome::TimedOut => match decide_on_timeout(attempt, policy.max_create_attempts) {
            TimeoutDecision::Restart { next_attempt } => {
                ctx.trace_warn(format!(
                    "no {COMPLETION_SIGNAL} for {} after {}ms; restarting as attempt {next_attempt}",
                    request.name, policy.completion_timeout_ms
                ));
                let next = ProvisioningInput {
                    request,
                    attempt: next_attempt,
                    policy,
                };
                ctx.continue_as_new_typed(&next)
                    .map_err(|e| ProvisioningError::Runtime(RuntimeError::Codec(e)))?;
                return Ok(String::new());
            }
            TimeoutDecision::GiveUp => return Err(ProvisioningError::Timeout { attempts: attempt }),
        },
    }

    steps::run_step(ctx, ActionKind::ArcIntegration, &request).await?;
    ctx.trace_info(format!("{} provisioned and onboarded", request.name));
    Ok(COMPLETED_MESSAGE.to_string())
}

/// Phase of the execution recorded in `hist`, read from what it has
/// scheduled so far.
pub fn phase_from_history(hist: &[Event]) -> ProvisioningPhase {
    let mut phase = ProvisioningPhase::Created;
    for e in hist {
        phase = match e {
            Event::OrchestrationCompleted { .. } => return ProvisioningPhase::Completed,
            Event::OrchestrationFailed { .. } => return ProvisioningPhase::Failed,
            // Rolling over; the successor starts from scratch
            Event::OrchestrationContinuedAsNew { .. } => return ProvisioningPhase::Created,
            Event::ActivityScheduled { name, .. } if name == CREATE_ACTIVITY => ProvisioningPhase::AwaitingExternalCreate,
            Event::ExternalSubscribed { name, .. } if name == COMPLETION_SIGNAL => ProvisioningPhase::AwaitingSignal,
            Event::ActivityScheduled { name, .. } if name == ONBOARD_ACTIVITY => ProvisioningPhase::AwaitingOnboard,
            _ => phase,
        };
    }
    phase
}
