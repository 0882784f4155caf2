//! Provisioning steps as durable activities. Each step is one trigger call;
//! the worker applies the registered `ActivityOptions` (time budget and
//! retry) around it.

use std::sync::Arc;

use tracing::warn;

use super::{ActionKind, ActionTrigger, ProvisioningError, ProvisioningRequest};
use crate::OrchestrationContext;
use crate::runtime::registry::ActivityRegistryBuilder;
use crate::runtime::{ActivityError, ActivityOptions};

pub const CREATE_ACTIVITY: &str = "CreateVcluster";
pub const ONBOARD_ACTIVITY: &str = "OnboardAzureArc";

/// Activity name that runs `kind`.
pub fn activity_name(kind: ActionKind) -> &'static str {
    match kind {
        ActionKind::Create => CREATE_ACTIVITY,
        ActionKind::ArcIntegration => ONBOARD_ACTIVITY,
    }
}

/// Register both step activities against `trigger`.
pub fn register_steps(
    builder: ActivityRegistryBuilder,
    trigger: Arc<dyn ActionTrigger>,
    options: ActivityOptions,
) -> ActivityRegistryBuilder {
    [ActionKind::Create, ActionKind::ArcIntegration]
        .into_iter()
        .fold(builder, |builder, kind| {
            let trigger = trigger.clone();
            builder.register_with_options(activity_name(kind), options.clone(), move |input: String| {
                let trigger = trigger.clone();
                async move { invoke_step(trigger.as_ref(), kind, &input).await }
            })
        })
}

async fn invoke_step(trigger: &dyn ActionTrigger, kind: ActionKind, input: &str) -> Result<String, ActivityError> {
    let request: ProvisioningRequest = serde_json::from_str(input)
        .map_err(|e| ActivityError::Fatal(format!("undecodable step input: {e}")))?;
    match trigger.invoke(kind, &request).await {
        Ok(()) => Ok(format!("{kind} triggered for {}", request.name)),
        Err(e) if e.is_retryable() => Err(ActivityError::Retryable(e.to_string())),
        Err(e) => {
            warn!(action = %kind, cluster = %request.name, error = %e, "step cannot succeed; not retrying");
            Err(ActivityError::Fatal(e.to_string()))
        }
    }
}

/// Run one step from orchestration code. Resolves once the activity has
/// succeeded or exhausted its retries.
pub async fn run_step(
    ctx: &OrchestrationContext,
    kind: ActionKind,
    request: &ProvisioningRequest,
) -> Result<String, ProvisioningError> {
    let step_failed = |cause: String| ProvisioningError::StepFailed { action: kind, cause };
    let activity = ctx
        .schedule_activity_typed(activity_name(kind), request)
        .map_err(step_failed)?;
    activity.into_activity().await.map_err(step_failed)
}
