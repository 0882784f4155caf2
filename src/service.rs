//! Request intake: start a provisioning run, deliver a completion signal,
//! and report where a run stands.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::info;

use crate::provisioning::{
    ActionTrigger, CompletionSignal, ORCHESTRATION_NAME, OrchestrationPolicy, ProvisioningError, ProvisioningInput,
    ProvisioningPhase, ProvisioningRequest, execution_id_for, is_valid_identifier, phase_from_history,
    register_orchestration, register_steps,
};
use crate::providers::HistoryStore;
use crate::runtime::status::status_from_history;
use crate::runtime::{ActivityOptions, ActivityRegistry, OrchestrationRegistry, Runtime, RuntimeError, WaitError};
use crate::{Event, OrchestrationStatus};

/// Snapshot of one provisioning instance, as served by `GET /status/{name}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisioningStatus {
    pub execution_id: String,
    pub phase: ProvisioningPhase,
    pub status: String,
    /// Attempt of the latest execution, 1-based.
    pub attempt: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Registries wiring the provisioning orchestration and its step activities
/// to `trigger`.
pub fn build_registries(
    trigger: Arc<dyn ActionTrigger>,
    step_options: ActivityOptions,
) -> (ActivityRegistry, OrchestrationRegistry) {
    let activities = register_steps(ActivityRegistry::builder(), trigger, step_options).build();
    let orchestrations = register_orchestration(OrchestrationRegistry::builder()).build();
    (activities, orchestrations)
}

pub struct ProvisioningService {
    runtime: Arc<Runtime>,
    policy: OrchestrationPolicy,
}

impl ProvisioningService {
    pub fn new(runtime: Arc<Runtime>, policy: OrchestrationPolicy) -> Self {
        Self { runtime, policy }
    }

    /// Start the runtime over `store` with the provisioning registrations.
    /// Runs the store shows as unfinished resume.
    pub async fn start(
        store: Arc<dyn HistoryStore>,
        trigger: Arc<dyn ActionTrigger>,
        step_options: ActivityOptions,
        policy: OrchestrationPolicy,
    ) -> Self {
        let (activities, orchestrations) = build_registries(trigger, step_options);
        let runtime = Runtime::start_with_store(store, Arc::new(activities), orchestrations).await;
        Self::new(runtime, policy)
    }

    /// Start provisioning `name`. Returns the execution id the completion
    /// signal must be addressed to. Fails with `DuplicateExecution` while an
    /// earlier run for the same name is still going.
    pub async fn start_provisioning(
        &self,
        name: &str,
        cpu: &str,
        memory: &str,
        storage: &str,
    ) -> Result<String, ProvisioningError> {
        let request = ProvisioningRequest::new(name, cpu, memory, storage);
        request.validate()?;
        let execution_id = request.execution_id.clone();
        let input = ProvisioningInput::new(request, self.policy);
        let payload = serde_json::to_string(&input).map_err(|e| RuntimeError::Codec(e.to_string()))?;
        let run = self
            .runtime
            .clone()
            .start_orchestration_detached(&execution_id, ORCHESTRATION_NAME, payload)
            .await?;
        info!(execution_id = %execution_id, run, "provisioning started");
        Ok(execution_id)
    }

    /// Hand a completion signal to the execution it names. A signal that
    /// arrives while the `create` step is still running is kept and resolves
    /// the completion wait as soon as it starts.
    pub async fn deliver_signal(&self, signal: CompletionSignal) -> Result<(), ProvisioningError> {
        let target = signal.target_execution_id.trim();
        let name = signal.signal_name.trim();
        if target.is_empty() || name.is_empty() {
            return Err(ProvisioningError::InvalidRequest(
                "workflowId and signalName are required".to_string(),
            ));
        }
        if !is_valid_identifier(target) {
            return Err(ProvisioningError::InvalidRequest(format!("invalid workflowId {target:?}")));
        }
        self.runtime.raise_event(target, name, signal.payload).await?;
        info!(execution_id = %target, signal = %name, "signal delivered");
        Ok(())
    }

    /// Status of the instance for cluster `name`.
    pub async fn status_for_name(&self, name: &str) -> Result<ProvisioningStatus, ProvisioningError> {
        self.status(&execution_id_for(name.trim())).await
    }

    pub async fn status(&self, execution_id: &str) -> Result<ProvisioningStatus, ProvisioningError> {
        if !is_valid_identifier(execution_id) {
            return Err(ProvisioningError::InvalidRequest(format!("invalid execution id {execution_id:?}")));
        }
        let hist = self.runtime.get_history(execution_id).await;
        if hist.is_empty() {
            return Err(ProvisioningError::NotFound(execution_id.to_string()));
        }
        let attempt = hist
            .iter()
            .find_map(|e| match e {
                Event::OrchestrationStarted { input, .. } => serde_json::from_str::<ProvisioningInput>(input).ok(),
                _ => None,
            })
            .map_or(1, |i| i.attempt);
        let (status, output, error) = match status_from_history(&hist) {
            OrchestrationStatus::Completed { output } => ("Completed", Some(output), None),
            OrchestrationStatus::Failed { error } => ("Failed", None, Some(error)),
            OrchestrationStatus::Running | OrchestrationStatus::NotFound => ("Running", None, None),
        };
        Ok(ProvisioningStatus {
            execution_id: execution_id.to_string(),
            phase: phase_from_history(&hist),
            status: status.to_string(),
            attempt,
            output,
            error,
        })
    }

    /// Wait until the run for `execution_id` ends, across restarts.
    pub async fn wait_for_terminal(
        &self,
        execution_id: &str,
        timeout: Duration,
    ) -> Result<OrchestrationStatus, WaitError> {
        self.runtime.wait_for_orchestration(execution_id, timeout).await
    }

    pub async fn shutdown(&self) {
        self.runtime.clone().shutdown().await;
    }
}
