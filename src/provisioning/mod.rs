//! vCluster provisioning: the request model, the external action trigger,
//! the durable steps wrapping it, the completion wait, and the
//! orchestration tying them together.

pub mod error;
pub mod orchestration;
pub mod steps;
pub mod trigger;
pub mod wait;

use serde::{Deserialize, Serialize};

pub use error::ProvisioningError;
pub use orchestration::{
    COMPLETED_MESSAGE, OrchestrationPolicy, ProvisioningInput, ProvisioningPhase, TimeoutDecision, decide_on_timeout,
    phase_from_history, provision_vcluster, register_orchestration,
};
pub use steps::{CREATE_ACTIVITY, ONBOARD_ACTIVITY, register_steps};
pub use trigger::{ActionKind, ActionTrigger, GithubActionTrigger, InvocationError, build_parameters};
pub use wait::{WaitOutcome, await_completion};

/// Registered name of the provisioning orchestration.
pub const ORCHESTRATION_NAME: &str = "CreateVclusterWorkflow";
/// Signal the `create` pipeline raises once the cluster exists.
pub const COMPLETION_SIGNAL: &str = "vcluster-created";
/// Payload the `create` pipeline is asked to send with the signal.
pub const COMPLETION_PAYLOAD: &str = "done";

/// Execution id derived from a cluster name. Stable, so a second request for
/// the same name addresses the same instance.
pub fn execution_id_for(name: &str) -> String {
    format!("vcluster-workflow-{name}")
}

/// Names and execution ids end up in Kubernetes namespaces and store paths,
/// so they are limited to ASCII alphanumerics, `-` and `_`.
pub fn is_valid_identifier(id: &str) -> bool {
    !id.is_empty() && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// One request to provision a virtual cluster. Sizes are passed through to
/// the pipeline untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisioningRequest {
    pub name: String,
    pub cpu: String,
    pub memory: String,
    pub storage: String,
    pub execution_id: String,
}

impl ProvisioningRequest {
    pub fn new(
        name: impl Into<String>,
        cpu: impl Into<String>,
        memory: impl Into<String>,
        storage: impl Into<String>,
    ) -> Self {
        let name = name.into().trim().to_string();
        Self {
            execution_id: execution_id_for(&name),
            name,
            cpu: cpu.into().trim().to_string(),
            memory: memory.into().trim().to_string(),
            storage: storage.into().trim().to_string(),
        }
    }

    /// All fields must be present and the name a valid identifier.
    pub fn validate(&self) -> Result<(), ProvisioningError> {
        let missing: Vec<&str> = [
            ("vclusterName", &self.name),
            ("cpu", &self.cpu),
            ("memory", &self.memory),
            ("storage", &self.storage),
        ]
        .into_iter()
        .filter(|(_, v)| v.is_empty())
        .map(|(k, _)| k)
        .collect();
        if !missing.is_empty() {
            return Err(ProvisioningError::InvalidRequest(format!(
                "missing required parameters: {}",
                missing.join(", ")
            )));
        }
        if !is_valid_identifier(&self.name) {
            return Err(ProvisioningError::InvalidRequest(format!(
                "invalid cluster name {:?}",
                self.name
            )));
        }
        Ok(())
    }

    /// Namespace the `create` pipeline provisions into.
    pub fn create_namespace(&self) -> String {
        format!("{}-ns", self.name)
    }

    /// Namespace the `arc-integration` pipeline targets. The pipelines use
    /// different conventions; both are kept as they are.
    pub fn arc_namespace(&self) -> String {
        format!("vcluster-{}-ns", self.name)
    }
}

/// Out-of-band notification addressed to one execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionSignal {
    pub target_execution_id: String,
    pub signal_name: String,
    pub payload: String,
}
