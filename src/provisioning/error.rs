use crate::runtime::RuntimeError;

use super::ActionKind;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProvisioningError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("execution {0} is already active")]
    DuplicateExecution(String),

    #[error("no active execution {0}")]
    NoActiveExecution(String),

    #[error("execution {0} not found")]
    NotFound(String),

    #[error("step {action} failed: {cause}")]
    StepFailed { action: ActionKind, cause: String },

    #[error("no completion signal after {attempts} attempt(s)")]
    Timeout { attempts: u32 },

    #[error(transparent)]
    Runtime(RuntimeError),
}

impl From<RuntimeError> for ProvisioningError {
    fn from(e: RuntimeError) -> Self {
        match e {
            RuntimeError::AlreadyActive(id) => ProvisioningError::DuplicateExecution(id),
            RuntimeError::NotFound(id) => ProvisioningError::NoActiveExecution(id),
            other => ProvisioningError::Runtime(other),
        }
    }
}
