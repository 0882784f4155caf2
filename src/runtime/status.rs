use super::{OrchestrationStatus, Runtime};
use crate::Event;

/// Status of one execution's history. A continued-as-new execution counts as
/// running: the instance lives on in its successor.
pub fn status_from_history(hist: &[Event]) -> OrchestrationStatus {
    if hist.is_empty() {
        return OrchestrationStatus::NotFound;
    }
    for e in hist.iter().rev() {
        match e {
            Event::OrchestrationCompleted { output } => {
                return OrchestrationStatus::Completed { output: output.clone() };
            }
            Event::OrchestrationFailed { error } => {
                return OrchestrationStatus::Failed { error: error.clone() };
            }
            _ => {}
        }
    }
    OrchestrationStatus::Running
}

impl Runtime {
    /// Status of the latest execution of `instance`.
    pub async fn get_orchestration_status(&self, instance: &str) -> OrchestrationStatus {
        status_from_history(&self.history_store.read(instance).await)
    }

    /// History of the latest execution.
    pub async fn get_history(&self, instance: &str) -> Vec<Event> {
        self.history_store.read(instance).await
    }

    pub async fn list_executions(&self, instance: &str) -> Vec<u64> {
        self.history_store.list_executions(instance).await
    }

    pub async fn get_execution_history(&self, instance: &str, execution_id: u64) -> Vec<Event> {
        self.history_store.read_with_execution(instance, execution_id).await
    }

    /// True when the latest execution exists and has not reached a terminal event.
    pub async fn is_active(&self, instance: &str) -> bool {
        let hist = self.history_store.read(instance).await;
        !hist.is_empty() && !hist.iter().any(Event::is_terminal)
    }
}
