//! One replay turn of a hosted orchestration.

use std::sync::Arc;

use crate::runtime::OrchestrationHandler;
use crate::{Action, Event, OrchestrationContext};

/// Outcome of polling an orchestration once against its recorded history.
pub struct Turn {
    pub history: Vec<Event>,
    pub decisions: Vec<Action>,
    pub output: Option<Result<String, String>>,
}

impl Turn {
    /// Replay `history` through `handler`. Events the turn schedules are
    /// appended to the returned history in the order they were decided.
    pub fn replay(handler: Arc<dyn OrchestrationHandler>, history: Vec<Event>, turn_index: u64, input: &str) -> Self {
        let (history, decisions, output) = crate::run_turn_with(history, turn_index, |ctx: OrchestrationContext| {
            let handler = handler.clone();
            let input = input.to_string();
            async move { handler.invoke(ctx, input).await }
        });
        Self {
            history,
            decisions,
            output,
        }
    }

    /// Input for the successor execution, if the turn asked to continue as new.
    pub fn continue_as_new(&self) -> Option<String> {
        self.decisions.iter().find_map(|d| match d {
            Action::ContinueAsNew { input } => Some(input.clone()),
            _ => None,
        })
    }
}
