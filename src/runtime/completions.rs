use std::sync::Arc;

use tracing::{debug, warn};

use super::router::OrchestratorMsg;
use crate::{Event, OrchestrationContext};
use crate::providers::{HistoryStore, QueueKind, WorkItem};

/// Fold one completion message into `history`. Returns the message's ack
/// token and whether history changed. Activity and timer completions that
/// match nothing open (unknown id, already completed) are dropped. An
/// external event with no open subscription is buffered for the next one.
pub fn append_completion(history: &mut Vec<Event>, msg: OrchestratorMsg) -> (Option<String>, bool) {
    match msg {
        OrchestratorMsg::ActivityCompleted {
            instance,
            id,
            result,
            ack_token,
            ..
        } => {
            if activity_open(history, id) {
                history.push(Event::ActivityCompleted { id, result });
                (ack_token, true)
            } else {
                debug!(instance = %instance, id, "dropping activity completion with no open schedule");
                (ack_token, false)
            }
        }
        OrchestratorMsg::ActivityFailed {
            instance,
            id,
            error,
            ack_token,
            ..
        } => {
            if activity_open(history, id) {
                history.push(Event::ActivityFailed { id, error });
                (ack_token, true)
            } else {
                debug!(instance = %instance, id, "dropping activity failure with no open schedule");
                (ack_token, false)
            }
        }
        OrchestratorMsg::TimerFired {
            instance,
            id,
            fire_at_ms,
            ack_token,
            ..
        } => {
            let created = history
                .iter()
                .any(|e| matches!(e, Event::TimerCreated { id: cid, .. } if *cid == id));
            let fired = history
                .iter()
                .any(|e| matches!(e, Event::TimerFired { id: cid, .. } if *cid == id));
            if created && !fired {
                history.push(Event::TimerFired { id, fire_at_ms });
                (ack_token, true)
            } else {
                debug!(instance = %instance, id, "dropping timer fire with no open timer");
                (ack_token, false)
            }
        }
        OrchestratorMsg::ExternalByName {
            instance,
            name,
            data,
            ack_token,
            ..
        } => {
            let backlog = OrchestrationContext::oldest_buffered(history, &name).is_some();
            match oldest_open_subscription(history, &name) {
                Some(id) if !backlog => history.push(Event::ExternalEvent { id, name, data }),
                _ => {
                    debug!(instance = %instance, event_name = %name, "buffering external event until a wait subscribes");
                    history.push(Event::ExternalBuffered { name, data });
                }
            }
            (ack_token, true)
        }
    }
}

fn activity_open(history: &[Event], id: u64) -> bool {
    let scheduled = history
        .iter()
        .any(|e| matches!(e, Event::ActivityScheduled { id: cid, .. } if *cid == id));
    let done = history.iter().any(|e| {
        matches!(e, Event::ActivityCompleted { id: cid, .. } | Event::ActivityFailed { id: cid, .. } if *cid == id)
    });
    scheduled && !done
}

/// Id of the earliest subscription to `name` that has not received an event.
pub fn oldest_open_subscription(history: &[Event], name: &str) -> Option<u64> {
    history.iter().find_map(|e| match e {
        Event::ExternalSubscribed { id, name: n }
            if n == name
                && !history
                    .iter()
                    .any(|x| matches!(x, Event::ExternalEvent { id: xid, .. } if xid == id)) =>
        {
            Some(*id)
        }
        _ => None,
    })
}

/// Re-enqueue work for activities and timers that the history shows as
/// scheduled but not completed. Used when a runtime resumes instances left
/// behind by a previous process; enqueue dedupes against items still queued.
pub async fn rehydrate_pending(instance: &str, execution_id: u64, history: &[Event], store: &Arc<dyn HistoryStore>) {
    for e in history {
        match e {
            Event::ActivityScheduled { id, name, input } if activity_open(history, *id) => {
                let item = WorkItem::ActivityExecute {
                    instance: instance.to_string(),
                    execution_id,
                    id: *id,
                    name: name.clone(),
                    input: input.clone(),
                };
                if let Err(err) = store.enqueue_work(QueueKind::Worker, item).await {
                    warn!(instance, id, error = %err, "failed to re-enqueue pending activity");
                }
            }
            Event::TimerCreated { id, fire_at_ms } => {
                let fired = history
                    .iter()
                    .any(|x| matches!(x, Event::TimerFired { id: cid, .. } if cid == id));
                if fired {
                    continue;
                }
                let item = WorkItem::TimerSchedule {
                    instance: instance.to_string(),
                    execution_id,
                    id: *id,
                    fire_at_ms: *fire_at_ms,
                };
                if let Err(err) = store.enqueue_work(QueueKind::Timer, item).await {
                    warn!(instance, id, error = %err, "failed to re-enqueue pending timer");
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn external(name: &str, data: &str) -> OrchestratorMsg {
        OrchestratorMsg::ExternalByName {
            instance: "i".into(),
            execution_id: 1,
            name: name.into(),
            data: data.into(),
            ack_token: Some("t".into()),
        }
    }

    #[test]
    fn external_goes_to_oldest_open_subscription() {
        let mut h = vec![
            Event::ExternalSubscribed { id: 1, name: "go".into() },
            Event::ExternalSubscribed { id: 2, name: "go".into() },
        ];
        assert_eq!(append_completion(&mut h, external("go", "a")), (Some("t".into()), true));
        assert_eq!(append_completion(&mut h, external("go", "b")), (Some("t".into()), true));
        assert_eq!(
            &h[2..],
            &[
                Event::ExternalEvent {
                    id: 1,
                    name: "go".into(),
                    data: "a".into()
                },
                Event::ExternalEvent {
                    id: 2,
                    name: "go".into(),
                    data: "b".into()
                },
            ]
        );
        // Both subscriptions consumed: the third waits for the next one
        assert_eq!(append_completion(&mut h, external("go", "c")), (Some("t".into()), true));
        assert_eq!(
            h.last(),
            Some(&Event::ExternalBuffered {
                name: "go".into(),
                data: "c".into()
            })
        );
    }

    #[test]
    fn arrivals_queue_behind_a_buffered_event() {
        let mut h = vec![Event::ExternalBuffered {
            name: "go".into(),
            data: "early".into(),
        }];
        // Even with a subscription open, the backlog is served first
        h.push(Event::ExternalSubscribed { id: 1, name: "go".into() });
        h.push(Event::ExternalEvent {
            id: 1,
            name: "go".into(),
            data: "early".into(),
        });
        assert_eq!(OrchestrationContext::oldest_buffered(&h, "go"), None);

        h.push(Event::ExternalBuffered {
            name: "go".into(),
            data: "second".into(),
        });
        h.push(Event::ExternalSubscribed { id: 2, name: "go".into() });
        append_completion(&mut h, external("go", "third"));
        assert_eq!(
            h.last(),
            Some(&Event::ExternalBuffered {
                name: "go".into(),
                data: "third".into()
            })
        );
        assert_eq!(OrchestrationContext::oldest_buffered(&h, "go").as_deref(), Some("second"));
    }

    #[test]
    fn completion_for_unknown_activity_is_dropped() {
        let mut h = vec![Event::OrchestrationStarted {
            name: "O".into(),
            input: String::new(),
        }];
        let msg = OrchestratorMsg::ActivityCompleted {
            instance: "i".into(),
            execution_id: 1,
            id: 9,
            result: "r".into(),
            ack_token: None,
        };
        assert_eq!(append_completion(&mut h, msg), (None, false));
        assert_eq!(h.len(), 1);
    }
}
