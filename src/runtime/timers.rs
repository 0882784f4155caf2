use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::providers::{HistoryStore, QueueKind, WorkItem};

/// In-process timer wheel. Holds scheduled timers by absolute fire time and
/// enqueues `TimerFired` on the orchestrator queue once they are due.
pub(crate) struct TimerService;

impl TimerService {
    pub(crate) fn start(
        store: Arc<dyn HistoryStore>,
        poll_interval_ms: u64,
    ) -> (JoinHandle<()>, mpsc::UnboundedSender<WorkItem>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<WorkItem>();
        let handle = tokio::spawn(async move {
            let mut pending: Vec<(u64, WorkItem)> = Vec::new();
            loop {
                // Drain new schedules without blocking
                loop {
                    match rx.try_recv() {
                        Ok(item @ WorkItem::TimerSchedule { fire_at_ms, .. }) => pending.push((fire_at_ms, item)),
                        Ok(other) => warn!(?other, "timer service ignoring non-timer work item"),
                        Err(mpsc::error::TryRecvError::Empty) => break,
                        Err(mpsc::error::TryRecvError::Disconnected) => {
                            if pending.is_empty() {
                                return;
                            }
                            break;
                        }
                    }
                }

                let now = now_ms();
                let (due, later): (Vec<_>, Vec<_>) = pending.drain(..).partition(|(at, _)| *at <= now);
                pending = later;
                for (fire_at_ms, item) in due {
                    let WorkItem::TimerSchedule {
                        instance,
                        execution_id,
                        id,
                        ..
                    } = &item
                    else {
                        continue;
                    };
                    debug!(instance = %instance, execution_id, id, fire_at_ms, "timer due");
                    let fired = WorkItem::TimerFired {
                        instance: instance.clone(),
                        execution_id: *execution_id,
                        id: *id,
                        fire_at_ms,
                    };
                    if let Err(e) = store.enqueue_work(QueueKind::Orchestrator, fired).await {
                        warn!(error = %e, "failed to enqueue TimerFired; retrying next tick");
                        pending.push((fire_at_ms, item));
                    }
                }

                tokio::time::sleep(Duration::from_millis(poll_interval_ms)).await;
            }
        });
        (handle, tx)
    }
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
