use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;

use super::event_log::EventLog;
use super::events::{RunEvent, RunEventKind};

/// Per-run fan-out with full replay.
///
/// Every emitted event is appended to the backlog, pushed to each attached
/// subscriber and written to the run log under one lock, so all three see
/// the same order. Subscribers get their own unbounded channel; a slow
/// reader only grows its own queue.
pub struct EventBus {
    run_id: String,
    slug: String,
    log: Option<EventLog>,
    state: Mutex<BusState>,
}

#[derive(Default)]
struct BusState {
    backlog: Vec<RunEvent>,
    subscribers: HashMap<u64, mpsc::UnboundedSender<RunEvent>>,
    next_subscriber: u64,
    finished: bool,
}

impl EventBus {
    pub fn new(run_id: impl Into<String>, slug: impl Into<String>, log: Option<EventLog>) -> Self {
        Self {
            run_id: run_id.into(),
            slug: slug.into(),
            log,
            state: Mutex::new(BusState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Emit an event. Returns `None` once `run_finished` has gone out: the
    /// stream of a run always ends with exactly one terminal event.
    pub fn emit(&self, kind: RunEventKind) -> Option<RunEvent> {
        let mut state = self.state();
        if state.finished {
            tracing::debug!(
                run_id = %self.run_id,
                event = kind.event_type().as_str(),
                "dropping event emitted after run_finished"
            );
            return None;
        }

        let event = kind.into_event(&self.run_id, &self.slug);
        state.finished = event.is_finished();
        state.backlog.push(event.clone());

        // Closed receivers belong to subscribers that are mid-drop.
        state
            .subscribers
            .retain(|_, tx| tx.send(event.clone()).is_ok());

        if let Some(log) = &self.log {
            if let Err(e) = log.append(&event) {
                tracing::warn!(run_id = %self.run_id, error = %e, "failed to append run event to log");
            }
        }

        Some(event)
    }

    /// Attach a new subscriber. The backlog is replayed into its channel
    /// before it is registered, so late joiners see the full history.
    pub fn subscribe(self: &Arc<Self>) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state();
        for event in &state.backlog {
            let _ = tx.send(event.clone());
        }
        let id = state.next_subscriber;
        state.next_subscriber += 1;
        // No more live events will arrive once the run has finished.
        if !state.finished {
            state.subscribers.insert(id, tx);
        }
        drop(state);

        Subscription {
            id,
            rx,
            bus: Arc::clone(self),
            done: false,
        }
    }

    fn unsubscribe(&self, id: u64) {
        self.state().subscribers.remove(&id);
    }

    #[cfg(test)]
    pub fn backlog(&self) -> Vec<RunEvent> {
        self.state().backlog.clone()
    }

    #[cfg(test)]
    pub fn subscriber_count(&self) -> usize {
        self.state().subscribers.len()
    }

    #[cfg(test)]
    pub fn is_finished(&self) -> bool {
        self.state().finished
    }
}

/// One observer's view of a run. Yields events up to and including
/// `run_finished`, then ends. Dropping it detaches from the bus.
pub struct Subscription {
    id: u64,
    rx: mpsc::UnboundedReceiver<RunEvent>,
    bus: Arc<EventBus>,
    done: bool,
}

impl Subscription {
    pub async fn next(&mut self) -> Option<RunEvent> {
        if self.done {
            return None;
        }
        let event = self.rx.recv().await?;
        if event.is_finished() {
            self.done = true;
            self.bus.unsubscribe(self.id);
        }
        Some(event)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.bus.unsubscribe(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runs::RunStatus;
    use crate::runs::events::{RunEventType, StatusLabel};

    fn finished() -> RunEventKind {
        RunEventKind::RunFinished {
            status: RunStatus::Completed,
            return_code: Some(0),
            last_message: None,
            error: None,
        }
    }

    fn status(status: RunStatus) -> RunEventKind {
        RunEventKind::Status(StatusLabel::Run(status))
    }

    #[tokio::test]
    async fn test_late_subscriber_replays_backlog() {
        let bus = Arc::new(EventBus::new("r1", "racer", None));
        bus.emit(status(RunStatus::Queued));
        bus.emit(RunEventKind::QueuePosition(1));

        let mut sub = bus.subscribe();
        assert_eq!(sub.next().await.unwrap().event_type, RunEventType::Status);
        assert_eq!(sub.next().await.unwrap().event_type, RunEventType::QueuePosition);

        bus.emit(status(RunStatus::Running));
        let live = sub.next().await.unwrap();
        assert_eq!(live.payload["status"], "running");
    }

    #[tokio::test]
    async fn test_subscription_ends_after_run_finished() {
        let bus = Arc::new(EventBus::new("r1", "racer", None));
        let mut sub = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);

        bus.emit(status(RunStatus::Running));
        bus.emit(finished());

        assert!(sub.next().await.is_some());
        assert!(sub.next().await.unwrap().is_finished());
        assert!(sub.next().await.is_none());
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_subscriber_after_finish_sees_history_once() {
        let bus = Arc::new(EventBus::new("r1", "racer", None));
        bus.emit(status(RunStatus::Running));
        bus.emit(finished());

        let mut sub = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 0);

        let mut seen = Vec::new();
        while let Some(event) = sub.next().await {
            seen.push(event.event_type);
        }
        assert_eq!(seen, vec![RunEventType::Status, RunEventType::RunFinished]);
    }

    #[tokio::test]
    async fn test_drop_unregisters() {
        let bus = Arc::new(EventBus::new("r1", "racer", None));
        let sub_a = bus.subscribe();
        let _sub_b = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);
        drop(sub_a);
        assert_eq!(bus.subscriber_count(), 1);
    }

    #[test]
    fn test_nothing_after_run_finished() {
        let bus = EventBus::new("r1", "racer", None);
        assert!(bus.emit(finished()).is_some());
        assert!(bus.is_finished());
        assert!(bus.emit(RunEventKind::MetadataUpdated(crate::runs::events::MetadataTask::Title)).is_none());
        assert_eq!(bus.backlog().len(), 1);
    }

    #[tokio::test]
    async fn test_subscribers_are_independent() {
        let bus = Arc::new(EventBus::new("r1", "racer", None));
        let mut fast = bus.subscribe();
        let slow = bus.subscribe();

        for i in 1..=100 {
            bus.emit(RunEventKind::QueuePosition(i));
        }
        bus.emit(finished());

        let mut count = 0;
        while fast.next().await.is_some() {
            count += 1;
        }
        assert_eq!(count, 101);
        drop(slow);
    }

    #[tokio::test]
    async fn test_log_matches_backlog() {
        let tmp = tempfile::tempdir().unwrap();
        let log = EventLog::for_run(tmp.path(), "r1");
        let bus = Arc::new(EventBus::new("r1", "racer", Some(log.clone())));

        bus.emit(status(RunStatus::Queued));
        bus.emit(RunEventKind::Thinking { text: "plan".into() });
        bus.emit(finished());

        assert_eq!(log.read_all().unwrap(), bus.backlog());
    }
}
