use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

/// Every durable event type the engine emits, plus the transient `LogChunk`
/// line-level event. Durable variants are always persisted via
/// `Database::append_event` before being published — `LogChunk` is the only
/// type that is never written to the store (SPEC_FULL.md §3, §4.B).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    TaskCreated { task_id: String },
    TaskStarted { task_id: String },
    TaskPaused { task_id: String },
    TaskResumed { task_id: String },
    TaskCompleted { task_id: String },
    TaskFailed { task_id: String, reason: String },
    TaskDeleted { task_id: String },
    ItemStarted { task_id: String, task_item_id: String },
    ItemStatusChanged { task_id: String, task_item_id: String, status: String },
    RunStarted { task_id: String, task_item_id: String, run_id: String, phase: String },
    RunFinished { task_id: String, task_item_id: String, run_id: String, exit_code: Option<i32>, interrupted: bool },
    StepPrehookEvaluated {
        task_id: String,
        task_item_id: String,
        phase: String,
        expression: Option<String>,
        decision: String,
        reason: Option<String>,
    },
    ItemFinalizeEvaluated { task_id: String, task_item_id: String, rule_id: String, status: String, reason: Option<String> },
    AgentHealthChanged { task_id: String, agent_id: String, healthy: bool },
    LogChunk { task_id: String, run_id: String, phase: String, stream: String, line: String },
}

impl Envelope {
    pub fn task_id(&self) -> &str {
        match self {
            Envelope::TaskCreated { task_id }
            | Envelope::TaskStarted { task_id }
            | Envelope::TaskPaused { task_id }
            | Envelope::TaskResumed { task_id }
            | Envelope::TaskCompleted { task_id }
            | Envelope::TaskFailed { task_id, .. }
            | Envelope::TaskDeleted { task_id }
            | Envelope::ItemStarted { task_id, .. }
            | Envelope::ItemStatusChanged { task_id, .. }
            | Envelope::RunStarted { task_id, .. }
            | Envelope::RunFinished { task_id, .. }
            | Envelope::StepPrehookEvaluated { task_id, .. }
            | Envelope::ItemFinalizeEvaluated { task_id, .. }
            | Envelope::AgentHealthChanged { task_id, .. }
            | Envelope::LogChunk { task_id, .. } => task_id,
        }
    }

    /// The owning task-item, when this envelope describes an item-scoped
    /// moment. `None` for task-scoped events (`task_created`, `task_failed`,
    /// `task_deleted`, ...).
    pub fn task_item_id(&self) -> Option<&str> {
        match self {
            Envelope::ItemStarted { task_item_id, .. }
            | Envelope::ItemStatusChanged { task_item_id, .. }
            | Envelope::RunStarted { task_item_id, .. }
            | Envelope::RunFinished { task_item_id, .. }
            | Envelope::StepPrehookEvaluated { task_item_id, .. }
            | Envelope::ItemFinalizeEvaluated { task_item_id, .. } => Some(task_item_id),
            Envelope::LogChunk { .. }
            | Envelope::TaskCreated { .. }
            | Envelope::TaskStarted { .. }
            | Envelope::TaskPaused { .. }
            | Envelope::TaskResumed { .. }
            | Envelope::TaskCompleted { .. }
            | Envelope::TaskFailed { .. }
            | Envelope::TaskDeleted { .. }
            | Envelope::AgentHealthChanged { .. } => None,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Envelope::TaskCreated { .. } => "task_created",
            Envelope::TaskStarted { .. } => "task_started",
            Envelope::TaskPaused { .. } => "task_paused",
            Envelope::TaskResumed { .. } => "task_resumed",
            Envelope::TaskCompleted { .. } => "task_completed",
            Envelope::TaskFailed { .. } => "task_failed",
            Envelope::TaskDeleted { .. } => "task_deleted",
            Envelope::ItemStarted { .. } => "item_started",
            Envelope::ItemStatusChanged { .. } => "item_status_changed",
            Envelope::RunStarted { .. } => "run_started",
            Envelope::RunFinished { .. } => "run_finished",
            Envelope::StepPrehookEvaluated { .. } => "step_prehook_evaluated",
            Envelope::ItemFinalizeEvaluated { .. } => "item_finalize_evaluated",
            Envelope::AgentHealthChanged { .. } => "agent_health_changed",
            Envelope::LogChunk { .. } => "log_chunk",
        }
    }

    pub fn is_durable(&self) -> bool {
        !matches!(self, Envelope::LogChunk { .. })
    }
}

/// Dispatched envelope including the moment it was published, for
/// subscribers that want to reconstruct an `Event` row shape without
/// re-querying the store.
#[derive(Debug, Clone, Serialize)]
pub struct Dispatched {
    pub envelope: Envelope,
    pub ts: DateTime<Utc>,
}

/// In-process multi-producer broadcast bus (SPEC_FULL.md §4.B). Durable
/// events and `log_chunk` events ride on separate channels so a subscriber
/// lagging behind on noisy log output never drops a state-change event — the
/// reference's `AppState::event_tx` is a single channel because it never had
/// a high-volume log stream riding alongside state events; this engine does.
pub struct EventBus {
    durable_tx: broadcast::Sender<Dispatched>,
    log_tx: broadcast::Sender<Dispatched>,
}

/// A subscriber's pair of receivers. Typical usage is a single GUI
/// subscriber draining both with `tokio::select!`.
pub struct Subscription {
    pub durable: broadcast::Receiver<Dispatched>,
    pub log: broadcast::Receiver<Dispatched>,
}

impl EventBus {
    pub fn new() -> Self {
        let (durable_tx, _) = broadcast::channel(1024);
        let (log_tx, _) = broadcast::channel(256);
        Self { durable_tx, log_tx }
    }

    /// Publish an envelope. Callers are responsible for having already
    /// persisted durable envelopes via `Database::append_event` — see
    /// SPEC_FULL.md §4.B's "write-to-store-before-publish" guarantee.
    pub fn publish(&self, envelope: Envelope) {
        let dispatched = Dispatched { envelope, ts: Utc::now() };
        tracing::debug!(event_type = dispatched.envelope.event_type(), "publishing event");
        if dispatched.envelope.is_durable() {
            let _ = self.durable_tx.send(dispatched);
        } else {
            let _ = self.log_tx.send(dispatched);
        }
    }

    pub fn subscribe(&self) -> Subscription {
        Subscription {
            durable: self.durable_tx.subscribe(),
            log: self.log_tx.subscribe(),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Persist a durable envelope as an `Event` row before publishing it on the
/// bus (SPEC_FULL.md §4.B: "overflow on a durable event type must ... the
/// durable copy in the store must already have been written before
/// publish"). `LogChunk` is the only non-durable variant and is published
/// directly via `EventBus::publish` from the log streamer instead.
pub fn record_and_publish(
    db: &crate::db::Database,
    bus: &EventBus,
    envelope: Envelope,
) -> Result<(), crate::db::DbError> {
    let payload = serde_json::to_value(&envelope).unwrap_or(serde_json::Value::Null);
    db.append_event(&crate::db::events::AppendEventParams {
        task_id: envelope.task_id().to_string(),
        task_item_id: envelope.task_item_id().map(|s| s.to_string()),
        event_type: envelope.event_type().to_string(),
        payload,
    })?;
    bus.publish(envelope);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_and_receive_durable_event() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe();

        bus.publish(Envelope::TaskCreated { task_id: "t1".into() });

        let received = sub.durable.try_recv().unwrap();
        assert_eq!(received.envelope.event_type(), "task_created");
        assert_eq!(received.envelope.task_id(), "t1");
    }

    #[test]
    fn log_chunk_rides_separate_channel() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe();

        bus.publish(Envelope::LogChunk {
            task_id: "t1".into(),
            run_id: "r1".into(),
            phase: "qa".into(),
            stream: "stdout".into(),
            line: "ok".into(),
        });

        assert!(sub.durable.try_recv().is_err());
        let received = sub.log.try_recv().unwrap();
        assert_eq!(received.envelope.event_type(), "log_chunk");
    }

    #[test]
    fn multiple_subscribers_each_receive() {
        let bus = EventBus::new();
        let mut sub1 = bus.subscribe();
        let mut sub2 = bus.subscribe();

        bus.publish(Envelope::TaskStarted { task_id: "t1".into() });

        assert!(sub1.durable.try_recv().is_ok());
        assert!(sub2.durable.try_recv().is_ok());
    }
}
