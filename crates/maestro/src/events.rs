use chrono::{DateTime, Utc};
use dashmap::DashMap;
use db::models::{
    activity::{ActivityRecord, ActivityStatus},
    run::{Run, RunStage, RunStatus},
    work_item::{WorkItem, WorkItemStatus},
};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use ts_rs::TS;
use uuid::Uuid;

use crate::metrics;

const CHANNEL_CAPACITY: usize = 1000;

/// Everything observers can learn about a run while it executes. Events
/// are transient: they are broadcast to live subscribers and never
/// replayed, so the durable record stays in the database.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[serde(tag = "type", rename_all = "snake_case")]
#[ts(export)]
pub enum RunEvent {
    RunCreated {
        run_id: Uuid,
        project_name: String,
        timestamp: DateTime<Utc>,
    },
    StageChanged {
        run_id: Uuid,
        stage: RunStage,
        timestamp: DateTime<Utc>,
    },
    AgentActivity {
        run_id: Uuid,
        work_item_id: Option<Uuid>,
        agent: String,
        action: String,
        status: ActivityStatus,
        error: Option<String>,
        timestamp: DateTime<Utc>,
    },
    WorkItemUpdated {
        run_id: Uuid,
        work_item_id: Uuid,
        status: WorkItemStatus,
        attempts: i64,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "run_status")]
    RunStatusChanged {
        run_id: Uuid,
        status: RunStatus,
        failed_items: i64,
        error: Option<String>,
        timestamp: DateTime<Utc>,
    },
}

impl RunEvent {
    pub fn run_id(&self) -> Uuid {
        match self {
            RunEvent::RunCreated { run_id, .. }
            | RunEvent::StageChanged { run_id, .. }
            | RunEvent::AgentActivity { run_id, .. }
            | RunEvent::WorkItemUpdated { run_id, .. }
            | RunEvent::RunStatusChanged { run_id, .. } => *run_id,
        }
    }
}

/// Best-effort broadcaster keyed by run id, plus a firehose channel
/// carrying every event. Publishing never blocks run execution: with no
/// subscribers an event is simply dropped, and a slow subscriber that
/// overflows its buffer loses the oldest events, not the run.
#[derive(Debug)]
pub struct EventHub {
    channels: DashMap<Uuid, broadcast::Sender<RunEvent>>,
    firehose: broadcast::Sender<RunEvent>,
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHub {
    pub fn new() -> Self {
        let (firehose, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            channels: DashMap::new(),
            firehose,
        }
    }

    /// Subscribe to a single run. Events published before this call are
    /// not replayed.
    pub fn subscribe(&self, run_id: Uuid) -> broadcast::Receiver<RunEvent> {
        self.channels
            .entry(run_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Subscribe to every run, including ones created after this call.
    pub fn subscribe_all(&self) -> broadcast::Receiver<RunEvent> {
        self.firehose.subscribe()
    }

    pub fn publish(&self, event: RunEvent) {
        metrics::record_event_published();
        // send only errors when no receiver exists, which is fine here
        let _ = self.firehose.send(event.clone());
        if let Some(sender) = self.channels.get(&event.run_id()) {
            let _ = sender.send(event);
        }
    }

    /// Drop the per-run channel once nobody is listening. Safe to call
    /// at any time; a channel with live subscribers is left alone.
    pub fn prune(&self, run_id: Uuid) {
        self.channels
            .remove_if(&run_id, |_, sender| sender.receiver_count() == 0);
    }

    pub fn subscriber_count(&self, run_id: Uuid) -> usize {
        self.channels
            .get(&run_id)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn run_created(&self, run: &Run) {
        self.publish(RunEvent::RunCreated {
            run_id: run.id,
            project_name: run.project_name.clone(),
            timestamp: Utc::now(),
        });
    }

    pub fn stage_changed(&self, run_id: Uuid, stage: RunStage) {
        self.publish(RunEvent::StageChanged {
            run_id,
            stage,
            timestamp: Utc::now(),
        });
    }

    pub fn agent_activity(&self, record: &ActivityRecord) {
        self.publish(RunEvent::AgentActivity {
            run_id: record.run_id,
            work_item_id: record.work_item_id,
            agent: record.agent.clone(),
            action: record.action.clone(),
            status: record.status,
            error: record.error.clone(),
            timestamp: Utc::now(),
        });
    }

    pub fn work_item_updated(&self, item: &WorkItem) {
        self.publish(RunEvent::WorkItemUpdated {
            run_id: item.run_id,
            work_item_id: item.id,
            status: item.status,
            attempts: item.attempts,
            timestamp: Utc::now(),
        });
    }

    pub fn run_status(&self, run: &Run) {
        self.publish(RunEvent::RunStatusChanged {
            run_id: run.id,
            status: run.status,
            failed_items: run.failed_items,
            error: run.error.clone(),
            timestamp: Utc::now(),
        });
    }
}
