//! Progress events emitted while plans run

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::types::{ItemId, JobId, RunId, RunState, TaskName, TaskState};

/// Observable progress of runs and batches
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CouncilEvent {
    PlanGenerated {
        tasks: Vec<TaskName>,
        rule_derived: bool,
    },
    RunStateChanged {
        run_id: RunId,
        state: RunState,
    },
    TaskStatusChanged {
        run_id: RunId,
        task: TaskName,
        status: TaskState,
    },
    CacheWriteFailed {
        run_id: RunId,
        task: TaskName,
        key: String,
    },
    BatchItemFinished {
        job_id: JobId,
        item_id: ItemId,
        success: bool,
    },
}

/// Sending half handed to planners, executors and coordinators.
///
/// A disabled sink drops everything; a closed receiver is ignored.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<mpsc::UnboundedSender<CouncilEvent>>,
}

impl EventSink {
    /// Create a connected sink and its receiver
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<CouncilEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// A sink that discards events
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn emit(&self, event: CouncilEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.tx.as_ref().is_some_and(|tx| !tx.is_closed())
    }
}
