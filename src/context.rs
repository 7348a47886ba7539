//! Per-run state: task outcomes and the accumulated context log

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::extractor::StructuredRecord;
use crate::services::ServiceErrorKind;
use crate::types::{RunId, RunState, TaskName, TaskState};

/// One committed line of the accumulated context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ContextEntry {
    Summary { task: TaskName, text: String },
    Failure { task: TaskName, marker: String },
}

impl ContextEntry {
    pub fn task(&self) -> TaskName {
        match self {
            Self::Summary { task, .. } | Self::Failure { task, .. } => *task,
        }
    }

    pub fn render(&self) -> String {
        match self {
            Self::Summary { task, text } => format!("{task}: {text}"),
            Self::Failure { task, marker } => format!("[error] {task}: {marker}"),
        }
    }
}

/// Append-only, totally ordered log of per-task findings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AccumulatedContext {
    entries: Vec<ContextEntry>,
}

impl AccumulatedContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry. Each task contributes at most one entry; a second
    /// append for the same task is refused.
    pub fn append(&mut self, entry: ContextEntry) -> bool {
        if self.contains(entry.task()) {
            return false;
        }
        self.entries.push(entry);
        true
    }

    pub fn contains(&self, task: TaskName) -> bool {
        self.entries.iter().any(|e| e.task() == task)
    }

    pub fn entries(&self) -> &[ContextEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Immutable copy of everything committed so far
    pub fn snapshot(&self) -> ContextSnapshot {
        ContextSnapshot {
            entries: Arc::from(self.entries.as_slice()),
        }
    }

    pub fn render(&self) -> String {
        render_entries(&self.entries)
    }
}

/// Frozen prefix of the accumulated context handed to a running task
#[derive(Debug, Clone)]
pub struct ContextSnapshot {
    entries: Arc<[ContextEntry]>,
}

impl ContextSnapshot {
    pub fn entries(&self) -> &[ContextEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn render(&self) -> String {
        render_entries(&self.entries)
    }
}

fn render_entries(entries: &[ContextEntry]) -> String {
    entries
        .iter()
        .map(ContextEntry::render)
        .collect::<Vec<_>>()
        .join("\n")
}

/// Why a task ended in `Failed`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub kind: ServiceErrorKind,
    pub detail: String,
}

/// Result of one task within a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub task: TaskName,
    pub status: TaskState,
    pub record: Option<StructuredRecord>,
    pub summary: String,
    pub failure: Option<TaskFailure>,
    pub from_cache: bool,
    /// Size of the context prefix visible when the task started
    pub context_seen: usize,
    pub elapsed_ms: u64,
}

impl TaskOutcome {
    pub fn done(task: TaskName, record: StructuredRecord, summary: String) -> Self {
        Self {
            task,
            status: TaskState::Done,
            record: Some(record),
            summary,
            failure: None,
            from_cache: false,
            context_seen: 0,
            elapsed_ms: 0,
        }
    }

    pub fn failed(task: TaskName, kind: ServiceErrorKind, detail: impl Into<String>) -> Self {
        Self {
            task,
            status: TaskState::Failed,
            record: None,
            summary: String::new(),
            failure: Some(TaskFailure {
                kind,
                detail: detail.into(),
            }),
            from_cache: false,
            context_seen: 0,
            elapsed_ms: 0,
        }
    }

    pub fn is_done(&self) -> bool {
        self.status == TaskState::Done
    }

    /// The context line this outcome contributes
    pub fn context_entry(&self) -> ContextEntry {
        match &self.failure {
            Some(failure) => ContextEntry::Failure {
                task: self.task,
                marker: failure.kind.marker().to_string(),
            },
            None => ContextEntry::Summary {
                task: self.task,
                text: self.summary.clone(),
            },
        }
    }
}

/// Everything one executor run produced
///
/// Owned by exactly one run and handed to the caller when the run completes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SharedState {
    pub run_id: RunId,
    pub query: String,
    pub run_state: RunState,
    /// Task order as executed
    pub order: Vec<TaskName>,
    results: BTreeMap<TaskName, TaskOutcome>,
    context: AccumulatedContext,
}

impl SharedState {
    pub fn new(run_id: RunId, query: impl Into<String>) -> Self {
        Self {
            run_id,
            query: query.into(),
            run_state: RunState::Building,
            order: Vec::new(),
            results: BTreeMap::new(),
            context: AccumulatedContext::new(),
        }
    }

    /// Store an outcome and append its context entry exactly once
    pub fn commit(&mut self, outcome: TaskOutcome) {
        let entry = outcome.context_entry();
        self.context.append(entry);
        self.order.push(outcome.task);
        self.results.insert(outcome.task, outcome);
    }

    pub fn get(&self, task: TaskName) -> Option<&TaskOutcome> {
        self.results.get(&task)
    }

    pub fn results(&self) -> impl Iterator<Item = &TaskOutcome> {
        self.results.values()
    }

    pub fn status(&self, task: TaskName) -> Option<TaskState> {
        self.results.get(&task).map(|o| o.status)
    }

    pub fn context(&self) -> &AccumulatedContext {
        &self.context
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn failed_tasks(&self) -> Vec<TaskName> {
        self.results
            .values()
            .filter(|o| o.status == TaskState::Failed)
            .map(|o| o.task)
            .collect()
    }
}
