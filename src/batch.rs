//! Batch coordinator - runs many independent analyses under a concurrency cap

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use futures::stream::FuturesUnordered;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

use crate::config::BatchConfig;
use crate::events::{CouncilEvent, EventSink};
use crate::orchestrator::{Analysis, Orchestrator};
use crate::types::{ItemId, JobId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchItem {
    pub id: ItemId,
    pub query: String,
}

impl BatchItem {
    pub fn new(id: impl Into<ItemId>, query: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            query: query.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Success,
    Error,
}

/// Terminal result of one batch item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemOutcome {
    pub status: ItemStatus,
    pub analysis: Option<Analysis>,
    pub error: Option<String>,
    pub elapsed_ms: u64,
}

impl ItemOutcome {
    fn success(analysis: Analysis) -> Self {
        Self {
            status: ItemStatus::Success,
            analysis: Some(analysis),
            error: None,
            elapsed_ms: 0,
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            status: ItemStatus::Error,
            analysis: None,
            error: Some(message.into()),
            elapsed_ms: 0,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ItemStatus::Success
    }
}

/// Outcomes of a whole batch, keyed by item id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    pub job_id: JobId,
    pub outcomes: HashMap<ItemId, ItemOutcome>,
    /// Concurrency limit actually applied, after clamping 0 to 1
    pub max_concurrency: usize,
    /// Most pipelines observed running at the same time
    pub peak_concurrency: usize,
}

impl BatchReport {
    pub fn get(&self, id: &ItemId) -> Option<&ItemOutcome> {
        self.outcomes.get(id)
    }

    pub fn succeeded(&self) -> usize {
        self.outcomes.values().filter(|o| o.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.succeeded()
    }

    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }
}

/// Tracks how many items hold a slot at once
#[derive(Default)]
struct Occupancy {
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl Occupancy {
    fn enter(&self) {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn leave(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

/// Aborts the spawned pipeline when dropped, so cancelling `run_batch`
/// stops in-flight items instead of detaching them
struct PipelineGuard<T>(JoinHandle<T>);

impl<T> Drop for PipelineGuard<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

pub struct BatchCoordinator {
    orchestrator: Arc<Orchestrator>,
    config: BatchConfig,
    events: EventSink,
}

impl BatchCoordinator {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            orchestrator,
            config: BatchConfig::default(),
            events: EventSink::disabled(),
        }
    }

    pub fn with_config(mut self, config: BatchConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    /// Run with the configured concurrency cap
    pub async fn run(&self, items: Vec<BatchItem>) -> BatchReport {
        self.run_batch(items, self.config.max_concurrency).await
    }

    /// Run every item through plan and execute, at most `max_concurrency` at
    /// a time. Returns once every item is terminal.
    #[instrument(skip(self, items), fields(items = items.len()))]
    pub async fn run_batch(&self, items: Vec<BatchItem>, max_concurrency: usize) -> BatchReport {
        let job_id = JobId::new();
        let limit = max_concurrency.max(1);
        let item_timeout = self.config.item_timeout();
        let sem = Arc::new(Semaphore::new(limit));
        let occupancy = Arc::new(Occupancy::default());

        info!(job_id = %job_id, limit, "Starting batch");

        let mut seen = HashSet::new();
        let mut futs: FuturesUnordered<_> = FuturesUnordered::new();

        for item in items {
            if !seen.insert(item.id.clone()) {
                warn!(job_id = %job_id, item_id = %item.id, "Duplicate item id skipped");
                continue;
            }

            let sem = sem.clone();
            let occupancy = occupancy.clone();
            let orchestrator = self.orchestrator.clone();

            futs.push(async move {
                let Ok(_permit) = sem.acquire_owned().await else {
                    return (item.id, ItemOutcome::error("semaphore closed unexpectedly"));
                };
                occupancy.enter();
                let started = Instant::now();

                let query = item.query;
                let mut pipeline =
                    PipelineGuard(tokio::spawn(async move { orchestrator.analyze(&query).await }));

                let mut outcome = match tokio::time::timeout(item_timeout, &mut pipeline.0).await {
                    Ok(Ok(Ok(analysis))) => ItemOutcome::success(analysis),
                    Ok(Ok(Err(e))) => ItemOutcome::error(e.to_string()),
                    Ok(Err(join_err)) => ItemOutcome::error(format!("item aborted: {join_err}")),
                    Err(_) => {
                        pipeline.0.abort();
                        ItemOutcome::error(format!(
                            "timed out after {}s",
                            item_timeout.as_secs()
                        ))
                    }
                };
                outcome.elapsed_ms = started.elapsed().as_millis() as u64;

                occupancy.leave();
                (item.id, outcome)
            });
        }

        let mut outcomes = HashMap::new();
        while let Some((item_id, outcome)) = futs.next().await {
            match &outcome.error {
                Some(error) => warn!(job_id = %job_id, item_id = %item_id, error = %error, "Batch item failed"),
                None => info!(job_id = %job_id, item_id = %item_id, elapsed_ms = outcome.elapsed_ms, "Batch item done"),
            }
            self.events.emit(CouncilEvent::BatchItemFinished {
                job_id,
                item_id: item_id.clone(),
                success: outcome.is_success(),
            });
            outcomes.insert(item_id, outcome);
        }

        let report = BatchReport {
            job_id,
            outcomes,
            max_concurrency: limit,
            peak_concurrency: occupancy.peak(),
        };
        info!(
            job_id = %job_id,
            succeeded = report.succeeded(),
            failed = report.failed(),
            peak = report.peak_concurrency,
            "Batch finished"
        );
        report
    }
}
