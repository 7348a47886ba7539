//! Task graph executor
//!
//! Runs the tasks of one plan against the external collaborators, accumulating
//! each task's findings into a context log that later tasks read. Individual
//! task failures are recorded on the run state and never abort the run; only a
//! structurally broken graph does.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use futures::stream::FuturesUnordered;
use futures::StreamExt;
use parking_lot::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::cache::ResultCache;
use crate::config::{ExecutionMode, ExecutorConfig};
use crate::context::{ContextSnapshot, SharedState, TaskOutcome};
use crate::error::CouncilError;
use crate::events::{CouncilEvent, EventSink};
use crate::extractor::{StructuredExtractor, StructuredRecord};
use crate::graph::{TaskGraph, TaskSpec};
use crate::planner::Plan;
use crate::services::{RetrievalService, ServiceErrorKind, TextGenerationService};
use crate::task::{AnalysisTask, TaskRegistry};
use crate::types::{RunId, RunState, TaskName, TaskState};

/// Retrieval results memoized for the lifetime of one run
#[derive(Default)]
struct RetrievalMemo {
    chunks: Mutex<HashMap<(String, usize), String>>,
}

impl RetrievalMemo {
    async fn fetch(&self, retrieval: &dyn RetrievalService, query: &str, top_k: usize) -> String {
        let key = (query.to_string(), top_k);
        let cached = self.chunks.lock().get(&key).cloned();
        if let Some(hit) = cached {
            return hit;
        }

        match retrieval.retrieve(query, top_k).await {
            Ok(chunks) => {
                let joined = chunks.join("\n\n");
                self.chunks.lock().insert(key, joined.clone());
                joined
            }
            Err(e) => {
                warn!(error = %e, "Retrieval failed, continuing without document context");
                String::new()
            }
        }
    }
}

/// Drives analysis tasks over a dependency graph
pub struct Executor {
    generation: Arc<dyn TextGenerationService>,
    retrieval: Arc<dyn RetrievalService>,
    extractor: StructuredExtractor,
    registry: TaskRegistry,
    cache: Option<Arc<ResultCache>>,
    config: ExecutorConfig,
    events: EventSink,
}

impl Executor {
    pub fn new(
        generation: Arc<dyn TextGenerationService>,
        retrieval: Arc<dyn RetrievalService>,
    ) -> Self {
        Self {
            extractor: StructuredExtractor::new(Arc::clone(&generation)),
            generation,
            retrieval,
            registry: TaskRegistry::with_defaults(),
            cache: None,
            config: ExecutorConfig::default(),
            events: EventSink::disabled(),
        }
    }

    pub fn with_registry(mut self, registry: TaskRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_cache(mut self, cache: Arc<ResultCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Run a plan with its default linear dependency chain
    pub async fn execute(&self, plan: &Plan, query: &str) -> Result<SharedState, CouncilError> {
        self.execute_specs(&plan.task_specs(), query).await
    }

    /// Run explicitly declared task dependencies
    #[instrument(skip(self, specs), fields(tasks = specs.len()))]
    pub async fn execute_specs(
        &self,
        specs: &[TaskSpec],
        query: &str,
    ) -> Result<SharedState, CouncilError> {
        let run_id = RunId::new();
        let mut state = SharedState::new(run_id, query);
        self.transition(&mut state, RunState::Building);

        if specs.is_empty() {
            return Err(CouncilError::Validation("no tasks to execute".into()));
        }
        if let Some(missing) = specs.iter().find(|s| !self.registry.contains(s.name)) {
            return Err(CouncilError::Validation(format!(
                "no analysis task registered for {}",
                missing.name
            )));
        }

        let mut graph = TaskGraph::build(specs)?;
        let groups = match self.config.mode {
            ExecutionMode::Sequential => graph
                .topological_order()
                .into_iter()
                .map(|name| vec![name])
                .collect(),
            ExecutionMode::Concurrent => graph.stages(),
        };

        self.transition(&mut state, RunState::Executing);
        let memo = RetrievalMemo::default();

        for group in groups {
            self.run_group(&group, query, &mut graph, &mut state, &memo).await;
        }

        self.transition(&mut state, RunState::Complete);
        info!(
            run_id = %run_id,
            done = state.len() - state.failed_tasks().len(),
            failed = state.failed_tasks().len(),
            "Run complete"
        );
        Ok(state)
    }

    fn transition(&self, state: &mut SharedState, run_state: RunState) {
        state.run_state = run_state;
        debug!(run_id = %state.run_id, state = ?run_state, "Run state changed");
        self.events.emit(CouncilEvent::RunStateChanged {
            run_id: state.run_id,
            state: run_state,
        });
    }

    fn mark(&self, run_id: RunId, graph: &mut TaskGraph, task: TaskName, status: TaskState) {
        graph.set_state(task, status);
        self.events.emit(CouncilEvent::TaskStatusChanged {
            run_id,
            task,
            status,
        });
    }

    /// Run one group of mutually independent tasks. Every member sees the
    /// context committed before the group started; outcomes are committed in
    /// completion order.
    async fn run_group(
        &self,
        group: &[TaskName],
        query: &str,
        graph: &mut TaskGraph,
        state: &mut SharedState,
        memo: &RetrievalMemo,
    ) {
        let run_id = state.run_id;
        let snapshot = state.context().snapshot();

        let mut pending = FuturesUnordered::new();
        for name in group {
            let Some(task) = self.registry.get(*name) else {
                continue;
            };
            self.mark(run_id, graph, *name, TaskState::Running);
            let snapshot = snapshot.clone();
            pending.push(async move { self.run_task(run_id, task, query, snapshot, memo).await });
        }

        while let Some(outcome) = pending.next().await {
            self.mark(run_id, graph, outcome.task, outcome.status);
            state.commit(outcome);
        }
    }

    async fn run_task(
        &self,
        run_id: RunId,
        task: Arc<dyn AnalysisTask>,
        query: &str,
        snapshot: ContextSnapshot,
        memo: &RetrievalMemo,
    ) -> TaskOutcome {
        let name = task.name();
        let started = Instant::now();
        let deadline = self.config.task_timeout();

        let work = self.perform(task.as_ref(), query, &snapshot, memo);
        let mut outcome = match tokio::time::timeout(deadline, work).await {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(task = %name, timeout_secs = self.config.task_timeout_secs, "Task timed out");
                TaskOutcome::failed(
                    name,
                    ServiceErrorKind::Timeout,
                    format!("{name} did not finish within {}s", self.config.task_timeout_secs),
                )
            }
        };
        outcome.context_seen = snapshot.len();
        outcome.elapsed_ms = started.elapsed().as_millis() as u64;

        match &outcome.failure {
            Some(failure) => warn!(task = %name, kind = %failure.kind, "Task failed"),
            None => info!(task = %name, elapsed_ms = outcome.elapsed_ms, "Task done"),
        }

        if outcome.is_done() && !outcome.from_cache {
            if let Some(record) = &outcome.record {
                self.write_through(run_id, query, name, record).await;
            }
        }
        outcome
    }

    async fn perform(
        &self,
        task: &dyn AnalysisTask,
        query: &str,
        snapshot: &ContextSnapshot,
        memo: &RetrievalMemo,
    ) -> TaskOutcome {
        let name = task.name();

        if self.config.reuse_cached {
            if let Some(cache) = &self.cache {
                if let Some(record) = cache.get_exact(query, name).await {
                    if record.is_success() {
                        debug!(task = %name, "Serving task from cache");
                        let summary = record.summary(self.config.summary_chars);
                        let mut outcome = TaskOutcome::done(name, record, summary);
                        outcome.from_cache = true;
                        return outcome;
                    }
                }
            }
        }

        let retrieved = memo
            .fetch(
                self.retrieval.as_ref(),
                &task.retrieval_query(query),
                self.config.retrieval_top_k,
            )
            .await;
        let context = task.frame_context(&retrieved, &snapshot.render());

        match task.schema() {
            Some(schema_id) => {
                let record = self.extractor.extract(schema_id, &context, query).await;
                match record.error_kind() {
                    Some(kind) => {
                        let mut outcome = TaskOutcome::failed(name, kind, record.raw_text());
                        outcome.record = Some(record);
                        outcome
                    }
                    None => {
                        let summary = record.summary(self.config.summary_chars);
                        TaskOutcome::done(name, record, summary)
                    }
                }
            }
            None => match self.generation.generate(&task.prompt(&context, query), None).await {
                Ok(text) => {
                    let record = StructuredRecord::narrative(text);
                    let summary = record.summary(self.config.summary_chars);
                    TaskOutcome::done(name, record, summary)
                }
                Err(e) => TaskOutcome::failed(name, e.kind(), e.to_string()),
            },
        }
    }

    async fn write_through(&self, run_id: RunId, query: &str, task: TaskName, record: &StructuredRecord) {
        let Some(cache) = &self.cache else {
            return;
        };
        let deadline = self.config.task_timeout();
        let (key, stored) = match tokio::time::timeout(deadline, cache.put(query, task, record)).await {
            Ok(put) => (put.key, put.stored),
            Err(_) => {
                warn!(task = %task, timeout_secs = self.config.task_timeout_secs, "Cache write-through timed out");
                (cache.key_for(query, task), false)
            }
        };
        if !stored {
            warn!(task = %task, key = %key, "Cache write-through failed");
            self.events.emit(CouncilEvent::CacheWriteFailed { run_id, task, key });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CacheConfig, CacheEpoch};
    use crate::extractor::{RecordStatus, SchemaId};
    use crate::index::InMemoryIndex;
    use crate::planner::PlanOrigin;
    use crate::services::ServiceError;
    use crate::task::DomainTask;
    use crate::test_support::{
        canned_response, schema_name, BrokenIndex, HangingIndex, ScriptedGeneration,
        StaticRetrieval,
    };
    use std::time::Duration;
    use TaskName::*;

    fn canonical_plan() -> Plan {
        Plan::canonical("test", PlanOrigin::Model)
    }

    fn finance_prompt_of(generation: &ScriptedGeneration) -> Option<String> {
        generation
            .calls()
            .into_iter()
            .find(|c| c.schema.as_deref() == Some("financial-risk"))
            .map(|c| c.prompt)
    }

    fn operations_prompt_of(generation: &ScriptedGeneration) -> Option<String> {
        generation
            .calls()
            .into_iter()
            .find(|c| c.schema.is_none() && c.prompt.contains("Operations Analyst"))
            .map(|c| c.prompt)
    }

    #[tokio::test]
    async fn test_sequential_run_accumulates_context() {
        let generation = ScriptedGeneration::canned();
        let retrieval = StaticRetrieval::new(&["Section 4: payment due net 30."]);
        let executor = Executor::new(generation.clone(), retrieval.clone());

        let state = executor.execute(&canonical_plan(), "Review the contract").await.unwrap();

        assert_eq!(state.run_state, RunState::Complete);
        assert_eq!(state.order, TaskName::CANONICAL.to_vec());
        assert!(state.results().all(|o| o.status == TaskState::Done));
        assert_eq!(state.context().len(), 4);

        let seen: Vec<usize> = TaskName::CANONICAL
            .iter()
            .map(|t| state.get(*t).unwrap().context_seen)
            .collect();
        assert_eq!(seen, vec![0, 1, 2, 3]);

        let finance_prompt = finance_prompt_of(&generation).unwrap();
        assert!(finance_prompt.contains("Section 4: payment due net 30."));
        assert!(finance_prompt.contains("Previous findings:\nlegal: "));
        assert!(finance_prompt.contains("compliance: "));

        let operations = state.get(Operations).unwrap();
        assert_eq!(
            operations.record.as_ref().unwrap().schema_id(),
            SchemaId::Narrative
        );
        assert_eq!(retrieval.call_count(), 1);
    }

    #[tokio::test]
    async fn test_failed_task_does_not_stop_chain() {
        let generation = ScriptedGeneration::new(|prompt, schema| match schema_name(schema) {
            Some("financial-risk") => Err(ServiceError::Timeout),
            _ => canned_response(prompt, schema),
        });
        let executor = Executor::new(generation.clone(), StaticRetrieval::new(&["ctx"]));

        let state = executor
            .execute(&canonical_plan(), "Analyze payment terms")
            .await
            .unwrap();

        let finance = state.get(Finance).unwrap();
        assert_eq!(finance.status, TaskState::Failed);
        assert_eq!(finance.failure.as_ref().unwrap().kind, ServiceErrorKind::Timeout);
        assert_eq!(
            finance.record.as_ref().unwrap().status(),
            RecordStatus::Error
        );
        assert_eq!(state.status(Operations), Some(TaskState::Done));

        let operations_prompt = operations_prompt_of(&generation).unwrap();
        assert!(operations_prompt.contains("finance: timeout"));
        assert!(!operations_prompt.contains("finance: {"));
        assert!(state.context().render().contains("[error] finance: timeout"));
    }

    #[tokio::test]
    async fn test_hung_task_times_out() {
        let generation = ScriptedGeneration::with_delay(canned_response, |_, schema| {
            (schema_name(schema) == Some("financial-risk")).then(|| Duration::from_secs(30))
        });
        let config = ExecutorConfig {
            task_timeout_secs: 1,
            ..Default::default()
        };
        let executor = Executor::new(generation.clone(), StaticRetrieval::new(&["ctx"]))
            .with_config(config);

        let plan = Plan::new(vec![Finance, Operations], "", PlanOrigin::Model).unwrap();
        let state = executor.execute(&plan, "Analyze payment terms").await.unwrap();

        assert_eq!(state.status(Finance), Some(TaskState::Failed));
        assert_eq!(
            state.get(Finance).unwrap().failure.as_ref().unwrap().kind,
            ServiceErrorKind::Timeout
        );
        assert_eq!(state.status(Operations), Some(TaskState::Done));
        assert!(operations_prompt_of(&generation).unwrap().contains("finance: timeout"));
    }

    #[tokio::test]
    async fn test_concurrent_group_sees_only_prior_context() {
        let generation = ScriptedGeneration::with_delay(canned_response, |_, schema| {
            match schema_name(schema) {
                Some("clause-extraction") => Some(Duration::from_millis(80)),
                Some("compliance-risk") => Some(Duration::from_millis(10)),
                Some("financial-risk") => Some(Duration::from_millis(40)),
                _ => None,
            }
        });
        let config = ExecutorConfig {
            mode: ExecutionMode::Concurrent,
            ..Default::default()
        };
        let executor = Executor::new(generation.clone(), StaticRetrieval::new(&["ctx"]))
            .with_config(config);

        let specs = vec![
            TaskSpec::independent(Legal),
            TaskSpec::independent(Compliance),
            TaskSpec::independent(Finance),
            TaskSpec::new(Operations, [Legal, Compliance, Finance]),
        ];
        let state = executor.execute_specs(&specs, "Full review").await.unwrap();

        for task in [Legal, Compliance, Finance] {
            assert_eq!(state.get(task).unwrap().context_seen, 0, "{task}");
        }
        assert_eq!(state.get(Operations).unwrap().context_seen, 3);
        assert_eq!(generation.peak_in_flight(), 3);

        for call in generation.calls().iter().filter(|c| c.schema.is_some()) {
            assert!(!call.prompt.contains("Previous findings"));
        }
        let operations_prompt = operations_prompt_of(&generation).unwrap();
        for task in ["legal: ", "compliance: ", "finance: "] {
            assert!(operations_prompt.contains(task));
        }

        assert_eq!(state.order, vec![Compliance, Finance, Legal, Operations]);
        let committed: Vec<TaskName> = state.context().entries().iter().map(|e| e.task()).collect();
        assert_eq!(committed, state.order);
    }

    #[tokio::test]
    async fn test_concurrent_mode_defaults_to_chain() {
        let generation = ScriptedGeneration::canned();
        let config = ExecutorConfig {
            mode: ExecutionMode::Concurrent,
            ..Default::default()
        };
        let executor = Executor::new(generation.clone(), StaticRetrieval::new(&[]))
            .with_config(config);

        let state = executor.execute(&canonical_plan(), "q").await.unwrap();
        assert_eq!(generation.peak_in_flight(), 1);
        assert_eq!(state.get(Operations).unwrap().context_seen, 3);
    }

    #[tokio::test]
    async fn test_cycle_aborts_before_any_call() {
        let generation = ScriptedGeneration::canned();
        let executor = Executor::new(generation.clone(), StaticRetrieval::new(&[]));

        let specs = vec![TaskSpec::new(Legal, [Finance]), TaskSpec::new(Finance, [Legal])];
        let err = executor.execute_specs(&specs, "q").await.unwrap_err();

        assert!(matches!(err, CouncilError::CyclicDependency(_)));
        assert!(err.is_structural());
        assert!(generation.calls().is_empty());
    }

    #[tokio::test]
    async fn test_unregistered_task_is_validation_error() {
        let mut registry = TaskRegistry::new();
        registry.register(Arc::new(DomainTask::structured(Legal)));
        let executor = Executor::new(ScriptedGeneration::canned(), StaticRetrieval::new(&[]))
            .with_registry(registry);

        let err = executor.execute(&canonical_plan(), "q").await.unwrap_err();
        assert!(matches!(err, CouncilError::Validation(_)));
    }

    #[tokio::test]
    async fn test_degraded_extraction_still_done() {
        let generation = ScriptedGeneration::new(|prompt, schema| match schema_name(schema) {
            Some("compliance-risk") => Ok("Compliance looks fine overall.".to_string()),
            _ => canned_response(prompt, schema),
        });
        let executor = Executor::new(generation, StaticRetrieval::new(&[]));

        let state = executor.execute(&canonical_plan(), "q").await.unwrap();
        let compliance = state.get(Compliance).unwrap();

        assert_eq!(compliance.status, TaskState::Done);
        assert_eq!(
            compliance.record.as_ref().unwrap().status(),
            RecordStatus::Degraded
        );
        assert_eq!(compliance.summary, "Compliance looks fine overall.");
    }

    #[tokio::test]
    async fn test_retrieval_failure_is_absorbed() {
        let retrieval = StaticRetrieval::failing();
        let executor = Executor::new(ScriptedGeneration::canned(), retrieval.clone());

        let state = executor.execute(&canonical_plan(), "q").await.unwrap();
        assert!(state.results().all(|o| o.is_done()));
        assert_eq!(retrieval.call_count(), 4);
    }

    #[tokio::test]
    async fn test_write_through_and_reuse() {
        let index = Arc::new(InMemoryIndex::new());
        let cache = Arc::new(ResultCache::new(
            index.clone(),
            CacheConfig {
                epoch: CacheEpoch::Fixed("e".into()),
                ..Default::default()
            },
        ));

        let first = Executor::new(ScriptedGeneration::canned(), StaticRetrieval::new(&[]))
            .with_cache(cache.clone());
        first.execute(&canonical_plan(), "Analyze payment terms").await.unwrap();

        assert_eq!(index.len(), 4);
        let cached = cache.get_exact("Analyze payment terms", Finance).await.unwrap();
        assert_eq!(cached.schema_id(), SchemaId::FinancialRisk);

        let generation = ScriptedGeneration::canned();
        let second = Executor::new(generation.clone(), StaticRetrieval::new(&[]))
            .with_cache(cache)
            .with_config(ExecutorConfig {
                reuse_cached: true,
                ..Default::default()
            });
        let state = second.execute(&canonical_plan(), "analyze  payment terms").await.unwrap();

        assert!(state.results().all(|o| o.from_cache));
        assert!(generation.calls().is_empty());
    }

    #[tokio::test]
    async fn test_cache_failures_do_not_fail_tasks() {
        let cache = Arc::new(ResultCache::new(Arc::new(BrokenIndex), CacheConfig::default()));
        let (events, mut rx) = EventSink::channel();
        let executor = Executor::new(ScriptedGeneration::canned(), StaticRetrieval::new(&[]))
            .with_cache(cache)
            .with_events(events);

        let state = executor.execute(&canonical_plan(), "q").await.unwrap();
        assert!(state.results().all(|o| o.is_done()));

        let mut cache_failures = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, CouncilEvent::CacheWriteFailed { .. }) {
                cache_failures += 1;
            }
        }
        assert_eq!(cache_failures, 4);
    }

    #[tokio::test]
    async fn test_hanging_cache_write_is_bounded() {
        let cache = Arc::new(ResultCache::new(Arc::new(HangingIndex), CacheConfig::default()));
        let (events, mut rx) = EventSink::channel();
        let executor = Executor::new(ScriptedGeneration::canned(), StaticRetrieval::new(&[]))
            .with_cache(cache)
            .with_events(events)
            .with_config(ExecutorConfig {
                task_timeout_secs: 1,
                ..Default::default()
            });

        let plan = Plan::new(vec![Legal], "", PlanOrigin::Model).unwrap();
        let state = tokio::time::timeout(Duration::from_secs(4), executor.execute(&plan, "q"))
            .await
            .expect("run must not hang on the cache")
            .unwrap();

        assert_eq!(state.status(Legal), Some(TaskState::Done));
        let mut write_failures = 0;
        while let Ok(event) = rx.try_recv() {
            if let CouncilEvent::CacheWriteFailed { task, key, .. } = event {
                assert_eq!(task, Legal);
                assert_eq!(key.len(), 64);
                write_failures += 1;
            }
        }
        assert_eq!(write_failures, 1);
    }

    #[tokio::test]
    async fn test_run_state_events() {
        let (events, mut rx) = EventSink::channel();
        let executor = Executor::new(ScriptedGeneration::canned(), StaticRetrieval::new(&[]))
            .with_events(events);

        let plan = Plan::new(vec![Legal], "", PlanOrigin::Model).unwrap();
        executor.execute(&plan, "q").await.unwrap();

        let mut run_states = Vec::new();
        let mut task_states = Vec::new();
        while let Ok(event) = rx.try_recv() {
            match event {
                CouncilEvent::RunStateChanged { state, .. } => run_states.push(state),
                CouncilEvent::TaskStatusChanged { status, .. } => task_states.push(status),
                _ => {}
            }
        }
        assert_eq!(
            run_states,
            vec![RunState::Building, RunState::Executing, RunState::Complete]
        );
        assert_eq!(task_states, vec![TaskState::Running, TaskState::Done]);
    }
}
