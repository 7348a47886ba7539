//! Main orchestrator - plans a query, then runs the plan

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, instrument};

use crate::cache::{ResultCache, SimilarRecord};
use crate::config::CouncilConfig;
use crate::context::SharedState;
use crate::error::CouncilError;
use crate::events::{CouncilEvent, EventSink};
use crate::executor::Executor;
use crate::extractor::SchemaId;
use crate::graph::TaskSpec;
use crate::planner::{Plan, PlanGenerator};
use crate::services::{RetrievalService, TextGenerationService};
use crate::task::TaskRegistry;

/// A plan together with the run it produced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Analysis {
    pub plan: Plan,
    pub state: SharedState,
}

/// The council orchestrator
///
/// Owns one planner and one executor. Cheap to share behind an `Arc`; every
/// call to [`Orchestrator::analyze`] gets its own run state.
pub struct Orchestrator {
    planner: PlanGenerator,
    executor: Executor,
    cache: Option<Arc<ResultCache>>,
}

impl Orchestrator {
    pub fn new(
        generation: Arc<dyn TextGenerationService>,
        retrieval: Arc<dyn RetrievalService>,
        config: &CouncilConfig,
    ) -> Self {
        let planner = PlanGenerator::new(Arc::clone(&generation)).with_config(config.planner.clone());
        let executor = Executor::new(generation, retrieval).with_config(config.executor.clone());
        Self {
            planner,
            executor,
            cache: None,
        }
    }

    /// Create an orchestrator and return the receiving end of its events
    pub fn with_channel(
        generation: Arc<dyn TextGenerationService>,
        retrieval: Arc<dyn RetrievalService>,
        config: &CouncilConfig,
    ) -> (Self, mpsc::UnboundedReceiver<CouncilEvent>) {
        let (events, rx) = EventSink::channel();
        (Self::new(generation, retrieval, config).with_events(events), rx)
    }

    pub fn with_cache(mut self, cache: Arc<ResultCache>) -> Self {
        self.executor = self.executor.with_cache(Arc::clone(&cache));
        self.cache = Some(cache);
        self
    }

    pub fn with_registry(mut self, registry: TaskRegistry) -> Self {
        self.executor = self.executor.with_registry(registry);
        self
    }

    pub fn with_events(mut self, events: EventSink) -> Self {
        self.planner = self.planner.with_events(events.clone());
        self.executor = self.executor.with_events(events);
        self
    }

    pub fn cache(&self) -> Option<&Arc<ResultCache>> {
        self.cache.as_ref()
    }

    /// Plan the query, then execute the plan as a linear chain
    #[instrument(skip(self))]
    pub async fn analyze(&self, query: &str) -> Result<Analysis, CouncilError> {
        let plan = self.planner.generate_plan(query).await;
        let state = self.executor.execute(&plan, query).await?;

        info!(
            run_id = %state.run_id,
            tasks = plan.tasks().len(),
            failed = state.failed_tasks().len(),
            "Analysis finished"
        );
        Ok(Analysis { plan, state })
    }

    /// Execute caller-supplied dependencies, bypassing the planner
    pub async fn analyze_with(
        &self,
        plan: Plan,
        specs: &[TaskSpec],
        query: &str,
    ) -> Result<Analysis, CouncilError> {
        let state = self.executor.execute_specs(specs, query).await?;
        Ok(Analysis { plan, state })
    }

    /// Earlier cached findings resembling `query`, empty without a cache
    pub async fn similar(&self, query: &str, schema_id: SchemaId) -> Vec<SimilarRecord> {
        match &self.cache {
            Some(cache) => cache.get_similar_default(query, schema_id).await,
            None => Vec::new(),
        }
    }
}
