//! # Council
//!
//! Contract analysis orchestration - a council of domain analysts.
//!
//! A query is turned into a plan naming which analysts (legal, compliance,
//! finance, operations) should look at it and in what order. The executor
//! runs the plan, feeding each analyst the findings of the ones before it,
//! and writes every structured result through to a similarity cache. A batch
//! coordinator runs many queries side by side under a concurrency cap.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                         BATCH COORDINATOR                         │
//! │          semaphore-bounded pool, per-item timeout + abort         │
//! └────────────────────────────────┬─────────────────────────────────┘
//!                                  │ one pipeline per item
//!                                  ▼
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                           ORCHESTRATOR                            │
//! │  ┌──────────────┐        ┌──────────────┐        ┌─────────────┐ │
//! │  │ PlanGenerator│──plan─▶│   Executor   │──put──▶│ ResultCache │ │
//! │  └──────────────┘        └──────┬───────┘        └─────────────┘ │
//! └─────────────────────────────────┼────────────────────────────────┘
//!                                   │ stages of the task graph
//!          ┌──────────────┬─────────┴────┬──────────────┐
//!          ▼              ▼              ▼              ▼
//!     ┌─────────┐   ┌────────────┐  ┌─────────┐   ┌────────────┐
//!     │  Legal  │   │ Compliance │  │ Finance │   │ Operations │
//!     └─────────┘   └────────────┘  └─────────┘   └────────────┘
//! ```
//!
//! ## Key Concepts
//!
//! - **Plan**: Ordered, duplicate-free selection of analysts for one query
//! - **Task**: A domain analyst; one retrieval plus one generation call
//! - **Accumulated context**: Append-only log of earlier findings
//! - **Structured record**: Schema-tagged extraction result (success, degraded or error)
//!
//! External capabilities (text generation, retrieval, vector index) are
//! supplied by the host through the traits in [`services`].

pub mod batch;
pub mod cache;
pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod executor;
pub mod extractor;
pub mod graph;
pub mod index;
pub mod orchestrator;
pub mod planner;
pub mod services;
pub mod task;
pub mod types;

#[cfg(test)]
mod test_support;

pub use batch::{BatchCoordinator, BatchItem, BatchReport, ItemOutcome, ItemStatus};
pub use cache::{PutOutcome, ResultCache, SimilarRecord};
pub use config::{CouncilConfig, ExecutionMode};
pub use context::{AccumulatedContext, ContextEntry, SharedState, TaskOutcome};
pub use error::CouncilError;
pub use events::{CouncilEvent, EventSink};
pub use executor::Executor;
pub use extractor::{RecordStatus, SchemaId, StructuredExtractor, StructuredRecord};
pub use graph::{TaskGraph, TaskSpec};
pub use index::InMemoryIndex;
pub use orchestrator::{Analysis, Orchestrator};
pub use planner::{Plan, PlanGenerator, PlanOrigin};
pub use services::{
    EmbeddingIndex, ResponseSchema, RetrievalService, ServiceError, TextGenerationService,
};
pub use task::{AnalysisTask, DomainTask, TaskRegistry};
pub use types::{ItemId, JobId, RunId, RunState, TaskName, TaskState};
