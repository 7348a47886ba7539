//! Plan generation with deterministic fallback

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::config::PlannerConfig;
use crate::error::CouncilError;
use crate::events::{CouncilEvent, EventSink};
use crate::extractor::parse_json_response;
use crate::graph::TaskSpec;
use crate::services::TextGenerationService;
use crate::task::{AnalysisTask, DomainTask};
use crate::types::TaskName;

const KEYWORDS: [(TaskName, &[&str]); 4] = [
    (
        TaskName::Legal,
        &[
            "legal", "liability", "indemnity", "termination", "jurisdiction", "contract",
            "enforce", "clause", "breach",
        ],
    ),
    (
        TaskName::Compliance,
        &[
            "compliance", "regulatory", "gdpr", "iso", "audit", "policy", "regulation",
            "data protection", "privacy",
        ],
    ),
    (
        TaskName::Finance,
        &[
            "payment", "financial", "price", "cost", "penalty", "tax", "invoice", "fee",
            "money", "dollar",
        ],
    ),
    (
        TaskName::Operations,
        &[
            "sla", "service level", "uptime", "delivery", "support", "performance",
            "operational", "maintenance",
        ],
    ),
];

/// Why the rule-based path produced the plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum FallbackReason {
    /// The planning collaborator failed or timed out
    Unavailable(String),
    /// The response was not a JSON plan
    Malformed(String),
    /// The JSON plan violated the plan invariants
    Invalid(String),
}

/// Where a plan came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "origin", rename_all = "snake_case")]
pub enum PlanOrigin {
    Model,
    Rules { reason: FallbackReason },
}

/// Ordered, duplicate-free selection of tasks for a query
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    tasks: Vec<TaskName>,
    pub rationale: String,
    pub origin: PlanOrigin,
}

impl Plan {
    /// Validating constructor: non-empty and duplicate-free
    pub fn new(
        tasks: Vec<TaskName>,
        rationale: impl Into<String>,
        origin: PlanOrigin,
    ) -> Result<Self, CouncilError> {
        if tasks.is_empty() {
            return Err(CouncilError::Validation("plan has no tasks".into()));
        }
        let mut seen = HashSet::new();
        if let Some(dup) = tasks.iter().find(|t| !seen.insert(**t)) {
            return Err(CouncilError::Validation(format!("plan lists {dup} twice")));
        }
        Ok(Self {
            tasks,
            rationale: rationale.into(),
            origin,
        })
    }

    /// Every domain in canonical order
    pub fn canonical(rationale: impl Into<String>, origin: PlanOrigin) -> Self {
        Self {
            tasks: TaskName::CANONICAL.to_vec(),
            rationale: rationale.into(),
            origin,
        }
    }

    pub fn tasks(&self) -> &[TaskName] {
        &self.tasks
    }

    pub fn is_rule_derived(&self) -> bool {
        matches!(self.origin, PlanOrigin::Rules { .. })
    }

    /// Default dependencies: a linear chain in plan order
    pub fn task_specs(&self) -> Vec<TaskSpec> {
        TaskSpec::chain(&self.tasks)
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let order: Vec<&str> = self.tasks.iter().map(|t| t.as_str()).collect();
        writeln!(f, "ANALYSIS PLAN")?;
        writeln!(f, "Execution order: {}", order.join(" -> "))?;
        let source = match &self.origin {
            PlanOrigin::Model => "model",
            PlanOrigin::Rules { .. } => "rules",
        };
        writeln!(f, "Source: {source}")?;
        if !self.rationale.is_empty() {
            writeln!(f, "Reasoning: {}", self.rationale)?;
        }
        writeln!(f, "Roles:")?;
        for task in &self.tasks {
            writeln!(f, "  - {task}: {}", DomainTask::default_for(*task).role())?;
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct RawPlan {
    agents: Vec<String>,
    execution_order: Vec<String>,
    #[serde(default)]
    reasoning: Option<String>,
}

fn parse_names(names: &[String], field: &str) -> Result<Vec<TaskName>, String> {
    let mut parsed = Vec::with_capacity(names.len());
    for name in names {
        let task = name
            .parse::<TaskName>()
            .map_err(|_| format!("{field} contains unknown task {name:?}"))?;
        if parsed.contains(&task) {
            return Err(format!("{field} lists {task} twice"));
        }
        parsed.push(task);
    }
    if parsed.is_empty() {
        return Err(format!("{field} is empty"));
    }
    Ok(parsed)
}

fn validate(raw: RawPlan) -> Result<Plan, String> {
    let agents = parse_names(&raw.agents, "agents")?;
    let order = parse_names(&raw.execution_order, "execution_order")?;

    let agent_set: HashSet<TaskName> = agents.iter().copied().collect();
    let order_set: HashSet<TaskName> = order.iter().copied().collect();
    if agent_set != order_set {
        return Err("execution_order is not a permutation of agents".into());
    }

    Plan::new(order, raw.reasoning.unwrap_or_default(), PlanOrigin::Model).map_err(|e| e.to_string())
}

/// Keyword matcher used when the model plan is unusable.
/// Matches come out in canonical order; no match selects every domain.
pub fn fallback_plan(query: &str, reason: FallbackReason) -> Plan {
    let lower = query.to_lowercase();
    let selected: Vec<TaskName> = KEYWORDS
        .iter()
        .filter(|(_, words)| words.iter().any(|w| lower.contains(w)))
        .map(|(task, _)| *task)
        .collect();

    if selected.is_empty() {
        return Plan::canonical(
            "Keyword-based selection: no domain keywords found, running every analyst",
            PlanOrigin::Rules { reason },
        );
    }

    Plan {
        rationale: format!(
            "Keyword-based selection: detected {} relevant analysts",
            selected.len()
        ),
        tasks: selected,
        origin: PlanOrigin::Rules { reason },
    }
}

fn planner_prompt(query: &str) -> String {
    let mut catalog = String::new();
    for task in TaskName::CANONICAL {
        catalog.push_str(&format!(
            "- {}: {}\n",
            task,
            DomainTask::default_for(task).role()
        ));
    }
    format!(
        "You are a planning AI that decides which analysts should examine a contract query.\n\n\
         AVAILABLE ANALYSTS:\n{catalog}\nQUERY: {query}\n\n\
         Respond with ONLY a valid JSON object in this exact format:\n\
         {{\"agents\": [\"legal\", \"compliance\"], \"execution_order\": [\"legal\", \"compliance\"], \
         \"reasoning\": \"why these analysts\"}}\n\n\
         Rules:\n- Include only relevant analysts\n- execution_order must order exactly the listed agents\n\
         - Always return valid JSON\n\nJSON RESPONSE:"
    )
}

/// Produces one plan per query with a single model attempt
pub struct PlanGenerator {
    generation: Arc<dyn TextGenerationService>,
    config: PlannerConfig,
    events: EventSink,
}

impl PlanGenerator {
    pub fn new(generation: Arc<dyn TextGenerationService>) -> Self {
        Self {
            generation,
            config: PlannerConfig::default(),
            events: EventSink::disabled(),
        }
    }

    pub fn with_config(mut self, config: PlannerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    /// Never fails. Collaborator errors fall back to the canonical ordering;
    /// malformed or invalid responses fall back to keyword matching.
    #[instrument(skip(self))]
    pub async fn generate_plan(&self, query: &str) -> Plan {
        let plan = self.attempt(query).await;

        info!(
            tasks = ?plan.tasks(),
            rule_derived = plan.is_rule_derived(),
            "Generated plan"
        );
        self.events.emit(CouncilEvent::PlanGenerated {
            tasks: plan.tasks().to_vec(),
            rule_derived: plan.is_rule_derived(),
        });
        plan
    }

    async fn attempt(&self, query: &str) -> Plan {
        let prompt = planner_prompt(query);
        let call = self.generation.generate(&prompt, None);

        let response = match tokio::time::timeout(self.config.timeout(), call).await {
            Ok(Ok(text)) => text,
            Ok(Err(e)) => {
                warn!(error = %e, "Planner unavailable, using canonical ordering");
                return Plan::canonical(
                    "Planner unavailable: running every analyst in canonical order",
                    PlanOrigin::Rules {
                        reason: FallbackReason::Unavailable(e.to_string()),
                    },
                );
            }
            Err(_) => {
                warn!(timeout_secs = self.config.timeout_secs, "Planner timed out, using canonical ordering");
                return Plan::canonical(
                    "Planner timed out: running every analyst in canonical order",
                    PlanOrigin::Rules {
                        reason: FallbackReason::Unavailable("timeout".into()),
                    },
                );
            }
        };

        let Some(value) = parse_json_response(&response) else {
            warn!("Planner response is not JSON, using keyword fallback");
            return fallback_plan(query, FallbackReason::Malformed("response is not JSON".into()));
        };

        let raw: RawPlan = match serde_json::from_value(value) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(error = %e, "Planner response has wrong shape, using keyword fallback");
                return fallback_plan(query, FallbackReason::Malformed(e.to_string()));
            }
        };

        match validate(raw) {
            Ok(plan) => plan,
            Err(why) => {
                warn!(reason = %why, "Planner response invalid, using keyword fallback");
                fallback_plan(query, FallbackReason::Invalid(why))
            }
        }
    }
}
