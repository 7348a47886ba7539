//! Analysis tasks - the per-domain units of work

use std::collections::HashMap;
use std::sync::Arc;

use crate::extractor::SchemaId;
use crate::types::TaskName;

/// A domain-specific analysis unit
///
/// Tasks only describe *what* to ask. The executor performs the retrieval and
/// generation calls and owns every piece of shared state.
pub trait AnalysisTask: Send + Sync {
    fn name(&self) -> TaskName;

    /// One-line description of the analyst role
    fn role(&self) -> &str;

    /// Extraction schema, or `None` for a plain generation call
    fn schema(&self) -> Option<SchemaId>;

    /// Query sent to the retrieval collaborator
    fn retrieval_query(&self, query: &str) -> String {
        query.to_string()
    }

    /// Combine retrieved text with the findings of earlier tasks
    fn frame_context(&self, retrieved: &str, prior_findings: &str) -> String {
        if prior_findings.is_empty() {
            retrieved.to_string()
        } else {
            format!("{retrieved}\n\nPrevious findings:\n{prior_findings}")
        }
    }

    /// Prompt for the plain generation path
    fn prompt(&self, context: &str, query: &str) -> String;
}

/// Built-in analyst for one of the fixed domains
#[derive(Debug, Clone)]
pub struct DomainTask {
    name: TaskName,
    schema: Option<SchemaId>,
}

impl DomainTask {
    /// Analyst using the domain's extraction schema
    pub fn structured(name: TaskName) -> Self {
        Self {
            name,
            schema: Some(Self::domain_schema(name)),
        }
    }

    /// Analyst producing free text
    pub fn narrative(name: TaskName) -> Self {
        Self { name, schema: None }
    }

    /// Default flavour per domain: operations reviews are free text
    pub fn default_for(name: TaskName) -> Self {
        match name {
            TaskName::Operations => Self::narrative(name),
            _ => Self::structured(name),
        }
    }

    fn domain_schema(name: TaskName) -> SchemaId {
        match name {
            TaskName::Legal => SchemaId::ClauseExtraction,
            TaskName::Compliance => SchemaId::ComplianceRisk,
            TaskName::Finance => SchemaId::FinancialRisk,
            TaskName::Operations => SchemaId::OperationalReview,
        }
    }

    fn focus(&self) -> (&'static str, &'static str) {
        match self.name {
            TaskName::Legal => (
                "- Liability clauses and limitations\n- Indemnification terms\n- Termination conditions and rights\n- Jurisdiction and governing law\n- Legal enforceability concerns\n- Force majeure provisions",
                "1. Key Legal Findings\n2. Liability Assessment\n3. Risk Level (Low/Medium/High)\n4. Recommendations",
            ),
            TaskName::Compliance => (
                "- Regulatory compliance (GDPR, ISO, industry standards)\n- Audit requirements and controls\n- Policy adherence\n- Data protection and privacy\n- Certification requirements",
                "1. Compliance Status\n2. Regulatory Violations/Gaps\n3. Missing Required Clauses\n4. Compliance Score (0-100)\n5. Priority Actions",
            ),
            TaskName::Finance => (
                "- Payment terms and schedules\n- Pricing structures and adjustments\n- Penalties and liquidated damages\n- Tax implications\n- Invoice and billing procedures",
                "1. Payment Obligations\n2. Financial Penalties\n3. Exposure Estimate\n4. Mitigation Recommendations",
            ),
            TaskName::Operations => (
                "- Service Level Agreements (SLAs)\n- Uptime and availability requirements\n- Delivery schedules and milestones\n- Support and maintenance obligations\n- Performance metrics and KPIs",
                "1. SLA Requirements\n2. Operational Constraints\n3. Feasibility Assessment\n4. Resource Implications\n5. Execution Recommendations",
            ),
        }
    }
}

impl AnalysisTask for DomainTask {
    fn name(&self) -> TaskName {
        self.name
    }

    fn role(&self) -> &str {
        match self.name {
            TaskName::Legal => "Analyzes legal enforceability, liability, and jurisdiction",
            TaskName::Compliance => "Ensures regulatory compliance (GDPR, ISO, etc.)",
            TaskName::Finance => "Identifies financial exposure and payment obligations",
            TaskName::Operations => "Validates operational feasibility and SLAs",
        }
    }

    fn schema(&self) -> Option<SchemaId> {
        self.schema
    }

    fn prompt(&self, context: &str, query: &str) -> String {
        let (focus, structure) = self.focus();
        let title = match self.name {
            TaskName::Legal => "Legal",
            TaskName::Compliance => "Compliance",
            TaskName::Finance => "Financial",
            TaskName::Operations => "Operations",
        };
        format!(
            "You are a {title} Analyst AI specializing in contract analysis.\n\n\
             ROLE: {role}.\n\nCONTRACT CONTEXT:\n{context}\n\n\
             TASK: Analyze the contract focusing on:\n{focus}\n\n\
             QUESTION: {query}\n\nStructure your response as:\n{structure}\n\nANALYSIS:",
            role = self.role(),
        )
    }
}

/// Lookup table from task name to its implementation
#[derive(Clone)]
pub struct TaskRegistry {
    tasks: HashMap<TaskName, Arc<dyn AnalysisTask>>,
}

impl TaskRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self {
            tasks: HashMap::new(),
        }
    }

    /// Registry holding the built-in analyst for every domain
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        for name in TaskName::CANONICAL {
            registry.register(Arc::new(DomainTask::default_for(name)));
        }
        registry
    }

    /// Register a task, replacing any previous one with the same name
    pub fn register(&mut self, task: Arc<dyn AnalysisTask>) -> Option<Arc<dyn AnalysisTask>> {
        self.tasks.insert(task.name(), task)
    }

    pub fn get(&self, name: TaskName) -> Option<Arc<dyn AnalysisTask>> {
        self.tasks.get(&name).cloned()
    }

    pub fn contains(&self, name: TaskName) -> bool {
        self.tasks.contains_key(&name)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_registry() {
        let registry = TaskRegistry::with_defaults();
        assert_eq!(registry.len(), 4);

        let finance = registry.get(TaskName::Finance).unwrap();
        assert_eq!(finance.schema(), Some(SchemaId::FinancialRisk));

        let operations = registry.get(TaskName::Operations).unwrap();
        assert_eq!(operations.schema(), None);
    }

    #[test]
    fn test_register_replaces() {
        let mut registry = TaskRegistry::new();
        assert!(registry.is_empty());

        assert!(registry
            .register(Arc::new(DomainTask::narrative(TaskName::Legal)))
            .is_none());
        let previous = registry.register(Arc::new(DomainTask::structured(TaskName::Legal)));

        assert!(previous.is_some());
        assert_eq!(registry.len(), 1);
        assert_eq!(
            registry.get(TaskName::Legal).unwrap().schema(),
            Some(SchemaId::ClauseExtraction)
        );
        assert!(!registry.contains(TaskName::Finance));
    }

    #[test]
    fn test_frame_context() {
        let task = DomainTask::default_for(TaskName::Finance);
        assert_eq!(task.frame_context("chunk", ""), "chunk");
        assert_eq!(
            task.frame_context("chunk", "legal: ok"),
            "chunk\n\nPrevious findings:\nlegal: ok"
        );
    }

    #[test]
    fn test_prompt_mentions_role_and_question() {
        let task = DomainTask::narrative(TaskName::Operations);
        let prompt = task.prompt("99.9% uptime", "What are the SLA terms?");
        assert!(prompt.contains("Operations Analyst"));
        assert!(prompt.contains("99.9% uptime"));
        assert!(prompt.contains("What are the SLA terms?"));
    }
}
