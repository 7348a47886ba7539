//! Schema-constrained structured extraction
//!
//! One generation attempt per call. A response that parses into a JSON object
//! carrying every required key becomes a `success` record; anything else is
//! kept verbatim as a `degraded` record, and collaborator failures become
//! `error` records. Nothing here retries and nothing here returns `Err`.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::services::{ResponseSchema, ServiceError, ServiceErrorKind, TextGenerationService};

const EMPTY_RESPONSE_PLACEHOLDER: &str = "<empty response>";

/// Fixed extraction schemas
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SchemaId {
    ClauseExtraction,
    ComplianceRisk,
    FinancialRisk,
    OperationalReview,
    /// Free-text analysis produced by a plain generation call
    Narrative,
}

impl SchemaId {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ClauseExtraction => "clause-extraction",
            Self::ComplianceRisk => "compliance-risk",
            Self::FinancialRisk => "financial-risk",
            Self::OperationalReview => "operational-review",
            Self::Narrative => "narrative",
        }
    }

    pub fn required_keys(&self) -> &'static [&'static str] {
        match self {
            Self::ClauseExtraction => &[
                "legal_clauses",
                "termination_clauses",
                "liability_caps",
                "ip_clauses",
                "sla_terms",
                "payment_terms",
                "data_protection",
            ],
            Self::ComplianceRisk => &[
                "regulations_violated",
                "missing_clauses",
                "overall_compliance_score",
                "priority_actions",
            ],
            Self::FinancialRisk => &[
                "payment_obligations",
                "penalties",
                "financial_risks",
                "total_exposure_estimate",
                "mitigation_needed",
            ],
            Self::OperationalReview => &[
                "sla_requirements",
                "operational_constraints",
                "feasibility",
                "recommendations",
            ],
            Self::Narrative => &["analysis"],
        }
    }

    pub fn response_schema(&self) -> ResponseSchema {
        ResponseSchema {
            name: self.as_str().to_string(),
            required_keys: self.required_keys().iter().map(|k| k.to_string()).collect(),
        }
    }

    fn role(&self) -> &'static str {
        match self {
            Self::ClauseExtraction => "Clause Extraction AI. Extract all important clauses across legal, compliance, financial, and operational domains",
            Self::ComplianceRisk => "Compliance Extraction AI. Extract structured compliance risk data from contracts",
            Self::FinancialRisk => "Financial Extraction AI. Extract structured financial risk data from contracts",
            Self::OperationalReview => "Operations Extraction AI. Extract structured operational feasibility data from contracts",
            Self::Narrative => "Contract Analyst AI",
        }
    }

    fn shape(&self) -> &'static str {
        match self {
            Self::ClauseExtraction => r#"{
  "legal_clauses": [{"type": "Indemnification", "summary": "...", "location": "Section 8.1"}],
  "termination_clauses": [{"condition": "Breach", "notice_period": "30 days", "penalties": "None"}],
  "liability_caps": [{"type": "General Liability", "limit": "$1,000,000", "exclusions": ["Gross negligence"]}],
  "ip_clauses": [{"type": "IP Ownership", "owner": "Client", "exceptions": []}],
  "sla_terms": [{"metric": "Uptime", "target": "99.9%", "penalty": "..."}],
  "payment_terms": [{"schedule": "Net 30", "method": "Wire transfer", "late_fee": "1.5% per month"}],
  "data_protection": [{"requirement": "GDPR compliant", "measures": ["Encryption"]}]
}"#,
            Self::ComplianceRisk => r#"{
  "regulations_violated": [{"regulation": "GDPR Article 32", "description": "...", "severity": "High"}],
  "missing_clauses": [{"clause_type": "Data Protection", "requirement": "...", "impact": "Medium"}],
  "overall_compliance_score": 75,
  "priority_actions": [{"action": "...", "urgency": "High", "timeline": "Immediate"}]
}"#,
            Self::FinancialRisk => r#"{
  "payment_obligations": [{"type": "Monthly Fee", "amount": "$10,000", "frequency": "Monthly", "due_date": "1st of month"}],
  "penalties": [{"trigger": "Late delivery", "amount": "$500 per day", "maximum": "$50,000"}],
  "financial_risks": [{"risk": "Uncapped liability", "exposure": "Unlimited", "probability": "Medium"}],
  "total_exposure_estimate": "$500,000",
  "mitigation_needed": true
}"#,
            Self::OperationalReview => r#"{
  "sla_requirements": [{"metric": "Uptime", "target": "99.9%", "measurement": "Monthly"}],
  "operational_constraints": [{"constraint": "...", "impact": "Medium"}],
  "feasibility": {"assessment": "Feasible", "confidence": "Medium"},
  "recommendations": ["..."]
}"#,
            Self::Narrative => r#"{"analysis": "..."}"#,
        }
    }

    /// Extraction prompt for this schema
    pub fn prompt(&self, context: &str, query: &str) -> String {
        format!(
            "You are a {role}.\n\nCONTRACT CONTEXT:\n{context}\n\nQUERY: {query}\n\n\
             Return ONLY a valid JSON object with this structure:\n{shape}\n\n\
             Return ONLY the JSON object, no additional text.\n\nJSON:",
            role = self.role(),
            shape = self.shape(),
        )
    }
}

impl fmt::Display for SchemaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome discriminant of a [`StructuredRecord`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Success,
    Degraded,
    Error,
}

/// Schema-validated or degraded extraction result
///
/// Success records carry fields conforming to their schema. Degraded and error
/// records carry an empty field map and a non-empty `raw_text`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawRecord")]
pub struct StructuredRecord {
    status: RecordStatus,
    schema_id: SchemaId,
    fields: Map<String, Value>,
    raw_text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error_kind: Option<ServiceErrorKind>,
}

/// Wire form of a record before its invariants are checked
#[derive(Deserialize)]
struct RawRecord {
    status: RecordStatus,
    schema_id: SchemaId,
    #[serde(default)]
    fields: Map<String, Value>,
    #[serde(default)]
    raw_text: String,
    #[serde(default)]
    error_kind: Option<ServiceErrorKind>,
}

impl TryFrom<RawRecord> for StructuredRecord {
    type Error = String;

    fn try_from(raw: RawRecord) -> Result<Self, Self::Error> {
        let schema_id = raw.schema_id;
        match raw.status {
            RecordStatus::Success => {
                if !conforms(schema_id, &raw.fields) {
                    return Err(format!("{schema_id} success record is missing required keys"));
                }
                if raw.error_kind.is_some() {
                    return Err(format!("{schema_id} success record carries an error kind"));
                }
            }
            RecordStatus::Degraded | RecordStatus::Error => {
                if raw.raw_text.trim().is_empty() {
                    return Err(format!("{schema_id} {:?} record has empty raw text", raw.status));
                }
                if !raw.fields.is_empty() {
                    return Err(format!("{schema_id} {:?} record carries fields", raw.status));
                }
                if (raw.status == RecordStatus::Error) != raw.error_kind.is_some() {
                    return Err(format!("{schema_id} record status and error kind disagree"));
                }
            }
        }

        Ok(Self {
            status: raw.status,
            schema_id,
            fields: raw.fields,
            raw_text: raw.raw_text,
            error_kind: raw.error_kind,
        })
    }
}

impl StructuredRecord {
    /// Build a success record, or `None` when `fields` misses a required key
    pub fn success(
        schema_id: SchemaId,
        fields: Map<String, Value>,
        raw_text: impl Into<String>,
    ) -> Option<Self> {
        if !conforms(schema_id, &fields) {
            return None;
        }
        Some(Self {
            status: RecordStatus::Success,
            schema_id,
            fields,
            raw_text: raw_text.into(),
            error_kind: None,
        })
    }

    /// Wrap free text from a plain generation call
    pub fn narrative(text: impl Into<String>) -> Self {
        let text = text.into();
        let mut fields = Map::new();
        fields.insert("analysis".to_string(), Value::String(text.clone()));
        Self {
            status: RecordStatus::Success,
            schema_id: SchemaId::Narrative,
            fields,
            raw_text: text,
            error_kind: None,
        }
    }

    pub fn degraded(schema_id: SchemaId, raw_text: impl Into<String>) -> Self {
        Self {
            status: RecordStatus::Degraded,
            schema_id,
            fields: Map::new(),
            raw_text: non_empty(raw_text.into()),
            error_kind: None,
        }
    }

    pub fn error(schema_id: SchemaId, error: &ServiceError) -> Self {
        Self {
            status: RecordStatus::Error,
            schema_id,
            fields: Map::new(),
            raw_text: non_empty(format!("{schema_id} extraction failed: {error}")),
            error_kind: Some(error.kind()),
        }
    }

    pub fn status(&self) -> RecordStatus {
        self.status
    }

    pub fn schema_id(&self) -> SchemaId {
        self.schema_id
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    pub fn raw_text(&self) -> &str {
        &self.raw_text
    }

    pub fn error_kind(&self) -> Option<ServiceErrorKind> {
        self.error_kind
    }

    pub fn is_success(&self) -> bool {
        self.status == RecordStatus::Success
    }

    /// Compact text used for context and cache previews
    pub fn summary(&self, max_chars: usize) -> String {
        let text = match (self.status, self.schema_id) {
            (RecordStatus::Success, SchemaId::Narrative) => self.raw_text.clone(),
            (RecordStatus::Success, _) => {
                serde_json::to_string(&self.fields).unwrap_or_else(|_| self.raw_text.clone())
            }
            _ => self.raw_text.clone(),
        };
        truncate_chars(text.trim(), max_chars)
    }
}

fn non_empty(text: String) -> String {
    if text.trim().is_empty() {
        EMPTY_RESPONSE_PLACEHOLDER.to_string()
    } else {
        text
    }
}

fn conforms(schema_id: SchemaId, fields: &Map<String, Value>) -> bool {
    schema_id
        .required_keys()
        .iter()
        .all(|key| fields.contains_key(*key))
}

pub(crate) fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

/// Strip markdown fences and surrounding prose, then parse the first JSON value
pub(crate) fn parse_json_response(text: &str) -> Option<Value> {
    let mut cleaned = text.trim();

    if let Some(rest) = cleaned.strip_prefix("```") {
        let body = rest.split("```").next().unwrap_or(rest);
        cleaned = body.strip_prefix("json").unwrap_or(body).trim();
    }

    if let Ok(value) = serde_json::from_str::<Value>(cleaned) {
        return Some(value);
    }

    let start = cleaned.find('{')?;
    let end = cleaned.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str::<Value>(&cleaned[start..=end]).ok()
}

/// Single-attempt extractor over a text generation collaborator
#[derive(Clone)]
pub struct StructuredExtractor {
    generation: Arc<dyn TextGenerationService>,
}

impl StructuredExtractor {
    pub fn new(generation: Arc<dyn TextGenerationService>) -> Self {
        Self { generation }
    }

    pub async fn extract(&self, schema_id: SchemaId, context: &str, query: &str) -> StructuredRecord {
        let prompt = schema_id.prompt(context, query);
        let schema = schema_id.response_schema();

        let response = match self.generation.generate(&prompt, Some(&schema)).await {
            Ok(text) => text,
            Err(e) => {
                warn!(schema = %schema_id, error = %e, "Extraction call failed");
                return StructuredRecord::error(schema_id, &e);
            }
        };

        Self::interpret(schema_id, response)
    }

    /// Classify a raw generation response against a schema
    pub fn interpret(schema_id: SchemaId, response: String) -> StructuredRecord {
        match parse_json_response(&response) {
            Some(Value::Object(fields)) => {
                let missing: Vec<&str> = schema_id
                    .required_keys()
                    .iter()
                    .copied()
                    .filter(|k| !fields.contains_key(*k))
                    .collect();
                if missing.is_empty() {
                    debug!(schema = %schema_id, "Extraction succeeded");
                    StructuredRecord::success(schema_id, fields, response.clone())
                        .unwrap_or_else(|| StructuredRecord::degraded(schema_id, response))
                } else {
                    warn!(schema = %schema_id, missing = ?missing, "Extraction missing required keys");
                    StructuredRecord::degraded(schema_id, response)
                }
            }
            Some(_) => {
                warn!(schema = %schema_id, "Extraction returned non-object JSON");
                StructuredRecord::degraded(schema_id, response)
            }
            None => {
                warn!(schema = %schema_id, "Extraction response is not valid JSON");
                StructuredRecord::degraded(schema_id, response)
            }
        }
    }
}
