//! Scripted collaborators shared by the unit tests

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};

use crate::services::{
    EmbeddingIndex, IndexFilter, IndexMatch, ResponseSchema, RetrievalService, ServiceError,
    TextGenerationService,
};

type Script = dyn Fn(&str, Option<&ResponseSchema>) -> Result<String, ServiceError> + Send + Sync;
type DelayScript = dyn Fn(&str, Option<&ResponseSchema>) -> Option<Duration> + Send + Sync;

#[derive(Debug, Clone)]
pub(crate) struct RecordedCall {
    pub prompt: String,
    pub schema: Option<String>,
}

/// Generation fake driven by a closure, with optional per-call delay
pub(crate) struct ScriptedGeneration {
    script: Box<Script>,
    delay: Option<Box<DelayScript>>,
    calls: Mutex<Vec<RecordedCall>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedGeneration {
    pub fn new<F>(script: F) -> Arc<Self>
    where
        F: Fn(&str, Option<&ResponseSchema>) -> Result<String, ServiceError> + Send + Sync + 'static,
    {
        Arc::new(Self {
            script: Box::new(script),
            delay: None,
            calls: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        })
    }

    pub fn with_delay<F, D>(script: F, delay: D) -> Arc<Self>
    where
        F: Fn(&str, Option<&ResponseSchema>) -> Result<String, ServiceError> + Send + Sync + 'static,
        D: Fn(&str, Option<&ResponseSchema>) -> Option<Duration> + Send + Sync + 'static,
    {
        Arc::new(Self {
            script: Box::new(script),
            delay: Some(Box::new(delay)),
            calls: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        })
    }

    /// Answers every request with a well-formed response
    pub fn canned() -> Arc<Self> {
        Self::new(canned_response)
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    /// Highest number of simultaneously running generate calls
    pub fn peak_in_flight(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TextGenerationService for ScriptedGeneration {
    async fn generate(
        &self,
        prompt: &str,
        response_schema: Option<&ResponseSchema>,
    ) -> Result<String, ServiceError> {
        self.calls.lock().push(RecordedCall {
            prompt: prompt.to_string(),
            schema: response_schema.map(|s| s.name.clone()),
        });

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        if let Some(delay) = self.delay.as_ref().and_then(|d| d(prompt, response_schema)) {
            tokio::time::sleep(delay).await;
        }
        let result = (self.script)(prompt, response_schema);

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

/// Well-formed output for extraction, planning and plain analysis prompts
pub(crate) fn canned_response(
    prompt: &str,
    schema: Option<&ResponseSchema>,
) -> Result<String, ServiceError> {
    if let Some(schema) = schema {
        let fields: Map<String, Value> = schema
            .required_keys
            .iter()
            .map(|k| (k.clone(), json!([])))
            .collect();
        return Ok(Value::Object(fields).to_string());
    }
    if is_plan_prompt(prompt) {
        return Ok(json!({
            "agents": ["LegalAgent", "ComplianceAgent", "FinanceAgent", "OperationsAgent"],
            "execution_order": ["LegalAgent", "ComplianceAgent", "FinanceAgent", "OperationsAgent"],
            "reasoning": "Full review requested"
        })
        .to_string());
    }
    Ok("Plain analysis: no blocking issues found.".to_string())
}

pub(crate) fn is_plan_prompt(prompt: &str) -> bool {
    prompt.contains("\"execution_order\"")
}

pub(crate) fn schema_name(schema: Option<&ResponseSchema>) -> Option<&str> {
    schema.map(|s| s.name.as_str())
}

/// Retrieval fake returning fixed chunks
pub(crate) struct StaticRetrieval {
    chunks: Vec<String>,
    fail: bool,
    calls: AtomicUsize,
}

impl StaticRetrieval {
    pub fn new(chunks: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            chunks: chunks.iter().map(|c| c.to_string()).collect(),
            fail: false,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            chunks: Vec::new(),
            fail: true,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RetrievalService for StaticRetrieval {
    async fn retrieve(&self, _query: &str, top_k: usize) -> Result<Vec<String>, ServiceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(ServiceError::Service("retrieval offline".into()));
        }
        Ok(self.chunks.iter().take(top_k).cloned().collect())
    }
}

/// Index whose every operation fails
pub(crate) struct BrokenIndex;

#[async_trait]
impl EmbeddingIndex for BrokenIndex {
    async fn embed(&self, _text: &str) -> Result<Vec<f32>, ServiceError> {
        Err(ServiceError::Service("embedding backend down".into()))
    }

    async fn upsert(&self, _key: &str, _vector: Vec<f32>, _payload: Value) -> Result<(), ServiceError> {
        Err(ServiceError::Service("index down".into()))
    }

    async fn query(
        &self,
        _vector: &[f32],
        _top_k: usize,
        _filter: &IndexFilter,
    ) -> Result<Vec<IndexMatch>, ServiceError> {
        Err(ServiceError::Service("index down".into()))
    }
}

/// Index that embeds fine but never finishes a write
pub(crate) struct HangingIndex;

#[async_trait]
impl EmbeddingIndex for HangingIndex {
    async fn embed(&self, _text: &str) -> Result<Vec<f32>, ServiceError> {
        Ok(vec![1.0])
    }

    async fn upsert(&self, _key: &str, _vector: Vec<f32>, _payload: Value) -> Result<(), ServiceError> {
        std::future::pending().await
    }

    async fn query(
        &self,
        _vector: &[f32],
        _top_k: usize,
        _filter: &IndexFilter,
    ) -> Result<Vec<IndexMatch>, ServiceError> {
        Ok(Vec::new())
    }
}
